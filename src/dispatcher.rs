//! Per-descriptor event binding.
//!
//! An [`EventDispatcher`] ties one file descriptor to an interest set and a
//! handler. Dispatchers live in the poller's slab; components hold a
//! [`DispatcherId`] handle rather than a pointer, so stale references can
//! never dangle into the fd table.

use std::os::unix::io::RawFd;
use std::sync::Weak;

use crate::timestamp::Timestamp;

/// No interest.
pub(crate) const INTEREST_NONE: libc::c_short = 0;
/// Read interest: normal plus urgent data.
pub(crate) const INTEREST_READ: libc::c_short = libc::POLLIN | libc::POLLPRI;
/// Write interest.
pub(crate) const INTEREST_WRITE: libc::c_short = libc::POLLOUT;

/// Handle to a dispatcher registered with an event loop's poller.
///
/// Only valid on the owning loop's thread and only until the dispatcher is
/// removed; the poller asserts on misuse rather than silently ignoring it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherId(pub(crate) usize);

/// Readiness callbacks delivered by the event loop.
///
/// One trait with a default no-op per event replaces four function-pointer
/// fields. The loop upgrades the dispatcher's weak handler reference for
/// the duration of the dispatch, which guarantees the component outlives
/// its own event-processing frame even if it arranges for its teardown
/// from inside a callback.
pub trait EventHandler {
    /// The descriptor is readable. `receive_time` is when the loop observed
    /// the readiness batch.
    fn handle_read(&self, receive_time: Timestamp) {
        let _ = receive_time;
    }

    /// The descriptor is writable.
    fn handle_write(&self) {}

    /// The peer hung up with no data left to read.
    fn handle_close(&self) {}

    /// The descriptor reported an error or is invalid.
    fn handle_error(&self) {}
}

/// One fd's registration state inside the poller.
///
/// The dispatcher does not own its descriptor; whichever component created
/// the socket (listener, connector, connection) owns it and must disable
/// and remove the dispatcher before closing the fd.
pub(crate) struct EventDispatcher {
    pub(crate) fd: RawFd,
    pub(crate) interest: libc::c_short,
    pub(crate) revents: libc::c_short,
    /// Index into the poller's raw pollfd list, -1 until first registered.
    pub(crate) pollfd_index: i32,
    pub(crate) handler: Weak<dyn EventHandler>,
}

impl EventDispatcher {
    pub(crate) fn new(fd: RawFd, handler: Weak<dyn EventHandler>) -> Self {
        EventDispatcher {
            fd,
            interest: INTEREST_NONE,
            revents: 0,
            pollfd_index: -1,
            handler,
        }
    }

    /// Zero interest: kept in the table but skipped by the poll syscall.
    #[inline]
    pub(crate) fn is_ignored(&self) -> bool {
        self.interest == INTEREST_NONE
    }

    #[inline]
    pub(crate) fn is_writing(&self) -> bool {
        self.interest & INTEREST_WRITE != 0
    }
}
