//! Level-triggered poll(2) wrapper.
//!
//! Owns the dispatcher slab, the fd table, and the raw pollfd list. The
//! pollfd list and the fd table stay the same length at every observable
//! point, and each dispatcher's recorded index always names its pollfd
//! slot. Replaceable by an epoll backend without affecting the rest of the
//! design.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Weak;

use slab::Slab;
use tracing::trace;

use crate::dispatcher::{DispatcherId, EventDispatcher, EventHandler};
use crate::timestamp::Timestamp;

/// Encode an fd so poll(2) skips the entry while it stays in the list.
/// `-1` is reserved by poll itself, hence the `- 1` shift.
#[inline]
fn ignored_fd(fd: RawFd) -> RawFd {
    -fd - 1
}

/// Recover the real fd from a possibly-negated pollfd entry.
#[inline]
fn real_fd(raw: RawFd) -> RawFd {
    if raw < 0 {
        -(raw + 1)
    } else {
        raw
    }
}

pub(crate) struct Poller {
    pollfds: Vec<libc::pollfd>,
    dispatchers: Slab<EventDispatcher>,
    fd_table: HashMap<RawFd, DispatcherId>,
}

impl Poller {
    pub(crate) fn new() -> Self {
        Poller {
            pollfds: Vec::with_capacity(16),
            dispatchers: Slab::with_capacity(16),
            fd_table: HashMap::with_capacity(16),
        }
    }

    /// Insert a dispatcher into the slab. It joins the pollfd list and the
    /// fd table on its first interest update.
    pub(crate) fn register(&mut self, fd: RawFd, handler: Weak<dyn EventHandler>) -> DispatcherId {
        DispatcherId(self.dispatchers.insert(EventDispatcher::new(fd, handler)))
    }

    pub(crate) fn get_mut(&mut self, id: DispatcherId) -> Option<&mut EventDispatcher> {
        self.dispatchers.get_mut(id.0)
    }

    pub(crate) fn contains(&self, id: DispatcherId) -> bool {
        self.dispatchers.contains(id.0)
    }

    /// Number of entries in the raw interest list (== fd table size).
    pub(crate) fn registered_count(&self) -> usize {
        debug_assert_eq!(self.pollfds.len(), self.fd_table.len());
        self.pollfds.len()
    }

    pub(crate) fn contains_fd(&self, fd: RawFd) -> bool {
        self.fd_table.contains_key(&fd)
    }

    pub(crate) fn pollfd_index(&self, id: DispatcherId) -> i32 {
        self.dispatchers[id.0].pollfd_index
    }

    /// Sync a dispatcher's interest into the raw list.
    ///
    /// A fresh dispatcher (`pollfd_index < 0`) gets a new raw entry and an
    /// fd table slot; an existing one has its interest overwritten and any
    /// stale returned-bits cleared. Zero interest is encoded as a negated
    /// fd so the syscall skips the entry; removal stays a separate,
    /// explicit operation.
    pub(crate) fn update(&mut self, id: DispatcherId) {
        let d = self
            .dispatchers
            .get_mut(id.0)
            .expect("update of unregistered dispatcher");
        let encoded = if d.is_ignored() {
            ignored_fd(d.fd)
        } else {
            d.fd
        };
        if d.pollfd_index < 0 {
            self.pollfds.push(libc::pollfd {
                fd: encoded,
                events: d.interest,
                revents: 0,
            });
            d.pollfd_index = (self.pollfds.len() - 1) as i32;
            let prev = self.fd_table.insert(d.fd, id);
            assert!(prev.is_none(), "fd {} already in poller table", d.fd);
        } else {
            let pfd = &mut self.pollfds[d.pollfd_index as usize];
            pfd.fd = encoded;
            pfd.events = d.interest;
            pfd.revents = 0;
            d.revents = 0;
        }
        debug_assert_eq!(self.pollfds.len(), self.fd_table.len());
    }

    /// Remove a dispatcher: swap-remove its raw entry (fixing the moved
    /// entry's recorded index), erase its fd table slot, and free the slab
    /// entry. The dispatcher must be registered and fully disabled.
    pub(crate) fn remove(&mut self, id: DispatcherId) {
        let d = self
            .dispatchers
            .get(id.0)
            .expect("remove of unregistered dispatcher");
        assert!(d.is_ignored(), "dispatcher removed while still enabled");
        let index = d.pollfd_index;
        let fd = d.fd;
        if index >= 0 {
            let index = index as usize;
            let removed = self.fd_table.remove(&fd);
            debug_assert_eq!(removed, Some(id));
            self.pollfds.swap_remove(index);
            if index < self.pollfds.len() {
                let moved_fd = real_fd(self.pollfds[index].fd);
                let moved_id = self.fd_table[&moved_fd];
                self.dispatchers[moved_id.0].pollfd_index = index as i32;
            }
        }
        self.dispatchers.remove(id.0);
        debug_assert_eq!(self.pollfds.len(), self.fd_table.len());
    }

    /// Block in poll(2), then walk the raw list once, storing the returned
    /// bits on each active dispatcher and appending it to `active` in list
    /// order. Stops as soon as the kernel-reported active count is
    /// exhausted. Returns the instant the batch was observed.
    pub(crate) fn poll(
        &mut self,
        timeout_ms: i32,
        active: &mut Vec<(DispatcherId, libc::c_short)>,
    ) -> Timestamp {
        let n = unsafe {
            libc::poll(
                self.pollfds.as_mut_ptr(),
                self.pollfds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        let now = Timestamp::now();
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                panic!("poll failed: {err}");
            }
            return now;
        }
        if n == 0 {
            trace!("poll returned with no active descriptors");
            return now;
        }
        let mut remaining = n;
        for pfd in &self.pollfds {
            if remaining == 0 {
                break;
            }
            if pfd.revents == 0 {
                continue;
            }
            remaining -= 1;
            let id = self.fd_table[&real_fd(pfd.fd)];
            let d = &mut self.dispatchers[id.0];
            d.revents = pfd.revents;
            active.push((id, pfd.revents));
        }
        now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{INTEREST_READ, INTEREST_WRITE};
    use std::sync::Arc;

    struct Nop;
    impl EventHandler for Nop {}

    fn handler() -> Arc<dyn EventHandler> {
        Arc::new(Nop)
    }

    #[test]
    fn test_register_update_remove() {
        let h = handler();
        let mut poller = Poller::new();
        let id = poller.register(10, Arc::downgrade(&h));
        assert_eq!(poller.registered_count(), 0);

        poller.get_mut(id).unwrap().interest = INTEREST_READ;
        poller.update(id);
        assert_eq!(poller.registered_count(), 1);
        assert!(poller.contains_fd(10));

        poller.get_mut(id).unwrap().interest = 0;
        poller.update(id);
        poller.remove(id);
        assert_eq!(poller.registered_count(), 0);
        assert!(!poller.contains_fd(10));
        assert!(!poller.contains(id));
    }

    #[test]
    fn test_swap_remove_fixes_moved_index() {
        let h = handler();
        let mut poller = Poller::new();
        let a = poller.register(10, Arc::downgrade(&h));
        let b = poller.register(11, Arc::downgrade(&h));
        let c = poller.register(12, Arc::downgrade(&h));
        for id in [a, b, c] {
            poller.get_mut(id).unwrap().interest = INTEREST_READ;
            poller.update(id);
        }
        assert_eq!(poller.pollfd_index(a), 0);
        assert_eq!(poller.pollfd_index(c), 2);

        // Removing the first entry swap-moves the last one into slot 0.
        poller.get_mut(a).unwrap().interest = 0;
        poller.update(a);
        poller.remove(a);
        assert_eq!(poller.registered_count(), 2);
        assert_eq!(poller.pollfd_index(c), 0);
        assert_eq!(poller.pollfd_index(b), 1);
    }

    #[test]
    fn test_ignored_entry_kept_but_skipped() {
        let h = handler();
        let mut poller = Poller::new();
        let id = poller.register(10, Arc::downgrade(&h));
        poller.get_mut(id).unwrap().interest = INTEREST_WRITE;
        poller.update(id);

        poller.get_mut(id).unwrap().interest = 0;
        poller.update(id);
        // Still present: ignoring is not removal.
        assert_eq!(poller.registered_count(), 1);
        assert!(poller.contains_fd(10));
        assert_eq!(real_fd(poller.pollfds[0].fd), 10);
        assert!(poller.pollfds[0].fd < 0);
    }

    #[test]
    #[should_panic(expected = "still enabled")]
    fn test_remove_enabled_dispatcher_panics() {
        let h = handler();
        let mut poller = Poller::new();
        let id = poller.register(10, Arc::downgrade(&h));
        poller.get_mut(id).unwrap().interest = INTEREST_READ;
        poller.update(id);
        poller.remove(id);
    }

    #[test]
    fn test_poll_reports_readable_eventfd() {
        let efd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        assert!(efd >= 0);
        let h = handler();
        let mut poller = Poller::new();
        let id = poller.register(efd, Arc::downgrade(&h));
        poller.get_mut(id).unwrap().interest = INTEREST_READ;
        poller.update(id);

        let mut active = Vec::new();
        poller.poll(0, &mut active);
        assert!(active.is_empty());

        let one: u64 = 1;
        unsafe { libc::write(efd, &one as *const u64 as *const libc::c_void, 8) };
        poller.poll(100, &mut active);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].0, id);
        assert!(active[0].1 & libc::POLLIN != 0);

        unsafe { libc::close(efd) };
    }
}
