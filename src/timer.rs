//! Timer subsystem backed by one kernel timer descriptor.
//!
//! Timers are keyed by `(absolute expiry, sequence)` in an ordered map;
//! the sequence disambiguates timers with equal expiry and gives every
//! timer a stable identity independent of storage location. The timerfd is
//! programmed to fire at the earliest pending expiry; on wake all due
//! timers run, then repeating ones are re-inserted at `previous expiry +
//! interval` so repetition does not drift against the clock.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::os::unix::io::{FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::{error, trace};

use crate::dispatcher::EventHandler;
use crate::timestamp::Timestamp;

/// Callback invoked on timer expiry. Takes no arguments and returns
/// nothing; errors are the callback's own business.
pub type TimerCallback = Box<dyn FnMut() + Send>;

/// Minimum gap programmed into the timerfd. Zero or negative would disarm
/// the descriptor instead of firing it.
const MIN_TIMERFD_GAP: Duration = Duration::from_micros(100);

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Identity of a scheduled timer: the expiry it was created with plus a
/// monotonically increasing sequence number. Sequence, not address,
/// disambiguates concurrently-alive timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId {
    seq: u64,
    when: Timestamp,
}

impl TimerId {
    pub(crate) fn allocate(when: Timestamp) -> TimerId {
        TimerId {
            seq: NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed),
            when,
        }
    }
}

struct TimerEntry {
    callback: TimerCallback,
    interval: Option<Duration>,
    seq: u64,
}

struct TimerState {
    /// Time-ordered pending timers.
    timers: BTreeMap<(Timestamp, u64), TimerEntry>,
    /// Sequence -> current expiry, for cancellation lookups. Always holds
    /// exactly the set of sequences present in `timers`.
    active: HashMap<u64, Timestamp>,
    /// True while expiry callbacks are running.
    expiring: bool,
    /// Sequences cancelled mid-expiry; consulted before re-arming
    /// repeating timers, cleared at the start of each expiry batch.
    cancelled_in_expiry: HashSet<u64>,
}

/// Self-contained timer subsystem, one per event loop.
///
/// All mutation must happen on the owning loop's thread; the loop marshals
/// foreign-thread `run_at`/`cancel` calls through its task queue before
/// they reach this type.
pub(crate) struct TimerManager {
    timer_fd: OwnedFd,
    state: RefCell<TimerState>,
}

impl TimerManager {
    /// Create the manager and its timerfd. Failure to create the
    /// descriptor is unrecoverable.
    pub(crate) fn new() -> TimerManager {
        let fd = unsafe {
            libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
            )
        };
        if fd < 0 {
            panic!(
                "timerfd_create failed: {}",
                io::Error::last_os_error()
            );
        }
        TimerManager {
            timer_fd: unsafe { OwnedFd::from_raw_fd(fd) },
            state: RefCell::new(TimerState {
                timers: BTreeMap::new(),
                active: HashMap::new(),
                expiring: false,
                cancelled_in_expiry: HashSet::new(),
            }),
        }
    }

    pub(crate) fn fd(&self) -> RawFd {
        use std::os::unix::io::AsRawFd;
        self.timer_fd.as_raw_fd()
    }

    /// Insert a timer; re-arm the timerfd if it became the new earliest.
    pub(crate) fn add_timer(&self, id: TimerId, interval: Option<Duration>, callback: TimerCallback) {
        let earliest_changed = {
            let mut state = self.state.borrow_mut();
            let earliest_changed = state
                .timers
                .keys()
                .next()
                .map_or(true, |&(first, _)| id.when < first);
            state.active.insert(id.seq, id.when);
            state.timers.insert(
                (id.when, id.seq),
                TimerEntry {
                    callback,
                    interval,
                    seq: id.seq,
                },
            );
            earliest_changed
        };
        if earliest_changed {
            self.rearm();
        }
    }

    /// Cancel a timer. Safe at any time, including from a timer's own
    /// callback: a timer that is mid-expiry is recorded in a side-set and
    /// consulted before re-arming, rather than mutating the maps while the
    /// batch iterates.
    pub(crate) fn cancel(&self, id: TimerId) {
        let mut state = self.state.borrow_mut();
        if let Some(when) = state.active.remove(&id.seq) {
            let removed = state.timers.remove(&(when, id.seq));
            debug_assert!(removed.is_some());
            trace!(seq = id.seq, "timer cancelled");
        } else if state.expiring {
            state.cancelled_in_expiry.insert(id.seq);
            trace!(seq = id.seq, "timer cancelled during its expiry batch");
        }
    }

    /// Drain the timerfd and run one expiry batch.
    fn handle_expiry(&self) {
        // Level-triggered: the descriptor must be read or it re-signals.
        let mut count: u64 = 0;
        let n = unsafe {
            libc::read(
                self.fd(),
                &mut count as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                error!("timerfd read failed: {err}");
            }
        }
        self.process_expired(Timestamp::now());
    }

    /// Remove every timer with expiry <= `now` from both maps in one pass,
    /// run their callbacks, then re-insert the repeating survivors and
    /// re-arm the descriptor for the new minimum.
    fn process_expired(&self, now: Timestamp) {
        let mut expired = Vec::new();
        {
            let mut state = self.state.borrow_mut();
            let pending = state.timers.split_off(&(now, u64::MAX));
            let due = std::mem::replace(&mut state.timers, pending);
            for ((when, seq), entry) in due {
                state.active.remove(&seq);
                expired.push((when, entry));
            }
            state.expiring = true;
            state.cancelled_in_expiry.clear();
        }

        for (_, entry) in &mut expired {
            (entry.callback)();
        }

        {
            let mut state = self.state.borrow_mut();
            state.expiring = false;
            for (when, entry) in expired {
                let Some(interval) = entry.interval else {
                    continue;
                };
                if state.cancelled_in_expiry.contains(&entry.seq) {
                    continue;
                }
                // Restart from the previous expiry, not from now: repeats
                // must not drift.
                let next = when + interval;
                state.active.insert(entry.seq, next);
                state.timers.insert((next, entry.seq), entry);
            }
        }
        self.rearm();
    }

    /// Program the timerfd for the earliest pending expiry, clamping the
    /// gap to a small positive value: a zero interval would disarm.
    fn rearm(&self) {
        let state = self.state.borrow();
        let Some(&(when, _)) = state.timers.keys().next() else {
            return;
        };
        let gap = when.until().max(MIN_TIMERFD_GAP);
        let mut spec: libc::itimerspec = unsafe { std::mem::zeroed() };
        spec.it_value.tv_sec = gap.as_secs() as libc::time_t;
        spec.it_value.tv_nsec = gap.subsec_nanos() as libc::c_long;
        let rc = unsafe { libc::timerfd_settime(self.fd(), 0, &spec, std::ptr::null_mut()) };
        if rc < 0 {
            error!("timerfd_settime failed: {}", io::Error::last_os_error());
        }
    }

    #[cfg(test)]
    fn next_expiry(&self) -> Option<Timestamp> {
        self.state.borrow().timers.keys().next().map(|&(when, _)| when)
    }

    #[cfg(test)]
    fn pending_count(&self) -> usize {
        let state = self.state.borrow();
        assert_eq!(state.timers.len(), state.active.len());
        state.timers.len()
    }
}

impl EventHandler for TimerManager {
    fn handle_read(&self, _receive_time: Timestamp) {
        self.handle_expiry();
    }
}
