//! The reactor: one poll loop, one thread, forever.
//!
//! An [`EventLoop`] is single-threaded by construction. The loop itself is
//! `Rc` and pinned to its creating thread through a thread-local; the only
//! cross-thread surface is the [`LoopHandle`], which marshals closures
//! into the loop through a mutex-protected queue and an eventfd wakeup.
//! Every callback runs to completion on the loop thread, so components
//! never need locks around loop-owned state.

use std::cell::RefCell;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::rc::{Rc, Weak as RcWeak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::dispatcher::{DispatcherId, EventHandler, INTEREST_NONE, INTEREST_READ, INTEREST_WRITE};
use crate::poller::Poller;
use crate::timer::{TimerCallback, TimerId, TimerManager};
use crate::timestamp::Timestamp;

/// Upper bound on one poll cycle; pending work re-wakes the loop sooner.
const POLL_TIMEOUT_MS: i32 = 5000;

pub(crate) type Task = Box<dyn FnOnce() + Send>;

thread_local! {
    static CURRENT_LOOP: RefCell<Option<RcWeak<EventLoop>>> = const { RefCell::new(None) };
}

/// Reads the wakeup eventfd so level-triggered poll stops reporting it.
struct WakeupReader {
    fd: RawFd,
}

impl EventHandler for WakeupReader {
    fn handle_read(&self, _receive_time: Timestamp) {
        let mut count: u64 = 0;
        let n = unsafe {
            libc::read(
                self.fd,
                &mut count as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                error!("wakeup eventfd read failed: {err}");
            }
        }
    }
}

/// The only part of an event loop that may cross threads.
///
/// Holds the task queue, the quit flag, and the write side of the wakeup
/// eventfd. Cheap to clone behind an `Arc`; outliving the loop is safe,
/// queued tasks just never run.
pub struct LoopHandle {
    pending: Mutex<Vec<Task>>,
    wakeup_fd: OwnedFd,
    quit: AtomicBool,
    /// True while the loop drains its task queue; a task queued during the
    /// drain must re-wake the loop or it would sleep a full poll timeout.
    executing_tasks: AtomicBool,
    thread_id: ThreadId,
}

impl LoopHandle {
    /// Whether the calling thread is the loop's own thread.
    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Run `task` on the loop thread: immediately when called from it,
    /// queued otherwise.
    ///
    /// Queued tasks run after the current poll cycle's event callbacks, in
    /// queue order. A task queued from the loop thread while the queue
    /// itself is draining still runs in the next cycle, not recursively.
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Queue `task` unconditionally, even from the loop thread.
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.pending.lock().push(Box::new(task));
        if !self.is_in_loop_thread() || self.executing_tasks.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    /// Ask the loop to exit after its current cycle.
    pub fn quit(&self) {
        self.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    /// Schedule `callback` at an absolute instant. Returns immediately;
    /// from a foreign thread the insertion itself is marshaled to the loop.
    pub fn run_at(&self, when: Timestamp, callback: impl FnMut() + Send + 'static) -> TimerId {
        self.schedule(when, None, Box::new(callback))
    }

    /// Schedule `callback` once, `delay` from now.
    pub fn run_after(&self, delay: Duration, callback: impl FnMut() + Send + 'static) -> TimerId {
        self.schedule(Timestamp::now() + delay, None, Box::new(callback))
    }

    /// Schedule `callback` every `interval`, first firing one interval from
    /// now. Repeats restart from the previous expiry, so the schedule does
    /// not drift under callback latency.
    pub fn run_every(&self, interval: Duration, callback: impl FnMut() + Send + 'static) -> TimerId {
        self.schedule(Timestamp::now() + interval, Some(interval), Box::new(callback))
    }

    /// Cancel a timer. A no-op if it already fired (one-shot) or was
    /// already cancelled; a repeating timer cancelled from its own
    /// callback does not fire again.
    pub fn cancel(&self, id: TimerId) {
        self.run_in_loop(move || {
            if let Some(event_loop) = EventLoop::current() {
                event_loop.timers.cancel(id);
            }
        });
    }

    fn schedule(
        &self,
        when: Timestamp,
        interval: Option<Duration>,
        callback: TimerCallback,
    ) -> TimerId {
        let id = TimerId::allocate(when);
        self.run_in_loop(move || {
            if let Some(event_loop) = EventLoop::current() {
                event_loop.timers.add_timer(id, interval, callback);
            }
        });
        id
    }

    fn wakeup(&self) {
        let one: u64 = 1;
        let n = unsafe {
            libc::write(
                self.wakeup_fd.as_raw_fd(),
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if n != std::mem::size_of::<u64>() as isize {
            error!("wakeup eventfd write failed: {}", io::Error::last_os_error());
        }
    }
}

/// One poll-based reactor, bound to the thread that created it.
pub struct EventLoop {
    poller: RefCell<Poller>,
    timers: TimerManager,
    handle: Arc<LoopHandle>,
    // Keep the wakeup and timer dispatchers' weak handlers upgradable.
    wakeup_reader: Arc<WakeupReader>,
    timer_events: RefCell<Option<Arc<dyn EventHandler>>>,
    thread_id: ThreadId,
    /// Guards against re-entrant `run`.
    looping: std::cell::Cell<bool>,
    /// Scratch list reused across poll cycles.
    active: RefCell<Vec<(DispatcherId, libc::c_short)>>,
}

impl EventLoop {
    /// Create a loop bound to the calling thread.
    ///
    /// Panics if this thread already owns a loop, or if the wakeup or timer
    /// descriptor cannot be created; neither condition is recoverable.
    pub fn new() -> Rc<EventLoop> {
        let already = CURRENT_LOOP
            .with(|cur| cur.borrow().as_ref().map(|w| w.strong_count() > 0))
            .unwrap_or(false);
        assert!(!already, "another event loop already owns this thread");

        let efd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if efd < 0 {
            panic!("eventfd creation failed: {}", io::Error::last_os_error());
        }
        let wakeup_fd = unsafe { OwnedFd::from_raw_fd(efd) };
        let handle = Arc::new(LoopHandle {
            pending: Mutex::new(Vec::new()),
            wakeup_fd,
            quit: AtomicBool::new(false),
            executing_tasks: AtomicBool::new(false),
            thread_id: thread::current().id(),
        });

        let wakeup_reader = Arc::new(WakeupReader { fd: efd });
        let event_loop = Rc::new(EventLoop {
            poller: RefCell::new(Poller::new()),
            timers: TimerManager::new(),
            handle,
            wakeup_reader: wakeup_reader.clone(),
            timer_events: RefCell::new(None),
            thread_id: thread::current().id(),
            looping: std::cell::Cell::new(false),
            active: RefCell::new(Vec::with_capacity(16)),
        });

        let reader_weak = Arc::downgrade(&wakeup_reader);
        let reader_handler: Weak<dyn EventHandler> = reader_weak;
        let wakeup_id = event_loop.register_handler(efd, reader_handler);
        event_loop.enable_reading(wakeup_id);

        // The timer subsystem registers like any other readable source.
        // Its dispatcher holds no owning reference back into the loop;
        // self-reference stays acyclic through the thread-local.
        CURRENT_LOOP.with(|cur| {
            *cur.borrow_mut() = Some(Rc::downgrade(&event_loop));
        });
        let timer_events: Arc<dyn EventHandler> = Arc::new(TimerEvents {
            event_loop: Rc::downgrade(&event_loop),
        });
        let timer_handler = Arc::downgrade(&timer_events);
        *event_loop.timer_events.borrow_mut() = Some(timer_events);
        let timer_id = event_loop.register_handler(event_loop.timers.fd(), timer_handler);
        event_loop.enable_reading(timer_id);
        debug!(thread = ?event_loop.thread_id, "event loop created");
        event_loop
    }

    /// The loop running on the calling thread, if any.
    pub fn current() -> Option<Rc<EventLoop>> {
        CURRENT_LOOP.with(|cur| cur.borrow().as_ref().and_then(RcWeak::upgrade))
    }

    /// Cross-thread surface for this loop.
    pub fn handle(&self) -> Arc<LoopHandle> {
        self.handle.clone()
    }

    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    pub fn assert_in_loop_thread(&self) {
        assert!(
            self.is_in_loop_thread(),
            "event loop used off its owning thread"
        );
    }

    /// Poll and dispatch until quit. Must run on the owning thread.
    pub fn run(&self) {
        self.assert_in_loop_thread();
        assert!(!self.looping.get(), "event loop entered re-entrantly");
        self.looping.set(true);
        trace!("event loop starting");
        while !self.handle.quit.load(Ordering::Acquire) {
            let receive_time = {
                let mut active = self.active.borrow_mut();
                active.clear();
                self.poller.borrow_mut().poll(POLL_TIMEOUT_MS, &mut active)
            };
            self.dispatch(receive_time);
            self.run_pending_tasks();
        }
        // Tasks queued before quit was observed still run, in queue order.
        self.run_pending_tasks();
        self.looping.set(false);
        trace!("event loop stopped");
    }

    /// See [`LoopHandle::run_in_loop`].
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.handle.run_in_loop(task);
    }

    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.handle.queue_in_loop(task);
    }

    pub fn quit(&self) {
        self.handle.quit();
    }

    pub fn run_at(&self, when: Timestamp, callback: impl FnMut() + Send + 'static) -> TimerId {
        self.handle.run_at(when, callback)
    }

    pub fn run_after(&self, delay: Duration, callback: impl FnMut() + Send + 'static) -> TimerId {
        self.handle.run_after(delay, callback)
    }

    pub fn run_every(&self, interval: Duration, callback: impl FnMut() + Send + 'static) -> TimerId {
        self.handle.run_every(interval, callback)
    }

    pub fn cancel(&self, id: TimerId) {
        self.handle.cancel(id);
    }

    /// Register a descriptor with no interest yet. The handler is held
    /// weakly; once the owning component drops, events for the descriptor
    /// are discarded.
    pub(crate) fn register_handler(
        &self,
        fd: RawFd,
        handler: Weak<dyn EventHandler>,
    ) -> DispatcherId {
        self.assert_in_loop_thread();
        self.poller.borrow_mut().register(fd, handler)
    }

    pub(crate) fn enable_reading(&self, id: DispatcherId) {
        self.modify_interest(id, |i| i | INTEREST_READ);
    }

    pub(crate) fn enable_writing(&self, id: DispatcherId) {
        self.modify_interest(id, |i| i | INTEREST_WRITE);
    }

    pub(crate) fn disable_writing(&self, id: DispatcherId) {
        self.modify_interest(id, |i| i & !INTEREST_WRITE);
    }

    pub(crate) fn disable_all(&self, id: DispatcherId) {
        self.modify_interest(id, |_| INTEREST_NONE);
    }

    pub(crate) fn is_writing(&self, id: DispatcherId) -> bool {
        self.assert_in_loop_thread();
        let mut poller = self.poller.borrow_mut();
        poller.get_mut(id).map(|d| d.is_writing()).unwrap_or(false)
    }

    /// Drop a dispatcher from the poller. It must already be disabled.
    pub(crate) fn remove_dispatcher(&self, id: DispatcherId) {
        self.assert_in_loop_thread();
        self.poller.borrow_mut().remove(id);
    }

    fn modify_interest(&self, id: DispatcherId, f: impl FnOnce(libc::c_short) -> libc::c_short) {
        self.assert_in_loop_thread();
        let mut poller = self.poller.borrow_mut();
        let d = poller.get_mut(id).expect("interest change on removed dispatcher");
        d.interest = f(d.interest);
        poller.update(id);
    }

    /// Deliver one poll batch. The poller borrow is released before every
    /// callback, and each handler is upgraded to a strong reference for
    /// the duration of its dispatch, so a callback may deregister or drop
    /// its own component without invalidating the frame it runs in.
    fn dispatch(&self, receive_time: Timestamp) {
        // Take the batch out so callbacks can never alias the scratch list.
        let batch = std::mem::take(&mut *self.active.borrow_mut());
        for &(id, revents) in &batch {
            let handler = {
                let mut poller = self.poller.borrow_mut();
                // An earlier callback in this batch may have removed it.
                match poller.get_mut(id) {
                    Some(d) => d.handler.upgrade(),
                    None => continue,
                }
            };
            let Some(handler) = handler else {
                trace!("dropping events for released handler");
                continue;
            };
            if revents & libc::POLLHUP != 0 && revents & libc::POLLIN == 0 {
                handler.handle_close();
            }
            if revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
                handler.handle_error();
            }
            if revents & (libc::POLLIN | libc::POLLPRI | libc::POLLRDHUP) != 0 {
                handler.handle_read(receive_time);
            }
            if revents & libc::POLLOUT != 0 {
                handler.handle_write();
            }
        }
        *self.active.borrow_mut() = batch;
    }

    /// Drain the queue swapped out under the lock, so tasks that queue
    /// further tasks never deadlock and never run in the same drain.
    fn run_pending_tasks(&self) {
        self.handle.executing_tasks.store(true, Ordering::Release);
        let tasks = std::mem::take(&mut *self.handle.pending.lock());
        for task in tasks {
            task();
        }
        self.handle.executing_tasks.store(false, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn registered_count(&self) -> usize {
        self.poller.borrow().registered_count()
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        CURRENT_LOOP.with(|cur| {
            *cur.borrow_mut() = None;
        });
    }
}

/// Routes timerfd readiness to the loop-owned timer subsystem. Holds the
/// loop weakly; the loop holds the adapter strongly.
struct TimerEvents {
    event_loop: RcWeak<EventLoop>,
}

impl EventHandler for TimerEvents {
    fn handle_read(&self, receive_time: Timestamp) {
        if let Some(event_loop) = self.event_loop.upgrade() {
            event_loop.timers.handle_read(receive_time);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_current_points_at_this_threads_loop() {
        let event_loop = EventLoop::new();
        let current = EventLoop::current().unwrap();
        assert!(Rc::ptr_eq(&event_loop, &current));
    }

    #[test]
    fn test_run_in_loop_from_loop_thread_is_immediate() {
        let event_loop = EventLoop::new();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        event_loop.run_in_loop(move || flag.store(true, Ordering::SeqCst));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_foreign_thread_tasks_run_in_queue_order() {
        let event_loop = EventLoop::new();
        let handle = event_loop.handle();
        let order = Arc::new(Mutex::new(Vec::new()));

        let (h, o) = (handle.clone(), order.clone());
        let t = thread::spawn(move || {
            for i in 0..5u32 {
                let o = o.clone();
                h.queue_in_loop(move || o.lock().push(i));
            }
            h.quit();
        });
        t.join().unwrap();

        event_loop.run();
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_quit_from_foreign_thread_wakes_the_loop() {
        let event_loop = EventLoop::new();
        let handle = event_loop.handle();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            handle.quit();
        });
        let start = std::time::Instant::now();
        event_loop.run();
        t.join().unwrap();
        // Returned well before the poll timeout: the wakeup worked.
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_run_after_fires_and_quits() {
        let event_loop = EventLoop::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let handle = event_loop.handle();
        event_loop.run_after(Duration::from_millis(10), move || {
            f.fetch_add(1, Ordering::SeqCst);
            handle.quit();
        });
        event_loop.run();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_run_every_repeats_until_cancelled() {
        let event_loop = EventLoop::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let handle = event_loop.handle();
        let cancel_handle = handle.clone();
        let id_slot: Arc<Mutex<Option<TimerId>>> = Arc::new(Mutex::new(None));
        let slot = id_slot.clone();
        let id = event_loop.run_every(Duration::from_millis(5), move || {
            let n = f.fetch_add(1, Ordering::SeqCst) + 1;
            if n == 3 {
                if let Some(id) = *slot.lock() {
                    cancel_handle.cancel(id);
                }
                cancel_handle.quit();
            }
        });
        *id_slot.lock() = Some(id);
        event_loop.run();
        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_repeating_timer_cancels_itself_mid_batch() {
        let event_loop = EventLoop::new();
        let handle = event_loop.handle();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let h = handle.clone();
        let id_slot: Arc<Mutex<Option<TimerId>>> = Arc::new(Mutex::new(None));
        let slot = id_slot.clone();
        // Cancelling from the timer's own callback lands while the expiry
        // batch is still running; the side-set must stop the re-arm.
        let id = event_loop.run_every(Duration::from_millis(5), move || {
            f.fetch_add(1, Ordering::SeqCst);
            if let Some(id) = *slot.lock() {
                h.cancel(id);
            }
        });
        *id_slot.lock() = Some(id);
        let quitter = handle.clone();
        event_loop.run_after(Duration::from_millis(40), move || quitter.quit());
        event_loop.run();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_callback_cancels_sibling_in_same_batch() {
        let event_loop = EventLoop::new();
        let handle = event_loop.handle();
        let when = Timestamp::now() + Duration::from_millis(10);

        // Scheduled first, so the canceller runs first within the
        // equal-expiry batch; the victim is already out of the maps by then
        // and only the side-set can keep it from re-arming.
        let victim_slot: Arc<Mutex<Option<TimerId>>> = Arc::new(Mutex::new(None));
        let (h, slot) = (handle.clone(), victim_slot.clone());
        handle.schedule(
            when,
            None,
            Box::new(move || {
                if let Some(victim) = *slot.lock() {
                    h.cancel(victim);
                }
            }),
        );
        let victim_fired = Arc::new(AtomicUsize::new(0));
        let vf = victim_fired.clone();
        let victim = handle.schedule(
            when,
            Some(Duration::from_millis(5)),
            Box::new(move || {
                vf.fetch_add(1, Ordering::SeqCst);
            }),
        );
        *victim_slot.lock() = Some(victim);

        let quitter = handle.clone();
        handle.run_after(Duration::from_millis(50), move || quitter.quit());
        event_loop.run();
        // One shared batch, then never again.
        assert_eq!(victim_fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_before_first_fire() {
        let event_loop = EventLoop::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let id = event_loop.run_after(Duration::from_millis(30), move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        event_loop.cancel(id);
        let handle = event_loop.handle();
        event_loop.run_after(Duration::from_millis(60), move || handle.quit());
        event_loop.run();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
