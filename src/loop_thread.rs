//! Loop-per-thread plumbing: a thread that owns one loop, and a
//! round-robin pool of them for sub-reactors.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{debug, warn};

use crate::event_loop::{EventLoop, LoopHandle};

/// A dedicated thread running one event loop.
///
/// The constructor blocks until the loop exists, so the returned handle is
/// always usable. Dropping quits the loop and joins the thread.
pub struct EventLoopThread {
    handle: Arc<LoopHandle>,
    thread: Option<JoinHandle<()>>,
}

impl EventLoopThread {
    /// Spawn a named thread, create its loop, and run it until quit.
    pub fn spawn(name: impl Into<String>) -> EventLoopThread {
        let name = name.into();
        let (tx, rx) = mpsc::channel();
        let thread = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let event_loop = EventLoop::new();
                // The receiver waits on this; a dead receiver means the
                // spawning side already gave up.
                if tx.send(event_loop.handle()).is_err() {
                    return;
                }
                event_loop.run();
            })
            .expect("failed to spawn event loop thread");
        let handle = rx
            .recv()
            .expect("event loop thread exited during startup");
        debug!(thread = %name, "event loop thread started");
        EventLoopThread {
            handle,
            thread: Some(thread),
        }
    }

    /// Cross-thread handle to the loop running on this thread.
    pub fn handle(&self) -> Arc<LoopHandle> {
        self.handle.clone()
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        self.handle.quit();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("event loop thread panicked");
            }
        }
    }
}

/// Round-robin pool of sub-reactor loops.
///
/// With zero threads every pick returns the base loop: the degenerate
/// single-threaded mode.
pub struct EventLoopThreadPool {
    base: Arc<LoopHandle>,
    workers: Vec<EventLoopThread>,
    next: AtomicUsize,
}

impl EventLoopThreadPool {
    /// Spawn `threads` worker loops named `{name}-{index}`.
    pub fn new(base: Arc<LoopHandle>, name: &str, threads: usize) -> EventLoopThreadPool {
        let workers = (0..threads)
            .map(|i| EventLoopThread::spawn(format!("{name}-{i}")))
            .collect();
        EventLoopThreadPool {
            base,
            workers,
            next: AtomicUsize::new(0),
        }
    }

    /// The next loop in rotation, or the base loop for an empty pool.
    pub fn next_loop(&self) -> Arc<LoopHandle> {
        if self.workers.is_empty() {
            return self.base.clone();
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.workers[i].handle()
    }

    pub fn thread_count(&self) -> usize {
        self.workers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_spawned_loop_runs_tasks_on_its_own_thread() {
        let lt = EventLoopThread::spawn("test-loop");
        let handle = lt.handle();
        assert!(!handle.is_in_loop_thread());

        let seen = Arc::new(Mutex::new(String::new()));
        let s = seen.clone();
        handle.run_in_loop(move || {
            *s.lock() = thread::current().name().unwrap_or("").to_string();
        });
        thread::sleep(Duration::from_millis(100));
        assert_eq!(*seen.lock(), "test-loop");
    }

    #[test]
    fn test_empty_pool_returns_base_loop() {
        let lt = EventLoopThread::spawn("base");
        let base = lt.handle();
        let pool = EventLoopThreadPool::new(base.clone(), "worker", 0);
        assert_eq!(pool.thread_count(), 0);
        for _ in 0..3 {
            assert!(Arc::ptr_eq(&pool.next_loop(), &base));
        }
    }

    #[test]
    fn test_pool_rotates_round_robin() {
        let lt = EventLoopThread::spawn("base");
        let pool = EventLoopThreadPool::new(lt.handle(), "worker", 2);
        let a = pool.next_loop();
        let b = pool.next_loop();
        let c = pool.next_loop();
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &c));
    }
}
