//! Connecting side: non-blocking connect with backoff retry.
//!
//! A connect is only known to have finished when the socket turns
//! writable; even then the result may be a pending error or a self-connect
//! (the OS can connect a socket to its own ephemeral port). Both count as
//! transient and feed the retry schedule. Configuration-class errno values
//! do not retry at all.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::dispatcher::{DispatcherId, EventHandler};
use crate::event_loop::{EventLoop, LoopHandle};
use crate::listener::NewConnectionCallback;
use crate::socket::Socket;

const INIT_RETRY_DELAY: Duration = Duration::from_millis(500);
const MAX_RETRY_DELAY: Duration = Duration::from_millis(30_000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum State {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            1 => State::Connecting,
            2 => State::Connected,
            _ => State::Disconnected,
        }
    }
}

/// Drives one endpoint toward a connected socket, retrying transient
/// failures with doubling delay. Hands the connected socket to the
/// new-connection callback; ownership passes with it.
pub struct Connector {
    loop_handle: Arc<LoopHandle>,
    server_addr: SocketAddr,
    state: AtomicU8,
    /// Cleared by `stop`; suppresses future retries, never tears down an
    /// in-flight attempt.
    want_connect: AtomicBool,
    retry_delay_ms: AtomicU64,
    socket: Mutex<Option<Socket>>,
    dispatcher: Mutex<Option<DispatcherId>>,
    on_connection: Mutex<Option<NewConnectionCallback>>,
    weak_self: Weak<Connector>,
}

impl Connector {
    pub fn new(loop_handle: Arc<LoopHandle>, server_addr: SocketAddr) -> Arc<Connector> {
        Arc::new_cyclic(|weak_self| Connector {
            loop_handle,
            server_addr,
            state: AtomicU8::new(State::Disconnected as u8),
            want_connect: AtomicBool::new(false),
            retry_delay_ms: AtomicU64::new(INIT_RETRY_DELAY.as_millis() as u64),
            socket: Mutex::new(None),
            dispatcher: Mutex::new(None),
            on_connection: Mutex::new(None),
            weak_self: weak_self.clone(),
        })
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    pub fn set_new_connection_callback(&self, cb: NewConnectionCallback) {
        *self.on_connection.lock() = Some(cb);
    }

    /// The delay the next retry would use.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms.load(Ordering::Acquire))
    }

    /// Begin connecting. Callable from any thread.
    pub fn start(self: &Arc<Self>) {
        self.want_connect.store(true, Ordering::Release);
        let this = self.clone();
        self.loop_handle.run_in_loop(move || this.start_in_loop());
    }

    /// Suppress future retries. An attempt already in flight still runs to
    /// its writable event (where the cleared flag closes the socket); a
    /// scheduled retry is disarmed when it fires and checks the flag.
    pub fn stop(&self) {
        self.want_connect.store(false, Ordering::Release);
    }

    /// Reset the backoff schedule and reconnect. Loop thread only; used by
    /// owners reacting to a closed connection.
    pub fn restart(self: &Arc<Self>) {
        assert!(
            self.loop_handle.is_in_loop_thread(),
            "connector restarted off its owning loop thread"
        );
        self.set_state(State::Disconnected);
        self.retry_delay_ms
            .store(INIT_RETRY_DELAY.as_millis() as u64, Ordering::Release);
        self.want_connect.store(true, Ordering::Release);
        self.start_in_loop();
    }

    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, s: State) {
        self.state.store(s as u8, Ordering::Release);
    }

    fn start_in_loop(self: &Arc<Self>) {
        if !self.want_connect.load(Ordering::Acquire) {
            debug!(addr = %self.server_addr, "connect attempt suppressed, stopped");
            return;
        }
        // A stale retry timer can fire after a newer attempt has begun.
        if self.state() != State::Disconnected {
            return;
        }
        self.attempt();
    }

    fn attempt(self: &Arc<Self>) {
        let socket = match Socket::for_addr(&self.server_addr) {
            Ok(s) => s,
            Err(e) => {
                error!(addr = %self.server_addr, "socket creation failed: {e}");
                return;
            }
        };
        let errno = match socket.connect(&self.server_addr) {
            Ok(()) => 0,
            Err(e) => e.raw_os_error().unwrap_or(libc::EFAULT),
        };
        match errno {
            0 | libc::EINPROGRESS | libc::EINTR | libc::EISCONN => self.connecting(socket),

            libc::EAGAIN
            | libc::EADDRINUSE
            | libc::EADDRNOTAVAIL
            | libc::ECONNREFUSED
            | libc::ENETUNREACH => self.retry(socket),

            libc::EACCES
            | libc::EPERM
            | libc::EAFNOSUPPORT
            | libc::EALREADY
            | libc::EBADF
            | libc::EFAULT
            | libc::ENOTSOCK => {
                error!(addr = %self.server_addr, errno, "connect refused to start");
                drop(socket);
            }

            _ => {
                error!(addr = %self.server_addr, errno, "unexpected connect errno");
                drop(socket);
            }
        }
    }

    /// In progress: park the socket and watch for writability.
    fn connecting(self: &Arc<Self>, socket: Socket) {
        self.set_state(State::Connecting);
        let event_loop = EventLoop::current().expect("owning loop gone");
        let fd = socket.fd();
        *self.socket.lock() = Some(socket);
        let handler: Weak<dyn EventHandler> = self.weak_self.clone();
        let id = event_loop.register_handler(fd, handler);
        *self.dispatcher.lock() = Some(id);
        event_loop.enable_writing(id);
    }

    /// Deregister the in-flight dispatcher and reclaim the socket. The
    /// removal may run inside this connector's own event frame; that is
    /// safe because the next attempt uses a fresh descriptor.
    fn take_registration(&self) -> Option<Socket> {
        let event_loop = EventLoop::current().expect("owning loop gone");
        if let Some(id) = self.dispatcher.lock().take() {
            event_loop.disable_all(id);
            event_loop.remove_dispatcher(id);
        }
        self.socket.lock().take()
    }

    /// Close the failed socket and, while still wanted, schedule the next
    /// attempt; the delay doubles after each scheduling up to the cap.
    fn retry(self: &Arc<Self>, socket: Socket) {
        drop(socket);
        self.set_state(State::Disconnected);
        if !self.want_connect.load(Ordering::Acquire) {
            debug!(addr = %self.server_addr, "not retrying, stopped");
            return;
        }
        let delay = self.retry_delay();
        info!(addr = %self.server_addr, ?delay, "connect failed, retrying");
        let this = self.clone();
        self.loop_handle.run_after(delay, move || {
            this.start_in_loop();
        });
        let doubled = (delay * 2).min(MAX_RETRY_DELAY);
        self.retry_delay_ms
            .store(doubled.as_millis() as u64, Ordering::Release);
    }
}

impl EventHandler for Connector {
    fn handle_write(&self) {
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        if this.state() != State::Connecting {
            return;
        }
        let Some(socket) = this.take_registration() else {
            return;
        };
        match socket.take_error() {
            Ok(Some(e)) => {
                warn!(addr = %this.server_addr, "connect completed with error: {e}");
                this.retry(socket);
                return;
            }
            Err(e) => {
                warn!(addr = %this.server_addr, "failed to read connect result: {e}");
                this.retry(socket);
                return;
            }
            Ok(None) => {}
        }
        if socket.is_self_connect() {
            warn!(addr = %this.server_addr, "self-connect detected");
            this.retry(socket);
            return;
        }
        this.set_state(State::Connected);
        if this.want_connect.load(Ordering::Acquire) {
            let peer = socket.peer_addr().unwrap_or(this.server_addr);
            // Taken out of the slot before the call: the callback may
            // install its own replacement. The `let` drops the guard; a
            // `match` on the locked slot would hold it across the call.
            let taken = this.on_connection.lock().take();
            match taken {
                Some(mut cb) => {
                    cb(socket, peer);
                    let mut slot = this.on_connection.lock();
                    if slot.is_none() {
                        *slot = Some(cb);
                    }
                }
                None => info!(addr = %this.server_addr, "connected with no consumer"),
            }
        }
        // Stopped while in flight: dropping the socket closes it.
    }

    fn handle_error(&self) {
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        if this.state() != State::Connecting {
            return;
        }
        if let Some(socket) = this.take_registration() {
            if let Ok(Some(e)) = socket.take_error() {
                warn!(addr = %this.server_addr, "connect error: {e}");
            }
            this.retry(socket);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_doubles_to_cap() {
        let event_loop = EventLoop::new();
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let connector = Connector::new(event_loop.handle(), addr);
        connector.want_connect.store(true, Ordering::Release);

        let mut expected = 500u64;
        for _ in 0..10 {
            assert_eq!(connector.retry_delay(), Duration::from_millis(expected));
            let socket = Socket::for_addr(&addr).unwrap();
            connector.retry(socket);
            expected = (expected * 2).min(30_000);
        }
        assert_eq!(connector.retry_delay(), Duration::from_millis(30_000));
    }

    #[test]
    fn test_restart_resets_backoff() {
        let event_loop = EventLoop::new();
        // A live listener keeps the post-restart attempt from failing
        // synchronously and re-entering the backoff path.
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let acceptor = Socket::for_addr(&addr).unwrap();
        acceptor.bind(&addr).unwrap();
        acceptor.listen(1).unwrap();
        let target = acceptor.local_addr().unwrap();

        let connector = Connector::new(event_loop.handle(), target);
        connector.want_connect.store(true, Ordering::Release);
        for _ in 0..3 {
            let socket = Socket::for_addr(&target).unwrap();
            connector.retry(socket);
        }
        assert_eq!(connector.retry_delay(), Duration::from_millis(4000));

        connector.restart();
        assert_eq!(connector.retry_delay(), Duration::from_millis(500));
    }

    #[test]
    fn test_stop_suppresses_scheduled_retry() {
        let event_loop = EventLoop::new();
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let connector = Connector::new(event_loop.handle(), addr);
        connector.want_connect.store(true, Ordering::Release);
        connector.stop();
        // The attempt a pending retry timer would marshal observes the
        // cleared flag and bails without opening a socket.
        connector.start_in_loop();
        assert_eq!(connector.state(), State::Disconnected);
        assert!(connector.socket.lock().is_none());
    }

    #[test]
    fn test_stop_leaves_inflight_attempt_registered() {
        let event_loop = EventLoop::new();
        let bind_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let acceptor = Socket::for_addr(&bind_addr).unwrap();
        acceptor.bind(&bind_addr).unwrap();
        acceptor.listen(1).unwrap();
        let target = acceptor.local_addr().unwrap();

        let connector = Connector::new(event_loop.handle(), target);
        connector.start();
        assert_eq!(connector.state(), State::Connecting);

        // Stop must not tear the attempt down; it runs to its writable
        // event and the cleared flag closes the socket there.
        connector.stop();
        assert_eq!(connector.state(), State::Connecting);
        assert!(connector.socket.lock().is_some());
        assert!(connector.dispatcher.lock().is_some());
    }
}
