//! Accepting side: one dispatcher on a listening socket.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info, trace};

use crate::dispatcher::{DispatcherId, EventHandler};
use crate::error::Error;
use crate::event_loop::{EventLoop, LoopHandle};
use crate::socket::Socket;
use crate::timestamp::Timestamp;

/// Receives ownership of each accepted (or connected) socket together
/// with the peer address.
pub type NewConnectionCallback = Box<dyn FnMut(Socket, SocketAddr) + Send>;

/// Owns the listening socket; binds eagerly, listens lazily.
///
/// One accept per readiness notification: the poll is level-triggered, so
/// further pending connections re-signal on the next cycle.
pub struct Listener {
    loop_handle: Arc<LoopHandle>,
    socket: Socket,
    addr: SocketAddr,
    dispatcher: Mutex<Option<DispatcherId>>,
    listening: AtomicBool,
    on_connection: Mutex<Option<NewConnectionCallback>>,
    weak_self: Weak<Listener>,
}

impl Listener {
    /// Create and bind. Binding failure is the caller's to report, not a
    /// panic: the address may legitimately be taken.
    pub fn new(
        loop_handle: Arc<LoopHandle>,
        addr: SocketAddr,
        reuse_addr: bool,
    ) -> Result<Arc<Listener>, Error> {
        let socket = Socket::for_addr(&addr).map_err(Error::Socket)?;
        socket.set_reuse_addr(reuse_addr).map_err(Error::Socket)?;
        socket
            .bind(&addr)
            .map_err(|source| Error::Bind { addr, source })?;
        Ok(Arc::new_cyclic(|weak_self| Listener {
            loop_handle,
            socket,
            addr,
            dispatcher: Mutex::new(None),
            listening: AtomicBool::new(false),
            on_connection: Mutex::new(None),
            weak_self: weak_self.clone(),
        }))
    }

    pub fn set_new_connection_callback(&self, cb: NewConnectionCallback) {
        *self.on_connection.lock() = Some(cb);
    }

    pub fn listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    /// The address actually bound; resolves port 0 to the assigned port.
    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr().unwrap_or(self.addr)
    }

    /// Start listening and arm read interest. Loop thread only; listening
    /// failure on a bound socket is unrecoverable.
    pub fn listen(self: &Arc<Self>) {
        assert!(
            self.loop_handle.is_in_loop_thread(),
            "listener used off its owning loop thread"
        );
        if self.listening.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.socket.listen(libc::SOMAXCONN) {
            panic!("listen on {} failed: {e}", self.addr);
        }
        let event_loop = EventLoop::current().expect("owning loop gone");
        let handler: Weak<dyn EventHandler> = self.weak_self.clone();
        let id = event_loop.register_handler(self.socket.fd(), handler);
        *self.dispatcher.lock() = Some(id);
        event_loop.enable_reading(id);
        info!(addr = %self.local_addr(), "listening");
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        // Registration can only be undone on the owning thread; elsewhere
        // the loop is already shutting down and takes the table with it.
        if !self.loop_handle.is_in_loop_thread() {
            return;
        }
        let Some(event_loop) = EventLoop::current() else {
            return;
        };
        if let Some(id) = self.dispatcher.lock().take() {
            event_loop.disable_all(id);
            event_loop.remove_dispatcher(id);
        }
    }
}

impl EventHandler for Listener {
    fn handle_read(&self, _receive_time: Timestamp) {
        match self.socket.accept() {
            Ok((sock, peer)) => {
                trace!(peer = %peer, "accepted connection");
                let mut cb = self.on_connection.lock();
                match cb.as_mut() {
                    Some(cb) => cb(sock, peer),
                    // Dropping `sock` closes it.
                    None => info!(peer = %peer, "no connection consumer, closing"),
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => {
                // EMFILE and friends: log and wait for headroom rather
                // than spinning the process down.
                error!(addr = %self.addr, "accept failed: {e}");
            }
        }
    }
}
