//! One established TCP connection and its state machine.
//!
//! Connections are shared (`Arc`) because the application, the server
//! registry, and in-flight loop tasks all hold them; everything mutable is
//! behind its own small lock or an atomic. All I/O and interest changes
//! happen on the owning loop's thread. Teardown is two-phase: the event
//! path disables interest and reports the close, and the final dispatcher
//! removal runs as a queued task holding an owning reference, so a
//! dispatcher is never destroyed while its own event frame is on the
//! stack.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::buffer::Buffer;
use crate::dispatcher::{DispatcherId, EventHandler};
use crate::event_loop::{EventLoop, LoopHandle};
use crate::socket::Socket;
use crate::timestamp::Timestamp;

/// Invoked on establishment and again on disconnection; distinguish with
/// [`TcpConnection::connected`].
pub type ConnectionCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
/// Invoked with the input buffer whenever bytes arrive. The callback
/// consumes what it wants; leftovers stay buffered for the next read.
pub type MessageCallback = Arc<dyn Fn(&Arc<TcpConnection>, &mut Buffer, Timestamp) + Send + Sync>;
/// Invoked once each time the output buffer fully drains.
pub type WriteCompleteCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
/// Owner-level wiring: bound to the owning server's (or client's)
/// connection-removal routine, not to application code.
pub type CloseCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl ConnectionState {
    fn from_u8(v: u8) -> ConnectionState {
        match v {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Connected,
            2 => ConnectionState::Disconnecting,
            _ => ConnectionState::Disconnected,
        }
    }
}

#[derive(Default)]
struct Callbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
    close: Option<CloseCallback>,
}

pub struct TcpConnection {
    name: String,
    loop_handle: Arc<LoopHandle>,
    socket: Socket,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    state: AtomicU8,
    input: Mutex<Buffer>,
    output: Mutex<Buffer>,
    dispatcher: Mutex<Option<DispatcherId>>,
    callbacks: Mutex<Callbacks>,
    weak_self: Weak<TcpConnection>,
}

impl TcpConnection {
    /// Construct in the Connecting state. The caller wires callbacks and
    /// then marshals [`connection_established`] onto `loop_handle`'s loop.
    ///
    /// [`connection_established`]: TcpConnection::connection_established
    pub fn new(
        name: String,
        loop_handle: Arc<LoopHandle>,
        socket: Socket,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> Arc<TcpConnection> {
        Arc::new_cyclic(|weak_self| TcpConnection {
            name,
            loop_handle,
            socket,
            local_addr,
            peer_addr,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            input: Mutex::new(Buffer::new()),
            output: Mutex::new(Buffer::new()),
            dispatcher: Mutex::new(None),
            callbacks: Mutex::new(Callbacks::default()),
            weak_self: weak_self.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn loop_handle(&self) -> Arc<LoopHandle> {
        self.loop_handle.clone()
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn set_tcp_nodelay(&self, on: bool) -> std::io::Result<()> {
        self.socket.set_tcp_nodelay(on)
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        self.callbacks.lock().connection = Some(cb);
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        self.callbacks.lock().message = Some(cb);
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        self.callbacks.lock().write_complete = Some(cb);
    }

    /// Owner-level wiring; application code uses the connection callback.
    pub fn set_close_callback(&self, cb: CloseCallback) {
        self.callbacks.lock().close = Some(cb);
    }

    /// Arm read interest, transition to Connected, and fire the connection
    /// callback. Called exactly once, on the owning loop's thread,
    /// immediately after construction and wiring.
    pub fn connection_established(self: &Arc<Self>) {
        let event_loop = Self::owning_loop(&self.loop_handle);
        assert_eq!(self.state(), ConnectionState::Connecting);

        let handler: Weak<dyn EventHandler> = self.weak_self.clone();
        let id = event_loop.register_handler(self.socket.fd(), handler);
        *self.dispatcher.lock() = Some(id);
        event_loop.enable_reading(id);

        self.state
            .store(ConnectionState::Connected as u8, Ordering::Release);
        debug!(conn = %self.name, peer = %self.peer_addr, "connection established");
        // Clone out before invoking: the callback may call `send`, whose
        // write-complete path takes this lock again on the same thread.
        let cb = self.callbacks.lock().connection.clone();
        if let Some(cb) = cb {
            cb(self);
        }
    }

    /// Final teardown step, queued onto the owning loop with an owning
    /// reference after the server drops its registry entry. Removes the
    /// dispatcher; by then interest is already fully disabled.
    pub fn connection_closed(self: &Arc<Self>) {
        let event_loop = Self::owning_loop(&self.loop_handle);
        // Direct-destroy path: teardown without a prior close event. Also
        // covers a half-closed connection discarded before the peer closed.
        let state = self.state();
        if state == ConnectionState::Connected || state == ConnectionState::Disconnecting {
            self.state
                .store(ConnectionState::Disconnected as u8, Ordering::Release);
            if let Some(id) = *self.dispatcher.lock() {
                event_loop.disable_all(id);
            }
            let cb = self.callbacks.lock().connection.clone();
            if let Some(cb) = cb {
                cb(self);
            }
        }
        if let Some(id) = self.dispatcher.lock().take() {
            event_loop.remove_dispatcher(id);
        }
        debug!(conn = %self.name, "connection closed");
    }

    /// Queue `data` for delivery. Runs inline on the owning loop's thread,
    /// marshaled (with a copy) from any other. A quiet no-op once the
    /// connection is past Connected.
    pub fn send(self: &Arc<Self>, data: &[u8]) {
        if self.state() != ConnectionState::Connected {
            warn!(conn = %self.name, "send on a connection that is not connected");
            return;
        }
        if self.loop_handle.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let conn = self.clone();
            let owned = data.to_vec();
            self.loop_handle.run_in_loop(move || {
                conn.send_in_loop(&owned);
            });
        }
    }

    /// Half-close the write side once all pending output has drained.
    /// Never truncates queued writes.
    pub fn shutdown(self: &Arc<Self>) {
        if self
            .state
            .compare_exchange(
                ConnectionState::Connected as u8,
                ConnectionState::Disconnecting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }
        let conn = self.clone();
        self.loop_handle.run_in_loop(move || {
            conn.shutdown_in_loop();
        });
    }

    fn shutdown_in_loop(self: &Arc<Self>) {
        let event_loop = Self::owning_loop(&self.loop_handle);
        let dispatcher = *self.dispatcher.lock();
        let writing = dispatcher
            .map(|id| event_loop.is_writing(id))
            .unwrap_or(false);
        // Still draining: handle_write performs the deferred half-close.
        if !writing {
            if let Err(e) = self.socket.shutdown_write() {
                error!(conn = %self.name, "shutdown failed: {e}");
            }
        }
    }

    fn send_in_loop(self: &Arc<Self>, data: &[u8]) {
        let event_loop = Self::owning_loop(&self.loop_handle);
        if self.state() == ConnectionState::Disconnected {
            warn!(conn = %self.name, "send after disconnect, dropped");
            return;
        }
        let dispatcher = *self.dispatcher.lock();
        let writing = dispatcher
            .map(|id| event_loop.is_writing(id))
            .unwrap_or(false);

        let mut wrote = 0;
        let mut output = self.output.lock();
        // Fast path: no backlog and no write interest armed.
        if !writing && output.readable_bytes() == 0 {
            match self.socket.write(data) {
                Ok(n) => {
                    wrote = n;
                    trace!(conn = %self.name, wrote, "direct write");
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    error!(conn = %self.name, "write failed: {e}");
                    return;
                }
            }
        }
        if wrote < data.len() {
            output.append(&data[wrote..]);
            drop(output);
            if let Some(id) = dispatcher {
                if !event_loop.is_writing(id) {
                    event_loop.enable_writing(id);
                }
            }
        } else {
            drop(output);
            self.queue_write_complete();
        }
    }

    fn queue_write_complete(self: &Arc<Self>) {
        let Some(cb) = self.callbacks.lock().write_complete.clone() else {
            return;
        };
        let conn = self.clone();
        self.loop_handle.queue_in_loop(move || {
            cb(&conn);
        });
    }

    /// Shared close/error teardown: runs at most once, disables all
    /// interest, reports the disconnection, then hands the connection to
    /// the server's removal routine. Dispatcher removal itself is deferred
    /// to [`connection_closed`].
    ///
    /// [`connection_closed`]: TcpConnection::connection_closed
    fn teardown(self: &Arc<Self>) {
        let prev = ConnectionState::from_u8(
            self.state
                .swap(ConnectionState::Disconnected as u8, Ordering::AcqRel),
        );
        if prev == ConnectionState::Disconnected {
            return;
        }
        let event_loop = Self::owning_loop(&self.loop_handle);
        if let Some(id) = *self.dispatcher.lock() {
            event_loop.disable_all(id);
        }
        let (connection_cb, close_cb) = {
            let cbs = self.callbacks.lock();
            (cbs.connection.clone(), cbs.close.clone())
        };
        if let Some(cb) = connection_cb {
            cb(self);
        }
        if let Some(cb) = close_cb {
            cb(self);
        }
    }

    fn owning_loop(handle: &Arc<LoopHandle>) -> std::rc::Rc<EventLoop> {
        assert!(
            handle.is_in_loop_thread(),
            "connection used off its owning loop thread"
        );
        EventLoop::current().expect("owning loop gone")
    }

    #[cfg(test)]
    pub(crate) fn output_backlog(&self) -> usize {
        self.output.lock().readable_bytes()
    }
}

impl EventHandler for TcpConnection {
    fn handle_read(&self, receive_time: Timestamp) {
        let Some(conn) = self.weak_self.upgrade() else {
            return;
        };
        let mut input = self.input.lock();
        match input.read_fd(self.socket.fd()) {
            Ok(0) => {
                drop(input);
                conn.teardown();
            }
            Ok(n) => {
                trace!(conn = %self.name, bytes = n, "readable");
                let cb = self.callbacks.lock().message.clone();
                if let Some(cb) = cb {
                    cb(&conn, &mut input, receive_time);
                } else {
                    // No consumer wired: drop the bytes instead of growing
                    // the buffer forever.
                    input.retrieve_all();
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => {
                drop(input);
                error!(conn = %self.name, "read failed: {e}");
                conn.teardown();
            }
        }
    }

    fn handle_write(&self) {
        let Some(conn) = self.weak_self.upgrade() else {
            return;
        };
        let event_loop = Self::owning_loop(&self.loop_handle);
        let Some(id) = *self.dispatcher.lock() else {
            return;
        };
        if !event_loop.is_writing(id) {
            trace!(conn = %self.name, "writable but write interest already gone");
            return;
        }
        let mut output = self.output.lock();
        match self.socket.write(output.peek()) {
            Ok(n) => {
                output.retrieve(n);
                if output.readable_bytes() == 0 {
                    drop(output);
                    event_loop.disable_writing(id);
                    conn.queue_write_complete();
                    if conn.state() == ConnectionState::Disconnecting {
                        conn.shutdown_in_loop();
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => {
                error!(conn = %self.name, "write failed: {e}");
            }
        }
    }

    fn handle_close(&self) {
        if let Some(conn) = self.weak_self.upgrade() {
            conn.teardown();
        }
    }

    fn handle_error(&self) {
        match self.socket.take_error() {
            Ok(Some(e)) => error!(conn = %self.name, "socket error: {e}"),
            Ok(None) => error!(conn = %self.name, "error event with no pending errno"),
            Err(e) => error!(conn = %self.name, "failed to fetch socket error: {e}"),
        }
        if let Some(conn) = self.weak_self.upgrade() {
            conn.teardown();
        }
    }
}
