//! Accepting server: listener on the base loop, connections spread
//! round-robin over the sub-reactor pool.
//!
//! The connection registry lives on the server's loop; every mutation is
//! marshaled there. Connections themselves live on whichever loop they
//! were assigned, so establishment and the final teardown step are
//! marshaled the other way.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::connection::{
    ConnectionCallback, MessageCallback, TcpConnection, WriteCompleteCallback,
};
use crate::error::Error;
use crate::event_loop::LoopHandle;
use crate::listener::Listener;
use crate::loop_thread::EventLoopThreadPool;
use crate::socket::Socket;

pub struct TcpServer {
    name: String,
    loop_handle: Arc<LoopHandle>,
    listener: Arc<Listener>,
    pool: EventLoopThreadPool,
    connections: Mutex<HashMap<String, Arc<TcpConnection>>>,
    next_conn_id: AtomicU64,
    started: AtomicBool,
    connection_cb: Mutex<Option<ConnectionCallback>>,
    message_cb: Mutex<Option<MessageCallback>>,
    write_complete_cb: Mutex<Option<WriteCompleteCallback>>,
    weak_self: Weak<TcpServer>,
}

impl TcpServer {
    /// Bind `addr` on the loop behind `loop_handle` and spawn `threads`
    /// sub-reactor loops. Zero threads runs everything on the base loop.
    pub fn new(
        loop_handle: Arc<LoopHandle>,
        addr: SocketAddr,
        name: impl Into<String>,
        threads: usize,
    ) -> Result<Arc<TcpServer>, Error> {
        let name = name.into();
        let listener = Listener::new(loop_handle.clone(), addr, true)?;
        let pool = EventLoopThreadPool::new(loop_handle.clone(), &name, threads);
        let server = Arc::new_cyclic(|weak_self| TcpServer {
            name,
            loop_handle,
            listener,
            pool,
            connections: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
            started: AtomicBool::new(false),
            connection_cb: Mutex::new(None),
            message_cb: Mutex::new(None),
            write_complete_cb: Mutex::new(None),
            weak_self: weak_self.clone(),
        });
        let weak = server.weak_self.clone();
        server
            .listener
            .set_new_connection_callback(Box::new(move |socket, peer| {
                if let Some(server) = weak.upgrade() {
                    server.new_connection(socket, peer);
                }
            }));
        Ok(server)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The bound address, with an ephemeral port resolved.
    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub fn thread_count(&self) -> usize {
        self.pool.thread_count()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        *self.connection_cb.lock() = Some(cb);
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        *self.message_cb.lock() = Some(cb);
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        *self.write_complete_cb.lock() = Some(cb);
    }

    /// Start accepting. Idempotent; callable from any thread.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(server = %self.name, addr = %self.local_addr(), "server starting");
        let listener = self.listener.clone();
        self.loop_handle.run_in_loop(move || listener.listen());
    }

    /// Runs on the server's loop via the listener.
    fn new_connection(self: &Arc<Self>, socket: Socket, peer: SocketAddr) {
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_name = format!("{}_{}", self.name, id);
        let conn_handle = self.pool.next_loop();
        let local = socket.local_addr().unwrap_or_else(|_| self.local_addr());
        debug!(server = %self.name, conn = %conn_name, peer = %peer, "new connection");

        let conn = TcpConnection::new(conn_name.clone(), conn_handle.clone(), socket, local, peer);
        if let Some(cb) = self.connection_cb.lock().clone() {
            conn.set_connection_callback(cb);
        }
        if let Some(cb) = self.message_cb.lock().clone() {
            conn.set_message_callback(cb);
        }
        if let Some(cb) = self.write_complete_cb.lock().clone() {
            conn.set_write_complete_callback(cb);
        }
        let weak = self.weak_self.clone();
        conn.set_close_callback(Arc::new(move |conn| {
            if let Some(server) = weak.upgrade() {
                server.remove_connection(conn);
            }
        }));

        self.connections.lock().insert(conn_name, conn.clone());
        conn_handle.run_in_loop(move || conn.connection_established());
    }

    /// Invoked from a connection's close path, on that connection's loop.
    /// Registry mutation is marshaled to the server's loop; the final
    /// dispatcher removal goes back to the connection's loop, queued with
    /// an owning reference so the object outlives its own event frame.
    fn remove_connection(self: &Arc<Self>, conn: &Arc<TcpConnection>) {
        let server = self.clone();
        let conn = conn.clone();
        self.loop_handle.run_in_loop(move || {
            debug!(server = %server.name, conn = %conn.name(), "removing connection");
            server.connections.lock().remove(conn.name());
            let conn_handle = conn.loop_handle();
            let conn = conn.clone();
            conn_handle.queue_in_loop(move || conn.connection_closed());
        });
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        let connections: Vec<_> = self
            .connections
            .lock()
            .drain()
            .map(|(_, conn)| conn)
            .collect();
        for conn in connections {
            let handle = conn.loop_handle();
            handle.queue_in_loop(move || conn.connection_closed());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;

    #[test]
    fn test_server_binds_and_starts_once() {
        let event_loop = EventLoop::new();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = TcpServer::new(event_loop.handle(), addr, "unit", 0).unwrap();
        assert_eq!(server.thread_count(), 0);
        assert_eq!(server.connection_count(), 0);

        server.start();
        server.start();
        assert_ne!(server.local_addr().port(), 0);
    }

    #[test]
    fn test_bind_failure_surfaces_as_error() {
        let event_loop = EventLoop::new();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let first = TcpServer::new(event_loop.handle(), addr, "unit", 0).unwrap();
        first.start();

        // SO_REUSEADDR does not allow a second live listener here.
        let second = Socket::for_addr(&first.local_addr()).unwrap();
        second.bind(&first.local_addr()).unwrap_err();
    }
}
