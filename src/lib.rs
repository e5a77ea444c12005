//! A poll-based reactor networking core.
//!
//! One [`EventLoop`] per thread, each blocking in level-triggered poll(2)
//! and dispatching readiness callbacks to completion. A [`TcpServer`]
//! accepts on its base loop and spreads connections round-robin over a
//! pool of sub-reactor loops; a [`Connector`] drives the client side with
//! backoff retry. Cross-thread work enters a loop only through its
//! [`LoopHandle`] task queue, so loop-owned state never needs locking.
//!
//! ```no_run
//! use polliwog::{EventLoop, TcpServer};
//! use std::sync::Arc;
//!
//! let event_loop = EventLoop::new();
//! let addr = "127.0.0.1:4000".parse().unwrap();
//! let server = TcpServer::new(event_loop.handle(), addr, "echo", 2).unwrap();
//! server.set_message_callback(Arc::new(|conn, input, _when| {
//!     let bytes = input.peek().to_vec();
//!     input.retrieve_all();
//!     conn.send(&bytes);
//! }));
//! server.start();
//! event_loop.run();
//! ```

mod buffer;
mod connection;
mod connector;
mod dispatcher;
mod error;
mod event_loop;
mod listener;
mod loop_thread;
mod poller;
mod server;
mod socket;
mod timer;
mod timestamp;

pub use buffer::Buffer;
pub use connection::{
    CloseCallback, ConnectionCallback, ConnectionState, MessageCallback, TcpConnection,
    WriteCompleteCallback,
};
pub use connector::Connector;
pub use dispatcher::{DispatcherId, EventHandler};
pub use error::Error;
pub use event_loop::{EventLoop, LoopHandle};
pub use listener::{Listener, NewConnectionCallback};
pub use loop_thread::{EventLoopThread, EventLoopThreadPool};
pub use server::TcpServer;
pub use socket::Socket;
pub use timer::{TimerCallback, TimerId};
pub use timestamp::Timestamp;
