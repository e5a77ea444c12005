//! End-to-end echo: accept, read, echo back, both with a raw peer and
//! with the crate's own client-side stack.

use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use polliwog::{Connector, EventLoopThread, TcpConnection, TcpServer};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}

fn echo_server(threads: usize) -> (EventLoopThread, Arc<TcpServer>) {
    let server_thread = EventLoopThread::spawn("echo-server");
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let server = TcpServer::new(server_thread.handle(), addr, "echo", threads).unwrap();
    server.set_message_callback(Arc::new(|conn, input, _when| {
        let bytes = input.peek().to_vec();
        input.retrieve_all();
        conn.send(&bytes);
    }));
    server.start();
    (server_thread, server)
}

#[test]
fn test_echo_round_trip() {
    init_logging();
    let server_thread = EventLoopThread::spawn("echo-server");
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let server = TcpServer::new(server_thread.handle(), addr, "echo", 1).unwrap();

    let connected = Arc::new(AtomicBool::new(false));
    let flag = connected.clone();
    server.set_connection_callback(Arc::new(move |conn| {
        if conn.connected() {
            flag.store(true, Ordering::SeqCst);
        }
    }));
    let first_read_len = Arc::new(AtomicUsize::new(0));
    let len = first_read_len.clone();
    server.set_message_callback(Arc::new(move |conn, input, _when| {
        len.store(input.readable_bytes(), Ordering::SeqCst);
        let bytes = input.peek().to_vec();
        input.retrieve_all();
        conn.send(&bytes);
    }));
    server.start();

    let mut stream = std::net::TcpStream::connect(server.local_addr()).unwrap();
    stream.write_all(b"ping").unwrap();
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"ping");

    assert!(connected.load(Ordering::SeqCst));
    assert_eq!(first_read_len.load(Ordering::SeqCst), 4);
    assert!(wait_until(Duration::from_secs(1), || {
        server.connection_count() == 1
    }));

    drop(stream);
    assert!(wait_until(Duration::from_secs(2), || {
        server.connection_count() == 0
    }));
}

#[test]
fn test_connector_client_round_trip() {
    init_logging();
    let (_server_thread, server) = echo_server(1);

    let client_thread = EventLoopThread::spawn("echo-client");
    let client_handle = client_thread.handle();
    let connector = Connector::new(client_handle.clone(), server.local_addr());

    let response: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let client_conn: Arc<Mutex<Option<Arc<TcpConnection>>>> = Arc::new(Mutex::new(None));

    let resp = response.clone();
    let slot = client_conn.clone();
    connector.set_new_connection_callback(Box::new(move |socket, peer| {
        // Runs on the client loop's thread.
        let local = socket.local_addr().unwrap();
        let conn = TcpConnection::new(
            "echo-client_1".to_string(),
            client_handle.clone(),
            socket,
            local,
            peer,
        );
        let resp = resp.clone();
        conn.set_message_callback(Arc::new(move |_conn, input, _when| {
            let bytes = input.peek().to_vec();
            input.retrieve_all();
            resp.lock().extend_from_slice(&bytes);
        }));
        conn.connection_established();
        conn.send(b"ping");
        *slot.lock() = Some(conn);
    }));
    connector.start();

    assert!(wait_until(Duration::from_secs(3), || {
        response.lock().as_slice() == b"ping"
    }));
    let conn = client_conn.lock().clone().unwrap();
    assert!(conn.connected());

    // Orderly client teardown on its own loop.
    let done = conn.clone();
    client_thread.handle().run_in_loop(move || {
        done.connection_closed();
    });
}

#[test]
fn test_connections_spread_over_pool() {
    init_logging();
    let (_server_thread, server) = echo_server(2);

    let mut streams = Vec::new();
    for _ in 0..4 {
        streams.push(std::net::TcpStream::connect(server.local_addr()).unwrap());
    }
    assert!(wait_until(Duration::from_secs(2), || {
        server.connection_count() == 4
    }));

    // Every connection still echoes regardless of which loop it landed on.
    for (i, stream) in streams.iter_mut().enumerate() {
        let msg = format!("msg-{i}");
        stream.write_all(msg.as_bytes()).unwrap();
        let mut buf = vec![0u8; msg.len()];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(buf, msg.as_bytes());
    }
}
