//! Owned non-blocking TCP socket plus the syscall helpers the state
//! machines need.
//!
//! Sockets are created non-blocking and close-on-exec; the fd is closed on
//! drop. Everything socket2 covers goes through socket2, the rest
//! (TCP_NODELAY, SO_ERROR interpretation, self-connect detection) through
//! libc.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};

use socket2::{Domain, Protocol, SockAddr, Type};

/// An owned, non-blocking TCP socket.
#[derive(Debug)]
pub struct Socket {
    inner: socket2::Socket,
}

impl Socket {
    /// Create a non-blocking stream socket of the right family for `addr`.
    pub fn for_addr(addr: &SocketAddr) -> io::Result<Socket> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let inner = socket2::Socket::new(domain, Type::STREAM.nonblocking(), Some(Protocol::TCP))?;
        Ok(Socket { inner })
    }

    pub(crate) fn from_socket2(inner: socket2::Socket) -> Socket {
        Socket { inner }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }

    pub fn bind(&self, addr: &SocketAddr) -> io::Result<()> {
        self.inner.bind(&SockAddr::from(*addr))
    }

    pub fn listen(&self, backlog: i32) -> io::Result<()> {
        self.inner.listen(backlog)
    }

    /// Accept one pending connection; the accepted socket is made
    /// non-blocking before it is returned.
    pub fn accept(&self) -> io::Result<(Socket, SocketAddr)> {
        let (sock, addr) = self.inner.accept()?;
        sock.set_nonblocking(true)?;
        let peer = addr.as_socket().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "accepted non-inet peer address")
        })?;
        Ok((Socket { inner: sock }, peer))
    }

    /// Start a non-blocking connect. `EINPROGRESS` comes back as an error;
    /// the caller's state machine interprets the errno.
    pub fn connect(&self, addr: &SocketAddr) -> io::Result<()> {
        self.inner.connect(&SockAddr::from(*addr))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()?.as_socket().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "non-inet local address")
        })
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()?.as_socket().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "non-inet peer address")
        })
    }

    pub fn set_reuse_addr(&self, on: bool) -> io::Result<()> {
        self.inner.set_reuse_address(on)
    }

    pub fn set_tcp_nodelay(&self, on: bool) -> io::Result<()> {
        let optval: libc::c_int = on as libc::c_int;
        let rc = unsafe {
            libc::setsockopt(
                self.fd(),
                libc::IPPROTO_TCP,
                libc::TCP_NODELAY,
                &optval as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Half-close: shut down the write direction only.
    pub fn shutdown_write(&self) -> io::Result<()> {
        self.inner.shutdown(std::net::Shutdown::Write)
    }

    /// Fetch and clear the pending socket error (`SO_ERROR`).
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        self.inner.take_error()
    }

    /// A non-blocking connect can spuriously connect a socket to itself
    /// when the OS reuses an ephemeral port.
    pub fn is_self_connect(&self) -> bool {
        match (self.local_addr(), self.peer_addr()) {
            (Ok(local), Ok(peer)) => local == peer,
            _ => false,
        }
    }

    /// Write as much as the OS accepts; `WouldBlock` surfaces as an error.
    pub fn write(&self, data: &[u8]) -> io::Result<usize> {
        self.inner.send(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_ephemeral_and_local_addr() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let sock = Socket::for_addr(&addr).unwrap();
        sock.set_reuse_addr(true).unwrap();
        sock.bind(&addr).unwrap();
        let local = sock.local_addr().unwrap();
        assert_ne!(local.port(), 0);
    }

    #[test]
    fn test_nonblocking_connect_reports_in_progress() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = Socket::for_addr(&addr).unwrap();
        listener.bind(&addr).unwrap();
        listener.listen(1).unwrap();
        let target = listener.local_addr().unwrap();

        let client = Socket::for_addr(&target).unwrap();
        match client.connect(&target) {
            Ok(()) => {}
            Err(e) => {
                assert_eq!(e.raw_os_error(), Some(libc::EINPROGRESS));
            }
        }
    }

    #[test]
    fn test_take_error_initially_clear() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let sock = Socket::for_addr(&addr).unwrap();
        assert!(sock.take_error().unwrap().is_none());
    }
}
