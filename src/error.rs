use std::io;
use std::net::SocketAddr;

/// Errors surfaced by fallible public constructors.
///
/// Per-connection I/O failures are never returned through this type; they
/// are delivered once through the close/error callback path. Invariant
/// violations (double loop per thread, thread-affinity breaches, wakeup or
/// timer descriptor creation failure) panic instead: those invariants
/// cannot be restored at runtime, so the policy is crash over corruption.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Socket creation or option setup failed.
    #[error("socket setup failed: {0}")]
    Socket(#[source] io::Error),
    /// Binding the listening socket failed.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}
