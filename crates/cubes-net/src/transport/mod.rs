//! Byte-stream transports the engine runs on.
//!
//! The engine never touches sockets directly. Everything above this module
//! works against [`Transport`] and [`TransportServer`], which come in two
//! backends: plain OS TCP sockets and an in-process pipe for an integrated
//! server and tests.

use std::fmt;
use std::io::{self, Read, Write};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod memory;
pub mod tcp;

pub use memory::{MemoryConnector, MemoryTransport, MemoryTransportServer};
pub use tcp::{SocketConfig, TcpTransport, TcpTransportServer};

/// One live, bidirectional byte stream.
///
/// Shared between a connection's reader and writer threads, so every method
/// takes `&self`.
pub trait Transport: Send + Sync + fmt::Debug {
    /// An independent blocking handle for the inbound half.
    fn reader(&self) -> io::Result<Box<dyn Read + Send>>;

    /// An independent blocking handle for the outbound half.
    fn writer(&self) -> io::Result<Box<dyn Write + Send>>;

    /// Bound blocking reads. `None` or a zero duration blocks forever.
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    fn remote_address(&self) -> String;

    fn is_connected(&self) -> bool;

    /// Close both directions and wake any blocked reader. Idempotent.
    fn close(&self);
}

/// Accepts inbound [`Transport`]s.
pub trait TransportServer: Send + Sync + fmt::Debug {
    /// Block until a peer connects. Fails once [`close`](Self::close) was called.
    fn accept(&self) -> io::Result<Box<dyn Transport>>;

    fn local_address(&self) -> String;

    /// Stop listening and unblock a pending `accept`. Idempotent.
    fn close(&self);
}

/// Which backend a host uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TransportKind {
    /// OS sockets. Used by dedicated, headless servers.
    #[default]
    Tcp,
    /// In-process pipes. Used when client and server share a process.
    Memory,
}

impl TransportKind {
    /// The backend a host should use when it has no explicit preference.
    pub fn for_environment(headless: bool) -> Self {
        if headless {
            TransportKind::Tcp
        } else {
            TransportKind::Memory
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Tcp => f.write_str("tcp"),
            TransportKind::Memory => f.write_str("memory"),
        }
    }
}

/// The OS rejects a zero read timeout; treat it as none.
pub(crate) fn read_timeout(timeout: Option<Duration>) -> Option<Duration> {
    timeout.filter(|t| !t.is_zero())
}

pub(crate) fn closed_error(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, format!("{what} is closed"))
}
