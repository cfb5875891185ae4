//! Networking sessions: the client and server orchestrators the tick loop drives.

use std::fmt;

use tokio::sync::watch;

use crate::monitor::ConnectionId;
use crate::packet::Packet;
use crate::side::Side;

pub mod client;
pub mod server;

pub use client::{ClientConfig, ClientNetworking};
pub use server::{ServerConfig, ServerNetworking};

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NetworkingState {
    /// Handshake or bind in progress.
    #[default]
    Starting,
    /// Connections live, heartbeat active. The only state that accepts sends.
    Running,
    /// Teardown requested or a fatal error observed.
    Stopping,
    /// All I/O threads have exited.
    Stopped,
}

impl fmt::Display for NetworkingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkingState::Starting => f.write_str("starting"),
            NetworkingState::Running => f.write_str("running"),
            NetworkingState::Stopping => f.write_str("stopping"),
            NetworkingState::Stopped => f.write_str("stopped"),
        }
    }
}

/// Observable session state backed by a [`watch`] channel.
///
/// Written from the tick thread and, for the `Running -> Stopping` edge, from
/// I/O threads reporting a disconnect.
#[derive(Debug)]
pub struct StateWatch {
    tx: watch::Sender<NetworkingState>,
    rx: watch::Receiver<NetworkingState>,
}

impl Default for StateWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl StateWatch {
    /// Create a new watch initialised to [`NetworkingState::Starting`].
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(NetworkingState::Starting);
        Self { tx, rx }
    }

    /// Set the state unconditionally, notifying subscribers on change.
    pub fn set(&self, state: NetworkingState) {
        self.tx.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
    }

    /// Move `from -> to` atomically. Returns whether the transition happened.
    pub fn transition(&self, from: NetworkingState, to: NetworkingState) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == from {
                *current = to;
                true
            } else {
                false
            }
        })
    }

    /// Return a new subscriber receiver.
    pub fn subscribe(&self) -> watch::Receiver<NetworkingState> {
        self.tx.subscribe()
    }

    /// Return the current state without blocking.
    pub fn current(&self) -> NetworkingState {
        *self.rx.borrow()
    }
}

/// What packet effects see of the session dispatching them.
pub trait Networking {
    fn side(&self) -> Side;

    fn state(&self) -> NetworkingState;

    /// Queue `packet` for `connection`. Dropped with a warning unless running.
    fn send_to(&mut self, connection: ConnectionId, packet: Box<dyn Packet>);

    /// A heartbeat reply arrived. Only meaningful on the client.
    fn ping_reply_received(&mut self) {}

    /// A connection announced its display name. Only meaningful on the server.
    fn identify(&mut self, _connection: ConnectionId, _display_name: String) {}
}
