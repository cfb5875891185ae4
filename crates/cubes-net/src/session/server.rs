//! Server side of a session: an accept loop, per-socket handshakes and one
//! monitor per joined client.
//!
//! Accepting and handshaking happen on background threads. Finished
//! connections and disconnect reports travel to the tick thread over
//! channels, so the connection table itself is only touched while ticking.

use std::any::Any;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use tokio::sync::watch;

use crate::catalog::PacketCatalog;
use crate::dispatch::DispatchChain;
use crate::error::NetError;
use crate::factory::PacketFactory;
use crate::handshake::{self, Accepted, DEFAULT_HANDSHAKE_TIMEOUT, Version};
use crate::monitor::{
    ConnectionId, ConnectionMonitor, DisconnectListener, DisconnectReason, IdGenerator,
    MonitorConfig,
};
use crate::packet::{Packet, Priority};
use crate::session::{Networking, NetworkingState, StateWatch};
use crate::side::Side;
use crate::transport::{SocketConfig, TcpTransportServer, Transport, TransportServer};

/// Settings for [`ServerNetworking`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Version announced during the handshake.
    pub version: Version,
    /// How long a new socket may stay silent before it is dropped.
    pub handshake_timeout: Duration,
    /// Joined clients beyond this are closed on arrival. Default: 32.
    pub max_players: usize,
    pub monitor: MonitorConfig,
    /// Namespaces whose packets run their effects, besides `cubes.net.`.
    pub gameplay_namespaces: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            version: Version::current(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            max_players: 32,
            monitor: MonitorConfig::default(),
            gameplay_namespaces: Vec::new(),
        }
    }
}

/// Bind a TCP listener for [`ServerNetworking::start`].
pub fn bind_tcp(addr: SocketAddr, socket: SocketConfig) -> Result<Box<dyn TransportServer>, NetError> {
    TcpTransportServer::bind(addr, socket)
        .map(|server| Box::new(server) as Box<dyn TransportServer>)
        .map_err(|source| NetError::Bind {
            address: addr.to_string(),
            source,
        })
}

type Roster = Arc<RwLock<BTreeMap<ConnectionId, String>>>;

/// Handshakes still in flight: their thread and the socket to close on stop.
type Pending = Arc<Mutex<Vec<(JoinHandle<()>, Arc<dyn Transport>)>>>;

/// Everything the accept and handshake threads need.
struct Acceptor {
    listener: Arc<dyn TransportServer>,
    version: Version,
    handshake_timeout: Duration,
    factory: PacketFactory,
    monitor: MonitorConfig,
    ids: IdGenerator,
    roster: Roster,
    running: Arc<AtomicBool>,
    pending: Pending,
    joined: Sender<ConnectionMonitor>,
    disconnects: Arc<dyn DisconnectListener>,
}

impl Acceptor {
    fn run(self: Arc<Self>) {
        while self.running.load(Ordering::Acquire) {
            let transport: Arc<dyn Transport> = match self.listener.accept() {
                Ok(transport) => Arc::from(transport),
                Err(e) => {
                    if !self.running.load(Ordering::Acquire) {
                        break;
                    }
                    tracing::warn!("accept failed: {e}");
                    thread::sleep(Duration::from_millis(50));
                    continue;
                }
            };

            let remote = transport.remote_address();
            tracing::debug!(%remote, "accepted socket");
            let acceptor = self.clone();
            let socket = transport.clone();
            let spawned = thread::Builder::new()
                .name(format!("handshake-{remote}"))
                .spawn(move || acceptor.handshake(socket));

            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            pending.retain(|(handle, _)| !handle.is_finished());
            match spawned {
                Ok(handle) => pending.push((handle, transport)),
                Err(e) => {
                    tracing::warn!(%remote, "failed to spawn handshake thread: {e}");
                    transport.close();
                }
            }
        }
        tracing::debug!("accept loop exited");
    }

    fn handshake(&self, transport: Arc<dyn Transport>) {
        let remote = transport.remote_address();
        let outcome = handshake::server_accept(
            transport.as_ref(),
            &self.version,
            self.handshake_timeout,
            || self.player_names(),
        );

        match outcome {
            Ok(Accepted::Session) => {}
            Ok(Accepted::Ping) => {
                tracing::debug!(%remote, "answered status query");
                return;
            }
            Err(e) => {
                tracing::debug!(%remote, "handshake failed: {e}");
                return;
            }
        }

        if !self.running.load(Ordering::Acquire) {
            transport.close();
            return;
        }

        let started = ConnectionMonitor::start(
            self.ids.next_id(),
            transport,
            self.factory.clone(),
            &self.monitor,
            self.disconnects.clone(),
        );
        match started {
            // If the session is gone the monitor is dropped, which disposes it.
            Ok(monitor) => {
                let _ = self.joined.send(monitor);
            }
            Err(e) => tracing::warn!(%remote, "failed to start connection: {e}"),
        }
    }

    fn player_names(&self) -> Vec<String> {
        self.roster
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

/// Server session driven by the dedicated server's tick loop.
pub struct ServerNetworking {
    state: StateWatch,
    acceptor: Arc<Acceptor>,
    accept_thread: Option<JoinHandle<()>>,
    max_players: usize,
    connections: BTreeMap<ConnectionId, ConnectionMonitor>,
    joined: Receiver<ConnectionMonitor>,
    disconnects: Receiver<(ConnectionId, DisconnectReason)>,
    chain: Arc<DispatchChain>,
}

impl ServerNetworking {
    /// Start accepting on `listener`.
    pub fn start(
        config: ServerConfig,
        listener: Box<dyn TransportServer>,
        catalog: Arc<PacketCatalog>,
    ) -> Result<Self, NetError> {
        let state = StateWatch::new();
        let (joined_tx, joined) = unbounded();
        let (disconnect_tx, disconnects) = unbounded();
        let report = move |id: ConnectionId, reason: DisconnectReason| {
            let _ = disconnect_tx.send((id, reason));
        };

        let acceptor = Arc::new(Acceptor {
            listener: Arc::from(listener),
            version: config.version,
            handshake_timeout: config.handshake_timeout,
            factory: PacketFactory::new(Side::Server, catalog),
            monitor: config.monitor,
            ids: IdGenerator::new(),
            roster: Arc::default(),
            running: Arc::new(AtomicBool::new(true)),
            pending: Arc::default(),
            joined: joined_tx,
            disconnects: Arc::new(report),
        });

        let address = acceptor.listener.local_address();
        let runner = acceptor.clone();
        let accept_thread = thread::Builder::new()
            .name(format!("accept-{address}"))
            .spawn(move || runner.run())
            .map_err(|source| {
                acceptor.listener.close();
                NetError::Spawn {
                    name: format!("accept-{address}"),
                    source,
                }
            })?;

        let chain = Arc::new(DispatchChain::standard(
            Side::Server,
            config.gameplay_namespaces,
        ));
        state.set(NetworkingState::Running);
        tracing::info!(%address, max_players = config.max_players, "server networking started");

        Ok(Self {
            state,
            acceptor,
            accept_thread: Some(accept_thread),
            max_players: config.max_players,
            connections: BTreeMap::new(),
            joined,
            disconnects,
            chain,
        })
    }

    pub fn state(&self) -> NetworkingState {
        self.state.current()
    }

    /// Receiver that observes every state change.
    pub fn subscribe(&self) -> watch::Receiver<NetworkingState> {
        self.state.subscribe()
    }

    pub fn local_address(&self) -> String {
        self.acceptor.listener.local_address()
    }

    /// Replace the dispatch chain used from the next tick on.
    pub fn set_chain(&mut self, chain: DispatchChain) {
        self.chain = Arc::new(chain);
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().copied().collect()
    }

    /// Display names announced by joined clients, by connection order.
    pub fn display_names(&self) -> Vec<String> {
        self.acceptor.player_names()
    }

    pub fn display_name(&self, connection: ConnectionId) -> Option<String> {
        self.acceptor
            .roster
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&connection)
            .cloned()
    }

    /// Queue `packet` for one connection at an explicit priority.
    pub fn send_with_priority(
        &mut self,
        connection: ConnectionId,
        packet: Box<dyn Packet>,
        priority: Priority,
    ) -> bool {
        let state = self.state();
        if state != NetworkingState::Running {
            tracing::warn!(packet = %packet.kind(), "cannot send while {state}");
            return false;
        }
        match self.connections.get(&connection) {
            Some(monitor) => monitor.handle().send_with_priority(packet, priority),
            None => {
                tracing::debug!(%connection, packet = %packet.kind(), "no such connection");
                false
            }
        }
    }

    /// Queue `packet` for every joined connection.
    pub fn broadcast<P: Packet + Clone>(&mut self, packet: P) -> usize {
        self.broadcast_filtered(packet, |_| true)
    }

    /// Queue `packet` for every joined connection except `except`.
    pub fn broadcast_except<P: Packet + Clone>(&mut self, packet: P, except: ConnectionId) -> usize {
        self.broadcast_filtered(packet, |id| id != except)
    }

    fn broadcast_filtered<P: Packet + Clone>(
        &mut self,
        packet: P,
        include: impl Fn(ConnectionId) -> bool,
    ) -> usize {
        let targets: Vec<ConnectionId> = self
            .connections
            .keys()
            .copied()
            .filter(|id| include(*id))
            .collect();
        let priority = packet.priority();
        targets
            .into_iter()
            .filter(|id| self.send_with_priority(*id, Box::new(packet.clone()), priority))
            .count()
    }

    /// Close one connection from this side.
    pub fn kick(&mut self, connection: ConnectionId) {
        self.remove(connection, None);
    }

    fn remove(&mut self, connection: ConnectionId, reason: Option<DisconnectReason>) {
        let Some(mut monitor) = self.connections.remove(&connection) else {
            return;
        };
        monitor.dispose();
        let name = self
            .acceptor
            .roster
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&connection);
        let who = name.unwrap_or_else(|| monitor.remote_address().to_string());
        match reason {
            Some(reason) => tracing::info!(%connection, "{who} disconnected: {reason}"),
            None => tracing::info!(%connection, "{who} was kicked"),
        }
    }

    /// One simulation step: adopt new connections, dispatch everything they
    /// sent, then drop the ones that died.
    pub fn tick(&mut self, state: &mut (dyn Any + 'static)) {
        if self.state() != NetworkingState::Running {
            return;
        }

        while let Ok(monitor) = self.joined.try_recv() {
            // Died before adoption.
            if !monitor.is_running() {
                continue;
            }
            if self.connections.len() >= self.max_players {
                tracing::info!(remote = %monitor.remote_address(), "server full, refusing connection");
                continue;
            }
            tracing::info!(connection = %monitor.id(), remote = %monitor.remote_address(), "client joined");
            self.connections.insert(monitor.id(), monitor);
        }

        let inbound: Vec<_> = self
            .connections
            .values()
            .flat_map(ConnectionMonitor::drain_inbound)
            .collect();
        let chain = self.chain.clone();
        for packet in inbound {
            chain.dispatch(packet, self, state);
        }

        while let Ok((connection, reason)) = self.disconnects.try_recv() {
            self.remove(connection, Some(reason));
        }
    }

    /// Stop accepting, close every connection and wait for all threads.
    /// No-op unless running.
    pub fn stop(&mut self) {
        if !self
            .state
            .transition(NetworkingState::Running, NetworkingState::Stopping)
        {
            return;
        }
        tracing::info!("stopping server networking");

        self.acceptor.running.store(false, Ordering::Release);
        self.acceptor.listener.close();
        if let Some(handle) = self.accept_thread.take() {
            if handle.join().is_err() {
                tracing::warn!("accept thread panicked");
            }
        }

        let pending: Vec<_> = self
            .acceptor
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for (handle, transport) in pending {
            transport.close();
            let _ = handle.join();
        }

        for (_, mut monitor) in std::mem::take(&mut self.connections) {
            monitor.dispose();
        }
        for mut monitor in self.joined.try_iter() {
            monitor.dispose();
        }
        self.acceptor
            .roster
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        self.state.set(NetworkingState::Stopped);
        tracing::info!("server networking stopped");
    }
}

impl Networking for ServerNetworking {
    fn side(&self) -> Side {
        Side::Server
    }

    fn state(&self) -> NetworkingState {
        ServerNetworking::state(self)
    }

    fn send_to(&mut self, connection: ConnectionId, packet: Box<dyn Packet>) {
        let priority = packet.priority();
        self.send_with_priority(connection, packet, priority);
    }

    fn identify(&mut self, connection: ConnectionId, display_name: String) {
        if !self.connections.contains_key(&connection) {
            return;
        }
        tracing::info!(%connection, "{display_name} joined the game");
        self.acceptor
            .roster
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(connection, display_name);
    }
}

impl Drop for ServerNetworking {
    fn drop(&mut self) {
        self.stop();
    }
}
