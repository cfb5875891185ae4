//! Client side of a session: one connection to one server.

use std::any::Any;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::catalog::PacketCatalog;
use crate::dispatch::DispatchChain;
use crate::error::NetError;
use crate::factory::PacketFactory;
use crate::handshake::{self, DEFAULT_HANDSHAKE_TIMEOUT, ServerStatus, Version};
use crate::monitor::{ConnectionId, ConnectionMonitor, DisconnectListener, DisconnectReason, MonitorConfig};
use crate::packet::{Packet, Priority};
use crate::packets::{Connect, PingRequest};
use crate::session::{Networking, NetworkingState, StateWatch};
use crate::side::Side;
use crate::transport::Transport;

/// Settings for [`ClientNetworking`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Name announced to the server after connecting.
    pub display_name: String,
    /// Version offered during the handshake.
    pub version: Version,
    /// Bound on waiting for the server's handshake answer.
    pub handshake_timeout: Duration,
    /// Simulated time between heartbeats. Default: 10s.
    pub ping_interval: Duration,
    /// Ticks per simulated second. Default: 20.
    pub tick_rate: u32,
    pub monitor: MonitorConfig,
    /// Namespaces whose packets run their effects, besides `cubes.net.`.
    pub gameplay_namespaces: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            display_name: "Player".to_string(),
            version: Version::current(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            ping_interval: Duration::from_secs(10),
            tick_rate: 20,
            monitor: MonitorConfig::default(),
            gameplay_namespaces: Vec::new(),
        }
    }
}

impl ClientConfig {
    /// Heartbeat period in ticks. Never zero.
    pub fn ping_interval_ticks(&self) -> u64 {
        let millis = u64::try_from(self.ping_interval.as_millis()).unwrap_or(u64::MAX);
        let ticks = millis.saturating_mul(u64::from(self.tick_rate)) / 1000;
        ticks.max(1)
    }
}

/// State the connection's I/O threads may touch.
#[derive(Debug, Default)]
struct ClientShared {
    state: StateWatch,
    failure: Mutex<Option<DisconnectReason>>,
}

impl ClientShared {
    /// Keep only the first reason.
    fn record_failure(&self, reason: DisconnectReason) {
        let mut failure = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
        if failure.is_none() {
            *failure = Some(reason);
        }
    }
}

impl DisconnectListener for ClientShared {
    fn disconnected(&self, _connection: ConnectionId, reason: DisconnectReason) {
        self.record_failure(reason);
        self.state
            .transition(NetworkingState::Running, NetworkingState::Stopping);
    }
}

/// Client session driven by the game's tick loop.
pub struct ClientNetworking {
    config: ClientConfig,
    catalog: Arc<PacketCatalog>,
    shared: Arc<ClientShared>,
    monitor: Option<ConnectionMonitor>,
    chain: Arc<DispatchChain>,
    server_version: Option<Version>,
    ping_interval_ticks: u64,
    ticks: u64,
    ping_sent_at: Option<Instant>,
    ping_time: Option<Duration>,
}

impl ClientNetworking {
    /// Session in `Starting`, not yet connected.
    ///
    /// Subscribe before [`start`](Self::start) to observe a failed handshake.
    pub fn new(config: ClientConfig, catalog: Arc<PacketCatalog>) -> Self {
        let chain = Arc::new(DispatchChain::standard(
            Side::Client,
            config.gameplay_namespaces.iter().cloned(),
        ));
        let ping_interval_ticks = config.ping_interval_ticks();
        Self {
            config,
            catalog,
            shared: Arc::new(ClientShared::default()),
            monitor: None,
            chain,
            server_version: None,
            ping_interval_ticks,
            ticks: 0,
            ping_sent_at: None,
            ping_time: None,
        }
    }

    /// Handshake over `transport`, start the connection and announce ourselves.
    ///
    /// A rejected or timed out handshake closes the transport, records
    /// [`DisconnectReason::Handshake`] as the failure and leaves the session
    /// `Stopped`.
    pub fn start(&mut self, transport: Box<dyn Transport>) -> Result<(), NetError> {
        let state = self.state();
        if state != NetworkingState::Starting {
            return Err(NetError::InvalidState(state, NetworkingState::Starting));
        }

        let transport: Arc<dyn Transport> = Arc::from(transport);
        let remote = transport.remote_address();

        let server_version = match handshake::client_connect(
            transport.as_ref(),
            &self.config.version,
            Some(self.config.handshake_timeout),
        ) {
            Ok(version) => version,
            Err(e) => {
                tracing::warn!(%remote, error = %e, "handshake failed");
                self.shared.record_failure(DisconnectReason::Handshake(e.to_string()));
                self.shared.state.set(NetworkingState::Stopped);
                return Err(e.into());
            }
        };

        let monitor = ConnectionMonitor::start(
            ConnectionId(1),
            transport,
            PacketFactory::new(Side::Client, self.catalog.clone()),
            &self.config.monitor,
            self.shared.clone(),
        )
        .inspect_err(|_| self.shared.state.set(NetworkingState::Stopped))?;

        self.monitor = Some(monitor);
        tracing::info!(%remote, %server_version, "connected");
        self.server_version = Some(server_version);
        self.shared.state.set(NetworkingState::Running);

        let hello = Connect {
            display_name: self.config.display_name.clone(),
        };
        self.send(Box::new(hello));
        Ok(())
    }

    /// [`new`](Self::new) followed by [`start`](Self::start).
    pub fn connect(
        config: ClientConfig,
        transport: Box<dyn Transport>,
        catalog: Arc<PacketCatalog>,
    ) -> Result<Self, NetError> {
        let mut client = Self::new(config, catalog);
        client.start(transport)?;
        Ok(client)
    }

    /// Ask a server for its version and player list without joining.
    pub fn query(transport: Box<dyn Transport>, timeout: Duration) -> Result<ServerStatus, NetError> {
        Ok(handshake::client_query(transport.as_ref(), Some(timeout))?)
    }

    pub fn state(&self) -> NetworkingState {
        self.shared.state.current()
    }

    /// Receiver that observes every state change.
    pub fn subscribe(&self) -> watch::Receiver<NetworkingState> {
        self.shared.state.subscribe()
    }

    /// Why the connection was lost, if it was.
    pub fn failure(&self) -> Option<DisconnectReason> {
        self.shared
            .failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Round-trip time of the last answered heartbeat.
    pub fn ping_time(&self) -> Option<Duration> {
        self.ping_time
    }

    /// Version the server answered with. `None` until connected.
    pub fn server_version(&self) -> Option<&Version> {
        self.server_version.as_ref()
    }

    pub fn remote_address(&self) -> Option<&str> {
        self.monitor.as_ref().map(ConnectionMonitor::remote_address)
    }

    /// Replace the dispatch chain used from the next tick on.
    pub fn set_chain(&mut self, chain: DispatchChain) {
        self.chain = Arc::new(chain);
    }

    /// Queue `packet` at its default priority.
    pub fn send(&mut self, packet: Box<dyn Packet>) -> bool {
        let priority = packet.priority();
        self.send_with_priority(packet, priority)
    }

    /// Queue `packet` at `priority`. Dropped with a warning unless running.
    pub fn send_with_priority(&mut self, packet: Box<dyn Packet>, priority: Priority) -> bool {
        let state = self.state();
        match &self.monitor {
            Some(monitor) if state == NetworkingState::Running => {
                monitor.handle().send_with_priority(packet, priority)
            }
            _ => {
                tracing::warn!(packet = %packet.kind(), "cannot send while {state}");
                false
            }
        }
    }

    /// Run one simulation step: dispatch everything received, then heartbeat.
    pub fn tick(&mut self, state: &mut (dyn Any + 'static)) {
        match self.state() {
            NetworkingState::Running => {}
            NetworkingState::Stopping => return self.teardown(),
            NetworkingState::Starting | NetworkingState::Stopped => return,
        }

        let inbound = match &self.monitor {
            Some(monitor) => monitor.drain_inbound(),
            None => return,
        };
        let chain = self.chain.clone();
        for packet in inbound {
            chain.dispatch(packet, self, state);
        }

        self.heartbeat();
    }

    fn heartbeat(&mut self) {
        self.ticks += 1;
        if self.ticks % self.ping_interval_ticks != 0 {
            return;
        }
        if self.ping_sent_at.is_some() {
            self.disconnected(DisconnectReason::NoPingResponse);
            return;
        }
        self.ping_sent_at = Some(Instant::now());
        self.send(Box::new(PingRequest));
    }

    /// Record a fatal connection problem and move to `Stopping`.
    ///
    /// Idempotent; only the first reason is kept. Teardown happens on the
    /// next tick.
    pub fn disconnected(&mut self, reason: DisconnectReason) {
        if self.state() == NetworkingState::Running {
            tracing::info!(%reason, "disconnected");
        }
        self.shared.disconnected(ConnectionId(1), reason);
    }

    /// Stop the session. No-op unless running.
    pub fn stop(&mut self) {
        if !self
            .shared
            .state
            .transition(NetworkingState::Running, NetworkingState::Stopping)
        {
            return;
        }
        tracing::info!("stopping client networking");
        self.teardown();
    }

    fn teardown(&mut self) {
        if let Some(mut monitor) = self.monitor.take() {
            monitor.dispose();
        }
        self.ping_sent_at = None;
        self.shared.state.set(NetworkingState::Stopped);
    }

    pub fn inspect_outbound(&self, max_items: usize) -> Vec<String> {
        self.monitor
            .as_ref()
            .map(|m| m.inspect_outbound(max_items))
            .unwrap_or_default()
    }

    pub fn inspect_inbound(&self, max_items: usize) -> Vec<String> {
        self.monitor
            .as_ref()
            .map(|m| m.inspect_inbound(max_items))
            .unwrap_or_default()
    }
}

impl Networking for ClientNetworking {
    fn side(&self) -> Side {
        Side::Client
    }

    fn state(&self) -> NetworkingState {
        ClientNetworking::state(self)
    }

    fn send_to(&mut self, _connection: ConnectionId, packet: Box<dyn Packet>) {
        self.send(packet);
    }

    fn ping_reply_received(&mut self) {
        if let Some(sent_at) = self.ping_sent_at.take() {
            let rtt = sent_at.elapsed();
            tracing::debug!(rtt_ms = u64::try_from(rtt.as_millis()).unwrap_or(u64::MAX), "ping reply");
            self.ping_time = Some(rtt);
        }
    }
}

impl Drop for ClientNetworking {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_interval_in_ticks() {
        let config = ClientConfig::default();
        assert_eq!(config.ping_interval_ticks(), 200);

        let fast = ClientConfig {
            ping_interval: Duration::from_millis(10),
            tick_rate: 20,
            ..ClientConfig::default()
        };
        assert_eq!(fast.ping_interval_ticks(), 1);
    }

    #[test]
    fn test_ping_interval_saturates() {
        let forever = ClientConfig {
            ping_interval: Duration::MAX,
            tick_rate: u32::MAX,
            ..ClientConfig::default()
        };
        assert_eq!(forever.ping_interval_ticks(), u64::MAX / 1000);
    }

    #[test]
    fn test_listener_keeps_first_reason() {
        let shared = ClientShared::default();
        shared.state.set(NetworkingState::Running);
        shared.disconnected(ConnectionId(1), DisconnectReason::RemoteClosed);
        shared.disconnected(ConnectionId(1), DisconnectReason::NoPingResponse);

        assert_eq!(shared.state.current(), NetworkingState::Stopping);
        assert_eq!(
            *shared.failure.lock().unwrap(),
            Some(DisconnectReason::RemoteClosed)
        );
    }
}
