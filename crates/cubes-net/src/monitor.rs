//! One live connection: a reader thread, a writer thread and two queues.
//!
//! The reader decodes frames into packets and pushes them onto the inbound
//! queue, which the tick thread drains. The writer takes packets off the
//! outbound queue in its ordering and writes them. The queues are the only
//! state shared with the tick thread. A failure on either thread is reported
//! to the [`DisconnectListener`] exactly once; a local [`dispose`] is not
//! reported at all.
//!
//! [`dispose`]: ConnectionMonitor::dispose

use std::fmt;
use std::io::{BufReader, BufWriter, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use crate::error::{NetError, ProtocolError};
use crate::factory::{PacketFactory, Received};
use crate::framing::{FrameConfig, FrameError, read_frame, write_frame};
use crate::packet::{Inbound, Outbound, Packet, Priority};
use crate::queue::{FifoQueue, PacketQueue, QueueOrdering};
use crate::registry::PacketIdRegistry;
use crate::side::Side;
use crate::transport::Transport;

/// Unique identifier for a connection within one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Atomic generator for monotonically increasing [`ConnectionId`]s.
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    /// Create a new generator starting at 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Return the next unique [`ConnectionId`].
    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Why a connection ended. Shown to whoever watches the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer closed the stream.
    RemoteClosed,
    /// A read or write failed.
    Io(String),
    /// The peer sent something this side cannot decode.
    Protocol(String),
    /// A heartbeat went unanswered for a whole interval.
    NoPingResponse,
    /// Connection establishment failed.
    Handshake(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::RemoteClosed => f.write_str("connection closed by remote"),
            DisconnectReason::Io(msg) => write!(f, "connection error: {msg}"),
            DisconnectReason::Protocol(msg) => write!(f, "protocol error: {msg}"),
            DisconnectReason::NoPingResponse => f.write_str("no ping response"),
            DisconnectReason::Handshake(msg) => write!(f, "handshake failed: {msg}"),
        }
    }
}

impl From<FrameError> for DisconnectReason {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::ConnectionClosed => DisconnectReason::RemoteClosed,
            FrameError::Io(e) => DisconnectReason::Io(e.to_string()),
            other => DisconnectReason::Protocol(other.to_string()),
        }
    }
}

impl From<ProtocolError> for DisconnectReason {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Frame(frame) => frame.into(),
            other => DisconnectReason::Protocol(other.to_string()),
        }
    }
}

/// Receives the single disconnect notification of a connection.
///
/// Called from the connection's I/O thread; implementations must only record
/// the event and leave teardown to the tick thread.
pub trait DisconnectListener: Send + Sync {
    fn disconnected(&self, connection: ConnectionId, reason: DisconnectReason);
}

impl<F> DisconnectListener for F
where
    F: Fn(ConnectionId, DisconnectReason) + Send + Sync,
{
    fn disconnected(&self, connection: ConnectionId, reason: DisconnectReason) {
        self(connection, reason)
    }
}

/// Cloneable reference to a connection's outbound side.
///
/// Every inbound packet carries one, so effects can answer on the connection
/// the packet arrived on.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    side: Side,
    remote: Arc<str>,
    outbound: Arc<dyn PacketQueue<Outbound>>,
}

impl ConnectionHandle {
    pub(crate) fn new(
        id: ConnectionId,
        side: Side,
        remote: &str,
        outbound: Arc<dyn PacketQueue<Outbound>>,
    ) -> Self {
        Self {
            id,
            side,
            remote: remote.into(),
            outbound,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_address(&self) -> &str {
        &self.remote
    }

    /// Whether the outbound queue still accepts packets.
    pub fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }

    /// Queue `packet` at its default priority. Returns whether it was queued.
    pub fn send(&self, packet: Box<dyn Packet>) -> bool {
        let priority = packet.priority();
        self.send_with_priority(packet, priority)
    }

    /// Queue `packet` at an explicit priority. Returns whether it was queued.
    ///
    /// Types this side may not send are dropped here rather than failing the
    /// connection later in the writer.
    pub fn send_with_priority(&self, packet: Box<dyn Packet>, priority: Priority) -> bool {
        let kind = packet.kind();
        if !kind.direction.can_send(self.side) {
            tracing::warn!(
                connection = %self.id,
                packet = %kind,
                "refusing to send {} packet from the {}",
                kind.direction,
                self.side
            );
            return false;
        }
        match self.outbound.push(Outbound::with_priority(packet, priority)) {
            Ok(()) => true,
            Err(rejected) => {
                tracing::debug!(connection = %self.id, packet = ?rejected.0, "connection closed, dropping packet");
                false
            }
        }
    }

    /// Debug listing of the queued outbound packets.
    pub fn inspect_outbound(&self, max_items: usize) -> Vec<String> {
        self.outbound.inspect(max_items)
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("queued", &self.outbound.len())
            .finish()
    }
}

/// Per-connection tunables.
#[derive(Debug, Clone, Default)]
pub struct MonitorConfig {
    pub frame: FrameConfig,
    pub outbound_ordering: QueueOrdering,
}

/// State shared by the two I/O threads and the owning monitor.
struct Shared {
    handle: ConnectionHandle,
    transport: Arc<dyn Transport>,
    inbound: Arc<FifoQueue<Inbound>>,
    registry: Mutex<PacketIdRegistry>,
    factory: PacketFactory,
    frame: FrameConfig,
    listener: Arc<dyn DisconnectListener>,
    running: AtomicBool,
}

impl Shared {
    /// Stop both loops. Only the first caller reports.
    fn shut(&self) -> bool {
        let was_running = self.running.swap(false, Ordering::AcqRel);
        self.transport.close();
        self.handle.outbound.close();
        self.inbound.close();
        was_running
    }

    fn fail(&self, reason: DisconnectReason) {
        if self.shut() {
            tracing::info!(
                connection = %self.handle.id,
                remote = %self.handle.remote,
                %reason,
                "connection lost"
            );
            self.listener.disconnected(self.handle.id, reason);
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn read_loop(&self) {
        let stream = match self.transport.reader() {
            Ok(stream) => stream,
            Err(e) => return self.fail(DisconnectReason::Io(e.to_string())),
        };
        let mut reader = BufReader::new(stream);

        while self.is_running() {
            let frame = match read_frame(&mut reader, &self.frame) {
                Ok(frame) => frame,
                Err(e) => return self.fail(e.into()),
            };

            let received = {
                let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
                self.factory.decode_frame(&mut registry, frame)
            };

            match received {
                Ok(Received::Learned { name, tag }) => {
                    tracing::trace!(connection = %self.handle.id, %name, tag, "learned tag");
                }
                Ok(Received::Packet { packet, announce }) => {
                    if let Some(assignment) = announce {
                        let _ = self
                            .handle
                            .outbound
                            .push(Outbound::with_priority(Box::new(assignment), Priority::URGENT));
                    }
                    let inbound = Inbound {
                        connection: self.handle.clone(),
                        packet,
                    };
                    if self.inbound.push(inbound).is_err() {
                        return;
                    }
                }
                Err(e) => return self.fail(e.into()),
            }
        }
    }

    fn write_loop(&self) {
        let stream = match self.transport.writer() {
            Ok(stream) => stream,
            Err(e) => return self.fail(DisconnectReason::Io(e.to_string())),
        };
        let mut writer = BufWriter::new(stream);

        while let Some(outbound) = self.handle.outbound.take() {
            let frames = {
                let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
                self.factory.encode(&mut registry, outbound.packet.as_ref())
            };

            let frames = match frames {
                Ok(frames) => frames,
                // Nothing was written or bound, so the stream is still in sync.
                Err(ProtocolError::Encode { name, source }) => {
                    tracing::warn!(connection = %self.handle.id, packet = name, "dropping unencodable packet: {source}");
                    continue;
                }
                Err(e @ ProtocolError::Oversized { .. }) => {
                    tracing::warn!(connection = %self.handle.id, "dropping packet: {e}");
                    continue;
                }
                Err(e) => return self.fail(e.into()),
            };

            let written = frames
                .iter()
                .try_for_each(|(header, payload)| write_frame(&mut writer, header, payload, &self.frame))
                .and_then(|()| writer.flush().map_err(FrameError::from));
            if let Err(e) = written {
                return self.fail(e.into());
            }
        }
    }
}

/// Owner of one live connection.
pub struct ConnectionMonitor {
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
}

impl ConnectionMonitor {
    /// Take over `transport` and start its reader and writer threads.
    pub fn start(
        id: ConnectionId,
        transport: Arc<dyn Transport>,
        factory: PacketFactory,
        config: &MonitorConfig,
        listener: Arc<dyn DisconnectListener>,
    ) -> Result<Self, NetError> {
        let handle = ConnectionHandle::new(
            id,
            factory.side(),
            &transport.remote_address(),
            config.outbound_ordering.build(),
        );
        let shared = Arc::new(Shared {
            handle,
            transport,
            inbound: Arc::new(FifoQueue::new()),
            registry: Mutex::new(PacketIdRegistry::new()),
            factory: factory.with_frame_limit(&config.frame),
            frame: config.frame.clone(),
            listener,
            running: AtomicBool::new(true),
        });

        let mut monitor = Self {
            shared,
            threads: Vec::with_capacity(2),
        };
        monitor.spawn("reader", Shared::read_loop)?;
        monitor.spawn("writer", Shared::write_loop)?;
        tracing::debug!(connection = %id, remote = %monitor.shared.handle.remote, "connection monitor started");
        Ok(monitor)
    }

    fn spawn(&mut self, role: &str, body: fn(&Shared)) -> Result<(), NetError> {
        let name = format!("conn-{}-{role}", self.shared.handle.id.0);
        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name(name.clone())
            .spawn(move || body(&shared));
        match spawned {
            Ok(handle) => {
                self.threads.push(handle);
                Ok(())
            }
            Err(source) => {
                self.dispose();
                Err(NetError::Spawn { name, source })
            }
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.shared.handle.id
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.shared.handle
    }

    pub fn remote_address(&self) -> &str {
        self.shared.handle.remote_address()
    }

    /// Whether both loops are still meant to run.
    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Everything received since the last call, in arrival order.
    pub fn drain_inbound(&self) -> Vec<Inbound> {
        self.shared.inbound.drain()
    }

    pub fn inspect_inbound(&self, max_items: usize) -> Vec<String> {
        self.shared.inbound.inspect(max_items)
    }

    pub fn inspect_outbound(&self, max_items: usize) -> Vec<String> {
        self.shared.handle.inspect_outbound(max_items)
    }

    /// Close the transport and both queues, then wait for the loops to exit.
    ///
    /// Idempotent. Does not notify the disconnect listener.
    pub fn dispose(&mut self) {
        if self.shared.shut() {
            tracing::debug!(connection = %self.id(), "connection monitor disposed");
        }
        let current = thread::current().id();
        for handle in self.threads.drain(..) {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                tracing::warn!(connection = %self.shared.handle.id, "connection thread panicked");
            }
        }
    }
}

impl fmt::Debug for ConnectionMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionMonitor")
            .field("connection", &self.shared.handle)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Drop for ConnectionMonitor {
    fn drop(&mut self) {
        self.dispose();
    }
}
