//! The packet model: what gameplay code implements to cross the wire.
//!
//! A packet type is identified by a stable, fully-qualified name (for example
//! `cubes.net.ping_request`) and declares the [`Direction`] it may travel.
//! Instances are trait objects so the tick thread can dispatch them without
//! knowing the concrete set of types up front; the concrete constructor for
//! each name lives in the [`PacketCatalog`](crate::catalog::PacketCatalog).

use std::any::Any;
use std::fmt;

use crate::codec::{CodecError, PacketReader, PacketWriter};
use crate::monitor::{ConnectionHandle, ConnectionId};
use crate::queue::Prioritized;
use crate::session::Networking;
use crate::side::{Direction, Side};

/// Static identity of a packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketKind {
    /// Stable, fully-qualified type name. Sent on the wire on first use.
    pub name: &'static str,
    /// Which side may receive this type.
    pub direction: Direction,
}

impl PacketKind {
    pub const fn new(name: &'static str, direction: Direction) -> Self {
        Self { name, direction }
    }

    /// Whether the type name lives under `namespace` (a dotted prefix).
    pub fn in_namespace(&self, namespace: &str) -> bool {
        self.name.starts_with(namespace)
    }
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Outbound scheduling priority. Higher values are written first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub i32);

impl Priority {
    pub const LOW: Priority = Priority(-10);
    pub const NORMAL: Priority = Priority(0);
    pub const HIGH: Priority = Priority(10);
    /// Reserved for protocol bookkeeping such as tag assignments.
    pub const URGENT: Priority = Priority(100);
}

impl Default for Priority {
    fn default() -> Self {
        Priority::NORMAL
    }
}

/// A typed, serializable message.
pub trait Packet: Send + fmt::Debug + 'static {
    /// Static identity of this packet's type.
    fn kind(&self) -> PacketKind;

    /// Write the payload fields.
    fn encode(&self, out: &mut PacketWriter) -> Result<(), CodecError>;

    /// Effect on receipt. Runs on the tick thread during dispatch.
    fn handle(self: Box<Self>, ctx: &mut PacketContext<'_>);

    /// Default outbound priority when the sender does not pick one.
    fn priority(&self) -> Priority {
        Priority::NORMAL
    }

    /// Reject a decoded instance whose fields are inconsistent.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Decoding half of the packet contract, used to populate the catalog.
pub trait PacketDecode: Packet + Sized {
    const KIND: PacketKind;

    fn decode(input: &mut PacketReader<'_>) -> Result<Self, CodecError>;
}

/// A decoded packet together with the connection it arrived on.
pub struct Inbound {
    pub connection: ConnectionHandle,
    pub packet: Box<dyn Packet>,
}

impl fmt::Debug for Inbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} from {}", self.packet, self.connection.id())
    }
}

/// A packet waiting in an outbound queue.
pub struct Outbound {
    pub packet: Box<dyn Packet>,
    pub priority: Priority,
}

impl Outbound {
    pub fn with_priority(packet: Box<dyn Packet>, priority: Priority) -> Self {
        Self { packet, priority }
    }
}

impl Prioritized for Outbound {
    fn priority(&self) -> Priority {
        self.priority
    }
}

impl fmt::Debug for Outbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (priority {})", self.packet, self.priority.0)
    }
}

/// Everything a packet effect may touch while it runs.
pub struct PacketContext<'a> {
    connection: &'a ConnectionHandle,
    networking: &'a mut dyn Networking,
    state: &'a mut (dyn Any + 'static),
}

impl<'a> PacketContext<'a> {
    pub fn new(
        connection: &'a ConnectionHandle,
        networking: &'a mut dyn Networking,
        state: &'a mut (dyn Any + 'static),
    ) -> Self {
        Self {
            connection,
            networking,
            state,
        }
    }

    /// Connection the packet arrived on.
    pub fn connection(&self) -> &ConnectionHandle {
        self.connection
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection.id()
    }

    pub fn side(&self) -> Side {
        self.networking.side()
    }

    /// The session currently dispatching.
    pub fn networking(&mut self) -> &mut dyn Networking {
        &mut *self.networking
    }

    /// Send `packet` back to the connection this packet arrived on.
    pub fn reply(&mut self, packet: Box<dyn Packet>) {
        let id = self.connection.id();
        self.networking.send_to(id, packet);
    }

    /// Application state handed to `tick`, if it is a `T`.
    pub fn state_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.state.downcast_mut::<T>()
    }
}
