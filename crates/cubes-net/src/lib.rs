//! Client/server packet networking: handshake, lazy tag negotiation, per-connection
//! I/O threads with packet queues, a dispatch chain and tick-driven sessions.

pub mod catalog;
pub mod codec;
pub mod dispatch;
pub mod error;
pub mod factory;
pub mod framing;
pub mod handshake;
pub mod monitor;
pub mod packet;
pub mod packets;
pub mod queue;
pub mod registry;
pub mod session;
pub mod side;
pub mod transport;

pub use catalog::{CatalogError, PacketCatalog};
pub use codec::{CodecError, PacketReader, PacketWriter};
pub use dispatch::{Dispatch, DispatchChain, Outcome, PacketHandler};
pub use error::{NetError, ProtocolError};
pub use framing::{FrameConfig, FrameError};
pub use handshake::{HandshakeError, ServerStatus, Version};
pub use monitor::{ConnectionHandle, ConnectionId, DisconnectReason, MonitorConfig};
pub use packet::{Inbound, Outbound, Packet, PacketContext, PacketDecode, PacketKind, Priority};
pub use queue::{FifoQueue, PacketQueue, PriorityQueue, QueueOrdering};
pub use session::{
    ClientConfig, ClientNetworking, Networking, NetworkingState, ServerConfig, ServerNetworking,
};
pub use side::{Direction, Side};
pub use transport::{Transport, TransportKind, TransportServer};
