//! Error types shared across the engine.

use crate::codec::CodecError;
use crate::framing::FrameError;
use crate::handshake::HandshakeError;
use crate::session::NetworkingState;
use crate::side::Side;

/// The two ends disagree about the schema. Always fatal to the connection.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown packet tag {0}")]
    UnknownTag(i32),

    #[error("unknown packet type {0:?}")]
    UnknownType(String),

    /// A type arrived that this side must never receive.
    #[error("{name} may not be received by the {side}")]
    WrongDirection { name: &'static str, side: Side },

    /// Local code tried to send a type this side must never send.
    #[error("{name} may not be sent by the {side}")]
    IllegalSend { name: &'static str, side: Side },

    #[error("tag {tag} for {name} conflicts with existing binding to {existing}")]
    TagConflict {
        name: &'static str,
        tag: i32,
        existing: String,
    },

    #[error("failed to decode {name}: {source}")]
    Decode {
        name: &'static str,
        #[source]
        source: CodecError,
    },

    #[error("failed to encode {name}: {source}")]
    Encode {
        name: &'static str,
        #[source]
        source: CodecError,
    },

    /// Local payload bigger than the frame limit. Checked before any tag is
    /// bound, so the packet can be dropped without desyncing the stream.
    #[error("{name} payload of {size} bytes exceeds maximum {max}")]
    Oversized {
        name: &'static str,
        size: u64,
        max: u32,
    },

    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Session-level failures surfaced to the caller of `connect`/`start`.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("networking is {0}, expected {1}")]
    InvalidState(NetworkingState, NetworkingState),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
