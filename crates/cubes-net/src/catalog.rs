//! Static table of every packet type this process understands.
//!
//! Populated once at startup and shared read-only between connections. The
//! key is the stable type name that travels on the wire the first time a
//! type is used on a connection.

use std::collections::HashMap;
use std::fmt;

use crate::codec::{CodecError, PacketReader};
use crate::packet::{Packet, PacketDecode, PacketKind};
use crate::packets::{Connect, PingReply, PingRequest, TagAssignment};

type DecodeFn = fn(&mut PacketReader<'_>) -> Result<Box<dyn Packet>, CodecError>;

fn decode_boxed<P: PacketDecode>(
    input: &mut PacketReader<'_>,
) -> Result<Box<dyn Packet>, CodecError> {
    Ok(Box::new(P::decode(input)?))
}

/// Constructor and identity for one packet type.
#[derive(Clone, Copy)]
pub struct CatalogEntry {
    pub kind: PacketKind,
    decode: DecodeFn,
}

impl CatalogEntry {
    /// Decode a complete payload. Bytes left over after the decoder finishes
    /// mean the two ends disagree on the layout.
    pub fn decode(&self, payload: &[u8]) -> Result<Box<dyn Packet>, CodecError> {
        let mut reader = PacketReader::new(payload);
        let packet = (self.decode)(&mut reader)?;
        if !reader.is_exhausted() {
            return Err(CodecError::Invalid(format!(
                "{} trailing bytes after {}",
                reader.remaining(),
                self.kind
            )));
        }
        Ok(packet)
    }
}

impl fmt::Debug for CatalogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CatalogEntry")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Errors raised while populating a catalog.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// Two types claimed the same name.
    #[error("packet type {0} registered twice")]
    Duplicate(&'static str),
    /// A type name is empty or contains whitespace.
    #[error("invalid packet type name {0:?}")]
    InvalidName(&'static str),
}

/// Name-keyed registry of packet constructors.
#[derive(Debug, Default, Clone)]
pub struct PacketCatalog {
    entries: HashMap<&'static str, CatalogEntry>,
}

impl PacketCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a catalog holding the built-in protocol packets.
    pub fn with_builtin() -> Self {
        let mut catalog = Self::new();
        catalog.insert::<TagAssignment>();
        catalog.insert::<Connect>();
        catalog.insert::<PingRequest>();
        catalog.insert::<PingReply>();
        catalog
    }

    fn insert<P: PacketDecode>(&mut self) {
        self.entries.insert(
            P::KIND.name,
            CatalogEntry {
                kind: P::KIND,
                decode: decode_boxed::<P>,
            },
        );
    }

    /// Register an application packet type.
    pub fn register<P: PacketDecode>(&mut self) -> Result<(), CatalogError> {
        let name = P::KIND.name;
        if name.is_empty() || name.chars().any(char::is_whitespace) {
            return Err(CatalogError::InvalidName(name));
        }
        if self.entries.contains_key(name) {
            return Err(CatalogError::Duplicate(name));
        }
        self.insert::<P>();
        Ok(())
    }

    /// Builder form of [`register`](Self::register).
    pub fn with<P: PacketDecode>(mut self) -> Result<Self, CatalogError> {
        self.register::<P>()?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&CatalogEntry> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered type names, sorted for stable logging.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.entries.keys().copied().collect();
        names.sort_unstable();
        names
    }
}
