//! The single choke point between frames and packet instances.
//!
//! Decoding resolves a tag or a type name through the connection's registry
//! and the process-wide catalog, refuses types this side must not receive,
//! and consumes tag assignments before they can reach gameplay code. Encoding
//! decides per frame whether the peer already knows the compact tag and, on
//! the server, emits the assignments that teach it.

use std::sync::Arc;

use crate::catalog::{CatalogEntry, PacketCatalog};
use crate::codec::{PacketReader, PacketWriter};
use crate::error::ProtocolError;
use crate::framing::{Frame, FrameConfig, FrameHeader};
use crate::packet::{Packet, PacketDecode};
use crate::packets::TagAssignment;
use crate::registry::PacketIdRegistry;
use crate::side::Side;

const ASSIGNMENT: &str = TagAssignment::KIND.name;

/// Result of decoding one inbound frame.
#[derive(Debug)]
pub enum Received {
    /// A tag assignment that has been applied to the registry.
    Learned { name: &'static str, tag: i32 },
    /// A packet for the dispatch chain. `announce` carries the assignment the
    /// server owes the peer after it named a new type.
    Packet {
        packet: Box<dyn Packet>,
        announce: Option<TagAssignment>,
    },
}

/// Builds packets from frames and frames from packets for one side.
#[derive(Debug, Clone)]
pub struct PacketFactory {
    side: Side,
    catalog: Arc<PacketCatalog>,
    max_payload_size: u32,
}

impl PacketFactory {
    pub fn new(side: Side, catalog: Arc<PacketCatalog>) -> Self {
        Self {
            side,
            catalog,
            max_payload_size: FrameConfig::default().max_payload_size,
        }
    }

    /// Refuse to encode payloads the frame layer would reject.
    pub fn with_frame_limit(mut self, frame: &FrameConfig) -> Self {
        self.max_payload_size = frame.max_payload_size;
        self
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn catalog(&self) -> &PacketCatalog {
        &self.catalog
    }

    fn entry(&self, name: &str) -> Result<&CatalogEntry, ProtocolError> {
        self.catalog
            .get(name)
            .ok_or_else(|| ProtocolError::UnknownType(name.to_string()))
    }

    fn receivable(&self, name: &str) -> Result<&CatalogEntry, ProtocolError> {
        let entry = self.entry(name)?;
        if !entry.kind.direction.can_receive(self.side) {
            return Err(ProtocolError::WrongDirection {
                name: entry.kind.name,
                side: self.side,
            });
        }
        Ok(entry)
    }

    /// Instantiate a packet from its type name.
    pub fn create_from_name(
        &self,
        name: &str,
        payload: &[u8],
    ) -> Result<Box<dyn Packet>, ProtocolError> {
        let entry = self.receivable(name)?;
        entry.decode(payload).map_err(|source| ProtocolError::Decode {
            name: entry.kind.name,
            source,
        })
    }

    /// Instantiate a packet from a tag bound in `registry`.
    pub fn create_from_tag(
        &self,
        registry: &PacketIdRegistry,
        tag: i32,
        payload: &[u8],
    ) -> Result<Box<dyn Packet>, ProtocolError> {
        let name = registry
            .name_of(tag)
            .ok_or(ProtocolError::UnknownTag(tag))?;
        self.create_from_name(name, payload)
    }

    /// Decode one frame read from the connection that owns `registry`.
    pub fn decode_frame(
        &self,
        registry: &mut PacketIdRegistry,
        frame: Frame,
    ) -> Result<Received, ProtocolError> {
        let (name, named) = match &frame.header {
            FrameHeader::Name(name) => (self.receivable(name)?.kind.name, true),
            FrameHeader::Tag(tag) => {
                let name = registry
                    .name_of(*tag)
                    .ok_or(ProtocolError::UnknownTag(*tag))?;
                (self.receivable(name)?.kind.name, false)
            }
        };

        if name == ASSIGNMENT {
            let assignment = decode_exact::<TagAssignment>(&frame.payload)?;
            let learned = self.entry(&assignment.name)?.kind.name;
            registry.learn(learned, assignment.tag)?;
            return Ok(Received::Learned {
                name: learned,
                tag: assignment.tag,
            });
        }

        let packet = self.create_from_name(name, &frame.payload)?;
        let announce = match (self.side, named) {
            (Side::Server, true) => registry.needs_assignment(name).map(|tag| TagAssignment {
                name: name.to_string(),
                tag,
            }),
            _ => None,
        };
        Ok(Received::Packet { packet, announce })
    }

    /// Encode `packet` into the frames the writer must send, in order.
    ///
    /// Usually one frame. On the server, the first occurrence of a type also
    /// yields the assignment frames that let the client use the tag later; a
    /// queued assignment the peer no longer needs yields no frames at all.
    pub fn encode(
        &self,
        registry: &mut PacketIdRegistry,
        packet: &dyn Packet,
    ) -> Result<Vec<(FrameHeader, Vec<u8>)>, ProtocolError> {
        let kind = packet.kind();
        let name = self.entry(kind.name)?.kind.name;
        if !kind.direction.can_send(self.side) {
            return Err(ProtocolError::IllegalSend {
                name,
                side: self.side,
            });
        }

        let mut out = PacketWriter::new();
        packet
            .encode(&mut out)
            .map_err(|source| ProtocolError::Encode { name, source })?;
        let payload = out.into_inner();
        let size = payload.len() as u64;
        if size > u64::from(self.max_payload_size) {
            return Err(ProtocolError::Oversized {
                name,
                size,
                max: self.max_payload_size,
            });
        }

        let mut frames = Vec::new();
        match self.side {
            Side::Client => {
                let header = match registry.tag_of(name) {
                    Some(tag) => FrameHeader::Tag(tag),
                    None => FrameHeader::Name(name.to_string()),
                };
                frames.push((header, payload));
            }
            Side::Server if name == ASSIGNMENT => {
                let assignment = decode_exact::<TagAssignment>(&payload)?;
                let subject = self.entry(&assignment.name)?.kind.name;
                if !registry.is_announced(subject) {
                    self.announce(registry, subject, &mut frames)?;
                }
            }
            Side::Server => {
                let tag = registry.assign(name);
                if registry.is_announced(name) {
                    frames.push((FrameHeader::Tag(tag), payload));
                } else {
                    frames.push((FrameHeader::Name(name.to_string()), payload));
                    self.announce(registry, name, &mut frames)?;
                }
            }
        }
        Ok(frames)
    }

    /// Append the frame(s) that tell the client the tag bound to `name`.
    fn announce(
        &self,
        registry: &mut PacketIdRegistry,
        name: &'static str,
        frames: &mut Vec<(FrameHeader, Vec<u8>)>,
    ) -> Result<(), ProtocolError> {
        // The assignment type teaches its own tag first, by name.
        if name != ASSIGNMENT && !registry.is_announced(ASSIGNMENT) {
            self.announce(registry, ASSIGNMENT, frames)?;
        }

        let tag = registry.assign(name);
        let mut out = PacketWriter::new();
        TagAssignment {
            name: name.to_string(),
            tag,
        }
        .encode(&mut out)
        .map_err(|source| ProtocolError::Encode {
            name: ASSIGNMENT,
            source,
        })?;

        let header = if registry.is_announced(ASSIGNMENT) {
            FrameHeader::Tag(registry.assign(ASSIGNMENT))
        } else {
            FrameHeader::Name(ASSIGNMENT.to_string())
        };
        frames.push((header, out.into_inner()));
        registry.mark_announced(name);
        Ok(())
    }
}

fn decode_exact<P: PacketDecode>(payload: &[u8]) -> Result<P, ProtocolError> {
    let mut reader = PacketReader::new(payload);
    let decode_error = |source| ProtocolError::Decode {
        name: P::KIND.name,
        source,
    };
    let packet = P::decode(&mut reader).map_err(decode_error)?;
    if !reader.is_exhausted() {
        return Err(decode_error(crate::codec::CodecError::Invalid(format!(
            "{} trailing bytes",
            reader.remaining()
        ))));
    }
    Ok(packet)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CodecError;
    use crate::packet::{PacketContext, PacketKind};
    use crate::packets::{PingReply, PingRequest};
    use crate::side::Direction;

    #[derive(Debug)]
    struct Chunk(i32);

    impl Packet for Chunk {
        fn kind(&self) -> PacketKind {
            Self::KIND
        }
        fn encode(&self, out: &mut PacketWriter) -> Result<(), CodecError> {
            out.write_i32(self.0);
            Ok(())
        }
        fn handle(self: Box<Self>, _ctx: &mut PacketContext<'_>) {}
    }

    impl PacketDecode for Chunk {
        const KIND: PacketKind = PacketKind::new("game.chunk", Direction::Omnidirectional);
        fn decode(input: &mut PacketReader<'_>) -> Result<Self, CodecError> {
            Ok(Chunk(input.read_i32()?))
        }
    }

    fn factories() -> (PacketFactory, PacketFactory) {
        let catalog = Arc::new(PacketCatalog::with_builtin().with::<Chunk>().unwrap());
        (
            PacketFactory::new(Side::Client, catalog.clone()),
            PacketFactory::new(Side::Server, catalog),
        )
    }

    /// Feed server frames to the client as its reader would.
    fn deliver(
        client: &PacketFactory,
        registry: &mut PacketIdRegistry,
        frames: Vec<(FrameHeader, Vec<u8>)>,
    ) -> Vec<Received> {
        frames
            .into_iter()
            .map(|(header, payload)| {
                client
                    .decode_frame(registry, Frame { header, payload })
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn test_server_first_send_teaches_client_the_tag() {
        let (client, server) = factories();
        let mut server_reg = PacketIdRegistry::new();
        let mut client_reg = PacketIdRegistry::new();

        let frames = server.encode(&mut server_reg, &Chunk(5)).unwrap();
        // name frame, assignment for the assignment type, assignment for Chunk
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].0, FrameHeader::Name("game.chunk".into()));
        assert_eq!(frames[1].0, FrameHeader::Name(ASSIGNMENT.into()));
        assert!(matches!(frames[2].0, FrameHeader::Tag(_)));

        let received = deliver(&client, &mut client_reg, frames);
        assert!(matches!(received[0], Received::Packet { .. }));
        assert!(matches!(received[2], Received::Learned { name: "game.chunk", .. }));
        assert_eq!(client_reg.tag_of("game.chunk"), server_reg.tag_of("game.chunk"));
        assert_eq!(client_reg.tag_of(ASSIGNMENT), server_reg.tag_of(ASSIGNMENT));

        // Afterwards only the tag crosses the wire.
        let again = server.encode(&mut server_reg, &Chunk(6)).unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].0, FrameHeader::Tag(server_reg.tag_of("game.chunk").unwrap()));
        let received = deliver(&client, &mut client_reg, again);
        match &received[0] {
            Received::Packet { packet, .. } => assert_eq!(packet.kind().name, "game.chunk"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_client_names_until_assignment_arrives() {
        let (client, server) = factories();
        let mut server_reg = PacketIdRegistry::new();
        let mut client_reg = PacketIdRegistry::new();

        let frames = client.encode(&mut client_reg, &PingRequest).unwrap();
        assert_eq!(frames[0].0, FrameHeader::Name("cubes.net.ping_request".into()));

        let (header, payload) = frames.into_iter().next().unwrap();
        let announce = match server
            .decode_frame(&mut server_reg, Frame { header, payload })
            .unwrap()
        {
            Received::Packet { announce, .. } => announce.unwrap(),
            other => panic!("unexpected {other:?}"),
        };

        // A second naming before the assignment is written queues nothing new.
        let frames = client.encode(&mut client_reg, &PingRequest).unwrap();
        let (header, payload) = frames.into_iter().next().unwrap();
        assert!(matches!(
            server.decode_frame(&mut server_reg, Frame { header, payload }).unwrap(),
            Received::Packet { announce: None, .. }
        ));

        let frames = server.encode(&mut server_reg, &announce).unwrap();
        deliver(&client, &mut client_reg, frames);
        let tag = client_reg.tag_of("cubes.net.ping_request").unwrap();
        assert_eq!(Some(tag), server_reg.tag_of("cubes.net.ping_request"));

        let frames = client.encode(&mut client_reg, &PingRequest).unwrap();
        assert_eq!(frames[0].0, FrameHeader::Tag(tag));
    }

    #[test]
    fn test_oversized_payload_binds_nothing() {
        let (client, server) = factories();
        let frame = FrameConfig { max_payload_size: 2 };
        let server = server.with_frame_limit(&frame);
        let client = client.with_frame_limit(&frame);
        let mut registry = PacketIdRegistry::new();

        assert!(matches!(
            server.encode(&mut registry, &Chunk(1)),
            Err(ProtocolError::Oversized { name: "game.chunk", size: 4, max: 2 })
        ));
        assert_eq!(registry.tag_of("game.chunk"), None);
        assert!(!registry.is_announced("game.chunk"));
        assert!(!registry.is_announced(ASSIGNMENT));

        assert!(matches!(
            client.encode(&mut registry, &Chunk(1)),
            Err(ProtocolError::Oversized { .. })
        ));
        // Empty payloads still fit.
        assert_eq!(client.encode(&mut registry, &PingRequest).unwrap().len(), 1);
    }

    #[test]
    fn test_stale_assignment_writes_nothing() {
        let (_, server) = factories();
        let mut registry = PacketIdRegistry::new();
        server.encode(&mut registry, &Chunk(1)).unwrap();

        let stale = TagAssignment {
            name: "game.chunk".into(),
            tag: registry.tag_of("game.chunk").unwrap(),
        };
        assert!(server.encode(&mut registry, &stale).unwrap().is_empty());
    }

    #[test]
    fn test_receive_direction_enforced() {
        let (client, server) = factories();
        let mut registry = PacketIdRegistry::new();
        assert!(matches!(
            client.create_from_name("cubes.net.ping_request", &[]),
            Err(ProtocolError::WrongDirection { .. })
        ));
        assert!(matches!(
            server.create_from_name("cubes.net.ping_reply", &[]),
            Err(ProtocolError::WrongDirection { .. })
        ));
        assert!(client.create_from_name("game.chunk", &[0, 0, 0, 1]).is_ok());
        assert!(server.create_from_name("game.chunk", &[0, 0, 0, 1]).is_ok());

        let frame = Frame {
            header: FrameHeader::Name(ASSIGNMENT.into()),
            payload: Vec::new(),
        };
        assert!(matches!(
            server.decode_frame(&mut registry, frame),
            Err(ProtocolError::WrongDirection { .. })
        ));
    }

    #[test]
    fn test_send_direction_enforced() {
        let (client, server) = factories();
        let mut registry = PacketIdRegistry::new();
        assert!(matches!(
            client.encode(&mut registry, &PingReply),
            Err(ProtocolError::IllegalSend { .. })
        ));
        assert!(matches!(
            server.encode(&mut registry, &PingRequest),
            Err(ProtocolError::IllegalSend { .. })
        ));
    }

    #[test]
    fn test_unknown_tag_and_type_are_fatal() {
        let (client, _) = factories();
        let mut registry = PacketIdRegistry::new();
        let frame = Frame {
            header: FrameHeader::Tag(42),
            payload: Vec::new(),
        };
        assert!(matches!(
            client.decode_frame(&mut registry, frame),
            Err(ProtocolError::UnknownTag(42))
        ));
        assert!(matches!(
            client.create_from_name("game.missing", &[]),
            Err(ProtocolError::UnknownType(_))
        ));
    }

    #[test]
    fn test_leftover_payload_is_desync() {
        let (client, _) = factories();
        assert!(matches!(
            client.create_from_name("game.chunk", &[0, 0, 0, 1, 9]),
            Err(ProtocolError::Decode { .. })
        ));
    }
}
