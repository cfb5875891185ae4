//! Built-in protocol packets under the `cubes.net.` namespace.

use crate::codec::{CodecError, PacketReader, PacketWriter};
use crate::packet::{Packet, PacketContext, PacketDecode, PacketKind, Priority};
use crate::side::Direction;

/// Namespace every built-in packet lives under.
pub const PROTOCOL_NAMESPACE: &str = "cubes.net.";

/// Longest display name a client may claim.
pub const MAX_DISPLAY_NAME_LEN: usize = 32;

/// Tells the client which compact tag the server bound to a type name.
///
/// Consumed by the connection's reader thread; never reaches the tick thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagAssignment {
    pub name: String,
    pub tag: i32,
}

impl Packet for TagAssignment {
    fn kind(&self) -> PacketKind {
        Self::KIND
    }

    fn encode(&self, out: &mut PacketWriter) -> Result<(), CodecError> {
        out.write_str(&self.name)?;
        out.write_i32(self.tag);
        Ok(())
    }

    fn handle(self: Box<Self>, _ctx: &mut PacketContext<'_>) {
        tracing::debug!(name = %self.name, tag = self.tag, "tag assignment reached dispatch");
    }

    fn priority(&self) -> Priority {
        Priority::URGENT
    }

    fn validate(&self) -> Result<(), String> {
        if self.tag < 0 {
            return Err(format!("negative tag {}", self.tag));
        }
        Ok(())
    }
}

impl PacketDecode for TagAssignment {
    const KIND: PacketKind = PacketKind::new("cubes.net.tag_assignment", Direction::ToClient);

    fn decode(input: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            name: input.read_str()?,
            tag: input.read_i32()?,
        })
    }
}

/// First packet a client sends once its session is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub display_name: String,
}

impl Packet for Connect {
    fn kind(&self) -> PacketKind {
        Self::KIND
    }

    fn encode(&self, out: &mut PacketWriter) -> Result<(), CodecError> {
        out.write_str(&self.display_name)
    }

    fn handle(self: Box<Self>, ctx: &mut PacketContext<'_>) {
        let connection = ctx.connection_id();
        ctx.networking().identify(connection, self.display_name);
    }

    fn priority(&self) -> Priority {
        Priority::HIGH
    }

    fn validate(&self) -> Result<(), String> {
        let name = self.display_name.trim();
        if name.is_empty() {
            return Err("display name is empty".to_string());
        }
        if name.chars().count() > MAX_DISPLAY_NAME_LEN {
            return Err(format!(
                "display name longer than {MAX_DISPLAY_NAME_LEN} characters"
            ));
        }
        Ok(())
    }
}

impl PacketDecode for Connect {
    const KIND: PacketKind = PacketKind::new("cubes.net.connect", Direction::ToServer);

    fn decode(input: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            display_name: input.read_str()?,
        })
    }
}

/// Heartbeat request sent by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PingRequest;

impl Packet for PingRequest {
    fn kind(&self) -> PacketKind {
        Self::KIND
    }

    fn encode(&self, _out: &mut PacketWriter) -> Result<(), CodecError> {
        Ok(())
    }

    fn handle(self: Box<Self>, ctx: &mut PacketContext<'_>) {
        ctx.reply(Box::new(PingReply));
    }

    fn priority(&self) -> Priority {
        Priority::HIGH
    }
}

impl PacketDecode for PingRequest {
    const KIND: PacketKind = PacketKind::new("cubes.net.ping_request", Direction::ToServer);

    fn decode(_input: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        Ok(Self)
    }
}

/// Server's answer to a [`PingRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PingReply;

impl Packet for PingReply {
    fn kind(&self) -> PacketKind {
        Self::KIND
    }

    fn encode(&self, _out: &mut PacketWriter) -> Result<(), CodecError> {
        Ok(())
    }

    fn handle(self: Box<Self>, ctx: &mut PacketContext<'_>) {
        ctx.networking().ping_reply_received();
    }

    fn priority(&self) -> Priority {
        Priority::HIGH
    }
}

impl PacketDecode for PingReply {
    const KIND: PacketKind = PacketKind::new("cubes.net.ping_reply", Direction::ToClient);

    fn decode(_input: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        Ok(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_packets_share_protocol_namespace() {
        for kind in [
            TagAssignment::KIND,
            Connect::KIND,
            PingRequest::KIND,
            PingReply::KIND,
        ] {
            assert!(kind.in_namespace(PROTOCOL_NAMESPACE), "{kind}");
        }
    }

    #[test]
    fn test_tag_assignment_payload_layout() {
        let packet = TagAssignment {
            name: "a.b".into(),
            tag: 3,
        };
        let mut out = PacketWriter::new();
        packet.encode(&mut out).unwrap();
        assert_eq!(out.as_slice(), &[0, 3, b'a', b'.', b'b', 0, 0, 0, 3]);

        let bytes = out.into_inner();
        let decoded = TagAssignment::decode(&mut PacketReader::new(&bytes)).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_connect_validation() {
        let ok = Connect {
            display_name: "Alex".into(),
        };
        assert!(ok.validate().is_ok());

        let blank = Connect {
            display_name: "   ".into(),
        };
        assert!(blank.validate().is_err());

        let long = Connect {
            display_name: "n".repeat(MAX_DISPLAY_NAME_LEN + 1),
        };
        assert!(long.validate().is_err());
    }

    #[test]
    fn test_heartbeat_packets_have_empty_payload() {
        let mut out = PacketWriter::new();
        PingRequest.encode(&mut out).unwrap();
        PingReply.encode(&mut out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_negative_tag_assignment_invalid() {
        let packet = TagAssignment {
            name: "x".into(),
            tag: -1,
        };
        assert!(packet.validate().is_err());
    }
}
