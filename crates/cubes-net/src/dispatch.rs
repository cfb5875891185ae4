//! The handler pipeline every inbound packet runs through on the tick thread.
//!
//! A chain is an ordered list of [`PacketHandler`]s. Each one either finishes
//! the packet or passes it on. The standard chain validates, re-checks the
//! direction, runs gameplay effects for known namespaces, and finally reports
//! whatever is left as unhandled. Chains are plain values, so a session can
//! be handed a different one at any time.

use std::any::Any;

use crate::packet::{Inbound, PacketContext};
use crate::packets::PROTOCOL_NAMESPACE;
use crate::session::Networking;
use crate::side::Side;

/// Final fate of a dispatched packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// An effect ran.
    Handled,
    /// A handler refused the packet.
    Rejected,
    /// Nothing claimed the packet.
    Unhandled,
}

/// What a handler decided.
#[derive(Debug)]
pub enum Dispatch {
    /// Pass the packet to the next handler.
    Continue(Inbound),
    /// Stop here.
    Done(Outcome),
}

/// One link in a [`DispatchChain`].
pub trait PacketHandler: Send + Sync {
    fn handle(
        &self,
        inbound: Inbound,
        networking: &mut dyn Networking,
        state: &mut (dyn Any + 'static),
    ) -> Dispatch;
}

/// Blanket implementation for closures.
impl<F> PacketHandler for F
where
    F: Fn(Inbound, &mut dyn Networking, &mut (dyn Any + 'static)) -> Dispatch + Send + Sync,
{
    fn handle(
        &self,
        inbound: Inbound,
        networking: &mut dyn Networking,
        state: &mut (dyn Any + 'static),
    ) -> Dispatch {
        self(inbound, networking, state)
    }
}

// ---------------------------------------------------------------------------
// Standard handlers
// ---------------------------------------------------------------------------

/// Drops packets whose own `validate` fails.
#[derive(Debug, Default)]
pub struct ValidationHandler;

impl PacketHandler for ValidationHandler {
    fn handle(
        &self,
        inbound: Inbound,
        _networking: &mut dyn Networking,
        _state: &mut (dyn Any + 'static),
    ) -> Dispatch {
        match inbound.packet.validate() {
            Ok(()) => Dispatch::Continue(inbound),
            Err(reason) => {
                tracing::warn!(
                    connection = %inbound.connection.id(),
                    packet = %inbound.packet.kind(),
                    "rejecting invalid packet: {reason}"
                );
                Dispatch::Done(Outcome::Rejected)
            }
        }
    }
}

/// Drops packets this side must not consume.
#[derive(Debug)]
pub struct DirectionHandler {
    side: Side,
}

impl DirectionHandler {
    pub fn new(side: Side) -> Self {
        Self { side }
    }
}

impl PacketHandler for DirectionHandler {
    fn handle(
        &self,
        inbound: Inbound,
        _networking: &mut dyn Networking,
        _state: &mut (dyn Any + 'static),
    ) -> Dispatch {
        let kind = inbound.packet.kind();
        if kind.direction.can_receive(self.side) {
            return Dispatch::Continue(inbound);
        }
        tracing::warn!(
            connection = %inbound.connection.id(),
            packet = %kind,
            "rejecting {} packet on the {}",
            kind.direction,
            self.side
        );
        Dispatch::Done(Outcome::Rejected)
    }
}

/// Runs the effect of packets whose type lives under a known namespace.
#[derive(Debug)]
pub struct GameplayHandler {
    namespaces: Vec<String>,
}

impl GameplayHandler {
    pub fn new<I, S>(namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            namespaces: namespaces.into_iter().map(Into::into).collect(),
        }
    }

    pub fn namespaces(&self) -> &[String] {
        &self.namespaces
    }
}

impl PacketHandler for GameplayHandler {
    fn handle(
        &self,
        inbound: Inbound,
        networking: &mut dyn Networking,
        state: &mut (dyn Any + 'static),
    ) -> Dispatch {
        let kind = inbound.packet.kind();
        if !self.namespaces.iter().any(|ns| kind.in_namespace(ns)) {
            return Dispatch::Continue(inbound);
        }
        let Inbound { connection, packet } = inbound;
        let mut ctx = PacketContext::new(&connection, networking, state);
        packet.handle(&mut ctx);
        Dispatch::Done(Outcome::Handled)
    }
}

/// Logs whatever reaches it.
#[derive(Debug, Default)]
pub struct FallbackHandler;

impl PacketHandler for FallbackHandler {
    fn handle(
        &self,
        inbound: Inbound,
        _networking: &mut dyn Networking,
        _state: &mut (dyn Any + 'static),
    ) -> Dispatch {
        tracing::warn!(
            connection = %inbound.connection.id(),
            packet = ?inbound.packet,
            "unhandled packet"
        );
        Dispatch::Done(Outcome::Unhandled)
    }
}

/// Traces every packet and passes it on. Not part of the standard chain.
#[derive(Debug, Default)]
pub struct TraceHandler;

impl PacketHandler for TraceHandler {
    fn handle(
        &self,
        inbound: Inbound,
        _networking: &mut dyn Networking,
        _state: &mut (dyn Any + 'static),
    ) -> Dispatch {
        tracing::trace!(connection = %inbound.connection.id(), packet = ?inbound.packet, "dispatching");
        Dispatch::Continue(inbound)
    }
}

// ---------------------------------------------------------------------------
// Chain
// ---------------------------------------------------------------------------

/// Ordered handler pipeline.
#[derive(Default)]
pub struct DispatchChain {
    handlers: Vec<Box<dyn PacketHandler>>,
}

impl DispatchChain {
    /// An empty chain. Every packet comes out unhandled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validation, direction, gameplay for `cubes.net.` plus `namespaces`, fallback.
    pub fn standard<I, S>(side: Side, namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut all: Vec<String> = vec![PROTOCOL_NAMESPACE.to_string()];
        all.extend(namespaces.into_iter().map(Into::into));
        Self::new()
            .with(ValidationHandler)
            .with(DirectionHandler::new(side))
            .with(GameplayHandler::new(all))
            .with(FallbackHandler)
    }

    /// Append a handler.
    pub fn with<H: PacketHandler + 'static>(mut self, handler: H) -> Self {
        self.push(handler);
        self
    }

    pub fn push<H: PacketHandler + 'static>(&mut self, handler: H) {
        self.handlers.push(Box::new(handler));
    }

    /// Insert a handler at `index`, shifting later ones back.
    pub fn insert<H: PacketHandler + 'static>(&mut self, index: usize, handler: H) {
        let index = index.min(self.handlers.len());
        self.handlers.insert(index, Box::new(handler));
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run `inbound` through the handlers in order.
    pub fn dispatch(
        &self,
        inbound: Inbound,
        networking: &mut dyn Networking,
        state: &mut (dyn Any + 'static),
    ) -> Outcome {
        let mut current = inbound;
        for handler in &self.handlers {
            match handler.handle(current, networking, state) {
                Dispatch::Continue(next) => current = next,
                Dispatch::Done(outcome) => return outcome,
            }
        }
        tracing::debug!(connection = %current.connection.id(), packet = %current.packet.kind(), "fell off the dispatch chain");
        Outcome::Unhandled
    }
}

impl std::fmt::Debug for DispatchChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchChain")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CodecError, PacketReader, PacketWriter};
    use crate::monitor::{ConnectionHandle, ConnectionId};
    use crate::packet::{Outbound, Packet, PacketDecode, PacketKind};
    use crate::packets::{Connect, PingReply, PingRequest};
    use crate::queue::{FifoQueue, PacketQueue};
    use crate::session::NetworkingState;
    use crate::side::Direction;
    use std::sync::Arc;

    #[derive(Default)]
    struct FakeNetworking {
        sent: Vec<(ConnectionId, String)>,
        identified: Vec<String>,
        pongs: usize,
    }

    impl Networking for FakeNetworking {
        fn side(&self) -> Side {
            Side::Server
        }
        fn state(&self) -> NetworkingState {
            NetworkingState::Running
        }
        fn send_to(&mut self, connection: ConnectionId, packet: Box<dyn Packet>) {
            self.sent.push((connection, packet.kind().name.to_string()));
        }
        fn ping_reply_received(&mut self) {
            self.pongs += 1;
        }
        fn identify(&mut self, _connection: ConnectionId, display_name: String) {
            self.identified.push(display_name);
        }
    }

    #[derive(Debug)]
    struct Score(i32);

    impl Packet for Score {
        fn kind(&self) -> PacketKind {
            Self::KIND
        }
        fn encode(&self, out: &mut PacketWriter) -> Result<(), CodecError> {
            out.write_i32(self.0);
            Ok(())
        }
        fn handle(self: Box<Self>, ctx: &mut PacketContext<'_>) {
            if let Some(total) = ctx.state_mut::<i32>() {
                *total += self.0;
            }
        }
        fn validate(&self) -> Result<(), String> {
            if self.0 < 0 {
                Err("negative score".into())
            } else {
                Ok(())
            }
        }
    }

    impl PacketDecode for Score {
        const KIND: PacketKind = PacketKind::new("game.score", Direction::Omnidirectional);
        fn decode(input: &mut PacketReader<'_>) -> Result<Self, CodecError> {
            Ok(Score(input.read_i32()?))
        }
    }

    fn inbound(packet: Box<dyn Packet>) -> Inbound {
        let outbound: Arc<dyn PacketQueue<Outbound>> = Arc::new(FifoQueue::new());
        Inbound {
            connection: ConnectionHandle::new(ConnectionId(3), Side::Server, "test", outbound),
            packet,
        }
    }

    #[test]
    fn test_gameplay_effect_mutates_state() {
        let chain = DispatchChain::standard(Side::Server, ["game."]);
        let mut net = FakeNetworking::default();
        let mut total = 0i32;

        assert_eq!(
            chain.dispatch(inbound(Box::new(Score(4))), &mut net, &mut total),
            Outcome::Handled
        );
        assert_eq!(
            chain.dispatch(inbound(Box::new(Score(3))), &mut net, &mut total),
            Outcome::Handled
        );
        assert_eq!(total, 7);
    }

    #[test]
    fn test_invalid_packet_rejected_before_effect() {
        let chain = DispatchChain::standard(Side::Server, ["game."]);
        let mut net = FakeNetworking::default();
        let mut total = 0i32;
        assert_eq!(
            chain.dispatch(inbound(Box::new(Score(-1))), &mut net, &mut total),
            Outcome::Rejected
        );
        assert_eq!(total, 0);
    }

    #[test]
    fn test_wrong_direction_rejected_at_consumption() {
        let chain = DispatchChain::standard(Side::Server, Vec::<String>::new());
        let mut net = FakeNetworking::default();
        assert_eq!(
            chain.dispatch(inbound(Box::new(PingReply)), &mut net, &mut ()),
            Outcome::Rejected
        );
        assert_eq!(net.pongs, 0);
    }

    #[test]
    fn test_unknown_namespace_falls_through() {
        let chain = DispatchChain::standard(Side::Server, Vec::<String>::new());
        let mut net = FakeNetworking::default();
        let mut total = 0i32;
        assert_eq!(
            chain.dispatch(inbound(Box::new(Score(1))), &mut net, &mut total),
            Outcome::Unhandled
        );
        assert_eq!(total, 0);
    }

    #[test]
    fn test_builtin_effects_reach_the_session() {
        let chain = DispatchChain::standard(Side::Server, Vec::<String>::new());
        let mut net = FakeNetworking::default();

        chain.dispatch(inbound(Box::new(PingRequest)), &mut net, &mut ());
        assert_eq!(net.sent, vec![(ConnectionId(3), "cubes.net.ping_reply".to_string())]);

        let connect = Connect {
            display_name: "alex".into(),
        };
        chain.dispatch(inbound(Box::new(connect)), &mut net, &mut ());
        assert_eq!(net.identified, vec!["alex".to_string()]);
    }

    #[test]
    fn test_chain_is_rebuildable() {
        let mut chain = DispatchChain::new();
        let mut net = FakeNetworking::default();
        assert_eq!(
            chain.dispatch(inbound(Box::new(PingRequest)), &mut net, &mut ()),
            Outcome::Unhandled
        );

        let blocked = |_inbound: Inbound, _net: &mut dyn Networking, _state: &mut (dyn Any + 'static)| {
            Dispatch::Done(Outcome::Rejected)
        };
        chain.push(GameplayHandler::new([PROTOCOL_NAMESPACE]));
        chain.insert(0, TraceHandler);
        chain.insert(1, blocked);
        assert_eq!(chain.len(), 3);
        assert_eq!(
            chain.dispatch(inbound(Box::new(PingRequest)), &mut net, &mut ()),
            Outcome::Rejected
        );
        assert!(net.sent.is_empty());
    }
}
