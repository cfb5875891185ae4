#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use cubes_net::transport::{MemoryConnector, MemoryTransportServer};
use cubes_net::{
    ClientConfig, ClientNetworking, CodecError, Direction, Packet, PacketCatalog, PacketContext,
    PacketDecode, PacketKind, PacketReader, PacketWriter, ServerConfig, ServerNetworking,
};

/// Text message recorded into the tick state of whoever receives it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chat {
    pub text: String,
}

impl Packet for Chat {
    fn kind(&self) -> PacketKind {
        Self::KIND
    }

    fn encode(&self, out: &mut PacketWriter) -> Result<(), CodecError> {
        out.write_str(&self.text)
    }

    fn handle(self: Box<Self>, ctx: &mut PacketContext<'_>) {
        if let Some(log) = ctx.state_mut::<Vec<String>>() {
            log.push(self.text);
        }
    }
}

impl PacketDecode for Chat {
    const KIND: PacketKind = PacketKind::new("game.chat", Direction::Omnidirectional);

    fn decode(input: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            text: input.read_str()?,
        })
    }
}

/// Server-to-client only.
#[derive(Debug, Clone)]
pub struct Announcement(pub String);

impl Packet for Announcement {
    fn kind(&self) -> PacketKind {
        Self::KIND
    }

    fn encode(&self, out: &mut PacketWriter) -> Result<(), CodecError> {
        out.write_str(&self.0)
    }

    fn handle(self: Box<Self>, ctx: &mut PacketContext<'_>) {
        if let Some(log) = ctx.state_mut::<Vec<String>>() {
            log.push(format!("announce:{}", self.0));
        }
    }
}

impl PacketDecode for Announcement {
    const KIND: PacketKind = PacketKind::new("game.announcement", Direction::ToClient);

    fn decode(input: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        Ok(Self(input.read_str()?))
    }
}

pub fn catalog() -> Arc<PacketCatalog> {
    let catalog = PacketCatalog::with_builtin()
        .with::<Chat>()
        .and_then(|c| c.with::<Announcement>())
        .unwrap();
    Arc::new(catalog)
}

pub fn server_config() -> ServerConfig {
    ServerConfig {
        gameplay_namespaces: vec!["game.".to_string()],
        ..ServerConfig::default()
    }
}

pub fn client_config(name: &str) -> ClientConfig {
    ClientConfig {
        display_name: name.to_string(),
        gameplay_namespaces: vec!["game.".to_string()],
        handshake_timeout: Duration::from_secs(5),
        ..ClientConfig::default()
    }
}

pub fn memory_server(config: ServerConfig) -> (ServerNetworking, MemoryConnector) {
    let listener = MemoryTransportServer::new("test");
    let connector = listener.connector();
    let server = ServerNetworking::start(config, Box::new(listener), catalog()).unwrap();
    (server, connector)
}

pub fn connect(connector: &MemoryConnector, config: ClientConfig) -> ClientNetworking {
    let transport = connector.connect().unwrap();
    ClientNetworking::connect(config, Box::new(transport), catalog()).unwrap()
}

/// Poll `cond` for up to five seconds.
pub fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}
