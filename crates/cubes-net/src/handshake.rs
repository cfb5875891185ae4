//! Connection establishment, run on the raw transport before any monitor exists.
//!
//! ```text
//! client -> server   u8 intent           0 = session, 1 = status query
//! server -> client   i32 major, minor, point, build; string build hash
//! (intent 1 only)    i32 player count; count x string display name; close
//! ```
//!
//! The server waits a bounded time for the intent byte and closes silently on
//! timeout or an unknown code. Every failure closes the transport, so a failed
//! handshake never leaves anything half-open behind.

use std::fmt;
use std::io::{BufWriter, Write};
use std::time::Duration;

use crate::framing::{self, FrameError};
use crate::transport::Transport;

/// How long the server waits for the intent byte.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(5000);

/// First byte a client sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    /// Open a session.
    Connect,
    /// Ask for version and player list, then hang up.
    Ping,
}

impl Intent {
    pub fn code(self) -> u8 {
        match self {
            Intent::Connect => 0,
            Intent::Ping => 1,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Intent::Connect),
            1 => Some(Intent::Ping),
            _ => None,
        }
    }
}

/// Protocol version exchanged during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub major: i32,
    pub minor: i32,
    pub point: i32,
    pub build: i32,
    pub hash: String,
}

impl Version {
    /// Version of this build, taken from the crate metadata.
    pub fn current() -> Self {
        let part = |s: &str| s.parse().unwrap_or(0);
        Self {
            major: part(env!("CARGO_PKG_VERSION_MAJOR")),
            minor: part(env!("CARGO_PKG_VERSION_MINOR")),
            point: part(env!("CARGO_PKG_VERSION_PATCH")),
            build: 0,
            hash: option_env!("CUBES_BUILD_HASH").unwrap_or("dev").to_string(),
        }
    }

    /// Peers can talk when major and minor agree.
    pub fn is_compatible(&self, other: &Version) -> bool {
        self.major == other.major && self.minor == other.minor
    }

    fn write<W: Write + ?Sized>(&self, out: &mut W) -> Result<(), FrameError> {
        framing::write_i32(out, self.major)?;
        framing::write_i32(out, self.minor)?;
        framing::write_i32(out, self.point)?;
        framing::write_i32(out, self.build)?;
        framing::write_string(out, &self.hash)
    }

    fn read<R: std::io::Read + ?Sized>(input: &mut R) -> Result<Self, FrameError> {
        Ok(Self {
            major: framing::read_i32(input)?,
            minor: framing::read_i32(input)?,
            point: framing::read_i32(input)?,
            build: framing::read_i32(input)?,
            hash: framing::read_string(input)?,
        })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{} ({})",
            self.major, self.minor, self.point, self.build, self.hash
        )
    }
}

/// Answer to a status query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerStatus {
    pub version: Version,
    pub players: Vec<String>,
}

/// Errors that abort connection establishment.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("no intent byte within {0:?}")]
    Timeout(Duration),

    #[error("invalid intent code {0}")]
    InvalidIntent(u8),

    #[error("incompatible server version {remote} (local {local})")]
    VersionMismatch { local: Version, remote: Version },

    #[error("invalid player count {0}")]
    InvalidPlayerCount(i32),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// What the server side of a handshake ended in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accepted {
    /// The transport is ready for a connection monitor.
    Session,
    /// A status query was answered and the transport closed.
    Ping,
}

/// Close `transport` if `result` failed.
fn closing_on_error<T>(
    transport: &dyn Transport,
    result: Result<T, HandshakeError>,
) -> Result<T, HandshakeError> {
    if result.is_err() {
        transport.close();
    }
    result
}

fn send_intent(transport: &dyn Transport, intent: Intent) -> Result<(), HandshakeError> {
    let mut writer = transport.writer()?;
    framing::write_u8(&mut writer, intent.code())?;
    writer.flush()?;
    Ok(())
}

/// Client side, intent 0. Returns the server's version.
///
/// `timeout` bounds the wait for the server's answer; afterwards reads block
/// indefinitely again.
pub fn client_connect(
    transport: &dyn Transport,
    local: &Version,
    timeout: Option<Duration>,
) -> Result<Version, HandshakeError> {
    let result = (|| -> Result<Version, HandshakeError> {
        transport.set_read_timeout(timeout)?;
        send_intent(transport, Intent::Connect)?;
        let remote = Version::read(&mut transport.reader()?)?;
        transport.set_read_timeout(None)?;
        if !local.is_compatible(&remote) {
            return Err(HandshakeError::VersionMismatch {
                local: local.clone(),
                remote,
            });
        }
        Ok(remote)
    })();
    closing_on_error(transport, result)
}

/// Client side, intent 1. Always closes the transport.
pub fn client_query(
    transport: &dyn Transport,
    timeout: Option<Duration>,
) -> Result<ServerStatus, HandshakeError> {
    let result = (|| -> Result<ServerStatus, HandshakeError> {
        transport.set_read_timeout(timeout)?;
        send_intent(transport, Intent::Ping)?;
        let mut reader = transport.reader()?;
        let version = Version::read(&mut reader)?;
        let count = framing::read_i32(&mut reader)?;
        if count < 0 {
            return Err(HandshakeError::InvalidPlayerCount(count));
        }
        let players = (0..count)
            .map(|_| framing::read_string(&mut reader))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ServerStatus { version, players })
    })();
    transport.close();
    result
}

/// Server side of the handshake.
///
/// `players` is only consulted for a status query.
pub fn server_accept(
    transport: &dyn Transport,
    version: &Version,
    timeout: Duration,
    players: impl FnOnce() -> Vec<String>,
) -> Result<Accepted, HandshakeError> {
    let result = (|| -> Result<Accepted, HandshakeError> {
        transport.set_read_timeout(Some(timeout))?;
        let code = match framing::read_u8(&mut transport.reader()?) {
            Ok(code) => code,
            Err(e) if e.is_timeout() => return Err(HandshakeError::Timeout(timeout)),
            Err(e) => return Err(e.into()),
        };
        let intent = Intent::from_code(code).ok_or(HandshakeError::InvalidIntent(code))?;

        let mut writer = BufWriter::new(transport.writer()?);
        version.write(&mut writer)?;
        if intent == Intent::Ping {
            let players = players();
            framing::write_i32(&mut writer, players.len() as i32)?;
            for name in &players {
                framing::write_string(&mut writer, name)?;
            }
        }
        writer.flush()?;

        match intent {
            Intent::Connect => {
                transport.set_read_timeout(None)?;
                Ok(Accepted::Session)
            }
            Intent::Ping => {
                transport.close();
                Ok(Accepted::Ping)
            }
        }
    })();
    closing_on_error(transport, result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use std::io::Read;
    use std::thread;

    fn version(major: i32, minor: i32) -> Version {
        Version {
            major,
            minor,
            point: 3,
            build: 4,
            hash: "abc".into(),
        }
    }

    #[test]
    fn test_connect_exchanges_versions() {
        let (client, server) = MemoryTransport::pair("client", "server");
        let handle = thread::spawn(move || {
            server_accept(&server, &version(1, 2), DEFAULT_HANDSHAKE_TIMEOUT, Vec::new)
        });

        let remote = client_connect(&client, &version(1, 2), Some(Duration::from_secs(5))).unwrap();
        assert_eq!(remote, version(1, 2));
        assert_eq!(handle.join().unwrap().unwrap(), Accepted::Session);
        assert!(client.is_connected());
    }

    #[test]
    fn test_version_response_layout() {
        let mut buf = Vec::new();
        version(1, 2).write(&mut buf).unwrap();
        assert_eq!(
            buf,
            vec![0, 0, 0, 1, 0, 0, 0, 2, 0, 0, 0, 3, 0, 0, 0, 4, 0, 3, b'a', b'b', b'c']
        );
    }

    #[test]
    fn test_incompatible_version_rejected_and_closed() {
        let (client, server) = MemoryTransport::pair("client", "server");
        let handle = thread::spawn(move || {
            server_accept(&server, &version(2, 0), DEFAULT_HANDSHAKE_TIMEOUT, Vec::new)
        });

        let err = client_connect(&client, &version(1, 0), Some(Duration::from_secs(5))).unwrap_err();
        assert!(matches!(err, HandshakeError::VersionMismatch { .. }));
        assert!(!client.is_connected());
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_query_lists_players_and_closes() {
        let (client, server) = MemoryTransport::pair("client", "server");
        let handle = thread::spawn(move || {
            let outcome = server_accept(&server, &version(1, 0), DEFAULT_HANDSHAKE_TIMEOUT, || {
                vec!["alice".to_string(), "bob".to_string()]
            });
            (outcome.unwrap(), server.is_connected())
        });

        let status = client_query(&client, Some(Duration::from_secs(5))).unwrap();
        assert_eq!(status.version, version(1, 0));
        assert_eq!(status.players, vec!["alice", "bob"]);
        assert_eq!(handle.join().unwrap(), (Accepted::Ping, false));
        assert!(!client.is_connected());
    }

    #[test]
    fn test_silent_client_times_out_without_response() {
        let (client, server) = MemoryTransport::pair("client", "server");
        let err = server_accept(&server, &version(1, 0), Duration::from_millis(50), Vec::new)
            .unwrap_err();
        assert!(matches!(err, HandshakeError::Timeout(_)));
        assert!(!server.is_connected());

        // Nothing was written before the close.
        let mut buf = Vec::new();
        client.reader().unwrap().read_to_end(&mut buf).unwrap();
        assert!(buf.is_empty());
    }

    #[test]
    fn test_invalid_intent_closes_without_response() {
        let (client, server) = MemoryTransport::pair("client", "server");
        client.writer().unwrap().write_all(&[7]).unwrap();
        let err = server_accept(&server, &version(1, 0), DEFAULT_HANDSHAKE_TIMEOUT, Vec::new)
            .unwrap_err();
        assert!(matches!(err, HandshakeError::InvalidIntent(7)));

        let mut buf = Vec::new();
        client.reader().unwrap().read_to_end(&mut buf).unwrap();
        assert!(buf.is_empty());
    }

    #[test]
    fn test_intent_codes() {
        assert_eq!(Intent::Connect.code(), 0);
        assert_eq!(Intent::Ping.code(), 1);
        assert_eq!(Intent::from_code(1), Some(Intent::Ping));
        assert_eq!(Intent::from_code(2), None);
    }

    #[test]
    fn test_current_version_is_self_compatible() {
        let current = Version::current();
        assert!(current.is_compatible(&current));
        assert!(!current.is_compatible(&Version {
            minor: current.minor + 1,
            ..current.clone()
        }));
    }
}
