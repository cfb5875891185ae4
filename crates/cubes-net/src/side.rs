//! Which end of a connection this process is, and which ends a packet type
//! may travel towards.

use std::fmt;

/// Role of the running process on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// Dials the server and drives the heartbeat.
    Client,
    /// Accepts connections and assigns packet tags.
    Server,
}

impl Side {
    /// The side at the other end of the connection.
    pub fn opposite(self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Client => f.write_str("client"),
            Side::Server => f.write_str("server"),
        }
    }
}

/// Declared transmission direction of a packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Sent by the server, received by clients.
    ToClient,
    /// Sent by clients, received by the server.
    ToServer,
    /// Either side may send and receive it.
    Omnidirectional,
}

impl Direction {
    /// Whether a packet with this direction may be received on `side`.
    pub fn can_receive(self, side: Side) -> bool {
        match self {
            Direction::ToClient => side == Side::Client,
            Direction::ToServer => side == Side::Server,
            Direction::Omnidirectional => true,
        }
    }

    /// Whether a packet with this direction may be sent from `side`.
    pub fn can_send(self, side: Side) -> bool {
        self.can_receive(side.opposite())
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ToClient => f.write_str("to-client"),
            Direction::ToServer => f.write_str("to-server"),
            Direction::Omnidirectional => f.write_str("omnidirectional"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_client_only_received_by_client() {
        assert!(Direction::ToClient.can_receive(Side::Client));
        assert!(!Direction::ToClient.can_receive(Side::Server));
    }

    #[test]
    fn test_to_server_only_received_by_server() {
        assert!(Direction::ToServer.can_receive(Side::Server));
        assert!(!Direction::ToServer.can_receive(Side::Client));
    }

    #[test]
    fn test_omnidirectional_always_accepted() {
        for side in [Side::Client, Side::Server] {
            assert!(Direction::Omnidirectional.can_receive(side));
            assert!(Direction::Omnidirectional.can_send(side));
        }
    }

    #[test]
    fn test_send_is_mirror_of_receive() {
        assert!(Direction::ToServer.can_send(Side::Client));
        assert!(!Direction::ToServer.can_send(Side::Server));
        assert!(Direction::ToClient.can_send(Side::Server));
        assert!(!Direction::ToClient.can_send(Side::Client));
    }
}
