//! Configuration structs with sensible defaults and RON persistence.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use cubes_net::{
    ClientConfig, FrameConfig, MonitorConfig, QueueOrdering, ServerConfig, TransportKind,
};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// File name inside the config directory.
pub const CONFIG_FILE: &str = "config.ron";

/// Top-level host configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Network/multiplayer settings.
    pub network: NetworkConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Network/multiplayer configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the server binds to or the client connects to.
    pub server_address: String,
    /// Server port.
    pub server_port: u16,
    /// Socket backend.
    pub transport: TransportKind,
    /// Ordering of each connection's outbound queue.
    pub outbound_ordering: QueueOrdering,
    /// How long a fresh socket may stay silent before its handshake fails.
    pub handshake_timeout_ms: u64,
    /// Seconds between client heartbeats.
    pub ping_interval_secs: u64,
    /// Simulation ticks per second.
    pub tick_rate: u32,
    /// Largest accepted frame payload in bytes.
    pub max_frame_size: u32,
    /// Maximum number of players (server only).
    pub max_players: usize,
    /// Name announced to the server (client only).
    pub display_name: String,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
}

// --- Default implementations ---

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            server_address: "127.0.0.1".to_string(),
            server_port: 24842,
            transport: TransportKind::Tcp,
            outbound_ordering: QueueOrdering::Priority,
            handshake_timeout_ms: 5000,
            ping_interval_secs: 10,
            tick_rate: 20,
            max_frame_size: 1024 * 1024,
            max_players: 32,
            display_name: "Player".to_string(),
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl NetworkConfig {
    /// `server_address` and `server_port` as a socket address.
    ///
    /// The address must be an IP literal or `localhost`; no DNS lookup happens.
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip = match self.server_address.as_str() {
            "localhost" => IpAddr::V4(Ipv4Addr::LOCALHOST),
            other => other
                .parse()
                .map_err(|_| ConfigError::InvalidAddress(other.to_string()))?,
        };
        Ok(SocketAddr::new(ip, self.server_port))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    /// Wall-clock length of one tick. A zero rate counts as 1 Hz.
    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs(1) / self.tick_rate.max(1)
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            frame: FrameConfig {
                max_payload_size: self.max_frame_size,
            },
            outbound_ordering: self.outbound_ordering,
        }
    }

    /// Session settings for a client host.
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            display_name: self.display_name.clone(),
            handshake_timeout: self.handshake_timeout(),
            ping_interval: self.ping_interval(),
            tick_rate: self.tick_rate.max(1),
            monitor: self.monitor_config(),
            ..ClientConfig::default()
        }
    }

    /// Session settings for a server host.
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            handshake_timeout: self.handshake_timeout(),
            max_players: self.max_players,
            monitor: self.monitor_config(),
            ..ServerConfig::default()
        }
    }
}

/// Per-user config directory, `<platform config dir>/cubes`.
///
/// Falls back to the working directory when the platform has none.
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join("cubes"))
        .unwrap_or_else(|| PathBuf::from("."))
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);

        if config_path.exists() {
            let config = Self::read(&config_path)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .enumerate_arrays(false);
        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(config_dir.join(CONFIG_FILE), serialized).map_err(ConfigError::WriteError)
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let new_config = Self::read(&config_dir.join(CONFIG_FILE))?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }

    fn read(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        ron::from_str(&contents).map_err(ConfigError::ParseError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_serializes() {
        let config = Config::default();
        let ron_str =
            ron::ser::to_string_pretty(&config, ron::ser::PrettyConfig::new().depth_limit(3))
                .unwrap();
        assert!(ron_str.contains("server_port: 24842"));
        assert!(ron_str.contains("transport: Tcp"));
        assert!(ron_str.contains("outbound_ordering: Priority"));
    }

    #[test]
    fn test_missing_field_uses_default() {
        let ron_str = "(network: (server_port: 4000))";
        let config: Config = ron::from_str(ron_str).unwrap();
        assert_eq!(config.network.server_port, 4000);
        assert_eq!(config.network.tick_rate, 20);
        assert_eq!(config.debug, DebugConfig::default());
    }

    #[test]
    fn test_extra_field_ignored() {
        let ron_str = "(future_setting: true, network: (compression: false))";
        let result: Result<Config, _> = ron::from_str(ron_str);
        assert!(result.is_ok());
    }

    #[test]
    fn test_enum_fields_parse() {
        let ron_str = "(network: (transport: Memory, outbound_ordering: Fifo))";
        let config: Config = ron::from_str(ron_str).unwrap();
        assert_eq!(config.network.transport, TransportKind::Memory);
        assert_eq!(config.network.outbound_ordering, QueueOrdering::Fifo);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.network.server_address = "10.0.0.1".to_string();
        config.network.max_players = 4;
        config.debug.log_level = "debug".to_string();

        config.save(dir.path()).unwrap();
        let loaded = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_load_or_create_writes_default() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("cubes");
        let config = Config::load_or_create(&nested).unwrap();
        assert_eq!(config, Config::default());
        assert!(nested.join(CONFIG_FILE).exists());
    }

    #[test]
    fn test_reload_detects_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();

        let mut modified = config.clone();
        modified.network.tick_rate = 60;
        modified.save(dir.path()).unwrap();

        let reloaded = config.reload(dir.path()).unwrap().unwrap();
        assert_eq!(reloaded.network.tick_rate, 60);
        assert!(config.reload(dir.path()).unwrap().is_some());
        assert!(reloaded.reload(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_invalid_ron_produces_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "{{not valid}}").unwrap();
        let err = Config::load_or_create(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_socket_addr() {
        let mut network = NetworkConfig::default();
        assert_eq!(
            network.socket_addr().unwrap(),
            "127.0.0.1:24842".parse::<SocketAddr>().unwrap()
        );

        network.server_address = "::1".to_string();
        assert_eq!(
            network.socket_addr().unwrap(),
            "[::1]:24842".parse::<SocketAddr>().unwrap()
        );

        network.server_address = "localhost".to_string();
        assert!(network.socket_addr().unwrap().ip().is_loopback());

        network.server_address = "not an address".to_string();
        assert!(matches!(
            network.socket_addr(),
            Err(ConfigError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_session_configs() {
        let network = NetworkConfig {
            display_name: "alice".to_string(),
            max_players: 2,
            max_frame_size: 4096,
            outbound_ordering: QueueOrdering::Fifo,
            ..NetworkConfig::default()
        };

        let client = network.client_config();
        assert_eq!(client.display_name, "alice");
        assert_eq!(client.ping_interval_ticks(), 200);
        assert_eq!(client.monitor.frame.max_payload_size, 4096);

        let server = network.server_config();
        assert_eq!(server.max_players, 2);
        assert_eq!(server.handshake_timeout, Duration::from_millis(5000));
        assert_eq!(server.monitor.outbound_ordering, QueueOrdering::Fifo);
    }

    #[test]
    fn test_durations() {
        let network = NetworkConfig::default();
        assert_eq!(network.handshake_timeout(), Duration::from_millis(5000));
        assert_eq!(network.ping_interval(), Duration::from_secs(10));
        assert_eq!(network.tick_duration(), Duration::from_millis(50));

        let stalled = NetworkConfig {
            tick_rate: 0,
            ..NetworkConfig::default()
        };
        assert_eq!(stalled.tick_duration(), Duration::from_secs(1));
    }
}
