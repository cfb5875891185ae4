//! Command-line argument parsing.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Command-line arguments shared by cubes hosts.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "cubes-server", about = "Dedicated cubes server")]
pub struct CliArgs {
    /// Address to bind (server) or connect to (client).
    #[arg(long)]
    pub address: Option<String>,

    /// Port to bind or connect to.
    #[arg(long)]
    pub port: Option<u16>,

    /// Simulation ticks per second.
    #[arg(long)]
    pub tick_rate: Option<u32>,

    /// Maximum connected players.
    #[arg(long)]
    pub max_players: Option<usize>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Print the status of the server at address:port and exit.
    #[arg(long)]
    pub query: bool,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref addr) = args.address {
            self.network.server_address = addr.clone();
        }
        if let Some(port) = args.port {
            self.network.server_port = port;
        }
        if let Some(rate) = args.tick_rate {
            self.network.tick_rate = rate.max(1);
        }
        if let Some(max) = args.max_players {
            self.network.max_players = max;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_override() {
        let mut config = Config::default();
        let args = CliArgs {
            address: Some("0.0.0.0".to_string()),
            port: Some(30000),
            ..CliArgs::default()
        };
        config.apply_cli_overrides(&args);
        assert_eq!(config.network.server_address, "0.0.0.0");
        assert_eq!(config.network.server_port, 30000);
        // Non-overridden fields retain defaults
        assert_eq!(config.network.tick_rate, 20);
        assert_eq!(config.debug.log_level, "info");
    }

    #[test]
    fn test_cli_no_override() {
        let original = Config::default();
        let mut config = Config::default();
        config.apply_cli_overrides(&CliArgs::default());
        assert_eq!(config, original);
    }

    #[test]
    fn test_cli_zero_tick_rate_clamped() {
        let mut config = Config::default();
        let args = CliArgs {
            tick_rate: Some(0),
            ..CliArgs::default()
        };
        config.apply_cli_overrides(&args);
        assert_eq!(config.network.tick_rate, 1);
    }

    #[test]
    fn test_cli_parses_flags() {
        let args = CliArgs::parse_from([
            "cubes-server",
            "--port",
            "25000",
            "--log-level",
            "debug",
            "--config",
            "/tmp/cubes",
            "--query",
        ]);
        assert_eq!(args.port, Some(25000));
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert_eq!(args.config, Some(PathBuf::from("/tmp/cubes")));
        assert_eq!(args.address, None);
        assert!(args.query);
    }
}
