//! Dedicated, headless cubes server.
//!
//! Loads `config.ron`, applies CLI overrides, binds TCP and drives
//! `ServerNetworking` from a fixed-rate tick loop until Ctrl+C.

mod shutdown;
mod tick;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::Context;
use clap::Parser;
use cubes_config::{CliArgs, Config, default_config_dir};
use cubes_net::session::server::bind_tcp;
use cubes_net::transport::{SocketConfig, TcpTransport};
use cubes_net::{ClientNetworking, NetworkingState, PacketCatalog, ServerNetworking, TransportKind};
use tracing::{info, warn};

use crate::tick::TickClock;

fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    let config_dir = args.config.clone().unwrap_or_else(default_config_dir);
    let mut config = Config::load_or_create(&config_dir)
        .with_context(|| format!("failed to load config from {}", config_dir.display()))?;
    config.apply_cli_overrides(&args);

    cubes_log::init_logging(
        Some(&config_dir.join("logs")),
        cfg!(debug_assertions),
        Some(&config),
    );

    if args.query {
        query(&config)
    } else {
        run(&config)
    }
}

/// Serve until a shutdown signal arrives.
fn run(config: &Config) -> anyhow::Result<()> {
    let network = &config.network;
    let headless = TransportKind::for_environment(true);
    if network.transport != headless {
        warn!(configured = %network.transport, "dedicated server always uses {headless}");
    }
    let addr = network.socket_addr()?;

    let signals = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("signals")
        .enable_all()
        .build()
        .context("failed to start signal runtime")?;
    let running = shutdown::listen(&signals);

    let listener = bind_tcp(addr, SocketConfig::default())?;
    let mut server = ServerNetworking::start(
        network.server_config(),
        listener,
        Arc::new(PacketCatalog::with_builtin()),
    )?;
    info!(
        address = %server.local_address(),
        tick_rate = network.tick_rate,
        max_players = network.max_players,
        "server listening"
    );

    let mut clock = TickClock::new(network.tick_rate);
    while running.load(Ordering::Acquire) && server.state() == NetworkingState::Running {
        // Protocol packets only; no game state behind the dedicated server yet.
        server.tick(&mut ());
        clock.wait();
    }

    server.stop();
    info!(ticks = clock.ticks(), "server stopped");
    Ok(())
}

/// Print version and player list of a running server.
fn query(config: &Config) -> anyhow::Result<()> {
    let addr = config.network.socket_addr()?;
    let transport = TcpTransport::connect(addr, &SocketConfig::default())
        .with_context(|| format!("failed to connect to {addr}"))?;
    let status = ClientNetworking::query(Box::new(transport), config.network.handshake_timeout())?;

    println!("{addr}: version {}", status.version);
    println!("{} player(s) online", status.players.len());
    for name in &status.players {
        println!("  {name}");
    }
    Ok(())
}
