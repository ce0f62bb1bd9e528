//! Echo server
//!
//! Accepts WebSocket peers and sends every message back to its sender.
//! Text messages starting with `/all ` go to every connected peer instead.
//! Options come from `WSMUX_SERVER_CONFIG` (default `config/server.yaml`);
//! an optional first argument overrides the port.

use anyhow::Result;
use std::time::Instant;
use tracing::{info, warn};
use wsmux::{Server, ServerOptions};
use wsmux_tools::bin_common::{
    init_tracing, load_config_from_env, load_dotenv, parse_args, print_banner, print_shutdown,
    ConfigType, RunConfig, ShutdownManager,
};

const BROADCAST_PREFIX: &str = "/all ";

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    load_dotenv();

    let config_path = load_config_from_env(ConfigType::Server);
    let mut options = if config_path.exists() {
        ServerOptions::load(&config_path)?
    } else {
        ServerOptions::default()
    };
    if let Some(port) = parse_args().first() {
        options.port = port.parse()?;
    }
    options.validate()?;

    init_tracing(&options.log_level);
    options.log();

    let run = RunConfig::new("wsmux echo server").with_heartbeat(30);
    let mut server = Server::new();
    server
        .set_options(options)
        .on_establish(|ctx, session| {
            info!(
                session = session.id(),
                peer = %session.peer_addr(),
                total = ctx.session_count(),
                "Peer connected"
            );
        })
        .on_receive(|ctx, session, message| {
            if let Some(text) = message.as_text().ok().and_then(|t| t.strip_prefix(BROADCAST_PREFIX)) {
                let reached = ctx.send(text.to_string());
                info!(session = session.id(), reached, "Broadcast");
                return;
            }
            if let Err(e) = session.send(message) {
                warn!(session = session.id(), "Echo failed: {}", e);
            }
        })
        .on_close(|_, session, status| {
            info!(session = session.id(), "Peer closed: {}", status);
        })
        .on_error(|_, session, error| {
            warn!(session = session.id(), peer = %session.peer_addr(), "Session error: {}", error);
        });

    let addr = server.start()?;
    print_banner(&run.name);
    info!("Listening on ws://{}", addr);

    let shutdown = ShutdownManager::new();
    shutdown.spawn_signal_handler();

    let mut last_beat = Instant::now();
    while shutdown.is_running() {
        shutdown.interruptible_sleep(run.heartbeat_interval()).await;
        if last_beat.elapsed() >= run.heartbeat_interval() {
            info!("Heartbeat: {} active sessions", server.session_count());
            last_beat = Instant::now();
        }
    }

    let remaining = server.session_count();
    server.stop();
    print_shutdown(
        &run.name,
        Some(&format!("Closed {} sessions on shutdown", remaining)),
    );
    Ok(())
}
