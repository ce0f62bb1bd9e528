//! Line-oriented WebSocket client
//!
//! Sends each stdin line as a text message and prints what arrives.
//! Usage: `wsmux-cat [ws://host:port/path]`; without an argument the URL
//! comes from `WSMUX_URL` or the client config file.

use anyhow::{bail, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use wsmux::core::options::ENV_URL;
use wsmux::{Client, ClientOptions};
use wsmux_tools::bin_common::{
    init_tracing, load_config_from_env, load_dotenv, parse_args, ConfigType, ShutdownManager,
};

#[tokio::main]
async fn main() -> Result<()> {
    load_dotenv();

    let config_path = load_config_from_env(ConfigType::Client);
    let mut options = if config_path.exists() {
        ClientOptions::load(&config_path)?
    } else {
        ClientOptions::default()
    };
    if let Some(url) = parse_args().into_iter().next() {
        options.url = Some(url);
    } else if options.url.is_none() {
        options.url = std::env::var(ENV_URL).ok();
    }
    if options.url.is_none() {
        bail!("usage: wsmux-cat <ws://host:port/path> (or set {})", ENV_URL);
    }
    options.validate()?;

    init_tracing(&options.log_level);
    options.log();

    let (ended_tx, mut ended_rx) = mpsc::unbounded_channel::<()>();
    let mut client = Client::new();
    client.set_options(options)?;
    {
        let ended_tx = ended_tx.clone();
        client.on_error(move |_, e| {
            error!("Connection error: {}", e);
            let _ = ended_tx.send(());
        });
    }
    client
        .on_establish(|conn| info!(conn = conn.id(), "Connected"))
        .on_receive(|_, message| match message.as_text() {
            Ok(text) => println!("{}", text),
            Err(_) => println!("<{} bytes binary>", message.len()),
        })
        .on_close(move |_, status| {
            info!("Connection closed: {}", status);
            let _ = ended_tx.send(());
        });
    client.connect()?;

    let shutdown = ShutdownManager::new();
    shutdown.spawn_signal_handler();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    Some(line) => {
                        if let Err(e) = client.send(line) {
                            warn!("Send failed: {}", e);
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = ended_rx.recv() => break,
            _ = shutdown.wait() => break,
        }
    }

    client.disconnect(None);
    let stats = client.stats();
    info!(
        "Sent {} messages ({} bytes), received {} ({} bytes)",
        stats.messages_sent, stats.bytes_sent, stats.messages_received, stats.bytes_received
    );
    Ok(())
}
