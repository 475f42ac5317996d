//! Session log example: connect, join channels and print every event as JSON.
//!
//! Usage:
//!   cargo run --example session_log -- --server ircs://irc.libera.chat \
//!     --nick logbot --channel "#test"
//!
//! Set `RUST_LOG=irc_session=debug` to watch the state machine.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use irc_session::{
    ConnectionConfig, JoinRequest, Profile, Scheduler, Server, ServerAddress, TransportRegistry,
};

#[derive(Parser)]
#[command(name = "session-log", about = "Log one IRC session as JSON events")]
struct Args {
    #[arg(long, env = "IRC_SERVER", default_value = "ircs://irc.libera.chat")]
    server: String,
    #[arg(long, default_value = "irc-session")]
    nick: String,
    /// May be given more than once.
    #[arg(long)]
    channel: Vec<String>,
    /// TOML connection settings; defaults enable reconnecting.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("irc_session=info")),
        )
        .init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => ConnectionConfig::load(path)?,
        None => ConnectionConfig {
            reconnect_on_disconnect: true,
            reconnect_on_connect_failure: true,
            ..ConnectionConfig::default()
        },
    };
    let address = ServerAddress::parse(&args.server).context("invalid --server")?;
    let scheduler = Scheduler::current().context("no tokio runtime")?;

    let (server, pump) = Server::new(Arc::new(config), TransportRegistry::with_defaults(), scheduler);
    let mut events = server.events().subscribe();
    tokio::spawn(pump.run());

    // Queued until registration completes.
    let requests: Vec<JoinRequest> = args.channel.iter().map(|c| JoinRequest::new(c)).collect();
    server.group_chat_manager().join(true, &requests);
    server.connect(address, Profile::new(&args.nick))?;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => println!("{}", event.to_json()),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    server.close()?;
    // Give the transport a moment to send QUIT.
    tokio::time::sleep(Duration::from_millis(500)).await;
    Ok(())
}
