//! Chat relay - Entry Point
//!
//! `relay` starts the listener and serves clients until ctrl-c;
//! `chat` runs the terminal client.

use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use chat_relay::acceptor::{Acceptor, Bounded};
use chat_relay::cli::{Cli, Command};
use chat_relay::{console, ChatRelay};

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to install ctrl-c handler: {}", e);
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging with environment filter
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=chat_relay=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chat_relay=info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Relay(args) => {
            let config = args.into_config()?;
            let relay = Arc::new(ChatRelay::new());
            let acceptor = Acceptor::bind(&config, relay).await?;
            info!("Chat relay listening on {}", acceptor.local_addr()?);

            match config.max_connections {
                Some(limit) => {
                    info!("Serving at most {} connections at once", limit);
                    acceptor
                        .with_dispatcher(Bounded::new(limit))
                        .run_until(shutdown_signal())
                        .await
                }
                None => acceptor.run_until(shutdown_signal()).await,
            }
        }
        Command::Chat(args) => console::run(args.into_config()).await?,
    }

    Ok(())
}
