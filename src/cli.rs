//! Command-line interface for relay and chat modes

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::config::{
    RelayConfig, SessionConfig, TlsFiles, DEFAULT_HOST, DEFAULT_PORT, DEFAULT_READ_TIMEOUT,
};
use crate::error::ChatError;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay, accepting chat clients.
    Relay(RelayArgs),
    /// Connect to a relay and chat from the terminal.
    Chat(ChatArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RelayArgs {
    /// Server binding address.
    #[arg(short, long, default_value = DEFAULT_HOST)]
    pub address: IpAddr,

    /// Server binding port.
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// PEM certificate chain; enables TLS together with --tls-key.
    #[arg(long, requires = "tls_key")]
    pub tls_cert: Option<PathBuf>,

    /// PEM private key for --tls-cert.
    #[arg(long, requires = "tls_cert")]
    pub tls_key: Option<PathBuf>,

    /// Close connections idle for this many seconds.
    #[arg(long, default_value_t = DEFAULT_READ_TIMEOUT.as_secs())]
    pub timeout_secs: u64,

    /// Serve at most this many connections at once.
    #[arg(long)]
    pub max_connections: Option<usize>,
}

impl RelayArgs {
    pub fn into_config(self) -> Result<RelayConfig, ChatError> {
        if self.timeout_secs == 0 {
            return Err(ChatError::Config("--timeout-secs must be positive".to_string()));
        }
        let tls = match (self.tls_cert, self.tls_key) {
            (Some(cert), Some(key)) => Some(TlsFiles { cert, key }),
            _ => None,
        };
        Ok(RelayConfig {
            bind: (self.address, self.port).into(),
            read_timeout: Duration::from_secs(self.timeout_secs),
            tls,
            max_connections: self.max_connections,
        })
    }
}

#[derive(Args, Debug, Clone)]
pub struct ChatArgs {
    /// Display name shown to other users.
    #[arg(short, long)]
    pub name: String,

    /// Relay address.
    #[arg(short, long, default_value = DEFAULT_HOST)]
    pub address: String,

    /// Relay port.
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Pinned relay certificate (PEM); connects with TLS.
    #[arg(short, long)]
    pub tls_ca: Option<PathBuf>,

    /// Local source address for the connection.
    #[arg(long)]
    pub bind_ip: Option<IpAddr>,
}

impl ChatArgs {
    pub fn into_config(self) -> SessionConfig {
        let mut config = SessionConfig::new(self.name).server(self.address, self.port);
        if let Some(ca) = self.tls_ca {
            config = config.tls_ca(ca);
        }
        if let Some(ip) = self.bind_ip {
            config = config.local_addr(ip);
        }
        config
    }
}
