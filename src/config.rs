//! Relay and session configuration
//!
//! Plain structs with the defaults the binary uses. Loading TLS material
//! happens in [`crate::tls`]; these only carry paths.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 12365;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Relay certificate chain and private key, both PEM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind: SocketAddr,
    /// Per-connection read deadline
    pub read_timeout: Duration,
    pub tls: Option<TlsFiles>,
    /// Admission limit; None accepts without bound
    pub max_connections: Option<usize>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            read_timeout: DEFAULT_READ_TIMEOUT,
            tls: None,
            max_connections: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,
    /// Pinned relay certificate; enables TLS when set
    pub tls_ca: Option<PathBuf>,
    pub username: String,
    /// Source address for the outgoing socket
    pub local_addr: Option<IpAddr>,
}

impl SessionConfig {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            tls_ca: None,
            username: username.into(),
            local_addr: None,
        }
    }

    pub fn server(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    pub fn tls_ca(mut self, path: impl Into<PathBuf>) -> Self {
        self.tls_ca = Some(path.into());
        self
    }

    pub fn local_addr(mut self, addr: IpAddr) -> Self {
        self.local_addr = Some(addr);
        self
    }
}
