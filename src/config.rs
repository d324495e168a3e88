//! Process-level settings: node role, target/listen address and transport.

use thiserror::Error;

use crate::transport::TransportKind;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 8080;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("must run as either server or client")]
    NoMode,

    #[error("cannot run as both server and client")]
    ConflictingModes,
}

/// Which side of the tunnel this process is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Listen for real TCP connections and announce them over the transport.
    Server,
    /// Open outbound connections for streams announced by the server.
    Client,
}

impl Mode {
    pub fn from_flags(server: bool, client: bool) -> Result<Mode, ConfigError> {
        match (server, client) {
            (true, true) => Err(ConfigError::ConflictingModes),
            (true, false) => Ok(Mode::Server),
            (false, true) => Ok(Mode::Client),
            (false, false) => Err(ConfigError::NoMode),
        }
    }
}

#[derive(Clone, Debug)]
pub struct TunnelConfig {
    pub mode: Mode,
    /// Listen host for the server, target host for the client.
    pub host: String,
    pub port: u16,
    pub transport: TransportKind,
}

impl TunnelConfig {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            transport: TransportKind::Stdio,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
