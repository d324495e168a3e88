//! Tunnel many TCP connections over one line-oriented text channel.
//!
//! The server node accepts real connections and announces each one as a
//! stream of JSON frames; the client node replays those frames onto outbound
//! connections to a fixed target and sends the replies back the same way.

pub mod config;
pub mod connection;
pub mod transport;
pub mod tunnel;
pub mod utils;

pub use config::{ConfigError, Mode, TunnelConfig};
pub use transport::{Transport, TransportKind};
pub use tunnel::{Client, Server};
