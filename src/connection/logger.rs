// Connection logger
use chrono::{DateTime, Local};
use std::net::SocketAddr;

/// Traffic counters for one multiplexed stream.
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    pub conn_id: String,
    pub peer: SocketAddr,
    pub opened_at: DateTime<Local>,
    /// Bytes read from the socket and sent into the tunnel.
    pub bytes_sent: u64,
    /// Bytes received from the tunnel and written to the socket.
    pub bytes_received: u64,
}

impl ConnectionStats {
    pub fn new(conn_id: &str, peer: SocketAddr) -> Self {
        Self {
            conn_id: conn_id.to_string(),
            peer,
            opened_at: Local::now(),
            bytes_sent: 0,
            bytes_received: 0,
        }
    }

    pub fn duration_ms(&self) -> i64 {
        (Local::now() - self.opened_at).num_milliseconds()
    }
}

/// Log the summary line for a connection that has been torn down
pub fn log_connection_summary(stats: &ConnectionStats) {
    tracing::info!(
        conn_id = %stats.conn_id,
        peer = %stats.peer,
        opened_at = %stats.opened_at.format("%H:%M:%S"),
        duration_ms = stats.duration_ms(),
        sent = stats.bytes_sent,
        received = stats.bytes_received,
        "connection closed"
    );
}
