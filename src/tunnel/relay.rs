use std::sync::Arc;

use anyhow::Result;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tracing::debug;

use crate::connection::logger::{ConnectionStats, log_connection_summary};
use crate::transport::Transport;
use crate::tunnel::protocol::{Message, Target};
use crate::tunnel::state::{ConnectionHandle, ConnectionTable, RunSignal};

/// Largest chunk read from a socket per `DATA` frame.
pub const READ_CHUNK_SIZE: usize = 512;

pub async fn send_message<T: Transport>(transport: &T, msg: &Message) -> Result<()> {
    transport.put(msg.encode()).await?;
    Ok(())
}

/// Everything a relay task needs to pump one socket into the tunnel.
pub struct RelayContext<T> {
    pub transport: Arc<T>,
    pub table: ConnectionTable,
    pub running: RunSignal,
    /// Role of the peer node; every frame this task emits is addressed to it.
    pub target: Target,
}

impl<T> Clone for RelayContext<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            table: self.table.clone(),
            running: self.running.clone(),
            target: self.target,
        }
    }
}

// Read chunks from the socket and forward them as DATA frames until the
// stream ends, the handle is closed, or the node stops. Then tear down and
// announce CLOSE exactly once.
pub async fn relay_socket<T: Transport>(
    ctx: RelayContext<T>,
    conn_id: String,
    handle: Arc<ConnectionHandle>,
    mut reader: OwnedReadHalf,
) {
    let mut stats = ConnectionStats::new(&conn_id, handle.peer());
    let mut buf = vec![0u8; READ_CHUNK_SIZE];

    while ctx.running.is_running() && handle.is_open() {
        tokio::select! {
            result = reader.read(&mut buf) => {
                match result {
                    Ok(0) => {
                        debug!(conn_id = %conn_id, "end of stream");
                        break;
                    }
                    Ok(n) => {
                        stats.bytes_sent += n as u64;
                        let msg = Message::data(ctx.target, conn_id.as_str(), &buf[..n]);
                        if let Err(e) = send_message(ctx.transport.as_ref(), &msg).await {
                            debug!(conn_id = %conn_id, error = %e, "tunnel write failed");
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(conn_id = %conn_id, error = %e, "socket read failed");
                        break;
                    }
                }
            }
            _ = handle.closed() => break,
            _ = ctx.running.stopped() => break,
        }
    }

    ctx.table.remove_entry(&conn_id, &handle).await;
    handle.close().await;
    drop(reader);

    let close = Message::close_connection(ctx.target, conn_id.as_str());
    if let Err(e) = send_message(ctx.transport.as_ref(), &close).await {
        debug!(conn_id = %conn_id, error = %e, "could not announce close");
    }

    stats.bytes_received = handle.bytes_written();
    log_connection_summary(&stats);
}

/// Write an inbound payload to its socket. Returns whether a write happened.
pub async fn deliver_data(table: &ConnectionTable, conn_id: &str, data: &[u8]) -> bool {
    let Some(handle) = table.get(conn_id).await else {
        debug!(conn_id, bytes = data.len(), "data for unknown connection dropped");
        return false;
    };
    // The table lock is released; a concurrent close just makes this write fail.
    match handle.write(data).await {
        Ok(()) => true,
        Err(e) => {
            debug!(conn_id, error = %e, "socket write failed");
            false
        }
    }
}

/// Handle an inbound CLOSE. Absent ids are a no-op.
pub async fn close_connection(table: &ConnectionTable, conn_id: &str) -> bool {
    match table.remove(conn_id).await {
        Some(handle) => {
            handle.close().await;
            debug!(conn_id, "connection closed by peer");
            true
        }
        None => false,
    }
}

/// Close every remaining socket and empty the table.
pub async fn close_all(table: &ConnectionTable) -> usize {
    let entries = table.drain().await;
    let count = entries.len();
    for (_, handle) in entries {
        handle.close().await;
    }
    count
}
