use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::transport::Transport;
use crate::tunnel::protocol::{Message, MessageKind, Target};
use crate::tunnel::relay::{RelayContext, close_all, close_connection, deliver_data, relay_socket};
use crate::tunnel::state::{ConnectionHandle, ConnectionTable, RunSignal};

/// Replays announced streams onto outbound connections to a fixed target.
pub struct Client<T: Transport> {
    host: String,
    port: u16,
    transport: Arc<T>,
    table: ConnectionTable,
    running: RunSignal,
}

impl<T: Transport> Clone for Client<T> {
    fn clone(&self) -> Self {
        Self {
            host: self.host.clone(),
            port: self.port,
            transport: Arc::clone(&self.transport),
            table: self.table.clone(),
            running: self.running.clone(),
        }
    }
}

impl<T: Transport> Client<T> {
    pub fn new(host: impl Into<String>, port: u16, transport: Arc<T>) -> Self {
        Self {
            host: host.into(),
            port,
            transport,
            table: ConnectionTable::new(),
            running: RunSignal::new(),
        }
    }

    pub fn connections(&self) -> &ConnectionTable {
        &self.table
    }

    pub fn is_running(&self) -> bool {
        self.running.is_running()
    }

    pub fn stop(&self) {
        self.running.stop();
    }

    /// Process inbound frames until stopped or the transport ends.
    pub async fn start(&self) -> Result<()> {
        self.running.start();
        info!(target_host = %self.host, target_port = self.port, "tunnel client started");

        let mut tasks = JoinSet::new();
        // Frame handling can block on a socket write or connect; stop must not wait on it.
        let result = tokio::select! {
            result = self.process_frames(&mut tasks) => result,
            _ = self.running.stopped() => Ok(()),
        };
        self.running.stop();

        let closed = close_all(&self.table).await;
        if closed > 0 {
            info!(closed, "closed remaining connections");
        }
        while tasks.join_next().await.is_some() {}
        info!("tunnel client stopped");
        result
    }

    async fn process_frames(&self, tasks: &mut JoinSet<()>) -> Result<()> {
        while self.running.is_running() {
            // Reap finished relays so the set doesn't grow unbounded
            while tasks.try_join_next().is_some() {}

            let line = self
                .transport
                .get()
                .await
                .context("Failed to read from transport")?;
            let Some(line) = line else {
                info!("transport input closed");
                break;
            };
            let Some(msg) = Message::decode(&line) else {
                debug!(line = %line, "ignoring malformed frame");
                continue;
            };
            if msg.target != Target::Client {
                continue;
            }

            match msg.kind {
                MessageKind::NewConnection => self.open_connection(msg.conn_id, tasks).await,
                MessageKind::CloseConnection => {
                    close_connection(&self.table, &msg.conn_id).await;
                }
                MessageKind::Data => {
                    deliver_data(&self.table, &msg.conn_id, &msg.data).await;
                }
            }
        }
        Ok(())
    }

    async fn open_connection(&self, conn_id: String, tasks: &mut JoinSet<()>) {
        if self.table.contains(&conn_id).await {
            debug!(conn_id = %conn_id, "duplicate NEW ignored");
            return;
        }

        let addr = format!("{}:{}", self.host, self.port);
        let socket = match TcpStream::connect(&addr).await {
            Ok(socket) => socket,
            Err(e) => {
                // No entry; the peer's side will time out or close on its own.
                warn!(conn_id = %conn_id, address = %addr, error = %e, "failed to connect");
                return;
            }
        };
        let peer = match socket.peer_addr() {
            Ok(peer) => peer,
            Err(e) => {
                warn!(conn_id = %conn_id, error = %e, "connected socket has no peer address");
                return;
            }
        };

        let (reader, writer) = socket.into_split();
        let handle = Arc::new(ConnectionHandle::new(peer, writer));
        if !self.table.insert(&conn_id, Arc::clone(&handle)).await {
            return;
        }
        info!(conn_id = %conn_id, peer = %peer, "opened outbound connection");

        let ctx = RelayContext {
            transport: Arc::clone(&self.transport),
            table: self.table.clone(),
            running: self.running.clone(),
            target: Target::Server,
        };
        tasks.spawn(relay_socket(ctx, conn_id, handle, reader));
    }
}
