use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::transport::Transport;
use crate::tunnel::protocol::{Message, MessageKind, Target};
use crate::tunnel::relay::{
    RelayContext, close_all, close_connection, deliver_data, relay_socket, send_message,
};
use crate::tunnel::state::{ConnectionHandle, ConnectionTable, RunSignal, generate_conn_id};

/// Accepts real TCP connections and relays them across the transport.
pub struct Server<T: Transport> {
    host: String,
    port: u16,
    transport: Arc<T>,
    table: ConnectionTable,
    running: RunSignal,
}

impl<T: Transport> Clone for Server<T> {
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

impl<T: Transport> Server<T> {
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

    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = format!("{}:{}", self.host, self.port);
        TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind tunnel listener on {}", addr))
    }

    /// Bind and serve until stopped. Bind failure is returned immediately.
    pub async fn start(&self) -> Result<()> {
        let listener = self.bind().await?;
        self.run(listener).await
    }

    /// Serve on an already bound listener until stopped or the transport ends.
    pub async fn run(&self, listener: TcpListener) -> Result<()> {
        self.running.start();
        if let Ok(addr) = listener.local_addr() {
            info!(address = %addr, "tunnel server listening");
        }

        let mut tasks = JoinSet::new();
        let result = tokio::select! {
            result = self.process_frames() => result,
            _ = self.accept_loop(&listener, &mut tasks) => Ok(()),
        };
        self.running.stop();
        drop(listener);

        let closed = close_all(&self.table).await;
        if closed > 0 {
            info!(closed, "closed remaining connections");
        }
        while tasks.join_next().await.is_some() {}
        info!("tunnel server stopped");
        result
    }

    pub fn stop(&self) {
        self.running.stop();
    }

    async fn accept_loop(&self, listener: &TcpListener, tasks: &mut JoinSet<()>) {
        let mut failures = 0u32;
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, _addr)) => {
                            failures = 0;
                            if let Some((conn_id, handle, reader)) = self.register(socket).await {
                                tasks.spawn(announce_and_relay(
                                    self.relay_context(),
                                    conn_id,
                                    handle,
                                    reader,
                                ));
                            }
                        }
                        Err(e) => {
                            // e.g. EMFILE: retrying at once would spin
                            let delay = accept_backoff(failures);
                            failures = failures.saturating_add(1);
                            error!(error = %e, retry_in = ?delay, "accept error");
                            tokio::select! {
                                _ = tokio::time::sleep(delay) => {}
                                _ = self.running.stopped() => break,
                            }
                        }
                    }
                }
                // Reap finished relays so the set doesn't grow unbounded
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
                _ = self.running.stopped() => break,
            }
        }
    }

    // Assign a fresh id and put the socket in the table.
    async fn register(
        &self,
        socket: TcpStream,
    ) -> Option<(String, Arc<ConnectionHandle>, OwnedReadHalf)> {
        let peer = match socket.peer_addr() {
            Ok(peer) => peer,
            Err(e) => {
                warn!(error = %e, "accepted socket has no peer address");
                return None;
            }
        };
        let (reader, writer) = socket.into_split();
        let handle = Arc::new(ConnectionHandle::new(peer, writer));

        let conn_id = loop {
            let candidate = generate_conn_id();
            if self.table.insert(&candidate, Arc::clone(&handle)).await {
                break candidate;
            }
        };
        info!(conn_id = %conn_id, peer = %peer, "accepted connection");
        Some((conn_id, handle, reader))
    }

    fn relay_context(&self) -> RelayContext<T> {
        RelayContext {
            transport: Arc::clone(&self.transport),
            table: self.table.clone(),
            running: self.running.clone(),
            target: Target::Client,
        }
    }

    async fn process_frames(&self) -> Result<()> {
        while self.running.is_running() {
            let line = tokio::select! {
                line = self.transport.get() => line.context("Failed to read from transport")?,
                _ = self.running.stopped() => break,
            };
            let Some(line) = line else {
                info!("transport input closed");
                break;
            };
            let Some(msg) = Message::decode(&line) else {
                debug!(line = %line, "ignoring malformed frame");
                continue;
            };
            if msg.target != Target::Server {
                continue;
            }

            match msg.kind {
                MessageKind::CloseConnection => {
                    close_connection(&self.table, &msg.conn_id).await;
                }
                MessageKind::Data => {
                    deliver_data(&self.table, &msg.conn_id, &msg.data).await;
                }
                MessageKind::NewConnection => {
                    debug!(conn_id = %msg.conn_id, "server ignores NEW frames");
                }
            }
        }
        Ok(())
    }
}

/// Delay before retrying `accept` after `failures` consecutive errors.
fn accept_backoff(failures: u32) -> Duration {
    const BASE_DELAY: Duration = Duration::from_millis(10);
    const MAX_DELAY: Duration = Duration::from_secs(1);

    // 10ms, 20ms, 40ms, ... 1s (max)
    (BASE_DELAY * 2_u32.pow(failures.min(7))).min(MAX_DELAY)
}

// NEW goes out before any DATA for the stream.
async fn announce_and_relay<T: Transport>(
    ctx: RelayContext<T>,
    conn_id: String,
    handle: Arc<ConnectionHandle>,
    reader: OwnedReadHalf,
) {
    let announce = Message::new_connection(ctx.target, conn_id.as_str());
    if let Err(e) = send_message(ctx.transport.as_ref(), &announce).await {
        warn!(conn_id = %conn_id, error = %e, "could not announce connection");
    }
    relay_socket(ctx, conn_id, handle, reader).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::timeout;

    async fn next_message(transport: &MemoryTransport) -> Message {
        let line = timeout(Duration::from_secs(2), transport.get())
            .await
            .expect("timed out waiting for frame")
            .unwrap()
            .expect("transport closed");
        Message::decode(&line).expect("malformed frame")
    }

    async fn start_server() -> (
        Server<MemoryTransport>,
        MemoryTransport,
        std::net::SocketAddr,
        tokio::task::JoinHandle<Result<()>>,
    ) {
        let (local, wire) = MemoryTransport::pair();
        let server = Server::new("127.0.0.1", 0, Arc::new(local));
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = {
            let server = server.clone();
            tokio::spawn(async move { server.run(listener).await })
        };
        (server, wire, addr, task)
    }

    #[test]
    fn test_accept_backoff_grows_and_caps() {
        assert_eq!(accept_backoff(0), Duration::from_millis(10));
        assert_eq!(accept_backoff(1), Duration::from_millis(20));
        assert_eq!(accept_backoff(3), Duration::from_millis(80));
        assert_eq!(accept_backoff(7), Duration::from_secs(1));
        assert_eq!(accept_backoff(u32::MAX), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_bind_failure_is_fatal() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();
        let (local, _wire) = MemoryTransport::pair();
        let server = Server::new("127.0.0.1", port, Arc::new(local));
        assert!(server.start().await.is_err());
    }

    #[tokio::test]
    async fn test_announces_then_relays_data() {
        let (server, wire, addr, _task) = start_server().await;

        let mut socket = TcpStream::connect(addr).await.unwrap();
        socket.write_all(b"ping").await.unwrap();

        let new = next_message(&wire).await;
        assert_eq!(new.kind, MessageKind::NewConnection);
        assert_eq!(new.target, Target::Client);
        assert!(new.data.is_empty());

        let data = next_message(&wire).await;
        assert_eq!(data.kind, MessageKind::Data);
        assert_eq!(data.conn_id, new.conn_id);
        assert_eq!(data.data, b"ping");
        assert!(server.connections().contains(&new.conn_id).await);
    }

    #[tokio::test]
    async fn test_inbound_data_reaches_socket() {
        let (_server, wire, addr, _task) = start_server().await;
        let mut socket = TcpStream::connect(addr).await.unwrap();
        let new = next_message(&wire).await;

        wire
            .put(Message::data(Target::Server, new.conn_id.as_str(), b"pong".to_vec()).encode())
            .await
            .unwrap();

        let mut buf = [0u8; 4];
        timeout(Duration::from_secs(2), socket.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_ignores_frames_for_client_and_garbage() {
        let (_server, wire, addr, _task) = start_server().await;
        let mut socket = TcpStream::connect(addr).await.unwrap();
        let new = next_message(&wire).await;

        wire.put("not a frame\r\n".to_string()).await.unwrap();
        wire
            .put(Message::data(Target::Client, new.conn_id.as_str(), b"nope".to_vec()).encode())
            .await
            .unwrap();
        wire
            .put(Message::data(Target::Server, "unknown", b"nope".to_vec()).encode())
            .await
            .unwrap();
        wire
            .put(Message::data(Target::Server, new.conn_id.as_str(), b"yes".to_vec()).encode())
            .await
            .unwrap();

        let mut buf = [0u8; 3];
        timeout(Duration::from_secs(2), socket.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"yes");
    }

    #[tokio::test]
    async fn test_remote_close_twice_is_noop() {
        let (server, wire, addr, _task) = start_server().await;
        let mut socket = TcpStream::connect(addr).await.unwrap();
        let new = next_message(&wire).await;

        let close = Message::close_connection(Target::Server, new.conn_id.as_str()).encode();
        wire.put(close.clone()).await.unwrap();
        wire.put(close).await.unwrap();

        let mut buf = [0u8; 1];
        let n = timeout(Duration::from_secs(2), socket.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);

        // The relay still reports its own teardown once
        let echoed = next_message(&wire).await;
        assert_eq!(echoed.kind, MessageKind::CloseConnection);
        assert_eq!(echoed.conn_id, new.conn_id);
        assert!(!server.connections().contains(&new.conn_id).await);
    }

    #[tokio::test]
    async fn test_concurrent_connections_get_distinct_ids() {
        let (server, wire, addr, _task) = start_server().await;

        let mut sockets = Vec::new();
        for _ in 0..16 {
            sockets.push(TcpStream::connect(addr).await.unwrap());
        }

        let mut ids = std::collections::HashSet::new();
        for _ in 0..16 {
            let msg = next_message(&wire).await;
            assert_eq!(msg.kind, MessageKind::NewConnection);
            ids.insert(msg.conn_id);
        }
        assert_eq!(ids.len(), 16);
        assert_eq!(server.connections().len().await, 16);
    }

    #[tokio::test]
    async fn test_stop_closes_all_connections() {
        let (server, wire, addr, task) = start_server().await;
        let mut socket = TcpStream::connect(addr).await.unwrap();
        next_message(&wire).await;

        server.stop();
        timeout(Duration::from_secs(2), task)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();

        assert!(server.connections().is_empty().await);
        let mut buf = [0u8; 1];
        let n = timeout(Duration::from_secs(2), socket.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_transport_end_stops_server() {
        let (server, wire, _addr, task) = start_server().await;
        drop(wire);
        timeout(Duration::from_secs(2), task)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
        assert!(!server.is_running());
    }
}
