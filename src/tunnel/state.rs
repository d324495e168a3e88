use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Mutex, Notify, watch};

/// Lifecycle of one multiplexed stream on this node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closing,
    Closed,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Open,
            1 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// The socket side of a table entry.
///
/// Holds the write half of the real TCP stream; the read half belongs to the
/// relay task. Closing wakes that task so its pending read is abandoned.
pub struct ConnectionHandle {
    peer: SocketAddr,
    writer: Mutex<Option<OwnedWriteHalf>>,
    state: AtomicU8,
    close_notify: Notify,
    bytes_written: AtomicU64,
}

impl ConnectionHandle {
    pub fn new(peer: SocketAddr, writer: OwnedWriteHalf) -> Self {
        Self {
            peer,
            writer: Mutex::new(Some(writer)),
            state: AtomicU8::new(ConnectionState::Open as u8),
            close_notify: Notify::new(),
            bytes_written: AtomicU64::new(0),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// Write `data` to the socket and wait for it to be flushed.
    pub async fn write(&self, data: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        let writer = writer
            .as_mut()
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotConnected))?;
        writer.write_all(data).await?;
        writer.flush().await?;
        self.bytes_written
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Close the socket. Returns `true` only for the call that actually closed it.
    pub async fn close(&self) -> bool {
        if self
            .state
            .compare_exchange(
                ConnectionState::Open as u8,
                ConnectionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }

        // Single waiter (the relay task); the permit is kept if it isn't polling yet.
        self.close_notify.notify_one();

        if let Some(mut writer) = self.writer.lock().await.take() {
            // Peer may already be gone
            let _ = writer.shutdown().await;
        }
        self.state
            .store(ConnectionState::Closed as u8, Ordering::Release);
        true
    }

    /// Resolves once `close` has been called.
    pub async fn closed(&self) {
        if !self.is_open() {
            return;
        }
        self.close_notify.notified().await;
    }
}

/// Registry of live streams for one node, keyed by connection id.
#[derive(Clone, Default)]
pub struct ConnectionTable {
    inner: Arc<Mutex<HashMap<String, Arc<ConnectionHandle>>>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new entry. Refuses ids that are already present.
    pub async fn insert(&self, conn_id: &str, handle: Arc<ConnectionHandle>) -> bool {
        let mut map = self.inner.lock().await;
        if map.contains_key(conn_id) {
            return false;
        }
        map.insert(conn_id.to_string(), handle);
        true
    }

    pub async fn remove(&self, conn_id: &str) -> Option<Arc<ConnectionHandle>> {
        self.inner.lock().await.remove(conn_id)
    }

    /// Remove `conn_id` only while it still maps to `handle`.
    pub async fn remove_entry(&self, conn_id: &str, handle: &Arc<ConnectionHandle>) -> bool {
        let mut map = self.inner.lock().await;
        match map.get(conn_id) {
            Some(current) if Arc::ptr_eq(current, handle) => {
                map.remove(conn_id);
                true
            }
            _ => false,
        }
    }

    pub async fn get(&self, conn_id: &str) -> Option<Arc<ConnectionHandle>> {
        self.inner.lock().await.get(conn_id).cloned()
    }

    pub async fn contains(&self, conn_id: &str) -> bool {
        self.inner.lock().await.contains_key(conn_id)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Take every entry out of the table.
    pub async fn drain(&self) -> Vec<(String, Arc<ConnectionHandle>)> {
        self.inner.lock().await.drain().collect()
    }
}

/// Observable `running` flag shared by a node's loops.
#[derive(Clone)]
pub struct RunSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for RunSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl RunSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn start(&self) {
        self.tx.send_replace(true);
    }

    pub fn stop(&self) {
        self.tx.send_replace(false);
    }

    pub fn is_running(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the flag is false.
    pub async fn stopped(&self) {
        let mut rx = self.tx.subscribe();
        // Sender lives as long as self, so `changed` cannot fail here.
        while *rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Fresh connection id: 128 random bits as lower-case hex.
pub fn generate_conn_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    async fn handle_pair() -> (Arc<ConnectionHandle>, TcpStream) {
        let (ours, theirs) = socket_pair().await;
        let peer = ours.peer_addr().unwrap();
        let (_read, write) = ours.into_split();
        (Arc::new(ConnectionHandle::new(peer, write)), theirs)
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (handle, mut remote) = handle_pair().await;
        assert!(handle.is_open());

        assert!(handle.close().await);
        assert!(!handle.close().await);
        assert_eq!(handle.state(), ConnectionState::Closed);

        // Remote sees a single orderly end-of-stream
        let mut buf = [0u8; 8];
        let n = timeout(Duration::from_secs(1), remote.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_write_after_close_fails_quietly() {
        let (handle, _remote) = handle_pair().await;
        handle.close().await;
        assert!(handle.write(b"late").await.is_err());
    }

    #[tokio::test]
    async fn test_write_counts_bytes() {
        let (handle, mut remote) = handle_pair().await;
        handle.write(b"hello").await.unwrap();

        let mut buf = [0u8; 5];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(handle.bytes_written(), 5);
    }

    #[tokio::test]
    async fn test_closed_resolves_after_close() {
        let (handle, _remote) = handle_pair().await;
        let waiter = {
            let handle = Arc::clone(&handle);
            tokio::spawn(async move { handle.closed().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.close().await;
        timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_table_rejects_duplicate_id() {
        let table = ConnectionTable::new();
        let (first, _r1) = handle_pair().await;
        let (second, _r2) = handle_pair().await;

        assert!(table.insert("a", Arc::clone(&first)).await);
        assert!(!table.insert("a", second).await);
        assert_eq!(table.len().await, 1);
        assert!(Arc::ptr_eq(&table.get("a").await.unwrap(), &first));
    }

    #[tokio::test]
    async fn test_remove_entry_ignores_recycled_id() {
        let table = ConnectionTable::new();
        let (stale, _r1) = handle_pair().await;
        let (fresh, _r2) = handle_pair().await;

        table.insert("a", Arc::clone(&stale)).await;
        assert!(table.remove("a").await.is_some());
        table.insert("a", Arc::clone(&fresh)).await;

        assert!(!table.remove_entry("a", &stale).await);
        assert!(table.contains("a").await);
        assert!(table.remove_entry("a", &fresh).await);
        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn test_drain_empties_table() {
        let table = ConnectionTable::new();
        let (a, _r1) = handle_pair().await;
        let (b, _r2) = handle_pair().await;
        table.insert("a", a).await;
        table.insert("b", b).await;

        let mut ids: Vec<_> = table.drain().await.into_iter().map(|(id, _)| id).collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(table.is_empty().await);
        assert!(table.remove("a").await.is_none());
    }

    #[tokio::test]
    async fn test_run_signal_wakes_waiters() {
        let signal = RunSignal::new();
        signal.start();
        assert!(signal.is_running());

        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.stopped().await })
        };
        signal.stop();
        timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert!(!signal.is_running());
    }

    #[test]
    fn test_generated_ids_are_distinct() {
        let ids: std::collections::HashSet<_> = (0..1000).map(|_| generate_conn_id()).collect();
        assert_eq!(ids.len(), 1000);
        assert!(ids.iter().all(|id| id.len() == 32));
    }
}
