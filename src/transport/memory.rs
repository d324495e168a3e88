use std::io;

use tokio::sync::{Mutex, mpsc};

use super::{Transport, strip_terminator};

/// One end of an in-process line channel.
///
/// Lines put on one end of a [`MemoryTransport::pair`] come out of `get` on
/// the other end, in order.
pub struct MemoryTransport {
    incoming: Mutex<mpsc::UnboundedReceiver<String>>,
    outgoing: mpsc::UnboundedSender<String>,
}

impl MemoryTransport {
    pub fn pair() -> (MemoryTransport, MemoryTransport) {
        let (left_tx, left_rx) = mpsc::unbounded_channel();
        let (right_tx, right_rx) = mpsc::unbounded_channel();
        (
            MemoryTransport {
                incoming: Mutex::new(right_rx),
                outgoing: left_tx,
            },
            MemoryTransport {
                incoming: Mutex::new(left_rx),
                outgoing: right_tx,
            },
        )
    }
}

impl Transport for MemoryTransport {
    async fn get(&self) -> io::Result<Option<String>> {
        let line = self.incoming.lock().await.recv().await;
        Ok(line.map(strip_terminator))
    }

    async fn put(&self, line: String) -> io::Result<()> {
        self.outgoing
            .send(line)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "memory transport peer dropped"))
    }

    async fn start(&self) -> io::Result<()> {
        Ok(())
    }

    async fn stop(&self) -> io::Result<()> {
        self.incoming.lock().await.close();
        Ok(())
    }
}
