use std::io;

use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Stdin, Stdout,
};
use tokio::sync::Mutex;

use super::{Transport, strip_terminator};

/// Frames read from any byte stream and written to another, one per line.
pub struct StreamTransport<R, W> {
    reader: Mutex<LineReader<R>>,
    writer: Mutex<W>,
}

struct LineReader<R> {
    inner: BufReader<R>,
    // Bytes of a line whose `get` was cancelled before the terminator arrived.
    pending: Vec<u8>,
}

/// Frames on stdin/stdout.
///
/// Tokio reads stdin on a blocking thread that can't be interrupted, so a
/// process using this transport must exit explicitly once the node stops
/// rather than wait for the runtime to wind down.
pub type StdioTransport = StreamTransport<Stdin, Stdout>;

impl<R, W> StreamTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: Mutex::new(LineReader {
                inner: BufReader::new(reader),
                pending: Vec::new(),
            }),
            writer: Mutex::new(writer),
        }
    }
}

impl StdioTransport {
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }
}

impl Default for StdioTransport {
    fn default() -> Self {
        Self::stdio()
    }
}

impl<R, W> Transport for StreamTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    // Cancel-safe: `read_until` appends to `pending`, which outlives the future.
    async fn get(&self) -> io::Result<Option<String>> {
        let mut reader = self.reader.lock().await;
        let LineReader { inner, pending } = &mut *reader;
        let n = inner.read_until(b'\n', pending).await?;
        if n == 0 && pending.is_empty() {
            return Ok(None);
        }
        let buf = std::mem::take(pending);
        // Invalid UTF-8 can't be a frame; let the codec reject it.
        let line = String::from_utf8_lossy(&buf).into_owned();
        Ok(Some(strip_terminator(line)))
    }

    async fn put(&self, line: String) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await
    }

    async fn start(&self) -> io::Result<()> {
        Ok(())
    }

    async fn stop(&self) -> io::Result<()> {
        self.writer.lock().await.flush().await
    }
}
