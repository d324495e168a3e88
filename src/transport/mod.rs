//! Line-oriented channels that carry encoded frames between the two nodes.
//!
//! The engines only ever see the [`Transport`] trait. Concrete channels are
//! picked at startup from [`TransportKind`].
use std::future::Future;
use std::io;

pub mod memory;
pub mod stdio;

pub use memory::MemoryTransport;
pub use stdio::{StdioTransport, StreamTransport};

/// Asynchronous get/put line channel with a start/stop lifecycle.
pub trait Transport: Send + Sync + 'static {
    /// Next line of input without its terminator, `None` once input is exhausted.
    ///
    /// Must be cancel-safe: the engines race it against their stop signal, and
    /// a dropped call must not lose bytes of a partially received line.
    fn get(&self) -> impl Future<Output = io::Result<Option<String>>> + Send;

    /// Hand one already-terminated line to the channel.
    fn put(&self, line: String) -> impl Future<Output = io::Result<()>> + Send;

    fn start(&self) -> impl Future<Output = io::Result<()>> + Send;

    fn stop(&self) -> impl Future<Output = io::Result<()>> + Send;
}

/// Transports selectable by name on the command line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum TransportKind {
    /// Frames on stdin/stdout
    Stdio,
}

/// Remove a trailing `\n` or `\r\n`.
pub(crate) fn strip_terminator(mut line: String) -> String {
    if line.ends_with('\n') {
        line.pop();
        if line.ends_with('\r') {
            line.pop();
        }
    }
    line
}
