// Multiplexing engine: frame codec, connection table and the two node loops
pub mod client;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod state;

pub use client::Client;
pub use protocol::{Message, MessageKind, Target};
pub use server::Server;
pub use state::ConnectionTable;
