// Tunnel protocol - one JSON record per line
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Line terminator appended to every encoded frame.
pub const LINE_TERMINATOR: &str = "\r\n";

/// Which node a frame is addressed to.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    Server,
    Client,
}

impl Target {
    pub fn as_str(&self) -> &'static str {
        match self {
            Target::Server => "server",
            Target::Client => "client",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    #[serde(rename = "NEW")]
    NewConnection,
    #[serde(rename = "CLOSE")]
    CloseConnection,
    #[serde(rename = "DATA")]
    Data,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid payload encoding: {0}")]
    Payload(#[from] base64::DecodeError),
}

/// A single multiplexed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub target: Target,
    pub conn_id: String,
    pub kind: MessageKind,
    pub data: Vec<u8>,
}

// Wire shape of a message; `data` carries the base64 text.
#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct Frame {
    target: Target,
    conn_id: String,
    #[serde(rename = "type")]
    kind: MessageKind,
    data: String,
}

impl Message {
    pub fn new_connection(target: Target, conn_id: impl Into<String>) -> Self {
        Self {
            target,
            conn_id: conn_id.into(),
            kind: MessageKind::NewConnection,
            data: Vec::new(),
        }
    }

    pub fn close_connection(target: Target, conn_id: impl Into<String>) -> Self {
        Self {
            target,
            conn_id: conn_id.into(),
            kind: MessageKind::CloseConnection,
            data: Vec::new(),
        }
    }

    pub fn data(target: Target, conn_id: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            target,
            conn_id: conn_id.into(),
            kind: MessageKind::Data,
            data: data.into(),
        }
    }

    /// Serialize to a single `\r\n`-terminated line.
    pub fn encode(&self) -> String {
        let frame = Frame {
            target: self.target,
            conn_id: self.conn_id.clone(),
            kind: self.kind,
            data: BASE64.encode(&self.data),
        };
        // A struct of strings and unit enums always serializes.
        let mut line = serde_json::to_string(&frame).unwrap_or_default();
        line.push_str(LINE_TERMINATOR);
        line
    }

    /// Parse one line, reporting why it was rejected.
    pub fn parse(line: &str) -> Result<Message, CodecError> {
        let frame: Frame = serde_json::from_str(line.trim_end_matches(['\r', '\n']))?;
        let data = BASE64.decode(frame.data.as_bytes())?;
        Ok(Message {
            target: frame.target,
            conn_id: frame.conn_id,
            kind: frame.kind,
            data,
        })
    }

    /// Parse one line, yielding `None` for anything that is not a frame.
    pub fn decode(line: &str) -> Option<Message> {
        Self::parse(line).ok()
    }
}
