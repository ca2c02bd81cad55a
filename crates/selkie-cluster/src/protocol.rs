//! Wire protocol between workers and the routing host
//!
//! Framing: 4-byte big-endian length prefix followed by a JSON-encoded
//! [`Frame`], bounded by `WIRE_FRAME_SIZE_BYTES_MAX`. Payloads stay opaque
//! to the host; only routing metadata (recipient, topic, type name) is
//! interpreted.

use selkie_core::constants::{WIRE_FRAME_SIZE_BYTES_MAX, WORKER_ID_LENGTH_BYTES_MAX};
use selkie_core::{AgentId, Error, Result, SerializedMessage, SubscriptionSpec, TopicId};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Correlates a request frame with its response
pub type RequestId = u64;

// =============================================================================
// WorkerId
// =============================================================================

/// Unique identifier of a worker process
///
/// Worker ids should be stable across restarts for the same logical worker,
/// typically configured explicitly.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct WorkerId(String);

impl WorkerId {
    /// Create a new WorkerId with validation
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::invalid_identifier(id, "worker id is empty"));
        }
        if id.len() > WORKER_ID_LENGTH_BYTES_MAX {
            return Err(Error::invalid_identifier(
                &id,
                format!(
                    "worker id length {} exceeds limit {}",
                    id.len(),
                    WORKER_ID_LENGTH_BYTES_MAX
                ),
            ));
        }
        let valid = id
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.');
        if !valid {
            return Err(Error::invalid_identifier(
                &id,
                "worker id contains invalid characters",
            ));
        }
        Ok(Self(id))
    }

    /// Get the id as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// WireError
// =============================================================================

/// Error kind carried across the wire
///
/// Maps 1:1 onto the core error taxonomy so a failure keeps its kind when
/// it crosses a process boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireErrorKind {
    UnknownRecipient,
    HandlerNotFound,
    UnhandledMessage,
    MessageDropped,
    Cancelled,
    UnserializableType,
    PeerUnavailable,
    MailboxFull,
    Internal,
}

/// A typed failure carried in a response frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    pub kind: WireErrorKind,
    pub detail: String,
}

impl WireError {
    /// Classify a core error for the wire
    pub fn from_error(err: &Error) -> Self {
        let kind = match err {
            Error::UnknownRecipient { .. } => WireErrorKind::UnknownRecipient,
            Error::HandlerNotFound { .. } => WireErrorKind::HandlerNotFound,
            Error::UnhandledMessage { .. } => WireErrorKind::UnhandledMessage,
            Error::MessageDropped { .. } => WireErrorKind::MessageDropped,
            Error::Cancelled => WireErrorKind::Cancelled,
            Error::UnserializableType { .. }
            | Error::EncodeFailed { .. }
            | Error::DecodeFailed { .. } => WireErrorKind::UnserializableType,
            Error::PeerUnavailable { .. } => WireErrorKind::PeerUnavailable,
            Error::MailboxFull { .. } => WireErrorKind::MailboxFull,
            _ => WireErrorKind::Internal,
        };
        Self {
            kind,
            detail: err.to_string(),
        }
    }

    /// Reconstruct a core error on the receiving side
    pub fn into_error(self) -> Error {
        match self.kind {
            WireErrorKind::UnknownRecipient => Error::UnknownRecipient {
                agent_type: self.detail,
            },
            WireErrorKind::HandlerNotFound => Error::HandlerNotFound {
                agent: "remote".into(),
                type_name: self.detail,
            },
            WireErrorKind::UnhandledMessage => Error::UnhandledMessage {
                agent: "remote".into(),
                type_name: self.detail,
            },
            WireErrorKind::MessageDropped => Error::MessageDropped { stage: self.detail },
            WireErrorKind::Cancelled => Error::Cancelled,
            WireErrorKind::UnserializableType => Error::UnserializableType {
                type_name: self.detail,
            },
            WireErrorKind::PeerUnavailable => Error::PeerUnavailable {
                peer: "remote".into(),
                reason: self.detail,
            },
            WireErrorKind::MailboxFull => Error::MailboxFull {
                agent: self.detail,
                depth: 0,
                limit: 0,
            },
            WireErrorKind::Internal => Error::Internal {
                reason: self.detail,
            },
        }
    }
}

impl From<&Error> for WireError {
    fn from(err: &Error) -> Self {
        Self::from_error(err)
    }
}

// =============================================================================
// Frames
// =============================================================================

/// One protocol message
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Connection handshake; must be the first frame on every connection
    Hello { worker_id: WorkerId },

    /// Handshake result
    HelloAck {
        accepted: bool,
        reason: Option<String>,
    },

    /// Advertise one locally registered agent type and its subscriptions
    Register {
        agent_type: String,
        subscriptions: Vec<SubscriptionSpec>,
    },

    /// Proxied point-to-point send
    Request {
        request_id: RequestId,
        recipient: AgentId,
        sender: Option<AgentId>,
        message: SerializedMessage,
        trace: Option<String>,
    },

    /// Reply to a proxied send
    Response {
        request_id: RequestId,
        result: std::result::Result<Option<SerializedMessage>, WireError>,
    },

    /// Fire-and-forget broadcast, fanned out by the host
    Publish {
        topic: TopicId,
        sender: Option<AgentId>,
        message: SerializedMessage,
        trace: Option<String>,
    },

    /// Directory query: which worker owns this id
    Lookup {
        request_id: RequestId,
        agent_id: AgentId,
    },

    /// Directory answer
    LookupAck {
        request_id: RequestId,
        owner: Option<WorkerId>,
    },
}

impl Frame {
    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Hello { .. } => "hello",
            Frame::HelloAck { .. } => "hello_ack",
            Frame::Register { .. } => "register",
            Frame::Request { .. } => "request",
            Frame::Response { .. } => "response",
            Frame::Publish { .. } => "publish",
            Frame::Lookup { .. } => "lookup",
            Frame::LookupAck { .. } => "lookup_ack",
        }
    }
}

// =============================================================================
// Framing
// =============================================================================

/// Write one length-prefixed frame
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    let json = serde_json::to_vec(frame)
        .map_err(|e| Error::internal(format!("failed to serialize frame: {}", e)))?;

    if json.len() > WIRE_FRAME_SIZE_BYTES_MAX {
        return Err(Error::internal(format!(
            "frame size {} exceeds limit {}",
            json.len(),
            WIRE_FRAME_SIZE_BYTES_MAX
        )));
    }

    let len = json.len() as u32;
    writer
        .write_all(&len.to_be_bytes())
        .await
        .map_err(|e| Error::peer_unavailable("peer", format!("write failed: {}", e)))?;
    writer
        .write_all(&json)
        .await
        .map_err(|e| Error::peer_unavailable("peer", format!("write failed: {}", e)))?;
    writer
        .flush()
        .await
        .map_err(|e| Error::peer_unavailable("peer", format!("flush failed: {}", e)))?;
    Ok(())
}

/// Read one length-prefixed frame
///
/// Returns `Ok(None)` on a clean end of stream.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Frame>> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => {
            return Err(Error::peer_unavailable(
                "peer",
                format!("read failed: {}", e),
            ))
        }
    }

    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > WIRE_FRAME_SIZE_BYTES_MAX {
        return Err(Error::internal(format!(
            "incoming frame size {} exceeds limit {}",
            len, WIRE_FRAME_SIZE_BYTES_MAX
        )));
    }

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| Error::peer_unavailable("peer", format!("read failed: {}", e)))?;

    let frame = serde_json::from_slice(&payload)
        .map_err(|e| Error::internal(format!("failed to parse frame: {}", e)))?;
    Ok(Some(frame))
}
