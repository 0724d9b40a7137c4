//! Messages exchanged between the supervisor and a worker.
//!
//! Every frame is a length-prefixed JSON envelope carrying a request id. Responses
//! echo the id of the request they answer, so a heartbeat can overtake a running task.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio_util::codec::LengthDelimitedCodec;

use crate::error::TransportError;

/// Largest frame either side accepts (256 MiB).
pub const MAX_FRAME_LENGTH: usize = 256 * 1024 * 1024;

/// Codec shared by both ends: 4-byte big-endian length, then the payload.
pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

/// Request from supervisor to worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestBody {
    /// Heartbeat probe. No side effects.
    Ping,
    /// Run one extraction over an opaque payload.
    Task { payload: Vec<u8> },
    /// Graceful shutdown.
    Exit,
}

/// Response from worker to supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseBody {
    /// Heartbeat acknowledgment.
    Pong,
    /// Extraction output.
    Success { payload: Vec<u8> },
    /// Structured extraction failure. The worker stays usable.
    Fault { message: String },
}

impl fmt::Display for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pong => write!(f, "pong"),
            Self::Success { payload } => write!(f, "success ({} bytes)", payload.len()),
            Self::Fault { message } => write!(f, "fault ({message})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub body: RequestBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub body: ResponseBody,
}

impl Request {
    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        serde_json::to_vec(self).map_err(|e| TransportError::Protocol(e.to_string()))
    }

    pub fn decode(frame: &[u8]) -> Result<Self, TransportError> {
        serde_json::from_slice(frame).map_err(|e| TransportError::Protocol(e.to_string()))
    }
}

impl Response {
    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        serde_json::to_vec(self).map_err(|e| TransportError::Protocol(e.to_string()))
    }

    pub fn decode(frame: &[u8]) -> Result<Self, TransportError> {
        serde_json::from_slice(frame).map_err(|e| TransportError::Protocol(e.to_string()))
    }
}
