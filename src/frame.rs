//! Wire envelope for the multiplexed WebSocket protocol.
//!
//! One message = one JSON object over a text frame:
//!
//! ```text
//! Client → Server: { "uniqueId", "request": "<target>:<action>:<path>", "dataRequest" }
//! Server → Client: { "uniqueId", "dataResponse" } or { "uniqueId", "error" }
//! ```
//!
//! Decoding is strict: a frame that fails JSON parse, lacks `uniqueId` or
//! `request`, or whose `request` does not split into exactly three non-empty
//! colon-delimited parts is protocol-fatal for the connection.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Reserved control namespace (`ws:ctl:close`, `ws:watch:close`).
pub const CONTROL_TARGET: &str = "ws";

/// Inbound message envelope as it appears on the wire.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WsMessage {
    unique_id: String,
    request: String,
    #[serde(default)]
    data_request: Value,
}

/// The `target:action:path` triple naming one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestPath {
    pub target: String,
    pub action: String,
    pub path: String,
}

impl RequestPath {
    /// Split a `target:action:path` string: exactly three non-empty parts,
    /// no surplus colons.
    pub fn parse(request: &str) -> Result<Self, DecodeError> {
        let mut parts = request.split(':');
        let (target, action, path) = match (parts.next(), parts.next(), parts.next(), parts.next())
        {
            (Some(t), Some(a), Some(p), None) => (t, a, p),
            _ => return Err(DecodeError::BadRequestPath(request.to_owned())),
        };
        if target.is_empty() || action.is_empty() || path.is_empty() {
            return Err(DecodeError::BadRequestPath(request.to_owned()));
        }
        Ok(Self {
            target: target.to_owned(),
            action: action.to_owned(),
            path: path.to_owned(),
        })
    }

    /// True for the reserved `ws` control namespace.
    pub fn is_control(&self) -> bool {
        self.target == CONTROL_TARGET
    }
}

impl fmt::Display for RequestPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.target, self.action, self.path)
    }
}

/// A fully decoded inbound frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub unique_id: String,
    pub request: RequestPath,
    pub body: Value,
}

/// Why an inbound frame could not be decoded. All variants are
/// protocol-fatal: the connection is closed without an error frame.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid JSON frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("uniqueId must be a non-empty string")]
    EmptyUniqueId,
    #[error("request '{0}' must be three non-empty colon-delimited parts")]
    BadRequestPath(String),
}

/// Decode one raw text frame into a [`Frame`].
pub fn decode(raw: &str) -> Result<Frame, DecodeError> {
    let msg: WsMessage = serde_json::from_str(raw)?;
    if msg.unique_id.is_empty() {
        return Err(DecodeError::EmptyUniqueId);
    }
    let request = RequestPath::parse(&msg.request)?;
    Ok(Frame {
        unique_id: msg.unique_id,
        request,
        body: msg.data_request,
    })
}

/// Outbound message envelope. Exactly one of `data_response` / `error`
/// is present on the wire.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WsResponse {
    pub unique_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_response: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WsResponse {
    /// Build a success frame echoing `unique_id`.
    pub fn data(unique_id: &str, value: Value) -> Self {
        Self {
            unique_id: unique_id.to_owned(),
            data_response: Some(value),
            error: None,
        }
    }

    /// Build an error frame echoing `unique_id`.
    pub fn error(unique_id: &str, message: impl fmt::Display) -> Self {
        Self {
            unique_id: unique_id.to_owned(),
            data_response: None,
            error: Some(message.to_string()),
        }
    }

    /// Serialize to the wire text.
    pub fn encode(&self) -> String {
        // WsResponse contains only JSON-representable fields; serialization
        // cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}
