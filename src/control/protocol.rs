//! Control-plane wire protocol.
//!
//! Newline-delimited JSON over a Unix domain socket. Every frame carries the
//! protocol version:
//!
//! ```text
//! -> {"version":1,"request":{"type":"stop","force":true,"timeout_ms":5000}}
//! <- {"version":1,"response":{"type":"stop","success":true,"message":"stopped"}}
//! <- {"version":1,"error":{"kind":"approval_not_found","message":"..."}}
//! ```
//!
//! The server reads `version` before looking at the body, so a client
//! speaking another version gets `version_mismatch` rather than a parse error
//! about an unfamiliar message shape.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::agent::{AgentStatus, ApprovalRequest};

pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum accepted frame length (1 MiB).
pub const MAX_LINE_LENGTH: usize = 1024 * 1024;

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    Status,
    Stop {
        #[serde(default)]
        force: bool,
        /// Drain deadline override, milliseconds.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    Approve {
        id: String,
    },
    Reject {
        id: String,
    },
}

impl ControlRequest {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Stop { .. } => "stop",
            Self::Approve { .. } => "approve",
            Self::Reject { .. } => "reject",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    pub version: u32,
    pub request: ControlRequest,
}

impl RequestFrame {
    pub fn new(request: ControlRequest) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            request,
        }
    }
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub pid: u32,
    /// Agent build version.
    pub version: String,
    pub status: AgentStatus,
    /// The pending approval request, with its description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval: Option<ApprovalRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopResponse {
    pub success: bool,
    pub message: String,
}

/// Answer to both Approve and Reject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApproveResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlResponse {
    Status(StatusResponse),
    Stop(StopResponse),
    Approve(ApproveResponse),
}

/// Error categories a client can act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    VersionMismatch,
    BadRequest,
    ApprovalNotFound,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::VersionMismatch => "version_mismatch",
            Self::BadRequest => "bad_request",
            Self::ApprovalNotFound => "approval_not_found",
            Self::Internal => "internal",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub kind: ErrorKind,
    pub message: String,
}

impl WireError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Exactly one of `response` and `error` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ControlResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl ResponseFrame {
    pub fn ok(response: ControlResponse) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            response: Some(response),
            error: None,
        }
    }

    pub fn error(error: WireError) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            response: None,
            error: Some(error),
        }
    }

    pub fn into_result(self) -> Result<ControlResponse, WireError> {
        match (self.response, self.error) {
            (_, Some(error)) => Err(error),
            (Some(response), None) => Ok(response),
            (None, None) => Err(WireError::new(
                ErrorKind::Internal,
                "response frame carries neither a response nor an error",
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

/// Serialize one frame as a JSON line.
pub fn encode_line<T: Serialize>(frame: &T) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(frame)?;
    line.push('\n');
    Ok(line)
}

/// Decode a request line, checking the protocol version first.
pub fn decode_request(line: &str) -> Result<ControlRequest, WireError> {
    let value: serde_json::Value = serde_json::from_str(line)
        .map_err(|e| WireError::new(ErrorKind::BadRequest, format!("invalid JSON: {e}")))?;

    match value.get("version").and_then(serde_json::Value::as_u64) {
        Some(v) if v == u64::from(PROTOCOL_VERSION) => {}
        Some(v) => {
            return Err(WireError::new(
                ErrorKind::VersionMismatch,
                format!("client speaks protocol {v}, agent speaks {PROTOCOL_VERSION}"),
            ));
        }
        None => {
            return Err(WireError::new(
                ErrorKind::VersionMismatch,
                format!("request has no protocol version, agent speaks {PROTOCOL_VERSION}"),
            ));
        }
    }

    serde_json::from_value::<RequestFrame>(value)
        .map(|frame| frame.request)
        .map_err(|e| WireError::new(ErrorKind::BadRequest, format!("malformed request: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_frame_shape() {
        let line = encode_line(&RequestFrame::new(ControlRequest::Stop {
            force: true,
            timeout_ms: Some(5_000),
        }))
        .unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(
            line.trim_end(),
            r#"{"version":1,"request":{"type":"stop","force":true,"timeout_ms":5000}}"#
        );
    }

    #[test]
    fn decodes_minimal_requests() {
        assert_eq!(
            decode_request(r#"{"version":1,"request":{"type":"status"}}"#).unwrap(),
            ControlRequest::Status
        );
        assert_eq!(
            decode_request(r#"{"version":1,"request":{"type":"stop"}}"#).unwrap(),
            ControlRequest::Stop {
                force: false,
                timeout_ms: None
            }
        );
        assert_eq!(
            decode_request(r#"{"version":1,"request":{"type":"reject","id":"apr-1"}}"#).unwrap(),
            ControlRequest::Reject { id: "apr-1".into() }
        );
    }

    #[test]
    fn unknown_version_is_rejected_before_the_body() {
        // The body is nonsense, but the version check wins.
        let err = decode_request(r#"{"version":2,"request":{"type":"teleport"}}"#).unwrap_err();
        assert_eq!(err.kind, ErrorKind::VersionMismatch);
        assert!(err.message.contains("protocol 2"));

        let err = decode_request(r#"{"request":{"type":"status"}}"#).unwrap_err();
        assert_eq!(err.kind, ErrorKind::VersionMismatch);
    }

    #[test]
    fn malformed_input_is_a_bad_request() {
        assert_eq!(decode_request("not json").unwrap_err().kind, ErrorKind::BadRequest);
        assert_eq!(
            decode_request(r#"{"version":1,"request":{"type":"approve"}}"#)
                .unwrap_err()
                .kind,
            ErrorKind::BadRequest
        );
    }

    #[test]
    fn error_frame_round_trip() {
        let frame = ResponseFrame::error(WireError::new(ErrorKind::ApprovalNotFound, "no apr-9"));
        let line = encode_line(&frame).unwrap();
        assert!(line.contains(r#""kind":"approval_not_found""#));
        assert!(!line.contains("\"response\""));
        let back: ResponseFrame = serde_json::from_str(&line).unwrap();
        let err = back.into_result().unwrap_err();
        assert_eq!(err.kind, ErrorKind::ApprovalNotFound);
    }

    #[test]
    fn empty_frame_is_an_internal_error() {
        let frame: ResponseFrame = serde_json::from_str(r#"{"version":1}"#).unwrap();
        assert_eq!(frame.into_result().unwrap_err().kind, ErrorKind::Internal);
    }
}
