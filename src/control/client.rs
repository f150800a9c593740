//! Control client used by short-lived CLI invocations.
//!
//! Discovery reads the agent's PID marker and checks that the recorded
//! process is alive; a stale marker from an unclean shutdown reads as "not
//! running". Every request takes an explicit timeout, and failures are split
//! into "no agent", transport, timeout, and agent-reported errors.

use std::path::{Path, PathBuf};
use std::time::Duration;

use miette::Diagnostic;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use super::protocol::{
    ApproveResponse, ControlRequest, ControlResponse, ErrorKind, PROTOCOL_VERSION, RequestFrame,
    ResponseFrame, StatusResponse, StopResponse, encode_line,
};
use crate::agent::duration_millis;
use crate::lifecycle::pid::live_marker;
use crate::paths::AgentPaths;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ClientError {
    #[error("agent is not running")]
    #[diagnostic(
        code(homestate::client::not_running),
        help("Start it with `homestate agent start`.")
    )]
    NotRunning,

    #[error("cannot connect to agent at {socket}")]
    #[diagnostic(
        code(homestate::client::connect),
        help(
            "The agent process is alive but its control socket refused the connection. \
             It may still be starting, or it is shutting down."
        )
    )]
    Connect {
        socket: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connection to agent broken: {message}")]
    #[diagnostic(code(homestate::client::broken))]
    Broken { message: String },

    #[error("agent did not answer {request} within {timeout_ms} ms")]
    #[diagnostic(
        code(homestate::client::timeout),
        help("The agent may be busy with a long reconciliation. Retry with a longer timeout.")
    )]
    Timeout { request: String, timeout_ms: u64 },

    #[error("protocol version mismatch: {message}")]
    #[diagnostic(
        code(homestate::client::version_mismatch),
        help("The running agent was built from a different release. Restart it with this binary.")
    )]
    VersionMismatch { message: String },

    #[error("no pending approval request with id \"{id}\"")]
    #[diagnostic(
        code(homestate::client::approval_not_found),
        help("Run `homestate agent status` to see the id of the pending request, if any.")
    )]
    ApprovalNotFound { id: String },

    #[error("agent rejected {request}: {kind}: {message}")]
    #[diagnostic(code(homestate::client::remote))]
    Remote {
        request: String,
        kind: String,
        message: String,
    },

    #[error("unexpected reply from agent: {message}")]
    #[diagnostic(code(homestate::client::decode))]
    Decode { message: String },
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

/// Whether a live agent owns the PID marker. No side effects.
pub fn is_agent_running(paths: &AgentPaths) -> bool {
    agent_pid(paths).is_some()
}

/// PID of the live agent, if any. No side effects.
pub fn agent_pid(paths: &AgentPaths) -> Option<u32> {
    live_marker(&paths.pid_file()).map(|marker| marker.pid)
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ControlClient {
    socket: PathBuf,
    pid: Option<u32>,
}

impl ControlClient {
    /// Talk to a socket directly, without PID discovery.
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
            pid: None,
        }
    }

    /// Locate the running agent through its PID marker.
    pub fn discover(paths: &AgentPaths) -> ClientResult<Self> {
        let marker = live_marker(&paths.pid_file()).ok_or(ClientError::NotRunning)?;
        Ok(Self {
            socket: marker.socket,
            pid: Some(marker.pid),
        })
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub async fn status(&self, timeout: Duration) -> ClientResult<StatusResponse> {
        match self.request(ControlRequest::Status, timeout).await? {
            ControlResponse::Status(status) => Ok(status),
            other => Err(unexpected("status", &other)),
        }
    }

    /// Ask the agent to stop. `drain` overrides the agent's own deadline; the
    /// transport `timeout` should be longer than it.
    pub async fn stop(
        &self,
        force: bool,
        drain: Option<Duration>,
        timeout: Duration,
    ) -> ClientResult<StopResponse> {
        let request = ControlRequest::Stop {
            force,
            timeout_ms: drain.map(duration_millis),
        };
        match self.request(request, timeout).await? {
            ControlResponse::Stop(stop) => Ok(stop),
            other => Err(unexpected("stop", &other)),
        }
    }

    pub async fn approve(&self, id: &str, timeout: Duration) -> ClientResult<ApproveResponse> {
        let request = ControlRequest::Approve { id: id.to_string() };
        match self.request(request, timeout).await? {
            ControlResponse::Approve(reply) => Ok(reply),
            other => Err(unexpected("approve", &other)),
        }
    }

    pub async fn reject(&self, id: &str, timeout: Duration) -> ClientResult<ApproveResponse> {
        let request = ControlRequest::Reject { id: id.to_string() };
        match self.request(request, timeout).await? {
            ControlResponse::Approve(reply) => Ok(reply),
            other => Err(unexpected("reject", &other)),
        }
    }

    /// One request/response exchange on a fresh connection.
    pub async fn request(
        &self,
        request: ControlRequest,
        timeout: Duration,
    ) -> ClientResult<ControlResponse> {
        let name = request.name();
        let approval_id = match &request {
            ControlRequest::Approve { id } | ControlRequest::Reject { id } => Some(id.clone()),
            _ => None,
        };

        let frame = tokio::time::timeout(timeout, self.exchange(request))
            .await
            .map_err(|_| ClientError::Timeout {
                request: name.to_string(),
                timeout_ms: duration_millis(timeout),
            })??;

        frame.into_result().map_err(|error| match error.kind {
            ErrorKind::VersionMismatch => ClientError::VersionMismatch {
                message: error.message,
            },
            ErrorKind::ApprovalNotFound => ClientError::ApprovalNotFound {
                id: approval_id.unwrap_or_default(),
            },
            kind => ClientError::Remote {
                request: name.to_string(),
                kind: kind.to_string(),
                message: error.message,
            },
        })
    }

    async fn exchange(&self, request: ControlRequest) -> ClientResult<ResponseFrame> {
        let stream = UnixStream::connect(&self.socket)
            .await
            .map_err(|e| ClientError::Connect {
                socket: self.socket.display().to_string(),
                source: e,
            })?;
        let (reader, mut writer) = stream.into_split();

        let line = encode_line(&RequestFrame::new(request)).map_err(|e| ClientError::Decode {
            message: e.to_string(),
        })?;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(broken)?;
        writer.flush().await.map_err(broken)?;

        let mut lines = BufReader::new(reader).lines();
        let reply = lines
            .next_line()
            .await
            .map_err(broken)?
            .ok_or_else(|| ClientError::Broken {
                message: "agent closed the connection without answering".into(),
            })?;

        // Version first: a newer agent's body may not parse at all.
        let value: serde_json::Value =
            serde_json::from_str(&reply).map_err(|e| ClientError::Decode {
                message: e.to_string(),
            })?;
        match value.get("version").and_then(serde_json::Value::as_u64) {
            Some(v) if v == u64::from(PROTOCOL_VERSION) => {}
            other => {
                return Err(ClientError::VersionMismatch {
                    message: format!(
                        "agent speaks protocol {}, client speaks {PROTOCOL_VERSION}",
                        other.map_or_else(|| "?".to_string(), |v| v.to_string())
                    ),
                });
            }
        }
        serde_json::from_value(value).map_err(|e| ClientError::Decode {
            message: e.to_string(),
        })
    }
}

fn broken(e: std::io::Error) -> ClientError {
    ClientError::Broken {
        message: e.to_string(),
    }
}

fn unexpected(request: &str, response: &ControlResponse) -> ClientError {
    ClientError::Decode {
        message: format!("{request} answered with {response:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_marker_means_not_running() {
        let dir = tempfile::TempDir::new().unwrap();
        let paths = AgentPaths::under(dir.path());
        assert!(!is_agent_running(&paths));
        assert_eq!(agent_pid(&paths), None);
        assert!(matches!(
            ControlClient::discover(&paths),
            Err(ClientError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn missing_socket_is_a_connect_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let client = ControlClient::new(dir.path().join("absent.sock"));
        let err = client.status(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ClientError::Connect { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn silent_peer_is_a_timeout() {
        let dir = tempfile::TempDir::new().unwrap();
        let socket = dir.path().join("silent.sock");
        let listener = tokio::net::UnixListener::bind(&socket).unwrap();
        let _accepting = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            // Hold the connection open without answering.
            tokio::time::sleep(Duration::from_secs(60)).await;
            drop(stream);
        });

        let client = ControlClient::new(&socket);
        let err = client.status(Duration::from_millis(100)).await.unwrap_err();
        assert!(
            matches!(err, ClientError::Timeout { ref request, timeout_ms: 100 } if request == "status"),
            "{err:?}"
        );
    }

    #[tokio::test]
    async fn peer_hanging_up_is_a_broken_connection() {
        let dir = tempfile::TempDir::new().unwrap();
        let socket = dir.path().join("rude.sock");
        let listener = tokio::net::UnixListener::bind(&socket).unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut lines = BufReader::new(stream).lines();
            let _ = lines.next_line().await;
        });

        let client = ControlClient::new(&socket);
        let err = client.status(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, ClientError::Broken { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn newer_agent_reply_is_a_version_mismatch() {
        let dir = tempfile::TempDir::new().unwrap();
        let socket = dir.path().join("future.sock");
        let listener = tokio::net::UnixListener::bind(&socket).unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            let mut lines = BufReader::new(reader).lines();
            let _ = lines.next_line().await;
            let _ = writer
                .write_all(b"{\"version\":2,\"response\":{\"type\":\"teleported\"}}\n")
                .await;
        });

        let client = ControlClient::new(&socket);
        let err = client.status(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, ClientError::VersionMismatch { .. }), "{err:?}");
    }
}
