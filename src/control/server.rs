//! Control socket server.
//!
//! Binds the agent's Unix domain socket (mode 0600), serves each connection
//! on its own task, and dispatches decoded requests to a [`ControlHandler`].
//! On shutdown it stops accepting, removes the socket, and gives in-flight
//! connections a bounded grace period to finish writing their responses.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use miette::Diagnostic;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::protocol::{
    ApproveResponse, ControlRequest, ControlResponse, ErrorKind, MAX_LINE_LENGTH, ResponseFrame,
    StatusResponse, StopResponse, WireError, decode_request, encode_line,
};

/// Total bytes read from one connection before it is cut off.
const MAX_CONNECTION_BYTES: u64 = 4 * MAX_LINE_LENGTH as u64;

/// How long shutdown waits for in-flight connections.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error, Diagnostic)]
pub enum ServerError {
    #[error("failed to prepare control socket directory: {path}")]
    #[diagnostic(
        code(homestate::server::socket_dir),
        help("Check that the runtime directory is writable.")
    )]
    SocketDir {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to bind control socket: {path}")]
    #[diagnostic(
        code(homestate::server::bind),
        help(
            "Another process may own the socket, or the path is not writable. \
             Run `homestate agent status` to check for a running agent."
        )
    )]
    Bind {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to restrict control socket permissions: {path}")]
    #[diagnostic(code(homestate::server::permissions))]
    Permissions {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type ServerResult<T> = std::result::Result<T, ServerError>;

/// Agent-side implementation of the control requests.
#[async_trait]
pub trait ControlHandler: Send + Sync {
    fn status(&self) -> Result<StatusResponse, WireError>;

    async fn stop(&self, force: bool, timeout: Option<Duration>) -> StopResponse;

    fn approve(&self, id: &str) -> Result<ApproveResponse, WireError>;

    fn reject(&self, id: &str) -> Result<ApproveResponse, WireError>;
}

/// Route one decoded request to the handler.
pub async fn dispatch(
    handler: &dyn ControlHandler,
    request: ControlRequest,
) -> Result<ControlResponse, WireError> {
    match request {
        ControlRequest::Status => handler.status().map(ControlResponse::Status),
        ControlRequest::Stop { force, timeout_ms } => {
            let timeout = timeout_ms.map(Duration::from_millis);
            Ok(ControlResponse::Stop(handler.stop(force, timeout).await))
        }
        ControlRequest::Approve { id } => handler.approve(&id).map(ControlResponse::Approve),
        ControlRequest::Reject { id } => handler.reject(&id).map(ControlResponse::Approve),
    }
}

/// A bound, not yet serving, control socket.
pub struct ControlServer {
    socket_path: PathBuf,
    listener: UnixListener,
}

impl ControlServer {
    /// Bind the socket, replacing a stale socket file left by a crashed agent.
    ///
    /// Callers hold the instance lock, so an existing file is never a live peer.
    pub fn bind(socket_path: &Path) -> ServerResult<Self> {
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ServerError::SocketDir {
                path: parent.display().to_string(),
                source: e,
            })?;
        }

        match std::fs::remove_file(socket_path) {
            Ok(()) => debug!(path = %socket_path.display(), "removed stale control socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(ServerError::Bind {
                    path: socket_path.display().to_string(),
                    source: e,
                });
            }
        }

        let listener = UnixListener::bind(socket_path).map_err(|e| ServerError::Bind {
            path: socket_path.display().to_string(),
            source: e,
        })?;

        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| ServerError::Permissions {
                    path: socket_path.display().to_string(),
                    source: e,
                })?;
        }

        info!(path = %socket_path.display(), "control socket listening");
        Ok(Self {
            socket_path: socket_path.to_path_buf(),
            listener,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Serve until `shutdown` flips to true (or its sender is dropped).
    pub async fn serve(self, handler: Arc<dyn ControlHandler>, mut shutdown: watch::Receiver<bool>) {
        let mut connections = JoinSet::new();

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        let handler = Arc::clone(&handler);
                        connections.spawn(async move {
                            if let Err(e) = handle_connection(stream, handler).await {
                                debug!(error = %e, "control connection ended");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "control socket accept error"),
                },
            }
            while connections.try_join_next().is_some() {}
        }

        drop(self.listener);
        let _ = std::fs::remove_file(&self.socket_path);

        let drained = tokio::time::timeout(DRAIN_GRACE, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = connections.len(), "aborting control connections after grace period");
            connections.abort_all();
        }
        info!("control socket stopped");
    }
}

/// Serve one client connection: one response line per request line.
async fn handle_connection(stream: UnixStream, handler: Arc<dyn ControlHandler>) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader.take(MAX_CONNECTION_BYTES)).lines();

    while let Some(line) = lines.next_line().await? {
        if line.len() > MAX_LINE_LENGTH {
            let frame = ResponseFrame::error(WireError::new(
                ErrorKind::BadRequest,
                format!("request exceeds {MAX_LINE_LENGTH} bytes"),
            ));
            write_frame(&mut writer, &frame).await?;
            return Ok(());
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let frame = match decode_request(line) {
            Ok(request) => {
                debug!(request = request.name(), "control request");
                match dispatch(handler.as_ref(), request).await {
                    Ok(response) => ResponseFrame::ok(response),
                    Err(error) => ResponseFrame::error(error),
                }
            }
            Err(error) => {
                debug!(kind = %error.kind, "rejected control request");
                ResponseFrame::error(error)
            }
        };
        write_frame(&mut writer, &frame).await?;
    }
    Ok(())
}

async fn write_frame(
    writer: &mut tokio::net::unix::OwnedWriteHalf,
    frame: &ResponseFrame,
) -> std::io::Result<()> {
    let line = encode_line(frame).map_err(std::io::Error::other)?;
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}
