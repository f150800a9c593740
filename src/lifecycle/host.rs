//! Foreground agent process: owns the socket, the PID marker, and the loop.
//!
//! Startup order is lock, bind, marker, start. Teardown runs in reverse and
//! the marker is only removed once the agent loop has actually exited.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;

use super::error::LifecycleError;
use super::lock::InstanceLock;
use super::pid::{PidMarker, ensure_not_running, remove_own_marker};
use crate::agent::{Agent, AgentConfig, AgentError, ReconcileHandler, StopMode, StopOutcome};
use crate::control::protocol::{
    ApproveResponse, ErrorKind, StatusResponse, StopResponse, WireError,
};
use crate::control::server::{ControlHandler, ControlServer};
use crate::error::HomestateResult;
use crate::paths::AgentPaths;

/// Serves control requests for one agent and signals process exit once the
/// agent has been stopped through the protocol.
pub struct AgentHost {
    agent: Arc<Agent>,
    pid_file: PathBuf,
    exit: watch::Sender<bool>,
}

impl AgentHost {
    pub fn new(agent: Arc<Agent>, pid_file: PathBuf) -> Self {
        let (exit, _) = watch::channel(false);
        Self {
            agent,
            pid_file,
            exit,
        }
    }

    pub fn agent(&self) -> &Arc<Agent> {
        &self.agent
    }

    /// Flips to true once the agent has stopped and the process should exit.
    pub fn exit_signal(&self) -> watch::Receiver<bool> {
        self.exit.subscribe()
    }

    /// Stop the agent as a signal handler would: gracefully first, then
    /// forced if the drain deadline elapses.
    pub async fn shutdown(&self) -> StopOutcome {
        let outcome = match self.agent.stop(StopMode::graceful()).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(error = %e, "graceful stop timed out, forcing");
                self.agent
                    .stop(StopMode::forced())
                    .await
                    .unwrap_or(StopOutcome::Abandoned)
            }
        };
        self.finish();
        outcome
    }

    fn finish(&self) {
        remove_own_marker(&self.pid_file);
        self.exit.send_replace(true);
    }
}

fn approval_error(e: AgentError) -> WireError {
    match e {
        AgentError::ApprovalNotFound { .. } => WireError::new(ErrorKind::ApprovalNotFound, e.to_string()),
        other => WireError::new(ErrorKind::Internal, other.to_string()),
    }
}

#[async_trait]
impl ControlHandler for AgentHost {
    fn status(&self) -> Result<StatusResponse, WireError> {
        Ok(StatusResponse {
            pid: std::process::id(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            status: self.agent.status(),
            approval: self.agent.pending_request(),
        })
    }

    async fn stop(&self, force: bool, timeout: Option<Duration>) -> StopResponse {
        match self.agent.stop(StopMode { force, timeout }).await {
            Ok(StopOutcome::NotRunning) => StopResponse {
                success: true,
                message: StopOutcome::NotRunning.message().to_string(),
            },
            Ok(outcome) => {
                self.finish();
                StopResponse {
                    success: true,
                    message: outcome.message().to_string(),
                }
            }
            Err(e) => StopResponse {
                success: false,
                message: e.to_string(),
            },
        }
    }

    fn approve(&self, id: &str) -> Result<ApproveResponse, WireError> {
        let request = self.agent.approve(id).map_err(approval_error)?;
        Ok(ApproveResponse {
            success: true,
            message: format!("approved {}: {}", request.id, request.description),
        })
    }

    fn reject(&self, id: &str) -> Result<ApproveResponse, WireError> {
        let request = self.agent.reject(id).map_err(approval_error)?;
        Ok(ApproveResponse {
            success: true,
            message: format!("rejected {}", request.id),
        })
    }
}

/// Run the agent in this process until SIGINT, SIGTERM, or a protocol Stop.
pub async fn run_foreground<H>(config: AgentConfig, paths: &AgentPaths, handler: H) -> HomestateResult<()>
where
    H: ReconcileHandler + 'static,
{
    paths.ensure_dirs()?;
    let pid_file = paths.pid_file();
    ensure_not_running(&pid_file)?;
    let _lock = InstanceLock::acquire(&paths.lock_file())?;
    // A concurrent start may have finished while we waited for the lock.
    ensure_not_running(&pid_file)?;

    let mut sigterm =
        signal(SignalKind::terminate()).map_err(|source| LifecycleError::Signals { source })?;
    let mut sigint =
        signal(SignalKind::interrupt()).map_err(|source| LifecycleError::Signals { source })?;

    let agent = Arc::new(Agent::new(config));
    agent.set_reconcile_handler(handler)?;

    let server = ControlServer::bind(&paths.socket_path())?;
    let host = Arc::new(AgentHost::new(Arc::clone(&agent), pid_file.clone()));
    let mut exit = host.exit_signal();
    let (server_stop, server_stop_rx) = watch::channel(false);
    let server_task = tokio::spawn(server.serve(host.clone(), server_stop_rx));

    let started: HomestateResult<()> = match PidMarker::current(&paths.socket_path()).write(&pid_file) {
        Ok(()) => agent.start().await.map_err(Into::into),
        Err(e) => Err(e.into()),
    };
    if let Err(e) = started {
        let _ = server_stop.send(true);
        let _ = server_task.await;
        remove_own_marker(&pid_file);
        return Err(e);
    }
    tracing::info!(pid = std::process::id(), socket = %paths.socket_path().display(), "agent ready");

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM");
            host.shutdown().await;
        }
        _ = sigint.recv() => {
            tracing::info!("received SIGINT");
            host.shutdown().await;
        }
        _ = exit.changed() => {
            tracing::info!("stopped via control request");
        }
    }

    let _ = server_stop.send(true);
    let _ = server_task.await;
    remove_own_marker(&pid_file);
    tracing::info!("agent exited");
    Ok(())
}
