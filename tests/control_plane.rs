//! A foreground agent in a temp root, driven only through the control
//! socket the way the CLI drives it.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;

use homestate::agent::{
    AgentConfig, AgentState, HealthStatus, ReconcileContext, ReconciliationResult, Remediation,
    RemediationPolicy, Schedule, handler_fn,
};
use homestate::control::{ClientError, ControlClient, StatusResponse, agent_pid, is_agent_running};
use homestate::error::HomestateError;
use homestate::lifecycle::{LifecycleError, PidMarker, run_foreground};
use homestate::paths::AgentPaths;

const TIMEOUT: Duration = Duration::from_secs(5);

fn approved_config(root: &std::path::Path) -> AgentConfig {
    let mut config = AgentConfig::new(
        root.join("workstation.toml"),
        Schedule::parse("1h").unwrap(),
        RemediationPolicy::Approved,
    );
    config.reconcile_on_start = true;
    config
}

/// Reports two drifted items; applies them only when told to.
fn drift_handler() -> impl homestate::agent::ReconcileHandler + 'static {
    handler_fn(|ctx: ReconcileContext| async move {
        let now = Utc::now();
        let apply = ctx.remediation == Remediation::ApplyAll;
        let mut result = ReconciliationResult::clean(now, now);
        result.drift_detected = true;
        result.drift_count = BTreeMap::from([("low".to_string(), 2)]);
        result.remediation_applied = apply;
        result.remediation_count = if apply { 2 } else { 0 };
        Ok(result)
    })
}

/// Poll status until `done` holds or the deadline passes.
async fn wait_for_status(
    paths: &AgentPaths,
    done: impl Fn(&StatusResponse) -> bool,
) -> StatusResponse {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if let Ok(client) = ControlClient::discover(paths) {
            if let Ok(status) = client.status(TIMEOUT).await {
                if done(&status) {
                    return status;
                }
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "agent never reached the expected status"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn status_approve_and_stop_over_the_socket() {
    let dir = tempfile::TempDir::new().unwrap();
    let paths = AgentPaths::under(dir.path());
    assert!(!is_agent_running(&paths));
    assert!(matches!(
        ControlClient::discover(&paths),
        Err(ClientError::NotRunning)
    ));

    let agent_paths = paths.clone();
    let config = approved_config(dir.path());
    let agent = tokio::spawn(async move {
        run_foreground(config, &agent_paths, drift_handler()).await
    });

    // First cycle runs on start and raises an approval request.
    let status = wait_for_status(&paths, |s| s.approval.is_some()).await;
    assert_eq!(status.pid, std::process::id());
    assert_eq!(status.status.state, AgentState::Running);
    assert_eq!(status.status.policy, RemediationPolicy::Approved);
    assert_eq!(status.status.health.status, HealthStatus::Degraded);
    let request = status.approval.clone().unwrap();
    assert_eq!(status.status.pending_approval.as_deref(), Some(request.id.as_str()));

    assert!(is_agent_running(&paths));
    assert_eq!(agent_pid(&paths), Some(std::process::id()));
    let marker = PidMarker::read(&paths.pid_file()).unwrap();
    assert_eq!(marker.socket, paths.socket_path());

    // A second start against the same root is refused.
    let second = run_foreground(approved_config(dir.path()), &paths, drift_handler()).await;
    match second {
        Err(HomestateError::Lifecycle(LifecycleError::AlreadyRunning { pid })) => {
            assert_eq!(pid, std::process::id());
        }
        other => panic!("expected AlreadyRunning, got {other:?}"),
    }

    let client = ControlClient::discover(&paths).unwrap();
    let err = client.approve("apr-unknown", TIMEOUT).await.unwrap_err();
    assert!(
        matches!(err, ClientError::ApprovalNotFound { ref id } if id == "apr-unknown"),
        "{err:?}"
    );

    let reply = client.approve(&request.id, TIMEOUT).await.unwrap();
    assert!(reply.success);

    // Approval wakes the loop; the re-plan applies and clears the request.
    let status = wait_for_status(&paths, |s| {
        s.approval.is_none() && s.status.last_remediation_count == 2
    })
    .await;
    assert_eq!(status.status.health.status, HealthStatus::Healthy);
    assert!(status.status.reconcile_count >= 2);

    let reply = client.stop(false, None, Duration::from_secs(30)).await.unwrap();
    assert!(reply.success, "{}", reply.message);

    agent.await.unwrap().unwrap();
    assert!(!paths.pid_file().exists());
    assert!(!paths.socket_path().exists());
    assert!(!is_agent_running(&paths));
}

#[tokio::test]
async fn stale_marker_does_not_block_start_or_fool_clients() {
    let dir = tempfile::TempDir::new().unwrap();
    let paths = AgentPaths::under(dir.path());

    let mut child = std::process::Command::new("true").spawn().unwrap();
    let dead = child.id();
    child.wait().unwrap();

    let mut marker = PidMarker::current(&paths.socket_path());
    marker.pid = dead;
    marker.write(&paths.pid_file()).unwrap();

    assert!(!is_agent_running(&paths));
    assert_eq!(agent_pid(&paths), None);
    assert!(matches!(
        ControlClient::discover(&paths),
        Err(ClientError::NotRunning)
    ));
    homestate::lifecycle::ensure_not_running(&paths.pid_file()).unwrap();
}
