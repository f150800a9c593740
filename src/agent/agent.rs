//! The agent state machine and reconciliation loop.
//!
//! `Agent` owns the schedule, policy, approval workflow, and reconcile
//! handler. A single tokio task runs the tick loop while `Running`; control
//! requests arrive concurrently through `&self` methods. Status and approvals
//! share one `std::sync::Mutex` that is never held across an `.await`, so a
//! status snapshot always reflects whole cycles.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;

use super::approval::{ApprovalRequest, ApprovalWorkflow, RaiseOutcome};
use super::clock::{Clock, SystemClock};
use super::config::AgentConfig;
use super::error::{AgentError, AgentResult};
use super::reconcile::{ReconcileContext, ReconcileHandler, ReconciliationResult};
use super::schedule::{Schedule, duration_millis};
use super::status::{AgentState, AgentStatus, Health};

/// Longest single sleep of the tick loop. The wall clock is re-read after
/// each slice so a suspended machine fires overdue cycles on wake.
const MAX_WAIT_SLICE: Duration = Duration::from_secs(30);

/// How long an aborted loop task gets to unwind.
const ABORT_GRACE: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Stop
// ---------------------------------------------------------------------------

/// How to stop the agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StopMode {
    /// Cancel the in-flight cycle and use the short force deadline.
    pub force: bool,
    /// Overrides the configured deadline.
    pub timeout: Option<Duration>,
}

impl StopMode {
    pub fn graceful() -> Self {
        Self::default()
    }

    pub fn forced() -> Self {
        Self {
            force: true,
            timeout: None,
        }
    }
}

/// Successful stop outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The agent was never started or had already stopped.
    NotRunning,
    /// The loop exited within the deadline.
    Stopped,
    /// Forced stop: the deadline elapsed and the loop task was aborted.
    Abandoned,
}

impl StopOutcome {
    pub fn message(self) -> &'static str {
        match self {
            Self::NotRunning => "not running",
            Self::Stopped => "stopped",
            Self::Abandoned => "stopped (in-flight reconciliation abandoned)",
        }
    }
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

struct Shared {
    status: AgentStatus,
    approvals: ApprovalWorkflow,
}

struct Inner {
    config: AgentConfig,
    clock: Arc<dyn Clock>,
    shared: Mutex<Shared>,
    handler: Mutex<Option<Arc<dyn ReconcileHandler>>>,
    wake: Notify,
}

#[derive(Default)]
struct LoopControl {
    shutdown: Option<watch::Sender<bool>>,
    cancel: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

/// Background reconciliation agent.
pub struct Agent {
    inner: Arc<Inner>,
    /// Serializes start and stop.
    control: tokio::sync::Mutex<LoopControl>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: AgentConfig, clock: Arc<dyn Clock>) -> Self {
        let status = AgentStatus::new(config.policy, config.schedule.expr());
        let approvals = ApprovalWorkflow::new(config.timeouts.approval_ttl);
        Self {
            inner: Arc::new(Inner {
                config,
                clock,
                shared: Mutex::new(Shared { status, approvals }),
                handler: Mutex::new(None),
                wake: Notify::new(),
            }),
            control: tokio::sync::Mutex::new(LoopControl::default()),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    /// Install the reconcile handler. Only allowed before [`Agent::start`].
    pub fn set_reconcile_handler(&self, handler: impl ReconcileHandler + 'static) -> AgentResult<()> {
        let state = self.inner.lock().status.state;
        if state != AgentState::Idle {
            return Err(AgentError::InvalidTransition {
                action: "replace the reconcile handler of".into(),
                state: state.to_string(),
            });
        }
        *self
            .inner
            .handler
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(handler));
        Ok(())
    }

    /// Snapshot of the current status.
    pub fn status(&self) -> AgentStatus {
        let shared = self.inner.lock();
        let mut status = shared.status.clone();
        status.pending_approval = shared.approvals.pending_id().map(str::to_string);
        status
    }

    pub fn state(&self) -> AgentState {
        self.inner.lock().status.state
    }

    /// Idle → Starting → Running.
    ///
    /// Runs the handler's health check bounded by `timeouts.health_check`. A
    /// failing check leaves the agent Stopped.
    pub async fn start(&self) -> AgentResult<()> {
        let mut control = self.control.lock().await;

        let handler = self.inner.handler()?;
        {
            let mut shared = self.inner.lock();
            if shared.status.state != AgentState::Idle {
                return Err(AgentError::InvalidTransition {
                    action: "start".into(),
                    state: shared.status.state.to_string(),
                });
            }
            shared.status.state = AgentState::Starting;
        }
        tracing::info!(
            policy = %self.inner.config.policy,
            schedule = %self.inner.config.schedule,
            target = %self.inner.config.target,
            "agent starting"
        );

        let limit = self.inner.config.timeouts.health_check;
        let checked = match tokio::time::timeout(limit, handler.health_check()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(AgentError::HealthCheckFailed { message })) => {
                Err(AgentError::HealthCheckFailed { message })
            }
            Ok(Err(other)) => Err(AgentError::HealthCheckFailed {
                message: other.to_string(),
            }),
            Err(_) => Err(AgentError::HealthCheckTimeout {
                timeout_ms: duration_millis(limit),
            }),
        };
        if let Err(e) = checked {
            let mut shared = self.inner.lock();
            shared.status.state = AgentState::Stopped;
            shared.status.health = Health::unhealthy(e.to_string());
            tracing::error!(error = %e, "agent start aborted");
            return Err(e);
        }

        let now = self.inner.clock.now();
        {
            let mut shared = self.inner.lock();
            shared.status.state = AgentState::Running;
            shared.status.started_at = Some(now);
            shared.status.health = Health::healthy();
            shared.status.next_reconcile_at = Some(if self.inner.config.reconcile_on_start {
                now
            } else {
                self.inner.config.schedule.next(now)
            });
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        control.task = Some(tokio::spawn(run_loop(inner, handler, shutdown_rx, cancel_rx)));
        control.shutdown = Some(shutdown_tx);
        control.cancel = Some(cancel_tx);

        tracing::info!("agent running");
        Ok(())
    }

    /// Stop the loop.
    ///
    /// Never-started or already-stopped agents return
    /// [`StopOutcome::NotRunning`]. A graceful stop whose deadline elapses
    /// returns [`AgentError::ShutdownTimeout`] and leaves the agent Stopping;
    /// calling again (possibly forced) picks up where it left off.
    pub async fn stop(&self, mode: StopMode) -> AgentResult<StopOutcome> {
        let mut control = self.control.lock().await;

        {
            let mut shared = self.inner.lock();
            match shared.status.state {
                AgentState::Idle | AgentState::Stopped => return Ok(StopOutcome::NotRunning),
                _ => shared.status.state = AgentState::Stopping,
            }
        }

        let timeouts = &self.inner.config.timeouts;
        let deadline = mode.timeout.unwrap_or(if mode.force {
            timeouts.force_shutdown
        } else {
            timeouts.shutdown
        });
        tracing::info!(force = mode.force, deadline_ms = duration_millis(deadline), "agent stopping");

        if let Some(tx) = &control.shutdown {
            let _ = tx.send(true);
        }
        if mode.force {
            if let Some(tx) = &control.cancel {
                let _ = tx.send(true);
            }
        }

        let outcome = match control.task.as_mut() {
            None => StopOutcome::Stopped,
            Some(task) => match tokio::time::timeout(deadline, &mut *task).await {
                Ok(_) => StopOutcome::Stopped,
                Err(_) if mode.force => {
                    task.abort();
                    // Abort lands at the task's next await point.
                    let _ = tokio::time::timeout(ABORT_GRACE, &mut *task).await;
                    tracing::warn!("agent loop abandoned after forced stop deadline");
                    StopOutcome::Abandoned
                }
                Err(_) => {
                    tracing::warn!(deadline_ms = duration_millis(deadline), "agent loop still draining");
                    return Err(AgentError::ShutdownTimeout {
                        timeout_ms: duration_millis(deadline),
                    });
                }
            },
        };

        *control = LoopControl::default();
        {
            let mut shared = self.inner.lock();
            shared.status.state = AgentState::Stopped;
            shared.status.next_reconcile_at = None;
        }
        tracing::info!(outcome = outcome.message(), "agent stopped");
        Ok(outcome)
    }

    /// Wake the loop to run a cycle now.
    pub fn trigger_now(&self) {
        self.inner.wake.notify_one();
    }

    /// Run exactly one cycle outside the loop.
    pub async fn run_once(&self) -> AgentResult<()> {
        let handler = self.inner.handler()?;
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        self.inner.run_cycle(handler.as_ref(), cancel_rx).await;
        Ok(())
    }

    /// Approve the pending request. The next cycle starts immediately,
    /// re-plans, and applies the request's items. The grant is spent by that
    /// cycle whatever its outcome.
    pub fn approve(&self, id: &str) -> AgentResult<ApprovalRequest> {
        let now = self.inner.clock.now();
        let (request, running) = {
            let mut shared = self.inner.lock();
            let request = shared.approvals.approve(id, now)?;
            shared.status.pending_approval = None;
            (request, shared.status.running())
        };
        tracing::info!(id = %request.id, "approval granted");
        if running {
            self.trigger_now();
        }
        Ok(request)
    }

    /// Reject the pending request. Held changes are discarded; drift seen on
    /// a later cycle raises a new request.
    pub fn reject(&self, id: &str) -> AgentResult<ApprovalRequest> {
        let now = self.inner.clock.now();
        let request = {
            let mut shared = self.inner.lock();
            let request = shared.approvals.reject(id, now)?;
            shared.status.pending_approval = None;
            request
        };
        tracing::info!(id = %request.id, "approval rejected");
        Ok(request)
    }

    pub fn pending_request(&self) -> Option<ApprovalRequest> {
        self.inner.lock().approvals.pending().cloned()
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn handler(&self) -> AgentResult<Arc<dyn ReconcileHandler>> {
        self.handler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(AgentError::NoHandler)
    }

    fn next_fire(&self) -> DateTime<Utc> {
        let scheduled = self.lock().status.next_reconcile_at;
        scheduled.unwrap_or_else(|| self.clock.now())
    }

    /// One Plan-then-Apply cycle; folds the outcome into the status.
    async fn run_cycle(&self, handler: &dyn ReconcileHandler, cancel: watch::Receiver<bool>) {
        let config = &self.config;
        let started = self.clock.now();

        // A grant is taken here, so no later cycle can reuse it.
        let ctx = {
            let mut shared = self.lock();
            if let Some(expired) = shared.approvals.expire(started) {
                tracing::info!(id = %expired.id, "approval request expired");
            }
            let grant = shared.approvals.take_approved();
            if let Some(request) = &grant {
                tracing::info!(
                    id = %request.id,
                    items = request.items.len(),
                    "applying approved remediation"
                );
            }
            shared.status.pending_approval = shared.approvals.pending_id().map(str::to_string);
            ReconcileContext::new(
                config.policy,
                config.policy.remediation(grant.is_some()),
                config.dry_run,
                grant,
                cancel,
            )
        };
        let grant = ctx.approval.clone();

        tracing::debug!(remediation = ?ctx.remediation, "reconciliation cycle starting");
        let outcome = handler.reconcile(ctx).await;
        let finished = self.clock.now();

        let mut shared = self.lock();
        let Shared { status, approvals } = &mut *shared;
        status.reconcile_count += 1;
        status.last_reconcile_at = Some(finished);
        status.next_reconcile_at = Some(config.schedule.next(finished));
        status.last_duration_ms = Some(u64::try_from((finished - started).num_milliseconds()).unwrap_or(0));

        match outcome {
            Ok(result) => {
                if let Some(request) = &grant {
                    if result.remediation_applied {
                        tracing::info!(id = %request.id, "approved remediation applied");
                    } else if !result.drift_detected {
                        tracing::info!(id = %request.id, "approved drift already resolved");
                    } else {
                        tracing::info!(
                            id = %request.id,
                            dry_run = config.dry_run,
                            "approved remediation not applied"
                        );
                    }
                }
                let held = !result.remediation_applied || !result.held_items.is_empty();
                if config.policy.requires_approval() && result.drift_detected && held {
                    let items = if result.held_items.is_empty() {
                        result.drifted_items.clone()
                    } else {
                        result.held_items.clone()
                    };
                    match approvals.raise(describe_drift(&result, &items), items, finished) {
                        RaiseOutcome::Created(request) => {
                            tracing::info!(id = %request.id, drift = result.total_drift(), "approval requested");
                        }
                        RaiseOutcome::Outstanding { id } => {
                            tracing::debug!(%id, "drift still awaiting approval");
                        }
                    }
                }
                status.pending_approval = approvals.pending_id().map(str::to_string);
                status.health = cycle_health(&result, status.pending_approval.as_deref(), config.dry_run);
                status.drift_count = result.drift_count;
                status.last_remediation_count = result.remediation_count;
                tracing::info!(
                    count = status.reconcile_count,
                    drift = status.total_drift(),
                    applied = status.last_remediation_count,
                    health = %status.health,
                    "reconciliation complete"
                );
            }
            Err(e) => {
                // The grant is spent; the operator decides again on a fresh request.
                if let Some(request) = grant {
                    if let RaiseOutcome::Created(retry) =
                        approvals.raise(request.description, request.items, finished)
                    {
                        tracing::info!(
                            previous = %request.id,
                            id = %retry.id,
                            "approved remediation failed, approval requested again"
                        );
                    }
                }
                status.health = Health::unhealthy(e.to_string());
                status.pending_approval = approvals.pending_id().map(str::to_string);
                tracing::warn!(error = %e, "reconciliation failed, retrying next cycle");
            }
        }
    }
}

async fn run_loop(
    inner: Arc<Inner>,
    handler: Arc<dyn ReconcileHandler>,
    mut shutdown: watch::Receiver<bool>,
    cancel: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        let next = inner.next_fire();
        let wait = Schedule::wait_until(next, inner.clock.now()).min(MAX_WAIT_SLICE);

        let woken = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = inner.wake.notified() => true,
            _ = tokio::time::sleep(wait) => false,
        };
        if !woken && inner.clock.now() < next {
            continue;
        }
        inner.run_cycle(handler.as_ref(), cancel.clone()).await;
    }
    tracing::debug!("agent loop exited");
}

/// Items listed in a request description before eliding the rest.
const DESCRIBED_ITEMS: usize = 5;

fn describe_drift(result: &ReconciliationResult, items: &[String]) -> String {
    if !items.is_empty() {
        let mut listed = items[..items.len().min(DESCRIBED_ITEMS)].join(", ");
        if items.len() > DESCRIBED_ITEMS {
            listed.push_str(&format!(", and {} more", items.len() - DESCRIBED_ITEMS));
        }
        return format!("apply {} drifted item(s): {listed}", items.len());
    }
    let parts: Vec<String> = result
        .drift_count
        .iter()
        .map(|(severity, count)| format!("{count} {severity}"))
        .collect();
    if parts.is_empty() {
        "apply pending changes".to_string()
    } else {
        format!("apply {} drifted item(s): {}", result.total_drift(), parts.join(", "))
    }
}

/// Health after a completed cycle.
fn cycle_health(result: &ReconciliationResult, pending: Option<&str>, dry_run: bool) -> Health {
    if result.failed_count > 0 {
        return Health::degraded(format!(
            "{} of {} changes failed",
            result.failed_count, result.remediation_count
        ));
    }
    if let Some(id) = pending.filter(|_| !result.held_items.is_empty()) {
        return Health::degraded(format!("drift awaiting approval {id}"));
    }
    if result.drift_detected && !result.remediation_applied {
        let reason = match pending {
            Some(id) => format!("drift awaiting approval {id}"),
            None if dry_run => format!("{} drifted item(s), dry run", result.total_drift()),
            None => format!("{} drifted item(s) not remediated", result.total_drift()),
        };
        return Health::degraded(reason);
    }
    Health::healthy()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::agent::clock::ManualClock;
    use crate::agent::policy::{Remediation, RemediationPolicy};
    use crate::agent::reconcile::handler_fn;

    fn config(policy: RemediationPolicy) -> AgentConfig {
        AgentConfig::new(
            "/tmp/workstation.yaml",
            Schedule::parse("30m").unwrap(),
            policy,
        )
    }

    fn start_time() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn drift(count: u64, applied: bool) -> ReconciliationResult {
        let now = start_time();
        let mut result = ReconciliationResult::clean(now, now);
        result.drift_detected = count > 0;
        result.drift_count = BTreeMap::from([("medium".to_string(), count)]);
        result.remediation_applied = applied;
        result.remediation_count = if applied { count } else { 0 };
        result
    }

    /// Handler that reports drift unless the cycle may apply everything.
    fn drifting_handler(calls: Arc<AtomicUsize>) -> impl ReconcileHandler {
        handler_fn(move |ctx: ReconcileContext| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(drift(2, ctx.remediation == Remediation::ApplyAll)) }
        })
    }

    #[test]
    fn never_started_agent_is_not_running() {
        let agent = Agent::new(config(RemediationPolicy::Notify));
        let status = agent.status();
        assert!(!status.running());
        assert_eq!(status.state, AgentState::Idle);
    }

    #[tokio::test]
    async fn stop_on_idle_agent_reports_not_running() {
        let agent = Agent::new(config(RemediationPolicy::Notify));
        let outcome = agent.stop(StopMode::graceful()).await.unwrap();
        assert_eq!(outcome, StopOutcome::NotRunning);
        assert_eq!(outcome.message(), "not running");
    }

    #[tokio::test]
    async fn one_cycle_updates_status() {
        let clock = ManualClock::new(start_time());
        let agent = Agent::with_clock(config(RemediationPolicy::Notify), Arc::new(clock.clone()));
        agent
            .set_reconcile_handler(handler_fn(|_ctx: ReconcileContext| async { Ok(drift(2, false)) }))
            .unwrap();

        agent.run_once().await.unwrap();

        let status = agent.status();
        let last = status.last_reconcile_at.unwrap();
        assert_eq!(status.reconcile_count, 1);
        assert_eq!(status.total_drift(), 2);
        assert_eq!(status.drift_count.get("medium"), Some(&2));
        assert_eq!(last, start_time());
        assert_eq!(
            status.next_reconcile_at,
            Some(agent.config().schedule.next(last))
        );
        assert_eq!(status.health.status, crate::agent::status::HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn failed_cycle_is_unhealthy_and_counted() {
        let agent = Agent::with_clock(
            config(RemediationPolicy::Auto),
            Arc::new(ManualClock::new(start_time())),
        );
        agent
            .set_reconcile_handler(handler_fn(|_ctx: ReconcileContext| async {
                Err(AgentError::Reconcile {
                    message: "engine exploded".into(),
                })
            }))
            .unwrap();

        agent.run_once().await.unwrap();
        agent.run_once().await.unwrap();

        let status = agent.status();
        assert_eq!(status.reconcile_count, 2);
        assert_eq!(
            status.health.to_string(),
            "unhealthy (reconciliation failed: engine exploded)"
        );
    }

    #[tokio::test]
    async fn partial_apply_failure_is_degraded() {
        let agent = Agent::new(config(RemediationPolicy::Auto));
        agent
            .set_reconcile_handler(handler_fn(|_ctx: ReconcileContext| async {
                let mut result = drift(3, true);
                result.failed_count = 1;
                Ok(result)
            }))
            .unwrap();
        agent.run_once().await.unwrap();
        assert_eq!(agent.status().health.to_string(), "degraded (1 of 3 changes failed)");
    }

    #[tokio::test]
    async fn approved_policy_raises_exactly_one_request() {
        let calls = Arc::new(AtomicUsize::new(0));
        let clock = ManualClock::new(start_time());
        let agent = Agent::with_clock(config(RemediationPolicy::Approved), Arc::new(clock.clone()));
        agent.set_reconcile_handler(drifting_handler(calls.clone())).unwrap();

        agent.run_once().await.unwrap();
        let first = agent.status().pending_approval.unwrap();
        clock.advance(chrono::Duration::minutes(30));
        agent.run_once().await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(agent.status().pending_approval.as_deref(), Some(first.as_str()));
        assert_eq!(agent.pending_request().map(|r| r.id), Some(first));
    }

    #[tokio::test]
    async fn approve_without_pending_is_not_found() {
        let agent = Agent::new(config(RemediationPolicy::Approved));
        let err = agent.approve("apr-missing").unwrap_err();
        assert!(matches!(err, AgentError::ApprovalNotFound { ref id } if id == "apr-missing"));
    }

    #[tokio::test]
    async fn approval_clears_pending_and_next_cycle_applies() {
        let calls = Arc::new(AtomicUsize::new(0));
        let agent = Agent::with_clock(
            config(RemediationPolicy::Approved),
            Arc::new(ManualClock::new(start_time())),
        );
        agent.set_reconcile_handler(drifting_handler(calls)).unwrap();

        agent.run_once().await.unwrap();
        let id = agent.status().pending_approval.unwrap();

        agent.approve(&id).unwrap();
        assert!(agent.status().pending_approval.is_none());

        agent.run_once().await.unwrap();
        let status = agent.status();
        assert_eq!(status.last_remediation_count, 2);
        assert!(status.pending_approval.is_none());
        assert_eq!(status.health.to_string(), "healthy");
    }

    /// Handler replaying `drift` per call (last value repeats) and recording
    /// each cycle's directive and grant.
    fn scripted_handler(
        drift_per_call: Vec<u64>,
        seen: Arc<std::sync::Mutex<Vec<(Remediation, Option<String>)>>>,
    ) -> impl ReconcileHandler {
        let calls = AtomicUsize::new(0);
        handler_fn(move |ctx: ReconcileContext| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            let count = drift_per_call[n.min(drift_per_call.len() - 1)];
            seen.lock()
                .unwrap()
                .push((ctx.remediation, ctx.approval.as_ref().map(|r| r.id.clone())));
            let apply = ctx.remediation == Remediation::ApplyAll && !ctx.dry_run && count > 0;
            async move { Ok(drift(count, apply)) }
        })
    }

    #[tokio::test]
    async fn grant_is_spent_when_the_approved_cycle_finds_no_drift() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let agent = Agent::new(config(RemediationPolicy::Approved));
        agent
            .set_reconcile_handler(scripted_handler(vec![2, 0, 3], seen.clone()))
            .unwrap();

        agent.run_once().await.unwrap();
        let first = agent.status().pending_approval.unwrap();
        agent.approve(&first).unwrap();

        // Drift was fixed by hand before the approved cycle ran.
        agent.run_once().await.unwrap();
        assert!(agent.status().pending_approval.is_none());
        assert_eq!(agent.status().health.to_string(), "healthy");

        // New drift needs a new decision.
        agent.run_once().await.unwrap();
        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen[1], (Remediation::ApplyAll, Some(first.clone())));
        assert_eq!(seen[2], (Remediation::ReportOnly, None));

        let status = agent.status();
        assert_eq!(status.last_remediation_count, 0);
        let second = status.pending_approval.unwrap();
        assert_ne!(second, first);
    }

    #[tokio::test]
    async fn failed_approved_cycle_asks_again() {
        let calls = Arc::new(AtomicUsize::new(0));
        let agent = Agent::new(config(RemediationPolicy::Approved));
        let counter = calls.clone();
        agent
            .set_reconcile_handler(handler_fn(move |ctx: ReconcileContext| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    match (n, ctx.remediation) {
                        (0, _) | (_, Remediation::ReportOnly) => Ok(drift(2, false)),
                        _ => Err(AgentError::Reconcile {
                            message: "apply interrupted".into(),
                        }),
                    }
                }
            }))
            .unwrap();

        agent.run_once().await.unwrap();
        let first = agent.pending_request().unwrap();
        agent.approve(&first.id).unwrap();

        agent.run_once().await.unwrap();
        let retry = agent.pending_request().expect("fresh request after failed apply");
        assert_ne!(retry.id, first.id);
        assert_eq!(retry.description, first.description);
        assert_eq!(retry.state, crate::agent::ApprovalState::Pending);
        assert_eq!(agent.status().health.status, crate::agent::status::HealthStatus::Unhealthy);

        // Without a new approval the next cycle only reports.
        agent.run_once().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(agent.pending_request().map(|r| r.id), Some(retry.id));
        assert_eq!(agent.status().last_remediation_count, 0);
    }

    #[tokio::test]
    async fn dry_run_approval_is_not_a_standing_grant() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut config = config(RemediationPolicy::Approved);
        config.dry_run = true;
        let agent = Agent::new(config);
        agent
            .set_reconcile_handler(scripted_handler(vec![2], seen.clone()))
            .unwrap();

        agent.run_once().await.unwrap();
        let first = agent.status().pending_approval.unwrap();
        agent.approve(&first).unwrap();

        agent.run_once().await.unwrap();
        let second = agent.status().pending_approval.expect("drift still held");
        assert_ne!(second, first);

        agent.run_once().await.unwrap();
        let seen = seen.lock().unwrap().clone();
        assert_eq!(
            seen.iter().map(|(r, _)| *r).collect::<Vec<_>>(),
            vec![Remediation::ReportOnly, Remediation::ApplyAll, Remediation::ReportOnly]
        );
        assert_eq!(agent.status().pending_approval, Some(second));
        assert_eq!(agent.status().last_remediation_count, 0);
    }

    #[tokio::test]
    async fn rejected_request_is_replaced_on_next_drift() {
        let calls = Arc::new(AtomicUsize::new(0));
        let agent = Agent::new(config(RemediationPolicy::Approved));
        agent.set_reconcile_handler(drifting_handler(calls)).unwrap();

        agent.run_once().await.unwrap();
        let first = agent.status().pending_approval.unwrap();
        agent.reject(&first).unwrap();
        assert!(agent.status().pending_approval.is_none());

        agent.run_once().await.unwrap();
        let second = agent.status().pending_approval.unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn start_requires_handler() {
        let agent = Agent::new(config(RemediationPolicy::Notify));
        assert!(matches!(agent.start().await, Err(AgentError::NoHandler)));
        assert_eq!(agent.state(), AgentState::Idle);
    }

    #[tokio::test]
    async fn failing_health_check_leaves_agent_stopped() {
        struct Broken;
        #[async_trait::async_trait]
        impl ReconcileHandler for Broken {
            async fn reconcile(&self, _ctx: ReconcileContext) -> AgentResult<ReconciliationResult> {
                Err(AgentError::Cancelled)
            }

            async fn health_check(&self) -> AgentResult<()> {
                Err(AgentError::HealthCheckFailed {
                    message: "engine missing".into(),
                })
            }
        }

        let agent = Agent::new(config(RemediationPolicy::Auto));
        agent.set_reconcile_handler(Broken).unwrap();
        let err = agent.start().await.unwrap_err();
        assert!(err.to_string().contains("engine missing"));
        assert_eq!(agent.state(), AgentState::Stopped);
        assert!(agent.start().await.is_err());
    }

    #[tokio::test]
    async fn start_then_graceful_stop() {
        let agent = Agent::new(config(RemediationPolicy::Notify));
        agent
            .set_reconcile_handler(handler_fn(|_ctx: ReconcileContext| async { Ok(drift(0, false)) }))
            .unwrap();
        agent.start().await.unwrap();
        assert!(agent.status().running());
        assert!(agent.status().next_reconcile_at.is_some());
        assert!(
            agent
                .set_reconcile_handler(handler_fn(|_ctx: ReconcileContext| async {
                    Ok(drift(0, false))
                }))
                .is_err()
        );

        let outcome = agent.stop(StopMode::graceful()).await.unwrap();
        assert_eq!(outcome, StopOutcome::Stopped);
        assert_eq!(agent.state(), AgentState::Stopped);
        assert_eq!(
            agent.stop(StopMode::graceful()).await.unwrap(),
            StopOutcome::NotRunning
        );
    }

    #[tokio::test]
    async fn trigger_runs_a_cycle_before_the_schedule() {
        let agent = Agent::new(config(RemediationPolicy::Notify));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        agent
            .set_reconcile_handler(handler_fn(move |_ctx: ReconcileContext| {
                let _ = tx.send(());
                async { Ok(drift(1, false)) }
            }))
            .unwrap();
        agent.start().await.unwrap();

        agent.trigger_now();
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();

        agent.stop(StopMode::graceful()).await.unwrap();
        assert_eq!(agent.status().reconcile_count, 1);
    }

    #[tokio::test]
    async fn graceful_stop_times_out_then_force_cancels() {
        let mut config = config(RemediationPolicy::Auto);
        config.reconcile_on_start = true;
        let agent = Agent::new(config);
        let (entered_tx, mut entered_rx) = tokio::sync::mpsc::unbounded_channel();
        agent
            .set_reconcile_handler(handler_fn(move |ctx: ReconcileContext| {
                let _ = entered_tx.send(());
                async move {
                    ctx.cancelled().await;
                    Err(AgentError::Cancelled)
                }
            }))
            .unwrap();
        agent.start().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), entered_rx.recv())
            .await
            .unwrap()
            .unwrap();

        let err = agent
            .stop(StopMode {
                force: false,
                timeout: Some(Duration::from_millis(50)),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::ShutdownTimeout { timeout_ms: 50 }));
        assert_eq!(agent.state(), AgentState::Stopping);

        let outcome = agent.stop(StopMode::forced()).await.unwrap();
        assert_eq!(outcome, StopOutcome::Stopped);
        assert_eq!(agent.state(), AgentState::Stopped);
    }

    #[tokio::test]
    async fn forced_stop_abandons_an_uncooperative_cycle() {
        let mut config = config(RemediationPolicy::Auto);
        config.reconcile_on_start = true;
        let agent = Agent::new(config);
        let (entered_tx, mut entered_rx) = tokio::sync::mpsc::unbounded_channel();
        agent
            .set_reconcile_handler(handler_fn(move |_ctx: ReconcileContext| {
                let _ = entered_tx.send(());
                async {
                    // Ignores cancellation.
                    tokio::time::sleep(Duration::from_secs(3_600)).await;
                    Ok(drift(0, false))
                }
            }))
            .unwrap();
        agent.start().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), entered_rx.recv())
            .await
            .unwrap()
            .unwrap();

        let outcome = agent
            .stop(StopMode {
                force: true,
                timeout: Some(Duration::from_millis(50)),
            })
            .await
            .unwrap();
        assert_eq!(outcome, StopOutcome::Abandoned);
        assert_eq!(agent.state(), AgentState::Stopped);
    }
}
