//! The reconcile handler seam between the agent loop and the engine.
//!
//! Each cycle the agent builds a [`ReconcileContext`] (policy, remediation
//! directive, cancellation) and awaits its [`ReconcileHandler`]. The handler
//! returns a fresh [`ReconciliationResult`]; only its summary fields are
//! folded into the agent status.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::approval::ApprovalRequest;
use super::error::AgentResult;
use super::policy::{Remediation, RemediationPolicy};

// ---------------------------------------------------------------------------
// Result
// ---------------------------------------------------------------------------

/// Outcome of one Plan-then-Apply cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationResult {
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration: Duration,
    pub drift_detected: bool,
    /// Drifted items by severity label.
    pub drift_count: BTreeMap<String, u64>,
    pub remediation_applied: bool,
    /// Changes attempted by apply.
    pub remediation_count: u64,
    /// Attempted changes whose apply result carried an error.
    pub failed_count: u64,
    /// Ids of every drifted item, when the handler reports them.
    #[serde(default)]
    pub drifted_items: Vec<String>,
    /// Drifted items this cycle did not attempt: all of them when reporting
    /// only, the unsafe ones under ApplySafe, and those outside an approval.
    #[serde(default)]
    pub held_items: Vec<String>,
}

impl ReconciliationResult {
    /// A cycle that found nothing to do.
    pub fn clean(started_at: DateTime<Utc>, completed_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            completed_at,
            duration: (completed_at - started_at).to_std().unwrap_or_default(),
            drift_detected: false,
            drift_count: BTreeMap::new(),
            remediation_applied: false,
            remediation_count: 0,
            failed_count: 0,
            drifted_items: Vec::new(),
            held_items: Vec::new(),
        }
    }

    pub fn total_drift(&self) -> u64 {
        self.drift_count.values().sum()
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Per-cycle inputs handed to the handler.
#[derive(Debug, Clone)]
pub struct ReconcileContext {
    pub policy: RemediationPolicy,
    pub remediation: Remediation,
    pub dry_run: bool,
    /// The approved request this cycle is applying, if any. Only its items
    /// may be applied.
    pub approval: Option<ApprovalRequest>,
    cancel: watch::Receiver<bool>,
}

impl ReconcileContext {
    pub fn new(
        policy: RemediationPolicy,
        remediation: Remediation,
        dry_run: bool,
        approval: Option<ApprovalRequest>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            policy,
            remediation,
            dry_run,
            approval,
            cancel,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves once the cycle is cancelled by a forced stop, or the agent
    /// that issued the context is gone.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel.clone();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// Runs one reconciliation cycle against the external engine.
#[async_trait]
pub trait ReconcileHandler: Send + Sync {
    async fn reconcile(&self, ctx: ReconcileContext) -> AgentResult<ReconciliationResult>;

    /// Checked once while the agent is Starting. Defaults to healthy.
    async fn health_check(&self) -> AgentResult<()> {
        Ok(())
    }
}

/// Adapts an async closure into a [`ReconcileHandler`].
pub struct FnHandler<F>(F);

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(ReconcileContext) -> Fut + Send + Sync,
    Fut: Future<Output = AgentResult<ReconciliationResult>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> ReconcileHandler for FnHandler<F>
where
    F: Fn(ReconcileContext) -> Fut + Send + Sync,
    Fut: Future<Output = AgentResult<ReconciliationResult>> + Send + 'static,
{
    async fn reconcile(&self, ctx: ReconcileContext) -> AgentResult<ReconciliationResult> {
        (self.0)(ctx).await
    }
}
