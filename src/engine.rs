//! Reconciliation engine interface and its command-line adapter.
//!
//! The agent never inspects configuration itself. Each cycle it asks a
//! [`ReconcileEngine`] for a [`Plan`] of drifted items, picks the subset the
//! remediation directive allows, and hands that back to `apply`.
//! [`EngineReconciler`] is the glue that turns an engine into the agent's
//! [`ReconcileHandler`].
//!
//! [`CommandEngine`] talks to an external executable:
//!
//! ```text
//! <program> plan  --config <path> --target <t> --format json
//! <program> apply --config <path> --target <t> --format json [--dry-run]   (plan JSON on stdin)
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use chrono::Utc;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::agent::{
    AgentConfig, AgentError, AgentResult, ApprovalRequest, ReconcileContext, ReconcileHandler,
    ReconciliationResult, Remediation,
};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum EngineError {
    #[error("failed to run engine `{program}`")]
    #[diagnostic(
        code(homestate::engine::spawn),
        help("Check that the engine is installed and on PATH, or pass --engine.")
    )]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("engine `{command}` exited with {status}: {stderr}")]
    #[diagnostic(code(homestate::engine::failed))]
    Failed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("engine `{command}` produced invalid output: {message}")]
    #[diagnostic(code(homestate::engine::decode))]
    Decode { command: String, message: String },

    #[error("engine call cancelled")]
    #[diagnostic(code(homestate::engine::cancelled))]
    Cancelled,
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

impl From<EngineError> for AgentError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Cancelled => AgentError::Cancelled,
            other => AgentError::Reconcile {
                message: other.to_string(),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// One drifted item the engine would change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanItem {
    pub id: String,
    #[serde(default)]
    pub description: String,
    /// Free-form severity label, e.g. `low`, `medium`, `high`.
    pub severity: String,
    /// Whether the engine classifies the change as low-risk.
    #[serde(default)]
    pub safe: bool,
}

/// The engine's view of what differs between declared and actual state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub config: PathBuf,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub items: Vec<PlanItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanSummary {
    /// Items needing apply, by severity.
    pub needs_apply: BTreeMap<String, u64>,
}

impl Plan {
    pub fn has_changes(&self) -> bool {
        !self.items.is_empty()
    }

    pub fn summary(&self) -> PlanSummary {
        let mut needs_apply = BTreeMap::new();
        for item in &self.items {
            *needs_apply.entry(item.severity.clone()).or_insert(0) += 1;
        }
        PlanSummary { needs_apply }
    }

    pub fn item_ids(&self) -> Vec<String> {
        self.items.iter().map(|i| i.id.clone()).collect()
    }

    /// The same plan restricted to items marked safe.
    pub fn safe_subset(&self) -> Plan {
        self.filtered(|i| i.safe)
    }

    /// The same plan restricted to the items an approval covers.
    pub fn approved_subset(&self, approval: &ApprovalRequest) -> Plan {
        self.filtered(|i| approval.covers(&i.id))
    }

    fn filtered(&self, keep: impl Fn(&PlanItem) -> bool) -> Plan {
        Plan {
            config: self.config.clone(),
            target: self.target.clone(),
            items: self.items.iter().filter(|i| keep(i)).cloned().collect(),
        }
    }
}

/// Per-item outcome of an apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyResult {
    pub id: String,
    #[serde(default)]
    pub error: Option<String>,
}

impl ApplyResult {
    pub fn failed(&self) -> bool {
        self.error.is_some()
    }
}

// ---------------------------------------------------------------------------
// Engine trait
// ---------------------------------------------------------------------------

/// Computes and applies plans. Implementations should return
/// [`EngineError::Cancelled`] promptly once `ctx` is cancelled.
#[async_trait]
pub trait ReconcileEngine: Send + Sync {
    async fn plan(
        &self,
        ctx: &ReconcileContext,
        config_path: &Path,
        target: &str,
    ) -> EngineResult<Plan>;

    async fn apply(
        &self,
        ctx: &ReconcileContext,
        plan: &Plan,
        dry_run: bool,
    ) -> EngineResult<Vec<ApplyResult>>;

    async fn health_check(&self) -> EngineResult<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Command adapter
// ---------------------------------------------------------------------------

/// Runs the engine as a child process per call. The child is killed if the
/// cycle is cancelled.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    program: PathBuf,
    leading_args: Vec<String>,
}

impl CommandEngine {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    /// Arguments placed before the subcommand, for engines launched through
    /// an interpreter or wrapper.
    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.leading_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    async fn run(
        &self,
        ctx: Option<&ReconcileContext>,
        args: &[String],
        input: Option<Vec<u8>>,
    ) -> EngineResult<Vec<u8>> {
        let command = format!("{} {}", self.program.display(), args.join(" "));
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.leading_args)
            .args(args)
            .stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| EngineError::Spawn {
            program: self.program.display().to_string(),
            source,
        })?;
        if let (Some(input), Some(mut stdin)) = (input, child.stdin.take()) {
            tokio::spawn(async move {
                let _ = stdin.write_all(&input).await;
            });
        }

        tracing::debug!(%command, "running engine");
        let output = match ctx {
            Some(ctx) => tokio::select! {
                output = child.wait_with_output() => output,
                _ = ctx.cancelled() => return Err(EngineError::Cancelled),
            },
            None => child.wait_with_output().await,
        }
        .map_err(|source| EngineError::Spawn {
            program: self.program.display().to_string(),
            source,
        })?;

        if !output.status.success() {
            return Err(EngineError::Failed {
                command,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }
}

fn engine_args(subcommand: &str, config_path: &Path, target: &str) -> Vec<String> {
    vec![
        subcommand.to_string(),
        "--config".to_string(),
        config_path.display().to_string(),
        "--target".to_string(),
        target.to_string(),
        "--format".to_string(),
        "json".to_string(),
    ]
}

fn decode<T: serde::de::DeserializeOwned>(command: &str, bytes: &[u8]) -> EngineResult<T> {
    serde_json::from_slice(bytes).map_err(|e| EngineError::Decode {
        command: command.to_string(),
        message: e.to_string(),
    })
}

#[async_trait]
impl ReconcileEngine for CommandEngine {
    async fn plan(
        &self,
        ctx: &ReconcileContext,
        config_path: &Path,
        target: &str,
    ) -> EngineResult<Plan> {
        let args = engine_args("plan", config_path, target);
        let stdout = self.run(Some(ctx), &args, None).await?;
        let mut plan: Plan = decode("plan", &stdout)?;
        plan.config = config_path.to_path_buf();
        plan.target = target.to_string();
        Ok(plan)
    }

    async fn apply(
        &self,
        ctx: &ReconcileContext,
        plan: &Plan,
        dry_run: bool,
    ) -> EngineResult<Vec<ApplyResult>> {
        let mut args = engine_args("apply", &plan.config, &plan.target);
        if dry_run {
            args.push("--dry-run".to_string());
        }
        let input = serde_json::to_vec(plan).map_err(|e| EngineError::Decode {
            command: "apply".to_string(),
            message: e.to_string(),
        })?;
        let stdout = self.run(Some(ctx), &args, Some(input)).await?;
        decode("apply", &stdout)
    }

    async fn health_check(&self) -> EngineResult<()> {
        self.run(None, &["--version".to_string()], None).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

/// Plan, select by remediation directive, apply.
pub struct EngineReconciler<E> {
    engine: E,
    config_path: PathBuf,
    target: String,
}

impl<E: ReconcileEngine> EngineReconciler<E> {
    pub fn new(engine: E, config_path: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        Self {
            engine,
            config_path: config_path.into(),
            target: target.into(),
        }
    }

    pub fn for_config(engine: E, config: &AgentConfig) -> Self {
        Self::new(engine, config.config_path.clone(), config.target.clone())
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    async fn cycle(&self, ctx: ReconcileContext) -> EngineResult<ReconciliationResult> {
        let started_at = Utc::now();
        let plan = self
            .engine
            .plan(&ctx, &self.config_path, &self.target)
            .await?;

        let mut result = ReconciliationResult::clean(started_at, started_at);
        result.drift_detected = plan.has_changes();
        result.drift_count = plan.summary().needs_apply;
        result.drifted_items = plan.item_ids();

        let selected = match (ctx.remediation, &ctx.approval) {
            (Remediation::ReportOnly, _) => None,
            (Remediation::ApplyAll, Some(approval)) => Some(plan.approved_subset(approval)),
            (Remediation::ApplyAll, None) => Some(plan),
            (Remediation::ApplySafe, _) => Some(plan.safe_subset()),
        }
        .filter(Plan::has_changes);
        let attempted = selected.as_ref().map(Plan::item_ids).unwrap_or_default();
        result.held_items = result
            .drifted_items
            .iter()
            .filter(|id| !attempted.contains(id))
            .cloned()
            .collect();
        if !result.held_items.is_empty() {
            tracing::debug!(held = result.held_items.len(), "drifted items left for a later cycle");
        }

        if let Some(selected) = selected {
            let applied = self.engine.apply(&ctx, &selected, ctx.dry_run).await?;
            let failed = applied.iter().filter(|r| r.failed()).count() as u64;
            result.remediation_count = applied.len() as u64;
            result.failed_count = failed;
            result.remediation_applied = !ctx.dry_run;
            tracing::info!(
                attempted = result.remediation_count,
                failed,
                dry_run = ctx.dry_run,
                "apply finished"
            );
        }

        result.completed_at = Utc::now();
        result.duration = (result.completed_at - started_at).to_std().unwrap_or_default();
        Ok(result)
    }
}

#[async_trait]
impl<E: ReconcileEngine> ReconcileHandler for EngineReconciler<E> {
    async fn reconcile(&self, ctx: ReconcileContext) -> AgentResult<ReconciliationResult> {
        self.cycle(ctx).await.map_err(AgentError::from)
    }

    async fn health_check(&self) -> AgentResult<()> {
        self.engine
            .health_check()
            .await
            .map_err(|e| AgentError::HealthCheckFailed {
                message: e.to_string(),
            })
    }
}
