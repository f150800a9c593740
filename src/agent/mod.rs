//! Agent layer: the long-running reconciliation process.
//!
//! The agent wraps a pluggable reconcile handler and adds:
//! - **Schedule** (fixed intervals or cron rules, parsed once)
//! - **Remediation policy** (notify, auto, approved, safe)
//! - **Approval workflow** (one outstanding request under the Approved policy)
//! - **State machine** (Idle → Starting → Running → Stopping → Stopped)
//! - **Status** (snapshot shared with the control server)

#[allow(clippy::module_inception)]
pub mod agent;
pub mod approval;
pub mod clock;
pub mod config;
pub mod error;
pub mod policy;
pub mod reconcile;
pub mod schedule;
pub mod status;

pub use agent::{Agent, StopMode, StopOutcome};
pub use approval::{ApprovalRequest, ApprovalState, ApprovalWorkflow, RaiseOutcome};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AgentConfig, AgentSettings, TimeoutSettings, Timeouts};
pub use error::{AgentError, AgentResult};
pub use policy::{Remediation, RemediationPolicy};
pub use reconcile::{
    FnHandler, ReconcileContext, ReconcileHandler, ReconciliationResult, handler_fn,
};
pub use schedule::{Schedule, duration_millis, parse_duration};
pub use status::{AgentState, AgentStatus, Health, HealthStatus, format_duration};
