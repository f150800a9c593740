//! Agent-specific error types with rich miette diagnostics.

use miette::Diagnostic;
use thiserror::Error;

/// Errors from the agent state machine, its reconcile handler, and the
/// approval workflow.
#[derive(Debug, Error, Diagnostic)]
pub enum AgentError {
    #[error("cannot {action} agent while it is {state}")]
    #[diagnostic(
        code(homestate::agent::invalid_transition),
        help(
            "An agent starts once from Idle and is terminal once Stopped. \
             Create a new agent instance to start again."
        )
    )]
    InvalidTransition { action: String, state: String },

    #[error("no reconcile handler installed")]
    #[diagnostic(
        code(homestate::agent::no_handler),
        help("Call `Agent::set_reconcile_handler` before `Agent::start`.")
    )]
    NoHandler,

    #[error("health check failed: {message}")]
    #[diagnostic(
        code(homestate::agent::health_check),
        help("The reconciliation engine is not usable. Fix the reported problem and start again.")
    )]
    HealthCheckFailed { message: String },

    #[error("health check did not finish within {timeout_ms} ms")]
    #[diagnostic(
        code(homestate::agent::health_check_timeout),
        help("Raise `timeouts.health_check` in the agent settings if the engine is slow to respond.")
    )]
    HealthCheckTimeout { timeout_ms: u64 },

    #[error("reconciliation failed: {message}")]
    #[diagnostic(
        code(homestate::agent::reconcile),
        help("The agent keeps running and retries on the next scheduled cycle.")
    )]
    Reconcile { message: String },

    #[error("reconciliation cancelled")]
    #[diagnostic(code(homestate::agent::cancelled))]
    Cancelled,

    #[error("no pending approval request with id \"{id}\"")]
    #[diagnostic(
        code(homestate::agent::approval_not_found),
        help("Run `homestate agent status` to see the id of the pending request, if any.")
    )]
    ApprovalNotFound { id: String },

    #[error("agent loop did not exit within {timeout_ms} ms")]
    #[diagnostic(
        code(homestate::agent::shutdown_timeout),
        help(
            "A reconciliation is still in flight. Retry with `--force` to cancel it, \
             or wait and stop again."
        )
    )]
    ShutdownTimeout { timeout_ms: u64 },
}

pub type AgentResult<T> = std::result::Result<T, AgentError>;
