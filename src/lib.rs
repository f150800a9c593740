// thiserror's #[error("...{field}...")] format strings reference struct fields,
// but the compiler doesn't see through the derive macro and reports false positives.
#![allow(unused_assignments)]

//! # homestate
//!
//! A background agent that keeps a workstation converged on its declared
//! configuration.
//!
//! ## Architecture
//!
//! - **Agent** (`agent`): schedule, remediation policy, approval workflow,
//!   and the state machine that drives periodic Plan-then-Apply cycles
//! - **Engine** (`engine`): the external reconciliation engine interface and
//!   its command-line adapter
//! - **Control** (`control`): newline-delimited JSON protocol over a Unix
//!   socket, server and client
//! - **Lifecycle** (`lifecycle`): single-instance start, daemonization, PID
//!   marker, launchd/systemd registration
//!
//! ## Library usage
//!
//! ```no_run
//! use homestate::agent::{Agent, AgentConfig, RemediationPolicy, Schedule, StopMode};
//! use homestate::engine::{CommandEngine, EngineReconciler};
//!
//! # async fn run() -> homestate::error::HomestateResult<()> {
//! let config = AgentConfig::new(
//!     "/home/me/.config/homestate/workstation.toml",
//!     Schedule::parse("1h")?,
//!     RemediationPolicy::Safe,
//! );
//! let handler = EngineReconciler::for_config(CommandEngine::new(&config.engine), &config);
//! let agent = Agent::new(config);
//! agent.set_reconcile_handler(handler)?;
//! agent.start().await?;
//! println!("{}", agent.status().health);
//! agent.stop(StopMode::graceful()).await?;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod control;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod paths;
