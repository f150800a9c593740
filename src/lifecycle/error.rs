//! Lifecycle and service-registration error types.

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum LifecycleError {
    #[error("agent already running (PID {pid})")]
    #[diagnostic(
        code(homestate::lifecycle::already_running),
        help("Stop it first with `homestate agent stop`, or query it with `homestate agent status`.")
    )]
    AlreadyRunning { pid: u32 },

    #[error("another agent is starting (instance lock held: {path})")]
    #[diagnostic(
        code(homestate::lifecycle::lock_held),
        help("Wait for the other start to finish, then check `homestate agent status`.")
    )]
    LockHeld { path: String },

    #[error("failed to acquire instance lock: {path}")]
    #[diagnostic(
        code(homestate::lifecycle::lock),
        help("Check that the runtime directory is writable.")
    )]
    Lock {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write PID marker: {path}")]
    #[diagnostic(
        code(homestate::lifecycle::pid_marker),
        help("Check that the runtime directory is writable.")
    )]
    PidMarker {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to open agent log: {path}")]
    #[diagnostic(
        code(homestate::lifecycle::log_file),
        help("Check that the state directory is writable.")
    )]
    LogFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn background agent: {program}")]
    #[diagnostic(
        code(homestate::lifecycle::spawn),
        help("Run with `--foreground` to see startup errors directly.")
    )]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to install signal handlers")]
    #[diagnostic(code(homestate::lifecycle::signals))]
    Signals {
        #[source]
        source: std::io::Error,
    },
}

pub type LifecycleResult<T> = std::result::Result<T, LifecycleError>;

#[derive(Debug, Error, Diagnostic)]
pub enum ServiceError {
    #[error("service registration is not supported on {platform}")]
    #[diagnostic(
        code(homestate::service::unsupported),
        help("Start the agent manually with `homestate agent start`, or from your init system.")
    )]
    Unsupported { platform: String },

    #[error("cannot determine home directory for service files")]
    #[diagnostic(
        code(homestate::service::no_home),
        help("Set the HOME environment variable.")
    )]
    NoHome,

    #[error("failed to write service unit: {path}")]
    #[diagnostic(code(homestate::service::write))]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to remove service unit: {path}")]
    #[diagnostic(code(homestate::service::remove))]
    Remove {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` failed: {message}")]
    #[diagnostic(
        code(homestate::service::command),
        help("The unit file was written; activate it manually with the command shown.")
    )]
    Command { command: String, message: String },
}

pub type ServiceResult<T> = std::result::Result<T, ServiceError>;
