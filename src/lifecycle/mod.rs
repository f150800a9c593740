//! Process lifecycle: single-instance start, daemonization, PID marker
//! ownership, and OS service registration.

pub mod daemonize;
pub mod error;
pub mod host;
pub mod lock;
pub mod pid;
pub mod service;

pub use daemonize::{agent_args, daemonize, daemonize_agent};
pub use error::{LifecycleError, LifecycleResult, ServiceError, ServiceResult};
pub use host::{AgentHost, run_foreground};
pub use lock::InstanceLock;
pub use pid::{PidMarker, ensure_not_running, live_marker, process_alive};
pub use service::{
    LaunchAgentInstaller, ServiceInstaller, ServiceSpec, SystemdInstaller, Unsupported, detect,
};
