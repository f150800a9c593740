//! Local control plane between CLI invocations and the running agent.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::{ClientError, ClientResult, ControlClient, agent_pid, is_agent_running};
pub use protocol::{
    ApproveResponse, ControlRequest, ControlResponse, ErrorKind, PROTOCOL_VERSION, StatusResponse,
    StopResponse, WireError,
};
pub use server::{ControlHandler, ControlServer, ServerError, ServerResult, dispatch};
