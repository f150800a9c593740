//! Detach a foreground-mode agent into the background.
//!
//! The parent re-executes itself with the validated foreground arguments in
//! a new session, points the child's output at the agent log, reports the
//! child's PID and returns. It never waits on or supervises the child.

use std::fs::OpenOptions;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};

use super::error::{LifecycleError, LifecycleResult};
use crate::agent::AgentConfig;
use crate::paths::AgentPaths;

/// Spawn `program args...` detached from this process. Returns the child PID.
pub fn daemonize(program: &Path, args: &[String], log_file: &Path) -> LifecycleResult<u32> {
    let log_err = |source: std::io::Error| LifecycleError::LogFile {
        path: log_file.display().to_string(),
        source,
    };
    if let Some(parent) = log_file.parent() {
        std::fs::create_dir_all(parent).map_err(log_err)?;
    }
    let stdout = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .map_err(log_err)?;
    let stderr = stdout.try_clone().map_err(log_err)?;

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr));

    // SAFETY: setsid is async-signal-safe and touches no parent state.
    unsafe {
        command.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = command.spawn().map_err(|e| LifecycleError::Spawn {
        program: program.display().to_string(),
        source: e,
    })?;
    let pid = child.id();
    tracing::info!(pid, log = %log_file.display(), "agent detached");
    Ok(pid)
}

/// Command line that re-enters `config` in the foreground under `paths`,
/// reading the same settings file.
pub fn agent_args(config: &AgentConfig, paths: &AgentPaths, settings_file: &Path) -> Vec<String> {
    let settings_file =
        std::path::absolute(settings_file).unwrap_or_else(|_| settings_file.to_path_buf());
    let mut args = paths.cli_args();
    args.extend(config.foreground_args());
    args.push("--settings".to_string());
    args.push(settings_file.display().to_string());
    args
}

/// Re-enter this binary as `agent start --foreground` with `config`.
pub fn daemonize_agent(
    config: &AgentConfig,
    paths: &AgentPaths,
    settings_file: &Path,
) -> LifecycleResult<u32> {
    let exe = std::env::current_exe().map_err(|e| LifecycleError::Spawn {
        program: "current executable".into(),
        source: e,
    })?;
    daemonize(&exe, &agent_args(config, paths, settings_file), &paths.log_file())
}
