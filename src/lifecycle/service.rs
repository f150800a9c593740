//! OS service registration for the agent.
//!
//! - **macOS**: launchd user agent in `~/Library/LaunchAgents/`
//! - **Linux**: systemd user unit in `~/.config/systemd/user/`
//!
//! Both units run `homestate agent start --foreground` with the same
//! validated arguments a daemonized start would use, and let the service
//! manager own restarts.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Command;

use super::daemonize::agent_args;
use super::error::{ServiceError, ServiceResult};
use crate::agent::AgentConfig;
use crate::paths::AgentPaths;

pub const LAUNCHD_LABEL: &str = "dev.homestate.agent";
pub const SYSTEMD_UNIT_NAME: &str = "homestate-agent.service";

/// What a service unit launches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub log_file: PathBuf,
}

impl ServiceSpec {
    pub fn for_agent(
        program: PathBuf,
        config: &AgentConfig,
        paths: &AgentPaths,
        settings_file: &Path,
    ) -> Self {
        Self {
            program,
            args: agent_args(config, paths, settings_file),
            log_file: paths.log_file(),
        }
    }
}

/// Registers the agent with the platform service manager.
pub trait ServiceInstaller {
    /// Service manager name, for messages.
    fn name(&self) -> &'static str;

    /// Where the unit file lives.
    fn unit_path(&self) -> ServiceResult<PathBuf>;

    /// Unit file contents for `spec`.
    fn render(&self, spec: &ServiceSpec) -> ServiceResult<String>;

    /// Load the written unit. No-op when activation is disabled.
    fn activate(&self, unit: &Path) -> ServiceResult<()>;

    /// Unload the unit. Failures are logged, not returned: the unit may never
    /// have been loaded.
    fn deactivate(&self, unit: &Path);

    /// Write the unit file and activate it. Returns the unit path.
    fn install(&self, spec: &ServiceSpec) -> ServiceResult<PathBuf> {
        let path = self.unit_path()?;
        let contents = self.render(spec)?;
        let write_err = |source| ServiceError::Write {
            path: path.display().to_string(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        std::fs::write(&path, contents).map_err(write_err)?;
        tracing::info!(manager = self.name(), path = %path.display(), "service unit written");
        self.activate(&path)?;
        Ok(path)
    }

    /// Deactivate and remove the unit. Returns false if nothing was installed.
    fn uninstall(&self) -> ServiceResult<bool> {
        let path = self.unit_path()?;
        if !path.exists() {
            return Ok(false);
        }
        self.deactivate(&path);
        std::fs::remove_file(&path).map_err(|source| ServiceError::Remove {
            path: path.display().to_string(),
            source,
        })?;
        tracing::info!(manager = self.name(), path = %path.display(), "service unit removed");
        Ok(true)
    }
}

/// Pick the installer for this platform, rooted at `$HOME`.
pub fn detect() -> ServiceResult<Box<dyn ServiceInstaller>> {
    if !cfg!(any(target_os = "macos", target_os = "linux")) {
        return Ok(Box::new(Unsupported::new(std::env::consts::OS)));
    }
    let home = std::env::var_os("HOME")
        .filter(|h| !h.is_empty())
        .map(PathBuf::from)
        .ok_or(ServiceError::NoHome)?;
    if cfg!(target_os = "macos") {
        Ok(Box::new(LaunchAgentInstaller::new(home)))
    } else {
        Ok(Box::new(SystemdInstaller::new(home)))
    }
}

fn run<S: AsRef<OsStr>>(program: &str, args: &[S]) -> ServiceResult<()> {
    let mut command = program.to_string();
    for arg in args {
        command.push(' ');
        command.push_str(&arg.as_ref().to_string_lossy());
    }
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| ServiceError::Command {
            command: command.clone(),
            message: e.to_string(),
        })?;
    if output.status.success() {
        return Ok(());
    }
    Err(ServiceError::Command {
        command,
        message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

// ---------------------------------------------------------------------------
// macOS: launchd
// ---------------------------------------------------------------------------

pub struct LaunchAgentInstaller {
    home: PathBuf,
    activate: bool,
}

impl LaunchAgentInstaller {
    pub fn new(home: PathBuf) -> Self {
        Self {
            home,
            activate: true,
        }
    }

    /// Write and remove plists without calling `launchctl`.
    pub fn without_activation(mut self) -> Self {
        self.activate = false;
        self
    }
}

pub(crate) fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

impl ServiceInstaller for LaunchAgentInstaller {
    fn name(&self) -> &'static str {
        "launchd"
    }

    fn unit_path(&self) -> ServiceResult<PathBuf> {
        Ok(self
            .home
            .join("Library")
            .join("LaunchAgents")
            .join(format!("{LAUNCHD_LABEL}.plist")))
    }

    fn render(&self, spec: &ServiceSpec) -> ServiceResult<String> {
        let mut arguments = format!(
            "        <string>{}</string>\n",
            escape_xml(&spec.program.display().to_string())
        );
        for arg in &spec.args {
            arguments.push_str(&format!("        <string>{}</string>\n", escape_xml(arg)));
        }
        let log = escape_xml(&spec.log_file.display().to_string());

        Ok(format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>Label</key>
    <string>{LAUNCHD_LABEL}</string>
    <key>ProgramArguments</key>
    <array>
{arguments}    </array>
    <key>KeepAlive</key>
    <dict>
        <key>SuccessfulExit</key>
        <false/>
    </dict>
    <key>RunAtLoad</key>
    <true/>
    <key>ThrottleInterval</key>
    <integer>10</integer>
    <key>StandardOutPath</key>
    <string>{log}</string>
    <key>StandardErrorPath</key>
    <string>{log}</string>
</dict>
</plist>
"#
        ))
    }

    fn activate(&self, unit: &Path) -> ServiceResult<()> {
        if !self.activate {
            return Ok(());
        }
        run("launchctl", &[OsStr::new("load"), OsStr::new("-w"), unit.as_os_str()])
    }

    fn deactivate(&self, unit: &Path) {
        if !self.activate {
            return;
        }
        if let Err(e) = run("launchctl", &[OsStr::new("unload"), OsStr::new("-w"), unit.as_os_str()]) {
            tracing::warn!(error = %e, "launchctl unload failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Linux: systemd
// ---------------------------------------------------------------------------

pub struct SystemdInstaller {
    home: PathBuf,
    activate: bool,
}

impl SystemdInstaller {
    pub fn new(home: PathBuf) -> Self {
        Self {
            home,
            activate: true,
        }
    }

    /// Write and remove units without calling `systemctl`.
    pub fn without_activation(mut self) -> Self {
        self.activate = false;
        self
    }

    fn systemctl(&self, args: &[&str]) -> ServiceResult<()> {
        let mut full = vec!["--user"];
        full.extend_from_slice(args);
        full.push(SYSTEMD_UNIT_NAME);
        run("systemctl", &full)
    }
}

/// Quote one `ExecStart=` word. `%` is a specifier prefix in unit files.
fn systemd_quote(word: &str) -> String {
    let escaped = word
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('%', "%%");
    format!("\"{escaped}\"")
}

impl ServiceInstaller for SystemdInstaller {
    fn name(&self) -> &'static str {
        "systemd"
    }

    fn unit_path(&self) -> ServiceResult<PathBuf> {
        Ok(self
            .home
            .join(".config")
            .join("systemd")
            .join("user")
            .join(SYSTEMD_UNIT_NAME))
    }

    fn render(&self, spec: &ServiceSpec) -> ServiceResult<String> {
        let mut exec = systemd_quote(&spec.program.display().to_string());
        for arg in &spec.args {
            exec.push(' ');
            exec.push_str(&systemd_quote(arg));
        }
        let log = spec.log_file.display().to_string().replace('%', "%%");

        Ok(format!(
            r#"[Unit]
Description=homestate reconciliation agent

[Service]
Type=simple
ExecStart={exec}
Restart=on-failure
RestartSec=10
StandardOutput=append:{log}
StandardError=append:{log}

[Install]
WantedBy=default.target
"#
        ))
    }

    fn activate(&self, _unit: &Path) -> ServiceResult<()> {
        if !self.activate {
            return Ok(());
        }
        run("systemctl", &["--user", "daemon-reload"])?;
        self.systemctl(&["enable", "--now"])
    }

    fn deactivate(&self, _unit: &Path) {
        if !self.activate {
            return;
        }
        if let Err(e) = self.systemctl(&["disable", "--now"]) {
            tracing::warn!(error = %e, "systemctl disable failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Everything else
// ---------------------------------------------------------------------------

pub struct Unsupported {
    platform: String,
}

impl Unsupported {
    pub fn new(platform: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
        }
    }

    fn error(&self) -> ServiceError {
        ServiceError::Unsupported {
            platform: self.platform.clone(),
        }
    }
}

impl ServiceInstaller for Unsupported {
    fn name(&self) -> &'static str {
        "none"
    }

    fn unit_path(&self) -> ServiceResult<PathBuf> {
        Err(self.error())
    }

    fn render(&self, _spec: &ServiceSpec) -> ServiceResult<String> {
        Err(self.error())
    }

    fn activate(&self, _unit: &Path) -> ServiceResult<()> {
        Err(self.error())
    }

    fn deactivate(&self, _unit: &Path) {}
}
