//! XDG-compliant path resolution for homestate.
//!
//! `AgentPaths` resolves the config, state, and runtime directories the agent
//! uses for its settings file, log, PID marker, control socket, and instance
//! lock, following the XDG Base Directory Specification.

use std::path::{Path, PathBuf};

use miette::Diagnostic;
use thiserror::Error;

/// Errors from path resolution.
#[derive(Debug, Error, Diagnostic)]
pub enum PathError {
    #[error("cannot determine home directory")]
    #[diagnostic(
        code(homestate::paths::no_home),
        help("Set the HOME environment variable or ensure a valid user profile exists.")
    )]
    NoHome,

    #[error("failed to create directory: {path}")]
    #[diagnostic(
        code(homestate::paths::create_dir),
        help("Check that the parent directory exists and you have write permissions.")
    )]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type PathResult<T> = std::result::Result<T, PathError>;

/// Directories used by the agent and its control client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentPaths {
    /// `$XDG_CONFIG_HOME/homestate/`
    pub config_dir: PathBuf,
    /// `$XDG_STATE_HOME/homestate/`
    pub state_dir: PathBuf,
    /// `$XDG_RUNTIME_DIR/homestate/` (falls back to `state_dir/run/`)
    pub runtime_dir: PathBuf,
    /// Set when every directory was laid out under one root.
    root: Option<PathBuf>,
}

impl AgentPaths {
    /// Resolve XDG directories from environment variables with standard fallbacks.
    pub fn resolve() -> PathResult<Self> {
        let home = std::env::var("HOME")
            .map(PathBuf::from)
            .map_err(|_| PathError::NoHome)?;

        let config_dir = std::env::var("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home.join(".config"))
            .join("homestate");

        let state_dir = std::env::var("XDG_STATE_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home.join(".local/state"))
            .join("homestate");

        let runtime_dir = std::env::var("XDG_RUNTIME_DIR")
            .map(|d| PathBuf::from(d).join("homestate"))
            .unwrap_or_else(|_| state_dir.join("run"));

        Ok(Self {
            config_dir,
            state_dir,
            runtime_dir,
            root: None,
        })
    }

    /// Lay every directory out under a single root. Used by tests and by
    /// the `--root` override.
    pub fn under(root: &Path) -> Self {
        let root = std::path::absolute(root).unwrap_or_else(|_| root.to_path_buf());
        Self {
            config_dir: root.join("config"),
            state_dir: root.join("state"),
            runtime_dir: root.join("run"),
            root: Some(root),
        }
    }

    /// Global flags that make a re-executed `homestate` resolve these same
    /// paths. Empty for XDG paths, which the child resolves from its
    /// inherited environment.
    pub fn cli_args(&self) -> Vec<String> {
        match &self.root {
            Some(root) => vec!["--root".to_string(), root.display().to_string()],
            None => Vec::new(),
        }
    }

    /// Create all base directories. Idempotent.
    pub fn ensure_dirs(&self) -> PathResult<()> {
        for dir in [
            &self.config_dir,
            &self.state_dir,
            &self.runtime_dir,
            &self.state_dir.join("logs"),
        ] {
            std::fs::create_dir_all(dir).map_err(|e| PathError::CreateDir {
                path: dir.display().to_string(),
                source: e,
            })?;
        }
        Ok(())
    }

    /// Agent settings file (TOML).
    pub fn settings_file(&self) -> PathBuf {
        self.config_dir.join("agent.toml")
    }

    /// PID marker written by the running agent.
    pub fn pid_file(&self) -> PathBuf {
        self.runtime_dir.join("agent.pid")
    }

    /// Control socket the agent listens on.
    pub fn socket_path(&self) -> PathBuf {
        self.runtime_dir.join("agent.sock")
    }

    /// Advisory lock held for the lifetime of a foreground agent.
    pub fn lock_file(&self) -> PathBuf {
        self.runtime_dir.join("agent.lock")
    }

    /// Agent log; a daemonized agent's stdout and stderr land here.
    pub fn log_file(&self) -> PathBuf {
        self.state_dir.join("logs").join("agent.log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolved_paths_use_xdg_layout() {
        // Only reads the environment; mutating it is unsafe in edition 2024.
        let paths = AgentPaths::resolve().unwrap();
        assert!(
            paths.config_dir.to_string_lossy().contains("homestate"),
            "config_dir should contain 'homestate': {}",
            paths.config_dir.display()
        );
        assert!(paths.pid_file().starts_with(&paths.runtime_dir));
        assert!(paths.log_file().starts_with(&paths.state_dir));
    }

    #[test]
    fn derived_files_live_in_expected_dirs() {
        let paths = AgentPaths {
            config_dir: PathBuf::from("/cfg/homestate"),
            state_dir: PathBuf::from("/state/homestate"),
            runtime_dir: PathBuf::from("/run/homestate"),
            root: None,
        };
        assert_eq!(
            paths.settings_file(),
            PathBuf::from("/cfg/homestate/agent.toml")
        );
        assert_eq!(paths.pid_file(), PathBuf::from("/run/homestate/agent.pid"));
        assert_eq!(
            paths.socket_path(),
            PathBuf::from("/run/homestate/agent.sock")
        );
        assert_eq!(
            paths.lock_file(),
            PathBuf::from("/run/homestate/agent.lock")
        );
        assert_eq!(
            paths.log_file(),
            PathBuf::from("/state/homestate/logs/agent.log")
        );
    }

    #[test]
    fn ensure_dirs_creates_layout_under_root() {
        let dir = tempfile::TempDir::new().unwrap();
        let paths = AgentPaths::under(dir.path());
        paths.ensure_dirs().unwrap();
        assert!(paths.config_dir.is_dir());
        assert!(paths.runtime_dir.is_dir());
        assert!(paths.state_dir.join("logs").is_dir());
        // Idempotent.
        paths.ensure_dirs().unwrap();
    }

    #[test]
    fn rooted_paths_carry_their_root_flag() {
        let dir = tempfile::TempDir::new().unwrap();
        let paths = AgentPaths::under(dir.path());
        assert_eq!(
            paths.cli_args(),
            vec!["--root".to_string(), dir.path().display().to_string()]
        );
        assert!(AgentPaths::resolve().unwrap().cli_args().is_empty());
    }
}
