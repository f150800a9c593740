//! Agent configuration: the on-disk settings file and the validated,
//! immutable [`AgentConfig`] the agent runs with.
//!
//! Resolution order is: built-in defaults, then `agent.toml`, then command
//! line flags. Everything is validated once, before the agent starts.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::policy::RemediationPolicy;
use super::schedule::{Schedule, duration_expr, parse_duration};
use crate::error::{ValidationError, ValidationResult};

pub const DEFAULT_SCHEDULE: &str = "30m";
pub const DEFAULT_TARGET: &str = "default";
pub const DEFAULT_ENGINE: &str = "homestate-engine";

// ---------------------------------------------------------------------------
// Validated configuration
// ---------------------------------------------------------------------------

/// Bounds on the agent's blocking operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeouts {
    /// How long a graceful stop waits for the loop to drain (default: 30s).
    pub shutdown: Duration,
    /// How long a forced stop waits before abandoning the loop (default: 5s).
    pub force_shutdown: Duration,
    /// Bound on the engine health check during start (default: 10s).
    pub health_check: Duration,
    /// Lifetime of a pending approval request. `None` = never expires.
    pub approval_ttl: Option<Duration>,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            shutdown: Duration::from_secs(30),
            force_shutdown: Duration::from_secs(5),
            health_check: Duration::from_secs(10),
            approval_ttl: None,
        }
    }
}

/// Everything the agent needs, validated and fixed for its lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    pub target: String,
    /// Declared workstation configuration handed to the engine.
    pub config_path: PathBuf,
    pub schedule: Schedule,
    pub policy: RemediationPolicy,
    pub timeouts: Timeouts,
    /// Run the first cycle immediately instead of waiting one period.
    pub reconcile_on_start: bool,
    /// Plan and report, but pass `dry_run` to every apply.
    pub dry_run: bool,
    /// Engine executable used by the command-backed engine.
    pub engine: String,
}

impl AgentConfig {
    /// Config with default target, engine, and timeouts.
    pub fn new(
        config_path: impl Into<PathBuf>,
        schedule: Schedule,
        policy: RemediationPolicy,
    ) -> Self {
        Self {
            target: DEFAULT_TARGET.to_string(),
            config_path: config_path.into(),
            schedule,
            policy,
            timeouts: Timeouts::default(),
            reconcile_on_start: false,
            dry_run: false,
            engine: DEFAULT_ENGINE.to_string(),
        }
    }

    /// Arguments that re-enter this exact configuration in foreground mode.
    ///
    /// Every setting is spelled out, booleans included, so nothing falls
    /// through to whatever settings file the child reads. Used by
    /// daemonization and by service unit generation.
    pub fn foreground_args(&self) -> Vec<String> {
        let mut args = vec![
            "agent".to_string(),
            "start".to_string(),
            "--foreground".to_string(),
            "--config".to_string(),
            self.config_path.display().to_string(),
            "--target".to_string(),
            self.target.clone(),
            "--interval".to_string(),
            self.schedule.expr().to_string(),
            "--policy".to_string(),
            self.policy.to_string(),
            "--engine".to_string(),
            self.engine.clone(),
            "--shutdown-timeout".to_string(),
            duration_expr(self.timeouts.shutdown),
            "--force-timeout".to_string(),
            duration_expr(self.timeouts.force_shutdown),
            "--health-timeout".to_string(),
            duration_expr(self.timeouts.health_check),
        ];
        if let Some(ttl) = self.timeouts.approval_ttl {
            args.push("--approval-ttl".to_string());
            args.push(duration_expr(ttl));
        }
        args.push(format!("--reconcile-on-start={}", self.reconcile_on_start));
        args.push(format!("--dry-run={}", self.dry_run));
        args
    }
}

// ---------------------------------------------------------------------------
// Settings file
// ---------------------------------------------------------------------------

/// Timeout section of `agent.toml`. Values are duration strings ("30s").
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shutdown: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub force_shutdown: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_check: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_ttl: Option<String>,
}

/// Unvalidated agent settings, as read from `agent.toml` or built from flags.
///
/// ```toml
/// config_path = "~/.config/homestate/workstation.yaml"
/// schedule = "1h"
/// policy = "approved"
///
/// [timeouts]
/// approval_ttl = "1d"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconcile_on_start: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dry_run: Option<bool>,
    pub timeouts: TimeoutSettings,
}

impl AgentSettings {
    /// Load from a TOML file.
    pub fn load(path: &Path) -> ValidationResult<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ValidationError::SettingsRead {
                path: path.display().to_string(),
                source: e,
            })?;
        toml::from_str(&content).map_err(|e| ValidationError::SettingsParse {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// Load from a TOML file, or defaults if the file does not exist.
    pub fn load_or_default(path: &Path) -> ValidationResult<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save to a TOML file.
    pub fn save(&self, path: &Path) -> ValidationResult<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ValidationError::SettingsParse {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ValidationError::SettingsWrite {
                path: parent.display().to_string(),
                source: e,
            })?;
        }
        std::fs::write(path, content).map_err(|e| ValidationError::SettingsWrite {
            path: path.display().to_string(),
            source: e,
        })
    }

    /// Layer `overrides` on top of `self`; any value set in `overrides` wins.
    pub fn merge(self, overrides: AgentSettings) -> AgentSettings {
        AgentSettings {
            config_path: overrides.config_path.or(self.config_path),
            target: overrides.target.or(self.target),
            schedule: overrides.schedule.or(self.schedule),
            policy: overrides.policy.or(self.policy),
            engine: overrides.engine.or(self.engine),
            reconcile_on_start: overrides.reconcile_on_start.or(self.reconcile_on_start),
            dry_run: overrides.dry_run.or(self.dry_run),
            timeouts: TimeoutSettings {
                shutdown: overrides.timeouts.shutdown.or(self.timeouts.shutdown),
                force_shutdown: overrides
                    .timeouts
                    .force_shutdown
                    .or(self.timeouts.force_shutdown),
                health_check: overrides.timeouts.health_check.or(self.timeouts.health_check),
                approval_ttl: overrides.timeouts.approval_ttl.or(self.timeouts.approval_ttl),
            },
        }
    }

    /// Validate every field and produce the immutable config.
    pub fn into_config(self) -> ValidationResult<AgentConfig> {
        let config_path = self.config_path.ok_or_else(|| ValidationError::MissingField {
            field: "config".into(),
        })?;
        let schedule = Schedule::parse(self.schedule.as_deref().unwrap_or(DEFAULT_SCHEDULE))?;
        let policy = match self.policy.as_deref() {
            Some(name) => RemediationPolicy::parse(name)?,
            None => RemediationPolicy::default(),
        };

        let defaults = Timeouts::default();
        let timeouts = Timeouts {
            shutdown: duration_field("timeouts.shutdown", self.timeouts.shutdown)?
                .unwrap_or(defaults.shutdown),
            force_shutdown: duration_field("timeouts.force_shutdown", self.timeouts.force_shutdown)?
                .unwrap_or(defaults.force_shutdown),
            health_check: duration_field("timeouts.health_check", self.timeouts.health_check)?
                .unwrap_or(defaults.health_check),
            approval_ttl: duration_field("timeouts.approval_ttl", self.timeouts.approval_ttl)?,
        };

        Ok(AgentConfig {
            target: self.target.unwrap_or_else(|| DEFAULT_TARGET.to_string()),
            config_path,
            schedule,
            policy,
            timeouts,
            reconcile_on_start: self.reconcile_on_start.unwrap_or(false),
            dry_run: self.dry_run.unwrap_or(false),
            engine: self.engine.unwrap_or_else(|| DEFAULT_ENGINE.to_string()),
        })
    }
}

fn duration_field(field: &str, value: Option<String>) -> ValidationResult<Option<Duration>> {
    value
        .map(|v| {
            parse_duration(&v).map_err(|reason| ValidationError::InvalidDuration {
                field: field.to_string(),
                value: v.clone(),
                reason,
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> AgentSettings {
        AgentSettings {
            config_path: Some(PathBuf::from("/etc/homestate/workstation.yaml")),
            ..Default::default()
        }
    }

    #[test]
    fn defaults_fill_unset_fields() {
        let config = minimal().into_config().unwrap();
        assert_eq!(config.target, "default");
        assert_eq!(config.schedule.expr(), "30m");
        assert_eq!(config.policy, RemediationPolicy::Notify);
        assert_eq!(config.timeouts, Timeouts::default());
        assert!(!config.reconcile_on_start);
        assert!(!config.dry_run);
    }

    #[test]
    fn missing_config_path_is_reported() {
        let err = AgentSettings::default().into_config().unwrap_err();
        assert!(matches!(err, ValidationError::MissingField { ref field } if field == "config"));
    }

    #[test]
    fn invalid_values_fail_before_start() {
        let bad_schedule = AgentSettings {
            schedule: Some("invalid-schedule".into()),
            ..minimal()
        };
        assert!(matches!(
            bad_schedule.into_config(),
            Err(ValidationError::InvalidSchedule { .. })
        ));

        let bad_policy = AgentSettings {
            policy: Some("bad-policy".into()),
            ..minimal()
        };
        assert!(matches!(
            bad_policy.into_config(),
            Err(ValidationError::InvalidPolicy { .. })
        ));

        let mut bad_timeout = minimal();
        bad_timeout.timeouts.shutdown = Some("soon".into());
        let err = bad_timeout.into_config().unwrap_err();
        assert!(err.to_string().contains("timeouts.shutdown"), "{err}");
    }

    #[test]
    fn overrides_win_over_file_values() {
        let file = AgentSettings {
            schedule: Some("1h".into()),
            policy: Some("auto".into()),
            target: Some("laptop".into()),
            ..minimal()
        };
        let flags = AgentSettings {
            policy: Some("safe".into()),
            ..Default::default()
        };
        let config = file.merge(flags).into_config().unwrap();
        assert_eq!(config.policy, RemediationPolicy::Safe);
        assert_eq!(config.schedule.expr(), "1h");
        assert_eq!(config.target, "laptop");
    }

    #[test]
    fn save_then_load_preserves_settings() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("agent.toml");
        let mut settings = minimal();
        settings.policy = Some("approved".into());
        settings.timeouts.approval_ttl = Some("1d".into());
        settings.save(&path).unwrap();

        let loaded = AgentSettings::load(&path).unwrap();
        assert_eq!(loaded, settings);
        let config = loaded.into_config().unwrap();
        assert_eq!(config.timeouts.approval_ttl, Some(Duration::from_secs(86_400)));
    }

    #[test]
    fn missing_file_loads_defaults_and_bad_toml_is_a_parse_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("agent.toml");
        assert_eq!(AgentSettings::load_or_default(&path).unwrap(), AgentSettings::default());

        std::fs::write(&path, "policy = [").unwrap();
        assert!(matches!(
            AgentSettings::load(&path),
            Err(ValidationError::SettingsParse { .. })
        ));
    }

    #[test]
    fn foreground_args_spell_out_every_setting() {
        let mut config = minimal().into_config().unwrap();
        config.timeouts.approval_ttl = Some(Duration::from_secs(3_600));
        config.dry_run = true;
        let args = config.foreground_args();
        assert_eq!(&args[..3], &["agent", "start", "--foreground"]);
        assert!(args.windows(2).any(|w| w == ["--interval", "30m"]));
        assert!(args.windows(2).any(|w| w == ["--approval-ttl", "1h"]));
        assert!(args.contains(&"--dry-run=true".to_string()));
        assert!(args.contains(&"--reconcile-on-start=false".to_string()));
    }
}
