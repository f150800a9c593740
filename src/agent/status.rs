//! Agent status snapshot, health, and human-readable rendering.

use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::policy::RemediationPolicy;

// ---------------------------------------------------------------------------
// Lifecycle state
// ---------------------------------------------------------------------------

/// Agent lifecycle. `Stopped` is terminal for an agent instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    #[default]
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl AgentState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

/// Health classification. Unrecognized wire values decode as `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
            Self::Unknown => "unknown",
        }
    }
}

impl From<String> for HealthStatus {
    fn from(value: String) -> Self {
        match value.as_str() {
            "healthy" => Self::Healthy,
            "degraded" => Self::Degraded,
            "unhealthy" => Self::Unhealthy,
            _ => Self::Unknown,
        }
    }
}

impl From<HealthStatus> for String {
    fn from(status: HealthStatus) -> Self {
        status.as_str().to_string()
    }
}

/// Health plus an optional message.
///
/// Degraded and Unhealthy always carry a message, possibly empty; an empty
/// message still renders as `"degraded ()"` so it is distinguishable from
/// no message at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Health {
    pub status: HealthStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Health {
    pub fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            message: None,
        }
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Degraded,
            message: Some(message.into()),
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            message: Some(message.into()),
        }
    }

    pub fn unknown() -> Self {
        Self {
            status: HealthStatus::Unknown,
            message: None,
        }
    }
}

impl Default for Health {
    fn default() -> Self {
        Self::unknown()
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.status, &self.message) {
            (HealthStatus::Unknown, _) => f.write_str("unknown"),
            (status, Some(message)) => write!(f, "{} ({message})", status.as_str()),
            (status, None) => f.write_str(status.as_str()),
        }
    }
}

// ---------------------------------------------------------------------------
// Status snapshot
// ---------------------------------------------------------------------------

/// Point-in-time view of the agent, cloned under the status lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub state: AgentState,
    pub started_at: Option<DateTime<Utc>>,
    /// Completed reconciliation cycles. Never decreases.
    pub reconcile_count: u64,
    pub last_reconcile_at: Option<DateTime<Utc>>,
    pub next_reconcile_at: Option<DateTime<Utc>>,
    pub health: Health,
    /// Drift by severity from the most recent cycle, replaced wholesale.
    pub drift_count: BTreeMap<String, u64>,
    pub pending_approval: Option<String>,
    pub last_remediation_count: u64,
    pub last_duration_ms: Option<u64>,
    pub policy: RemediationPolicy,
    pub schedule: String,
}

impl AgentStatus {
    pub fn new(policy: RemediationPolicy, schedule: impl Into<String>) -> Self {
        Self {
            state: AgentState::Idle,
            started_at: None,
            reconcile_count: 0,
            last_reconcile_at: None,
            next_reconcile_at: None,
            health: Health::unknown(),
            drift_count: BTreeMap::new(),
            pending_approval: None,
            last_remediation_count: 0,
            last_duration_ms: None,
            policy,
            schedule: schedule.into(),
        }
    }

    pub fn running(&self) -> bool {
        self.state == AgentState::Running
    }

    pub fn total_drift(&self) -> u64 {
        self.drift_count.values().sum()
    }

    /// Multi-line human summary for `homestate agent status`.
    pub fn render(&self, now: DateTime<Utc>) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "state:      {}", self.state);
        let _ = writeln!(out, "health:     {}", self.health);
        let _ = writeln!(out, "policy:     {}", self.policy);
        let _ = writeln!(out, "schedule:   {}", self.schedule);
        if let Some(started) = self.started_at {
            let _ = writeln!(out, "uptime:     {}", format_duration(now - started));
        }
        let _ = writeln!(out, "reconciles: {}", self.reconcile_count);
        match self.last_reconcile_at {
            Some(last) => {
                let _ = writeln!(out, "last:       {} ago", format_duration(now - last));
            }
            None => {
                let _ = writeln!(out, "last:       never");
            }
        }
        if let Some(next) = self.next_reconcile_at {
            let _ = writeln!(out, "next:       in {}", format_duration(next - now));
        }
        if self.drift_count.is_empty() {
            let _ = writeln!(out, "drift:      none");
        } else {
            let parts: Vec<String> = self
                .drift_count
                .iter()
                .map(|(severity, count)| format!("{severity}={count}"))
                .collect();
            let _ = writeln!(out, "drift:      {}", parts.join(", "));
        }
        if let Some(id) = &self.pending_approval {
            let _ = writeln!(out, "approval:   {id} (pending)");
        }
        out
    }
}

/// Compact relative duration: `"now"`, `"45s"`, `"12m"`, `"3h 5m"`, `"2d 1h"`.
pub fn format_duration(d: chrono::Duration) -> String {
    let secs = d.num_seconds();
    if secs < 0 {
        return "now".to_string();
    }
    if secs < 60 {
        return format!("{secs}s");
    }
    if secs < 3_600 {
        return format!("{}m", secs / 60);
    }
    if secs < 86_400 {
        return format!("{}h {}m", secs / 3_600, (secs % 3_600) / 60);
    }
    format!("{}d {}h", secs / 86_400, (secs % 86_400) / 3_600)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_rendering() {
        assert_eq!(Health::healthy().to_string(), "healthy");
        assert_eq!(Health::degraded("slow").to_string(), "degraded (slow)");
        assert_eq!(Health::degraded("").to_string(), "degraded ()");
        assert_eq!(Health::unhealthy("boom").to_string(), "unhealthy (boom)");
        assert_eq!(Health::unknown().to_string(), "unknown");
    }

    #[test]
    fn unrecognized_health_decodes_as_unknown() {
        let health: Health = serde_json::from_str(r#"{"status":"on-fire"}"#).unwrap();
        assert_eq!(health.status, HealthStatus::Unknown);
        assert_eq!(health.to_string(), "unknown");
    }

    #[test]
    fn empty_message_survives_the_wire() {
        let json = serde_json::to_string(&Health::degraded("")).unwrap();
        let back: Health = serde_json::from_str(&json).unwrap();
        assert_eq!(back.message.as_deref(), Some(""));
        assert_eq!(back.to_string(), "degraded ()");
    }

    #[test]
    fn duration_formatting() {
        let secs = chrono::Duration::seconds;
        assert_eq!(format_duration(secs(-5)), "now");
        assert_eq!(format_duration(secs(0)), "0s");
        assert_eq!(format_duration(secs(59)), "59s");
        assert_eq!(format_duration(secs(60)), "1m");
        assert_eq!(format_duration(secs(3_600)), "1h 0m");
        assert_eq!(format_duration(secs(3_900)), "1h 5m");
        assert_eq!(format_duration(secs(86_400)), "1d 0h");
        assert_eq!(format_duration(secs(49 * 3_600)), "2d 1h");
    }

    #[test]
    fn fresh_status_is_not_running() {
        let status = AgentStatus::new(RemediationPolicy::Notify, "30m");
        assert!(!status.running());
        assert_eq!(status.state, AgentState::Idle);
        assert_eq!(status.reconcile_count, 0);
        assert_eq!(status.health.to_string(), "unknown");
    }

    #[test]
    fn render_mentions_pending_approval_and_drift() {
        let now = Utc::now();
        let mut status = AgentStatus::new(RemediationPolicy::Approved, "1h");
        status.state = AgentState::Running;
        status.drift_count.insert("high".into(), 1);
        status.drift_count.insert("low".into(), 2);
        status.pending_approval = Some("apr-1".into());
        status.next_reconcile_at = Some(now + chrono::Duration::minutes(5));

        let text = status.render(now);
        assert!(text.contains("state:      running"));
        assert!(text.contains("high=1, low=2"));
        assert!(text.contains("apr-1 (pending)"));
        assert!(text.contains("last:       never"));
        assert_eq!(status.total_drift(), 3);
    }
}
