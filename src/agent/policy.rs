//! Remediation policy: what the agent does with detected drift.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ValidationError, ValidationResult};

/// How detected drift is handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemediationPolicy {
    /// Detect and report drift, never apply changes.
    #[default]
    Notify,
    /// Apply every corrective change.
    Auto,
    /// Hold changes behind an approval request.
    Approved,
    /// Apply only the changes the engine classifies as low-risk.
    Safe,
}

/// What the reconcile handler is allowed to apply this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remediation {
    ReportOnly,
    ApplyAll,
    ApplySafe,
}

impl RemediationPolicy {
    pub const ALL: [RemediationPolicy; 4] = [
        RemediationPolicy::Notify,
        RemediationPolicy::Auto,
        RemediationPolicy::Approved,
        RemediationPolicy::Safe,
    ];

    /// Parse a canonical policy name. Matching is exact: `"Auto"` is rejected.
    pub fn parse(name: &str) -> ValidationResult<Self> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == name)
            .ok_or_else(|| ValidationError::InvalidPolicy {
                name: name.to_string(),
            })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Notify => "notify",
            Self::Auto => "auto",
            Self::Approved => "approved",
            Self::Safe => "safe",
        }
    }

    /// Directive for one cycle. `approved` is true when an operator has
    /// granted the outstanding request under the Approved policy.
    pub fn remediation(self, approved: bool) -> Remediation {
        match self {
            Self::Notify => Remediation::ReportOnly,
            Self::Auto => Remediation::ApplyAll,
            Self::Safe => Remediation::ApplySafe,
            Self::Approved if approved => Remediation::ApplyAll,
            Self::Approved => Remediation::ReportOnly,
        }
    }

    /// Whether detected drift needs an approval request before anything is applied.
    pub fn requires_approval(self) -> bool {
        self == Self::Approved
    }
}

impl fmt::Display for RemediationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RemediationPolicy {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
