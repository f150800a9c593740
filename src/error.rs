//! Rich diagnostic error types for homestate.
//!
//! Each subsystem defines its own error type with miette `#[diagnostic]` derives,
//! providing error codes, help text, and source chains so users know exactly what
//! went wrong and how to fix it. `HomestateError` wraps them all for the binary.

use miette::Diagnostic;
use thiserror::Error;

/// Top-level error type.
///
/// Each variant wraps a subsystem-specific error, preserving the full diagnostic
/// chain (error codes, help text, sources) through to the user.
#[derive(Debug, Error, Diagnostic)]
pub enum HomestateError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Agent(#[from] crate::agent::AgentError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Client(#[from] crate::control::ClientError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Server(#[from] crate::control::ServerError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Lifecycle(#[from] crate::lifecycle::LifecycleError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Service(#[from] crate::lifecycle::ServiceError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Paths(#[from] crate::paths::PathError),
}

pub type HomestateResult<T> = std::result::Result<T, HomestateError>;

// ---------------------------------------------------------------------------
// Validation errors
// ---------------------------------------------------------------------------

/// Bad input caught before the agent starts. Never raised at tick time.
#[derive(Debug, Error, Diagnostic)]
pub enum ValidationError {
    #[error("invalid schedule \"{expr}\": {reason}")]
    #[diagnostic(
        code(homestate::validation::schedule),
        help(
            "Use a duration such as \"30m\", \"1h\" or \"1h30m\", \
             or a 5-field cron expression such as \"*/15 * * * *\" or \"@daily\"."
        )
    )]
    InvalidSchedule { expr: String, reason: String },

    #[error("invalid remediation policy \"{name}\"")]
    #[diagnostic(
        code(homestate::validation::policy),
        help("Valid policies are: notify, auto, approved, safe.")
    )]
    InvalidPolicy { name: String },

    #[error("invalid duration for {field}: \"{value}\" ({reason})")]
    #[diagnostic(
        code(homestate::validation::duration),
        help("Durations are written as an integer and a unit, e.g. \"30s\", \"5m\", \"1h\".")
    )]
    InvalidDuration {
        field: String,
        value: String,
        reason: String,
    },

    #[error("missing required setting: {field}")]
    #[diagnostic(
        code(homestate::validation::missing),
        help("Pass it on the command line (--{field}) or set it in the agent settings file.")
    )]
    MissingField { field: String },

    #[error("failed to read agent settings: {path}")]
    #[diagnostic(
        code(homestate::validation::settings_read),
        help("Ensure the settings file exists and is readable.")
    )]
    SettingsRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse agent settings: {path}: {message}")]
    #[diagnostic(
        code(homestate::validation::settings_parse),
        help("Check the TOML syntax in the agent settings file.")
    )]
    SettingsParse { path: String, message: String },

    #[error("failed to write agent settings: {path}")]
    #[diagnostic(
        code(homestate::validation::settings_write),
        help("Ensure you have write permissions to the config directory.")
    )]
    SettingsWrite {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type ValidationResult<T> = std::result::Result<T, ValidationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_error_names_expression() {
        let err = ValidationError::InvalidSchedule {
            expr: "-5m".into(),
            reason: "duration must be positive".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("\"-5m\""));
        assert!(msg.contains("positive"));
    }

    #[test]
    fn validation_wraps_transparently() {
        let err: HomestateError = ValidationError::InvalidPolicy {
            name: "bad-policy".into(),
        }
        .into();
        assert_eq!(
            err.to_string(),
            "invalid remediation policy \"bad-policy\""
        );
        assert_eq!(
            err.code().map(|c| c.to_string()).as_deref(),
            Some("homestate::validation::policy")
        );
    }
}
