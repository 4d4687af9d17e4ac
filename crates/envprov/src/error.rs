//! Error types for envprov

use thiserror::Error;

/// Errors that can occur while provisioning an environment
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// Installer download failed (unreachable host, non-success status)
    #[error("Network error: {0}")]
    Network(String),

    /// Downloaded installer failed validation
    #[error("Integrity check failed for {artifact}: {reason}")]
    Integrity { artifact: String, reason: String },

    /// Base installer exited non-zero
    #[error("Base installation failed (exit code {exit_code}): {output}")]
    Install { exit_code: i32, output: String },

    /// Package or channel conflict, or a package is unavailable
    #[error("Package resolution failed during {step} (exit code {exit_code}): {output}")]
    Resolution {
        step: String,
        exit_code: i32,
        output: String,
    },

    /// A bootstrap command other than the installer exited non-zero
    #[error("Step '{step}' failed (exit code {exit_code}): {output}")]
    StepFailed {
        step: String,
        exit_code: i32,
        output: String,
    },

    /// Malformed configuration or an invalid provisioning request
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// An external command exceeded its timeout
    #[error("Step '{step}' timed out after {secs} seconds")]
    Timeout { step: String, secs: u64 },

    /// An external command could not be spawned
    #[error("Command not found or not executable: {0}")]
    CommandNotFound(String),

    /// A provisioning step was attempted out of order
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML config parsing error
    #[error("Invalid config file: {0}")]
    Toml(#[from] toml::de::Error),

    /// YAML serialization error (.condarc)
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl From<reqwest::Error> for ProvisionError {
    fn from(err: reqwest::Error) -> Self {
        ProvisionError::Network(err.to_string())
    }
}

impl ProvisionError {
    /// Short class name used in reports and log fields.
    pub fn class(&self) -> &'static str {
        match self {
            ProvisionError::Network(_) => "network",
            ProvisionError::Integrity { .. } => "integrity",
            ProvisionError::Install { .. } => "install",
            ProvisionError::Resolution { .. } => "resolution",
            ProvisionError::StepFailed { .. } => "step_failed",
            ProvisionError::Configuration(_)
            | ProvisionError::Toml(_)
            | ProvisionError::Yaml(_) => "configuration",
            ProvisionError::Timeout { .. } => "timeout",
            ProvisionError::CommandNotFound(_) => "command_not_found",
            ProvisionError::InvalidTransition { .. } => "invalid_transition",
            ProvisionError::Io(_) => "io",
            ProvisionError::Json(_) => "json",
        }
    }
}
