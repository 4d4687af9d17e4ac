//! Run reports: one record per executed step.

use crate::environment::ProvisionedEnvironment;
use crate::error::ProvisionError;
use crate::installer::InstallerRef;
use crate::runner::CommandOutput;
use crate::spec::InterpreterVersion;
use crate::state::ProvisionState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Outcome of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Passed,
    Failed,
    /// Failed, but the step is non-fatal (cache pruning, rollback).
    Warned,
}

/// Record of one executed step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Step name (`install_base`, `create_environment`, `install_rdkit`, ...).
    pub step: String,

    /// State the step belongs to.
    pub state: ProvisionState,

    pub status: StepStatus,

    /// Rendered command line, if the step ran an external command.
    pub command: Option<String>,

    pub exit_code: Option<i32>,

    pub duration_ms: u64,

    pub stdout: String,
    pub stderr: String,

    /// Error message for failed or warned steps.
    pub error: Option<String>,
}

impl StepRecord {
    pub fn passed(
        step: &str,
        state: ProvisionState,
        command: Option<String>,
        output: Option<&CommandOutput>,
    ) -> Self {
        Self {
            step: step.to_string(),
            state,
            status: StepStatus::Passed,
            command,
            exit_code: output.map(|o| o.exit_code),
            duration_ms: output.map(|o| o.duration_ms).unwrap_or(0),
            stdout: output.map(|o| o.stdout.clone()).unwrap_or_default(),
            stderr: output.map(|o| o.stderr.clone()).unwrap_or_default(),
            error: None,
        }
    }

    pub fn failed(
        step: &str,
        state: ProvisionState,
        command: Option<String>,
        err: &ProvisionError,
    ) -> Self {
        let exit_code = match err {
            ProvisionError::Install { exit_code, .. }
            | ProvisionError::Resolution { exit_code, .. }
            | ProvisionError::StepFailed { exit_code, .. } => Some(*exit_code),
            _ => None,
        };
        Self {
            step: step.to_string(),
            state,
            status: StepStatus::Failed,
            command,
            exit_code,
            duration_ms: 0,
            stdout: String::new(),
            stderr: String::new(),
            error: Some(err.to_string()),
        }
    }

    /// Downgrade a failure to a warning (non-fatal step).
    pub fn warned(mut self) -> Self {
        self.status = StepStatus::Warned;
        self
    }
}

/// Error that aborted a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub step: String,
    pub class: String,
    pub message: String,
}

/// Everything that happened in one provisioning run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionReport {
    pub run_id: String,

    /// Matrix job name, if run as part of a matrix.
    pub job: Option<String>,

    pub interpreter: InterpreterVersion,

    pub installer: Option<InstallerRef>,

    /// Digest of the environment specification.
    pub spec_digest: String,

    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,

    /// Last state reached.
    pub final_state: ProvisionState,

    pub steps: Vec<StepRecord>,

    /// Final environment inventory; `None` if the run aborted.
    pub environment: Option<ProvisionedEnvironment>,

    /// Exit code of the test command, if it was invoked.
    pub test_exit_code: Option<i32>,

    pub error: Option<RunError>,
}

impl ProvisionReport {
    pub fn new(interpreter: InterpreterVersion, spec_digest: String, job: Option<String>) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            job,
            interpreter,
            installer: None,
            spec_digest,
            started_at: Utc::now(),
            finished_at: None,
            final_state: ProvisionState::Start,
            steps: Vec::new(),
            environment: None,
            test_exit_code: None,
            error: None,
        }
    }

    /// Whether provisioning completed and the test command exited zero.
    pub fn success(&self) -> bool {
        self.error.is_none() && self.test_exit_code == Some(0)
    }

    /// Job exit code: the test command's, or 1 if provisioning aborted.
    pub fn exit_code(&self) -> i32 {
        match (&self.error, self.test_exit_code) {
            (None, Some(code)) => code,
            _ => 1,
        }
    }

    pub fn passed_count(&self) -> usize {
        self.count(StepStatus::Passed)
    }

    pub fn failed_count(&self) -> usize {
        self.count(StepStatus::Failed)
    }

    pub fn warned_count(&self) -> usize {
        self.count(StepStatus::Warned)
    }

    fn count(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }

    /// Total wall-clock duration in milliseconds, once finished.
    pub fn duration_ms(&self) -> Option<i64> {
        self.finished_at
            .map(|end| (end - self.started_at).num_milliseconds())
    }

    pub fn step(&self, name: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.step == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(code: i32) -> CommandOutput {
        CommandOutput {
            exit_code: code,
            stdout: "out".to_string(),
            stderr: String::new(),
            duration_ms: 10,
        }
    }

    fn report() -> ProvisionReport {
        ProvisionReport::new(InterpreterVersion::new(3, 6), "abc".to_string(), None)
    }

    #[test]
    fn test_report_counts() {
        let mut r = report();
        r.steps.push(StepRecord::passed(
            "install_base",
            ProvisionState::BaseInstalled,
            Some("bash x.sh -b".to_string()),
            Some(&output(0)),
        ));
        r.steps.push(
            StepRecord::failed(
                "prune_caches",
                ProvisionState::CachesPruned,
                None,
                &ProvisionError::StepFailed {
                    step: "prune_caches".to_string(),
                    exit_code: 1,
                    output: String::new(),
                },
            )
            .warned(),
        );

        assert_eq!(r.passed_count(), 1);
        assert_eq!(r.warned_count(), 1);
        assert_eq!(r.failed_count(), 0);
        assert_eq!(r.step("prune_caches").unwrap().exit_code, Some(1));
    }

    #[test]
    fn test_exit_code_follows_test_command() {
        let mut r = report();
        assert_eq!(r.exit_code(), 1);
        assert!(!r.success());

        r.test_exit_code = Some(0);
        assert_eq!(r.exit_code(), 0);
        assert!(r.success());

        r.test_exit_code = Some(2);
        assert_eq!(r.exit_code(), 2);
        assert!(!r.success());
    }

    #[test]
    fn test_error_forces_failure() {
        let mut r = report();
        r.test_exit_code = Some(0);
        r.error = Some(RunError {
            step: "create_environment".to_string(),
            class: "resolution".to_string(),
            message: "conflict".to_string(),
        });
        assert_eq!(r.exit_code(), 1);
        assert!(!r.success());
    }

    #[test]
    fn test_report_serializes() {
        let r = report();
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["final_state"], "start");
        assert_eq!(json["interpreter"], "3.6");
        assert!(!json["run_id"].as_str().unwrap().is_empty());
    }
}
