//! Build matrix: one independent provisioning run per interpreter version.

use crate::config::ProvisionConfig;
use crate::error::ProvisionError;
use crate::provisioner::Provisioner;
use crate::report::ProvisionReport;
use crate::runner::CommandRunner;
use crate::spec::InterpreterVersion;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// One named job of the build matrix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixJob {
    pub name: String,
    pub python: InterpreterVersion,
}

impl MatrixJob {
    pub fn new(name: impl Into<String>, python: InterpreterVersion) -> Self {
        Self {
            name: name.into(),
            python,
        }
    }
}

/// Validated set of matrix jobs.
#[derive(Debug, Clone)]
pub struct BuildMatrix {
    jobs: Vec<MatrixJob>,
}

impl BuildMatrix {
    /// Jobs must be non-empty and uniquely named.
    pub fn new(jobs: Vec<MatrixJob>) -> Result<Self> {
        if jobs.is_empty() {
            return Err(ProvisionError::Configuration(
                "build matrix has no jobs".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for job in &jobs {
            if job.name.trim().is_empty() {
                return Err(ProvisionError::Configuration(
                    "matrix job name must not be empty".to_string(),
                ));
            }
            if !seen.insert(job.name.as_str()) {
                return Err(ProvisionError::Configuration(format!(
                    "duplicate matrix job '{}'",
                    job.name
                )));
            }
        }
        Ok(Self { jobs })
    }

    pub fn from_config(config: &ProvisionConfig) -> Result<Self> {
        Self::new(config.matrix.clone())
    }

    pub fn jobs(&self) -> &[MatrixJob] {
        &self.jobs
    }

    /// Restrict to the named jobs, keeping matrix order.
    pub fn select(self, names: &[String]) -> Result<Self> {
        if names.is_empty() {
            return Ok(self);
        }
        if let Some(unknown) = names
            .iter()
            .find(|n| !self.jobs.iter().any(|j| &j.name == *n))
        {
            return Err(ProvisionError::Configuration(format!(
                "unknown matrix job '{}'",
                unknown
            )));
        }
        let jobs = self
            .jobs
            .into_iter()
            .filter(|j| names.contains(&j.name))
            .collect();
        Ok(Self { jobs })
    }

    /// Configuration for one job: its own prefix and download directory under `root`.
    pub fn job_config(base: &ProvisionConfig, job: &MatrixJob, root: &Path) -> ProvisionConfig {
        let job_root = root.join(&job.name);
        let mut config = base.clone().with_prefix(job_root.join("miniconda"));
        config.download_dir = job_root;
        config
    }

    /// Run every job sequentially. Jobs share nothing but the runner.
    pub async fn run(
        &self,
        base: &ProvisionConfig,
        runner: Arc<dyn CommandRunner>,
        root: &Path,
    ) -> Result<MatrixReport> {
        let mut reports = Vec::with_capacity(self.jobs.len());
        for job in &self.jobs {
            let config = Arc::new(Self::job_config(base, job, root));
            let spec = config.environment_spec(job.python)?;
            info!(job = %job.name, python = %job.python, "Running matrix job");

            let report =
                Provisioner::run(config, runner.clone(), &spec, Some(job.name.clone())).await;
            info!(
                job = %job.name,
                exit_code = report.exit_code(),
                final_state = %report.final_state,
                "Matrix job finished"
            );
            reports.push(report);
        }
        Ok(MatrixReport { jobs: reports })
    }
}

/// Reports of every matrix job, in matrix order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatrixReport {
    pub jobs: Vec<ProvisionReport>,
}

impl MatrixReport {
    pub fn success(&self) -> bool {
        self.jobs.iter().all(ProvisionReport::success)
    }

    /// First non-zero job exit code, or 0.
    pub fn exit_code(&self) -> i32 {
        self.jobs
            .iter()
            .map(ProvisionReport::exit_code)
            .find(|code| *code != 0)
            .unwrap_or(0)
    }

    pub fn job(&self, name: &str) -> Option<&ProvisionReport> {
        self.jobs.iter().find(|r| r.job.as_deref() == Some(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jobs() -> Vec<MatrixJob> {
        vec![
            MatrixJob::new("py27", InterpreterVersion::new(2, 7)),
            MatrixJob::new("py36", InterpreterVersion::new(3, 6)),
        ]
    }

    #[test]
    fn test_rejects_duplicate_names() {
        let mut jobs = jobs();
        jobs.push(MatrixJob::new("py27", InterpreterVersion::new(2, 7)));
        let err = BuildMatrix::new(jobs).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_rejects_empty_matrix() {
        assert!(BuildMatrix::new(vec![]).is_err());
    }

    #[test]
    fn test_select() {
        let matrix = BuildMatrix::new(jobs()).unwrap();
        let selected = matrix.clone().select(&["py36".to_string()]).unwrap();
        assert_eq!(selected.jobs().len(), 1);
        assert_eq!(selected.jobs()[0].python, InterpreterVersion::new(3, 6));

        assert!(matrix.select(&["py99".to_string()]).is_err());
    }

    #[test]
    fn test_job_configs_are_isolated() {
        let base = ProvisionConfig::default();
        let root = Path::new("/work");
        let a = BuildMatrix::job_config(&base, &jobs()[0], root);
        let b = BuildMatrix::job_config(&base, &jobs()[1], root);

        assert_eq!(a.prefix, Path::new("/work/py27/miniconda"));
        assert_eq!(b.download_dir, Path::new("/work/py36"));
        assert_ne!(a.prefix, b.prefix);
    }
}
