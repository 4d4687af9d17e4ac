//! envprov: reproducible conda environment provisioning for CI jobs
//!
//! Bootstraps a conda base installation, creates a named environment for a
//! requested interpreter version, installs its packages, and hands control to
//! a test command. Every step is explicit:
//!
//! - **Installer selection**: legacy 2.x interpreters bootstrap with Miniconda2,
//!   everything else with Miniconda3
//! - **Activation as a value**: no step mutates process-wide `PATH` or config;
//!   the active environment's variables are passed to each command
//! - **Fail fast**: the first failing step aborts the run before the test
//!   command; only cache pruning is allowed to fail
//!
//! All external tools are reached through [`CommandRunner`], so runs can be
//! exercised against the in-memory [`fakes::FakeConda`].

pub mod config;
pub mod environment;
pub mod error;
pub mod fakes;
pub mod installer;
pub mod manager;
pub mod matrix;
pub mod provisioner;
pub mod report;
pub mod runner;
pub mod spec;
pub mod state;
pub mod telemetry;

pub use config::{
    EnvironmentConfig, InstallerConfig, ManagerOptions, ProvisionConfig, TimeoutConfig,
    DEFAULT_CONFIG_FILE,
};
pub use environment::{ActiveEnvironment, EnvironmentHandle, ProvisionedEnvironment, SearchPath};
pub use error::ProvisionError;
pub use installer::{
    select_bootstrap_installer, verify_artifact, InstallerFetcher, InstallerKind, InstallerRef,
    LocalArtifact,
};
pub use manager::{InstalledPackage, PackageManager};
pub use matrix::{BuildMatrix, MatrixJob, MatrixReport};
pub use provisioner::{PlannedStep, Provisioner};
pub use report::{ProvisionReport, RunError, StepRecord, StepStatus};
pub use runner::{CommandOutput, CommandRunner, Invocation, SystemRunner};
pub use spec::{AdditionalInstall, EnvironmentSpec, InterpreterVersion, PackageDirective};
pub use state::ProvisionState;
pub use telemetry::init_tracing;

/// Result type for provisioning operations
pub type Result<T> = std::result::Result<T, ProvisionError>;
