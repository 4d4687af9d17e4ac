//! Provisioning configuration
//!
//! Loaded in layers: hard-coded defaults, an optional TOML file, then
//! environment variables. The resulting [`ProvisionConfig`] is immutable and
//! passed explicitly to every provisioning step; nothing is read from or
//! written to process-wide state after loading.

use crate::error::ProvisionError;
use crate::matrix::MatrixJob;
use crate::spec::{AdditionalInstall, EnvironmentSpec, InterpreterVersion, PackageDirective};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default config file name looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "envprov.toml";

const MINICONDA_BASE_URL: &str = "https://repo.continuum.io/miniconda";

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionConfig {
    /// Base installation directory.
    pub prefix: PathBuf,

    /// Directory the installer is downloaded into.
    pub download_dir: PathBuf,

    /// Commands run before installer selection (e.g. a system package refresh).
    pub pre_commands: Vec<Vec<String>>,

    /// Opaque test command handed control at the end of the run.
    pub test_command: Vec<String>,

    pub installer: InstallerConfig,
    pub manager: ManagerOptions,
    pub environment: EnvironmentConfig,
    pub timeouts: TimeoutConfig,

    /// Named build jobs, each binding one interpreter version.
    pub matrix: Vec<MatrixJob>,
}

/// Bootstrap installer locations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallerConfig {
    /// Installer used for the legacy 2.x interpreter family.
    pub legacy_url: String,

    /// Installer used for every other interpreter version.
    pub current_url: String,

    /// Expected SHA-256 of the legacy installer, if known.
    pub legacy_sha256: Option<String>,

    /// Expected SHA-256 of the current installer, if known.
    pub current_sha256: Option<String>,
}

/// Non-interactive package-manager settings written to `<prefix>/.condarc`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ManagerOptions {
    /// Answer yes to every prompt. Must be true; a prompt would hang the run.
    pub always_yes: bool,

    /// Whether activation rewrites the shell prompt.
    pub changeps1: bool,

    /// Extra default channels, highest priority first.
    pub channels: Vec<String>,

    /// Quiet output for create/install commands.
    pub quiet: bool,
}

/// Environment contents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    pub name: String,
    pub base_packages: Vec<PackageDirective>,
    pub additional: Vec<AdditionalInstall>,
}

/// Per-step timeouts in seconds (0 = no timeout)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub download_secs: u64,
    pub install_secs: u64,
    pub resolve_secs: u64,
    pub test_secs: u64,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        let home = PathBuf::from(home);
        ProvisionConfig {
            prefix: home.join("miniconda"),
            download_dir: home,
            pre_commands: Vec::new(),
            test_command: vec!["make".to_string(), "test".to_string()],
            installer: InstallerConfig::default(),
            manager: ManagerOptions::default(),
            environment: EnvironmentConfig::default(),
            timeouts: TimeoutConfig::default(),
            matrix: vec![
                MatrixJob::new("py27", InterpreterVersion::new(2, 7)),
                MatrixJob::new("py36", InterpreterVersion::new(3, 6)),
            ],
        }
    }
}

impl Default for InstallerConfig {
    fn default() -> Self {
        InstallerConfig {
            legacy_url: format!("{}/Miniconda2-latest-Linux-x86_64.sh", MINICONDA_BASE_URL),
            current_url: format!("{}/Miniconda3-latest-Linux-x86_64.sh", MINICONDA_BASE_URL),
            legacy_sha256: None,
            current_sha256: None,
        }
    }
}

impl Default for ManagerOptions {
    fn default() -> Self {
        ManagerOptions {
            always_yes: true,
            changeps1: false,
            channels: Vec::new(),
            quiet: true,
        }
    }
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        EnvironmentConfig {
            name: "test-environment".to_string(),
            base_packages: vec![
                PackageDirective::new("numpy"),
                PackageDirective::new("tqdm"),
                PackageDirective::new("pytest"),
            ],
            additional: vec![
                AdditionalInstall::new(PackageDirective::from_channel("openbabel", "openbabel")),
                AdditionalInstall::new(PackageDirective::from_channel("rdkit", "rdkit")),
            ],
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        TimeoutConfig {
            download_secs: 300,
            install_secs: 600,
            resolve_secs: 1800,
            test_secs: 0,
        }
    }
}

impl ManagerOptions {
    /// Reject settings that would make the run interactive or malformed.
    pub fn validate(&self) -> Result<()> {
        if !self.always_yes {
            return Err(ProvisionError::Configuration(
                "always_yes must be enabled for unattended provisioning".to_string(),
            ));
        }
        if let Some(bad) = self.channels.iter().find(|c| c.trim().is_empty()) {
            return Err(ProvisionError::Configuration(format!(
                "invalid channel name '{}'",
                bad
            )));
        }
        Ok(())
    }
}

impl ProvisionConfig {
    /// Load configuration: defaults, then `path` (if given), then environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        Ok(config.with_env_overrides())
    }

    /// Parse a TOML config file; missing keys fall back to defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        debug!("Loading config from {:?}", path);
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: ProvisionConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply `ENVPROV_*` environment variable overrides.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(prefix) = std::env::var("ENVPROV_PREFIX") {
            self.prefix = PathBuf::from(prefix);
        }
        if let Ok(dir) = std::env::var("ENVPROV_DOWNLOAD_DIR") {
            self.download_dir = PathBuf::from(dir);
        }
        if let Ok(sha) = std::env::var("ENVPROV_INSTALLER_SHA256") {
            self.installer.legacy_sha256 = Some(sha.clone());
            self.installer.current_sha256 = Some(sha);
        }
        self
    }

    /// Return a copy rooted at a different base prefix (one per matrix job).
    pub fn with_prefix(mut self, prefix: PathBuf) -> Self {
        self.prefix = prefix;
        self
    }

    /// Build the immutable environment specification for one interpreter version.
    pub fn environment_spec(&self, interpreter: InterpreterVersion) -> Result<EnvironmentSpec> {
        EnvironmentSpec::new(
            self.environment.name.clone(),
            interpreter,
            self.environment.base_packages.clone(),
            self.environment.additional.clone(),
        )
    }

    /// Validate the whole configuration without touching the filesystem.
    pub fn validate(&self) -> Result<()> {
        self.manager.validate()?;
        if self.test_command.is_empty() {
            return Err(ProvisionError::Configuration(
                "test_command must not be empty".to_string(),
            ));
        }
        if let Some(idx) = self.pre_commands.iter().position(|c| c.is_empty()) {
            return Err(ProvisionError::Configuration(format!(
                "pre_commands[{}] is empty",
                idx
            )));
        }
        Ok(())
    }
}
