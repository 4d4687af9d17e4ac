//! Conda package-manager driver
//!
//! Builds the command line for each provisioning step and maps tool failures
//! onto the error taxonomy. All commands go through a [`CommandRunner`].

use crate::config::{ManagerOptions, ProvisionConfig, TimeoutConfig};
use crate::environment::{ActiveEnvironment, EnvironmentHandle, SearchPath};
use crate::error::ProvisionError;
use crate::runner::{CommandOutput, CommandRunner, Invocation};
use crate::spec::{AdditionalInstall, EnvironmentSpec};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Package as reported by `conda list --json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledPackage {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub channel: Option<String>,
}

/// Contents of `<prefix>/.condarc`.
#[derive(Debug, Serialize)]
struct CondaRc {
    always_yes: bool,
    changeps1: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    channels: Vec<String>,
}

/// Drives the `conda` executable of one base installation.
pub struct PackageManager {
    runner: Arc<dyn CommandRunner>,
    base_prefix: PathBuf,
    options: ManagerOptions,
    timeouts: TimeoutConfig,
}

impl PackageManager {
    pub fn new(runner: Arc<dyn CommandRunner>, config: &ProvisionConfig) -> Self {
        Self {
            runner,
            base_prefix: config.prefix.clone(),
            options: config.manager.clone(),
            timeouts: config.timeouts,
        }
    }

    pub fn base_prefix(&self) -> &Path {
        &self.base_prefix
    }

    pub fn conda(&self) -> String {
        self.base_prefix
            .join("bin")
            .join("conda")
            .to_string_lossy()
            .into_owned()
    }

    pub fn condarc_path(&self) -> PathBuf {
        self.base_prefix.join(".condarc")
    }

    /// Search path with the base installation's `bin` in front.
    pub fn base_search_path(&self, inherited: &SearchPath) -> SearchPath {
        inherited.prepend(self.base_prefix.join("bin"))
    }

    /// Variables every base-level conda command runs with.
    pub fn base_env(&self, search_path: &SearchPath) -> Result<BTreeMap<String, String>> {
        let mut env = BTreeMap::new();
        env.insert("PATH".to_string(), search_path.to_env_value()?);
        env.insert(
            "CONDARC".to_string(),
            self.condarc_path().to_string_lossy().into_owned(),
        );
        Ok(env)
    }

    // ---------------------------------------------------------------------
    // Invocation builders
    // ---------------------------------------------------------------------

    pub fn install_base_invocation(&self, installer: &Path) -> Invocation {
        let mut inv = Invocation::new("install_base", "bash")
            .arg(installer.to_string_lossy())
            .arg("-b");
        // -u lets the installer update an existing prefix instead of refusing
        if self.base_prefix.exists() {
            inv = inv.arg("-u");
        }
        inv.arg("-p")
            .arg(self.base_prefix.to_string_lossy())
            .timeout(self.timeouts.install_secs)
    }

    pub fn info_invocation(&self, env: &BTreeMap<String, String>) -> Invocation {
        Invocation::new("diagnostics", self.conda())
            .args(["info", "-a"])
            .envs(env)
            .timeout(self.timeouts.resolve_secs)
    }

    pub fn create_invocation(&self, spec: &EnvironmentSpec, env: &BTreeMap<String, String>) -> Invocation {
        let mut inv = Invocation::new("create_environment", self.conda()).arg("create");
        if self.options.quiet {
            inv = inv.arg("-q");
        }
        inv = inv.args(["-n", spec.name.as_str()]);

        let mut channels: Vec<&str> = Vec::new();
        for ch in spec.base_packages.iter().filter_map(|p| p.channel.as_deref()) {
            if !channels.contains(&ch) {
                channels.push(ch);
            }
        }
        for ch in channels {
            inv = inv.args(["-c", ch]);
        }

        inv.arg(spec.interpreter.match_spec())
            .args(spec.base_packages.iter().map(|p| p.match_spec()))
            .envs(env)
            .timeout(self.timeouts.resolve_secs)
    }

    pub fn install_invocation(&self, active: &ActiveEnvironment, install: &AdditionalInstall) -> Invocation {
        let step = format!("install_{}", install.package.name);
        let mut inv = Invocation::new(step, self.conda()).arg("install");
        if self.options.quiet {
            inv = inv.arg("-q");
        }
        inv = inv.args(["-n", active.handle.name.as_str()]);
        if let Some(channel) = &install.package.channel {
            inv = inv.args(["-c", channel.as_str()]);
        }
        inv = inv.arg(install.package.match_spec());
        if let Some(v) = install.interpreter_override {
            inv = inv.arg(v.match_spec());
        }
        inv.envs(&active.env_vars())
            .with_env("CONDARC", self.condarc_path().to_string_lossy())
            .timeout(self.timeouts.resolve_secs)
    }

    pub fn clean_invocation(&self, env: &BTreeMap<String, String>) -> Invocation {
        Invocation::new("prune_caches", self.conda())
            .args(["clean", "--all", "--yes"])
            .envs(env)
            .timeout(self.timeouts.resolve_secs)
    }

    pub fn list_invocation(&self, active: &ActiveEnvironment) -> Invocation {
        Invocation::new("inventory", self.conda())
            .args(["list", "--json", "-n", active.handle.name.as_str()])
            .envs(&active.env_vars())
            .with_env("CONDARC", self.condarc_path().to_string_lossy())
            .timeout(self.timeouts.resolve_secs)
    }

    pub fn remove_invocation(&self, handle: &EnvironmentHandle, env: &BTreeMap<String, String>) -> Invocation {
        Invocation::new("remove_environment", self.conda())
            .args(["env", "remove", "-y", "-n", handle.name.as_str()])
            .envs(env)
            .timeout(self.timeouts.resolve_secs)
    }

    // ---------------------------------------------------------------------
    // Operations
    // ---------------------------------------------------------------------

    /// Silent, non-interactive install of the base distribution.
    pub async fn install_base(&self, installer: &Path) -> Result<CommandOutput> {
        info!(prefix = ?self.base_prefix, "Installing base distribution");
        self.checked_install(&self.install_base_invocation(installer)).await
    }

    /// Write non-interactive defaults to `<prefix>/.condarc`.
    pub async fn configure(&self) -> Result<PathBuf> {
        self.options.validate()?;

        let rc = CondaRc {
            always_yes: self.options.always_yes,
            changeps1: self.options.changeps1,
            channels: self.options.channels.clone(),
        };
        let yaml = serde_yaml::to_string(&rc)?;

        let path = self.condarc_path();
        tokio::fs::create_dir_all(&self.base_prefix).await?;
        tokio::fs::write(&path, yaml).await?;
        debug!(path = ?path, "Wrote package manager config");
        Ok(path)
    }

    /// Dump package-manager diagnostics. A failure here is an install problem.
    pub async fn diagnostics(&self, env: &BTreeMap<String, String>) -> Result<CommandOutput> {
        self.checked_install(&self.info_invocation(env)).await
    }

    /// Create the named environment with its interpreter and base packages.
    pub async fn create_environment(
        &self,
        spec: &EnvironmentSpec,
        env: &BTreeMap<String, String>,
    ) -> Result<(EnvironmentHandle, CommandOutput)> {
        info!(env = %spec.name, python = %spec.interpreter, "Creating environment");
        let inv = self.create_invocation(spec, env);
        let out = self.checked_resolution(&inv).await?;
        Ok((
            EnvironmentHandle::new(&self.base_prefix, &spec.name, spec.interpreter),
            out,
        ))
    }

    /// Install one further package into the active environment.
    pub async fn install_additional(
        &self,
        active: &ActiveEnvironment,
        install: &AdditionalInstall,
    ) -> Result<CommandOutput> {
        info!(
            env = %active.handle.name,
            package = %install.package.name,
            channel = install.package.channel.as_deref().unwrap_or("defaults"),
            "Installing additional package"
        );
        self.checked_resolution(&self.install_invocation(active, install))
            .await
    }

    /// Remove cached archives and index metadata. Callers decide whether failure matters.
    pub async fn prune_caches(&self, env: &BTreeMap<String, String>) -> Result<CommandOutput> {
        self.runner.run(&self.clean_invocation(env)).await
    }

    /// Installed packages as the package manager reports them.
    pub async fn list_inventory(
        &self,
        active: &ActiveEnvironment,
    ) -> Result<(Vec<InstalledPackage>, CommandOutput)> {
        let out = self.checked_resolution(&self.list_invocation(active)).await?;
        let packages: Vec<InstalledPackage> = serde_json::from_str(&out.stdout)?;
        Ok((packages, out))
    }

    pub async fn remove_environment(
        &self,
        handle: &EnvironmentHandle,
        env: &BTreeMap<String, String>,
    ) -> Result<CommandOutput> {
        self.checked_resolution(&self.remove_invocation(handle, env))
            .await
    }

    /// Run a base-installation command; any failure to run or non-zero exit is `Install`.
    async fn checked_install(&self, inv: &Invocation) -> Result<CommandOutput> {
        let out = self.runner.run(inv).await.map_err(|e| match e {
            ProvisionError::Timeout { .. } | ProvisionError::CommandNotFound(_) => {
                ProvisionError::Install {
                    exit_code: -1,
                    output: e.to_string(),
                }
            }
            other => other,
        })?;
        if !out.success() {
            return Err(ProvisionError::Install {
                exit_code: out.exit_code,
                output: out.combined(),
            });
        }
        Ok(out)
    }

    /// Run a package-resolution command; any failure to run or non-zero exit is `Resolution`.
    async fn checked_resolution(&self, inv: &Invocation) -> Result<CommandOutput> {
        let out = self.runner.run(inv).await.map_err(|e| match e {
            ProvisionError::Timeout { .. } | ProvisionError::CommandNotFound(_) => {
                ProvisionError::Resolution {
                    step: inv.step.clone(),
                    exit_code: -1,
                    output: e.to_string(),
                }
            }
            other => other,
        })?;
        if !out.success() {
            return Err(ProvisionError::Resolution {
                step: inv.step.clone(),
                exit_code: out.exit_code,
                output: out.combined(),
            });
        }
        Ok(out)
    }
}
