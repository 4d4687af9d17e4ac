//! Provisioning orchestration.
//!
//! A [`Provisioner`] walks one run through the state machine, one operation
//! per method, recording every step in a [`ProvisionReport`]. Any failure
//! aborts the remaining sequence; only cache pruning is allowed to fail.

use crate::config::ProvisionConfig;
use crate::environment::{
    ActiveEnvironment, EnvironmentHandle, ProvisionedEnvironment, SearchPath,
};
use crate::error::ProvisionError;
use crate::installer::{select_bootstrap_installer, InstallerFetcher, InstallerRef, LocalArtifact};
use crate::manager::PackageManager;
use crate::report::{ProvisionReport, RunError, StepRecord};
use crate::runner::{CommandRunner, Invocation};
use crate::spec::{AdditionalInstall, EnvironmentSpec, InterpreterVersion};
use crate::state::ProvisionState;
use crate::telemetry::run_span;
use crate::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, warn, Instrument};

/// One step of a rendered plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedStep {
    pub state: ProvisionState,
    pub step: String,
    pub action: String,
}

/// Drives one provisioning run for one interpreter version.
pub struct Provisioner {
    config: Arc<ProvisionConfig>,
    runner: Arc<dyn CommandRunner>,
    manager: PackageManager,
    inherited_path: SearchPath,

    state: ProvisionState,
    base_path: Option<SearchPath>,
    active: Option<ActiveEnvironment>,
    environment: Option<ProvisionedEnvironment>,
    /// Set once `conda create` has been issued; cleared when it succeeds.
    partial: Option<EnvironmentHandle>,
    report: ProvisionReport,
}

impl Provisioner {
    pub fn new(
        config: Arc<ProvisionConfig>,
        runner: Arc<dyn CommandRunner>,
        spec: &EnvironmentSpec,
        job: Option<String>,
    ) -> Self {
        let manager = PackageManager::new(runner.clone(), &config);
        Self {
            manager,
            runner,
            config,
            inherited_path: SearchPath::inherited(),
            state: ProvisionState::Start,
            base_path: None,
            active: None,
            environment: None,
            partial: None,
            report: ProvisionReport::new(spec.interpreter, spec.digest(), job),
        }
    }

    /// Use `path` instead of this process's `PATH` as the starting search path.
    pub fn with_inherited_path(mut self, path: SearchPath) -> Self {
        self.inherited_path = path;
        self
    }

    pub fn state(&self) -> ProvisionState {
        self.state
    }

    pub fn active(&self) -> Option<&ActiveEnvironment> {
        self.active.as_ref()
    }

    pub fn environment(&self) -> Option<&ProvisionedEnvironment> {
        self.environment.as_ref()
    }

    pub fn report(&self) -> &ProvisionReport {
        &self.report
    }

    /// Run the whole sequence for `spec` and hand off to the test command.
    ///
    /// Never returns an error: failures are captured in the report, whose
    /// `exit_code()` is the job's exit code.
    pub async fn run(
        config: Arc<ProvisionConfig>,
        runner: Arc<dyn CommandRunner>,
        spec: &EnvironmentSpec,
        job: Option<String>,
    ) -> ProvisionReport {
        let mut provisioner = Provisioner::new(config, runner, spec, job);
        provisioner.execute(spec).await;
        provisioner.finish()
    }

    /// Run every step on an already-constructed provisioner.
    pub async fn execute(&mut self, spec: &EnvironmentSpec) {
        let span = run_span(
            &self.report.run_id,
            self.report.job.as_deref(),
            spec.interpreter,
        );
        self.execute_steps(spec).instrument(span).await
    }

    async fn execute_steps(&mut self, spec: &EnvironmentSpec) {
        info!(
            run_id = %self.report.run_id,
            env = %spec.name,
            python = %spec.interpreter,
            "Starting provisioning run"
        );

        if let Err(e) = self.provision(spec).await {
            self.abort(e).await;
            return;
        }

        match self.invoke_test_command().await {
            Ok(code) => info!(exit_code = code, "Test command finished"),
            Err(e) => {
                error!(error = %e, "Test command could not be run");
                self.set_error("test", &e);
            }
        }
    }

    /// Every bootstrap step up to (not including) the test hand-off.
    pub async fn provision(&mut self, spec: &EnvironmentSpec) -> Result<()> {
        self.run_pre_commands().await?;
        let installer = self.select_installer(spec.interpreter)?;
        let artifact = self.fetch(&installer).await?;
        self.install_base(&artifact).await?;
        self.configure_path()?;
        self.configure_manager().await?;
        let handle = self.create_environment(spec).await?;
        self.activate(handle)?;
        for install in &spec.additional {
            self.install_additional(install).await?;
        }
        self.prune_caches().await?;
        self.verify_inventory().await?;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Operations
    // ---------------------------------------------------------------------

    /// Configured pre-steps (e.g. a system package refresh), before anything else.
    pub async fn run_pre_commands(&mut self) -> Result<()> {
        self.ensure_state(&[ProvisionState::Start])?;
        let config = self.config.clone();
        for (idx, argv) in config.pre_commands.iter().enumerate() {
            let step = format!("pre_command_{}", idx);
            let Some(inv) = Invocation::from_argv(step.as_str(), argv) else {
                return Err(ProvisionError::Configuration(format!("{} is empty", step)));
            };
            let inv = inv.timeout(self.config.timeouts.install_secs);
            let command = Some(inv.to_string());

            let result = match self.runner.run(&inv).await {
                Ok(out) if out.success() => Ok(out),
                Ok(out) => Err(ProvisionError::StepFailed {
                    step: step.clone(),
                    exit_code: out.exit_code,
                    output: out.combined(),
                }),
                Err(e @ (ProvisionError::Timeout { .. } | ProvisionError::CommandNotFound(_))) => {
                    Err(ProvisionError::StepFailed {
                        step: step.clone(),
                        exit_code: -1,
                        output: e.to_string(),
                    })
                }
                Err(e) => Err(e),
            };
            match result {
                Ok(out) => self.record(StepRecord::passed(&step, self.state, command, Some(&out))),
                Err(e) => return Err(self.fail(&step, self.state, command, e)),
            }
        }
        Ok(())
    }

    /// Map the interpreter version to its bootstrap installer.
    pub fn select_installer(&mut self, version: InterpreterVersion) -> Result<InstallerRef> {
        self.ensure_next(ProvisionState::InstallerSelected)?;
        let installer = select_bootstrap_installer(version, &self.config.installer);
        info!(installer = installer.kind.name(), url = %installer.url, "Installer selected");

        self.report.installer = Some(installer.clone());
        self.record(StepRecord::passed(
            "select_installer",
            ProvisionState::InstallerSelected,
            None,
            None,
        ));
        self.advance(ProvisionState::InstallerSelected)?;
        Ok(installer)
    }

    /// Download the selected installer into the configured download directory.
    pub async fn fetch(&mut self, installer: &InstallerRef) -> Result<LocalArtifact> {
        self.ensure_state(&[ProvisionState::InstallerSelected])?;
        let command = Some(format!("fetch {}", installer.url));

        let result = match InstallerFetcher::new(self.config.timeouts.download_secs) {
            Ok(fetcher) => fetcher.fetch(installer, &self.config.download_dir).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(artifact) => {
                let mut record =
                    StepRecord::passed("fetch_installer", self.state, command, None);
                record.stdout = format!("{} sha256={}", artifact.path.display(), artifact.sha256);
                self.record(record);
                Ok(artifact)
            }
            Err(e) => Err(self.fail("fetch_installer", self.state, command, e)),
        }
    }

    /// Silent install of the base distribution into the configured prefix.
    pub async fn install_base(&mut self, artifact: &LocalArtifact) -> Result<()> {
        self.ensure_next(ProvisionState::BaseInstalled)?;
        let command = Some(self.manager.install_base_invocation(&artifact.path).to_string());

        match self.manager.install_base(&artifact.path).await {
            Ok(out) => {
                self.record(StepRecord::passed(
                    "install_base",
                    ProvisionState::BaseInstalled,
                    command,
                    Some(&out),
                ));
                self.advance(ProvisionState::BaseInstalled)
            }
            Err(e) => Err(self.fail("install_base", ProvisionState::BaseInstalled, command, e)),
        }
    }

    /// Put the base installation's `bin` in front of the search path.
    pub fn configure_path(&mut self) -> Result<()> {
        self.ensure_next(ProvisionState::PathConfigured)?;
        let state = ProvisionState::PathConfigured;
        let path = self.manager.base_search_path(&self.inherited_path);
        let value = match path.to_env_value() {
            Ok(v) => v,
            Err(e) => return Err(self.fail("configure_path", state, None, e)),
        };
        let mut record = StepRecord::passed("configure_path", state, None, None);
        record.stdout = format!("PATH={}", value);
        self.record(record);

        self.base_path = Some(path);
        self.advance(ProvisionState::PathConfigured)
    }

    /// Write non-interactive settings and dump diagnostics.
    pub async fn configure_manager(&mut self) -> Result<()> {
        self.ensure_next(ProvisionState::ManagerConfigured)?;
        let state = ProvisionState::ManagerConfigured;

        match self.manager.configure().await {
            Ok(path) => {
                let mut record = StepRecord::passed("configure_manager", state, None, None);
                record.stdout = path.display().to_string();
                self.record(record);
            }
            Err(e) => return Err(self.fail("configure_manager", state, None, e)),
        }

        let env = self.base_env()?;
        let command = Some(self.manager.info_invocation(&env).to_string());
        match self.manager.diagnostics(&env).await {
            Ok(out) => {
                self.record(StepRecord::passed("diagnostics", state, command, Some(&out)));
                self.advance(state)
            }
            Err(e) => Err(self.fail("diagnostics", state, command, e)),
        }
    }

    /// Create the named environment with the interpreter and base packages.
    pub async fn create_environment(&mut self, spec: &EnvironmentSpec) -> Result<EnvironmentHandle> {
        self.ensure_next(ProvisionState::EnvironmentCreated)?;
        let state = ProvisionState::EnvironmentCreated;
        let env = self.base_env()?;
        let command = Some(self.manager.create_invocation(spec, &env).to_string());

        self.partial = Some(EnvironmentHandle::new(
            self.manager.base_prefix(),
            &spec.name,
            spec.interpreter,
        ));
        match self.manager.create_environment(spec, &env).await {
            Ok((handle, out)) => {
                self.partial = None;
                self.record(StepRecord::passed("create_environment", state, command, Some(&out)));
                self.environment = Some(ProvisionedEnvironment::new(
                    handle.clone(),
                    &spec.base_packages,
                ));
                self.advance(state)?;
                Ok(handle)
            }
            Err(e) => Err(self.fail("create_environment", state, command, e)),
        }
    }

    /// Make `handle` the target of every subsequent command.
    pub fn activate(&mut self, handle: EnvironmentHandle) -> Result<()> {
        if let Some(active) = &self.active {
            return Err(ProvisionError::Configuration(format!(
                "environment '{}' is already active",
                active.handle.name
            )));
        }
        self.ensure_next(ProvisionState::Activated)?;

        let base_path = self.base_path.clone().ok_or_else(|| {
            ProvisionError::Configuration("search path not configured".to_string())
        })?;
        let active = match ActiveEnvironment::activate(handle, &base_path) {
            Ok(a) => a,
            Err(e) => return Err(self.fail("activate", ProvisionState::Activated, None, e)),
        };
        info!(env = %active.handle.name, prefix = ?active.handle.prefix, "Environment activated");

        let mut record = StepRecord::passed("activate", ProvisionState::Activated, None, None);
        record.stdout = format!("PATH={}", active.path_value());
        self.record(record);

        self.active = Some(active);
        self.advance(ProvisionState::Activated)
    }

    /// Install one further package into the active environment.
    pub async fn install_additional(&mut self, install: &AdditionalInstall) -> Result<()> {
        self.ensure_next(ProvisionState::AdditionalPackageInstalled)?;
        let state = ProvisionState::AdditionalPackageInstalled;
        let active = self.active_env()?.clone();
        let inv = self.manager.install_invocation(&active, install);
        let step = inv.step.clone();
        let command = Some(inv.to_string());

        match self.manager.install_additional(&active, install).await {
            Ok(out) => {
                self.record(StepRecord::passed(&step, state, command, Some(&out)));
                if let Some(env) = self.environment.as_mut() {
                    env.record_install(install.package.clone());
                    if let Some(v) = install.interpreter_override {
                        env.set_interpreter(v);
                    }
                }
                self.advance(state)
            }
            Err(e) => Err(self.fail(&step, state, command, e)),
        }
    }

    /// Best-effort cache cleanup. Always advances, whatever the outcome.
    pub async fn prune_caches(&mut self) -> Result<()> {
        self.ensure_next(ProvisionState::CachesPruned)?;
        let state = ProvisionState::CachesPruned;
        let env = self.base_env()?;
        let command = Some(self.manager.clean_invocation(&env).to_string());

        match self.manager.prune_caches(&env).await {
            Ok(out) if out.success() => {
                self.record(StepRecord::passed("prune_caches", state, command, Some(&out)));
            }
            Ok(out) => {
                warn!(exit_code = out.exit_code, "Cache pruning failed; continuing");
                let mut record = StepRecord::passed("prune_caches", state, command, Some(&out));
                record.status = crate::report::StepStatus::Warned;
                record.error = Some(format!("exited with code {}", out.exit_code));
                self.record(record);
            }
            Err(e) => {
                warn!(error = %e, "Cache pruning could not run; continuing");
                self.record(StepRecord::failed("prune_caches", state, command, &e).warned());
            }
        }
        self.advance(state)
    }

    /// List the environment and check every requested package is present.
    pub async fn verify_inventory(&mut self) -> Result<()> {
        self.ensure_state(&[ProvisionState::CachesPruned])?;
        let state = self.state;
        let active = self.active_env()?.clone();
        let command = Some(self.manager.list_invocation(&active).to_string());

        let listed = match self.manager.list_inventory(&active).await {
            Ok((packages, out)) => {
                self.record(StepRecord::passed("inventory", state, command.clone(), Some(&out)));
                packages
            }
            Err(e) => return Err(self.fail("inventory", state, command, e)),
        };

        let missing: Vec<String> = self
            .environment
            .as_ref()
            .map(|env| {
                env.packages
                    .iter()
                    .filter(|p| !listed.iter().any(|l| l.name == p.name))
                    .map(|p| p.name.clone())
                    .collect()
            })
            .unwrap_or_default();

        if missing.is_empty() {
            return Ok(());
        }

        let e = ProvisionError::Resolution {
            step: "inventory".to_string(),
            exit_code: 0,
            output: format!("requested packages missing from environment: {}", missing.join(", ")),
        };
        Err(self.fail("verify_inventory", state, None, e))
    }

    /// Hand control to the test command and return its exit code.
    pub async fn invoke_test_command(&mut self) -> Result<i32> {
        self.ensure_next(ProvisionState::TestInvoked)?;
        let state = ProvisionState::TestInvoked;
        let active = self.active_env()?.clone();

        let Some(inv) = Invocation::from_argv("test", &self.config.test_command) else {
            return Err(ProvisionError::Configuration("test_command is empty".to_string()));
        };
        let inv = inv
            .envs(&active.env_vars())
            .timeout(self.config.timeouts.test_secs);
        let command = Some(inv.to_string());
        info!(command = %inv, "Invoking test command");

        self.advance(state)?;
        match self.runner.run(&inv).await {
            Ok(out) => {
                let mut record = StepRecord::passed("test", state, command, Some(&out));
                if !out.success() {
                    record.status = crate::report::StepStatus::Failed;
                }
                self.record(record);
                self.report.test_exit_code = Some(out.exit_code);
                Ok(out.exit_code)
            }
            Err(e) => {
                self.record(StepRecord::failed("test", state, command, &e));
                Err(e)
            }
        }
    }

    /// Close the run and return its report.
    pub fn finish(mut self) -> ProvisionReport {
        if self.state == ProvisionState::TestInvoked {
            self.state = ProvisionState::End;
        }
        self.active = None;
        self.report.final_state = self.state;
        self.report.environment = self.environment;
        self.report.finished_at = Some(Utc::now());
        self.report
    }

    // ---------------------------------------------------------------------
    // Plan (dry run)
    // ---------------------------------------------------------------------

    /// Render every step for `spec` without running anything.
    pub fn plan(config: &ProvisionConfig, spec: &EnvironmentSpec) -> Result<Vec<PlannedStep>> {
        use ProvisionState::*;

        let runner: Arc<dyn CommandRunner> = Arc::new(crate::runner::SystemRunner);
        let manager = PackageManager::new(runner, config);
        let mut steps = Vec::new();
        let mut push = |state: ProvisionState, step: &str, action: String| {
            steps.push(PlannedStep {
                state,
                step: step.to_string(),
                action,
            })
        };

        for (idx, argv) in config.pre_commands.iter().enumerate() {
            if let Some(inv) = Invocation::from_argv("pre", argv) {
                push(Start, &format!("pre_command_{}", idx), inv.to_string());
            }
        }

        let installer = select_bootstrap_installer(spec.interpreter, &config.installer);
        push(
            InstallerSelected,
            "select_installer",
            format!("{} ({})", installer.kind.name(), installer.url),
        );
        let artifact = config.download_dir.join(installer.file_name());
        push(
            InstallerSelected,
            "fetch_installer",
            format!("fetch {} -> {}", installer.url, artifact.display()),
        );
        push(
            BaseInstalled,
            "install_base",
            manager.install_base_invocation(&artifact).to_string(),
        );

        let base_path = manager.base_search_path(&SearchPath::parse("$PATH"));
        push(
            PathConfigured,
            "configure_path",
            format!("export PATH={}", base_path.to_env_value()?),
        );
        push(
            ManagerConfigured,
            "configure_manager",
            format!(
                "write {} (always_yes={}, changeps1={})",
                manager.condarc_path().display(),
                config.manager.always_yes,
                config.manager.changeps1
            ),
        );
        let env = manager.base_env(&base_path)?;
        push(
            ManagerConfigured,
            "diagnostics",
            manager.info_invocation(&env).to_string(),
        );
        push(
            EnvironmentCreated,
            "create_environment",
            manager.create_invocation(spec, &env).to_string(),
        );

        let handle = EnvironmentHandle::new(&config.prefix, &spec.name, spec.interpreter);
        let active = ActiveEnvironment::activate(handle, &base_path)?;
        push(
            Activated,
            "activate",
            format!("activate {} (PATH={})", spec.name, active.path_value()),
        );
        for install in &spec.additional {
            let inv = manager.install_invocation(&active, install);
            let step = inv.step.clone();
            push(AdditionalPackageInstalled, &step, inv.to_string());
        }
        push(
            CachesPruned,
            "prune_caches",
            manager.clean_invocation(&env).to_string(),
        );
        push(
            CachesPruned,
            "inventory",
            manager.list_invocation(&active).to_string(),
        );
        if let Some(inv) = Invocation::from_argv("test", &config.test_command) {
            push(TestInvoked, "test", inv.to_string());
        }
        Ok(steps)
    }

    // ---------------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------------

    fn base_env(&self) -> Result<BTreeMap<String, String>> {
        let path = self.base_path.as_ref().ok_or_else(|| {
            ProvisionError::Configuration("search path not configured".to_string())
        })?;
        self.manager.base_env(path)
    }

    fn active_env(&self) -> Result<&ActiveEnvironment> {
        self.active
            .as_ref()
            .ok_or_else(|| ProvisionError::Configuration("no active environment".to_string()))
    }

    fn ensure_next(&self, next: ProvisionState) -> Result<()> {
        if self.state.can_advance_to(next) {
            Ok(())
        } else {
            Err(ProvisionError::InvalidTransition {
                from: self.state.name().to_string(),
                to: next.name().to_string(),
            })
        }
    }

    fn ensure_state(&self, allowed: &[ProvisionState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(ProvisionError::InvalidTransition {
                from: self.state.name().to_string(),
                to: "(out of sequence)".to_string(),
            })
        }
    }

    fn advance(&mut self, next: ProvisionState) -> Result<()> {
        self.state.advance(next)?;
        self.report.final_state = self.state;
        Ok(())
    }

    fn record(&mut self, record: StepRecord) {
        self.report.steps.push(record);
    }

    /// Record a failed step and hand the error back for propagation.
    fn fail(
        &mut self,
        step: &str,
        state: ProvisionState,
        command: Option<String>,
        err: ProvisionError,
    ) -> ProvisionError {
        error!(step, class = err.class(), error = %err, "Provisioning step failed");
        self.record(StepRecord::failed(step, state, command, &err));
        self.set_error(step, &err);
        err
    }

    fn set_error(&mut self, step: &str, err: &ProvisionError) {
        if self.report.error.is_none() {
            self.report.error = Some(RunError {
                step: step.to_string(),
                class: err.class().to_string(),
                message: err.to_string(),
            });
        }
    }

    /// Record the abort and remove any half-built environment.
    async fn abort(&mut self, err: ProvisionError) {
        let step = self
            .report
            .steps
            .last()
            .map(|s| s.step.clone())
            .unwrap_or_else(|| "start".to_string());
        self.set_error(&step, &err);

        self.active = None;
        // A failed `conda create` may still leave a partial env directory behind.
        let created = self
            .environment
            .take()
            .filter(|_| self.state.has_environment())
            .map(|env| env.handle);
        let Some(handle) = created.or_else(|| self.partial.take()) else {
            return;
        };

        warn!(env = %handle.name, "Rolling back partially provisioned environment");
        let base_env = match self.base_env() {
            Ok(e) => e,
            Err(_) => return,
        };
        let command = Some(self.manager.remove_invocation(&handle, &base_env).to_string());
        match self.manager.remove_environment(&handle, &base_env).await {
            Ok(out) => self.record(StepRecord::passed("rollback", self.state, command, Some(&out))),
            Err(e) => {
                warn!(error = %e, "Rollback failed");
                self.record(StepRecord::failed("rollback", self.state, command, &e).warned());
            }
        }
    }
}
