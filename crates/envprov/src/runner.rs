//! External command execution.
//!
//! Every tool invocation carries its own environment overrides (search path,
//! active environment variables), so no step relies on ambient process state.

use crate::error::ProvisionError;
use crate::telemetry::step_span;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, Instrument};

/// A single external command to run as part of a provisioning step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invocation {
    /// Step name used in logs and reports.
    pub step: String,

    /// Executable (absolute path or name resolved via `PATH`).
    pub program: String,

    pub args: Vec<String>,

    /// Environment variables set on top of the inherited environment.
    pub env: BTreeMap<String, String>,

    pub cwd: Option<PathBuf>,

    /// Timeout in seconds (0 = none).
    pub timeout_secs: u64,
}

impl Invocation {
    pub fn new(step: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
            timeout_secs: 0,
        }
    }

    /// Build from an argv-style command; `None` if `argv` is empty.
    pub fn from_argv(step: impl Into<String>, argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self::new(step, program.clone()).args(args.iter().cloned()))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn envs(mut self, env: &BTreeMap<String, String>) -> Self {
        self.env
            .extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Basename of the program, e.g. `conda` for `/opt/conda/bin/conda`.
    pub fn program_name(&self) -> &str {
        self.program.rsplit('/').next().unwrap_or(&self.program)
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", shell_quote(&self.program))?;
        for arg in &self.args {
            write!(f, " {}", shell_quote(arg))?;
        }
        Ok(())
    }
}

fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

/// Result of one command execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Exit code (0 = success, -1 when killed by a signal).
    pub exit_code: i32,

    pub stdout: String,
    pub stderr: String,

    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Combined output for error reporting, stderr first.
    pub fn combined(&self) -> String {
        match (self.stderr.trim().is_empty(), self.stdout.trim().is_empty()) {
            (true, _) => self.stdout.trim().to_string(),
            (false, true) => self.stderr.trim().to_string(),
            (false, false) => format!("{}\n{}", self.stderr.trim(), self.stdout.trim()),
        }
    }
}

/// Executes invocations. The provisioner only talks to tools through this seam.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion. A non-zero exit is a normal `Ok` result; `Err` means
    /// the command could not be run at all (spawn failure, timeout).
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput>;
}

/// Runs invocations as real child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        spawn_and_wait(invocation)
            .instrument(step_span(&invocation.step))
            .await
    }
}

async fn spawn_and_wait(invocation: &Invocation) -> Result<CommandOutput> {
    let start = Instant::now();
    debug!(command = %invocation, "Spawning");

    let mut command = Command::new(&invocation.program);
    command
        .args(&invocation.args)
        .envs(&invocation.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &invocation.cwd {
        command.current_dir(cwd);
    }

    let child = command.spawn().map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
            ProvisionError::CommandNotFound(format!("{}: {}", invocation.program, e))
        }
        _ => ProvisionError::Io(e),
    })?;

    let output = if invocation.timeout_secs > 0 {
        tokio::time::timeout(
            Duration::from_secs(invocation.timeout_secs),
            child.wait_with_output(),
        )
        .await
        .map_err(|_| ProvisionError::Timeout {
            step: invocation.step.clone(),
            secs: invocation.timeout_secs,
        })??
    } else {
        child.wait_with_output().await?
    };

    Ok(CommandOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        duration_ms: start.elapsed().as_millis() as u64,
    })
}
