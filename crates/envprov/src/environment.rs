//! Provisioned environments and activation.
//!
//! Activation is a value: an [`ActiveEnvironment`] carries the search path and
//! environment variables that subsequent commands must run with.

use crate::error::ProvisionError;
use crate::spec::{InterpreterVersion, PackageDirective};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Ordered command-resolution search path.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SearchPath(Vec<PathBuf>);

impl SearchPath {
    /// Parse a `PATH`-style string.
    pub fn parse(raw: &str) -> Self {
        SearchPath(
            std::env::split_paths(raw)
                .filter(|p| !p.as_os_str().is_empty())
                .collect(),
        )
    }

    /// Snapshot of the `PATH` this process was started with.
    pub fn inherited() -> Self {
        std::env::var("PATH")
            .map(|raw| Self::parse(&raw))
            .unwrap_or_default()
    }

    /// New path with `dir` in front; an existing entry for `dir` is moved, not duplicated.
    pub fn prepend(&self, dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let mut entries = vec![dir.clone()];
        entries.extend(self.0.iter().filter(|p| **p != dir).cloned());
        SearchPath(entries)
    }

    pub fn entries(&self) -> &[PathBuf] {
        &self.0
    }

    /// Render as a `PATH` value. Fails if an entry contains the separator.
    pub fn to_env_value(&self) -> Result<String> {
        let joined = std::env::join_paths(&self.0).map_err(|e| {
            ProvisionError::Configuration(format!("cannot build search path: {}", e))
        })?;
        Ok(joined.to_string_lossy().into_owned())
    }
}

/// Handle to a named environment inside a base installation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentHandle {
    pub name: String,
    /// `<base prefix>/envs/<name>`
    pub prefix: PathBuf,
    pub interpreter: InterpreterVersion,
}

impl EnvironmentHandle {
    pub fn new(base_prefix: &Path, name: &str, interpreter: InterpreterVersion) -> Self {
        Self {
            name: name.to_string(),
            prefix: base_prefix.join("envs").join(name),
            interpreter,
        }
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.prefix.join("bin")
    }
}

/// The single environment subsequent commands target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveEnvironment {
    pub handle: EnvironmentHandle,
    pub search_path: SearchPath,
    /// `search_path` rendered once at activation.
    path_value: String,
}

impl ActiveEnvironment {
    /// Activate `handle` on top of the base installation's search path.
    pub fn activate(handle: EnvironmentHandle, base_path: &SearchPath) -> Result<Self> {
        let search_path = base_path.prepend(handle.bin_dir());
        let path_value = search_path.to_env_value()?;
        Ok(Self {
            handle,
            search_path,
            path_value,
        })
    }

    /// The `PATH` value commands in this environment run with.
    pub fn path_value(&self) -> &str {
        &self.path_value
    }

    /// Variables every command in the active environment runs with.
    pub fn env_vars(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("PATH".to_string(), self.path_value.clone());
        env.insert(
            "CONDA_PREFIX".to_string(),
            self.handle.prefix.to_string_lossy().into_owned(),
        );
        env.insert("CONDA_DEFAULT_ENV".to_string(), self.handle.name.clone());
        env
    }
}

/// Inventory of what has been installed into an environment, in issue order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedEnvironment {
    pub handle: EnvironmentHandle,
    pub interpreter: InterpreterVersion,
    pub packages: Vec<PackageDirective>,
}

impl ProvisionedEnvironment {
    pub fn new(handle: EnvironmentHandle, packages: &[PackageDirective]) -> Self {
        let mut env = Self {
            interpreter: handle.interpreter,
            handle,
            packages: Vec::new(),
        };
        for package in packages {
            env.record_install(package.clone());
        }
        env
    }

    /// Record a successful install. Reinstalling a name replaces its entry in place.
    pub fn record_install(&mut self, package: PackageDirective) {
        match self.packages.iter_mut().find(|p| p.name == package.name) {
            Some(existing) => *existing = package,
            None => self.packages.push(package),
        }
    }

    pub fn set_interpreter(&mut self, interpreter: InterpreterVersion) {
        self.interpreter = interpreter;
    }

    pub fn package_names(&self) -> Vec<&str> {
        self.packages.iter().map(|p| p.name.as_str()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.packages.iter().any(|p| p.name == name)
    }
}
