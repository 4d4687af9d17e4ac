//! Environment specification and identity.

use crate::error::ProvisionError;
use crate::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Interpreter version selector, e.g. `2.7` or `3.6`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InterpreterVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: Option<u32>,
}

impl InterpreterVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self {
            major,
            minor,
            patch: None,
        }
    }

    /// Whether this version belongs to the legacy 2.x family.
    pub fn is_legacy(&self) -> bool {
        self.major == 2
    }

    /// Conda match spec pinning the interpreter, e.g. `python=3.6`.
    pub fn match_spec(&self) -> String {
        format!("python={}", self)
    }
}

impl fmt::Display for InterpreterVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.patch {
            Some(patch) => write!(f, "{}.{}.{}", self.major, self.minor, patch),
            None => write!(f, "{}.{}", self.major, self.minor),
        }
    }
}

impl FromStr for InterpreterVersion {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let parts: Vec<&str> = trimmed.split('.').collect();
        if !(2..=3).contains(&parts.len()) {
            return Err(ProvisionError::Configuration(format!(
                "invalid interpreter version '{}': expected MAJOR.MINOR[.PATCH]",
                s
            )));
        }

        let parse = |part: &str| {
            part.parse::<u32>().map_err(|_| {
                ProvisionError::Configuration(format!(
                    "invalid interpreter version '{}': '{}' is not a number",
                    s, part
                ))
            })
        };

        Ok(Self {
            major: parse(parts[0])?,
            minor: parse(parts[1])?,
            patch: parts.get(2).map(|p| parse(p)).transpose()?,
        })
    }
}

impl Serialize for InterpreterVersion {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for InterpreterVersion {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// One package installation directive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PackageDirective {
    /// Package name as known to the package index.
    pub name: String,

    /// Optional version pin.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Source channel; `None` means the default channels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

impl PackageDirective {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
            channel: None,
        }
    }

    pub fn from_channel(channel: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
            channel: Some(channel.into()),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Conda match spec: `name` or `name=version`.
    pub fn match_spec(&self) -> String {
        match &self.version {
            Some(v) => format!("{}={}", self.name, v),
            None => self.name.clone(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ProvisionError::Configuration(
                "package directive has an empty name".to_string(),
            ));
        }
        if let Some(channel) = &self.channel {
            if channel.trim().is_empty() {
                return Err(ProvisionError::Configuration(format!(
                    "package '{}' has an empty channel",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// A further install issued after activation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdditionalInstall {
    #[serde(flatten)]
    pub package: PackageDirective,

    /// Interpreter version to pin during this install, if it should differ.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpreter_override: Option<InterpreterVersion>,
}

impl AdditionalInstall {
    pub fn new(package: PackageDirective) -> Self {
        Self {
            package,
            interpreter_override: None,
        }
    }
}

/// Declarative description of the environment a run must produce.
///
/// Built once per run from configuration and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentSpec {
    /// Environment name inside the base installation.
    pub name: String,

    /// Target interpreter version.
    pub interpreter: InterpreterVersion,

    /// Packages installed when the environment is created.
    pub base_packages: Vec<PackageDirective>,

    /// Channel-scoped installs issued after activation, in order.
    pub additional: Vec<AdditionalInstall>,
}

impl EnvironmentSpec {
    pub fn new(
        name: impl Into<String>,
        interpreter: InterpreterVersion,
        base_packages: Vec<PackageDirective>,
        additional: Vec<AdditionalInstall>,
    ) -> Result<Self> {
        let spec = Self {
            name: name.into(),
            interpreter,
            base_packages,
            additional,
        };
        spec.validate()?;
        Ok(spec)
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() || self.name.contains(char::is_whitespace) {
            return Err(ProvisionError::Configuration(format!(
                "invalid environment name '{}'",
                self.name
            )));
        }
        for package in self.requested_packages() {
            package.validate()?;
        }
        Ok(())
    }

    /// All requested packages in issue order: base list then additional installs.
    pub fn requested_packages(&self) -> impl Iterator<Item = &PackageDirective> {
        self.base_packages
            .iter()
            .chain(self.additional.iter().map(|a| &a.package))
    }

    /// Deterministic, order-sensitive SHA-256 digest of the specification.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        hasher.update(b"\0");
        hasher.update(self.interpreter.to_string().as_bytes());
        hasher.update(b"\0");
        for package in &self.base_packages {
            update_directive(&mut hasher, b"base", package);
        }
        for install in &self.additional {
            update_directive(&mut hasher, b"additional", &install.package);
            if let Some(v) = install.interpreter_override {
                hasher.update(v.to_string().as_bytes());
            }
            hasher.update(b"\0");
        }
        hex::encode(hasher.finalize())
    }
}

fn update_directive(hasher: &mut Sha256, kind: &[u8], package: &PackageDirective) {
    hasher.update(kind);
    hasher.update(b":");
    hasher.update(package.channel.as_deref().unwrap_or("").as_bytes());
    hasher.update(b"/");
    hasher.update(package.match_spec().as_bytes());
    hasher.update(b"\0");
}
