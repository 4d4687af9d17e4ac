//! Bootstrap installer selection and download
//!
//! Picks the base installer for an interpreter version and fetches it to a
//! local file, validating what was downloaded before anything executes it.

use crate::config::InstallerConfig;
use crate::error::ProvisionError;
use crate::spec::InterpreterVersion;
use crate::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Which bootstrap installer family to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallerKind {
    /// Installer for the legacy 2.x interpreter family.
    Legacy,
    /// Installer for every other interpreter version.
    Current,
}

impl InstallerKind {
    pub fn name(&self) -> &'static str {
        match self {
            InstallerKind::Legacy => "miniconda2",
            InstallerKind::Current => "miniconda3",
        }
    }
}

/// Reference to a remote (or local) installer artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallerRef {
    pub kind: InstallerKind,
    pub url: String,
    /// Expected lowercase hex SHA-256, when pinned.
    pub expected_sha256: Option<String>,
}

impl InstallerRef {
    /// File name the artifact is stored under locally.
    pub fn file_name(&self) -> String {
        self.url
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}.sh", self.kind.name()))
    }
}

/// Downloaded installer on local disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalArtifact {
    pub path: PathBuf,
    pub sha256: String,
    pub size: u64,
}

/// Map an interpreter version to its bootstrap installer.
///
/// Legacy 2.x versions get the legacy installer; everything else gets the
/// current one.
pub fn select_bootstrap_installer(
    version: InterpreterVersion,
    installers: &InstallerConfig,
) -> InstallerRef {
    let (kind, url, expected) = if version.is_legacy() {
        (
            InstallerKind::Legacy,
            &installers.legacy_url,
            &installers.legacy_sha256,
        )
    } else {
        (
            InstallerKind::Current,
            &installers.current_url,
            &installers.current_sha256,
        )
    };

    debug!(%version, installer = kind.name(), "Selected bootstrap installer");
    InstallerRef {
        kind,
        url: url.clone(),
        expected_sha256: expected.as_ref().map(|s| s.trim().to_ascii_lowercase()),
    }
}

/// Downloads installers over HTTP(S) or copies them from `file://` URLs.
pub struct InstallerFetcher {
    http_client: reqwest::Client,
}

impl InstallerFetcher {
    /// Create a fetcher whose requests time out after `timeout_secs` (0 = never).
    pub fn new(timeout_secs: u64) -> Result<Self> {
        let mut builder =
            reqwest::Client::builder().user_agent(concat!("envprov/", env!("CARGO_PKG_VERSION")));
        if timeout_secs > 0 {
            builder = builder.timeout(Duration::from_secs(timeout_secs));
        }
        Ok(InstallerFetcher {
            http_client: builder.build()?,
        })
    }

    /// Fetch the installer into `dest_dir` and validate it.
    pub async fn fetch(&self, installer: &InstallerRef, dest_dir: &Path) -> Result<LocalArtifact> {
        info!(url = %installer.url, "Fetching bootstrap installer");

        let bytes = if let Some(local) = installer.url.strip_prefix("file://") {
            tokio::fs::read(local).await.map_err(|e| {
                ProvisionError::Network(format!("cannot read {}: {}", installer.url, e))
            })?
        } else {
            self.download(&installer.url).await?
        };

        let sha256 = verify_artifact(installer, &bytes)?;

        tokio::fs::create_dir_all(dest_dir).await?;
        let path = dest_dir.join(installer.file_name());
        tokio::fs::write(&path, &bytes).await?;

        debug!(path = ?path, sha256 = %sha256, "Installer stored");
        Ok(LocalArtifact {
            path,
            sha256,
            size: bytes.len() as u64,
        })
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        let response = self.http_client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ProvisionError::Network(format!(
                "GET {} returned {}",
                url, status
            )));
        }
        Ok(response.bytes().await?.to_vec())
    }
}

/// Validate downloaded installer bytes and return their SHA-256.
///
/// The artifact must be a non-empty shell script. When the reference pins a
/// digest, it must match; otherwise the computed digest is only logged.
pub fn verify_artifact(installer: &InstallerRef, bytes: &[u8]) -> Result<String> {
    let integrity = |reason: String| ProvisionError::Integrity {
        artifact: installer.url.clone(),
        reason,
    };

    if bytes.is_empty() {
        return Err(integrity("artifact is empty".to_string()));
    }
    if !bytes.starts_with(b"#!") {
        return Err(integrity("artifact is not a shell installer".to_string()));
    }

    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let actual = hex::encode(hasher.finalize());

    match &installer.expected_sha256 {
        Some(expected) if *expected != actual => Err(integrity(format!(
            "sha256 mismatch: expected {}, got {}",
            expected, actual
        ))),
        Some(_) => Ok(actual),
        None => {
            warn!(
                url = %installer.url,
                sha256 = %actual,
                "No pinned checksum for installer; integrity not verified"
            );
            Ok(actual)
        }
    }
}
