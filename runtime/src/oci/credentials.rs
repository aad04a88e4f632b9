//! Per-registry credentials.
//!
//! Stored at `~/.imgflow/auth/credentials.json`, written atomically.

use std::collections::BTreeMap;
use std::path::PathBuf;

use imgflow_core::config::imgflow_home;
use imgflow_core::error::{ImageError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CredentialEntry {
    username: String,
    password: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CredentialFile {
    registries: BTreeMap<String, CredentialEntry>,
}

/// Credential file keyed by registry host.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    /// Store at `~/.imgflow/auth/credentials.json`.
    pub fn default_path() -> Self {
        Self::new(imgflow_home().join("auth").join("credentials.json"))
    }

    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Save credentials for `registry`, replacing any previous entry.
    pub fn store(&self, registry: &str, username: &str, password: &str) -> Result<()> {
        let mut file = self.load()?;
        file.registries.insert(
            canonical_host(registry),
            CredentialEntry {
                username: username.to_string(),
                password: password.to_string(),
            },
        );
        self.save(&file)
    }

    /// `(username, password)` for `registry`, if any.
    pub fn get(&self, registry: &str) -> Result<Option<(String, String)>> {
        Ok(self
            .load()?
            .registries
            .remove(&canonical_host(registry))
            .map(|entry| (entry.username, entry.password)))
    }

    /// Forget `registry`. Returns whether an entry existed.
    pub fn remove(&self, registry: &str) -> Result<bool> {
        let mut file = self.load()?;
        let existed = file.registries.remove(&canonical_host(registry)).is_some();
        if existed {
            self.save(&file)?;
        }
        Ok(existed)
    }

    fn load(&self) -> Result<CredentialFile> {
        if !self.path.exists() {
            return Ok(CredentialFile::default());
        }
        let data = std::fs::read_to_string(&self.path).map_err(|e| {
            ImageError::Config(format!(
                "failed to read credentials {}: {}",
                self.path.display(),
                e
            ))
        })?;
        serde_json::from_str(&data).map_err(|e| {
            ImageError::Config(format!(
                "failed to parse credentials {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    fn save(&self, file: &CredentialFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = self.path.with_extension("tmp");
        std::fs::write(&tmp_path, serde_json::to_string_pretty(file)?)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

/// Docker Hub is reachable under several host names.
fn canonical_host(registry: &str) -> String {
    let host = registry.trim().to_lowercase();
    match host.as_str() {
        "docker.io" | "registry-1.docker.io" => "index.docker.io".to_string(),
        _ => host,
    }
}
