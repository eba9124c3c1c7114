use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::j2534::device::{expand_home, LoadDeviceError};

/// Overrides the manifest directory regardless of the config file
pub const MANIFEST_DIR_ENV: &str = "PASSTHRU_MANIFEST_DIR";

const DEFAULT_MANIFEST_DIR: &str = "~/.passthru";
const DEFAULT_REGISTRY_KEY: &str = r"SOFTWARE\PassThruSupport.04.04";

/// Host-side settings for discovery and polling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Where Unix drivers install their JSON manifests
    pub manifest_dir: Option<PathBuf>,
    /// Registry key holding one subkey per installed Windows driver
    pub registry_key: String,
    /// Messages requested per read call
    pub read_batch: u32,
    pub voltage_poll_ms: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            manifest_dir: None,
            registry_key: DEFAULT_REGISTRY_KEY.to_string(),
            read_batch: 10,
            voltage_poll_ms: 2000,
        }
    }
}

impl HostConfig {
    /// Load from a JSON file. Missing fields keep their defaults.
    pub fn load(path: &Path) -> Result<Self, LoadDeviceError> {
        let text = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::PermissionDenied => {
                LoadDeviceError::NoPermission(path.to_path_buf())
            }
            _ => LoadDeviceError::Io(e),
        })?;
        let config: HostConfig = serde_json::from_str(&text)?;
        log::debug!("Loaded host config from {}: {:?}", path.display(), config);
        Ok(config)
    }

    pub fn manifest_dir(&self) -> PathBuf {
        self.resolve_manifest_dir(std::env::var(MANIFEST_DIR_ENV).ok())
    }

    fn resolve_manifest_dir(&self, env_override: Option<String>) -> PathBuf {
        if let Some(dir) = env_override.filter(|d| !d.trim().is_empty()) {
            return expand_home(dir.trim());
        }
        match &self.manifest_dir {
            Some(dir) => dir.to_str().map(expand_home).unwrap_or_else(|| dir.clone()),
            None => expand_home(DEFAULT_MANIFEST_DIR),
        }
    }
}
