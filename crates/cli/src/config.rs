//! Persistent CLI preferences

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_PROW_CONFIG: &str = "/etc/config/config.yaml";
pub const DEFAULT_SINKER_URL: &str = "http://localhost:8080";
pub const DEFAULT_HOROLOGIUM_URL: &str = "http://localhost:8081";

/// Contents of `~/.config/prowctl/config.json`; every field is optional
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CliConfig {
    /// Prow config document used by the plan commands
    pub prow_config: Option<PathBuf>,
    /// Kubeconfig naming the build clusters
    pub build_clusters: Option<PathBuf>,
    pub sinker_url: Option<String>,
    pub horologium_url: Option<String>,
}

impl CliConfig {
    /// Load from the default location; a missing file means defaults
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).context("Failed to read config file")?;
        serde_json::from_str(&content).context("Failed to parse config file")
    }

    fn config_path() -> Result<PathBuf> {
        let home = dirs_next::home_dir().context("Could not determine home directory")?;
        Ok(home.join(".config").join("prowctl").join("config.json"))
    }

    /// Command-line value, then file value, then the built-in default
    pub fn prow_config(&self, flag: Option<PathBuf>) -> PathBuf {
        flag.or_else(|| self.prow_config.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_PROW_CONFIG))
    }

    pub fn build_clusters(&self, flag: Option<PathBuf>) -> Option<PathBuf> {
        flag.or_else(|| self.build_clusters.clone())
    }

    pub fn sinker_url(&self, flag: Option<String>) -> String {
        flag.or_else(|| self.sinker_url.clone())
            .unwrap_or_else(|| DEFAULT_SINKER_URL.to_string())
    }

    pub fn horologium_url(&self, flag: Option<String>) -> String {
        flag.or_else(|| self.horologium_url.clone())
            .unwrap_or_else(|| DEFAULT_HOROLOGIUM_URL.to_string())
    }
}
