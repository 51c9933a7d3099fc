//! Process options for the sinker binary

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;

/// Sinker process options, read from `SINKER_*` environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct SinkerOptions {
    /// Path to the prow config document
    #[serde(default = "default_config_path")]
    pub config_path: PathBuf,

    /// Port for health and metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Kubeconfig whose contexts name the build clusters
    #[serde(default)]
    pub kubeconfig: Option<PathBuf>,

    /// Log deletions without performing them
    #[serde(default)]
    pub dry_run: bool,

    /// Run a single pass and exit
    #[serde(default)]
    pub run_once: bool,
}

fn default_config_path() -> PathBuf {
    PathBuf::from("/etc/config/config.yaml")
}

fn default_api_port() -> u16 {
    8080
}

impl SinkerOptions {
    /// Load options from the process environment
    pub fn load() -> Result<Self> {
        Self::from_source(config::Environment::with_prefix("SINKER"))
    }

    fn from_source(env: config::Environment) -> Result<Self> {
        config::Config::builder()
            .add_source(env.try_parsing(true))
            .build()
            .and_then(|c| c.try_deserialize())
            .context("Invalid SINKER_* options")
    }
}
