//! Process options for the horologium binary

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Horologium process options, read from `HOROLOGIUM_*` environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct HorologiumOptions {
    /// Path to the prow config document
    #[serde(default = "default_config_path")]
    pub config_path: PathBuf,

    /// Port for health and metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default)]
    pub kubeconfig: Option<PathBuf>,

    /// Seconds between triggering passes
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,

    /// Run a single pass and exit
    #[serde(default)]
    pub run_once: bool,
}

fn default_config_path() -> PathBuf {
    PathBuf::from("/etc/config/config.yaml")
}

fn default_api_port() -> u16 {
    8081
}

fn default_tick_interval_secs() -> u64 {
    60
}

impl HorologiumOptions {
    pub fn load() -> Result<Self> {
        Self::from_source(config::Environment::with_prefix("HOROLOGIUM"))
    }

    fn from_source(env: config::Environment) -> Result<Self> {
        let options: Self = config::Config::builder()
            .add_source(env.try_parsing(true))
            .build()
            .and_then(|c| c.try_deserialize())
            .context("Invalid HOROLOGIUM_* options")?;

        if options.tick_interval_secs == 0 {
            bail!("HOROLOGIUM_TICK_INTERVAL_SECS must be positive");
        }
        Ok(options)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }
}
