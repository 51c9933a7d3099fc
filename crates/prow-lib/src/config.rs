//! Prow configuration and the live-reloading config agent
//!
//! The config document is loaded with the `config` crate (YAML, JSON or TOML,
//! inferred from the file extension), validated once, and handed to the
//! controllers through [`ConfigProvider`]. Controllers read it fresh on
//! every pass.

use crate::health::{components, HealthRegistry};
use crate::horologium::parse_cron;
use crate::models::{Periodic, Trigger, DEFAULT_CLUSTER};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const DEFAULT_RESYNC_PERIOD: Duration = Duration::from_secs(60);
const DEFAULT_MAX_PROWJOB_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);
const DEFAULT_MAX_POD_AGE: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load config: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid duration {value:?} for {field}: {message}")]
    InvalidDuration {
        field: String,
        value: String,
        message: String,
    },

    #[error("invalid periodic {name:?}: {message}")]
    InvalidPeriodic { name: String, message: String },

    #[error("duplicate periodic name {0:?}")]
    DuplicatePeriodic(String),

    #[error("invalid sinker config: {0}")]
    InvalidSinker(String),

    #[error("config agent has no backing file")]
    NoPath,

    #[error("failed to watch config: {0}")]
    Watch(#[from] notify::Error),
}

/// Garbage collection policy
#[derive(Debug, Clone, PartialEq)]
pub struct SinkerConfig {
    /// Interval between GC passes
    pub resync_period: Duration,
    /// Completed ProwJobs older than this are deleted
    pub max_prowjob_age: Duration,
    /// Pods started longer ago than this are deleted
    pub max_pod_age: Duration,
    /// Pods are deleted this long after their job or containers finished
    pub terminated_pod_ttl: Duration,
    /// Clusters whose pods are never touched
    pub exclude_clusters: BTreeSet<String>,
}

impl Default for SinkerConfig {
    fn default() -> Self {
        Self {
            resync_period: DEFAULT_RESYNC_PERIOD,
            max_prowjob_age: DEFAULT_MAX_PROWJOB_AGE,
            max_pod_age: DEFAULT_MAX_POD_AGE,
            terminated_pod_ttl: DEFAULT_MAX_POD_AGE,
            exclude_clusters: BTreeSet::new(),
        }
    }
}

impl SinkerConfig {
    pub fn is_excluded(&self, cluster: &str) -> bool {
        self.exclude_clusters.contains(cluster)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SchedulerConfig {
    /// New periodic runs wait in `scheduling` for an external scheduler
    #[serde(default)]
    pub enabled: bool,
}

/// The validated configuration document
#[derive(Debug, Clone, PartialEq)]
pub struct ProwConfig {
    pub prowjob_namespace: String,
    pub pod_namespace: String,
    pub scheduler: SchedulerConfig,
    pub sinker: SinkerConfig,
    pub periodics: Vec<Periodic>,
}

impl Default for ProwConfig {
    fn default() -> Self {
        Self {
            prowjob_namespace: default_prowjob_namespace(),
            pod_namespace: default_pod_namespace(),
            scheduler: SchedulerConfig::default(),
            sinker: SinkerConfig::default(),
            periodics: Vec::new(),
        }
    }
}

fn default_prowjob_namespace() -> String {
    "default".to_string()
}

fn default_pod_namespace() -> String {
    "test-pods".to_string()
}

#[derive(Debug, Deserialize)]
struct RawProwConfig {
    #[serde(default = "default_prowjob_namespace")]
    prowjob_namespace: String,
    #[serde(default = "default_pod_namespace")]
    pod_namespace: String,
    #[serde(default)]
    scheduler: SchedulerConfig,
    #[serde(default)]
    sinker: RawSinkerConfig,
    #[serde(default)]
    periodics: Vec<RawPeriodic>,
}

#[derive(Debug, Default, Deserialize)]
struct RawSinkerConfig {
    resync_period: Option<String>,
    max_prowjob_age: Option<String>,
    max_pod_age: Option<String>,
    terminated_pod_ttl: Option<String>,
    #[serde(default)]
    exclude_clusters: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawPeriodic {
    name: String,
    cron: Option<String>,
    interval: Option<String>,
    minimum_interval: Option<String>,
    cluster: Option<String>,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    #[serde(default)]
    annotations: BTreeMap<String, String>,
}

fn parse_duration(field: &str, value: &str) -> Result<Duration, ConfigError> {
    let duration = humantime::parse_duration(value.trim()).map_err(|e| {
        ConfigError::InvalidDuration {
            field: field.to_string(),
            value: value.to_string(),
            message: e.to_string(),
        }
    })?;

    if duration.is_zero() {
        return Err(ConfigError::InvalidDuration {
            field: field.to_string(),
            value: value.to_string(),
            message: "must be greater than zero".to_string(),
        });
    }
    Ok(duration)
}

fn optional_duration(
    field: &str,
    value: Option<&String>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    value.map_or(Ok(default), |v| parse_duration(field, v))
}

impl RawSinkerConfig {
    fn validate(self) -> Result<SinkerConfig, ConfigError> {
        let max_pod_age = optional_duration(
            "sinker.max_pod_age",
            self.max_pod_age.as_ref(),
            DEFAULT_MAX_POD_AGE,
        )?;
        let config = SinkerConfig {
            resync_period: optional_duration(
                "sinker.resync_period",
                self.resync_period.as_ref(),
                DEFAULT_RESYNC_PERIOD,
            )?,
            max_prowjob_age: optional_duration(
                "sinker.max_prowjob_age",
                self.max_prowjob_age.as_ref(),
                DEFAULT_MAX_PROWJOB_AGE,
            )?,
            max_pod_age,
            terminated_pod_ttl: optional_duration(
                "sinker.terminated_pod_ttl",
                self.terminated_pod_ttl.as_ref(),
                max_pod_age,
            )?,
            exclude_clusters: self.exclude_clusters.into_iter().collect(),
        };

        if config.terminated_pod_ttl > config.max_pod_age {
            return Err(ConfigError::InvalidSinker(format!(
                "terminated_pod_ttl ({}) must not exceed max_pod_age ({})",
                humantime::format_duration(config.terminated_pod_ttl),
                humantime::format_duration(config.max_pod_age),
            )));
        }
        Ok(config)
    }
}

impl RawPeriodic {
    fn validate(self) -> Result<Periodic, ConfigError> {
        let invalid = |message: String| ConfigError::InvalidPeriodic {
            name: self.name.clone(),
            message,
        };

        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty".to_string()));
        }

        let field = |suffix: &str| format!("periodics[{}].{}", self.name, suffix);
        let trigger = match (&self.cron, &self.interval, &self.minimum_interval) {
            (Some(expr), None, None) => Trigger::Cron(parse_cron(expr).map_err(invalid)?),
            (None, Some(interval), None) => {
                Trigger::Interval(parse_duration(&field("interval"), interval)?)
            }
            (None, None, Some(minimum)) => {
                Trigger::MinimumInterval(parse_duration(&field("minimum_interval"), minimum)?)
            }
            _ => {
                return Err(invalid(
                    "exactly one of cron, interval or minimum_interval must be set".to_string(),
                ))
            }
        };

        Ok(Periodic {
            trigger,
            cluster: self
                .cluster
                .filter(|c| !c.is_empty())
                .unwrap_or_else(|| DEFAULT_CLUSTER.to_string()),
            labels: self.labels,
            annotations: self.annotations,
            name: self.name,
        })
    }
}

impl RawProwConfig {
    fn validate(self) -> Result<ProwConfig, ConfigError> {
        let mut seen = HashSet::new();
        let mut periodics = Vec::with_capacity(self.periodics.len());
        for raw in self.periodics {
            if !seen.insert(raw.name.clone()) {
                return Err(ConfigError::DuplicatePeriodic(raw.name));
            }
            periodics.push(raw.validate()?);
        }

        Ok(ProwConfig {
            prowjob_namespace: self.prowjob_namespace,
            pod_namespace: self.pod_namespace,
            scheduler: self.scheduler,
            sinker: self.sinker.validate()?,
            periodics,
        })
    }
}

impl ProwConfig {
    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw: RawProwConfig = config::Config::builder()
            .add_source(config::File::from(path))
            .build()?
            .try_deserialize()?;
        raw.validate()
    }

    /// Parse and validate an in-memory YAML document
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let raw: RawProwConfig = config::Config::builder()
            .add_source(config::File::from_str(contents, config::FileFormat::Yaml))
            .build()?
            .try_deserialize()?;
        raw.validate()
    }

    pub fn periodic(&self, name: &str) -> Option<&Periodic> {
        self.periodics.iter().find(|p| p.name == name)
    }
}

/// Source of the current configuration
pub trait ConfigProvider: Send + Sync {
    fn current(&self) -> Arc<ProwConfig>;
}

/// Holds the current config and reloads it from disk
pub struct ConfigAgent {
    path: Option<PathBuf>,
    current: RwLock<Arc<ProwConfig>>,
}

impl ConfigAgent {
    /// Load the config file; invalid config is an error
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let config = ProwConfig::load(&path)?;
        info!(
            path = %path.display(),
            periodics = config.periodics.len(),
            "Loaded prow config"
        );
        Ok(Self {
            path: Some(path),
            current: RwLock::new(Arc::new(config)),
        })
    }

    /// Agent serving a fixed config
    pub fn from_config(config: ProwConfig) -> Self {
        Self {
            path: None,
            current: RwLock::new(Arc::new(config)),
        }
    }

    /// Replace the current config
    pub fn set(&self, config: ProwConfig) {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(config);
    }

    /// Re-read the backing file, keeping the previous config if the new one is invalid
    pub fn reload(&self) -> Result<(), ConfigError> {
        let path = self.path.as_ref().ok_or(ConfigError::NoPath)?;
        match ProwConfig::load(path) {
            Ok(config) => {
                if *self.current() != config {
                    info!(path = %path.display(), "Reloaded prow config");
                }
                self.set(config);
                Ok(())
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Keeping previous config");
                Err(e)
            }
        }
    }

    /// Reload and record the outcome on the `config` health component
    ///
    /// A rejected file leaves the component degraded until a later reload
    /// succeeds.
    pub async fn reload_and_record(&self, health: &HealthRegistry) -> Result<(), ConfigError> {
        let result = self.reload();
        match &result {
            Ok(()) => health.set_healthy(components::CONFIG).await,
            Err(e) => {
                health
                    .set_degraded(
                        components::CONFIG,
                        format!("reload rejected, serving previous config: {}", e),
                    )
                    .await
            }
        }
        result
    }

    /// Reload whenever the config file's directory changes
    ///
    /// The directory is watched rather than the file so that atomic
    /// replacements (ConfigMap symlink swaps) are seen. Each reload is
    /// recorded in `health`. Stops when the returned handle is dropped.
    pub fn watch(
        self: &Arc<Self>,
        health: HealthRegistry,
    ) -> Result<ConfigWatchHandle, ConfigError> {
        let path = self.path.clone().ok_or(ConfigError::NoPath)?;
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| {
                if let Ok(event) = res {
                    let _ = tx.send(event);
                }
            },
            notify::Config::default(),
        )?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;
        info!(dir = %dir.display(), "Watching config directory");

        let agent = Arc::clone(self);
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if !matches!(
                    event.kind,
                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                ) {
                    continue;
                }
                debug!(paths = ?event.paths, "Config directory changed");
                // Logged by reload; the old config stays active.
                let _ = agent.reload_and_record(&health).await;
            }
            debug!("Config watcher channel closed");
        });

        Ok(ConfigWatchHandle {
            _watcher: watcher,
            _task: task,
        })
    }
}

impl ConfigProvider for ConfigAgent {
    fn current(&self) -> Arc<ProwConfig> {
        self.current
            .read()
            .map(|guard| Arc::clone(&guard))
            .unwrap_or_else(|e| Arc::clone(&e.into_inner()))
    }
}

/// Handle to a running config watcher
/// Stops watching when dropped
pub struct ConfigWatchHandle {
    _watcher: RecommendedWatcher,
    _task: tokio::task::JoinHandle<()>,
}
