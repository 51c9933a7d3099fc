//! Health tracking for the controller binaries
//!
//! Each controller records the outcome of every pass here, and the config
//! agent records every reload. `/healthz` reports the worst component;
//! `/readyz` additionally waits for startup to finish.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Component status, ordered from best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Last pass or reload failed; the controller keeps running on what it has
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_check_timestamp: i64,
    /// Failed reports since the last success
    #[serde(default, skip_serializing_if = "is_zero")]
    pub consecutive_failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_success_timestamp: Option<i64>,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl ComponentHealth {
    fn registered() -> Self {
        Self {
            status: ComponentStatus::Healthy,
            message: None,
            last_check_timestamp: Utc::now().timestamp(),
            consecutive_failures: 0,
            last_success_timestamp: None,
        }
    }

    /// Apply a new report on top of the previous one
    fn report(&mut self, status: ComponentStatus, message: Option<String>) {
        let now = Utc::now().timestamp();
        self.last_check_timestamp = now;
        self.status = status;
        self.message = message;
        if status == ComponentStatus::Healthy {
            self.consecutive_failures = 0;
            self.last_success_timestamp = Some(now);
        } else {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        }
    }
}

/// Body of `/healthz`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: BTreeMap<String, ComponentHealth>,
}

impl HealthResponse {
    fn from_components(components: BTreeMap<String, ComponentHealth>) -> Self {
        let status = components
            .values()
            .map(|c| c.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy);
        Self { status, components }
    }

    /// Names of components in `status`
    pub fn components_in(&self, status: ComponentStatus) -> Vec<&str> {
        self.components
            .iter()
            .filter(|(_, c)| c.status == status)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// Body of `/readyz`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Component names for health tracking
pub mod components {
    pub const SINKER: &str = "sinker";
    pub const HOROLOGIUM: &str = "horologium";
    pub const CONFIG: &str = "config";
}

#[derive(Debug, Default)]
struct RegistryState {
    components: BTreeMap<String, ComponentHealth>,
    started: bool,
}

/// Shared registry of component health
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    state: Arc<RwLock<RegistryState>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a component as healthy
    pub async fn register(&self, name: &str) {
        self.state
            .write()
            .await
            .components
            .insert(name.to_string(), ComponentHealth::registered());
    }

    async fn report(&self, name: &str, status: ComponentStatus, message: Option<String>) {
        let mut state = self.state.write().await;
        state
            .components
            .entry(name.to_string())
            .or_insert_with(ComponentHealth::registered)
            .report(status, message);
    }

    pub async fn set_healthy(&self, name: &str) {
        self.report(name, ComponentStatus::Healthy, None).await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.report(name, ComponentStatus::Degraded, Some(message.into()))
            .await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.report(name, ComponentStatus::Unhealthy, Some(message.into()))
            .await;
    }

    /// Record the outcome of a controller pass
    pub async fn record_pass(&self, name: &str, result: &anyhow::Result<()>) {
        match result {
            Ok(()) => self.set_healthy(name).await,
            Err(e) => self.set_degraded(name, format!("{:#}", e)).await,
        }
    }

    pub async fn set_ready(&self, ready: bool) {
        self.state.write().await.started = ready;
    }

    pub async fn health(&self) -> HealthResponse {
        let components = self.state.read().await.components.clone();
        HealthResponse::from_components(components)
    }

    pub async fn readiness(&self) -> ReadinessResponse {
        if !self.state.read().await.started {
            return ReadinessResponse {
                ready: false,
                reason: Some("Controller not yet started".to_string()),
            };
        }

        let health = self.health().await;
        match health.components_in(ComponentStatus::Unhealthy).as_slice() {
            [] => ReadinessResponse {
                ready: true,
                reason: None,
            },
            unhealthy => ReadinessResponse {
                ready: false,
                reason: Some(format!("Unhealthy: {}", unhealthy.join(", "))),
            },
        }
    }
}
