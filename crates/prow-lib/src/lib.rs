//! Shared library for the prow controllers
//!
//! This crate provides:
//! - The ProwJob/Pod/Periodic data model and resource stores
//! - The sinker garbage collector
//! - The horologium periodic scheduler
//! - Configuration loading, health checks and observability

pub mod api;
pub mod config;
pub mod controller_loop;
pub mod health;
pub mod horologium;
pub mod models;
pub mod observability;
pub mod sinker;
pub mod store;

pub use self::config::{ConfigAgent, ConfigProvider, ProwConfig, SinkerConfig};
pub use controller_loop::{ControllerLoop, Reconciler};
pub use health::{ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse};
pub use models::*;
pub use observability::{ControllerLogger, HorologiumMetrics, SinkerMetrics};
