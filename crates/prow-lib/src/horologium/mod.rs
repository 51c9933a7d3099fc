//! Periodic job scheduler
//!
//! On every tick, starts a new run of each configured periodic whose
//! trigger condition holds, and never while its previous run is still going.

mod controller;
mod cron;
mod policy;


pub use self::controller::{Horologium, SyncError, SyncReport, DEFAULT_TICK_INTERVAL};
pub use self::cron::{parse_cron, CronError, CronScheduler, CronTrigger};
pub use self::policy::{
    latest_periodic_runs, periodics_to_trigger, should_trigger, PlannedTrigger, TriggerReason,
};
