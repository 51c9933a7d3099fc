//! ProwJob and pod garbage collection
//!
//! Each pass lists ProwJobs and the prow pods of every build cluster,
//! decides what has outlived its policy, and deletes it. Clusters are
//! cleaned concurrently and a failing cluster never blocks the others.

mod controller;
mod policy;

#[cfg(test)]
mod tests;

pub use controller::{CleanError, CleanReport, Sinker, MAX_CONCURRENT_OWNER_LOOKUPS};
pub use policy::{
    newest_completed_periodics, plan_cleanup, pod_clean_reason, prow_jobs_to_delete, CleanPlan,
    OwnerIndex, PodCleanReason, PodDeletion, ProwJobCleanReason, ProwJobDeletion,
    ORPHAN_GRACE_PERIOD,
};
