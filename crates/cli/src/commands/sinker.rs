//! Dry-run view of the next garbage collection pass

use anyhow::Result;
use chrono::Utc;
use colored::Colorize;
use prow_lib::sinker::{CleanPlan, Sinker};
use tabled::Tabled;

use crate::output::{print_info, print_rows, OutputFormat};

#[derive(Tabled)]
struct DeletionRow {
    #[tabled(rename = "Kind")]
    kind: &'static str,
    #[tabled(rename = "Cluster")]
    cluster: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Reason")]
    reason: String,
    #[tabled(rename = "Note")]
    note: String,
}

fn deletion_rows(plan: &CleanPlan) -> Vec<DeletionRow> {
    let jobs = plan.prow_jobs.iter().map(|job| DeletionRow {
        kind: "ProwJob",
        cluster: "-".to_string(),
        name: job.name.clone(),
        reason: job.reason.to_string(),
        note: job.job.clone(),
    });
    let pods = plan.pods.values().flatten().map(|pod| DeletionRow {
        kind: "Pod",
        cluster: pod.cluster.clone(),
        name: pod.name.clone(),
        reason: pod.reason.to_string(),
        note: if pod.finalizers.is_empty() {
            String::new()
        } else {
            format!("blocked by {}", pod.finalizers.join(", "))
        },
    });
    jobs.chain(pods).collect()
}

/// Print what the sinker would delete right now; nothing is deleted
pub async fn plan(sinker: &Sinker, format: OutputFormat) -> Result<()> {
    let plan = sinker.plan_at(Utc::now()).await?;

    if matches!(format, OutputFormat::Table) {
        print_info(&format!(
            "{} ProwJob(s) and {} pod(s) would be deleted",
            plan.prow_jobs.len(),
            plan.pod_count()
        ));
    }
    print_rows(deletion_rows(&plan), &plan, format, "Nothing to clean")?;

    if matches!(format, OutputFormat::Table) && !plan.is_empty() {
        println!("{}", "Dry run: no resources were deleted".dimmed());
    }
    Ok(())
}
