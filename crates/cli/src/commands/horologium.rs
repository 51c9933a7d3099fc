//! Dry-run view of the next triggering pass

use anyhow::Result;
use chrono::Utc;
use prow_lib::horologium::{Horologium, PlannedTrigger};
use prow_lib::Trigger;
use serde::Serialize;
use std::collections::HashSet;
use tabled::Tabled;

use crate::output::{print_info, print_rows, OutputFormat};

#[derive(Tabled, Serialize)]
struct TriggerRow {
    #[tabled(rename = "Periodic")]
    periodic: String,
    #[tabled(rename = "Schedule")]
    schedule: String,
    #[tabled(rename = "Cluster")]
    cluster: String,
    #[tabled(rename = "Reason")]
    reason: &'static str,
}

fn describe_trigger(trigger: &Trigger) -> String {
    match trigger {
        Trigger::Cron(expr) => format!("cron {}", expr),
        Trigger::Interval(d) => format!("every {}", format_period(*d)),
        Trigger::MinimumInterval(d) => format!("{} after completion", format_period(*d)),
    }
}

fn format_period(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    match (secs / 3600, secs % 3600 / 60, secs % 60) {
        (h, 0, 0) if h > 0 => format!("{}h", h),
        (0, m, 0) if m > 0 => format!("{}m", m),
        (0, 0, s) => format!("{}s", s),
        (h, m, s) => format!("{}h{}m{}s", h, m, s),
    }
}

fn trigger_rows(planned: &[PlannedTrigger]) -> Vec<TriggerRow> {
    planned
        .iter()
        .map(|p| TriggerRow {
            periodic: p.periodic.name.clone(),
            schedule: describe_trigger(&p.periodic.trigger),
            cluster: p.periodic.cluster.clone(),
            reason: p.reason.as_str(),
        })
        .collect()
}

/// Print the periodics horologium would start right now
///
/// Cron periodics only show up when they have never run, since cron firings
/// live in the running controller.
pub async fn plan(horologium: &Horologium, format: OutputFormat) -> Result<()> {
    let planned = horologium.plan_at(Utc::now(), &HashSet::new()).await?;
    let rows = trigger_rows(&planned);

    if matches!(format, OutputFormat::Table) {
        print_info(&format!("{} periodic(s) due", rows.len()));
    }
    let json = serde_json::to_value(&rows)?;
    print_rows(rows, &json, format, "No periodics due")
}

#[cfg(test)]
mod tests {
    use super::*;
    use prow_lib::horologium::TriggerReason;
    use prow_lib::Periodic;
    use std::time::Duration;

    #[test]
    fn test_schedule_descriptions() {
        assert_eq!(
            describe_trigger(&Trigger::Cron("0 0 3 * * *".into())),
            "cron 0 0 3 * * *"
        );
        assert_eq!(
            describe_trigger(&Trigger::Interval(Duration::from_secs(3600))),
            "every 1h"
        );
        assert_eq!(
            describe_trigger(&Trigger::MinimumInterval(Duration::from_secs(1800))),
            "30m after completion"
        );
        assert_eq!(format_period(Duration::from_secs(5430)), "1h30m30s");
        assert_eq!(format_period(Duration::from_secs(45)), "45s");
    }

    #[test]
    fn test_rows() {
        let planned = vec![PlannedTrigger {
            periodic: Periodic::new("ci-hourly", Trigger::Interval(Duration::from_secs(3600))),
            reason: TriggerReason::Interval,
        }];
        let rows = trigger_rows(&planned);
        assert_eq!(rows[0].periodic, "ci-hourly");
        assert_eq!(rows[0].cluster, "default");
        assert_eq!(rows[0].reason, "interval");
    }
}
