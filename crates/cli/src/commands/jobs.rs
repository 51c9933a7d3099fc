//! ProwJob listing

use anyhow::Result;
use chrono::{DateTime, Utc};
use prow_lib::store::ProwJobStore;
use prow_lib::{ProwJob, ProwJobState, ProwJobType};
use tabled::Tabled;

use crate::output::{color_state, format_age, print_rows, OutputFormat};

/// Which ProwJobs to show
#[derive(Debug, Default, Clone)]
pub struct JobFilter {
    pub job: Option<String>,
    pub job_type: Option<ProwJobType>,
    pub state: Option<ProwJobState>,
}

impl JobFilter {
    fn matches(&self, job: &ProwJob) -> bool {
        self.job.as_deref().map_or(true, |name| job.job_name() == name)
            && self.job_type.map_or(true, |t| job.spec.job_type == t)
            && self.state.map_or(true, |s| job.status.state == s)
    }
}

#[derive(Tabled)]
struct JobRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Job")]
    job: String,
    #[tabled(rename = "Type")]
    job_type: &'static str,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Cluster")]
    cluster: String,
    #[tabled(rename = "Age")]
    age: String,
    #[tabled(rename = "Duration")]
    duration: String,
}

/// Matching jobs, newest first
fn select_jobs<'a>(jobs: &'a [ProwJob], filter: &JobFilter) -> Vec<&'a ProwJob> {
    let mut matching: Vec<&ProwJob> = jobs.iter().filter(|j| filter.matches(j)).collect();
    matching.sort_by(|a, b| b.status.start_time.cmp(&a.status.start_time));
    matching
}

fn job_row(job: &ProwJob, now: DateTime<Utc>) -> JobRow {
    JobRow {
        name: job.name.clone(),
        job: job.job_name().to_string(),
        job_type: job.spec.job_type.as_str(),
        state: color_state(job.status.state),
        cluster: job.spec.cluster.clone(),
        age: format_age(job.status.start_time, now),
        duration: job
            .status
            .completion_time
            .map(|done| format_age(job.status.start_time, done))
            .unwrap_or_else(|| "-".to_string()),
    }
}

pub async fn list_jobs(
    store: &ProwJobStore,
    namespace: &str,
    filter: &JobFilter,
    format: OutputFormat,
) -> Result<()> {
    let jobs = store.list(namespace).await?;
    let selected = select_jobs(&jobs, filter);

    let now = Utc::now();
    let rows = selected.iter().map(|job| job_row(job, now)).collect();
    print_rows(rows, &selected, format, "No ProwJobs found")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn jobs() -> Vec<ProwJob> {
        let mut done = ProwJob::new(
            "a1",
            "default",
            ProwJobType::Periodic,
            "ci-nightly",
            now() - Duration::hours(3),
        );
        done.finish(ProwJobState::Failure, now() - Duration::hours(2));
        vec![
            done,
            ProwJob::new("b2", "default", ProwJobType::Presubmit, "unit", now() - Duration::minutes(5)),
            ProwJob::new("c3", "default", ProwJobType::Periodic, "ci-nightly", now() - Duration::minutes(1)),
        ]
    }

    #[test]
    fn test_newest_first() {
        let jobs = jobs();
        let names: Vec<_> = select_jobs(&jobs, &JobFilter::default())
            .iter()
            .map(|j| j.name.as_str())
            .collect();
        assert_eq!(names, vec!["c3", "b2", "a1"]);
    }

    #[test]
    fn test_filters_combine() {
        let jobs = jobs();
        let filter = JobFilter {
            job: Some("ci-nightly".into()),
            job_type: Some(ProwJobType::Periodic),
            state: Some(ProwJobState::Failure),
        };
        let selected = select_jobs(&jobs, &filter);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].name, "a1");
    }

    #[test]
    fn test_row_durations() {
        let jobs = jobs();
        let finished = job_row(&jobs[0], now());
        assert_eq!(finished.age, "3h0m");
        assert_eq!(finished.duration, "1h0m");

        let running = job_row(&jobs[2], now());
        assert_eq!(running.duration, "-");
        assert_eq!(running.job_type, "periodic");
    }
}
