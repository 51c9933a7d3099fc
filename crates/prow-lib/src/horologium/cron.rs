//! Cron trigger source for periodics
//!
//! Keeps one schedule per cron periodic and flags a job as queued each time
//! its expression fires. The controller drains the queue once per pass; the
//! firing timer runs on its own task and never drives the controller tick.

use crate::models::Periodic;
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

/// How often the scheduler checks for due expressions
const FIRE_CHECK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Error)]
pub enum CronError {
    #[error("invalid cron expression {expression:?} for {job}: {message}")]
    InvalidExpression {
        job: String,
        expression: String,
        message: String,
    },

    #[error("{} cron job(s) failed to sync: {}", .0.len(), join_errors(.0))]
    Sync(Vec<CronError>),
}

fn join_errors(errors: &[CronError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Validate a cron expression and normalise it to the six-field form
///
/// Five-field expressions use standard crontab semantics: they get a leading
/// seconds field of `0` and their day of week (0-7, Sunday is 0 and 7) is
/// renumbered to the scheduler's 1-7 with Sunday as 1. Six and seven field
/// expressions and `@hourly`-style shortcuts are kept as written.
pub fn parse_cron(expression: &str) -> Result<String, String> {
    let trimmed = expression.trim();
    let normalized = if trimmed.starts_with('@') {
        trimmed.to_string()
    } else {
        let fields: Vec<&str> = trimmed.split_whitespace().collect();
        match fields.len() {
            5 => {
                let day_of_week = crontab_day_of_week(fields[4])?;
                format!("0 {} {}", fields[..4].join(" "), day_of_week)
            }
            6 | 7 => fields.join(" "),
            n => return Err(format!("expected 5 fields, found {}", n)),
        }
    };

    Schedule::from_str(&normalized).map_err(|e| e.to_string())?;
    Ok(normalized)
}

/// Rewrite a crontab day-of-week field as an explicit list of scheduler days
///
/// Ranges, lists and steps are expanded. Day names already mean the same
/// thing to both and pass through untouched.
fn crontab_day_of_week(field: &str) -> Result<String, String> {
    if field == "*" || field == "?" || field.chars().any(|c| c.is_ascii_alphabetic()) {
        return Ok(field.to_string());
    }

    let mut days = BTreeSet::new();
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: usize = step
                    .parse()
                    .map_err(|_| format!("invalid day-of-week step {:?}", step))?;
                if step == 0 {
                    return Err("day-of-week step must be positive".to_string());
                }
                (range, Some(step))
            }
            None => (item, None),
        };

        let (first, last) = if range == "*" {
            (0, 6)
        } else if let Some((first, last)) = range.split_once('-') {
            (crontab_day(first)?, crontab_day(last)?)
        } else {
            let day = crontab_day(range)?;
            // `n/step` runs to the end of the week
            (day, if step.is_some() { 6 } else { day })
        };
        if first > last {
            return Err(format!("invalid day-of-week range {:?}", range));
        }

        for day in (first..=last).step_by(step.unwrap_or(1)) {
            days.insert(day % 7 + 1);
        }
    }

    Ok(days
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(","))
}

fn crontab_day(token: &str) -> Result<u32, String> {
    match token.parse::<u32>() {
        Ok(day) if day <= 7 => Ok(day),
        _ => Err(format!("invalid day of week {:?}", token)),
    }
}

/// External signal telling the controller which cron periodics fired
pub trait CronTrigger: Send + Sync {
    /// Register new cron periodics, update changed ones and drop removed ones
    fn sync_config(&self, periodics: &[Periodic]) -> Result<(), CronError>;

    /// Names of jobs fired since the previous call; clears the queue
    fn queued_jobs(&self) -> Vec<String>;
}

struct CronEntry {
    expression: String,
    schedule: Schedule,
    next_fire: Option<DateTime<Utc>>,
    triggered: bool,
}

/// In-process cron scheduler
#[derive(Default)]
pub struct CronScheduler {
    entries: Mutex<BTreeMap<String, CronEntry>>,
}

impl CronScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<String, CronEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Sync registered expressions against `periodics`, scheduling from `now`
    pub fn sync_config_at(
        &self,
        periodics: &[Periodic],
        now: DateTime<Utc>,
    ) -> Result<(), CronError> {
        let mut entries = self.entries();
        let mut wanted = HashSet::new();
        let mut errors = Vec::new();

        for periodic in periodics {
            let Some(expression) = periodic.cron() else {
                continue;
            };
            wanted.insert(periodic.name.as_str());

            if entries
                .get(&periodic.name)
                .is_some_and(|e| e.expression == expression)
            {
                continue;
            }

            let schedule = match parse_cron(expression).and_then(|normalized| {
                Schedule::from_str(&normalized).map_err(|e| e.to_string())
            }) {
                Ok(schedule) => schedule,
                Err(message) => {
                    errors.push(CronError::InvalidExpression {
                        job: periodic.name.clone(),
                        expression: expression.to_string(),
                        message,
                    });
                    continue;
                }
            };

            let next_fire = schedule.after(&now).next();
            let triggered = entries
                .get(&periodic.name)
                .is_some_and(|e| e.triggered);
            info!(job = %periodic.name, expression = %expression, next_fire = ?next_fire, "Registered cron job");
            entries.insert(
                periodic.name.clone(),
                CronEntry {
                    expression: expression.to_string(),
                    schedule,
                    next_fire,
                    triggered,
                },
            );
        }

        entries.retain(|name, _| {
            let keep = wanted.contains(name.as_str());
            if !keep {
                info!(job = %name, "Removed cron job");
            }
            keep
        });

        if errors.is_empty() {
            Ok(())
        } else {
            Err(CronError::Sync(errors))
        }
    }

    /// Queue every job whose next firing is at or before `now`
    ///
    /// Missed firings collapse into a single queued trigger.
    pub fn fire_due(&self, now: DateTime<Utc>) -> usize {
        let mut fired = 0;
        for (name, entry) in self.entries().iter_mut() {
            if entry.next_fire.is_some_and(|next| next <= now) {
                entry.triggered = true;
                entry.next_fire = entry.schedule.after(&now).next();
                fired += 1;
                debug!(job = %name, next_fire = ?entry.next_fire, "Cron job fired");
            }
        }
        fired
    }

    /// Names of registered cron jobs
    pub fn jobs(&self) -> Vec<String> {
        self.entries().keys().cloned().collect()
    }

    /// Fire due expressions until shutdown
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        let mut ticker = interval(FIRE_CHECK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.fire_due(Utc::now());
                }
                _ = shutdown.recv() => {
                    info!("Shutting down cron scheduler");
                    break;
                }
            }
        }
    }
}

impl CronTrigger for CronScheduler {
    fn sync_config(&self, periodics: &[Periodic]) -> Result<(), CronError> {
        self.sync_config_at(periodics, Utc::now())
    }

    fn queued_jobs(&self) -> Vec<String> {
        self.entries()
            .iter_mut()
            .filter(|(_, entry)| entry.triggered)
            .map(|(name, entry)| {
                entry.triggered = false;
                name.clone()
            })
            .collect()
    }
}
