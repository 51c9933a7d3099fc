//! Output formatting utilities

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use colored::Colorize;
use prow_lib::{ComponentStatus, ProwJobState};
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    /// Table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

/// Print rows as a table, or the serialised value as JSON
pub fn print_rows<T: Tabled, J: Serialize + ?Sized>(
    rows: Vec<T>,
    json: &J,
    format: OutputFormat,
    empty_message: &str,
) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(json)?),
        OutputFormat::Table => {
            if rows.is_empty() {
                println!("{}", empty_message.yellow());
            } else {
                println!("{}", Table::new(rows).with(Style::rounded()));
            }
        }
    }
    Ok(())
}

pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
}

pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Compact age like `3d4h`, `12m` or `40s`
pub fn format_age(since: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - since).num_seconds().max(0);
    let (days, hours, mins) = (secs / 86_400, secs % 86_400 / 3600, secs % 3600 / 60);

    if days > 0 {
        format!("{}d{}h", days, hours)
    } else if hours > 0 {
        format!("{}h{}m", hours, mins)
    } else if mins > 0 {
        format!("{}m", mins)
    } else {
        format!("{}s", secs)
    }
}

pub fn color_state(state: ProwJobState) -> String {
    let s = state.as_str();
    match state {
        ProwJobState::Success => s.green().to_string(),
        ProwJobState::Failure | ProwJobState::Error => s.red().to_string(),
        ProwJobState::Pending | ProwJobState::Triggered => s.blue().to_string(),
        ProwJobState::Scheduling | ProwJobState::Aborted => s.yellow().to_string(),
    }
}

pub fn color_status(status: ComponentStatus) -> String {
    match status {
        ComponentStatus::Healthy => "healthy".green().to_string(),
        ComponentStatus::Degraded => "degraded".yellow().to_string(),
        ComponentStatus::Unhealthy => "unhealthy".red().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_format_age() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(format_age(now - Duration::seconds(40), now), "40s");
        assert_eq!(format_age(now - Duration::minutes(12), now), "12m");
        assert_eq!(format_age(now - Duration::minutes(95), now), "1h35m");
        assert_eq!(format_age(now - Duration::hours(76), now), "3d4h");
        assert_eq!(format_age(now + Duration::minutes(5), now), "0s");
    }
}
