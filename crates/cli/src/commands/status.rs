//! Probe the running controllers

use anyhow::Result;
use colored::Colorize;
use prow_lib::{HealthResponse, ReadinessResponse};
use serde::Serialize;
use tabled::Tabled;

use crate::client::ControllerClient;
use crate::output::{color_status, print_rows, print_warning, OutputFormat};

/// Probe results for one controller
#[derive(Debug, Serialize)]
pub struct ControllerStatus {
    pub controller: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readiness: Option<ReadinessResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Tabled)]
struct StatusRow {
    #[tabled(rename = "Controller")]
    controller: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Ready")]
    ready: String,
    #[tabled(rename = "Details")]
    details: String,
}

pub async fn probe(controller: &str, url: &str) -> ControllerStatus {
    let mut status = ControllerStatus {
        controller: controller.to_string(),
        url: url.to_string(),
        health: None,
        readiness: None,
        error: None,
    };

    let client = match ControllerClient::new(url) {
        Ok(client) => client,
        Err(e) => {
            status.error = Some(format!("{:#}", e));
            return status;
        }
    };

    match tokio::try_join!(client.health(), client.readiness()) {
        Ok((health, readiness)) => {
            status.health = Some(health);
            status.readiness = Some(readiness);
        }
        Err(e) => status.error = Some(format!("{:#}", e)),
    }
    status
}

fn status_row(status: &ControllerStatus) -> StatusRow {
    let (Some(health), Some(readiness)) = (&status.health, &status.readiness) else {
        return StatusRow {
            controller: status.controller.clone(),
            status: "unreachable".red().to_string(),
            ready: "-".to_string(),
            details: status.error.clone().unwrap_or_default(),
        };
    };

    let mut details: Vec<String> = health
        .components
        .iter()
        .filter_map(|(name, c)| {
            c.message.as_ref().map(|m| match c.consecutive_failures {
                0 | 1 => format!("{}: {}", name, m),
                n => format!("{}: {} ({} failures in a row)", name, m, n),
            })
        })
        .collect();
    if let Some(reason) = &readiness.reason {
        details.push(reason.clone());
    }

    StatusRow {
        controller: status.controller.clone(),
        status: color_status(health.status),
        ready: if readiness.ready { "yes" } else { "no" }.to_string(),
        details: details.join("\n"),
    }
}

pub async fn show_status(targets: &[(&str, String)], format: OutputFormat) -> Result<()> {
    let mut statuses = Vec::with_capacity(targets.len());
    for (controller, url) in targets {
        statuses.push(probe(controller, url).await);
    }

    let rows = statuses.iter().map(status_row).collect();
    print_rows(rows, &statuses, format, "No controllers configured")?;

    if matches!(format, OutputFormat::Table) {
        for status in statuses.iter().filter(|s| s.error.is_some()) {
            print_warning(&format!("{} not reachable at {}", status.controller, status.url));
        }
    }
    Ok(())
}
