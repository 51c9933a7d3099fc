//! HTTP client for the controllers' probe endpoints

use anyhow::{Context, Result};
use prow_lib::health::{HealthResponse, ReadinessResponse};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use url::Url;

/// Client for one controller's `/healthz` and `/readyz`
pub struct ControllerClient {
    client: Client,
    base_url: Url,
}

impl ControllerClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(base_url).context("Invalid controller URL")?;

        Ok(Self { client, base_url })
    }

    pub async fn health(&self) -> Result<HealthResponse> {
        self.probe("healthz").await
    }

    pub async fn readiness(&self) -> Result<ReadinessResponse> {
        self.probe("readyz").await
    }

    /// GET a probe endpoint; a 503 still carries a JSON body worth reading
    async fn probe<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.base_url.join(path).context("Invalid path")?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to send request")?;

        let status = response.status();
        if !status.is_success() && status != StatusCode::SERVICE_UNAVAILABLE {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Probe error ({}): {}", status, body);
        }

        response.json().await.context("Failed to parse probe response")
    }
}
