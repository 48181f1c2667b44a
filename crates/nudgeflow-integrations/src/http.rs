//! HTTP plumbing shared by the service clients.

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Authenticated JSON client for one backend service
#[derive(Debug, Clone)]
pub struct ServiceClient {
    api_name: &'static str,
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl ServiceClient {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created
    pub fn new(api_name: &'static str, base_url: &str, api_key: Option<String>) -> Result<Self> {
        Self::with_timeout(
            api_name,
            base_url,
            api_key,
            Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        )
    }

    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created
    pub fn with_timeout(
        api_name: &'static str,
        base_url: &str,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            api_name,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }

    #[must_use]
    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Attach the key and send; a non-2xx reply becomes an error carrying
    /// the status and whatever body the service returned
    async fn dispatch(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let request = match &self.api_key {
            Some(key) => request.header("X-Api-Key", key),
            None => request,
        };
        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to send request to {} API", self.api_name))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("{} API error ({status}): {body}", self.api_name)
    }

    /// Make an authenticated GET request
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure, a non-2xx status or an
    /// unparseable body
    pub async fn get<T: DeserializeOwned>(&self, url: &str, query: &[(&str, String)]) -> Result<T> {
        log::debug!("GET {url}");

        self.dispatch(self.client.get(url).query(query))
            .await?
            .json()
            .await
            .with_context(|| format!("Failed to parse {} API response", self.api_name))
    }

    /// Make an authenticated POST request, ignoring the response body
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or a non-2xx status
    pub async fn post<B: Serialize + Sync>(&self, url: &str, body: &B) -> Result<()> {
        log::debug!("POST {url}");

        self.dispatch(self.client.post(url).json(body)).await?;
        Ok(())
    }
}
