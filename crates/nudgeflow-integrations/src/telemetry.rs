use anyhow::Result;
use nudgeflow_core::traits::TelemetrySink;
use serde::Serialize;
use serde_json::Value;
use tokio::runtime::Handle;

use crate::http::ServiceClient;

#[derive(Debug, Serialize)]
struct TelemetryRequest {
    kind: String,
    payload: Value,
}

/// Posts behavioral events in the background; callers never wait
#[derive(Debug, Clone)]
pub struct HttpTelemetrySink {
    service: ServiceClient,
    runtime: Handle,
}

impl HttpTelemetrySink {
    /// Must be called from within a tokio runtime; sends are spawned on it.
    ///
    /// # Errors
    ///
    /// Returns an error if there is no current runtime or the HTTP client
    /// cannot be created
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| anyhow::anyhow!("Telemetry needs a tokio runtime: {e}"))?;
        Ok(Self {
            service: ServiceClient::new("Telemetry", base_url, api_key)?,
            runtime,
        })
    }
}

impl TelemetrySink for HttpTelemetrySink {
    fn send_event(&self, kind: &str, payload: Value) {
        let service = self.service.clone();
        let request = TelemetryRequest {
            kind: kind.to_string(),
            payload,
        };
        self.runtime.spawn(async move {
            let url = service.url("telemetry/events");
            if let Err(e) = service.post(&url, &request).await {
                log::warn!("Dropped telemetry event {}: {e:#}", request.kind);
            }
        });
    }
}
