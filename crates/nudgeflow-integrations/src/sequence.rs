use anyhow::{Context, Result};
use async_trait::async_trait;
use nudgeflow_core::traits::{FlowSequence, SequenceProvider};

use crate::http::ServiceClient;

/// Fetches task sequences from the recommendation service
#[derive(Debug, Clone)]
pub struct HttpSequenceClient {
    service: ServiceClient,
}

impl HttpSequenceClient {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self> {
        Ok(Self {
            service: ServiceClient::new("Flow sequence", base_url, api_key)?,
        })
    }
}

#[async_trait]
impl SequenceProvider for HttpSequenceClient {
    async fn get_flow_sequence(
        &self,
        duration_minutes: u32,
        energy_hint: Option<&str>,
    ) -> Result<FlowSequence> {
        let mut query = vec![("duration", duration_minutes.to_string())];
        if let Some(energy) = energy_hint {
            query.push(("energy", energy.to_string()));
        }

        let sequence: FlowSequence = self
            .service
            .get(&self.service.url("flow/sequence"), &query)
            .await
            .context("Failed to fetch flow sequence")?;

        log::info!(
            "Received sequence {} with {} tasks ({}m)",
            sequence.sequence_id,
            sequence.tasks.len(),
            sequence.total_duration
        );
        Ok(sequence)
    }
}
