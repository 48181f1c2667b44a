use anyhow::{Context, Result};
use async_trait::async_trait;
use nudgeflow_core::traits::{SessionEventKind, SessionMirror};
use serde::Serialize;
use serde_json::Value;

use crate::http::ServiceClient;

#[derive(Debug, Serialize)]
struct SessionEventRequest<'a> {
    kind: SessionEventKind,
    payload: &'a Value,
}

/// Mirrors flow session transitions to the remote session store
#[derive(Debug, Clone)]
pub struct HttpSessionMirror {
    service: ServiceClient,
}

impl HttpSessionMirror {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self> {
        Ok(Self {
            service: ServiceClient::new("Session store", base_url, api_key)?,
        })
    }
}

#[async_trait]
impl SessionMirror for HttpSessionMirror {
    async fn report_session_event(
        &self,
        session_id: &str,
        kind: SessionEventKind,
        payload: Value,
    ) -> Result<()> {
        let url = self
            .service
            .url(&format!("flow/sessions/{session_id}/events"));
        self.service
            .post(
                &url,
                &SessionEventRequest {
                    kind,
                    payload: &payload,
                },
            )
            .await
            .with_context(|| format!("Failed to mirror {kind} for session {session_id}"))
    }
}
