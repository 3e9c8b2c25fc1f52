//! JSON-over-HTTP trigger delivery.

use serde::Serialize;
use std::time::Duration;
use tracing::trace;

use crate::error::TriggerError;

/// Total time allowed for one POST, including draining the response body.
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Posts trigger payloads to HTTP endpoints. Cheap to clone.
#[derive(Debug, Clone)]
pub struct WebhookClient {
    client: reqwest::Client,
}

impl WebhookClient {
    /// Create a client with the default request timeout.
    pub fn new() -> Result<Self, TriggerError> {
        let client = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()?;
        Ok(Self { client })
    }

    /// POST `payload` as JSON. The response body is drained and discarded.
    ///
    /// A single attempt is made; a non-2xx status is an error.
    pub async fn post<T>(&self, endpoint: &str, payload: &T) -> Result<(), TriggerError>
    where
        T: Serialize + ?Sized,
    {
        let response = self.client.post(endpoint).json(payload).send().await?;
        let status = response.status();
        let body = response.bytes().await?;

        trace!(endpoint, %status, bytes = body.len(), "Webhook response");

        if !status.is_success() {
            return Err(TriggerError::HttpStatus { status });
        }
        Ok(())
    }
}
