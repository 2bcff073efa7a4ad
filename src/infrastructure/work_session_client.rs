use crate::infrastructure::error::InfraError;
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Records a completed work segment with the remote task tracker.
#[async_trait]
pub trait WorkSessionReporter: Send + Sync {
    async fn report_work_session(&self, minutes: u32) -> Result<(), InfraError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestWorkSessionReporter {
    client: Client,
    endpoint: String,
}

impl ReqwestWorkSessionReporter {
    pub fn new(endpoint: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl WorkSessionReporter for ReqwestWorkSessionReporter {
    async fn report_work_session(&self, minutes: u32) -> Result<(), InfraError> {
        let response = self
            .client
            .post(&self.endpoint)
            .form(&[("minutes", minutes.to_string())])
            .send()
            .await
            .map_err(|error| InfraError::Http(format!("request failed: {error}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(InfraError::Http(format!(
                "work session endpoint returned http_{}",
                status.as_u16()
            )));
        }
        Ok(())
    }
}

/// Used when no endpoint is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopWorkSessionReporter;

#[async_trait]
impl WorkSessionReporter for NoopWorkSessionReporter {
    async fn report_work_session(&self, _minutes: u32) -> Result<(), InfraError> {
        Ok(())
    }
}
