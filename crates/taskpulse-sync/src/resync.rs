use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use taskpulse_core::ProgressEvent;
use tracing::warn;
use url::Url;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.min(16)))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResyncError {
    #[error("history request failed: {0}")]
    Request(reqwest::Error),
    #[error("history endpoint returned {0}")]
    Status(StatusCode),
    #[error("history payload undecodable: {0}")]
    Decode(reqwest::Error),
}

impl ResyncError {
    fn transient(&self) -> bool {
        match self {
            ResyncError::Request(_) => true,
            ResyncError::Status(status) => status.is_server_error(),
            ResyncError::Decode(_) => false,
        }
    }
}

#[async_trait]
pub trait ProgressHistorySource: Send + Sync {
    async fn fetch_history(&self, task_id: &str) -> Result<Vec<ProgressEvent>, ResyncError>;
}

pub struct HttpHistorySource {
    client: reqwest::Client,
    api_url: Url,
    retry: RetryPolicy,
}

impl HttpHistorySource {
    pub fn new(client: reqwest::Client, api_url: Url, retry: RetryPolicy) -> Self {
        Self {
            client,
            api_url,
            retry,
        }
    }

    fn history_url(&self, task_id: &str) -> Url {
        let mut url = self.api_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend(["tasks", task_id, "progress"]);
        }
        url
    }

    async fn try_fetch(&self, url: Url) -> Result<Vec<ProgressEvent>, ResyncError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(ResyncError::Request)?;
        let status = response.status();
        if !status.is_success() {
            return Err(ResyncError::Status(status));
        }
        response.json().await.map_err(ResyncError::Decode)
    }
}

#[async_trait]
impl ProgressHistorySource for HttpHistorySource {
    async fn fetch_history(&self, task_id: &str) -> Result<Vec<ProgressEvent>, ResyncError> {
        let url = self.history_url(task_id);
        let mut attempt: u32 = 0;
        loop {
            match self.try_fetch(url.clone()).await {
                Ok(records) => return Ok(records),
                Err(err) => {
                    if attempt >= self.retry.max_retries || !err.transient() {
                        return Err(err);
                    }
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        event = "history_fetch_retry",
                        task_id = %task_id,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
