//! mempool.space recommended fees endpoint.

use super::FeeEstimator;
use crate::types::FeeSuggestion;
use async_trait::async_trait;
use batcher_errors::FeeErr;
use reqwest::StatusCode;
use std::time::Duration;
use tokio::time::timeout;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

#[derive(Debug, Clone)]
pub struct MempoolFeeEstimator {
    client: reqwest::Client,
    /// Full URL of the endpoint, e.g. `https://mempool.space/api/v1/fees/recommended`.
    url: String,
    request_timeout: Duration,
    retries: usize,
}

impl MempoolFeeEstimator {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            request_timeout: Duration::from_secs(5),
            retries: 3,
        }
    }

    pub fn with_retries(mut self, retries: usize) -> Self {
        self.retries = retries;
        self
    }

    async fn fetch(&self) -> Result<FeeSuggestion, FeeErr> {
        let resp = timeout(self.request_timeout, self.client.get(&self.url).send())
            .await
            .map_err(|_| FeeErr::Timeout)?
            .map_err(FeeErr::Transport)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FeeErr::Status(status));
        }

        let json: serde_json::Value = timeout(self.request_timeout, resp.json())
            .await
            .map_err(|_| FeeErr::Timeout)?
            .map_err(FeeErr::JsonDecode)?;

        let field = |name: &str| json.get(name).and_then(|fee| fee.as_u64());
        let high = field("fastestFee").ok_or(FeeErr::MissingField)?;
        let medium = field("halfHourFee").ok_or(FeeErr::MissingField)?;
        let low = field("hourFee").ok_or(FeeErr::MissingField)?;

        Ok(FeeSuggestion {
            minimum: field("minimumFee").unwrap_or(1),
            economy: field("economyFee").unwrap_or(low),
            low,
            medium,
            high,
        })
    }
}

#[async_trait]
impl FeeEstimator for MempoolFeeEstimator {
    async fn fee_suggestion(&self) -> Result<FeeSuggestion, FeeErr> {
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(125)
            .max_delay(Duration::from_secs(5))
            .take(self.retries)
            .map(jitter);

        let should_retry = |e: &FeeErr| match e {
            FeeErr::Timeout => true,
            FeeErr::Transport(req_err) => req_err.is_timeout() || req_err.is_connect(),
            FeeErr::Status(code) => code.is_server_error() || *code == StatusCode::TOO_MANY_REQUESTS,
            FeeErr::JsonDecode(_) | FeeErr::MissingField => false,
        };

        RetryIf::spawn(strategy, || self.fetch(), should_retry)
            .await
            .inspect_err(|e| tracing::warn!(url = %self.url, "Failed to fetch fee suggestion: {e}"))
    }
}
