//! HTTP client for the hub's relay fallback endpoints.

use std::time::Duration;

use reqwest::{Client, StatusCode};

use crate::error::EngineError;

#[derive(Debug, Clone)]
pub struct RelayClient {
    http: Client,
    base_url: String,
}

/// One request attempt's 30-second deadline (§4.5, §5).
const ATTEMPT_DEADLINE: Duration = Duration::from_secs(30);

impl RelayClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { http: Client::new(), base_url: base_url.into() }
    }

    /// Uploads a transfer's payload with bounded retry: at most three
    /// attempts, exponential backoff (1s, 2s, 4s, capped at 8s), each with
    /// a 30s deadline. A per-transfer fallback lock around this call is the
    /// caller's responsibility (`transfer.rs` owns it).
    pub async fn upload_with_retry(
        &self,
        transfer_id: &str,
        file_name: &str,
        media_type: &str,
        relative_path: Option<&str>,
        payload: bytes::Bytes,
    ) -> Result<(), EngineError> {
        const MAX_ATTEMPTS: u32 = 3;
        let mut last_err = String::new();

        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                let backoff = Duration::from_secs(1u64 << (attempt - 1)).min(Duration::from_secs(8));
                tokio::time::sleep(backoff).await;
            }

            let url = format!("{}/api/transfer/{}/upload", self.base_url, transfer_id);
            let mut request = self
                .http
                .post(&url)
                .header("X-Filename", urlencoding::encode(file_name).into_owned())
                .header("Content-Type", media_type)
                .header("X-Retry-Count", attempt.to_string())
                .header("X-Client-Timestamp", chrono::Utc::now().timestamp_millis().to_string())
                .body(payload.clone());
            if let Some(path) = relative_path {
                request = request.header("X-Relative-Path", urlencoding::encode(path).into_owned());
            }

            match tokio::time::timeout(ATTEMPT_DEADLINE, request.send()).await {
                Ok(Ok(response)) if response.status().is_success() => {
                    tracing::info!(transfer_id, attempt, "relay upload succeeded");
                    return Ok(());
                }
                Ok(Ok(response)) => {
                    last_err = format!("status {}", response.status());
                }
                Ok(Err(err)) => {
                    last_err = err.to_string();
                }
                Err(_) => {
                    last_err = "attempt deadline exceeded".to_string();
                }
            }
            tracing::warn!(transfer_id, attempt, error = last_err.as_str(), "relay upload attempt failed");
        }

        Err(EngineError::RelayUpload(last_err))
    }

    /// Downloads a transfer's payload. Called by the receiver when the hub
    /// delivers `transfer-complete` with no data ever having arrived over
    /// the peer channel — gated by the engine on the transfer already
    /// having been accepted.
    pub async fn download(&self, transfer_id: &str) -> Result<bytes::Bytes, EngineError> {
        let url = format!("{}/api/transfer/{}/download", self.base_url, transfer_id);
        let response = self.http.get(&url).send().await?;
        match response.status() {
            StatusCode::OK => Ok(response.bytes().await?),
            StatusCode::FORBIDDEN => Err(EngineError::RelayDownload("not accepted".into())),
            StatusCode::NOT_FOUND => Err(EngineError::RelayDownload("no payload".into())),
            other => Err(EngineError::RelayDownload(format!("status {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_caps_at_eight_seconds() {
        let sequence: Vec<Duration> = (1..4)
            .map(|attempt| Duration::from_secs(1u64 << (attempt - 1)).min(Duration::from_secs(8)))
            .collect();
        assert_eq!(sequence, vec![Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(4)]);
    }
}
