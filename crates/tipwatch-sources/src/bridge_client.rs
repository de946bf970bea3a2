//! HTTP client for the bridging vendor's relay status service.
//!
//! Endpoints:
//! - GET /api/v1/relay/status?relay_id=<relay_id>

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tipwatch_types::{BridgeStatusRecord, Result, TipwatchError};

use crate::BridgeStatusApi;

/// Bridge API response wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeResponse<T> {
    pub code: Option<i32>,
    pub message: Option<String>,
    pub data: T,
}

/// Bridge status client.
pub struct BridgeApiClient {
    base_url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl BridgeApiClient {
    pub fn new(base_url: &str, timeout_ms: Option<u64>) -> Self {
        let timeout_ms = timeout_ms.unwrap_or(10_000);
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_millis(timeout_ms))
                .build()
                .unwrap_or_default(),
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    /// Relay ids are caller input, so they go through query encoding.
    fn status_request(&self, relay_id: &str) -> reqwest::RequestBuilder {
        self.client
            .get(format!("{}/api/v1/relay/status", self.base_url))
            .query(&[("relay_id", relay_id)])
            .timeout(self.timeout)
    }
}

#[async_trait]
impl BridgeStatusApi for BridgeApiClient {
    /// Fetch the vendor's record. 404 and a null `data` both mean "unknown".
    async fn get_status(&self, relay_id: &str) -> Result<Option<BridgeStatusRecord>> {
        let resp = self
            .status_request(relay_id)
            .send()
            .await
            .map_err(|e| TipwatchError::Api(format!("bridge request failed: {}", e)))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(TipwatchError::Api(format!(
                "bridge returned status {}: {}",
                status, body
            )));
        }

        let body: BridgeResponse<Option<BridgeStatusRecord>> = resp
            .json()
            .await
            .map_err(|e| TipwatchError::InvalidResponse(format!("failed to parse bridge response: {}", e)))?;

        match body.code {
            Some(code) if code != 0 => Err(TipwatchError::Api(format!(
                "bridge error {}: {}",
                code,
                body.message.unwrap_or_default()
            ))),
            _ => Ok(body.data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_url_trims_trailing_slash() {
        let client = BridgeApiClient::new("https://bridge.example/", None);
        let request = client.status_request("r-1").build().unwrap();
        assert_eq!(
            request.url().as_str(),
            "https://bridge.example/api/v1/relay/status?relay_id=r-1"
        );
    }

    #[test]
    fn test_status_url_encodes_relay_id() {
        let client = BridgeApiClient::new("https://bridge.example", None);
        let request = client.status_request("a&b=c/d").build().unwrap();
        let pairs: Vec<(String, String)> = request.url().query_pairs().into_owned().collect();
        assert_eq!(pairs, vec![("relay_id".to_string(), "a&b=c/d".to_string())]);
        assert_eq!(request.url().path(), "/api/v1/relay/status");
    }

    #[test]
    fn test_response_wrapper_parses_null_data() {
        let body: BridgeResponse<Option<BridgeStatusRecord>> =
            serde_json::from_str(r#"{"code":0,"message":null,"data":null}"#).unwrap();
        assert!(body.data.is_none());
    }
}
