//! Control-plane API: shared request/response models and the HTTP client.
//!
//! The client retries with exponential backoff (five attempts, doubling
//! from two seconds, capped at thirty) and honors `Retry-After` on 429s.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Lifecycle state of a nameplate as reported by `claim`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlateStatus {
    /// One side has claimed; waiting for the other.
    Waiting,
    /// Both sides have claimed.
    Paired,
    /// Missing, expired, consumed, or a bad claim - intentionally
    /// indistinguishable.
    Failed,
}

/// A namespace plus a set of opaque dialable addresses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddrBundle {
    pub namespace: String,
    pub addrs: Vec<String>,
}

/// Everything a client needs to reach the overlay.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub rendezvous: AddrBundle,
    pub relay: AddrBundle,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bootstrap: Vec<String>,
    pub topic: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocateResponse {
    pub nameplate: String,
    pub expires_at: DateTime<Utc>,
    #[serde(flatten)]
    pub conn: ConnectionInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimRequest {
    pub nameplate: String,
    pub side: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimResponse {
    pub status: PlateStatus,
    pub expires_at: DateTime<Utc>,
    #[serde(flatten)]
    pub conn: ConnectionInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NameplateRequest {
    pub nameplate: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OkResponse {
    pub ok: String,
}

/// Errors from the control-plane client.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("control plane returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("control plane unreachable: {0}")]
    Transport(#[from] reqwest::Error),
}

/// HTTP client for the four control endpoints.
#[derive(Debug, Clone)]
pub struct Client {
    base_url: String,
    http: reqwest::Client,
}

const MAX_ATTEMPTS: u32 = 5;
const BACKOFF_START: Duration = Duration::from_secs(2);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

impl Client {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client with static config");
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        }
    }

    pub async fn allocate(&self) -> Result<AllocateResponse, ApiError> {
        self.post_json("/v1/allocate", &serde_json::json!({})).await
    }

    pub async fn claim(&self, nameplate: &str, side: &str) -> Result<ClaimResponse, ApiError> {
        let req = ClaimRequest {
            nameplate: nameplate.to_string(),
            side: side.to_string(),
        };
        self.post_json("/v1/claim", &req).await
    }

    pub async fn consume(&self, nameplate: &str) -> Result<OkResponse, ApiError> {
        let req = NameplateRequest {
            nameplate: nameplate.to_string(),
        };
        self.post_json("/v1/consume", &req).await
    }

    pub async fn fail(&self, nameplate: &str) -> Result<OkResponse, ApiError> {
        let req = NameplateRequest {
            nameplate: nameplate.to_string(),
        };
        self.post_json("/v1/fail", &req).await
    }

    /// Fire-and-forget consume report; must not block session progress.
    pub fn consume_async(&self, nameplate: &str) {
        let client = self.clone();
        let nameplate = nameplate.to_string();
        tokio::spawn(async move {
            if let Err(e) = client.consume(&nameplate).await {
                warn!(nameplate = %nameplate, "consume report failed: {e}");
            }
        });
    }

    /// Fire-and-forget fail report.
    pub fn fail_async(&self, nameplate: &str) {
        let client = self.clone();
        let nameplate = nameplate.to_string();
        tokio::spawn(async move {
            if let Err(e) = client.fail(&nameplate).await {
                warn!(nameplate = %nameplate, "fail report failed: {e}");
            }
        });
    }

    async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize,
        T: for<'de> Deserialize<'de>,
    {
        let url = format!("{}{}", self.base_url, path);
        let mut backoff = BACKOFF_START;
        let mut attempt = 1u32;

        loop {
            let result = self.http.post(&url).json(body).send().await;
            let resp = match result {
                Ok(resp) => resp,
                Err(e) => {
                    if attempt == MAX_ATTEMPTS {
                        return Err(e.into());
                    }
                    debug!(attempt, "control request failed, backing off: {e}");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(BACKOFF_CAP);
                    attempt += 1;
                    continue;
                }
            };

            if resp.status().is_success() {
                return Ok(resp.json().await?);
            }

            let status = resp.status().as_u16();
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let text = resp.text().await.unwrap_or_default();

            if attempt == MAX_ATTEMPTS {
                return Err(ApiError::Status {
                    status,
                    body: text.trim().to_string(),
                });
            }
            let wait = retry_after.unwrap_or(backoff);
            debug!(attempt, status, wait_secs = wait.as_secs(), "retrying control request");
            tokio::time::sleep(wait).await;
            backoff = (backoff * 2).min(BACKOFF_CAP);
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&PlateStatus::Waiting).unwrap(),
            "\"waiting\""
        );
        assert_eq!(
            serde_json::from_str::<PlateStatus>("\"paired\"").unwrap(),
            PlateStatus::Paired
        );
    }

    #[test]
    fn claim_response_flattens_connection_info() {
        let resp = ClaimResponse {
            status: PlateStatus::Waiting,
            expires_at: Utc::now(),
            conn: ConnectionInfo {
                rendezvous: AddrBundle {
                    namespace: "wormhole".into(),
                    addrs: vec!["addr-1".into()],
                },
                relay: AddrBundle::default(),
                bootstrap: vec![],
                topic: "/wormhole/250".into(),
            },
        };
        let v: serde_json::Value = serde_json::to_value(&resp).unwrap();
        // Flattened: rendezvous/relay/topic are top-level keys.
        assert_eq!(v["status"], "waiting");
        assert_eq!(v["rendezvous"]["namespace"], "wormhole");
        assert_eq!(v["topic"], "/wormhole/250");
        assert!(v.get("bootstrap").is_none());
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let c = Client::new("http://127.0.0.1:8080/", Duration::from_secs(5));
        assert_eq!(c.base_url, "http://127.0.0.1:8080");
    }
}
