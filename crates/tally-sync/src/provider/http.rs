//! Shared HTTP plumbing for provider adapters.
//!
//! Every vendor maps HTTP outcomes the same way:
//!
//! | Outcome                              | Error                      |
//! |--------------------------------------|----------------------------|
//! | 401, 403                             | `AuthenticationFailed`     |
//! | 408, 429, 5xx, connect/read failure  | `TransientProvider` ↻      |
//! | client-side timeout                  | `Timeout` ↻                |
//! | any other 4xx                        | `ProviderRejected`         |
//! | 2xx with an undecodable body         | `InvalidResponse`          |

use std::time::Duration;

use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{SyncError, SyncResult};

/// Longest error body carried into an error message.
const MAX_ERROR_BODY: usize = 200;

/// A reqwest client bound to one provider's base URL.
#[derive(Debug, Clone)]
pub struct ProviderHttp {
    provider: &'static str,
    base_url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl ProviderHttp {
    /// Creates a client for `provider` rooted at `base_url`.
    pub fn new(
        provider: &'static str,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("tally/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SyncError::InvalidConfig(format!("HTTP client: {}", e)))?;
        Ok(ProviderHttp {
            provider,
            base_url: base_url.into(),
            client,
            timeout,
        })
    }

    pub fn provider(&self) -> &'static str {
        self.provider
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    pub fn get(&self, path: &str) -> RequestBuilder {
        self.client.get(self.url(path))
    }

    pub fn post(&self, path: &str) -> RequestBuilder {
        self.client.post(self.url(path))
    }

    /// Sends `request` and decodes a JSON body.
    pub async fn json<T: DeserializeOwned>(&self, request: RequestBuilder) -> SyncResult<T> {
        let response = request.send().await.map_err(|e| self.transport_error(e))?;
        let status = response.status();
        debug!(provider = self.provider, status = status.as_u16(), "Provider response");

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(self.provider, status, &body));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| SyncError::InvalidResponse {
                provider: self.provider.to_string(),
                message: e.to_string(),
            })
    }

    /// Sends a credential probe.
    ///
    /// `Ok(true)` on 2xx, `Ok(false)` on 401/403, an error otherwise.
    pub async fn probe(&self, request: RequestBuilder) -> SyncResult<bool> {
        let response = request.send().await.map_err(|e| self.transport_error(e))?;
        let status = response.status();
        if status.is_success() {
            return Ok(true);
        }

        let body = response.text().await.unwrap_or_default();
        match classify_status(self.provider, status, &body) {
            SyncError::AuthenticationFailed { .. } => Ok(false),
            other => Err(other),
        }
    }

    fn transport_error(&self, err: reqwest::Error) -> SyncError {
        if err.is_timeout() {
            SyncError::Timeout {
                provider: self.provider.to_string(),
                secs: self.timeout.as_secs(),
            }
        } else if err.is_decode() {
            SyncError::InvalidResponse {
                provider: self.provider.to_string(),
                message: err.to_string(),
            }
        } else {
            SyncError::TransientProvider {
                provider: self.provider.to_string(),
                message: err.to_string(),
            }
        }
    }
}

/// Maps a non-2xx status to an error.
pub fn classify_status(provider: &str, status: StatusCode, body: &str) -> SyncError {
    let provider = provider.to_string();
    let message = summarize(body, status);

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            SyncError::AuthenticationFailed { provider }
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            SyncError::TransientProvider { provider, message }
        }
        s if s.is_server_error() => SyncError::TransientProvider { provider, message },
        s => SyncError::ProviderRejected {
            provider,
            status: s.as_u16(),
            message,
        },
    }
}

fn summarize(body: &str, status: StatusCode) -> String {
    let body = body.trim();
    if body.is_empty() {
        return status.to_string();
    }
    let mut end = body.len().min(MAX_ERROR_BODY);
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}: {}", status, &body[..end])
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_statuses() {
        for status in [StatusCode::UNAUTHORIZED, StatusCode::FORBIDDEN] {
            let err = classify_status("square", status, "");
            assert!(err.is_auth_error());
            assert!(!err.is_retryable());
        }
    }

    #[test]
    fn test_transient_statuses() {
        for status in [
            StatusCode::REQUEST_TIMEOUT,
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
        ] {
            assert!(classify_status("toast", status, "").is_retryable(), "{}", status);
        }
    }

    #[test]
    fn test_other_client_errors_are_rejections() {
        let err = classify_status("clover", StatusCode::BAD_REQUEST, "{\"message\":\"bad filter\"}");
        match err {
            SyncError::ProviderRejected {
                status, message, ..
            } => {
                assert_eq!(status, 400);
                assert!(message.contains("bad filter"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!classify_status("clover", StatusCode::NOT_FOUND, "").is_retryable());
    }

    #[test]
    fn test_long_bodies_are_truncated() {
        let body = "é".repeat(500);
        let err = classify_status("square", StatusCode::BAD_REQUEST, &body);
        assert!(err.to_string().len() < 400);
    }

    #[test]
    fn test_url_joins_without_double_slash() {
        let http = ProviderHttp::new("square", "http://localhost:1/", Duration::from_secs(1)).unwrap();
        assert_eq!(http.url("/v2/locations"), "http://localhost:1/v2/locations");
    }
}
