//! Shared HTTP client for HTTP-based providers
//!
//! One pooled `reqwest::Client` is built per backend and reused across
//! invocations. Requests are sent exactly once: retrying belongs to the retry
//! engine, which also tightens the output budget between attempts.

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use std::time::Duration;
use studyweave_utils::error::LlmError;
use studyweave_utils::redaction::redact_error_message;
use tracing::debug;

/// Upper bound for any single request
const DEFAULT_MAX_HTTP_TIMEOUT: Duration = Duration::from_secs(300);

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub(crate) struct HttpClient {
    client: Client,
    max_timeout: Duration,
}

impl HttpClient {
    /// # Errors
    ///
    /// Returns `LlmError::Misconfiguration` if the client cannot be constructed
    pub fn new() -> Result<Self, LlmError> {
        Self::with_max_timeout(DEFAULT_MAX_HTTP_TIMEOUT)
    }

    pub fn with_max_timeout(max_timeout: Duration) -> Result<Self, LlmError> {
        let client = Client::builder()
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| LlmError::Misconfiguration(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            max_timeout,
        })
    }

    pub fn post(&self, url: &str) -> RequestBuilder {
        self.client.post(url)
    }

    /// Send a request once with `min(request_timeout, max_timeout)`.
    ///
    /// # Errors
    ///
    /// - `LlmError::ProviderAuth` for 401/403
    /// - `LlmError::ProviderQuota` for 429
    /// - `LlmError::ProviderOutage` for 5xx
    /// - `LlmError::Timeout` for 408 and client-side timeouts
    /// - `LlmError::InvalidResponse` for other 4xx
    /// - `LlmError::Transport` for network errors
    pub async fn send(
        &self,
        request: RequestBuilder,
        request_timeout: Duration,
        provider_name: &str,
    ) -> Result<Response, LlmError> {
        let effective_timeout = request_timeout.min(self.max_timeout);

        debug!(
            provider = provider_name,
            timeout_secs = effective_timeout.as_secs(),
            "Executing HTTP request"
        );

        match request.timeout(effective_timeout).send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    Ok(response)
                } else {
                    Err(map_status(status, provider_name, effective_timeout))
                }
            }
            Err(e) if e.is_timeout() => Err(LlmError::Timeout {
                duration: effective_timeout,
            }),
            Err(e) => Err(LlmError::Transport(format!(
                "{provider_name} request failed: {}",
                redact_error_message(&e.to_string())
            ))),
        }
    }
}

fn map_status(status: StatusCode, provider_name: &str, timeout: Duration) -> LlmError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            LlmError::ProviderAuth(format!("{provider_name} authentication failed: {status}"))
        }
        StatusCode::TOO_MANY_REQUESTS => {
            LlmError::ProviderQuota(format!("{provider_name} rate limit exceeded: {status}"))
        }
        StatusCode::REQUEST_TIMEOUT => LlmError::Timeout { duration: timeout },
        s if s.is_server_error() => {
            LlmError::ProviderOutage(format!("{provider_name} returned server error: {status}"))
        }
        _ => LlmError::InvalidResponse(format!(
            "{provider_name} rejected the request: {status}"
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: Duration = Duration::from_secs(30);

    #[test]
    fn test_http_client_construction() {
        let client = HttpClient::with_max_timeout(Duration::from_secs(60)).unwrap();
        assert_eq!(client.max_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_map_auth_errors() {
        for status in [StatusCode::UNAUTHORIZED, StatusCode::FORBIDDEN] {
            let error = map_status(status, "anthropic", T);
            assert!(matches!(error, LlmError::ProviderAuth(ref m) if m.contains("anthropic")));
            assert!(!error.is_transient());
        }
    }

    #[test]
    fn test_map_429_is_transient_quota() {
        let error = map_status(StatusCode::TOO_MANY_REQUESTS, "openrouter", T);
        assert!(matches!(error, LlmError::ProviderQuota(ref m) if m.contains("429")));
        assert!(error.is_transient());
    }

    #[test]
    fn test_map_5xx_is_transient_outage() {
        for status in [StatusCode::INTERNAL_SERVER_ERROR, StatusCode::BAD_GATEWAY, StatusCode::SERVICE_UNAVAILABLE] {
            let error = map_status(status, "anthropic", T);
            assert!(matches!(error, LlmError::ProviderOutage(_)));
            assert!(error.is_transient());
        }
    }

    #[test]
    fn test_map_other_4xx_is_fatal() {
        let error = map_status(StatusCode::BAD_REQUEST, "anthropic", T);
        assert!(matches!(error, LlmError::InvalidResponse(ref m) if m.contains("400")));
        assert!(!error.is_transient());

        let error = map_status(StatusCode::REQUEST_TIMEOUT, "anthropic", T);
        assert_eq!(error, LlmError::Timeout { duration: T });
    }
}
