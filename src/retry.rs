//! Replays buffered, non-streaming upstream requests on transport failure or
//! a 5xx response.
//!
//! The backoff formula is the teacher's `TierRetryConfig::backoff_duration`
//! verbatim: `base_backoff_ms * multiplier^attempt`, capped at
//! `max_backoff_ms`. This proxy has a single upstream, not a tier ladder, so
//! there is one retry config rather than one per tier.

use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_max_response_bytes")]
    pub max_response_bytes: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_backoff_ms: default_base_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
            max_response_bytes: default_max_response_bytes(),
        }
    }
}

fn default_max_retries() -> usize {
    3
}
fn default_base_backoff_ms() -> u64 {
    100
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_max_backoff_ms() -> u64 {
    10_000
}
fn default_max_response_bytes() -> usize {
    64 * 1024 * 1024
}

impl RetryConfig {
    pub fn backoff_duration(&self, attempt: usize) -> Duration {
        let delay_ms = self.base_backoff_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let clamped_ms = delay_ms.min(self.max_backoff_ms as f64) as u64;
        Duration::from_millis(clamped_ms)
    }
}

/// A non-streaming request is retry-eligible only when the client did not
/// ask to stream: once bytes have started flowing to the client, a retry
/// would duplicate output it has already seen.
pub fn is_retry_eligible(retry_enabled: bool, client_requested_stream: bool) -> bool {
    retry_enabled && !client_requested_stream
}

#[derive(Debug)]
pub struct RetryOutcome {
    pub response: Option<reqwest::Response>,
    pub body_bytes: Option<Bytes>,
    pub attempts: usize,
    pub last_error: Option<String>,
    pub too_large: bool,
}

fn should_retry_status(status: reqwest::StatusCode) -> bool {
    status.is_server_error()
}

/// Execute `method url` with `body` up to `config.max_retries + 1` times,
/// replaying the exact buffered body bytes on each attempt. Retries on
/// transport errors or 5xx responses; never retries 4xx; aborts early if
/// `cancel` fires, whether mid-request or during the backoff sleep.
pub async fn do_with_retry(
    client: &reqwest::Client,
    cancel: &CancellationToken,
    url: &str,
    method: reqwest::Method,
    body: Bytes,
    headers: reqwest::header::HeaderMap,
    config: &RetryConfig,
) -> RetryOutcome {
    let mut last_error = None;

    for attempt in 0..=config.max_retries {
        if cancel.is_cancelled() {
            return RetryOutcome {
                response: None,
                body_bytes: None,
                attempts: attempt,
                last_error: last_error.or_else(|| Some("canceled".to_string())),
                too_large: false,
            };
        }

        let request = client
            .request(method.clone(), url)
            .headers(headers.clone())
            .body(body.clone());

        let send_result = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = request.send() => Some(result),
        };

        let Some(send_result) = send_result else {
            return RetryOutcome {
                response: None,
                body_bytes: None,
                attempts: attempt + 1,
                last_error: Some("canceled".to_string()),
                too_large: false,
            };
        };

        match send_result {
            Ok(response) if !should_retry_status(response.status()) => {
                return read_capped_response(response, attempt + 1, config.max_response_bytes).await;
            }
            Ok(response) => {
                warn!(status = %response.status(), attempt, "upstream returned server error, considering retry");
                last_error = Some(format!("upstream status {}", response.status()));
            }
            Err(e) => {
                debug!(error = %e, attempt, "transport error, considering retry");
                last_error = Some(e.to_string());
            }
        }

        if attempt == config.max_retries {
            break;
        }

        let backoff = config.backoff_duration(attempt);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return RetryOutcome {
                    response: None,
                    body_bytes: None,
                    attempts: attempt + 1,
                    last_error,
                    too_large: false,
                };
            }
            _ = tokio::time::sleep(backoff) => {}
        }
    }

    RetryOutcome {
        response: None,
        body_bytes: None,
        attempts: config.max_retries + 1,
        last_error,
        too_large: false,
    }
}

async fn read_capped_response(response: reqwest::Response, attempts: usize, cap: usize) -> RetryOutcome {
    match response.bytes().await {
        Ok(bytes) if bytes.len() > cap => RetryOutcome {
            response: None,
            body_bytes: None,
            attempts,
            last_error: Some(format!("response exceeded {} byte cap", cap)),
            too_large: true,
        },
        Ok(bytes) => RetryOutcome {
            response: None,
            body_bytes: Some(bytes),
            attempts,
            last_error: None,
            too_large: false,
        },
        Err(e) => RetryOutcome {
            response: None,
            body_bytes: None,
            attempts,
            last_error: Some(e.to_string()),
            too_large: false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_matches_teacher_formula() {
        let config = RetryConfig::default();
        assert_eq!(config.backoff_duration(0), Duration::from_millis(100));
        assert_eq!(config.backoff_duration(1), Duration::from_millis(200));
        assert_eq!(config.backoff_duration(2), Duration::from_millis(400));
    }

    #[test]
    fn backoff_caps_at_max() {
        let config = RetryConfig {
            max_retries: 10,
            base_backoff_ms: 100,
            backoff_multiplier: 2.0,
            max_backoff_ms: 1000,
            max_response_bytes: 1024,
        };
        assert_eq!(config.backoff_duration(10), Duration::from_millis(1000));
    }

    #[test]
    fn streaming_requests_are_never_eligible() {
        assert!(!is_retry_eligible(true, true));
        assert!(is_retry_eligible(true, false));
        assert!(!is_retry_eligible(false, false));
    }

    #[tokio::test]
    async fn retries_on_server_error_and_succeeds() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .respond_with(wiremock::ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let cancel = CancellationToken::new();
        let config = RetryConfig {
            max_retries: 3,
            base_backoff_ms: 1,
            backoff_multiplier: 1.0,
            max_backoff_ms: 5,
            max_response_bytes: 1024,
        };

        let outcome = do_with_retry(
            &client,
            &cancel,
            &server.uri(),
            reqwest::Method::POST,
            Bytes::from_static(b"{}"),
            reqwest::header::HeaderMap::new(),
            &config,
        )
        .await;

        assert_eq!(outcome.body_bytes.as_deref(), Some(b"ok".as_slice()));
        assert!(outcome.attempts >= 2);
    }

    #[tokio::test]
    async fn does_not_retry_on_4xx() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .respond_with(wiremock::ResponseTemplate::new(400).set_body_string("bad"))
            .expect(1)
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let cancel = CancellationToken::new();
        let config = RetryConfig {
            max_retries: 3,
            base_backoff_ms: 1,
            backoff_multiplier: 1.0,
            max_backoff_ms: 5,
            max_response_bytes: 1024,
        };

        let outcome = do_with_retry(
            &client,
            &cancel,
            &server.uri(),
            reqwest::Method::POST,
            Bytes::from_static(b"{}"),
            reqwest::header::HeaderMap::new(),
            &config,
        )
        .await;

        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.body_bytes.as_deref(), Some(b"bad".as_slice()));
    }

    #[tokio::test]
    async fn oversized_response_is_flagged_too_large() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_string("0123456789"))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let cancel = CancellationToken::new();
        let config = RetryConfig {
            max_retries: 0,
            base_backoff_ms: 1,
            backoff_multiplier: 1.0,
            max_backoff_ms: 5,
            max_response_bytes: 4,
        };

        let outcome = do_with_retry(
            &client,
            &cancel,
            &server.uri(),
            reqwest::Method::POST,
            Bytes::from_static(b"{}"),
            reqwest::header::HeaderMap::new(),
            &config,
        )
        .await;

        assert!(outcome.too_large);
        assert!(outcome.body_bytes.is_none());
    }

    #[tokio::test]
    async fn cancellation_aborts_before_sending() {
        let client = reqwest::Client::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let config = RetryConfig::default();

        let outcome = do_with_retry(
            &client,
            &cancel,
            "http://127.0.0.1:1",
            reqwest::Method::POST,
            Bytes::from_static(b"{}"),
            reqwest::header::HeaderMap::new(),
            &config,
        )
        .await;

        assert!(outcome.response.is_none());
        assert!(outcome.body_bytes.is_none());
    }
}
