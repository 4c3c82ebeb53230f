//! Retry + circuit breaker wrapper around any [`LlmProvider`].
//!
//! [`ResilientProvider`] decorates a provider with:
//! - exponential backoff retry on rate-limit (HTTP 429) and transient
//!   network/timeout errors, up to [`MAX_RETRIES`] attempts
//! - a circuit breaker that opens after consecutive failures and fails
//!   fast (without retrying or making a request) until a cooldown elapses
//!
//! Only the initial request is retried — once a `chat_stream` stream has
//! started yielding events, a mid-stream error is returned to the caller
//! as-is, since partial output may already have been surfaced.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use sa_domain::capability::LlmCapabilities;
use sa_domain::error::{Error, Result};
use sa_domain::stream::BoxStream;

use crate::traits::{ChatRequest, ChatResponse, EmbeddingsRequest, EmbeddingsResponse, LlmProvider};

const MAX_RETRIES: u32 = 3;
const BASE_BACKOFF: Duration = Duration::from_millis(500);
const FAILURE_THRESHOLD: u32 = 5;
const COOLDOWN: Duration = Duration::from_secs(20);

/// Whether an error is worth retrying: rate limits, timeouts, and
/// transient network/HTTP failures. Anything else (auth, bad request,
/// config) is returned immediately.
fn is_retryable(err: &Error) -> bool {
    match err {
        Error::Timeout(_) | Error::Http(_) => true,
        Error::Provider { message, .. } => {
            message.contains("429")
                || message.contains("rate limit")
                || message.contains("HTTP 500")
                || message.contains("HTTP 502")
                || message.contains("HTTP 503")
                || message.contains("HTTP 504")
        }
        _ => false,
    }
}

#[derive(Clone, Copy)]
enum BreakerState {
    Closed { consecutive_failures: u32 },
    Open { opened_at: Instant },
}

struct Breaker {
    state: Mutex<BreakerState>,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: Mutex::new(BreakerState::Closed {
                consecutive_failures: 0,
            }),
        }
    }

    /// Returns `true` if a call should be allowed through right now.
    /// Transitions `Open` -> half-open (treated as allowed, one probe)
    /// once the cooldown has elapsed.
    fn allow(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            BreakerState::Closed { .. } => true,
            BreakerState::Open { opened_at } => {
                if opened_at.elapsed() >= COOLDOWN {
                    *state = BreakerState::Closed {
                        consecutive_failures: FAILURE_THRESHOLD - 1,
                    };
                    true
                } else {
                    false
                }
            }
        }
    }

    fn record(&self, succeeded: bool) {
        let mut state = self.state.lock();
        *state = if succeeded {
            BreakerState::Closed {
                consecutive_failures: 0,
            }
        } else {
            match *state {
                BreakerState::Closed { consecutive_failures } => {
                    let failures = consecutive_failures + 1;
                    if failures >= FAILURE_THRESHOLD {
                        BreakerState::Open {
                            opened_at: Instant::now(),
                        }
                    } else {
                        BreakerState::Closed {
                            consecutive_failures: failures,
                        }
                    }
                }
                BreakerState::Open { .. } => BreakerState::Open {
                    opened_at: Instant::now(),
                },
            }
        };
    }
}

/// Wraps an [`LlmProvider`] with retry-with-backoff and a circuit breaker.
pub struct ResilientProvider {
    inner: Arc<dyn LlmProvider>,
    breaker: Breaker,
}

impl ResilientProvider {
    pub fn new(inner: Arc<dyn LlmProvider>) -> Self {
        Self {
            inner,
            breaker: Breaker::new(),
        }
    }

    fn circuit_open_err(&self) -> Error {
        Error::Provider {
            provider: self.inner.provider_id().to_string(),
            message: "circuit open: too many recent failures, cooling down".into(),
        }
    }

    async fn call_with_retry<F, Fut, T>(&self, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        if !self.breaker.allow() {
            return Err(self.circuit_open_err());
        }

        let mut attempt = 0;
        loop {
            match f().await {
                Ok(v) => {
                    self.breaker.record(true);
                    return Ok(v);
                }
                Err(e) => {
                    let retryable = is_retryable(&e);
                    if !retryable || attempt >= MAX_RETRIES {
                        self.breaker.record(false);
                        return Err(e);
                    }
                    let backoff = BASE_BACKOFF * 2u32.pow(attempt);
                    tracing::warn!(
                        provider = %self.inner.provider_id(),
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "retrying LLM request after transient error"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl LlmProvider for ResilientProvider {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse> {
        self.call_with_retry(|| self.inner.chat(req.clone())).await
    }

    async fn chat_stream(&self, req: ChatRequest) -> Result<BoxStream<'static, Result<sa_domain::stream::StreamEvent>>> {
        // Only the connection/initial-response phase is retried; once the
        // stream itself starts, errors pass through to the caller.
        self.call_with_retry(|| self.inner.chat_stream(req.clone()))
            .await
    }

    async fn embeddings(&self, req: EmbeddingsRequest) -> Result<EmbeddingsResponse> {
        self.call_with_retry(|| self.inner.embeddings(req.clone()))
            .await
    }

    fn capabilities(&self) -> &LlmCapabilities {
        self.inner.capabilities()
    }

    fn provider_id(&self) -> &str {
        self.inner.provider_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sa_domain::capability::LlmCapabilities;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyProvider {
        calls: AtomicU32,
        fail_times: u32,
        caps: LlmCapabilities,
    }

    #[async_trait::async_trait]
    impl LlmProvider for FlakyProvider {
        async fn chat(&self, _req: ChatRequest) -> Result<ChatResponse> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                Err(Error::Provider {
                    provider: "flaky".into(),
                    message: "HTTP 429 - rate limited".into(),
                })
            } else {
                Ok(ChatResponse {
                    content: "ok".into(),
                    tool_calls: vec![],
                    usage: None,
                    model: "flaky-model".into(),
                    finish_reason: Some("stop".into()),
                })
            }
        }

        async fn chat_stream(
            &self,
            _req: ChatRequest,
        ) -> Result<BoxStream<'static, Result<sa_domain::stream::StreamEvent>>> {
            unimplemented!()
        }

        async fn embeddings(&self, _req: EmbeddingsRequest) -> Result<EmbeddingsResponse> {
            unimplemented!()
        }

        fn capabilities(&self) -> &LlmCapabilities {
            &self.caps
        }

        fn provider_id(&self) -> &str {
            "flaky"
        }
    }

    #[tokio::test]
    async fn retries_transient_errors_then_succeeds() {
        let inner = Arc::new(FlakyProvider {
            calls: AtomicU32::new(0),
            fail_times: 2,
            caps: LlmCapabilities::default(),
        });
        let resilient = ResilientProvider::new(inner);
        let resp = resilient.chat(ChatRequest::default()).await.unwrap();
        assert_eq!(resp.content, "ok");
    }

    #[tokio::test]
    async fn opens_circuit_after_repeated_failures() {
        let inner = Arc::new(FlakyProvider {
            calls: AtomicU32::new(0),
            fail_times: 1000,
            caps: LlmCapabilities::default(),
        });
        let resilient = ResilientProvider::new(inner);

        // Each call retries MAX_RETRIES+1 times, all failing, counting as
        // one breaker failure per call.
        for _ in 0..FAILURE_THRESHOLD {
            assert!(resilient.chat(ChatRequest::default()).await.is_err());
        }

        let err = resilient.chat(ChatRequest::default()).await.unwrap_err();
        assert!(err.to_string().contains("circuit open"));
    }
}
