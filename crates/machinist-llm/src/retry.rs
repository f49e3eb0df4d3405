use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use tracing::warn;

use machinist_core::config::{ModelConfig, RetryConfig};
use machinist_core::error::{MachinistError, Result};
use machinist_core::traits::LlmClient;
use machinist_core::types::ChatMessage;

/// An LLM client that retries failed requests with exponential backoff.
pub struct RetryingClient {
    inner: Box<dyn LlmClient>,
    retry_config: RetryConfig,
}

impl RetryingClient {
    pub fn new(inner: Box<dyn LlmClient>, retry_config: RetryConfig) -> Self {
        Self {
            inner,
            retry_config,
        }
    }
}

fn is_retryable(e: &MachinistError) -> bool {
    match e {
        MachinistError::LlmRequest(msg) => {
            msg.contains("429")
                || msg.contains("500")
                || msg.contains("502")
                || msg.contains("503")
                || msg.contains("timeout")
                || msg.contains("connection")
        }
        MachinistError::LlmStream(_) => true,
        _ => false,
    }
}

fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let ms = (config.initial_backoff_ms * 2u64.pow(attempt)).min(config.max_backoff_ms);
    // Add jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

impl LlmClient for RetryingClient {
    fn complete(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<String>> {
        let config = config.clone();
        Box::pin(async move {
            let max_retries = self.retry_config.max_retries;
            let mut last_err = None;

            for attempt in 0..=max_retries {
                match self.inner.complete(&config, messages.clone()).await {
                    Ok(text) => return Ok(text),
                    Err(e) => {
                        if is_retryable(&e) && attempt < max_retries {
                            let backoff = calculate_backoff(attempt, &self.retry_config);
                            warn!(
                                attempt = attempt + 1,
                                max_retries,
                                backoff_ms = backoff.as_millis() as u64,
                                error = %e,
                                "Retrying LLM request"
                            );
                            tokio::time::sleep(backoff).await;
                            last_err = Some(e);
                            continue;
                        }
                        return Err(e);
                    }
                }
            }

            Err(last_err
                .unwrap_or_else(|| MachinistError::LlmRequest("retries exhausted".into())))
        })
    }

    fn stream_complete(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<String>>>> {
        let config = config.clone();
        Box::pin(async move {
            let max_retries = self.retry_config.max_retries;
            let mut last_err = None;

            // Only the connection attempt is retried; once a stream is open,
            // mid-stream errors surface to the consumer.
            for attempt in 0..=max_retries {
                match self.inner.stream_complete(&config, messages.clone()).await {
                    Ok(stream) => return Ok(stream),
                    Err(e) => {
                        if is_retryable(&e) && attempt < max_retries {
                            let backoff = calculate_backoff(attempt, &self.retry_config);
                            warn!(
                                attempt = attempt + 1,
                                max_retries,
                                backoff_ms = backoff.as_millis() as u64,
                                error = %e,
                                "Retrying LLM stream request"
                            );
                            tokio::time::sleep(backoff).await;
                            last_err = Some(e);
                            continue;
                        }
                        return Err(e);
                    }
                }
            }

            Err(last_err
                .unwrap_or_else(|| MachinistError::LlmRequest("retries exhausted".into())))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(is_retryable(&MachinistError::LlmRequest(
            "503 Service Unavailable".into()
        )));
        assert!(is_retryable(&MachinistError::LlmRequest(
            "connection refused".into()
        )));
        assert!(is_retryable(&MachinistError::LlmStream("cut off".into())));
        assert!(!is_retryable(&MachinistError::LlmRequest(
            "401 Unauthorized".into()
        )));
        assert!(!is_retryable(&MachinistError::LlmParse("bad json".into())));
    }

    #[test]
    fn test_backoff_capped() {
        let config = RetryConfig {
            max_retries: 10,
            initial_backoff_ms: 1000,
            max_backoff_ms: 4000,
        };
        // 2^6 * 1000 would be 64s; the cap plus jitter keeps it under 4.8s.
        let backoff = calculate_backoff(6, &config);
        assert!(backoff <= Duration::from_millis(4800));
    }
}
