use std::future::Future;
use std::time::Duration;

use arbor_types::ChatOutcome;

use crate::ProviderError;

const BASE_DELAY: Duration = Duration::from_millis(500);
const MAX_DELAY: Duration = Duration::from_secs(4);
const MAX_ATTEMPTS: u32 = 3;

/// Delays slept between attempts: base 500ms doubling, capped at 4s.
pub fn backoff_delays(attempts: u32) -> Vec<Duration> {
    let mut delays = Vec::new();
    let mut delay = BASE_DELAY;
    for _ in 1..attempts {
        delays.push(delay);
        delay = (delay * 2).min(MAX_DELAY);
    }
    delays
}

/// Retry transient provider failures. Non-retryable errors surface at once.
pub(crate) async fn with_backoff<F, Fut>(mut call: F) -> Result<ChatOutcome, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<ChatOutcome, ProviderError>>,
{
    let mut delay = BASE_DELAY;
    let mut attempt = 1;
    loop {
        match call().await {
            Ok(outcome) => return Ok(outcome),
            Err(err) if err.retryable && attempt < MAX_ATTEMPTS => {
                tracing::warn!(
                    attempt,
                    kind = err.kind.as_str(),
                    "provider call failed, retrying after {:?}",
                    delay
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(MAX_DELAY);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ProviderErrorKind;
    use arbor_types::{TokenSource, TokenUsage};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn outcome() -> ChatOutcome {
        ChatOutcome {
            provider: "test".to_string(),
            model: "m".to_string(),
            content: "ok".to_string(),
            usage: TokenUsage::new(1, 1, TokenSource::Estimated),
            prompt_messages: Vec::new(),
            elapsed_ms: 0,
        }
    }

    #[test]
    fn backoff_schedule_doubles_and_caps() {
        let delays = backoff_delays(3);
        assert_eq!(
            delays,
            vec![Duration::from_millis(500), Duration::from_secs(1)]
        );
        let long = backoff_delays(6);
        assert_eq!(*long.last().unwrap(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_errors_up_to_three_attempts() {
        let calls = AtomicU32::new(0);
        let result = with_backoff(|| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ProviderError::new(
                        ProviderErrorKind::Transport,
                        "connection reset",
                    ))
                } else {
                    Ok(outcome())
                }
            }
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result = with_backoff(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ProviderError::new(ProviderErrorKind::Timeout, "deadline")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn auth_errors_do_not_retry() {
        let calls = AtomicU32::new(0);
        let result = with_backoff(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ProviderError::new(ProviderErrorKind::Auth, "bad key")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
