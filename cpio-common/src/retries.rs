// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Golem Source License v1.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://license.golem.cloud/LICENSE
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::metrics::external_calls::{record_external_call_failure, record_external_call_retry};

/// Computes the delay to wait before the attempt following `attempt`
/// (1-based). Returns `None` once the attempt budget is exhausted.
pub fn get_delay(config: &RetryConfig, attempt: u32) -> Option<Duration> {
    if attempt >= config.max_attempts {
        return None;
    }
    let base = config
        .min_delay
        .mul_f64(config.multiplier.powi(attempt as i32 - 1))
        .min(config.max_delay);
    let delay = match config.max_jitter_factor {
        Some(max_jitter_factor) if max_jitter_factor > 0.0 => {
            let jitter = rand::rng().random_range(0.0..max_jitter_factor);
            base.mul_f64(1.0 + jitter).min(config.max_delay)
        }
        _ => base,
    };
    Some(delay)
}

/// Invokes `action` until it succeeds, fails with a non-retriable error, or
/// the attempt budget of `config` runs out. The last error is returned
/// unchanged in the failure cases, so callers see the ultimate failure code
/// whether or not it was retried.
///
/// `target_label` and `op_label` name the collaborator and the operation for
/// logs and metrics; `op_id` optionally identifies the affected entity.
pub async fn with_retries<In, F, G, R, E>(
    target_label: &'static str,
    op_label: &'static str,
    op_id: Option<String>,
    config: &RetryConfig,
    i: &In,
    action: F,
    is_retriable: G,
) -> Result<R, E>
where
    F: for<'a> Fn(&'a In) -> Pin<Box<dyn Future<Output = Result<R, E>> + 'a + Send>>,
    G: Fn(&E) -> bool,
    E: Display,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match action(i).await {
            Ok(result) => return Ok(result),
            Err(error) if is_retriable(&error) => match get_delay(config, attempt) {
                Some(delay) => {
                    debug!(
                        target_label,
                        op_label,
                        ?op_id,
                        attempt,
                        %error,
                        "operation failed with a retriable error, retrying in {delay:?}"
                    );
                    record_external_call_retry(target_label, op_label);
                    tokio::time::sleep(delay).await;
                }
                None => {
                    warn!(
                        target_label,
                        op_label,
                        ?op_id,
                        attempt,
                        %error,
                        "operation failed with a retriable error, no attempts left"
                    );
                    record_external_call_failure(target_label, op_label);
                    return Err(error);
                }
            },
            Err(error) => {
                record_external_call_failure(target_label, op_label);
                return Err(error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use test_r::test;

    use super::*;

    #[derive(Debug)]
    enum TestError {
        Retriable,
        Fatal,
    }

    impl Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                TestError::Retriable => write!(f, "retriable"),
                TestError::Fatal => write!(f, "fatal"),
            }
        }
    }

    fn test_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            min_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(16),
            multiplier: 2.0,
            max_jitter_factor: None,
        }
    }

    #[test]
    fn delays_grow_exponentially_up_to_the_cap() {
        let config = RetryConfig {
            max_attempts: 6,
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_jitter_factor: None,
        };
        let delays: Vec<_> = (1..6).map(|n| get_delay(&config, n).unwrap()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(500),
                Duration::from_millis(500),
            ]
        );
        assert_eq!(get_delay(&config, 6), None);
    }

    #[test]
    async fn total_attempts_are_bounded_by_the_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<(), TestError> = with_retries(
            "test",
            "always-retriable",
            None,
            &test_config(4),
            &calls.clone(),
            |calls| {
                let calls = calls.clone();
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(TestError::Retriable)
                })
            },
            |error| matches!(error, TestError::Retriable),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    async fn attempts_stop_after_the_first_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<u32, TestError> = with_retries(
            "test",
            "succeeds-on-third",
            None,
            &test_config(5),
            &calls.clone(),
            |calls| {
                let calls = calls.clone();
                Box::pin(async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err(TestError::Retriable)
                    } else {
                        Ok(n)
                    }
                })
            },
            |error| matches!(error, TestError::Retriable),
        )
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    async fn fatal_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<(), TestError> = with_retries(
            "test",
            "fatal",
            None,
            &test_config(5),
            &calls.clone(),
            |calls| {
                let calls = calls.clone();
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(TestError::Fatal)
                })
            },
            |error| matches!(error, TestError::Retriable),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
