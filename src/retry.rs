// Copyright 2026 The Busgate Project
// SPDX-License-Identifier: Apache-2.0

// Bounded retry with exponential backoff for control-plane calls.
//
// Every attempt is bounded by its own timeout. All attempt failures are
// retryable; only the last one is surfaced.

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, timeout};

use crate::config::RetryConfig;
use crate::error::GatewayError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryConfig::default().into()
    }
}

impl From<RetryConfig> for RetryPolicy {
    fn from(config: RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: config.base_delay,
            attempt_timeout: config.attempt_timeout,
        }
    }
}

impl RetryPolicy {
    /// Wait after failed attempt `attempt` (1-based): base * 2^(attempt-1),
    /// i.e. 2s, 4s, 8s... with the default base.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    /// Run `operation` until it succeeds or attempts run out.
    ///
    /// `operation` receives the 1-based attempt number. `label` names the
    /// call in logs and in the final error message.
    pub async fn run<F, Fut, T>(&self, label: &str, mut operation: F) -> Result<T, GatewayError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            let outcome = match timeout(self.attempt_timeout, operation(attempt)).await {
                Ok(result) => result,
                Err(_) => Err(GatewayError::upstream(
                    None,
                    format!("timed out after {}ms", self.attempt_timeout.as_millis()),
                )),
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(err) => {
                    tracing::warn!(
                        call = label,
                        attempt,
                        max_attempts = attempts,
                        error = %err,
                        "control-plane attempt failed"
                    );
                    last_error = Some(err);
                }
            }

            if attempt < attempts {
                sleep(self.delay_after(attempt)).await;
            }
        }

        Err(match last_error {
            Some(GatewayError::UpstreamUnavailable { status, message }) => GatewayError::upstream(
                status,
                format!("{label} failed after {attempts} attempts: {message}"),
            ),
            Some(other) => other,
            None => GatewayError::upstream(None, format!("{label} was not attempted")),
        })
    }
}
