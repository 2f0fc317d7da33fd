//! Transient-failure retry policy and CAS backoff.
//!
//! Only [`StoreError::ConnectionLost`] is retried. Precondition failures and
//! session loss are surfaced on the first attempt. A reconnect observed on
//! the connection-event stream cuts the current sleep short. An attempt that
//! outlives the optional attempt timeout counts as a lost connection.

use std::future::Future;
use std::time::Duration;

use canopy_store::ConnectionState;
use canopy_store::StoreError;
use rand::Rng;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

use crate::constants::CAS_RETRY_INITIAL_BACKOFF_MS;
use crate::constants::CAS_RETRY_MAX_BACKOFF_MS;
use crate::constants::DEFAULT_RETRY_INITIAL_SLEEP_MS;
use crate::constants::DEFAULT_RETRY_MAX_RETRIES;
use crate::constants::DEFAULT_RETRY_MAX_SLEEP_MS;
use crate::error::CoordinationError;

/// Retry tuning shared by every primitive of one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Sleep before the first retry, in milliseconds.
    pub initial_sleep_ms: u64,
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Backoff ceiling, in milliseconds.
    pub max_sleep_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_sleep_ms: DEFAULT_RETRY_INITIAL_SLEEP_MS,
            max_retries: DEFAULT_RETRY_MAX_RETRIES,
            max_sleep_ms: DEFAULT_RETRY_MAX_SLEEP_MS,
        }
    }
}

/// Result of backoff calculation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffResult {
    /// Sleep duration in milliseconds, jitter included.
    pub sleep_ms: u64,
    /// Backoff to feed into the next iteration.
    pub next_backoff_ms: u64,
}

/// Exponential backoff with additive jitter.
///
/// `jitter_seed` is reduced modulo `current_backoff_ms / 2 + 1`, so the sleep
/// never exceeds one and a half times the current backoff.
#[inline]
pub fn compute_backoff_with_jitter(current_backoff_ms: u64, max_backoff_ms: u64, jitter_seed: u64) -> BackoffResult {
    let max_jitter = current_backoff_ms.saturating_div(2).saturating_add(1);
    let jitter = jitter_seed % max_jitter;
    let sleep_ms = current_backoff_ms.saturating_add(jitter);
    let next_backoff_ms = current_backoff_ms.saturating_mul(2).min(max_backoff_ms);
    BackoffResult {
        sleep_ms,
        next_backoff_ms,
    }
}

/// Bounded exponential retry for transient store failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    initial_sleep_ms: u64,
    max_sleep_ms: u64,
    max_retries: u32,
    attempt_timeout: Option<Duration>,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            initial_sleep_ms: config.initial_sleep_ms,
            max_sleep_ms: config.max_sleep_ms.max(config.initial_sleep_ms),
            max_retries: config.max_retries,
            attempt_timeout: None,
        }
    }

    /// Policy that surfaces the first failure.
    pub fn no_retry() -> Self {
        Self {
            initial_sleep_ms: 0,
            max_sleep_ms: 0,
            max_retries: 0,
            attempt_timeout: None,
        }
    }

    /// Give up on a single attempt after `timeout` and treat it as a lost
    /// connection. The abandoned attempt may still have been applied.
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn attempt_timeout(&self) -> Option<Duration> {
        self.attempt_timeout
    }

    /// Base sleep before retry number `attempt` (zero based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(63)).unwrap_or(u64::MAX);
        Duration::from_millis(self.initial_sleep_ms.saturating_mul(factor).min(self.max_sleep_ms))
    }

    fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt).as_millis() as u64;
        let seed = rand::rng().random_range(0..=base / 2);
        Duration::from_millis(compute_backoff_with_jitter(base, self.max_sleep_ms, seed).sleep_ms)
    }

    /// Run `op` until it succeeds, fails non-transiently, or the retry budget
    /// is spent. Exhaustion yields [`CoordinationError::ConnectionLost`]
    /// carrying `operation` and the number of attempts made.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &str,
        mut reconnects: Option<broadcast::Receiver<ConnectionState>>,
        mut op: F,
    ) -> Result<T, CoordinationError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            let outcome = match self.attempt_timeout {
                Some(limit) => match tokio::time::timeout(limit, op()).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        debug!(operation, attempt, timeout_ms = limit.as_millis() as u64, "store attempt timed out");
                        Err(StoreError::ConnectionLost)
                    }
                },
                None => op().await,
            };
            match outcome {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.max_retries => {
                    let delay = self.jittered_delay(attempt);
                    attempt += 1;
                    debug!(operation, attempt, delay_ms = delay.as_millis() as u64, "transient store failure, retrying");
                    pause(delay, reconnects.as_mut()).await;
                }
                Err(StoreError::ConnectionLost) => {
                    return Err(CoordinationError::ConnectionLost {
                        operation: operation.to_string(),
                        attempts: attempt + 1,
                    });
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&RetryConfig::default())
    }
}

async fn pause(delay: Duration, reconnects: Option<&mut broadcast::Receiver<ConnectionState>>) {
    match reconnects {
        Some(rx) => {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wait_for_reconnect(rx) => {}
            }
        }
        None => tokio::time::sleep(delay).await,
    }
}

async fn wait_for_reconnect(rx: &mut broadcast::Receiver<ConnectionState>) {
    loop {
        match rx.recv().await {
            Ok(state) if state.is_connected() => return,
            Ok(_) | Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}

/// Sleep between optimistic CAS attempts, growing with `attempt`.
pub(crate) async fn cas_backoff(attempt: u32) {
    let mut backoff = CAS_RETRY_INITIAL_BACKOFF_MS;
    for _ in 1..attempt.min(16) {
        backoff = compute_backoff_with_jitter(backoff, CAS_RETRY_MAX_BACKOFF_MS, 0).next_backoff_ms;
    }
    let seed = rand::rng().random_range(0..=backoff);
    let sleep_ms = compute_backoff_with_jitter(backoff, CAS_RETRY_MAX_BACKOFF_MS, seed).sleep_ms;
    tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
}
