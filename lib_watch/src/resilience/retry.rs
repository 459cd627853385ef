//! Exponential backoff schedule used by the reconnect recovery action.

use std::future::Future;
use std::time::Duration;

use rand::Rng as _;
use serde::Deserialize;

use crate::error::{CoreError, CoreResult};

/// Backoff schedule: delay grows geometrically from `base_delay_ms` up to
/// `max_delay_ms`, with a small random jitter so parallel clients do not
/// reconnect in lockstep.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt` (zero-based). Attempt 0 runs
    /// immediately.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let base = self.base_delay_ms as f64 * self.multiplier.powi(attempt as i32 - 1);
        let capped = base.min(self.max_delay_ms as f64);
        let jitter = rand::rng().random_range(0.0..0.1) * capped;
        Duration::from_millis((capped + jitter) as u64)
    }
}

/// Drives `op` until it succeeds or the attempt ceiling is hit. Each failed
/// attempt is logged; the final error is wrapped so the caller sees how many
/// attempts were burned.
pub async fn run_with_retry<T, F, Fut>(
    label: &str,
    policy: &RetryPolicy,
    mut op: F,
) -> CoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = CoreResult<T>>,
{
    let mut last_err = None;
    for attempt in 0..policy.max_attempts.max(1) {
        let delay = policy.delay_for(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match op().await {
            Ok(v) => {
                if attempt > 0 {
                    log::info!("'{}' succeeded on attempt {}", label, attempt + 1);
                }
                return Ok(v);
            }
            Err(e) => {
                log::warn!("'{}' attempt {} failed: {}", label, attempt + 1, e);
                last_err = Some(e);
            }
        }
    }
    let reason = last_err
        .map(|e| e.to_string())
        .unwrap_or_else(|| "no attempts made".to_string());
    Err(CoreError::RecoveryFailed {
        action: label.to_string(),
        reason: format!(
            "gave up after {} attempts: {}",
            policy.max_attempts.max(1),
            reason
        ),
    })
}
