//! Wiederholte Schreibvorgänge in den Record-Store

use super::sync::SignalingError;
use crate::config::RetryPolicy;
use crate::record::StoreError;
use std::future::Future;

/// Führt `op` aus und wiederholt transiente Fehler mit Backoff
///
/// `NotFound` ist nicht transient und wird sofort zurückgegeben. Nach dem
/// letzten Versuch wird `SignalingUnavailable` gemeldet.
pub async fn with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T, SignalingError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        let delay = policy.backoff_for(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!("Record write '{}' succeeded on attempt {}", what, attempt);
                }
                return Ok(value);
            }
            Err(StoreError::NotFound(id)) => {
                return Err(SignalingError::Store(StoreError::NotFound(id)));
            }
            Err(e) => {
                tracing::warn!(
                    "Record write '{}' failed (attempt {}/{}): {}",
                    what,
                    attempt,
                    attempts,
                    e
                );
                last_error = Some(e);
            }
        }
    }

    tracing::error!("Record write '{}' gave up after {} attempts", what, attempts);
    Err(SignalingError::SignalingUnavailable {
        attempts,
        last_error: last_error.map(|e| e.to_string()).unwrap_or_default(),
    })
}
