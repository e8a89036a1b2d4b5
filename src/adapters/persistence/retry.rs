//! Retry layer for transient store failures.
//!
//! Both dialects can surface "busy"/"locked" (embedded store under a
//! concurrent writer) or dropped connections (client/server store). Writes
//! retry with exponential backoff; anything else propagates immediately.

use crate::domain::DomainError;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

const MAX_RETRIES: u32 = 5;
const INITIAL_DELAY: Duration = Duration::from_millis(100);
const MAX_DELAY: Duration = Duration::from_secs(2);

/// Map an infrastructure error into the domain, classifying transient
/// failures by message the way both drivers report them.
pub fn map_store_err(e: impl Display) -> DomainError {
    let text = e.to_string();
    let lower = text.to_lowercase();
    if lower.contains("locked") || lower.contains("busy") || lower.contains("connection") {
        DomainError::StoreBusy(text)
    } else {
        DomainError::Store(text)
    }
}

/// Run `op`, retrying transient failures up to 5 times with exponential
/// backoff (100 ms, x2, capped at 2 s).
pub async fn with_retry<T, F, Fut>(op_name: &str, mut op: F) -> Result<T, DomainError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DomainError>>,
{
    let mut delay = INITIAL_DELAY;
    let mut last = None;
    for attempt in 0..=MAX_RETRIES {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => {
                if attempt < MAX_RETRIES {
                    warn!(
                        op = op_name,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient store error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(MAX_DELAY);
                }
                last = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    error!(op = op_name, retries = MAX_RETRIES, "store operation gave up");
    Err(last.expect("retry loop always records an error"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counted = Arc::clone(&calls);
        let result = with_retry("test", move || {
            let counted = Arc::clone(&counted);
            async move {
                if counted.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(DomainError::StoreBusy("database is locked".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_five_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let counted = Arc::clone(&calls);
        let result: Result<(), _> = with_retry("test", move || {
            let counted = Arc::clone(&counted);
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
                Err(DomainError::StoreBusy("connection reset".into()))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 6); // first try + 5 retries
    }

    #[tokio::test]
    async fn permanent_errors_fail_fast() {
        let calls = Arc::new(AtomicU32::new(0));
        let counted = Arc::clone(&calls);
        let result: Result<(), _> = with_retry("test", move || {
            let counted = Arc::clone(&counted);
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
                Err(DomainError::Store("syntax error".into()))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn classification_by_driver_message() {
        assert!(map_store_err("database is locked").is_transient());
        assert!(map_store_err("SQLITE_BUSY").is_transient());
        assert!(map_store_err("connection closed unexpectedly").is_transient());
        assert!(!map_store_err("no such table: messages").is_transient());
    }
}
