//! Fail-open utilities for graceful degradation
//!
//! Use this for infrastructure work that must never abort a synthesis run,
//! such as persisting loop memory to disk.
//!
//! DO NOT use fail-open for:
//! - Model calls (business logic)
//! - Guardrail or risk checks (correctness)
//! - Durable memory loads (a corrupt artifact is a hard error)

use std::future::Future;
use tracing::warn;

use crate::Result;

/// Execute an operation that should fail open
///
/// Logs the error via `tracing::warn!` on failure and returns `None`.
///
/// ```no_run
/// use flowsmith_core::fail_open::fail_open;
/// use flowsmith_core::Result;
///
/// async fn append_progress() -> Result<()> {
///     Ok(())
/// }
///
/// async fn example() {
///     let appended = fail_open("progress_log", || append_progress()).await;
///     // appended is None if append_progress() failed
/// }
/// ```
pub async fn fail_open<F, Fut, T>(operation_name: &str, f: F) -> Option<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match f().await {
        Ok(val) => Some(val),
        Err(e) => {
            warn!("{} failed (fail-open): {}", operation_name, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FlowError;

    #[tokio::test]
    async fn test_fail_open_success() {
        let result = fail_open("test_op", || async { Ok::<_, FlowError>(42) }).await;
        assert_eq!(result, Some(42));
    }

    #[tokio::test]
    async fn test_fail_open_failure() {
        let result = fail_open("test_op", || async {
            Err::<i32, _>(FlowError::Other("disk full".to_string()))
        })
        .await;
        assert_eq!(result, None);
    }
}
