//! Caller deadlines for external calls

use crate::error::{ObsearchError, Result};
use std::future::Future;
use std::time::Duration;

/// Run `fut`, failing with [`ObsearchError::Timeout`] if it outlives `limit`
pub async fn with_deadline<T, F>(operation: &str, limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!("{} exceeded its deadline of {:?}", operation, limit);
            Err(ObsearchError::Timeout {
                operation: operation.to_string(),
                after: limit,
            })
        }
    }
}

/// Run blocking work (SQLite) on the blocking pool under a deadline
pub async fn blocking_with_deadline<T, F>(operation: &str, limit: Duration, work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let op = operation.to_string();
    with_deadline(operation, limit, async move {
        tokio::task::spawn_blocking(work)
            .await
            .map_err(|e| ObsearchError::Other(anyhow::anyhow!("{} task panicked: {}", op, e)))?
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_deadline_expires() {
        let result: Result<()> = with_deadline("slow call", Duration::from_millis(20), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        match result {
            Err(ObsearchError::Timeout { operation, .. }) => assert_eq!(operation, "slow call"),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_blocking_passes_value() {
        let value = blocking_with_deadline("sum", Duration::from_secs(1), || Ok(2 + 2))
            .await
            .unwrap();
        assert_eq!(value, 4);
    }
}
