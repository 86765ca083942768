use std::time::Duration;

use crate::error::TransportError;

/// Wrap a pending operation, failing it after `ms` milliseconds.
///
/// Integration-boundary helper only; the crank loop never races a clock.
pub async fn with_timeout<F: Future>(fut: F, ms: u64) -> Result<F::Output, TransportError> {
    let limit = Duration::from_millis(ms);
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| TransportError::Timeout(limit))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn passes_through_fast_futures() {
        let out = with_timeout(async { 7 }, 10).await.unwrap();
        assert_eq!(out, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn fails_slow_futures() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        };
        assert!(matches!(
            with_timeout(slow, 50).await,
            Err(TransportError::Timeout(_))
        ));
    }
}
