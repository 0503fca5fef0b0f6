//! Timeout utilities for page operations
//!
//! Every navigation and polling step carries its own deadline so a hung page
//! fails its task alone instead of stalling the batch.

use std::future::Future;
use std::time::Duration;

use crate::driver::{DriverError, DriverResult};

/// Run `operation` with an explicit deadline.
///
/// # Returns
/// * `Ok(T)` - operation completed in time
/// * `Err(DriverError::Timeout)` - deadline reached
/// * `Err(other)` - the operation itself failed
pub async fn with_timeout<F, T>(operation: F, timeout: Duration, operation_name: &str) -> DriverResult<T>
where
    F: Future<Output = DriverResult<T>>,
{
    match tokio::time::timeout(timeout, operation).await {
        Ok(result) => result,
        Err(_) => Err(DriverError::Timeout {
            operation: operation_name.to_string(),
            timeout,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::ErrorClass;

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_classified() {
        let result: DriverResult<()> = with_timeout(
            async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            },
            Duration::from_secs(1),
            "slow op",
        )
        .await;
        let err = result.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Timeout);
        assert!(err.to_string().contains("slow op"));
    }

    #[tokio::test]
    async fn test_inner_error_passes_through() {
        let result: DriverResult<()> = with_timeout(
            async { Err(DriverError::Script("boom".into())) },
            Duration::from_secs(1),
            "op",
        )
        .await;
        assert_eq!(result.unwrap_err().class(), ErrorClass::Script);
    }
}
