//! Bounded-concurrency transfer of assets to the destination store.

use crate::error::{RelayError, Result};
use crate::models::{AssetDescriptor, TransferOutcome};
use crate::retry::{retry_async, RetryPolicy};
use crate::store::{DestinationStore, UploadOptions};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info, warn};

/// Receives each resolved outcome inside the task that produced it.
#[async_trait]
pub trait OutcomeSink: Send + Sync {
    async fn record(&self, outcome: TransferOutcome) -> Result<()>;
}

/// Counts for one transfer run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferSummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Uploads assets with at most `concurrency` transfers in flight.
pub struct TransferExecutor {
    destination: Arc<dyn DestinationStore>,
    concurrency: usize,
    retry: RetryPolicy,
}

impl TransferExecutor {
    pub fn new(destination: Arc<dyn DestinationStore>, concurrency: usize, retry: RetryPolicy) -> Self {
        Self {
            destination,
            concurrency: concurrency.max(1),
            retry,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Transfer every asset from `assets`, handing outcomes to `sink`.
    ///
    /// An enumeration error stops admission; in-flight transfers still
    /// complete and are recorded before the error is returned. A sink error
    /// is handled the same way.
    pub async fn run<S>(&self, assets: S, sink: Arc<dyn OutcomeSink>) -> Result<TransferSummary>
    where
        S: Stream<Item = Result<AssetDescriptor>> + Send,
    {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks: JoinSet<Result<bool>> = JoinSet::new();
        let mut summary = TransferSummary::default();
        let mut fatal: Option<RelayError> = None;

        futures::pin_mut!(assets);
        while let Some(item) = assets.next().await {
            while let Some(joined) = tasks.try_join_next() {
                absorb(joined, &mut summary, &mut fatal);
            }
            if fatal.is_some() {
                break;
            }

            let asset = match item {
                Ok(asset) => asset,
                Err(e) => {
                    error!("Enumeration failed, draining in-flight transfers: {}", e);
                    fatal = Some(e);
                    break;
                }
            };

            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .map_err(|_| RelayError::Other("transfer pool closed".to_string()))?;
            summary.attempted += 1;

            let destination = Arc::clone(&self.destination);
            let retry = self.retry.clone();
            let sink = Arc::clone(&sink);
            tasks.spawn(async move {
                let _permit = permit;
                let outcome = transfer_one(destination.as_ref(), &retry, &asset).await;
                let ok = outcome.is_ok();
                sink.record(outcome).await?;
                Ok(ok)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            absorb(joined, &mut summary, &mut fatal);
        }

        info!(
            "Transfer finished: {} attempted, {} ok, {} failed",
            summary.attempted, summary.succeeded, summary.failed
        );

        match fatal {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }
}

fn absorb(
    joined: std::result::Result<Result<bool>, JoinError>,
    summary: &mut TransferSummary,
    fatal: &mut Option<RelayError>,
) {
    match joined {
        Ok(Ok(true)) => summary.succeeded += 1,
        Ok(Ok(false)) => summary.failed += 1,
        Ok(Err(e)) => {
            error!("Failed to record transfer outcome: {}", e);
            fatal.get_or_insert(e);
        }
        Err(e) => {
            error!("Transfer task panicked: {}", e);
            fatal.get_or_insert(RelayError::Other(format!("transfer task failed: {}", e)));
        }
    }
}

/// Upload one asset under its own id, retrying transient failures.
///
/// Never fails: exhausted retries and collisions become a `failed` outcome.
pub async fn transfer_one(
    destination: &dyn DestinationStore,
    retry: &RetryPolicy,
    asset: &AssetDescriptor,
) -> TransferOutcome {
    let options = UploadOptions::for_asset(asset);
    let options = &options;

    let (result, stats) = retry_async(
        retry,
        move |_attempt| destination.upload(&asset.source_locator, options),
        |e: &RelayError| e.is_retryable(),
    )
    .await;

    match result {
        Ok(receipt) => {
            info!("OK {} -> {}", asset.id, receipt.locator);
            TransferOutcome::ok(asset, receipt.locator, stats.attempts)
        }
        Err(e) => {
            warn!("FAILED {} after {} attempt(s): {}", asset.id, stats.attempts, e);
            TransferOutcome::failed(asset, e.to_string(), stats.attempts)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TransferStatus;
    use crate::store::MemoryDestination;
    use futures::stream;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Collect(Mutex<Vec<TransferOutcome>>);

    #[async_trait]
    impl OutcomeSink for Collect {
        async fn record(&self, outcome: TransferOutcome) -> Result<()> {
            self.0.lock().unwrap().push(outcome);
            Ok(())
        }
    }

    fn assets(n: usize) -> Vec<Result<AssetDescriptor>> {
        (0..n)
            .map(|i| Ok(AssetDescriptor::new(format!("f/a{}", i), format!("https://old/a{}.jpg", i))))
            .collect()
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::default().with_backoff(crate::retry::Backoff::None)
    }

    #[tokio::test]
    async fn test_concurrency_bound_respected() {
        let dest = Arc::new(MemoryDestination::new("https://new").with_latency(Duration::from_millis(20)));
        let sink = Arc::new(Collect::default());
        let executor = TransferExecutor::new(dest.clone(), 3, fast_retry());

        let summary = executor
            .run(stream::iter(assets(12)), sink.clone())
            .await
            .unwrap();

        assert_eq!(summary, TransferSummary { attempted: 12, succeeded: 12, failed: 0 });
        assert!(dest.peak_in_flight() <= 3);
        assert_eq!(sink.0.lock().unwrap().len(), 12);
    }

    #[tokio::test]
    async fn test_retry_bound_and_failure_recorded() {
        let dest = Arc::new(MemoryDestination::new("https://new"));
        dest.fail_always("f/a0").unwrap();
        let sink = Arc::new(Collect::default());
        let executor = TransferExecutor::new(dest.clone(), 2, fast_retry());

        let summary = executor
            .run(stream::iter(assets(2)), sink.clone())
            .await
            .unwrap();

        assert_eq!(summary.failed, 1);
        assert_eq!(dest.attempts("f/a0"), 3);
        let outcomes = sink.0.lock().unwrap();
        let failed = outcomes.iter().find(|o| o.id == "f/a0").unwrap();
        assert_eq!(failed.status, TransferStatus::Failed);
        assert_eq!(failed.attempts, 3);
        assert!(failed.dest_locator.is_empty());
    }

    #[tokio::test]
    async fn test_collision_is_not_retried() {
        let dest = Arc::new(MemoryDestination::new("https://new"));
        dest.insert_existing("f/a0").unwrap();
        let asset = AssetDescriptor::new("f/a0", "https://old/a0.jpg");

        let outcome = transfer_one(dest.as_ref(), &fast_retry(), &asset).await;
        assert!(!outcome.is_ok());
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.error.contains("already exists"));
    }

    #[tokio::test]
    async fn test_enumeration_error_drains_and_fails() {
        let dest = Arc::new(MemoryDestination::new("https://new"));
        let sink = Arc::new(Collect::default());
        let executor = TransferExecutor::new(dest, 2, fast_retry());

        let mut items = assets(2);
        items.push(Err(RelayError::Enumeration {
            message: "listing broke".to_string(),
        }));
        items.extend(assets(5).into_iter().skip(2));

        let err = executor
            .run(stream::iter(items), sink.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Enumeration { .. }));
        assert_eq!(sink.0.lock().unwrap().len(), 2);
    }
}
