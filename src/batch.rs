use crate::asset::AssetDescriptor;
use crate::context::FetchContext;
use crate::error::ResolutionError;
use crate::layout::Layout;
use crate::report::{Aggregator, BatchReport};
use crate::resolver::{self, AssetSource, ResolveOptions};
use crate::scheduler::{Limits, Scheduler};
use crate::source::Source;
use crate::task::FetchTask;
use log::error;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A validated set of descriptors: unique keys, unique destinations and
/// usable hrefs.
#[derive(Debug, Clone)]
pub struct Batch {
    descriptors: Vec<AssetDescriptor>,
}

impl Batch {
    pub fn new(descriptors: Vec<AssetDescriptor>) -> Result<Self, ResolutionError> {
        let mut claimed: HashMap<&Path, &AssetDescriptor> = HashMap::new();
        for descriptor in &descriptors {
            resolver::normalize_href(descriptor.source_uri(), None)?;
            // Same asset under a second key would leave that key out of the report
            if let Some(first) = claimed.insert(descriptor.destination_path().as_path(), descriptor) {
                if first.key() != descriptor.key() {
                    return Err(ResolutionError::DestinationConflict {
                        path: descriptor.destination_path().clone(),
                        first: first.key().to_string(),
                        second: descriptor.key().to_string(),
                    });
                }
            }
        }
        let descriptors = resolver::dedup(descriptors)?;
        Ok(Self { descriptors })
    }

    pub fn from_items<'a>(
        source: impl Into<AssetSource<'a>>,
        layout: &impl Layout,
        options: &ResolveOptions,
    ) -> Result<Self, ResolutionError> {
        Self::new(resolver::resolve(source, layout, options)?)
    }

    pub fn descriptors(&self) -> &[AssetDescriptor] {
        &self.descriptors
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

/// A running batch. The partial report can be read at any time.
pub struct BatchHandle {
    aggregator: Arc<Mutex<Aggregator>>,
    cancel: CancellationToken,
    in_flight: Arc<AtomicUsize>,
    join: JoinHandle<()>,
}

impl BatchHandle {
    pub fn snapshot(&self) -> BatchReport {
        self.aggregator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot()
    }

    /// Stops admitting new tasks. Tasks in flight stop at their next chunk.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Waits for the batch to drain and returns the final report.
    pub async fn wait(self) -> BatchReport {
        let Self {
            aggregator, join, ..
        } = self;
        let joined = join.await;
        let mut aggregator = aggregator.lock().unwrap_or_else(PoisonError::into_inner);
        match joined {
            Ok(()) => aggregator.snapshot(),
            Err(e) => {
                error!("Batch scheduler stopped unexpectedly: {e}");
                aggregator.mark_cancelled();
                aggregator.finish()
            }
        }
    }
}

/// Starts `batch` on the current runtime and returns immediately.
pub fn spawn_batch(ctx: &FetchContext, batch: Batch) -> BatchHandle {
    spawn_batch_with_token(ctx, batch, CancellationToken::new())
}

/// Like [`spawn_batch`], cancelled when `cancel` is.
pub fn spawn_batch_with_token(
    ctx: &FetchContext,
    batch: Batch,
    cancel: CancellationToken,
) -> BatchHandle {
    let config = ctx.config();
    let aggregator = Arc::new(Mutex::new(Aggregator::new(
        batch.descriptors.iter().map(|d| d.key()),
    )));

    let tasks = batch
        .descriptors
        .into_iter()
        .enumerate()
        .map(|(i, descriptor)| {
            let host = Source::parse(descriptor.source_uri())
                .map(|s| s.host())
                .unwrap_or_default();
            FetchTask::new(i, descriptor, host)
        })
        .collect::<Vec<_>>();

    let scheduler = Scheduler::new(
        ctx.executor(),
        ctx.retry_policy(),
        Limits {
            global: config.global_limit,
            per_host: config.per_host_limit,
        },
        Arc::clone(&aggregator),
        cancel.clone(),
    )
    .with_timeout(config.batch_timeout());
    let in_flight = scheduler.in_flight_gauge();
    let join = tokio::spawn(scheduler.run(tasks));

    BatchHandle {
        aggregator,
        cancel,
        in_flight,
        join,
    }
}

/// Fetches every asset of `batch` and returns the final report.
pub async fn fetch_batch(ctx: &FetchContext, batch: Batch) -> BatchReport {
    spawn_batch(ctx, batch).wait().await
}

/// Resolves the assets of `source` and fetches them.
pub async fn fetch_items<'a>(
    ctx: &FetchContext,
    source: impl Into<AssetSource<'a>>,
    layout: &impl Layout,
    options: &ResolveOptions,
) -> Result<BatchReport, ResolutionError> {
    let batch = Batch::from_items(source, layout, options)?;
    Ok(fetch_batch(ctx, batch).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_rejects_duplicate_destinations() {
        let err = Batch::new(vec![
            AssetDescriptor::new("a", "https://x/a", "out/same"),
            AssetDescriptor::new("b", "https://x/b", "out/same"),
        ])
        .unwrap_err();
        assert!(matches!(err, ResolutionError::DestinationConflict { .. }));
    }

    #[test]
    fn test_batch_rejects_unsupported_scheme() {
        let err = Batch::new(vec![AssetDescriptor::new("a", "gs://bucket/a", "out/a")]).unwrap_err();
        assert!(matches!(err, ResolutionError::UnsupportedScheme { .. }));
    }

    #[test]
    fn test_batch_collapses_identical_descriptors() {
        let batch = Batch::new(vec![
            AssetDescriptor::new("a", "https://x/a", "out/a"),
            AssetDescriptor::new("a", "https://x/a", "out/a"),
        ])
        .unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn test_batch_rejects_second_key_for_same_asset() {
        let err = Batch::new(vec![
            AssetDescriptor::new("a", "https://x/a", "out/a"),
            AssetDescriptor::new("b", "https://x/a", "out/a"),
        ])
        .unwrap_err();
        assert_eq!(
            err,
            ResolutionError::DestinationConflict {
                path: "out/a".into(),
                first: "a".to_string(),
                second: "b".to_string(),
            }
        );
    }
}
