//! Bounded fork/join parallelism for a stage's enrichment step.
//!
//! Only used inside a single stage: the pool never runs work from two
//! stages or two job instances at once.

use std::sync::Arc;

use etl_data::Data;
use etl_stage_models::{IntermediateState, Stage};
use futures::StreamExt as _;
use futures::stream::BoxStream;
use serde_json::Value;

use crate::StageError;
use crate::fetcher::{FetchContext, StageFetcher};

/// Default number of worker threads.
pub const DEFAULT_THREADS: usize = 4;

/// Default list length below which work is processed without forking.
pub const DEFAULT_FORK_THRESHOLD: usize = 32;

/// A fixed-size `rayon` pool that splits lists in halves until they are
/// small enough, maps them directly and merges the halves in order.
pub struct ForkJoinPool {
    pool: rayon::ThreadPool,
    threshold: usize,
}

impl std::fmt::Debug for ForkJoinPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForkJoinPool")
            .field("threads", &self.pool.current_num_threads())
            .field("threshold", &self.threshold)
            .finish()
    }
}

impl ForkJoinPool {
    /// Builds a pool with `threads` workers and the given fork threshold.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::Pool`] if the thread pool cannot be created.
    pub fn new(threads: usize, threshold: usize) -> Result<Self, StageError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("etl-enrich-{i}"))
            .build()?;

        Ok(Self {
            pool,
            threshold: threshold.max(1),
        })
    }

    /// Builds a pool with [`DEFAULT_THREADS`] and [`DEFAULT_FORK_THRESHOLD`].
    ///
    /// # Errors
    ///
    /// Returns [`StageError::Pool`] if the thread pool cannot be created.
    pub fn with_defaults() -> Result<Self, StageError> {
        Self::new(DEFAULT_THREADS, DEFAULT_FORK_THRESHOLD)
    }

    /// Fork threshold in effect.
    #[must_use]
    pub const fn threshold(&self) -> usize {
        self.threshold
    }

    /// Maps every item, preserving input order in the output.
    pub fn map<T, U, F>(&self, items: Vec<T>, f: F) -> Vec<U>
    where
        T: Send,
        U: Send,
        F: Fn(T) -> U + Sync,
    {
        let threshold = self.threshold;
        self.pool.install(|| split_map(items, threshold, &f))
    }
}

fn split_map<T, U, F>(mut items: Vec<T>, threshold: usize, f: &F) -> Vec<U>
where
    T: Send,
    U: Send,
    F: Fn(T) -> U + Sync,
{
    if items.len() <= threshold {
        return items.into_iter().map(f).collect();
    }

    let right = items.split_off(items.len() / 2);
    let (mut left, right) = rayon::join(
        || split_map(items, threshold, f),
        || split_map(right, threshold, f),
    );
    left.extend(right);
    left
}

/// Record enrichment applied on the pool.
pub type Enrichment = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// Wraps a fetcher and enriches every record it yields on a
/// [`ForkJoinPool`].
pub struct EnrichedFetcher<F> {
    inner: F,
    pool: Arc<ForkJoinPool>,
    enrich: Enrichment,
}

impl<F: StageFetcher> EnrichedFetcher<F> {
    /// Wraps `inner`, applying `enrich` to each record.
    #[must_use]
    pub fn new(inner: F, pool: Arc<ForkJoinPool>, enrich: Enrichment) -> Self {
        Self {
            inner,
            pool,
            enrich,
        }
    }
}

impl<F: StageFetcher> StageFetcher for EnrichedFetcher<F> {
    fn stage(&self) -> Stage {
        self.inner.stage()
    }

    fn fetch<'a>(
        &'a self,
        context: &'a FetchContext,
        state: &'a IntermediateState,
    ) -> BoxStream<'a, Data<Value>> {
        self.inner
            .fetch(context, state)
            .map(move |data| match data {
                Data::Basic(record) => Data::Basic((self.enrich)(record)),
                Data::Ingestion { records, failures } => Data::Ingestion {
                    records: self.pool.map(records, |record| (self.enrich)(record)),
                    failures,
                },
                failed @ Data::Failed { .. } => failed,
            })
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::{StreamExt as _, stream};
    use serde_json::json;

    use super::*;

    #[test]
    fn map_preserves_order_across_forks() {
        let pool = ForkJoinPool::new(4, 3).unwrap();
        let items: Vec<u32> = (0..100).collect();

        let doubled = pool.map(items, |n| n * 2);

        assert_eq!(doubled, (0..100).map(|n| n * 2).collect::<Vec<_>>());
    }

    #[test]
    fn small_lists_are_processed_directly() {
        let pool = ForkJoinPool::new(2, 8).unwrap();
        let calls = AtomicUsize::new(0);

        let out = pool.map(vec!["a", "b"], |s| {
            calls.fetch_add(1, Ordering::SeqCst);
            s.to_uppercase()
        });

        assert_eq!(out, vec!["A".to_string(), "B".to_string()]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn empty_and_threshold_of_one() {
        let pool = ForkJoinPool::new(1, 0).unwrap();
        assert_eq!(pool.threshold(), 1);
        assert!(pool.map(Vec::<u8>::new(), |n| n).is_empty());
        assert_eq!(pool.map(vec![1, 2, 3], |n| n + 1), vec![2, 3, 4]);
    }

    struct Fixed;

    impl StageFetcher for Fixed {
        fn stage(&self) -> Stage {
            Stage::Builds
        }

        fn fetch<'a>(
            &'a self,
            _context: &'a FetchContext,
            _state: &'a IntermediateState,
        ) -> BoxStream<'a, Data<Value>> {
            stream::iter(vec![
                Data::records(vec![json!({"id": 1}), json!({"id": 2})]),
                Data::failed("timeout", None),
            ])
            .boxed()
        }
    }

    #[tokio::test]
    async fn enriched_fetcher_tags_records_and_keeps_failures() {
        let pool = Arc::new(ForkJoinPool::new(2, 1).unwrap());
        let fetcher = EnrichedFetcher::new(
            Fixed,
            pool,
            Arc::new(|mut record: Value| {
                record["enriched"] = json!(true);
                record
            }),
        );
        let context = FetchContext::new("lakers", true, chrono::Utc::now(), None);
        let state = IntermediateState::new();

        let envelopes: Vec<Data<Value>> = fetcher.fetch(&context, &state).collect().await;

        assert_eq!(fetcher.stage(), Stage::Builds);
        assert_eq!(
            envelopes[0],
            Data::records(vec![
                json!({"id": 1, "enriched": true}),
                json!({"id": 2, "enriched": true}),
            ])
        );
        assert!(envelopes[1].is_failed());
    }
}
