//! Third-party metric collectors. Each source resolves a local title to its
//! own id once (caching misses as NOT_FOUND) and then records dated metrics.
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::NaiveDate;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use reqwest::Client;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::crawl::agent::panic_message;
use crate::database_ops::models::{ExternalIdentifier, ExternalMetric, MetricValue, RefreshTarget};
use crate::database_ops::store::ResolutionStore;
use crate::errors::HarvestError;
use crate::scheduler::{Budget, RefreshScheduler};

pub mod anilist;
pub mod jikan;
pub mod listing;
pub mod throttle;
pub mod youtube;

use throttle::RequestThrottle;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CollectStats {
    pub success: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl CollectStats {
    pub fn skipped_all(n: usize) -> Self {
        Self {
            skipped: n,
            ..Self::default()
        }
    }

    pub fn total(&self) -> usize {
        self.success + self.failed + self.skipped
    }

    pub fn absorb(&mut self, other: CollectStats) {
        self.success += other.success;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }
}

/// Snapshot of one source's `external_ids`, loaded once per batch.
#[derive(Debug, Default, Clone)]
pub struct ExternalIdCache {
    found: HashMap<String, ExternalIdentifier>,
    not_found: HashSet<String>,
}

impl ExternalIdCache {
    pub fn from_rows(rows: Vec<ExternalIdentifier>) -> Self {
        let mut cache = Self::default();
        for row in rows {
            if row.is_not_found() {
                cache.not_found.insert(row.title);
                continue;
            }
            let better = cache
                .found
                .get(&row.title)
                .map_or(true, |cur| row.match_score > cur.match_score);
            if better {
                cache.found.insert(row.title.clone(), row);
            }
        }
        // a real id from any platform outranks a miss recorded elsewhere
        let found = &cache.found;
        cache.not_found.retain(|t| !found.contains_key(t));
        cache
    }

    pub async fn load(store: &dyn ResolutionStore, source: &str) -> Result<Self> {
        Ok(Self::from_rows(store.external_ids(source).await?))
    }

    pub fn found(&self, title: &str) -> Option<&ExternalIdentifier> {
        self.found.get(title)
    }

    pub fn is_not_found(&self, title: &str) -> bool {
        self.not_found.contains(title)
    }
}

/// Result of a source-side search that cleared the match threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct Matched {
    pub external_id: String,
    pub external_title: String,
    pub score: f64,
}

/// Everything a collector needs for one batch.
pub struct CollectContext {
    pub store: Arc<dyn ResolutionStore>,
    pub source: String,
    pub today: NaiveDate,
    pub cache: ExternalIdCache,
    pub bypass_not_found: bool,
    pub concurrency: usize,
    pub call_timeout: Duration,
    pub cancel: CancellationToken,
}

impl CollectContext {
    /// The cached id for the title, or the outcome of `search` persisted as
    /// the new id. A miss is stored as NOT_FOUND and yields `None`.
    pub async fn lookup_or_match<F, Fut>(&self, target: &RefreshTarget, search: F) -> Result<Option<ExternalIdentifier>>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<Option<Matched>>> + Send,
    {
        if let Some(found) = self.cache.found(&target.title) {
            return Ok(Some(found.clone()));
        }
        match search().await? {
            Some(m) => {
                let row = ExternalIdentifier::found(
                    &target.platform,
                    &target.title,
                    &self.source,
                    m.external_id,
                    m.external_title,
                    m.score,
                );
                self.store.save_external_id(&row).await?;
                Ok(Some(row))
            }
            None => {
                self.record_not_found(target).await?;
                Ok(None)
            }
        }
    }

    pub async fn record_not_found(&self, target: &RefreshTarget) -> Result<()> {
        let miss = HarvestError::MatchNotFound {
            provider: self.source.clone(),
            title: target.title.clone(),
        };
        debug!(error = %miss, "caching NOT_FOUND");
        self.store
            .save_external_id(&ExternalIdentifier::not_found(&target.platform, &target.title, &self.source))
            .await?;
        Ok(())
    }

    /// Writes today's metrics for the title. Returns the number of rows stored.
    pub async fn save_metrics(&self, title: &str, metrics: Vec<(&str, MetricValue)>) -> Result<usize> {
        let rows: Vec<ExternalMetric> = metrics
            .into_iter()
            .map(|(name, value)| ExternalMetric {
                title: title.to_string(),
                source: self.source.clone(),
                metric_name: name.to_string(),
                value,
                collected_date: self.today,
            })
            .collect();
        if rows.is_empty() {
            return Ok(0);
        }
        self.store.save_external_metrics(&rows).await
    }

    /// Unique titles still worth a call. NOT_FOUND titles are counted as
    /// skipped unless bypass is set.
    pub(crate) fn pending<'a>(&self, targets: &'a [RefreshTarget], stats: &mut CollectStats) -> Vec<&'a RefreshTarget> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for t in targets {
            if !seen.insert(t.title.as_str()) {
                continue;
            }
            if !self.bypass_not_found && self.cache.is_not_found(&t.title) {
                stats.skipped += 1;
                continue;
            }
            out.push(t);
        }
        out
    }
}

#[async_trait::async_trait]
pub trait Collector: Send + Sync {
    fn source(&self) -> &str;

    /// Minimum spacing between two calls to the source.
    fn rate_limit(&self) -> Duration;

    /// False when required credentials are missing; every target is then skipped.
    fn enabled(&self) -> bool {
        true
    }

    /// Collects one title. `Ok(true)` when metrics were stored, `Ok(false)`
    /// when the source had nothing for it.
    async fn collect_one(&self, ctx: &CollectContext, target: &RefreshTarget) -> Result<bool>;

    /// Batch entry point. List-based sources override this to amortize one fetch.
    async fn collect_all(&self, ctx: &CollectContext, targets: &[RefreshTarget]) -> CollectStats {
        collect_each(self, ctx, targets).await
    }
}

enum CallResult {
    Collected,
    Empty,
    Failed(String),
    Cancelled,
}

fn log_progress(source: &str, done: usize, total: usize, title: &str, result: &CallResult) {
    if done > 5 && done % 50 != 0 && done != total {
        return;
    }
    let short: String = title.chars().take(30).collect();
    match result {
        CallResult::Collected => info!(source, done, total, title = %short, "collected"),
        CallResult::Empty => info!(source, done, total, title = %short, "nothing found"),
        CallResult::Failed(e) => warn!(source, done, total, title = %short, error = %e, "collect failed"),
        CallResult::Cancelled => {}
    }
}

/// Per-title batch: dedupe, NOT_FOUND suppression, a shared throttle, a
/// semaphore bound and per-call timeout plus panic isolation.
pub async fn collect_each<C: Collector + ?Sized>(
    collector: &C,
    ctx: &CollectContext,
    targets: &[RefreshTarget],
) -> CollectStats {
    let source = collector.source();
    if !collector.enabled() {
        info!(source, skipped = targets.len(), "collector disabled, credentials missing");
        return CollectStats::skipped_all(targets.len());
    }
    let mut stats = CollectStats::default();
    let pending = ctx.pending(targets, &mut stats);
    let total = pending.len();
    info!(source, targets = targets.len(), pending = total, skipped = stats.skipped, "collection starting");

    let throttle = RequestThrottle::new(collector.rate_limit());
    let permits = Semaphore::new(ctx.concurrency.max(1));
    let mut calls = FuturesUnordered::new();
    for target in pending {
        let throttle = &throttle;
        let permits = &permits;
        calls.push(async move {
            let Ok(_permit) = permits.acquire().await else {
                return (target, CallResult::Cancelled);
            };
            let call = async {
                throttle.wait().await;
                tokio::time::timeout(
                    ctx.call_timeout,
                    AssertUnwindSafe(collector.collect_one(ctx, target)).catch_unwind(),
                )
                .await
            };
            let result = tokio::select! {
                _ = ctx.cancel.cancelled() => CallResult::Cancelled,
                r = call => match r {
                    Err(_) => CallResult::Failed(HarvestError::timeout(ctx.call_timeout).to_string()),
                    Ok(Err(panic)) => CallResult::Failed(format!("collector panicked: {}", panic_message(panic.as_ref()))),
                    Ok(Ok(Err(e))) => CallResult::Failed(format!("{e:#}")),
                    Ok(Ok(Ok(true))) => CallResult::Collected,
                    Ok(Ok(Ok(false))) => CallResult::Empty,
                },
            };
            (target, result)
        });
    }

    let mut done = 0usize;
    while let Some((target, result)) = calls.next().await {
        done += 1;
        log_progress(source, done, total, &target.title, &result);
        match result {
            CallResult::Collected => stats.success += 1,
            CallResult::Empty | CallResult::Cancelled => stats.skipped += 1,
            CallResult::Failed(_) => stats.failed += 1,
        }
    }
    info!(source, success = stats.success, failed = stats.failed, skipped = stats.skipped, "collection finished");
    stats
}

pub(crate) fn http_client(timeout: Duration) -> Client {
    Client::builder()
        .timeout(timeout)
        .user_agent(concat!("rankwatch/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Shared settings for one enrichment pass over several sources.
pub struct EnrichmentRun {
    pub store: Arc<dyn ResolutionStore>,
    pub today: NaiveDate,
    pub bypass_not_found: bool,
    pub concurrency: usize,
    pub call_timeout: Duration,
    pub cancel: CancellationToken,
}

impl EnrichmentRun {
    pub async fn context_for(&self, source: &str) -> Result<CollectContext> {
        Ok(CollectContext {
            store: self.store.clone(),
            source: source.to_string(),
            today: self.today,
            cache: ExternalIdCache::load(self.store.as_ref(), source).await?,
            bypass_not_found: self.bypass_not_found,
            concurrency: self.concurrency,
            call_timeout: self.call_timeout,
            cancel: self.cancel.clone(),
        })
    }

    /// Runs every collector over its scheduled titles. Sources proceed
    /// concurrently; a source whose selection fails reports zero stats.
    pub async fn run(
        &self,
        collectors: &[Arc<dyn Collector>],
        scheduler: &RefreshScheduler,
        budget: Budget,
    ) -> BTreeMap<String, CollectStats> {
        let passes = collectors.iter().map(|c| async move {
            let source = c.source().to_string();
            let stats = match self.one_source(c.as_ref(), scheduler, budget).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(source = %source, error = %e, "enrichment source failed");
                    CollectStats::default()
                }
            };
            (source, stats)
        });
        futures::future::join_all(passes).await.into_iter().collect()
    }

    async fn one_source(&self, collector: &dyn Collector, scheduler: &RefreshScheduler, budget: Budget) -> Result<CollectStats> {
        let targets = scheduler
            .due_for_external(collector.source(), budget, self.bypass_not_found)
            .await?;
        let ctx = self.context_for(collector.source()).await?;
        Ok(collector.collect_all(&ctx, &targets).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::memory_store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    struct Counting {
        calls: AtomicUsize,
        searches: AtomicUsize,
        delay: Duration,
        enabled: bool,
    }

    impl Counting {
        fn new(delay: Duration) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                searches: AtomicUsize::new(0),
                delay,
                enabled: true,
            }
        }
    }

    #[async_trait::async_trait]
    impl Collector for Counting {
        fn source(&self) -> &str {
            "counting"
        }
        fn rate_limit(&self) -> Duration {
            self.delay
        }
        fn enabled(&self) -> bool {
            self.enabled
        }
        async fn collect_one(&self, ctx: &CollectContext, target: &RefreshTarget) -> Result<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match target.title.as_str() {
                "err" => anyhow::bail!("upstream 500"),
                "boom" => panic!("parser blew up"),
                _ => {}
            }
            let id = ctx
                .lookup_or_match(target, move || async move {
                    self.searches.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, anyhow::Error>(target.title.starts_with("hit").then(|| Matched {
                        external_id: format!("id-{}", target.title),
                        external_title: target.title.clone(),
                        score: 1.0,
                    }))
                })
                .await?;
            let Some(id) = id else { return Ok(false) };
            ctx.save_metrics(&target.title, vec![("score", MetricValue::from(8.5)), ("id", id.external_id.into())])
                .await?;
            Ok(true)
        }
    }

    fn target(title: &str) -> RefreshTarget {
        RefreshTarget {
            platform: "piccoma".into(),
            title: title.into(),
            url: format!("https://piccoma.com/{title}"),
        }
    }

    async fn ctx(store: Arc<MemoryStore>, bypass: bool) -> CollectContext {
        EnrichmentRun {
            store,
            today: NaiveDate::from_ymd_opt(2026, 10, 18).unwrap(),
            bypass_not_found: bypass,
            concurrency: 1,
            call_timeout: Duration::from_secs(5),
            cancel: CancellationToken::new(),
        }
        .context_for("counting")
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn errors_and_panics_stay_inside_the_batch() {
        let store = Arc::new(MemoryStore::new());
        let c = Counting::new(Duration::ZERO);
        let targets = vec![target("hit-1"), target("err"), target("boom"), target("miss"), target("hit-1")];
        let stats = c.collect_all(&ctx(store.clone(), false).await, &targets).await;
        assert_eq!(stats, CollectStats { success: 1, failed: 2, skipped: 1 });
        // duplicate title is collected once
        assert_eq!(c.calls.load(Ordering::SeqCst), 4);
        assert_eq!(store.external_metrics().await.len(), 2);
    }

    #[tokio::test]
    async fn not_found_is_cached_until_bypass() {
        let store = Arc::new(MemoryStore::new());
        let c = Counting::new(Duration::ZERO);
        let targets = vec![target("miss")];

        c.collect_all(&ctx(store.clone(), false).await, &targets).await;
        assert_eq!(c.searches.load(Ordering::SeqCst), 1);
        let cached = store.external_id("piccoma", "miss", "counting").await.unwrap();
        assert!(cached.is_not_found());

        let second = c.collect_all(&ctx(store.clone(), false).await, &targets).await;
        assert_eq!(second, CollectStats::skipped_all(1));
        assert_eq!(c.calls.load(Ordering::SeqCst), 1);
        assert_eq!(c.searches.load(Ordering::SeqCst), 1);

        c.collect_all(&ctx(store.clone(), true).await, &targets).await;
        assert_eq!(c.searches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn found_ids_are_reused_without_searching() {
        let store = Arc::new(MemoryStore::new());
        let c = Counting::new(Duration::ZERO);
        c.collect_all(&ctx(store.clone(), false).await, &[target("hit-a")]).await;
        c.collect_all(&ctx(store.clone(), false).await, &[target("hit-a")]).await;
        assert_eq!(c.calls.load(Ordering::SeqCst), 2);
        assert_eq!(c.searches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn calls_are_spaced_by_the_rate_limit() {
        let store = Arc::new(MemoryStore::new());
        let c = Counting::new(Duration::from_millis(15));
        let start = Instant::now();
        let stats = c
            .collect_all(&ctx(store, false).await, &[target("hit-1"), target("hit-2"), target("hit-3")])
            .await;
        assert_eq!(stats.success, 3);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn disabled_collector_skips_everything() {
        let store = Arc::new(MemoryStore::new());
        let mut c = Counting::new(Duration::ZERO);
        c.enabled = false;
        let stats = c.collect_all(&ctx(store, false).await, &[target("hit-1"), target("miss")]).await;
        assert_eq!(stats, CollectStats::skipped_all(2));
        assert_eq!(c.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cache_prefers_found_over_not_found() {
        let rows = vec![
            ExternalIdentifier::not_found("cmoa", "X", "s"),
            ExternalIdentifier::found("piccoma", "X", "s", "42", "X", 0.8),
            ExternalIdentifier::found("renta", "X", "s", "43", "X", 0.95),
            ExternalIdentifier::not_found("cmoa", "Y", "s"),
        ];
        let cache = ExternalIdCache::from_rows(rows);
        assert!(!cache.is_not_found("X"));
        assert_eq!(cache.found("X").unwrap().external_id, "43");
        assert!(cache.is_not_found("Y"));
    }
}
