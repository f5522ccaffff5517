//! Detail and review refresh: fetches deeper per-work data for targets picked
//! by the scheduler and merges it into the stored works.
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use reqwest::Client;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::HarvestConfig;
use crate::crawl::agent::panic_message;
use crate::database_ops::models::{RefreshTarget, Review, WorkDetail};
use crate::database_ops::resolve::Resolver;
use crate::enrichment::throttle::RequestThrottle;
use crate::enrichment::{http_client, CollectStats};

/// Per-platform fetcher of work pages and review lists.
#[async_trait::async_trait]
pub trait DetailSource: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch_detail(&self, target: &RefreshTarget) -> Result<WorkDetail>;

    async fn fetch_reviews(&self, target: &RefreshTarget) -> Result<Vec<Review>>;
}

/// Fills `{url}` and `{title}` placeholders, percent-encoded.
pub fn expand_template(template: &str, target: &RefreshTarget) -> String {
    template
        .replace("{url}", &urlencoding::encode(&target.url))
        .replace("{title}", &urlencoding::encode(&target.title))
}

/// JSON endpoints described by URL templates in the platform registry.
pub struct HttpDetailSource {
    name: String,
    client: Client,
    detail_url: Option<String>,
    reviews_url: Option<String>,
}

impl HttpDetailSource {
    pub fn new(name: impl Into<String>, detail_url: Option<String>, reviews_url: Option<String>, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            client: http_client(timeout),
            detail_url,
            reviews_url,
        }
    }

    async fn get_json(&self, template: Option<&str>, target: &RefreshTarget, what: &str) -> Result<Value> {
        let template = template.with_context(|| format!("{}: no {what} endpoint configured", self.name))?;
        let url = expand_template(template, target);
        debug!(platform = %self.name, %url, what, "fetching");
        let body = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?
            .error_for_status()?
            .json()
            .await
            .with_context(|| format!("decoding {what}"))?;
        Ok(body)
    }
}

pub(crate) fn reviews_from_json(v: Value) -> Result<Vec<Review>> {
    let list = match v {
        Value::Array(_) => v,
        Value::Object(mut map) => map
            .remove("reviews")
            .or_else(|| map.remove("items"))
            .filter(Value::is_array)
            .context("review payload has no review array")?,
        other => anyhow::bail!("unexpected review payload: {other}"),
    };
    Ok(serde_json::from_value(list)?)
}

#[async_trait::async_trait]
impl DetailSource for HttpDetailSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_detail(&self, target: &RefreshTarget) -> Result<WorkDetail> {
        let body = self.get_json(self.detail_url.as_deref(), target, "detail").await?;
        Ok(serde_json::from_value(body)?)
    }

    async fn fetch_reviews(&self, target: &RefreshTarget) -> Result<Vec<Review>> {
        let body = self.get_json(self.reviews_url.as_deref(), target, "reviews").await?;
        reviews_from_json(body)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshKind {
    Detail,
    Reviews,
}

impl RefreshKind {
    fn label(self) -> &'static str {
        match self {
            RefreshKind::Detail => "detail",
            RefreshKind::Reviews => "reviews",
        }
    }
}

/// Runs detail or review refreshes. Platforms proceed concurrently; calls to
/// one platform are bounded by a semaphore and spaced by the configured delay.
pub struct RefreshRunner {
    resolver: Arc<Resolver>,
    sources: HashMap<String, Arc<dyn DetailSource>>,
    concurrency: usize,
    delay: Duration,
    timeout: Duration,
    cancel: CancellationToken,
}

impl RefreshRunner {
    pub fn new(resolver: Arc<Resolver>, cfg: &HarvestConfig, cancel: CancellationToken) -> Self {
        Self {
            resolver,
            sources: HashMap::new(),
            concurrency: cfg.detail_concurrency.max(1),
            delay: cfg.detail_delay,
            timeout: cfg.fetch_timeout,
            cancel,
        }
    }

    pub fn with_source(mut self, platform: impl Into<String>, source: Arc<dyn DetailSource>) -> Self {
        self.sources.insert(platform.into(), source);
        self
    }

    pub async fn refresh_details(&self, targets: &[RefreshTarget]) -> CollectStats {
        self.run(RefreshKind::Detail, targets).await
    }

    pub async fn refresh_reviews(&self, targets: &[RefreshTarget]) -> CollectStats {
        self.run(RefreshKind::Reviews, targets).await
    }

    async fn run(&self, kind: RefreshKind, targets: &[RefreshTarget]) -> CollectStats {
        let mut by_platform: BTreeMap<&str, Vec<&RefreshTarget>> = BTreeMap::new();
        for t in targets {
            by_platform.entry(t.platform.as_str()).or_default().push(t);
        }

        let mut stats = CollectStats::default();
        let mut passes = Vec::new();
        for (platform, list) in by_platform {
            match self.sources.get(platform) {
                Some(source) => passes.push(self.run_platform(kind, source.clone(), list)),
                None => {
                    debug!(platform, kind = kind.label(), skipped = list.len(), "no detail source configured");
                    stats.skipped += list.len();
                }
            }
        }
        for s in futures::future::join_all(passes).await {
            stats.absorb(s);
        }
        info!(
            kind = kind.label(),
            success = stats.success,
            failed = stats.failed,
            skipped = stats.skipped,
            "refresh finished"
        );
        stats
    }

    async fn run_platform(&self, kind: RefreshKind, source: Arc<dyn DetailSource>, targets: Vec<&RefreshTarget>) -> CollectStats {
        let sem = Arc::new(Semaphore::new(self.concurrency));
        let throttle = RequestThrottle::new(self.delay);
        let mut futs = FuturesUnordered::new();
        for target in targets {
            let sem = sem.clone();
            let throttle = throttle.clone();
            let source = source.clone();
            futs.push(async move {
                let Ok(_permit) = sem.acquire_owned().await else {
                    return None;
                };
                tokio::select! {
                    _ = self.cancel.cancelled() => None,
                    r = async {
                        throttle.wait().await;
                        let call = AssertUnwindSafe(self.refresh_one(kind, source.as_ref(), target)).catch_unwind();
                        match tokio::time::timeout(self.timeout, call).await {
                            Ok(Ok(r)) => r,
                            Ok(Err(panic)) => Err(anyhow::anyhow!("detail source panicked: {}", panic_message(panic.as_ref()))),
                            Err(_) => Err(anyhow::anyhow!("timed out after {}s", self.timeout.as_secs_f64())),
                        }
                    } => Some((target, r)),
                }
            });
        }

        let mut stats = CollectStats::default();
        while let Some(res) = futs.next().await {
            match res {
                None => stats.skipped += 1,
                Some((_, Ok(true))) => stats.success += 1,
                Some((_, Ok(false))) => stats.skipped += 1,
                Some((target, Err(e))) => {
                    warn!(platform = %target.platform, title = %target.title, kind = kind.label(), error = %e, "refresh failed");
                    stats.failed += 1;
                }
            }
        }
        info!(
            platform = source.name(),
            kind = kind.label(),
            success = stats.success,
            failed = stats.failed,
            "platform refresh finished"
        );
        stats
    }

    async fn refresh_one(&self, kind: RefreshKind, source: &dyn DetailSource, target: &RefreshTarget) -> Result<bool> {
        let store = self.resolver.store();
        match kind {
            RefreshKind::Detail => {
                let detail = source.fetch_detail(target).await?;
                let Some(work) = store.save_work_detail(&target.platform, &target.title, &detail).await? else {
                    return Ok(false);
                };
                self.resolver.propagate(&work).await?;
                Ok(true)
            }
            RefreshKind::Reviews => {
                let reviews = source.fetch_reviews(target).await?;
                let saved = store.save_reviews(&target.platform, &target.title, &reviews).await?;
                debug!(platform = %target.platform, title = %target.title, saved, "reviews saved");
                Ok(true)
            }
        }
    }
}
