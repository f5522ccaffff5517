//! List-based source: one ranked listing is fetched per batch and every local
//! title is matched against it, instead of querying the source per title.
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

use super::{http_client, CollectContext, CollectStats, Collector};
use crate::database_ops::models::{ExternalIdentifier, MetricValue, RefreshTarget};
use crate::normalization::title::{MatchConfig, TitleFields};

pub const DEFAULT_SOURCE: &str = "bookwalker";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ListingItem {
    pub rank: Option<i64>,
    pub title: String,
    #[serde(default)]
    pub url: String,
    pub rating: Option<f64>,
    pub review_count: Option<i64>,
}

impl ListingItem {
    fn metrics(&self) -> Vec<(&'static str, MetricValue)> {
        let mut out = Vec::new();
        if let Some(r) = self.rank {
            out.push(("bw_rank", r.into()));
        }
        if let Some(r) = self.rating {
            out.push(("bw_rating", r.into()));
        }
        if let Some(n) = self.review_count {
            out.push(("bw_review_count", n.into()));
        }
        out
    }

    fn external_id(&self) -> &str {
        if self.url.trim().is_empty() {
            &self.title
        } else {
            &self.url
        }
    }
}

impl TitleFields for ListingItem {
    fn title_fields(&self) -> Vec<&str> {
        vec![self.title.as_str()]
    }
}

fn parse_listing(body: Value) -> Result<Vec<ListingItem>> {
    let list = match body {
        Value::Array(_) => body,
        Value::Object(mut map) => ["items", "rankings", "data"]
            .iter()
            .find_map(|k| map.remove(*k).filter(Value::is_array))
            .context("listing object has no item array")?,
        other => anyhow::bail!("unexpected listing payload: {other}"),
    };
    Ok(serde_json::from_value(list)?)
}

pub struct ListingCollector {
    client: Client,
    source: String,
    url: Option<String>,
    matcher: MatchConfig,
}

impl ListingCollector {
    /// `url` comes from `LISTING_URL`; without it the collector is disabled.
    pub fn new(source: impl Into<String>, url: Option<String>, matcher: MatchConfig, timeout: Duration) -> Self {
        Self {
            client: http_client(timeout),
            source: source.into(),
            url: url.filter(|u| !u.trim().is_empty()),
            matcher,
        }
    }

    async fn fetch_listing(&self) -> Result<Vec<ListingItem>> {
        let url = self.url.as_deref().context("LISTING_URL not configured")?;
        let body: Value = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?
            .error_for_status()?
            .json()
            .await
            .context("decoding listing")?;
        parse_listing(body)
    }

    /// Matches one target against an already fetched listing and stores the result.
    async fn match_against(&self, ctx: &CollectContext, target: &RefreshTarget, items: &[ListingItem]) -> Result<bool> {
        let Some((item, score)) = self.matcher.best_match(&target.title, items) else {
            ctx.record_not_found(target).await?;
            return Ok(false);
        };
        let id = ExternalIdentifier::found(
            &target.platform,
            &target.title,
            &self.source,
            item.external_id(),
            item.title.clone(),
            score,
        );
        ctx.store.save_external_id(&id).await?;
        Ok(ctx.save_metrics(&target.title, item.metrics()).await? > 0)
    }
}

#[async_trait::async_trait]
impl Collector for ListingCollector {
    fn source(&self) -> &str {
        &self.source
    }

    fn rate_limit(&self) -> Duration {
        Duration::from_secs(4)
    }

    fn enabled(&self) -> bool {
        self.url.is_some()
    }

    async fn collect_one(&self, ctx: &CollectContext, target: &RefreshTarget) -> Result<bool> {
        let items = self.fetch_listing().await?;
        self.match_against(ctx, target, &items).await
    }

    async fn collect_all(&self, ctx: &CollectContext, targets: &[RefreshTarget]) -> CollectStats {
        if !self.enabled() {
            info!(source = %self.source, skipped = targets.len(), "collector disabled, credentials missing");
            return CollectStats::skipped_all(targets.len());
        }
        let mut stats = CollectStats::default();
        let pending = ctx.pending(targets, &mut stats);
        if pending.is_empty() {
            return stats;
        }
        let items = match tokio::time::timeout(ctx.call_timeout, self.fetch_listing()).await {
            Ok(Ok(items)) => items,
            Ok(Err(e)) => {
                warn!(source = %self.source, error = %e, "listing fetch failed");
                stats.failed += pending.len();
                return stats;
            }
            Err(_) => {
                warn!(source = %self.source, "listing fetch timed out");
                stats.failed += pending.len();
                return stats;
            }
        };
        info!(source = %self.source, listing = items.len(), pending = pending.len(), "matching against listing");
        if items.is_empty() {
            stats.skipped += pending.len();
            return stats;
        }

        for target in pending {
            if ctx.cancel.is_cancelled() {
                stats.skipped += 1;
                continue;
            }
            match self.match_against(ctx, target, &items).await {
                Ok(true) => stats.success += 1,
                Ok(false) => stats.skipped += 1,
                Err(e) => {
                    warn!(source = %self.source, title = %target.title, error = %e, "listing match failed");
                    stats.failed += 1;
                }
            }
        }
        info!(
            source = %self.source,
            success = stats.success,
            failed = stats.failed,
            skipped = stats.skipped,
            "collection finished"
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::memory_store::MemoryStore;
    use crate::enrichment::EnrichmentRun;
    use chrono::NaiveDate;
    use serde_json::json;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn items() -> Vec<ListingItem> {
        parse_listing(json!({"items": [
            {"rank": 1, "title": "薬屋のひとりごと 13巻", "url": "https://bw.jp/1", "rating": 4.5, "review_count": 210},
            {"rank": 2, "title": "キングダム", "url": "", "rating": null, "review_count": null}
        ]}))
        .unwrap()
    }

    #[test]
    fn listing_shapes_and_ids() {
        let it = items();
        assert_eq!(it.len(), 2);
        assert_eq!(it[0].external_id(), "https://bw.jp/1");
        assert_eq!(it[1].external_id(), "キングダム");
        assert_eq!(it[1].metrics().len(), 1);
        assert!(parse_listing(json!({"nope": 1})).is_err());
    }

    #[tokio::test]
    async fn batch_without_url_is_skipped() {
        let store = Arc::new(MemoryStore::new());
        let ctx = EnrichmentRun {
            store,
            today: NaiveDate::from_ymd_opt(2026, 10, 18).unwrap(),
            bypass_not_found: false,
            concurrency: 1,
            call_timeout: Duration::from_secs(1),
            cancel: CancellationToken::new(),
        }
        .context_for(DEFAULT_SOURCE)
        .await
        .unwrap();
        let c = ListingCollector::new(DEFAULT_SOURCE, None, MatchConfig::default().with_threshold(0.7), Duration::from_secs(1));
        let targets = vec![RefreshTarget {
            platform: "piccoma".into(),
            title: "キングダム".into(),
            url: "https://piccoma.com/1".into(),
        }];
        assert_eq!(c.collect_all(&ctx, &targets).await, CollectStats::skipped_all(1));
    }

    #[tokio::test]
    async fn matches_are_stored_and_misses_cached() {
        let store = Arc::new(MemoryStore::new());
        let ctx = EnrichmentRun {
            store: store.clone(),
            today: NaiveDate::from_ymd_opt(2026, 10, 18).unwrap(),
            bypass_not_found: false,
            concurrency: 1,
            call_timeout: Duration::from_secs(1),
            cancel: CancellationToken::new(),
        }
        .context_for(DEFAULT_SOURCE)
        .await
        .unwrap();
        let c = ListingCollector::new(DEFAULT_SOURCE, None, MatchConfig::default().with_threshold(0.7), Duration::from_secs(1));
        let listing = items();
        let hit = RefreshTarget {
            platform: "cmoa".into(),
            title: "薬屋のひとりごと".into(),
            url: "https://cmoa.jp/1".into(),
        };
        let miss = RefreshTarget {
            platform: "cmoa".into(),
            title: "全然ちがう話".into(),
            url: "https://cmoa.jp/2".into(),
        };
        assert!(c.match_against(&ctx, &hit, &listing).await.unwrap());
        assert!(!c.match_against(&ctx, &miss, &listing).await.unwrap());

        let id = store.external_id("cmoa", "薬屋のひとりごと", DEFAULT_SOURCE).await.unwrap();
        assert_eq!(id.external_id, "https://bw.jp/1");
        assert!(store
            .external_id("cmoa", "全然ちがう話", DEFAULT_SOURCE)
            .await
            .unwrap()
            .is_not_found());
        assert_eq!(store.external_metrics().await.len(), 3);
    }
}
