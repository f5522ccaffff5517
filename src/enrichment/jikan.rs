use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tokio::time::sleep;
use tracing::warn;

use super::{http_client, CollectContext, Collector, Matched};
use crate::database_ops::models::{MetricValue, RefreshTarget};
use crate::normalization::title::{MatchConfig, TitleFields};

pub const JIKAN_BASE: &str = "https://api.jikan.moe/v4";
pub const SOURCE: &str = "mal";

/// Pause after a 429 before the call is reported as failed.
const RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Manga {
    mal_id: i64,
    title: Option<String>,
    title_japanese: Option<String>,
    title_english: Option<String>,
    score: Option<f64>,
    members: Option<i64>,
    rank: Option<i64>,
    popularity: Option<i64>,
}

impl TitleFields for Manga {
    fn title_fields(&self) -> Vec<&str> {
        [&self.title_japanese, &self.title, &self.title_english]
            .into_iter()
            .flatten()
            .map(String::as_str)
            .collect()
    }
}

impl Manga {
    fn metrics(&self) -> Vec<(&'static str, MetricValue)> {
        [
            ("score", self.score.map(MetricValue::from)),
            ("members", self.members.map(MetricValue::from)),
            ("rank", self.rank.map(MetricValue::from)),
            ("popularity", self.popularity.map(MetricValue::from)),
        ]
        .into_iter()
        .filter_map(|(k, v)| v.map(|v| (k, v)))
        .collect()
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    data: Vec<Manga>,
}

#[derive(Debug, Deserialize)]
struct ItemResponse {
    data: Option<Manga>,
}

/// MyAnimeList via the public Jikan REST API (no key, about 60 requests a minute).
pub struct JikanCollector {
    client: Client,
    base: String,
    matcher: MatchConfig,
}

impl JikanCollector {
    pub fn new(matcher: MatchConfig, timeout: Duration) -> Self {
        Self {
            client: http_client(timeout),
            base: JIKAN_BASE.to_string(),
            matcher,
        }
    }

    async fn get(&self, url: &str, query: &[(&str, &str)]) -> Result<reqwest::Response> {
        let resp = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;
        if resp.status() == StatusCode::TOO_MANY_REQUESTS {
            warn!(source = SOURCE, backoff_secs = RATE_LIMIT_BACKOFF.as_secs(), "jikan rate limited");
            sleep(RATE_LIMIT_BACKOFF).await;
            bail!("jikan rate limited");
        }
        Ok(resp.error_for_status()?)
    }

    async fn search(&self, title: &str) -> Result<Vec<Manga>> {
        let url = format!("{}/manga", self.base);
        let resp = self
            .get(&url, &[("q", title), ("limit", "10"), ("order_by", "score"), ("sort", "desc")])
            .await?;
        let body: SearchResponse = resp.json().await.context("decoding jikan search")?;
        Ok(body.data)
    }

    async fn fetch_by_id(&self, id: &str) -> Result<Option<Manga>> {
        let url = format!("{}/manga/{}", self.base, urlencoding::encode(id));
        let body: ItemResponse = self.get(&url, &[]).await?.json().await.context("decoding jikan manga")?;
        Ok(body.data)
    }
}

#[async_trait::async_trait]
impl Collector for JikanCollector {
    fn source(&self) -> &str {
        SOURCE
    }

    fn rate_limit(&self) -> Duration {
        Duration::from_millis(1200)
    }

    async fn collect_one(&self, ctx: &CollectContext, target: &RefreshTarget) -> Result<bool> {
        let mut fetched: Option<Manga> = None;
        let slot = &mut fetched;
        let id = ctx
            .lookup_or_match(target, move || async move {
                let candidates = self.search(&target.title).await?;
                let hit = self.matcher.best_match(&target.title, &candidates).map(|(m, score)| {
                    *slot = Some(m.clone());
                    Matched {
                        external_id: m.mal_id.to_string(),
                        external_title: m.title_japanese.clone().or_else(|| m.title.clone()).unwrap_or_default(),
                        score,
                    }
                });
                Ok::<_, anyhow::Error>(hit)
            })
            .await?;
        let Some(id) = id else {
            return Ok(false);
        };
        let manga = match fetched {
            Some(m) => Some(m),
            None => self.fetch_by_id(&id.external_id).await?,
        };
        match manga {
            Some(m) => Ok(ctx.save_metrics(&target.title, m.metrics()).await? > 0),
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn search_payload_and_metrics() {
        let body = json!({"pagination": {}, "data": [
            {"mal_id": 11, "title": "Kingdom", "title_japanese": "キングダム", "title_english": "Kingdom",
             "score": 9.08, "members": 120000, "rank": 7, "popularity": 300},
            {"mal_id": 12, "title": "Kingdom Hearts", "title_japanese": null, "title_english": null,
             "score": null, "members": 5000, "rank": null, "popularity": null}
        ]});
        let parsed: SearchResponse = serde_json::from_value(body).unwrap();
        assert_eq!(parsed.data.len(), 2);

        let (m, score) = MatchConfig::default().best_match("キングダム", &parsed.data).unwrap();
        assert_eq!(m.mal_id, 11);
        assert_eq!(score, 1.0);

        let names: Vec<&str> = parsed.data[1].metrics().iter().map(|(n, _)| *n).collect();
        assert_eq!(names, vec!["members"]);
        assert_eq!(parsed.data[0].metrics().len(), 4);
    }

    #[test]
    fn empty_search_decodes() {
        let parsed: SearchResponse = serde_json::from_value(json!({"data": []})).unwrap();
        assert!(parsed.data.is_empty());
    }
}
