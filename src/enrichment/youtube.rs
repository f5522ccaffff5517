use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use serde::Deserialize;

use super::{http_client, CollectContext, Collector, Matched};
use crate::database_ops::models::{MetricValue, RefreshTarget};

pub const YOUTUBE_API: &str = "https://www.googleapis.com/youtube/v3";
pub const SOURCE: &str = "youtube";

/// Search results are a loose match, so stored ids carry a fixed confidence.
const SEARCH_MATCH_SCORE: f64 = 0.8;
const STORED_VIDEOS: usize = 5;
const STATS_VIDEOS: usize = 3;

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    items: Vec<SearchItem>,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    id: SearchId,
    snippet: Option<Snippet>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchId {
    video_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Snippet {
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VideosResponse {
    #[serde(default)]
    items: Vec<VideoItem>,
}

#[derive(Debug, Deserialize)]
struct VideoItem {
    statistics: Option<Statistics>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Statistics {
    /// The API returns counts as decimal strings.
    view_count: Option<String>,
}

/// View counts of a title's promotional videos via the YouTube Data API.
/// Needs `YOUTUBE_API_KEY`; without it the collector is disabled.
pub struct YoutubeCollector {
    client: Client,
    api_key: Option<String>,
    max_titles: usize,
    collected: AtomicUsize,
}

impl YoutubeCollector {
    pub fn new(api_key: Option<String>, max_titles: usize, timeout: Duration) -> Self {
        Self {
            client: http_client(timeout),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            max_titles,
            collected: AtomicUsize::new(0),
        }
    }

    fn key(&self) -> Result<&str> {
        self.api_key
            .as_deref()
            .context("YOUTUBE_API_KEY not configured")
    }

    async fn search(&self, title: &str) -> Result<Vec<(String, String)>> {
        let q = format!("{title} PV 公式");
        let max = STORED_VIDEOS.to_string();
        let resp: SearchResponse = self
            .client
            .get(format!("{YOUTUBE_API}/search"))
            .query(&[
                ("part", "snippet"),
                ("type", "video"),
                ("maxResults", max.as_str()),
                ("q", q.as_str()),
                ("key", self.key()?),
            ])
            .send()
            .await
            .context("youtube search")?
            .error_for_status()?
            .json()
            .await
            .context("decoding youtube search")?;
        Ok(resp
            .items
            .into_iter()
            .filter_map(|i| {
                let title = i.snippet.and_then(|s| s.title).unwrap_or_default();
                i.id.video_id.map(|id| (id, title))
            })
            .collect())
    }

    async fn view_counts(&self, video_ids: &[&str]) -> Result<Vec<i64>> {
        if video_ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids = video_ids.join(",");
        let resp: VideosResponse = self
            .client
            .get(format!("{YOUTUBE_API}/videos"))
            .query(&[("part", "statistics"), ("id", ids.as_str()), ("key", self.key()?)])
            .send()
            .await
            .context("youtube videos")?
            .error_for_status()?
            .json()
            .await
            .context("decoding youtube videos")?;
        Ok(view_counts(&resp))
    }
}

fn view_counts(resp: &VideosResponse) -> Vec<i64> {
    resp.items
        .iter()
        .filter_map(|v| v.statistics.as_ref()?.view_count.as_deref()?.parse().ok())
        .collect()
}

fn view_metrics(views: &[i64]) -> Vec<(&'static str, MetricValue)> {
    let Some(max) = views.iter().max() else {
        return Vec::new();
    };
    vec![
        ("pv_views", (*max).into()),
        ("pv_count", (views.len() as i64).into()),
        ("total_views", views.iter().sum::<i64>().into()),
    ]
}

#[async_trait::async_trait]
impl Collector for YoutubeCollector {
    fn source(&self) -> &str {
        SOURCE
    }

    fn rate_limit(&self) -> Duration {
        Duration::from_secs(2)
    }

    fn enabled(&self) -> bool {
        self.api_key.is_some()
    }

    async fn collect_one(&self, ctx: &CollectContext, target: &RefreshTarget) -> Result<bool> {
        if self.collected.load(Ordering::SeqCst) >= self.max_titles {
            return Ok(false);
        }
        let id = ctx
            .lookup_or_match(target, move || async move {
                let results = self.search(&target.title).await?;
                let Some((_, first_title)) = results.first() else {
                    return Ok::<_, anyhow::Error>(None);
                };
                let ids: Vec<&str> = results.iter().take(STORED_VIDEOS).map(|(id, _)| id.as_str()).collect();
                Ok(Some(Matched {
                    external_id: ids.join(","),
                    external_title: first_title.chars().take(100).collect(),
                    score: SEARCH_MATCH_SCORE,
                }))
            })
            .await?;
        let Some(id) = id else {
            return Ok(false);
        };
        self.collected.fetch_add(1, Ordering::SeqCst);
        let ids: Vec<&str> = id
            .external_id
            .split(',')
            .filter(|s| !s.is_empty())
            .take(STATS_VIDEOS)
            .collect();
        let views = self.view_counts(&ids).await?;
        Ok(ctx.save_metrics(&target.title, view_metrics(&views)).await? > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_key_disables_collector() {
        let c = YoutubeCollector::new(None, 80, Duration::from_secs(5));
        assert!(!c.enabled());
        let c = YoutubeCollector::new(Some("  ".into()), 80, Duration::from_secs(5));
        assert!(!c.enabled());
        let c = YoutubeCollector::new(Some("abc".into()), 80, Duration::from_secs(5));
        assert!(c.enabled());
    }

    #[test]
    fn statistics_parse_and_aggregate() {
        let resp: VideosResponse = serde_json::from_value(json!({"items": [
            {"statistics": {"viewCount": "1200"}},
            {"statistics": {"viewCount": "300"}},
            {"statistics": {}},
            {}
        ]}))
        .unwrap();
        let views = view_counts(&resp);
        assert_eq!(views, vec![1200, 300]);
        let metrics = view_metrics(&views);
        assert_eq!(metrics[0], ("pv_views", MetricValue::Number(1200.0)));
        assert_eq!(metrics[1], ("pv_count", MetricValue::Number(2.0)));
        assert_eq!(metrics[2], ("total_views", MetricValue::Number(1500.0)));
        assert!(view_metrics(&[]).is_empty());
    }

    #[test]
    fn search_items_without_video_id_are_dropped() {
        let resp: SearchResponse = serde_json::from_value(json!({"items": [
            {"id": {"kind": "youtube#video", "videoId": "abc"}, "snippet": {"title": "PV"}},
            {"id": {"kind": "youtube#channel", "channelId": "zzz"}}
        ]}))
        .unwrap();
        let kept: Vec<_> = resp.items.into_iter().filter_map(|i| i.id.video_id).collect();
        assert_eq!(kept, vec!["abc".to_string()]);
    }
}
