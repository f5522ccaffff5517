use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use super::{http_client, CollectContext, Collector, Matched};
use crate::database_ops::models::{MetricValue, RefreshTarget};
use crate::normalization::title::{MatchConfig, TitleFields};

pub const ANILIST_URL: &str = "https://graphql.anilist.co";
pub const SOURCE: &str = "anilist";

const MEDIA_FIELDS: &str = "id title { romaji english native } synonyms averageScore popularity favourites status";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct MediaTitle {
    romaji: Option<String>,
    english: Option<String>,
    native: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Media {
    id: i64,
    #[serde(default)]
    title: MediaTitle,
    #[serde(default)]
    synonyms: Vec<String>,
    average_score: Option<i64>,
    popularity: Option<i64>,
    favourites: Option<i64>,
    status: Option<String>,
}

impl Media {
    fn display_title(&self) -> String {
        self.title
            .native
            .clone()
            .or_else(|| self.title.romaji.clone())
            .unwrap_or_default()
    }

    fn metrics(&self) -> Vec<(&'static str, MetricValue)> {
        let mut out = Vec::new();
        if let Some(v) = self.average_score {
            out.push(("score", v.into()));
        }
        if let Some(v) = self.popularity {
            out.push(("popularity", v.into()));
        }
        if let Some(v) = self.favourites {
            out.push(("members", v.into()));
        }
        if let Some(s) = self.status.as_deref().filter(|s| !s.is_empty()) {
            out.push(("status", s.into()));
        }
        out
    }
}

impl TitleFields for Media {
    fn title_fields(&self) -> Vec<&str> {
        [&self.title.native, &self.title.romaji, &self.title.english]
            .into_iter()
            .flatten()
            .map(String::as_str)
            .chain(self.synonyms.iter().map(String::as_str))
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct PageData {
    #[serde(rename = "Page")]
    page: Option<MediaPage>,
}

#[derive(Debug, Deserialize)]
struct MediaPage {
    #[serde(default)]
    media: Vec<Media>,
}

#[derive(Debug, Deserialize)]
struct MediaData {
    #[serde(rename = "Media")]
    media: Option<Media>,
}

/// AniList GraphQL: search by title, then fetch by cached id on later runs.
pub struct AnilistCollector {
    client: Client,
    endpoint: String,
    matcher: MatchConfig,
}

impl AnilistCollector {
    pub fn new(matcher: MatchConfig, timeout: Duration) -> Self {
        Self {
            client: http_client(timeout),
            endpoint: ANILIST_URL.to_string(),
            matcher,
        }
    }

    async fn post<T: for<'de> Deserialize<'de>>(&self, query: String, variables: serde_json::Value) -> Result<Option<T>> {
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await
            .context("anilist request")?
            .error_for_status()?;
        let env: Envelope<T> = resp.json().await.context("decoding anilist response")?;
        Ok(env.data)
    }

    async fn search(&self, title: &str) -> Result<Vec<Media>> {
        let query = format!(
            "query ($search: String) {{ Page(page: 1, perPage: 10) {{ media(search: $search, type: MANGA, sort: SEARCH_MATCH) {{ {MEDIA_FIELDS} }} }} }}"
        );
        let data: Option<PageData> = self.post(query, json!({ "search": title })).await?;
        Ok(data.and_then(|d| d.page).map(|p| p.media).unwrap_or_default())
    }

    async fn fetch_by_id(&self, id: i64) -> Result<Option<Media>> {
        let query = format!("query ($id: Int) {{ Media(id: $id, type: MANGA) {{ {MEDIA_FIELDS} }} }}");
        let data: Option<MediaData> = self.post(query, json!({ "id": id })).await?;
        Ok(data.and_then(|d| d.media))
    }
}

pub(crate) fn pick<'a>(matcher: &MatchConfig, title: &str, candidates: &'a [Media]) -> Option<(&'a Media, f64)> {
    matcher.best_match(title, candidates)
}

#[async_trait::async_trait]
impl Collector for AnilistCollector {
    fn source(&self) -> &str {
        SOURCE
    }

    fn rate_limit(&self) -> Duration {
        Duration::from_secs(1)
    }

    async fn collect_one(&self, ctx: &CollectContext, target: &RefreshTarget) -> Result<bool> {
        let mut fetched: Option<Media> = None;
        let slot = &mut fetched;
        let id = ctx
            .lookup_or_match(target, move || async move {
                let candidates = self.search(&target.title).await?;
                Ok::<_, anyhow::Error>(pick(&self.matcher, &target.title, &candidates).map(|(m, score)| {
                    *slot = Some(m.clone());
                    Matched {
                        external_id: m.id.to_string(),
                        external_title: m.display_title(),
                        score,
                    }
                }))
            })
            .await?;
        let Some(id) = id else {
            return Ok(false);
        };
        let media = match fetched {
            Some(m) => Some(m),
            None => {
                let media_id: i64 = id
                    .external_id
                    .parse()
                    .with_context(|| format!("cached anilist id {:?}", id.external_id))?;
                self.fetch_by_id(media_id).await?
            }
        };
        let Some(media) = media else {
            return Ok(false);
        };
        Ok(ctx.save_metrics(&target.title, media.metrics()).await? > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page() -> Vec<Media> {
        let body = json!({"data": {"Page": {"media": [
            {"id": 1, "title": {"romaji": "Gekai Elise", "english": "Surgeon Elise", "native": "外科医エリーゼ"},
             "synonyms": [], "averageScore": 74, "popularity": 5120, "favourites": 310, "status": "FINISHED"},
            {"id": 2, "title": {"romaji": "Kusuriya no Hitorigoto", "english": null, "native": "薬屋のひとりごと"},
             "synonyms": ["The Apothecary Diaries"], "averageScore": null, "popularity": 90000, "favourites": null, "status": "RELEASING"}
        ]}}});
        let env: Envelope<PageData> = serde_json::from_value(body).unwrap();
        env.data.unwrap().page.unwrap().media
    }

    #[test]
    fn matches_any_title_variant() {
        let media = page();
        let matcher = MatchConfig::default();
        let (m, score) = pick(&matcher, "外科医エリーゼ (1)", &media).unwrap();
        assert_eq!(m.id, 1);
        assert_eq!(score, 1.0);
        let (m, _) = pick(&matcher, "the apothecary diaries", &media).unwrap();
        assert_eq!(m.id, 2);
        assert!(pick(&matcher, "まったく別の作品", &media).is_none());
    }

    #[test]
    fn metrics_skip_missing_values() {
        let media = page();
        let names: Vec<&str> = media[0].metrics().iter().map(|(n, _)| *n).collect();
        assert_eq!(names, vec!["score", "popularity", "members", "status"]);
        let names: Vec<&str> = media[1].metrics().iter().map(|(n, _)| *n).collect();
        assert_eq!(names, vec!["popularity", "status"]);
        assert_eq!(media[1].display_title(), "薬屋のひとりごと");
    }
}
