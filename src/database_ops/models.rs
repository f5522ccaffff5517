use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Sentinel external id recording "looked up, nothing matched".
pub const NOT_FOUND: &str = "NOT_FOUND";

/// One ranked item as produced by a source adapter. Also the exact shape of
/// the per-platform JSON backup files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub rank: i32,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub genre: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
}

impl Entry {
    pub fn new(rank: i32, title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            rank,
            title: title.into(),
            url: url.into(),
            genre: None,
            thumbnail_url: None,
        }
    }

    pub fn with_genre(mut self, genre: impl Into<String>) -> Self {
        self.genre = Some(genre.into());
        self
    }
}

/// `rankings` row: (date, platform, sub_category, rank) -> title.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankingRow {
    pub date: NaiveDate,
    pub platform: String,
    pub sub_category: String,
    pub rank: i32,
    pub title: String,
    pub title_translated: String,
    pub genre: String,
    pub genre_translated: String,
    pub url: String,
    pub is_flagged: bool,
}

/// One sighting of a work in a ranking, upserted into `works`.
#[derive(Debug, Clone, PartialEq)]
pub struct RawWorkSighting {
    pub platform: String,
    pub title: String,
    pub title_translated: String,
    pub url: String,
    pub thumbnail_url: String,
    pub genre: String,
    pub genre_translated: String,
    pub is_flagged: bool,
    pub seen_date: NaiveDate,
    /// Only set for the overall ranking (`sub_category == ""`).
    pub rank: Option<i32>,
}

/// Deep metadata pulled from a work's detail page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkDetail {
    pub author: String,
    pub publisher: String,
    pub label: String,
    pub tags: Vec<String>,
    pub description: String,
    pub genre: String,
    pub thumbnail_url: String,
    pub hearts: Option<i64>,
    pub favorites: Option<i64>,
    pub rating: Option<f64>,
    pub review_count: Option<i64>,
}

/// A row of `works`.
#[derive(Debug, Clone, PartialEq)]
pub struct RawWork {
    pub id: i64,
    pub platform: String,
    pub title: String,
    pub title_translated: String,
    pub url: String,
    pub thumbnail_url: String,
    pub genre: String,
    pub genre_translated: String,
    pub is_flagged: bool,
    pub first_seen_date: Option<NaiveDate>,
    pub last_seen_date: Option<NaiveDate>,
    pub best_rank: Option<i32>,
    pub detail: WorkDetail,
    pub detail_scraped_at: Option<DateTime<Utc>>,
    pub reviews_scraped_at: Option<DateTime<Utc>>,
    pub unified_work_id: Option<i64>,
    pub updated_at: DateTime<Utc>,
}

/// The mergeable attributes of a UnifiedWork. Every field has a merge policy
/// in `normalization::merge`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UnifiedFields {
    pub title_canonical: String,
    pub author: String,
    pub publisher: String,
    pub genre: String,
    pub genre_translated: String,
    pub tags: Vec<String>,
    pub description: String,
    pub is_flagged: bool,
    pub thumbnail_url: String,
}

impl UnifiedFields {
    /// Fields a raw work contributes to its canonical record.
    pub fn from_raw(raw: &RawWork) -> Self {
        let genre = if raw.detail.genre.trim().is_empty() {
            raw.genre.clone()
        } else {
            raw.detail.genre.clone()
        };
        let thumbnail_url = if raw.thumbnail_url.trim().is_empty() {
            raw.detail.thumbnail_url.clone()
        } else {
            raw.thumbnail_url.clone()
        };
        Self {
            title_canonical: raw.title.clone(),
            author: raw.detail.author.clone(),
            publisher: raw.detail.publisher.clone(),
            genre,
            genre_translated: raw.genre_translated.clone(),
            tags: raw.detail.tags.clone(),
            description: raw.detail.description.clone(),
            is_flagged: raw.is_flagged,
            thumbnail_url,
        }
    }
}

/// A row of `unified_works`, keyed by `title_translated`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnifiedWork {
    pub id: i64,
    pub title_translated: String,
    pub fields: UnifiedFields,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Review {
    pub reviewer_name: String,
    pub body: String,
    pub rating: Option<i32>,
    pub likes_count: i32,
    pub is_spoiler: bool,
    pub reviewed_at: Option<DateTime<Utc>>,
}

/// `external_ids` row: (platform, title, source) -> opaque id + confidence.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalIdentifier {
    pub platform: String,
    pub title: String,
    pub source: String,
    pub external_id: String,
    pub external_title: String,
    pub match_score: f64,
}

impl ExternalIdentifier {
    pub fn found(
        platform: &str,
        title: &str,
        source: &str,
        external_id: impl Into<String>,
        external_title: impl Into<String>,
        match_score: f64,
    ) -> Self {
        Self {
            platform: platform.to_string(),
            title: title.to_string(),
            source: source.to_string(),
            external_id: external_id.into(),
            external_title: external_title.into(),
            match_score,
        }
    }

    pub fn not_found(platform: &str, title: &str, source: &str) -> Self {
        Self::found(platform, title, source, NOT_FOUND, "", 0.0)
    }

    pub fn is_not_found(&self) -> bool {
        self.external_id == NOT_FOUND
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetricValue {
    Number(f64),
    Text(String),
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        MetricValue::Number(v)
    }
}

impl From<i64> for MetricValue {
    fn from(v: i64) -> Self {
        MetricValue::Number(v as f64)
    }
}

impl From<&str> for MetricValue {
    fn from(v: &str) -> Self {
        MetricValue::Text(v.to_string())
    }
}

impl From<String> for MetricValue {
    fn from(v: String) -> Self {
        MetricValue::Text(v)
    }
}

/// `external_data` row: (title, source, metric, collected date) -> value.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalMetric {
    pub title: String,
    pub source: String,
    pub metric_name: String,
    pub value: MetricValue,
    pub collected_date: NaiveDate,
}

/// A stored work selected for a deeper fetch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct RefreshTarget {
    pub platform: String,
    pub title: String,
    pub url: String,
}

impl From<&RawWork> for RefreshTarget {
    fn from(w: &RawWork) -> Self {
        Self {
            platform: w.platform.clone(),
            title: w.title.clone(),
            url: w.url.clone(),
        }
    }
}
