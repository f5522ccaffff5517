use std::collections::BTreeMap;
use std::fmt;

use anyhow::Result;
use chrono::NaiveDate;

use super::models::{
    ExternalIdentifier, ExternalMetric, RankingRow, RawWork, RawWorkSighting, Review,
    UnifiedFields, UnifiedWork, WorkDetail,
};

/// Persistence surface shared by every agent, refresh runner and collector.
///
/// Every write is an upsert whose conflict handling applies the merge rules in
/// `normalization::merge`, so implementations must tolerate concurrent callers
/// without any locking on the caller's side.
#[async_trait::async_trait]
pub trait ResolutionStore: Send + Sync {
    /// Inserts or non-destructively merges a sighting; returns the row id.
    async fn upsert_raw_work(&self, sighting: &RawWorkSighting) -> Result<i64>;

    /// Upserts ranking rows on (date, platform, sub_category, rank).
    async fn record_rankings(&self, rows: &[RankingRow]) -> Result<usize>;

    /// Creates or enriches the canonical record keyed by `title_translated`.
    async fn upsert_unified_work(&self, title_translated: &str, fields: &UnifiedFields)
        -> Result<i64>;

    async fn link(&self, raw_work_id: i64, unified_id: i64) -> Result<()>;

    async fn raw_work(&self, platform: &str, title: &str) -> Result<Option<RawWork>>;

    async fn raw_works(&self) -> Result<Vec<RawWork>>;

    async fn unlinked_raw_works(&self) -> Result<Vec<RawWork>>;

    async fn unified_works(&self) -> Result<Vec<UnifiedWork>>;

    /// Merges detail into the row and stamps `detail_scraped_at`.
    async fn save_work_detail(
        &self,
        platform: &str,
        title: &str,
        detail: &WorkDetail,
    ) -> Result<Option<RawWork>>;

    /// Upserts reviews and stamps `reviews_scraped_at`.
    async fn save_reviews(&self, platform: &str, title: &str, reviews: &[Review]) -> Result<usize>;

    async fn external_ids(&self, source: &str) -> Result<Vec<ExternalIdentifier>>;

    /// Stores the id unless an existing row for the key has a higher match score.
    /// Returns whether the row was written.
    async fn save_external_id(&self, id: &ExternalIdentifier) -> Result<bool>;

    async fn save_external_metrics(&self, metrics: &[ExternalMetric]) -> Result<usize>;

    async fn rankings_on(
        &self,
        date: NaiveDate,
        platform: &str,
        sub_category: &str,
    ) -> Result<Vec<RankingRow>>;

    async fn previous_ranking_date(
        &self,
        before: NaiveDate,
        platform: &str,
        sub_category: &str,
    ) -> Result<Option<NaiveDate>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankChange {
    /// Moved up by n places.
    Up(i32),
    Down(i32),
    Same,
    New,
}

impl RankChange {
    pub fn between(previous: Option<i32>, current: i32) -> Self {
        match previous {
            None => RankChange::New,
            Some(p) if p > current => RankChange::Up(p - current),
            Some(p) if p < current => RankChange::Down(current - p),
            Some(_) => RankChange::Same,
        }
    }
}

impl fmt::Display for RankChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RankChange::Up(n) => write!(f, "+{n}"),
            RankChange::Down(n) => write!(f, "-{n}"),
            RankChange::Same => write!(f, "0"),
            RankChange::New => write!(f, "NEW"),
        }
    }
}

/// Per-title movement against the platform's previous available date.
/// Empty when there is no earlier snapshot.
pub async fn rank_changes(
    store: &dyn ResolutionStore,
    date: NaiveDate,
    platform: &str,
    sub_category: &str,
) -> Result<BTreeMap<String, RankChange>> {
    let Some(prev_date) = store
        .previous_ranking_date(date, platform, sub_category)
        .await?
    else {
        return Ok(BTreeMap::new());
    };
    let previous: BTreeMap<String, i32> = store
        .rankings_on(prev_date, platform, sub_category)
        .await?
        .into_iter()
        .map(|r| (r.title, r.rank))
        .collect();
    Ok(store
        .rankings_on(date, platform, sub_category)
        .await?
        .into_iter()
        .map(|r| {
            let change = RankChange::between(previous.get(&r.title).copied(), r.rank);
            (r.title, change)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rank_change_display() {
        assert_eq!(RankChange::between(Some(10), 5).to_string(), "+5");
        assert_eq!(RankChange::between(Some(3), 7).to_string(), "-4");
        assert_eq!(RankChange::between(Some(3), 3), RankChange::Same);
        assert_eq!(RankChange::between(None, 1).to_string(), "NEW");
    }
}
