use std::collections::BTreeMap;

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::Mutex;

use super::models::{
    ExternalIdentifier, ExternalMetric, RankingRow, RawWork, RawWorkSighting, Review,
    UnifiedFields, UnifiedWork, WorkDetail,
};
use super::store::ResolutionStore;
use crate::normalization::merge::{merge_detail, merge_sighting, raw_work_from_sighting};

type ReviewKey = (String, String, String, Option<DateTime<Utc>>);

#[derive(Default)]
struct Inner {
    next_id: i64,
    works: BTreeMap<(String, String), RawWork>,
    unified: BTreeMap<String, UnifiedWork>,
    rankings: BTreeMap<(NaiveDate, String, String, i32), RankingRow>,
    external_ids: BTreeMap<(String, String, String), ExternalIdentifier>,
    external_data: BTreeMap<(String, String, String, NaiveDate), ExternalMetric>,
    reviews: BTreeMap<ReviewKey, Review>,
}

impl Inner {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Process-local store for dry runs and tests. Each operation holds the lock
/// for its whole read-merge-write, which gives the same atomicity as a
/// single upsert statement.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all_rankings(&self) -> Vec<RankingRow> {
        self.inner.lock().await.rankings.values().cloned().collect()
    }

    pub async fn reviews_for(&self, platform: &str, title: &str) -> Vec<Review> {
        self.inner
            .lock()
            .await
            .reviews
            .iter()
            .filter(|((p, t, _, _), _)| p == platform && t == title)
            .map(|(_, r)| r.clone())
            .collect()
    }

    pub async fn external_metrics(&self) -> Vec<ExternalMetric> {
        self.inner.lock().await.external_data.values().cloned().collect()
    }

    pub async fn external_id(&self, platform: &str, title: &str, source: &str) -> Option<ExternalIdentifier> {
        self.inner
            .lock()
            .await
            .external_ids
            .get(&(platform.to_string(), title.to_string(), source.to_string()))
            .cloned()
    }
}

#[async_trait::async_trait]
impl ResolutionStore for MemoryStore {
    async fn upsert_raw_work(&self, sighting: &RawWorkSighting) -> Result<i64> {
        let mut inner = self.inner.lock().await;
        let key = (sighting.platform.clone(), sighting.title.clone());
        if let Some(work) = inner.works.get_mut(&key) {
            merge_sighting(work, sighting);
            work.updated_at = Utc::now();
            return Ok(work.id);
        }
        let id = inner.next_id();
        inner.works.insert(key, raw_work_from_sighting(id, sighting));
        Ok(id)
    }

    async fn record_rankings(&self, rows: &[RankingRow]) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        for row in rows {
            let key = (row.date, row.platform.clone(), row.sub_category.clone(), row.rank);
            inner.rankings.insert(key, row.clone());
        }
        Ok(rows.len())
    }

    async fn upsert_unified_work(&self, title_translated: &str, fields: &UnifiedFields) -> Result<i64> {
        let key = title_translated.trim().to_string();
        anyhow::ensure!(!key.is_empty(), "unified work needs a non-empty translated title");
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.unified.get_mut(&key) {
            existing.fields = existing.fields.merge(fields);
            return Ok(existing.id);
        }
        let id = inner.next_id();
        // merging with the empty record applies the same normalization (tag order, blanks)
        let fields = UnifiedFields::default().merge(fields);
        inner.unified.insert(
            key.clone(),
            UnifiedWork {
                id,
                title_translated: key,
                fields,
            },
        );
        Ok(id)
    }

    async fn link(&self, raw_work_id: i64, unified_id: i64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        anyhow::ensure!(
            inner.unified.values().any(|u| u.id == unified_id),
            "unknown unified work {unified_id}"
        );
        let work = inner
            .works
            .values_mut()
            .find(|w| w.id == raw_work_id)
            .ok_or_else(|| anyhow::anyhow!("unknown work {raw_work_id}"))?;
        work.unified_work_id = Some(unified_id);
        Ok(())
    }

    async fn raw_work(&self, platform: &str, title: &str) -> Result<Option<RawWork>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .works
            .get(&(platform.to_string(), title.to_string()))
            .cloned())
    }

    async fn raw_works(&self) -> Result<Vec<RawWork>> {
        Ok(self.inner.lock().await.works.values().cloned().collect())
    }

    async fn unlinked_raw_works(&self) -> Result<Vec<RawWork>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .works
            .values()
            .filter(|w| w.unified_work_id.is_none())
            .cloned()
            .collect())
    }

    async fn unified_works(&self) -> Result<Vec<UnifiedWork>> {
        Ok(self.inner.lock().await.unified.values().cloned().collect())
    }

    async fn save_work_detail(
        &self,
        platform: &str,
        title: &str,
        detail: &WorkDetail,
    ) -> Result<Option<RawWork>> {
        let mut inner = self.inner.lock().await;
        let Some(work) = inner.works.get_mut(&(platform.to_string(), title.to_string())) else {
            return Ok(None);
        };
        work.detail = merge_detail(&work.detail, detail);
        let now = Utc::now();
        work.detail_scraped_at = Some(now);
        work.updated_at = now;
        Ok(Some(work.clone()))
    }

    async fn save_reviews(&self, platform: &str, title: &str, reviews: &[Review]) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        for r in reviews {
            let key = (
                platform.to_string(),
                title.to_string(),
                r.reviewer_name.clone(),
                r.reviewed_at,
            );
            inner.reviews.insert(key, r.clone());
        }
        if let Some(work) = inner.works.get_mut(&(platform.to_string(), title.to_string())) {
            let now = Utc::now();
            work.reviews_scraped_at = Some(now);
            work.updated_at = now;
        }
        Ok(reviews.len())
    }

    async fn external_ids(&self, source: &str) -> Result<Vec<ExternalIdentifier>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .external_ids
            .values()
            .filter(|e| e.source == source)
            .cloned()
            .collect())
    }

    async fn save_external_id(&self, id: &ExternalIdentifier) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let key = (id.platform.clone(), id.title.clone(), id.source.clone());
        if let Some(existing) = inner.external_ids.get(&key) {
            if existing.match_score > id.match_score {
                return Ok(false);
            }
        }
        inner.external_ids.insert(key, id.clone());
        Ok(true)
    }

    async fn save_external_metrics(&self, metrics: &[ExternalMetric]) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        for m in metrics {
            let key = (
                m.title.clone(),
                m.source.clone(),
                m.metric_name.clone(),
                m.collected_date,
            );
            inner.external_data.insert(key, m.clone());
        }
        Ok(metrics.len())
    }

    async fn rankings_on(
        &self,
        date: NaiveDate,
        platform: &str,
        sub_category: &str,
    ) -> Result<Vec<RankingRow>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .rankings
            .values()
            .filter(|r| r.date == date && r.platform == platform && r.sub_category == sub_category)
            .cloned()
            .collect())
    }

    async fn previous_ranking_date(
        &self,
        before: NaiveDate,
        platform: &str,
        sub_category: &str,
    ) -> Result<Option<NaiveDate>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .rankings
            .values()
            .filter(|r| r.date < before && r.platform == platform && r.sub_category == sub_category)
            .map(|r| r.date)
            .max())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::models::NOT_FOUND;
    use crate::database_ops::store::{rank_changes, RankChange};

    fn row(date: NaiveDate, rank: i32, title: &str) -> RankingRow {
        RankingRow {
            date,
            platform: "piccoma".into(),
            sub_category: String::new(),
            rank,
            title: title.into(),
            title_translated: String::new(),
            genre: String::new(),
            genre_translated: String::new(),
            url: format!("https://piccoma.com/{rank}"),
            is_flagged: false,
        }
    }

    #[tokio::test]
    async fn external_ids_only_upgrade() {
        let store = MemoryStore::new();
        let miss = ExternalIdentifier::not_found("piccoma", "Berserk", "anilist");
        assert!(store.save_external_id(&miss).await.unwrap());

        let hit = ExternalIdentifier::found("piccoma", "Berserk", "anilist", "30002", "Berserk", 0.92);
        assert!(store.save_external_id(&hit).await.unwrap());

        let weaker = ExternalIdentifier::found("piccoma", "Berserk", "anilist", "999", "Berserker", 0.8);
        assert!(!store.save_external_id(&weaker).await.unwrap());
        assert!(!store.save_external_id(&miss).await.unwrap());

        let stored = store.external_id("piccoma", "Berserk", "anilist").await.unwrap();
        assert_eq!(stored.external_id, "30002");
        assert_ne!(stored.external_id, NOT_FOUND);
    }

    #[tokio::test]
    async fn unified_upserts_merge_both_ways() {
        let store = MemoryStore::new();
        let a = UnifiedFields {
            author: "Chugong".into(),
            tags: vec!["action".into()],
            ..UnifiedFields::default()
        };
        let b = UnifiedFields {
            description: "Hunters and gates.".into(),
            tags: vec!["fantasy".into()],
            is_flagged: true,
            ..UnifiedFields::default()
        };
        let id1 = store.upsert_unified_work("나 혼자만 레벨업", &a).await.unwrap();
        let id2 = store.upsert_unified_work("나 혼자만 레벨업", &b).await.unwrap();
        assert_eq!(id1, id2);
        let u = store.unified_works().await.unwrap().remove(0);
        assert_eq!(u.fields.author, "Chugong");
        assert_eq!(u.fields.tags, vec!["action", "fantasy"]);
        assert!(u.fields.is_flagged);
        assert!(store.upsert_unified_work("  ", &a).await.is_err());
    }

    #[tokio::test]
    async fn detail_genre_survives_later_sightings() {
        let store = MemoryStore::new();
        let seen = NaiveDate::from_ymd_opt(2026, 10, 18).unwrap();
        let sighting = RawWorkSighting {
            platform: "piccoma".into(),
            title: "外科医エリーゼ".into(),
            title_translated: String::new(),
            url: "https://piccoma.com/elise".into(),
            thumbnail_url: "https://img/rank.jpg".into(),
            genre: "恋愛".into(),
            genre_translated: "연애".into(),
            is_flagged: false,
            seen_date: seen,
            rank: Some(3),
        };
        store.upsert_raw_work(&sighting).await.unwrap();
        let detail = WorkDetail {
            genre: "ファンタジー".into(),
            thumbnail_url: "https://img/detail.jpg".into(),
            ..WorkDetail::default()
        };
        store.save_work_detail("piccoma", "外科医エリーゼ", &detail).await.unwrap();
        store.upsert_raw_work(&sighting).await.unwrap();

        let w = store.raw_work("piccoma", "外科医エリーゼ").await.unwrap().unwrap();
        assert_eq!(w.genre, "恋愛");
        assert_eq!(w.thumbnail_url, "https://img/rank.jpg");
        assert_eq!(w.detail.genre, "ファンタジー");
        assert_eq!(w.detail.thumbnail_url, "https://img/detail.jpg");
    }

    #[tokio::test]
    async fn rank_changes_against_previous_date() {
        let store = MemoryStore::new();
        let d1 = NaiveDate::from_ymd_opt(2026, 10, 16).unwrap();
        let d2 = NaiveDate::from_ymd_opt(2026, 10, 18).unwrap();
        assert!(rank_changes(&store, d2, "piccoma", "").await.unwrap().is_empty());

        store
            .record_rankings(&[row(d1, 1, "A"), row(d1, 2, "B"), row(d1, 3, "C")])
            .await
            .unwrap();
        store
            .record_rankings(&[row(d2, 1, "C"), row(d2, 2, "A"), row(d2, 3, "D")])
            .await
            .unwrap();
        let changes = rank_changes(&store, d2, "piccoma", "").await.unwrap();
        assert_eq!(changes["C"], RankChange::Up(2));
        assert_eq!(changes["A"], RankChange::Down(1));
        assert_eq!(changes["D"], RankChange::New);
        assert!(!changes.contains_key("B"));
    }
}
