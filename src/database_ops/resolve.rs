use std::sync::Arc;

use anyhow::Result;
use chrono::NaiveDate;
use tracing::{debug, info, warn};

use super::backup::BackupDir;
use super::models::{Entry, RankingRow, RawWork, RawWorkSighting, UnifiedFields, UnifiedWork};
use super::store::ResolutionStore;
use crate::crawl::{CrawlTarget, Persist};
use crate::normalization::title::{normalize, MatchConfig};
use crate::normalization::translation::{translate_genre, TitleMappingCache};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ResolveStats {
    pub linked: usize,
    pub unresolved: usize,
}

/// Maps RawWorks onto UnifiedWorks and writes ranking batches.
pub struct Resolver {
    store: Arc<dyn ResolutionStore>,
    mappings: Arc<TitleMappingCache>,
    matcher: MatchConfig,
    resolve_untranslated: bool,
}

impl Resolver {
    pub fn new(
        store: Arc<dyn ResolutionStore>,
        mappings: Arc<TitleMappingCache>,
        matcher: MatchConfig,
        resolve_untranslated: bool,
    ) -> Self {
        Self {
            store,
            mappings,
            matcher,
            resolve_untranslated,
        }
    }

    pub fn store(&self) -> &Arc<dyn ResolutionStore> {
        &self.store
    }

    pub fn mappings(&self) -> &Arc<TitleMappingCache> {
        &self.mappings
    }

    /// Canonical key for a work: an existing link, then the mapping cascade,
    /// then a stored translation, then a fuzzy match against known canonical
    /// titles, then (if enabled) the normalized source title.
    fn canonical_key(&self, work: &RawWork, candidates: &[UnifiedWork]) -> Option<String> {
        if let Some(id) = work.unified_work_id {
            if let Some(u) = candidates.iter().find(|u| u.id == id) {
                return Some(u.title_translated.clone());
            }
        }
        if let Some(t) = self.mappings.lookup(&work.title) {
            return Some(t.translated);
        }
        if !work.title_translated.trim().is_empty() {
            return Some(work.title_translated.trim().to_string());
        }
        if let Some((u, score)) = self.matcher.best_match(&work.title, candidates) {
            debug!(title = %work.title, canonical = %u.title_translated, score, "fuzzy resolution");
            return Some(u.title_translated.clone());
        }
        if self.resolve_untranslated {
            let n = normalize(&work.title);
            if !n.is_empty() {
                return Some(n);
            }
        }
        None
    }

    /// Merges the work into its UnifiedWork and links it. `candidates` gains
    /// any record created along the way so later works in the batch can match it.
    pub async fn resolve_one(
        &self,
        work: &RawWork,
        candidates: &mut Vec<UnifiedWork>,
    ) -> Result<Option<i64>> {
        let Some(key) = self.canonical_key(work, candidates) else {
            return Ok(None);
        };
        let fields = UnifiedFields::from_raw(work);
        let id = self.store.upsert_unified_work(&key, &fields).await?;
        if work.unified_work_id != Some(id) {
            self.store.link(work.id, id).await?;
        }
        match candidates.iter_mut().find(|u| u.id == id) {
            Some(u) => u.fields = u.fields.merge(&fields),
            None => candidates.push(UnifiedWork {
                id,
                title_translated: key,
                fields: UnifiedFields::default().merge(&fields),
            }),
        }
        Ok(Some(id))
    }

    /// Re-attempts resolution of every unlinked RawWork.
    pub async fn resolve_pending(&self) -> Result<ResolveStats> {
        let pending = self.store.unlinked_raw_works().await?;
        if pending.is_empty() {
            return Ok(ResolveStats::default());
        }
        let mut candidates = self.store.unified_works().await?;
        let mut stats = ResolveStats::default();
        for work in &pending {
            match self.resolve_one(work, &mut candidates).await {
                Ok(Some(_)) => stats.linked += 1,
                Ok(None) => stats.unresolved += 1,
                Err(e) => {
                    warn!(platform = %work.platform, title = %work.title, error = %e, "resolution failed");
                    stats.unresolved += 1;
                }
            }
        }
        info!(linked = stats.linked, unresolved = stats.unresolved, "resolution pass finished");
        Ok(stats)
    }

    /// Propagates a work's current fields to its UnifiedWork (after a detail refresh).
    pub async fn propagate(&self, work: &RawWork) -> Result<Option<i64>> {
        let mut candidates = self.store.unified_works().await?;
        self.resolve_one(work, &mut candidates).await
    }

    /// Writes one validated batch: RawWork upserts first (so every ranking row
    /// has a work), then the ranking rows, then resolution of each work.
    /// Replaying the same batch leaves stored state unchanged apart from timestamps.
    pub async fn persist_rankings(
        &self,
        date: NaiveDate,
        platform: &str,
        sub_category: &str,
        entries: &[Entry],
    ) -> Result<usize> {
        let mappings = self.mappings.snapshot();
        let min_chars = self.mappings.min_chars();
        let overall = sub_category.is_empty();
        let mut rows = Vec::with_capacity(entries.len());
        for e in entries {
            let translation = mappings.lookup(&e.title, min_chars);
            let genre = e.genre.clone().unwrap_or_default();
            let genre_translated = translate_genre(&genre);
            let (title_translated, is_flagged) = translation
                .map(|t| (t.translated, t.flagged))
                .unwrap_or_default();
            let sighting = RawWorkSighting {
                platform: platform.to_string(),
                title: e.title.clone(),
                title_translated: title_translated.clone(),
                url: e.url.clone(),
                thumbnail_url: e.thumbnail_url.clone().unwrap_or_default(),
                genre: genre.clone(),
                genre_translated: genre_translated.clone(),
                is_flagged,
                seen_date: date,
                rank: overall.then_some(e.rank),
            };
            self.store.upsert_raw_work(&sighting).await?;
            rows.push(RankingRow {
                date,
                platform: platform.to_string(),
                sub_category: sub_category.to_string(),
                rank: e.rank,
                title: e.title.clone(),
                title_translated,
                genre,
                genre_translated,
                url: e.url.clone(),
                is_flagged,
            });
        }
        let written = self.store.record_rankings(&rows).await?;

        let mut candidates = self.store.unified_works().await?;
        let mut unresolved = 0usize;
        for e in entries {
            let Some(work) = self.store.raw_work(platform, &e.title).await? else {
                continue;
            };
            if self.resolve_one(&work, &mut candidates).await?.is_none() {
                unresolved += 1;
            }
        }
        info!(platform, sub_category, rows = written, unresolved, "rankings persisted");
        Ok(written)
    }
}

/// Persistence step handed to crawl agents: snapshot to disk, then store.
pub struct RankingSink {
    resolver: Arc<Resolver>,
    backups: Option<BackupDir>,
}

impl RankingSink {
    pub fn new(resolver: Arc<Resolver>, backups: Option<BackupDir>) -> Self {
        Self { resolver, backups }
    }
}

#[async_trait::async_trait]
impl Persist for RankingSink {
    async fn persist(&self, date: NaiveDate, target: &CrawlTarget, entries: &[Entry]) -> Result<usize> {
        if let Some(backups) = &self.backups {
            // snapshot failures must not lose the crawl
            if let Err(e) = backups.write(date, &target.backup_name(), entries).await {
                warn!(platform = %target, error = %e, "backup write failed");
            }
        }
        self.resolver
            .persist_rankings(date, &target.platform, &target.sub_category, entries)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::memory_store::MemoryStore;
    use crate::normalization::translation::TitleMappings;

    fn entries(titles: &[&str]) -> Vec<Entry> {
        titles
            .iter()
            .enumerate()
            .map(|(i, t)| Entry::new(i as i32 + 1, *t, format!("https://example.jp/{i}")))
            .collect()
    }

    fn resolver(store: Arc<MemoryStore>, untranslated: bool) -> Resolver {
        let mut m = TitleMappings::default();
        m.general.insert("外科医エリーゼ".into(), "외과의사 엘리제".into());
        m.general.insert("ONE OUTS".into(), "원 아웃".into());
        Resolver::new(
            store,
            Arc::new(TitleMappingCache::preloaded(m, 4)),
            MatchConfig::resolution(),
            untranslated,
        )
    }

    #[tokio::test]
    async fn volume_suffix_resolves_to_same_unified_work() {
        let store = Arc::new(MemoryStore::new());
        let r = resolver(store.clone(), true);
        let d = NaiveDate::from_ymd_opt(2026, 10, 18).unwrap();
        r.persist_rankings(d, "cmoa", "", &entries(&["ABC"])).await.unwrap();
        r.persist_rankings(d, "renta", "", &entries(&["ABC (vol 3)"])).await.unwrap();

        let a = store.raw_work("cmoa", "ABC").await.unwrap().unwrap();
        let b = store.raw_work("renta", "ABC (vol 3)").await.unwrap().unwrap();
        assert!(a.unified_work_id.is_some());
        assert_eq!(a.unified_work_id, b.unified_work_id);
        assert_eq!(store.unified_works().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unresolved_works_stay_unlinked_until_mapped() {
        let store = Arc::new(MemoryStore::new());
        let r = resolver(store.clone(), false);
        let d = NaiveDate::from_ymd_opt(2026, 10, 18).unwrap();
        r.persist_rankings(d, "piccoma", "", &entries(&["外科医エリーゼ", "薬屋のひとりごと"]))
            .await
            .unwrap();
        let linked = store.raw_work("piccoma", "外科医エリーゼ").await.unwrap().unwrap();
        assert!(linked.unified_work_id.is_some());
        assert_eq!(linked.title_translated, "외과의사 엘리제");
        assert_eq!(store.unlinked_raw_works().await.unwrap().len(), 1);

        // retried on every pass, still unresolved
        assert_eq!(r.resolve_pending().await.unwrap(), ResolveStats { linked: 0, unresolved: 1 });

        let mut m = TitleMappings::default();
        m.general.insert("薬屋のひとりごと".into(), "약사의 혼잣말".into());
        let remapped = Resolver::new(
            store.clone(),
            Arc::new(TitleMappingCache::preloaded(m, 4)),
            MatchConfig::resolution(),
            false,
        );
        assert_eq!(remapped.resolve_pending().await.unwrap().linked, 1);
        assert!(store.unlinked_raw_works().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sub_category_rank_does_not_touch_best_rank() {
        let store = Arc::new(MemoryStore::new());
        let r = resolver(store.clone(), true);
        let d = NaiveDate::from_ymd_opt(2026, 10, 18).unwrap();
        r.persist_rankings(d, "piccoma", "fantasy", &entries(&["ABC"])).await.unwrap();
        let w = store.raw_work("piccoma", "ABC").await.unwrap().unwrap();
        assert_eq!(w.best_rank, None);
        r.persist_rankings(d, "piccoma", "", &entries(&["X", "ABC"])).await.unwrap();
        let w = store.raw_work("piccoma", "ABC").await.unwrap().unwrap();
        assert_eq!(w.best_rank, Some(2));
    }

    #[tokio::test]
    async fn short_title_is_not_absorbed_by_a_longer_one() {
        let store = Arc::new(MemoryStore::new());
        let r = resolver(store.clone(), false);
        let d = NaiveDate::from_ymd_opt(2026, 10, 18).unwrap();
        r.persist_rankings(d, "cmoa", "", &entries(&["ONE OUTS"])).await.unwrap();
        r.persist_rankings(d, "renta", "", &entries(&["ONE"])).await.unwrap();

        let long = store.raw_work("cmoa", "ONE OUTS").await.unwrap().unwrap();
        let short = store.raw_work("renta", "ONE").await.unwrap().unwrap();
        assert!(long.unified_work_id.is_some());
        assert_eq!(short.unified_work_id, None);
        assert_eq!(store.unified_works().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn numbered_titles_stay_separate() {
        let store = Arc::new(MemoryStore::new());
        let r = resolver(store.clone(), true);
        let d = NaiveDate::from_ymd_opt(2026, 10, 18).unwrap();
        r.persist_rankings(d, "cmoa", "", &entries(&["作品 2", "作品 3"])).await.unwrap();
        r.persist_rankings(d, "renta", "", &entries(&["作品 4", "作品 3"])).await.unwrap();

        let mut unified = Vec::new();
        for (p, t) in [("cmoa", "作品 2"), ("cmoa", "作品 3"), ("renta", "作品 4")] {
            let w = store.raw_work(p, t).await.unwrap().unwrap();
            unified.push(w.unified_work_id.unwrap());
        }
        unified.sort();
        unified.dedup();
        assert_eq!(unified.len(), 3);
        assert_eq!(store.unified_works().await.unwrap().len(), 3);

        let a = store.raw_work("cmoa", "作品 3").await.unwrap().unwrap();
        let b = store.raw_work("renta", "作品 3").await.unwrap().unwrap();
        assert_eq!(a.unified_work_id, b.unified_work_id);
    }
}
