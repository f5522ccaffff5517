//! Staleness-based selection of works that need a deeper fetch.
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use tracing::info;

use crate::database_ops::models::{RawWork, RefreshTarget};
use crate::database_ops::store::ResolutionStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Budget {
    Capped(usize),
    Unbounded,
}

impl Budget {
    /// `0` means unbounded, matching the env convention.
    pub fn from_max(n: usize) -> Self {
        if n == 0 {
            Budget::Unbounded
        } else {
            Budget::Capped(n)
        }
    }

    fn allows(&self, taken: usize) -> bool {
        match self {
            Budget::Capped(n) => taken < *n,
            Budget::Unbounded => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefreshMode {
    #[default]
    Normal,
    /// Flagged works are due regardless of TTL.
    Priority,
}

/// Never-fetched first, then most recently seen in rankings, then by key.
fn staleness_order(
    a: &(&RawWork, Option<DateTime<Utc>>),
    b: &(&RawWork, Option<DateTime<Utc>>),
) -> std::cmp::Ordering {
    let key = |(w, ts): &(&RawWork, Option<DateTime<Utc>>)| {
        (
            ts.is_some(),
            Reverse(w.last_seen_date),
            w.platform.clone(),
            w.title.clone(),
        )
    };
    key(a).cmp(&key(b))
}

/// Pure selection over stored works. `stamp` picks the timestamp that tracks
/// the deep fetch in question (detail or reviews).
pub fn select_stale(
    works: &[RawWork],
    stamp: impl Fn(&RawWork) -> Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    ttl_days: i64,
    mode: RefreshMode,
    budget: Budget,
) -> Vec<RefreshTarget> {
    let cutoff = now - Duration::days(ttl_days);
    let mut due: Vec<(&RawWork, Option<DateTime<Utc>>)> = works
        .iter()
        .filter(|w| !w.url.trim().is_empty())
        .map(|w| (w, stamp(w)))
        .filter(|(w, ts)| match ts {
            None => true,
            Some(t) => *t < cutoff || (mode == RefreshMode::Priority && w.is_flagged),
        })
        .collect();
    due.sort_by(staleness_order);
    due.into_iter()
        .enumerate()
        .take_while(|(i, _)| budget.allows(*i))
        .map(|(_, (w, _))| RefreshTarget::from(w))
        .collect()
}

/// Works seen in rankings since `since`, spread round-robin across platforms
/// so no platform can take the whole budget. One target per title; titles in
/// `suppressed` are skipped.
pub fn select_for_external(
    works: &[RawWork],
    since: NaiveDate,
    suppressed: &HashSet<String>,
    budget: Budget,
) -> Vec<RefreshTarget> {
    let mut by_platform: BTreeMap<&str, Vec<&RawWork>> = BTreeMap::new();
    for w in works {
        if w.last_seen_date.is_some_and(|d| d >= since) && !suppressed.contains(&w.title) {
            by_platform.entry(w.platform.as_str()).or_default().push(w);
        }
    }
    let mut queues: Vec<VecDeque<&RawWork>> = by_platform
        .into_values()
        .map(|mut v| {
            v.sort_by(|a, b| {
                b.last_seen_date
                    .cmp(&a.last_seen_date)
                    .then(a.best_rank.unwrap_or(i32::MAX).cmp(&b.best_rank.unwrap_or(i32::MAX)))
                    .then(a.title.cmp(&b.title))
            });
            v.into()
        })
        .collect();

    let mut seen_titles = HashSet::new();
    let mut out = Vec::new();
    while budget.allows(out.len()) && queues.iter().any(|q| !q.is_empty()) {
        for q in queues.iter_mut() {
            if !budget.allows(out.len()) {
                break;
            }
            // skip titles already taken via another platform
            while let Some(w) = q.pop_front() {
                if seen_titles.insert(w.title.clone()) {
                    out.push(RefreshTarget::from(w));
                    break;
                }
            }
        }
    }
    out
}

/// Store-backed scheduler.
pub struct RefreshScheduler {
    store: Arc<dyn ResolutionStore>,
    detail_ttl_days: i64,
    reviews_ttl_days: i64,
    external_recent_days: i64,
}

impl RefreshScheduler {
    pub fn new(
        store: Arc<dyn ResolutionStore>,
        detail_ttl_days: i64,
        reviews_ttl_days: i64,
        external_recent_days: i64,
    ) -> Self {
        Self {
            store,
            detail_ttl_days,
            reviews_ttl_days,
            external_recent_days,
        }
    }

    pub async fn due_for_detail(&self, budget: Budget, mode: RefreshMode) -> Result<Vec<RefreshTarget>> {
        let works = self.store.raw_works().await?;
        let due = select_stale(
            &works,
            |w| w.detail_scraped_at,
            Utc::now(),
            self.detail_ttl_days,
            mode,
            budget,
        );
        info!(candidates = works.len(), due = due.len(), ?mode, "detail refresh selection");
        Ok(due)
    }

    pub async fn due_for_reviews(&self, budget: Budget, mode: RefreshMode) -> Result<Vec<RefreshTarget>> {
        let works = self.store.raw_works().await?;
        let due = select_stale(
            &works,
            |w| w.reviews_scraped_at,
            Utc::now(),
            self.reviews_ttl_days,
            mode,
            budget,
        );
        info!(candidates = works.len(), due = due.len(), ?mode, "review refresh selection");
        Ok(due)
    }

    /// Titles due for `source`. A NOT_FOUND row for (title, source) suppresses
    /// the title unless `bypass_not_found` is set.
    pub async fn due_for_external(
        &self,
        source: &str,
        budget: Budget,
        bypass_not_found: bool,
    ) -> Result<Vec<RefreshTarget>> {
        let works = self.store.raw_works().await?;
        let suppressed: HashSet<String> = if bypass_not_found {
            HashSet::new()
        } else {
            let ids = self.store.external_ids(source).await?;
            let found: HashSet<&str> = ids
                .iter()
                .filter(|e| !e.is_not_found())
                .map(|e| e.title.as_str())
                .collect();
            ids.iter()
                .filter(|e| e.is_not_found() && !found.contains(e.title.as_str()))
                .map(|e| e.title.clone())
                .collect()
        };
        let since = Utc::now().date_naive() - Duration::days(self.external_recent_days);
        let due = select_for_external(&works, since, &suppressed, budget);
        info!(source, suppressed = suppressed.len(), due = due.len(), "external enrichment selection");
        Ok(due)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::models::WorkDetail;

    fn work(platform: &str, title: &str, seen: Option<NaiveDate>, scraped: Option<DateTime<Utc>>) -> RawWork {
        RawWork {
            id: 0,
            platform: platform.into(),
            title: title.into(),
            title_translated: String::new(),
            url: format!("https://{platform}.jp/{title}"),
            thumbnail_url: String::new(),
            genre: String::new(),
            genre_translated: String::new(),
            is_flagged: false,
            first_seen_date: seen,
            last_seen_date: seen,
            best_rank: None,
            detail: WorkDetail::default(),
            detail_scraped_at: scraped,
            reviews_scraped_at: None,
            unified_work_id: None,
            updated_at: Utc::now(),
        }
    }

    fn day(d: u32) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(2026, 10, d)
    }

    #[test]
    fn ttl_window_and_null_first_ordering() {
        let now = Utc::now();
        let works = vec![
            work("piccoma", "fresh", day(18), Some(now - Duration::days(1))),
            work("piccoma", "stale-old-seen", day(10), Some(now - Duration::days(30))),
            work("piccoma", "stale-new-seen", day(17), Some(now - Duration::days(8))),
            work("piccoma", "never", day(1), None),
        ];
        let due = select_stale(&works, |w| w.detail_scraped_at, now, 7, RefreshMode::Normal, Budget::Unbounded);
        let titles: Vec<&str> = due.iter().map(|t| t.title.as_str()).collect();
        assert_eq!(titles, vec!["never", "stale-new-seen", "stale-old-seen"]);

        let capped = select_stale(&works, |w| w.detail_scraped_at, now, 7, RefreshMode::Normal, Budget::Capped(1));
        assert_eq!(capped.len(), 1);
        assert_eq!(capped[0].title, "never");
    }

    #[test]
    fn priority_mode_only_overrides_flagged() {
        let now = Utc::now();
        let mut flagged = work("lezhin", "flagged-fresh", day(18), Some(now - Duration::days(1)));
        flagged.is_flagged = true;
        let works = vec![flagged, work("lezhin", "plain-fresh", day(18), Some(now))];

        let normal = select_stale(&works, |w| w.detail_scraped_at, now, 7, RefreshMode::Normal, Budget::Unbounded);
        assert!(normal.is_empty());
        let prio = select_stale(&works, |w| w.detail_scraped_at, now, 7, RefreshMode::Priority, Budget::Unbounded);
        assert_eq!(prio.len(), 1);
        assert_eq!(prio[0].title, "flagged-fresh");
    }

    #[test]
    fn external_budget_is_spread_across_platforms() {
        let mut works = Vec::new();
        for i in 0..10 {
            works.push(work("piccoma", &format!("p{i}"), day(18), None));
        }
        works.push(work("cmoa", "c0", day(18), None));
        works.push(work("cmoa", "c1", day(17), None));
        works.push(work("renta", "r0", day(2), None));
        // same title on two platforms counts once
        works.push(work("renta", "p0", day(18), None));

        let since = day(10).unwrap();
        let due = select_for_external(&works, since, &HashSet::new(), Budget::Capped(4));
        let titles: Vec<&str> = due.iter().map(|t| t.title.as_str()).collect();
        assert_eq!(titles, vec!["c0", "p0", "c1", "p1"]);

        let mut suppressed = HashSet::new();
        suppressed.insert("c0".to_string());
        let due = select_for_external(&works, since, &suppressed, Budget::Unbounded);
        assert_eq!(due.len(), 11);
        assert!(due.iter().all(|t| t.title != "c0" && t.title != "r0"));
    }
}
