//! Field-level merge policies shared by every store implementation.
//!
//! UnifiedWork policies are commutative, associative and idempotent so that
//! independent platforms can enrich the same record in any order:
//! - short scalars: first non-empty wins; two different non-empty values
//!   resolve to the byte-wise smaller one
//! - free text: longest wins, ties broken the same way
//! - tag sets: union, stored sorted
//! - flags: OR
//!
//! RawWork re-sightings are ordered in time and instead take the newest
//! non-empty value, never replacing a populated field with an empty one.
//! The Postgres store expresses the same rules in its upsert SQL.
use std::collections::BTreeSet;

use chrono::NaiveDate;

use crate::database_ops::models::{RawWork, RawWorkSighting, UnifiedFields, WorkDetail};

fn blank(s: &str) -> bool {
    s.trim().is_empty()
}

pub fn first_non_empty(a: &str, b: &str) -> String {
    match (blank(a), blank(b)) {
        (true, true) => String::new(),
        (true, false) => b.to_string(),
        (false, true) => a.to_string(),
        (false, false) => a.min(b).to_string(),
    }
}

pub fn keep_longest(a: &str, b: &str) -> String {
    let (la, lb) = (a.chars().count(), b.chars().count());
    if la > lb {
        a.to_string()
    } else if lb > la {
        b.to_string()
    } else {
        a.min(b).to_string()
    }
}

pub fn union_tags(a: &[String], b: &[String]) -> Vec<String> {
    a.iter()
        .chain(b.iter())
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

pub fn newest_non_empty(old: &str, new: &str) -> String {
    if blank(new) {
        old.to_string()
    } else {
        new.to_string()
    }
}

fn min_date(a: Option<NaiveDate>, b: Option<NaiveDate>) -> Option<NaiveDate> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (x, y) => x.or(y),
    }
}

fn max_date(a: Option<NaiveDate>, b: Option<NaiveDate>) -> Option<NaiveDate> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (x, y) => x.or(y),
    }
}

fn best_rank(a: Option<i32>, b: Option<i32>) -> Option<i32> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (x, y) => x.or(y),
    }
}

impl UnifiedFields {
    pub fn merge(&self, other: &Self) -> Self {
        Self {
            title_canonical: first_non_empty(&self.title_canonical, &other.title_canonical),
            author: first_non_empty(&self.author, &other.author),
            publisher: first_non_empty(&self.publisher, &other.publisher),
            genre: first_non_empty(&self.genre, &other.genre),
            genre_translated: first_non_empty(&self.genre_translated, &other.genre_translated),
            tags: union_tags(&self.tags, &other.tags),
            description: keep_longest(&self.description, &other.description),
            is_flagged: self.is_flagged || other.is_flagged,
            thumbnail_url: first_non_empty(&self.thumbnail_url, &other.thumbnail_url),
        }
    }
}

/// New `works` row for a first sighting.
pub fn raw_work_from_sighting(id: i64, s: &RawWorkSighting) -> RawWork {
    RawWork {
        id,
        platform: s.platform.clone(),
        title: s.title.clone(),
        title_translated: s.title_translated.clone(),
        url: s.url.clone(),
        thumbnail_url: s.thumbnail_url.clone(),
        genre: s.genre.clone(),
        genre_translated: s.genre_translated.clone(),
        is_flagged: s.is_flagged,
        first_seen_date: Some(s.seen_date),
        last_seen_date: Some(s.seen_date),
        best_rank: s.rank,
        detail: WorkDetail::default(),
        detail_scraped_at: None,
        reviews_scraped_at: None,
        unified_work_id: None,
        updated_at: chrono::Utc::now(),
    }
}

/// Applies a later sighting to an existing row.
pub fn merge_sighting(work: &mut RawWork, s: &RawWorkSighting) {
    work.title_translated = newest_non_empty(&work.title_translated, &s.title_translated);
    work.url = newest_non_empty(&work.url, &s.url);
    work.thumbnail_url = newest_non_empty(&work.thumbnail_url, &s.thumbnail_url);
    work.genre = newest_non_empty(&work.genre, &s.genre);
    work.genre_translated = newest_non_empty(&work.genre_translated, &s.genre_translated);
    work.is_flagged = work.is_flagged || s.is_flagged;
    work.first_seen_date = min_date(work.first_seen_date, Some(s.seen_date));
    work.last_seen_date = max_date(work.last_seen_date, Some(s.seen_date));
    work.best_rank = best_rank(work.best_rank, s.rank);
}

/// Folds freshly scraped detail into a stored row. Counters take the newest
/// observed value; text never regresses to empty and descriptions keep the longest.
pub fn merge_detail(current: &WorkDetail, fresh: &WorkDetail) -> WorkDetail {
    WorkDetail {
        author: newest_non_empty(&current.author, &fresh.author),
        publisher: newest_non_empty(&current.publisher, &fresh.publisher),
        label: newest_non_empty(&current.label, &fresh.label),
        tags: union_tags(&current.tags, &fresh.tags),
        description: keep_longest(&current.description, &fresh.description),
        genre: newest_non_empty(&current.genre, &fresh.genre),
        thumbnail_url: newest_non_empty(&current.thumbnail_url, &fresh.thumbnail_url),
        hearts: fresh.hearts.or(current.hearts),
        favorites: fresh.favorites.or(current.favorites),
        rating: fresh.rating.or(current.rating),
        review_count: fresh.review_count.or(current.review_count),
    }
}
