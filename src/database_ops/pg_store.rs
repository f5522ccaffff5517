use anyhow::{Context, Result};
use chrono::NaiveDate;
use sqlx::postgres::PgRow;
use sqlx::Row;
use tracing::debug;

use super::models::{
    ExternalIdentifier, ExternalMetric, MetricValue, RankingRow, RawWork, RawWorkSighting, Review,
    UnifiedFields, UnifiedWork, WorkDetail,
};
use super::store::ResolutionStore;
use crate::util::db::Db;

// SQL renderings of the merge rules in normalization::merge. `old`/`new` are
// column expressions; COLLATE "C" orders byte-wise like Rust's str::cmp.

fn first_non_empty_sql(old: &str, new: &str) -> String {
    format!(
        "CASE WHEN btrim({old}) = '' AND btrim({new}) = '' THEN '' \
              WHEN btrim({old}) = '' THEN {new} \
              WHEN btrim({new}) = '' THEN {old} \
              ELSE LEAST({old} COLLATE \"C\", {new} COLLATE \"C\") END"
    )
}

fn keep_longest_sql(old: &str, new: &str) -> String {
    format!(
        "CASE WHEN char_length({new}) > char_length({old}) THEN {new} \
              WHEN char_length({new}) < char_length({old}) THEN {old} \
              ELSE LEAST({old} COLLATE \"C\", {new} COLLATE \"C\") END"
    )
}

fn newest_non_empty_sql(old: &str, new: &str) -> String {
    format!("CASE WHEN btrim({new}) = '' THEN {old} ELSE {new} END")
}

fn union_tags_sql(old: &str, new: &str) -> String {
    format!(
        "ARRAY(SELECT DISTINCT btrim(t) COLLATE \"C\" AS tag \
               FROM unnest({old} || {new}) AS t \
               WHERE btrim(t) <> '' ORDER BY tag)"
    )
}

const WORK_COLUMNS: &str = "id, platform, title, title_translated, url, thumbnail_url, genre, \
    genre_translated, is_flagged, first_seen_date, last_seen_date, best_rank, author, publisher, \
    label, tags, description, detail_genre, detail_thumbnail_url, hearts, favorites, rating, \
    review_count, detail_scraped_at, reviews_scraped_at, unified_work_id, updated_at";

const UNIFIED_COLUMNS: &str = "id, title_translated, title_canonical, author, publisher, genre, \
    genre_translated, tags, description, is_flagged, thumbnail_url";

const RANKING_COLUMNS: &str = "date, platform, sub_category, rank, title, title_translated, genre, \
    genre_translated, url, is_flagged";

/// Detail merge for one `works` row. Detail genre and thumbnail live in their
/// own columns; ranking sightings own `genre` and `thumbnail_url`.
fn save_detail_sql() -> String {
    format!(
        "UPDATE works SET \
             author = {author}, publisher = {publisher}, label = {label}, \
             tags = {tags}, description = {desc}, \
             detail_genre = {genre}, detail_thumbnail_url = {thumb}, \
             hearts = COALESCE($10, hearts), favorites = COALESCE($11, favorites), \
             rating = COALESCE($12, rating), review_count = COALESCE($13, review_count), \
             detail_scraped_at = now(), updated_at = now() \
         WHERE platform = $1 AND title = $2 \
         RETURNING {WORK_COLUMNS}",
        author = newest_non_empty_sql("author", "$3"),
        publisher = newest_non_empty_sql("publisher", "$4"),
        label = newest_non_empty_sql("label", "$5"),
        tags = union_tags_sql("tags", "$6::text[]"),
        desc = keep_longest_sql("description", "$7"),
        genre = newest_non_empty_sql("detail_genre", "$8"),
        thumb = newest_non_empty_sql("detail_thumbnail_url", "$9"),
    )
}

fn work_from_row(r: &PgRow) -> Result<RawWork> {
    Ok(RawWork {
        id: r.try_get("id")?,
        platform: r.try_get("platform")?,
        title: r.try_get("title")?,
        title_translated: r.try_get("title_translated")?,
        url: r.try_get("url")?,
        thumbnail_url: r.try_get("thumbnail_url")?,
        genre: r.try_get("genre")?,
        genre_translated: r.try_get("genre_translated")?,
        is_flagged: r.try_get("is_flagged")?,
        first_seen_date: r.try_get("first_seen_date")?,
        last_seen_date: r.try_get("last_seen_date")?,
        best_rank: r.try_get("best_rank")?,
        detail: WorkDetail {
            author: r.try_get("author")?,
            publisher: r.try_get("publisher")?,
            label: r.try_get("label")?,
            tags: r.try_get("tags")?,
            description: r.try_get("description")?,
            genre: r.try_get("detail_genre")?,
            thumbnail_url: r.try_get("detail_thumbnail_url")?,
            hearts: r.try_get("hearts")?,
            favorites: r.try_get("favorites")?,
            rating: r.try_get("rating")?,
            review_count: r.try_get("review_count")?,
        },
        detail_scraped_at: r.try_get("detail_scraped_at")?,
        reviews_scraped_at: r.try_get("reviews_scraped_at")?,
        unified_work_id: r.try_get("unified_work_id")?,
        updated_at: r.try_get("updated_at")?,
    })
}

fn unified_from_row(r: &PgRow) -> Result<UnifiedWork> {
    Ok(UnifiedWork {
        id: r.try_get("id")?,
        title_translated: r.try_get("title_translated")?,
        fields: UnifiedFields {
            title_canonical: r.try_get("title_canonical")?,
            author: r.try_get("author")?,
            publisher: r.try_get("publisher")?,
            genre: r.try_get("genre")?,
            genre_translated: r.try_get("genre_translated")?,
            tags: r.try_get("tags")?,
            description: r.try_get("description")?,
            is_flagged: r.try_get("is_flagged")?,
            thumbnail_url: r.try_get("thumbnail_url")?,
        },
    })
}

fn ranking_from_row(r: &PgRow) -> Result<RankingRow> {
    Ok(RankingRow {
        date: r.try_get("date")?,
        platform: r.try_get("platform")?,
        sub_category: r.try_get("sub_category")?,
        rank: r.try_get("rank")?,
        title: r.try_get("title")?,
        title_translated: r.try_get("title_translated")?,
        genre: r.try_get("genre")?,
        genre_translated: r.try_get("genre_translated")?,
        url: r.try_get("url")?,
        is_flagged: r.try_get("is_flagged")?,
    })
}

fn ext_from_row(r: &PgRow) -> Result<ExternalIdentifier> {
    Ok(ExternalIdentifier {
        platform: r.try_get("platform")?,
        title: r.try_get("title")?,
        source: r.try_get("source")?,
        external_id: r.try_get("external_id")?,
        external_title: r.try_get("external_title")?,
        match_score: r.try_get("match_score")?,
    })
}

/// Postgres-backed store. Each write is one `INSERT .. ON CONFLICT .. DO UPDATE`
/// (or a guarded `UPDATE`) so concurrent agents rely on row-level atomicity only.
#[derive(Clone)]
pub struct PgStore {
    db: Db,
}

impl PgStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

#[async_trait::async_trait]
impl ResolutionStore for PgStore {
    async fn upsert_raw_work(&self, s: &RawWorkSighting) -> Result<i64> {
        let sql = format!(
            "INSERT INTO works (platform, title, title_translated, url, thumbnail_url, genre, \
                 genre_translated, is_flagged, first_seen_date, last_seen_date, best_rank) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$9,$10) \
             ON CONFLICT (platform, title) DO UPDATE SET \
                 title_translated = {tt}, url = {url}, thumbnail_url = {thumb}, \
                 genre = {genre}, genre_translated = {gt}, \
                 is_flagged = works.is_flagged OR EXCLUDED.is_flagged, \
                 first_seen_date = LEAST(works.first_seen_date, EXCLUDED.first_seen_date), \
                 last_seen_date = GREATEST(works.last_seen_date, EXCLUDED.last_seen_date), \
                 best_rank = LEAST(works.best_rank, EXCLUDED.best_rank), \
                 updated_at = now() \
             RETURNING id",
            tt = newest_non_empty_sql("works.title_translated", "EXCLUDED.title_translated"),
            url = newest_non_empty_sql("works.url", "EXCLUDED.url"),
            thumb = newest_non_empty_sql("works.thumbnail_url", "EXCLUDED.thumbnail_url"),
            genre = newest_non_empty_sql("works.genre", "EXCLUDED.genre"),
            gt = newest_non_empty_sql("works.genre_translated", "EXCLUDED.genre_translated"),
        );
        let row = sqlx::query(&sql)
            .persistent(false)
            .bind(&s.platform)
            .bind(&s.title)
            .bind(&s.title_translated)
            .bind(&s.url)
            .bind(&s.thumbnail_url)
            .bind(&s.genre)
            .bind(&s.genre_translated)
            .bind(s.is_flagged)
            .bind(s.seen_date)
            .bind(s.rank)
            .fetch_one(&self.db.pool)
            .await
            .with_context(|| format!("upsert work {}/{}", s.platform, s.title))?;
        Ok(row.try_get("id")?)
    }

    async fn record_rankings(&self, rows: &[RankingRow]) -> Result<usize> {
        let mut tx = self.db.pool.begin().await?;
        for r in rows {
            sqlx::query(
                "INSERT INTO rankings (date, platform, sub_category, rank, title, title_translated, \
                     genre, genre_translated, url, is_flagged) \
                 VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10) \
                 ON CONFLICT (date, platform, sub_category, rank) DO UPDATE SET \
                     title = EXCLUDED.title, title_translated = EXCLUDED.title_translated, \
                     genre = EXCLUDED.genre, genre_translated = EXCLUDED.genre_translated, \
                     url = EXCLUDED.url, is_flagged = EXCLUDED.is_flagged",
            )
            .persistent(false)
            .bind(r.date)
            .bind(&r.platform)
            .bind(&r.sub_category)
            .bind(r.rank)
            .bind(&r.title)
            .bind(&r.title_translated)
            .bind(&r.genre)
            .bind(&r.genre_translated)
            .bind(&r.url)
            .bind(r.is_flagged)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("ranking {} #{}", r.platform, r.rank))?;
        }
        tx.commit().await?;
        Ok(rows.len())
    }

    async fn upsert_unified_work(&self, title_translated: &str, fields: &UnifiedFields) -> Result<i64> {
        let key = title_translated.trim();
        anyhow::ensure!(!key.is_empty(), "unified work needs a non-empty translated title");
        let f = UnifiedFields::default().merge(fields);
        let u = "unified_works";
        let sql = format!(
            "INSERT INTO unified_works (title_translated, title_canonical, author, publisher, genre, \
                 genre_translated, tags, description, is_flagged, thumbnail_url) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10) \
             ON CONFLICT (title_translated) DO UPDATE SET \
                 title_canonical = {canon}, author = {author}, publisher = {publisher}, \
                 genre = {genre}, genre_translated = {gt}, tags = {tags}, \
                 description = {desc}, is_flagged = {u}.is_flagged OR EXCLUDED.is_flagged, \
                 thumbnail_url = {thumb}, updated_at = now() \
             RETURNING id",
            canon = first_non_empty_sql(&format!("{u}.title_canonical"), "EXCLUDED.title_canonical"),
            author = first_non_empty_sql(&format!("{u}.author"), "EXCLUDED.author"),
            publisher = first_non_empty_sql(&format!("{u}.publisher"), "EXCLUDED.publisher"),
            genre = first_non_empty_sql(&format!("{u}.genre"), "EXCLUDED.genre"),
            gt = first_non_empty_sql(&format!("{u}.genre_translated"), "EXCLUDED.genre_translated"),
            tags = union_tags_sql(&format!("{u}.tags"), "EXCLUDED.tags"),
            desc = keep_longest_sql(&format!("{u}.description"), "EXCLUDED.description"),
            thumb = first_non_empty_sql(&format!("{u}.thumbnail_url"), "EXCLUDED.thumbnail_url"),
        );
        let row = sqlx::query(&sql)
            .persistent(false)
            .bind(key)
            .bind(&f.title_canonical)
            .bind(&f.author)
            .bind(&f.publisher)
            .bind(&f.genre)
            .bind(&f.genre_translated)
            .bind(&f.tags)
            .bind(&f.description)
            .bind(f.is_flagged)
            .bind(&f.thumbnail_url)
            .fetch_one(&self.db.pool)
            .await
            .with_context(|| format!("upsert unified work {key}"))?;
        Ok(row.try_get("id")?)
    }

    async fn link(&self, raw_work_id: i64, unified_id: i64) -> Result<()> {
        let res = sqlx::query("UPDATE works SET unified_work_id = $2, updated_at = now() WHERE id = $1")
            .persistent(false)
            .bind(raw_work_id)
            .bind(unified_id)
            .execute(&self.db.pool)
            .await?;
        anyhow::ensure!(res.rows_affected() == 1, "unknown work {raw_work_id}");
        Ok(())
    }

    async fn raw_work(&self, platform: &str, title: &str) -> Result<Option<RawWork>> {
        let sql = format!("SELECT {WORK_COLUMNS} FROM works WHERE platform = $1 AND title = $2");
        let row = sqlx::query(&sql)
            .persistent(false)
            .bind(platform)
            .bind(title)
            .fetch_optional(&self.db.pool)
            .await?;
        row.as_ref().map(work_from_row).transpose()
    }

    async fn raw_works(&self) -> Result<Vec<RawWork>> {
        let sql = format!("SELECT {WORK_COLUMNS} FROM works");
        let rows = sqlx::query(&sql).persistent(false).fetch_all(&self.db.pool).await?;
        rows.iter().map(work_from_row).collect()
    }

    async fn unlinked_raw_works(&self) -> Result<Vec<RawWork>> {
        let sql = format!("SELECT {WORK_COLUMNS} FROM works WHERE unified_work_id IS NULL");
        let rows = sqlx::query(&sql).persistent(false).fetch_all(&self.db.pool).await?;
        rows.iter().map(work_from_row).collect()
    }

    async fn unified_works(&self) -> Result<Vec<UnifiedWork>> {
        let sql = format!("SELECT {UNIFIED_COLUMNS} FROM unified_works");
        let rows = sqlx::query(&sql).persistent(false).fetch_all(&self.db.pool).await?;
        rows.iter().map(unified_from_row).collect()
    }

    async fn save_work_detail(
        &self,
        platform: &str,
        title: &str,
        d: &WorkDetail,
    ) -> Result<Option<RawWork>> {
        let sql = save_detail_sql();
        let row = sqlx::query(&sql)
            .persistent(false)
            .bind(platform)
            .bind(title)
            .bind(&d.author)
            .bind(&d.publisher)
            .bind(&d.label)
            .bind(&d.tags)
            .bind(&d.description)
            .bind(&d.genre)
            .bind(&d.thumbnail_url)
            .bind(d.hearts)
            .bind(d.favorites)
            .bind(d.rating)
            .bind(d.review_count)
            .fetch_optional(&self.db.pool)
            .await
            .with_context(|| format!("save detail {platform}/{title}"))?;
        row.as_ref().map(work_from_row).transpose()
    }

    async fn save_reviews(&self, platform: &str, title: &str, reviews: &[Review]) -> Result<usize> {
        let mut tx = self.db.pool.begin().await?;
        for r in reviews {
            sqlx::query(
                "INSERT INTO reviews (platform, work_title, reviewer_name, body, rating, likes_count, \
                     is_spoiler, reviewed_at) \
                 VALUES ($1,$2,$3,$4,$5,$6,$7,$8) \
                 ON CONFLICT (platform, work_title, reviewer_name, reviewed_at) DO UPDATE SET \
                     body = EXCLUDED.body, rating = COALESCE(EXCLUDED.rating, reviews.rating), \
                     likes_count = EXCLUDED.likes_count, is_spoiler = EXCLUDED.is_spoiler, \
                     collected_at = now()",
            )
            .persistent(false)
            .bind(platform)
            .bind(title)
            .bind(&r.reviewer_name)
            .bind(&r.body)
            .bind(r.rating)
            .bind(r.likes_count)
            .bind(r.is_spoiler)
            .bind(r.reviewed_at)
            .execute(&mut *tx)
            .await?;
        }
        sqlx::query(
            "UPDATE works SET reviews_scraped_at = now(), updated_at = now() \
             WHERE platform = $1 AND title = $2",
        )
        .persistent(false)
        .bind(platform)
        .bind(title)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(reviews.len())
    }

    async fn external_ids(&self, source: &str) -> Result<Vec<ExternalIdentifier>> {
        let rows = sqlx::query(
            "SELECT platform, title, source, external_id, external_title, match_score \
             FROM external_ids WHERE source = $1",
        )
        .persistent(false)
        .bind(source)
        .fetch_all(&self.db.pool)
        .await?;
        rows.iter().map(ext_from_row).collect()
    }

    async fn save_external_id(&self, id: &ExternalIdentifier) -> Result<bool> {
        let row = sqlx::query(
            "INSERT INTO external_ids (platform, title, source, external_id, external_title, match_score) \
             VALUES ($1,$2,$3,$4,$5,$6) \
             ON CONFLICT (platform, title, source) DO UPDATE SET \
                 external_id = EXCLUDED.external_id, external_title = EXCLUDED.external_title, \
                 match_score = EXCLUDED.match_score, updated_at = now() \
             WHERE external_ids.match_score <= EXCLUDED.match_score \
             RETURNING id",
        )
        .persistent(false)
        .bind(&id.platform)
        .bind(&id.title)
        .bind(&id.source)
        .bind(&id.external_id)
        .bind(&id.external_title)
        .bind(id.match_score)
        .fetch_optional(&self.db.pool)
        .await?;
        if row.is_none() {
            debug!(title = %id.title, source = %id.source, "kept higher-confidence external id");
        }
        Ok(row.is_some())
    }

    async fn save_external_metrics(&self, metrics: &[ExternalMetric]) -> Result<usize> {
        let mut tx = self.db.pool.begin().await?;
        for m in metrics {
            let (value, text) = match &m.value {
                MetricValue::Number(v) => (Some(*v), None),
                MetricValue::Text(t) => (None, Some(t.as_str())),
            };
            sqlx::query(
                "INSERT INTO external_data (title, source, metric_name, metric_value, metric_text, collected_date) \
                 VALUES ($1,$2,$3,$4,$5,$6) \
                 ON CONFLICT (title, source, metric_name, collected_date) DO UPDATE SET \
                     metric_value = EXCLUDED.metric_value, metric_text = EXCLUDED.metric_text, \
                     collected_at = now()",
            )
            .persistent(false)
            .bind(&m.title)
            .bind(&m.source)
            .bind(&m.metric_name)
            .bind(value)
            .bind(text)
            .bind(m.collected_date)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(metrics.len())
    }

    async fn rankings_on(
        &self,
        date: NaiveDate,
        platform: &str,
        sub_category: &str,
    ) -> Result<Vec<RankingRow>> {
        let sql = format!(
            "SELECT {RANKING_COLUMNS} FROM rankings \
             WHERE date = $1 AND platform = $2 AND sub_category = $3 ORDER BY rank"
        );
        let rows = sqlx::query(&sql)
            .persistent(false)
            .bind(date)
            .bind(platform)
            .bind(sub_category)
            .fetch_all(&self.db.pool)
            .await?;
        rows.iter().map(ranking_from_row).collect()
    }

    async fn previous_ranking_date(
        &self,
        before: NaiveDate,
        platform: &str,
        sub_category: &str,
    ) -> Result<Option<NaiveDate>> {
        let row = sqlx::query(
            "SELECT max(date) AS prev FROM rankings \
             WHERE date < $1 AND platform = $2 AND sub_category = $3",
        )
        .persistent(false)
        .bind(before)
        .bind(platform)
        .bind(sub_category)
        .fetch_one(&self.db.pool)
        .await?;
        Ok(row.try_get("prev")?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_sql_uses_byte_order_tie_break() {
        let s = first_non_empty_sql("u.author", "EXCLUDED.author");
        assert!(s.contains("LEAST(u.author COLLATE \"C\", EXCLUDED.author COLLATE \"C\")"));
        let l = keep_longest_sql("description", "$7");
        assert!(l.starts_with("CASE WHEN char_length($7) > char_length(description)"));
        let t = union_tags_sql("tags", "$6::text[]");
        assert!(t.contains("unnest(tags || $6::text[])"));
    }

    #[test]
    fn detail_writes_leave_sighting_columns_alone() {
        let sql = save_detail_sql();
        assert!(sql.contains("detail_genre = CASE WHEN btrim($8) = '' THEN detail_genre ELSE $8 END"));
        assert!(sql.contains("detail_thumbnail_url = CASE WHEN btrim($9) = '' THEN detail_thumbnail_url"));
        assert!(!sql.contains(" genre = "));
        assert!(!sql.contains(" thumbnail_url = "));
        assert!(WORK_COLUMNS.contains("detail_genre, detail_thumbnail_url"));
    }
}
