use std::path::PathBuf;
use std::time::Duration;

use crate::normalization::title::{
    MatchConfig, DEFAULT_CONTAINMENT_SCORE, DEFAULT_MATCH_THRESHOLD, DEFAULT_RESOLVE_THRESHOLD,
};
use crate::normalization::translation::DEFAULT_SUBSTRING_MIN_CHARS;
use crate::util::env::{env_flag, env_list, env_opt, env_parse};

/// Attempt bound and the sleep schedule between attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delays: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delays: vec![
                Duration::from_secs(5),
                Duration::from_secs(15),
                Duration::from_secs(30),
            ],
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, delays: Vec<Duration>) -> Self {
        Self {
            max_retries: max_retries.max(1),
            delays,
        }
    }

    /// Sleep before the attempt following `failed_attempt` (1-based). The
    /// schedule's last entry repeats when it is shorter than the bound.
    pub fn delay_after(&self, failed_attempt: u32) -> Duration {
        let idx = failed_attempt.saturating_sub(1) as usize;
        self.delays
            .get(idx)
            .or_else(|| self.delays.last())
            .copied()
            .unwrap_or_default()
    }
}

/// Runtime knobs for crawling, refresh and enrichment, read from env with defaults.
#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub min_items: usize,
    pub retry: RetryPolicy,
    pub fetch_timeout: Duration,
    pub detail_ttl_days: i64,
    pub reviews_ttl_days: i64,
    /// 0 means unbounded.
    pub detail_max_works: usize,
    /// 0 means unbounded.
    pub reviews_max_works: usize,
    pub detail_delay: Duration,
    pub detail_concurrency: usize,
    pub external_max_works: usize,
    pub external_recent_days: i64,
    pub external_concurrency: usize,
    pub match_threshold: f64,
    pub listing_match_threshold: f64,
    pub containment_score: f64,
    pub containment_min_chars: usize,
    pub mapping_substring_min_chars: usize,
    /// Fuzzy linking to unified works; also requires digit runs to agree.
    pub resolve_match_threshold: f64,
    pub resolve_containment_min_chars: usize,
    pub backup_dir: PathBuf,
    pub mappings_dir: PathBuf,
    pub platforms_file: PathBuf,
    pub resolve_untranslated: bool,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            min_items: 10,
            retry: RetryPolicy::default(),
            fetch_timeout: Duration::from_secs(60),
            detail_ttl_days: 7,
            reviews_ttl_days: 7,
            detail_max_works: 50,
            reviews_max_works: 0,
            detail_delay: Duration::from_millis(3000),
            detail_concurrency: 1,
            external_max_works: 200,
            external_recent_days: 14,
            external_concurrency: 1,
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            listing_match_threshold: 0.7,
            containment_score: DEFAULT_CONTAINMENT_SCORE,
            containment_min_chars: 1,
            mapping_substring_min_chars: DEFAULT_SUBSTRING_MIN_CHARS,
            resolve_match_threshold: DEFAULT_RESOLVE_THRESHOLD,
            resolve_containment_min_chars: DEFAULT_SUBSTRING_MIN_CHARS,
            backup_dir: PathBuf::from("data/backup"),
            mappings_dir: PathBuf::from("data"),
            platforms_file: PathBuf::from("config/platforms.json"),
            resolve_untranslated: false,
        }
    }
}

impl HarvestConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let max_retries = env_parse("CRAWL_MAX_RETRIES", d.retry.max_retries);
        let delays = env_list::<u64>("CRAWL_RETRY_DELAYS_SECS")
            .map(|secs| secs.into_iter().map(Duration::from_secs).collect())
            .unwrap_or(d.retry.delays.clone());
        Self {
            min_items: env_parse("CRAWL_MIN_ITEMS", d.min_items),
            retry: RetryPolicy::new(max_retries, delays),
            fetch_timeout: Duration::from_secs(env_parse("FETCH_TIMEOUT_SECS", 60u64).max(1)),
            detail_ttl_days: env_parse("DETAIL_TTL_DAYS", d.detail_ttl_days),
            reviews_ttl_days: env_parse("REVIEWS_TTL_DAYS", d.reviews_ttl_days),
            detail_max_works: env_parse("DETAIL_MAX_WORKS", d.detail_max_works),
            reviews_max_works: env_parse("REVIEWS_MAX_WORKS", d.reviews_max_works),
            detail_delay: Duration::from_millis(env_parse("DETAIL_DELAY_MS", 3000u64)),
            detail_concurrency: env_parse("DETAIL_CONCURRENCY", d.detail_concurrency).max(1),
            external_max_works: env_parse("EXTERNAL_MAX_WORKS", d.external_max_works),
            external_recent_days: env_parse("EXTERNAL_RECENT_DAYS", d.external_recent_days),
            external_concurrency: env_parse("EXTERNAL_CONCURRENCY", d.external_concurrency).max(1),
            match_threshold: env_parse("MATCH_THRESHOLD", d.match_threshold),
            listing_match_threshold: env_parse("LISTING_MATCH_THRESHOLD", d.listing_match_threshold),
            containment_score: env_parse("MATCH_CONTAINMENT_SCORE", d.containment_score),
            containment_min_chars: env_parse("MATCH_CONTAINMENT_MIN_CHARS", d.containment_min_chars),
            mapping_substring_min_chars: env_parse(
                "MAPPING_SUBSTRING_MIN_CHARS",
                d.mapping_substring_min_chars,
            ),
            resolve_match_threshold: env_parse("RESOLVE_MATCH_THRESHOLD", d.resolve_match_threshold),
            resolve_containment_min_chars: env_parse(
                "RESOLVE_CONTAINMENT_MIN_CHARS",
                d.resolve_containment_min_chars,
            ),
            backup_dir: env_opt("BACKUP_DIR").map(PathBuf::from).unwrap_or(d.backup_dir),
            mappings_dir: env_opt("MAPPINGS_DIR").map(PathBuf::from).unwrap_or(d.mappings_dir),
            platforms_file: env_opt("PLATFORMS_FILE")
                .map(PathBuf::from)
                .unwrap_or(d.platforms_file),
            resolve_untranslated: env_flag("RESOLVE_UNTRANSLATED", d.resolve_untranslated),
        }
    }

    pub fn match_config(&self) -> MatchConfig {
        MatchConfig {
            threshold: self.match_threshold,
            containment_score: self.containment_score,
            containment_min_chars: self.containment_min_chars,
            numbers_must_agree: false,
        }
    }

    pub fn resolver_match_config(&self) -> MatchConfig {
        MatchConfig {
            threshold: self.resolve_match_threshold,
            containment_score: self.containment_score,
            containment_min_chars: self.resolve_containment_min_chars,
            numbers_must_agree: true,
        }
    }

    pub fn listing_match_config(&self) -> MatchConfig {
        self.match_config().with_threshold(self.listing_match_threshold)
    }

    /// Compressed schedule for tests and dry runs.
    pub fn fast() -> Self {
        Self {
            retry: RetryPolicy::new(
                3,
                vec![
                    Duration::from_millis(5),
                    Duration::from_millis(15),
                    Duration::from_millis(30),
                ],
            ),
            fetch_timeout: Duration::from_secs(5),
            detail_delay: Duration::ZERO,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_schedule_repeats_last_entry() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay_after(1), Duration::from_secs(5));
        assert_eq!(p.delay_after(2), Duration::from_secs(15));
        assert_eq!(p.delay_after(3), Duration::from_secs(30));
        assert_eq!(p.delay_after(9), Duration::from_secs(30));
        assert_eq!(RetryPolicy::new(0, vec![]).max_retries, 1);
        assert_eq!(RetryPolicy::new(2, vec![]).delay_after(1), Duration::ZERO);
    }

    #[test]
    fn defaults_follow_documented_values() {
        let c = HarvestConfig::default();
        assert_eq!(c.min_items, 10);
        assert_eq!(c.retry.max_retries, 3);
        assert_eq!(c.detail_ttl_days, 7);
        assert_eq!(c.listing_match_config().threshold, 0.7);
        assert_eq!(c.match_config().threshold, 0.75);
        assert_eq!(c.resolver_match_config(), MatchConfig::resolution());
        assert!(c.resolver_match_config().threshold > c.match_config().threshold);
    }
}
