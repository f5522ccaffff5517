//! Platform registry: which rankings to crawl and where to fetch details.
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::info;

use crate::crawl::feed::{JsonFeedAdapter, SnapshotAdapter};
use crate::crawl::{CrawlTarget, SourceAdapter};
use crate::database_ops::backup::BackupDir;
use crate::refresh::{DetailSource, HttpDetailSource};

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PlatformConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub ranking_url: String,
    #[serde(default)]
    pub sub_category: String,
    pub detail_url: Option<String>,
    pub reviews_url: Option<String>,
    pub politeness_delay_ms: Option<u64>,
}

impl PlatformConfig {
    pub fn target(&self) -> CrawlTarget {
        CrawlTarget::sub(&self.id, &self.sub_category)
    }

    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    fn politeness(&self) -> Duration {
        Duration::from_millis(self.politeness_delay_ms.unwrap_or(0))
    }
}

#[derive(Debug, Clone, Default)]
pub struct PlatformRegistry {
    platforms: Vec<PlatformConfig>,
}

impl PlatformRegistry {
    pub fn from_json(raw: &str) -> Result<Self> {
        let platforms: Vec<PlatformConfig> = serde_json::from_str(raw).context("parsing platform registry")?;
        let mut seen = HashSet::new();
        for p in &platforms {
            if p.id.trim().is_empty() {
                bail!("platform entry with empty id");
            }
            if p.ranking_url.trim().is_empty() {
                bail!("platform {}: empty ranking_url", p.id);
            }
            if !seen.insert(p.target()) {
                bail!("platform {} listed twice", p.target());
            }
        }
        Ok(Self { platforms })
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let reg = Self::from_json(&raw)?;
        info!(path = %path.display(), platforms = reg.platforms.len(), "platform registry loaded");
        Ok(reg)
    }

    pub fn platforms(&self) -> &[PlatformConfig] {
        &self.platforms
    }

    pub fn is_empty(&self) -> bool {
        self.platforms.is_empty()
    }

    /// Keeps only the given platform ids; an empty filter keeps everything.
    pub fn only(&self, ids: &[String]) -> Self {
        if ids.is_empty() {
            return self.clone();
        }
        Self {
            platforms: self
                .platforms
                .iter()
                .filter(|p| ids.iter().any(|id| id == &p.id))
                .cloned()
                .collect(),
        }
    }

    pub fn feed_adapters(&self, timeout: Duration) -> Vec<Arc<dyn SourceAdapter>> {
        self.platforms
            .iter()
            .map(|p| {
                Arc::new(JsonFeedAdapter::new(p.target(), &p.ranking_url, timeout, p.politeness()))
                    as Arc<dyn SourceAdapter>
            })
            .collect()
    }

    /// Adapters replaying the day's snapshots, for platforms that have one.
    pub fn snapshot_adapters(&self, backups: &BackupDir, date: chrono::NaiveDate) -> Vec<Arc<dyn SourceAdapter>> {
        self.platforms
            .iter()
            .filter_map(|p| {
                let target = p.target();
                let path = backups.path_for(date, &target.backup_name());
                path.is_file()
                    .then(|| Arc::new(SnapshotAdapter::new(target, path)) as Arc<dyn SourceAdapter>)
            })
            .collect()
    }

    /// One detail source per platform id that declares a detail or review endpoint.
    pub fn detail_sources(&self, timeout: Duration) -> Vec<(String, Arc<dyn DetailSource>)> {
        let mut seen = HashSet::new();
        self.platforms
            .iter()
            .filter(|p| p.detail_url.is_some() || p.reviews_url.is_some())
            .filter(|p| seen.insert(p.id.clone()))
            .map(|p| {
                let source = HttpDetailSource::new(&p.id, p.detail_url.clone(), p.reviews_url.clone(), timeout);
                (p.id.clone(), Arc::new(source) as Arc<dyn DetailSource>)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::models::Entry;
    use chrono::NaiveDate;

    const REGISTRY: &str = r#"[
        {"id": "piccoma", "name": "ピッコマ", "ranking_url": "https://feeds.example/piccoma.json",
         "detail_url": "https://feeds.example/piccoma/detail?u={url}", "politeness_delay_ms": 1500},
        {"id": "piccoma", "ranking_url": "https://feeds.example/piccoma_smartoon.json", "sub_category": "smartoon"},
        {"id": "cmoa", "ranking_url": "https://feeds.example/cmoa.json", "reviews_url": "https://feeds.example/cmoa/reviews?t={title}"},
        {"id": "renta", "ranking_url": "https://feeds.example/renta.json"}
    ]"#;

    #[test]
    fn parses_and_builds_components() {
        let reg = PlatformRegistry::from_json(REGISTRY).unwrap();
        assert_eq!(reg.platforms().len(), 4);
        assert_eq!(reg.platforms()[0].display_name(), "ピッコマ");
        assert_eq!(reg.platforms()[3].display_name(), "renta");
        assert_eq!(reg.feed_adapters(Duration::from_secs(5)).len(), 4);

        let sources: Vec<String> = reg
            .detail_sources(Duration::from_secs(5))
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(sources, vec!["piccoma".to_string(), "cmoa".to_string()]);

        let only = reg.only(&["piccoma".to_string()]);
        assert_eq!(only.platforms().len(), 2);
        assert_eq!(reg.only(&[]).platforms().len(), 4);
    }

    #[test]
    fn rejects_duplicates_and_blanks() {
        let dup = r#"[{"id": "a", "ranking_url": "u"}, {"id": "a", "ranking_url": "v"}]"#;
        assert!(PlatformRegistry::from_json(dup).is_err());
        assert!(PlatformRegistry::from_json(r#"[{"id": " ", "ranking_url": "u"}]"#).is_err());
        assert!(PlatformRegistry::from_json(r#"[{"id": "a", "ranking_url": ""}]"#).is_err());
    }

    #[tokio::test]
    async fn snapshot_adapters_only_for_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let backups = BackupDir::new(dir.path());
        let date = NaiveDate::from_ymd_opt(2026, 10, 18).unwrap();
        backups
            .write(date, "piccoma_smartoon", &[Entry::new(1, "A", "https://a")])
            .await
            .unwrap();
        let reg = PlatformRegistry::from_json(REGISTRY).unwrap();
        let adapters = reg.snapshot_adapters(&backups, date);
        assert_eq!(adapters.len(), 1);
        assert_eq!(adapters[0].target(), &CrawlTarget::sub("piccoma", "smartoon"));
        assert_eq!(adapters[0].crawl().await.unwrap().len(), 1);
    }
}
