use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use tracing::info;

use super::models::Entry;

/// Disaster-recovery snapshots: `{root}/{YYYY-MM-DD}/{platform}.json`, one
/// JSON array of entries per platform per day, readable without the store.
#[derive(Debug, Clone)]
pub struct BackupDir {
    root: PathBuf,
}

impl BackupDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, date: NaiveDate, platform: &str) -> PathBuf {
        self.root
            .join(date.format("%Y-%m-%d").to_string())
            .join(format!("{platform}.json"))
    }

    pub async fn write(&self, date: NaiveDate, platform: &str, entries: &[Entry]) -> Result<PathBuf> {
        let path = self.path_for(date, platform);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        let body = serde_json::to_vec_pretty(entries)?;
        tokio::fs::write(&path, body)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        info!(platform, file = %path.display(), count = entries.len(), "backup written");
        Ok(path)
    }

    pub async fn read(&self, date: NaiveDate, platform: &str) -> Result<Vec<Entry>> {
        read_entries(&self.path_for(date, platform)).await
    }

    /// Platforms with a snapshot on `date`, sorted.
    pub async fn platforms_on(&self, date: NaiveDate) -> Result<Vec<String>> {
        let dir = self.root.join(date.format("%Y-%m-%d").to_string());
        let mut out = Vec::new();
        let mut rd = match tokio::fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e).with_context(|| format!("listing {}", dir.display())),
        };
        while let Some(entry) = rd.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                out.push(stem.to_string());
            }
        }
        out.sort();
        Ok(out)
    }
}

pub async fn read_entries(path: &Path) -> Result<Vec<Entry>> {
    let raw = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn snapshot_keeps_entry_shape() {
        let dir = tempfile::tempdir().unwrap();
        let backups = BackupDir::new(dir.path());
        let date = NaiveDate::from_ymd_opt(2026, 10, 18).unwrap();
        let entries = vec![
            Entry::new(1, "俺だけレベルアップな件", "https://piccoma.com/web/product/1").with_genre("ファンタジー"),
            Entry::new(2, "外科医エリーゼ", "https://piccoma.com/web/product/2"),
        ];
        let path = backups.write(date, "piccoma", &entries).await.unwrap();
        assert!(path.ends_with("2026-10-18/piccoma.json"));

        let raw: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw[0]["genre"], "ファンタジー");
        assert!(raw[1].get("genre").is_none());

        assert_eq!(backups.read(date, "piccoma").await.unwrap(), entries);
        assert_eq!(backups.platforms_on(date).await.unwrap(), vec!["piccoma"]);
        let empty_day = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        assert!(backups.platforms_on(empty_day).await.unwrap().is_empty());
    }
}
