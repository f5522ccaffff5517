//! Built-in adapters: a JSON ranking feed over HTTP and a backup-snapshot replay.
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use serde_json::Value;
use tokio::time::sleep;
use tracing::debug;

use super::{CrawlTarget, SourceAdapter};
use crate::database_ops::backup::read_entries;
use crate::database_ops::models::Entry;
use crate::enrichment::http_client;

/// Reads a ranking from an endpoint that returns the entry array, either
/// bare or under `items`, `entries`, `data` or `rankings`.
pub struct JsonFeedAdapter {
    target: CrawlTarget,
    url: String,
    client: Client,
    politeness: Duration,
}

impl JsonFeedAdapter {
    pub fn new(target: CrawlTarget, url: impl Into<String>, timeout: Duration, politeness: Duration) -> Self {
        Self {
            target,
            url: url.into(),
            client: http_client(timeout),
            politeness,
        }
    }
}

pub(crate) fn entries_from_json(v: Value) -> Result<Vec<Entry>> {
    let list = match v {
        Value::Array(_) => v,
        Value::Object(mut map) => ["items", "entries", "data", "rankings"]
            .iter()
            .find_map(|k| map.remove(*k).filter(Value::is_array))
            .ok_or_else(|| anyhow::anyhow!("feed object has no entry array"))?,
        other => anyhow::bail!("unexpected feed payload: {}", other),
    };
    Ok(serde_json::from_value(list)?)
}

#[async_trait::async_trait]
impl SourceAdapter for JsonFeedAdapter {
    fn target(&self) -> &CrawlTarget {
        &self.target
    }

    async fn crawl(&self) -> Result<Vec<Entry>> {
        if !self.politeness.is_zero() {
            sleep(self.politeness).await;
        }
        debug!(platform = %self.target, url = %self.url, "fetching ranking feed");
        let resp = self
            .client
            .get(&self.url)
            .send()
            .await
            .with_context(|| format!("GET {}", self.url))?
            .error_for_status()?;
        let body: Value = resp.json().await.context("decoding ranking feed")?;
        entries_from_json(body)
    }
}

/// Replays a stored backup file as if it had just been crawled.
pub struct SnapshotAdapter {
    target: CrawlTarget,
    path: PathBuf,
}

impl SnapshotAdapter {
    pub fn new(target: CrawlTarget, path: impl Into<PathBuf>) -> Self {
        Self {
            target,
            path: path.into(),
        }
    }
}

#[async_trait::async_trait]
impl SourceAdapter for SnapshotAdapter {
    fn target(&self) -> &CrawlTarget {
        &self.target
    }

    async fn crawl(&self) -> Result<Vec<Entry>> {
        read_entries(&self.path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn feed_shapes() {
        let bare = json!([{"rank": 1, "title": "A", "url": "https://a"}]);
        assert_eq!(entries_from_json(bare).unwrap().len(), 1);

        let wrapped = json!({"meta": {}, "items": [
            {"rank": 1, "title": "A", "url": "https://a", "genre": "恋愛"},
            {"rank": 2, "title": "B", "url": "https://b", "thumbnail_url": "https://img/b"}
        ]});
        let entries = entries_from_json(wrapped).unwrap();
        assert_eq!(entries[0].genre.as_deref(), Some("恋愛"));
        assert_eq!(entries[1].thumbnail_url.as_deref(), Some("https://img/b"));

        assert!(entries_from_json(json!({"items": 3})).is_err());
        assert!(entries_from_json(json!("nope")).is_err());
    }
}
