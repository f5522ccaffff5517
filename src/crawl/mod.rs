pub mod adapter;
pub mod agent;
pub mod feed;

use std::fmt;

use anyhow::Result;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::database_ops::models::Entry;

pub use adapter::SourceAdapter;
pub use agent::{validate, Agent, Outcome};

/// One ranking to crawl: a platform and a sub-category (`""` = overall).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CrawlTarget {
    pub platform: String,
    #[serde(default)]
    pub sub_category: String,
}

impl CrawlTarget {
    pub fn overall(platform: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            sub_category: String::new(),
        }
    }

    pub fn sub(platform: impl Into<String>, sub_category: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            sub_category: sub_category.into(),
        }
    }

    /// File stem for the day's snapshot.
    pub fn backup_name(&self) -> String {
        if self.sub_category.is_empty() {
            self.platform.clone()
        } else {
            format!("{}_{}", self.platform, self.sub_category)
        }
    }
}

impl fmt::Display for CrawlTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.sub_category.is_empty() {
            f.write_str(&self.platform)
        } else {
            write!(f, "{}/{}", self.platform, self.sub_category)
        }
    }
}

/// Writes a validated batch. Must be idempotent for identical input.
#[async_trait::async_trait]
pub trait Persist: Send + Sync {
    async fn persist(&self, date: NaiveDate, target: &CrawlTarget, entries: &[Entry]) -> Result<usize>;
}
