use anyhow::Result;

use super::CrawlTarget;
use crate::database_ops::models::Entry;

/// Fetches and parses one platform ranking. Implementations enforce their own
/// politeness delay and must return an error (not an empty list) when the
/// page cannot be read.
#[async_trait::async_trait]
pub trait SourceAdapter: Send + Sync {
    fn target(&self) -> &CrawlTarget;

    async fn crawl(&self) -> Result<Vec<Entry>>;
}
