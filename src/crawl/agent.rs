use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use futures::FutureExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{CrawlTarget, Persist, SourceAdapter};
use crate::config::{HarvestConfig, RetryPolicy};
use crate::database_ops::models::Entry;
use crate::errors::HarvestError;

/// Result of one agent run. Failures are reported here, never raised.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Outcome {
    pub platform: String,
    pub success: bool,
    pub items: usize,
    pub error: Option<String>,
    pub attempts: u32,
}

impl Outcome {
    pub fn failed(platform: impl Into<String>, error: impl Into<String>, attempts: u32) -> Self {
        Self {
            platform: platform.into(),
            success: false,
            items: 0,
            error: Some(error.into()),
            attempts,
        }
    }
}

/// Minimum item count plus required fields on every item.
pub fn validate(entries: &[Entry], min_items: usize) -> Result<(), HarvestError> {
    if entries.len() < min_items {
        return Err(HarvestError::Validation(format!(
            "expected at least {min_items} items, got {}",
            entries.len()
        )));
    }
    for (i, e) in entries.iter().enumerate() {
        if e.rank < 1 {
            return Err(HarvestError::Validation(format!("item {i}: rank {} < 1", e.rank)));
        }
        if e.title.trim().is_empty() {
            return Err(HarvestError::Validation(format!("item {i} (rank {}): empty title", e.rank)));
        }
        if e.url.trim().is_empty() {
            return Err(HarvestError::Validation(format!("item {i} (rank {}): empty url", e.rank)));
        }
    }
    Ok(())
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Wraps one source adapter with validation, retry and persistence.
pub struct Agent {
    adapter: Arc<dyn SourceAdapter>,
    sink: Arc<dyn Persist>,
    retry: RetryPolicy,
    min_items: usize,
    timeout: Duration,
    date: NaiveDate,
    cancel: CancellationToken,
}

impl Agent {
    pub fn new(
        adapter: Arc<dyn SourceAdapter>,
        sink: Arc<dyn Persist>,
        cfg: &HarvestConfig,
        date: NaiveDate,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            adapter,
            sink,
            retry: cfg.retry.clone(),
            min_items: cfg.min_items,
            timeout: cfg.fetch_timeout,
            date,
            cancel,
        }
    }

    pub fn target(&self) -> &CrawlTarget {
        self.adapter.target()
    }

    async fn attempt(&self) -> Result<usize, HarvestError> {
        let fetch = AssertUnwindSafe(self.adapter.crawl()).catch_unwind();
        let entries = match tokio::time::timeout(self.timeout, fetch).await {
            Err(_) => return Err(HarvestError::timeout(self.timeout)),
            Ok(Err(panic)) => {
                return Err(HarvestError::TransientFetch(format!(
                    "adapter panicked: {}",
                    panic_message(panic.as_ref())
                )))
            }
            Ok(Ok(Err(e))) => return Err(HarvestError::from(e)),
            Ok(Ok(Ok(entries))) => entries,
        };
        validate(&entries, self.min_items)?;
        self.sink
            .persist(self.date, self.target(), &entries)
            .await
            .map_err(HarvestError::from)
    }

    /// Runs up to `max_retries` attempts, sleeping the scheduled delay between
    /// them. Always returns an `Outcome`.
    pub async fn execute(&self) -> Outcome {
        let target = self.target().to_string();
        let max = self.retry.max_retries.max(1);
        let mut last_error = String::new();
        info!(platform = %target, max_attempts = max, "crawl starting");

        for attempt in 1..=max {
            let result = tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Outcome::failed(&target, "cancelled", attempt - 1);
                }
                r = self.attempt() => r,
            };
            match result {
                Ok(items) => {
                    info!(platform = %target, items, attempt, "crawl succeeded");
                    return Outcome {
                        platform: target,
                        success: true,
                        items,
                        error: None,
                        attempts: attempt,
                    };
                }
                Err(e) => {
                    warn!(platform = %target, attempt, error = %e, "crawl attempt failed");
                    last_error = e.to_string();
                }
            }
            if attempt < max {
                let delay = self.retry.delay_after(attempt);
                info!(platform = %target, delay_ms = delay.as_millis() as u64, "retrying after delay");
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        return Outcome::failed(&target, "cancelled", attempt);
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        let err = HarvestError::PermanentPlatformFailure {
            platform: target.clone(),
            attempts: max,
            last_error,
        };
        warn!(platform = %target, error = %err, "crawl failed permanently");
        Outcome::failed(target, err.to_string(), max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    struct Scripted {
        target: CrawlTarget,
        items: usize,
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait::async_trait]
    impl SourceAdapter for Scripted {
        fn target(&self) -> &CrawlTarget {
            &self.target
        }
        async fn crawl(&self) -> anyhow::Result<Vec<Entry>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                anyhow::bail!("connection reset");
            }
            Ok((1..=self.items as i32)
                .map(|r| Entry::new(r, format!("title {r}"), format!("https://example.jp/{r}")))
                .collect())
        }
    }

    struct CountingSink(AtomicU32);

    #[async_trait::async_trait]
    impl Persist for CountingSink {
        async fn persist(&self, _: NaiveDate, _: &CrawlTarget, entries: &[Entry]) -> anyhow::Result<usize> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(entries.len())
        }
    }

    fn agent(adapter: Arc<Scripted>, sink: Arc<CountingSink>) -> Agent {
        Agent::new(
            adapter,
            sink,
            &HarvestConfig::fast(),
            NaiveDate::from_ymd_opt(2026, 10, 18).unwrap(),
            CancellationToken::new(),
        )
    }

    fn scripted(items: usize, fail_first: u32) -> Arc<Scripted> {
        Arc::new(Scripted {
            target: CrawlTarget::overall("piccoma"),
            items,
            calls: AtomicU32::new(0),
            fail_first,
        })
    }

    #[test]
    fn validate_requires_count_and_fields() {
        let ok: Vec<Entry> = (1..=10).map(|r| Entry::new(r, "t", "u")).collect();
        assert!(validate(&ok, 10).is_ok());
        assert!(matches!(validate(&ok[..9], 10), Err(HarvestError::Validation(_))));
        let mut bad = ok.clone();
        bad[4].url = " ".into();
        assert!(validate(&bad, 10).is_err());
        bad[4] = Entry::new(0, "t", "u");
        assert!(validate(&bad, 10).is_err());
    }

    #[tokio::test]
    async fn twelve_items_persist_on_first_attempt() {
        let adapter = scripted(12, 0);
        let sink = Arc::new(CountingSink(AtomicU32::new(0)));
        let out = agent(adapter.clone(), sink.clone()).execute().await;
        assert!(out.success);
        assert_eq!(out.items, 12);
        assert_eq!(out.attempts, 1);
        assert_eq!(sink.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn short_list_exhausts_retries_on_schedule() {
        let adapter = scripted(3, 0);
        let sink = Arc::new(CountingSink(AtomicU32::new(0)));
        let start = Instant::now();
        let out = agent(adapter.clone(), sink.clone()).execute().await;
        let elapsed = start.elapsed();

        assert!(!out.success);
        assert_eq!(out.attempts, 3);
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 3);
        assert_eq!(sink.0.load(Ordering::SeqCst), 0);
        assert!(out.error.as_deref().unwrap().contains("gave up after 3 attempts"));
        // 5ms + 15ms between the three attempts
        assert!(elapsed >= Duration::from_millis(20), "{elapsed:?}");
    }

    #[tokio::test]
    async fn transient_failure_then_success() {
        let adapter = scripted(10, 1);
        let sink = Arc::new(CountingSink(AtomicU32::new(0)));
        let out = agent(adapter, sink).execute().await;
        assert!(out.success);
        assert_eq!(out.attempts, 2);
    }

    #[tokio::test]
    async fn cancellation_stops_retries() {
        let adapter = scripted(3, 0);
        let sink = Arc::new(CountingSink(AtomicU32::new(0)));
        let cancel = CancellationToken::new();
        let mut cfg = HarvestConfig::fast();
        cfg.retry = RetryPolicy::new(3, vec![Duration::from_secs(30)]);
        let a = Agent::new(
            adapter.clone(),
            sink,
            &cfg,
            NaiveDate::from_ymd_opt(2026, 10, 18).unwrap(),
            cancel.clone(),
        );
        let handle = tokio::spawn(async move { a.execute().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        let out = handle.await.unwrap();
        assert!(!out.success);
        assert_eq!(out.error.as_deref(), Some("cancelled"));
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);
    }
}
