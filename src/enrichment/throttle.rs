use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

/// Spaces calls to one external source at a fixed interval. Clones share the
/// same schedule, so concurrent callers queue behind each other.
#[derive(Clone, Debug)]
pub struct RequestThrottle {
    interval: Duration,
    next_allowed: Option<Arc<Mutex<Instant>>>,
}

impl RequestThrottle {
    pub fn new(interval: Duration) -> Self {
        let next_allowed = (!interval.is_zero()).then(|| Arc::new(Mutex::new(Instant::now())));
        Self {
            interval,
            next_allowed,
        }
    }

    /// Returns once the caller may issue its request. The first call is immediate.
    pub async fn wait(&self) {
        let Some(state) = &self.next_allowed else {
            return;
        };

        let mut next_allowed = state.lock().await;
        let now = Instant::now();
        let wait_until = (*next_allowed).max(now);
        *next_allowed = wait_until + self.interval;
        drop(next_allowed);

        let pause = wait_until.saturating_duration_since(now);
        if !pause.is_zero() {
            sleep(pause).await;
        }
    }
}
