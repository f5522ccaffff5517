use std::time::Duration;

use thiserror::Error;

/// Failure taxonomy for crawls and enrichment. These travel as data inside
/// `Outcome`s and collector stats; none of them is allowed to cancel a sibling task.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HarvestError {
    /// Network error, timeout or a panicking adapter. Retried by the agent.
    #[error("fetch failed: {0}")]
    TransientFetch(String),
    /// Too few or malformed items. Retried exactly like a fetch failure.
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("{platform}: gave up after {attempts} attempts: {last_error}")]
    PermanentPlatformFailure {
        platform: String,
        attempts: u32,
        last_error: String,
    },
    /// Nothing cleared the similarity threshold. Cached as NOT_FOUND.
    #[error("no {provider} match for {title:?}")]
    MatchNotFound { provider: String, title: String },
}

impl HarvestError {
    pub fn timeout(after: Duration) -> Self {
        HarvestError::TransientFetch(format!("timed out after {}s", after.as_secs_f64()))
    }
}

impl From<reqwest::Error> for HarvestError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            HarvestError::TransientFetch(format!("timeout: {e}"))
        } else {
            HarvestError::TransientFetch(e.to_string())
        }
    }
}

impl From<anyhow::Error> for HarvestError {
    fn from(e: anyhow::Error) -> Self {
        HarvestError::TransientFetch(format!("{e:#}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_failure() {
        assert_eq!(
            HarvestError::timeout(Duration::from_secs(60)).to_string(),
            "fetch failed: timed out after 60s"
        );
        let permanent = HarvestError::PermanentPlatformFailure {
            platform: "piccoma".into(),
            attempts: 3,
            last_error: "validation failed: 3 items".into(),
        };
        assert_eq!(
            permanent.to_string(),
            "piccoma: gave up after 3 attempts: validation failed: 3 items"
        );
    }
}
