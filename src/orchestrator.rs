use std::collections::BTreeMap;

use futures::future::{join_all, LocalBoxFuture};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::crawl::agent::panic_message;
use crate::crawl::{Agent, Outcome};

/// Aggregate of one orchestrator run.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub outcomes: BTreeMap<String, Outcome>,
}

impl RunSummary {
    pub fn succeeded(&self) -> usize {
        self.outcomes.values().filter(|o| o.success).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    pub fn total_items(&self) -> usize {
        self.outcomes.values().map(|o| o.items).sum()
    }

    /// Overall success means at least one agent succeeded.
    pub fn any_succeeded(&self) -> bool {
        self.succeeded() > 0
    }

    /// Process exit status for a scheduled run: 0 unless every agent failed.
    pub fn exit_code(&self) -> u8 {
        if self.any_succeeded() {
            0
        } else {
            1
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &str)> {
        self.outcomes
            .iter()
            .filter(|(_, o)| !o.success)
            .map(|(k, o)| (k.as_str(), o.error.as_deref().unwrap_or("unknown error")))
    }
}

/// Runs every agent on its own task and collects one `Outcome` per target.
/// A panicking or failing agent is recorded as a failed outcome; its siblings
/// keep running.
pub async fn run_all(agents: Vec<Agent>) -> RunSummary {
    let mut names = Vec::with_capacity(agents.len());
    let mut tasks = Vec::with_capacity(agents.len());
    for agent in agents {
        let name = agent.target().to_string();
        names.push(name);
        tasks.push(tokio::spawn(async move { agent.execute().await }));
    }
    info!(agents = tasks.len(), "crawl run started");

    let results = join_all(tasks).await;
    let mut summary = RunSummary::default();
    for (name, res) in names.into_iter().zip(results) {
        let outcome = match res {
            Ok(o) => o,
            Err(join_err) => {
                let msg = if join_err.is_panic() {
                    format!("agent panicked: {}", panic_message(join_err.into_panic().as_ref()))
                } else {
                    format!("agent task aborted: {join_err}")
                };
                error!(platform = %name, error = %msg, "agent task failed");
                Outcome::failed(&name, msg, 0)
            }
        };
        // two agents for the same target: keep the first
        summary.outcomes.entry(name).or_insert(outcome);
    }

    for (platform, err) in summary.failures() {
        warn!(platform, error = err, "platform failed");
    }
    info!(
        succeeded = summary.succeeded(),
        failed = summary.failed(),
        total_items = summary.total_items(),
        "crawl run finished"
    );
    summary
}

/// A named step run after the crawl.
pub type FollowUp<'a> = (&'static str, LocalBoxFuture<'a, anyhow::Result<()>>);

/// Runs post-crawl steps in order and returns the crawl's exit status.
///
/// Nothing runs when no agent succeeded. A failing step is logged and the
/// next one still runs; cancellation stops the remaining steps.
pub async fn run_follow_ups(summary: &RunSummary, steps: Vec<FollowUp<'_>>, cancel: &CancellationToken) -> u8 {
    if !summary.any_succeeded() {
        if !steps.is_empty() {
            let skipped: Vec<_> = steps.iter().map(|(name, _)| *name).collect();
            warn!(?skipped, "no platform succeeded; skipping post-crawl steps");
        }
        return summary.exit_code();
    }
    for (name, step) in steps {
        if cancel.is_cancelled() {
            warn!(step = name, "interrupted; skipping remaining post-crawl steps");
            break;
        }
        match step.await {
            Ok(()) => info!(step = name, "post-crawl step finished"),
            Err(e) => warn!(step = name, error = %format!("{e:#}"), "post-crawl step failed"),
        }
    }
    summary.exit_code()
}
