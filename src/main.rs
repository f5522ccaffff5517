use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use futures::{FutureExt, TryFutureExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use rankwatch::config::HarvestConfig;
use rankwatch::crawl::{Agent, Persist, SourceAdapter};
use rankwatch::database_ops::backup::BackupDir;
use rankwatch::database_ops::resolve::{RankingSink, Resolver};
use rankwatch::database_ops::store::{rank_changes, ResolutionStore};
use rankwatch::database_ops::{MemoryStore, PgStore};
use rankwatch::enrichment::anilist::AnilistCollector;
use rankwatch::enrichment::jikan::JikanCollector;
use rankwatch::enrichment::listing::{ListingCollector, DEFAULT_SOURCE};
use rankwatch::enrichment::youtube::YoutubeCollector;
use rankwatch::enrichment::{CollectStats, Collector, EnrichmentRun};
use rankwatch::normalization::translation::TitleMappingCache;
use rankwatch::orchestrator::{run_all, run_follow_ups, FollowUp, RunSummary};
use rankwatch::platforms::PlatformRegistry;
use rankwatch::refresh::RefreshRunner;
use rankwatch::scheduler::{Budget, RefreshMode, RefreshScheduler};
use rankwatch::util::db::Db;
use rankwatch::util::env::{db_url, env_opt, env_parse, init_env, preflight_check};

const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser, Debug)]
#[command(name = "rankwatch", version, about = "Ranking crawler, title resolver and enrichment driver")]
struct Cli {
    /// Use an in-memory store; nothing is written to Postgres
    #[arg(long, global = true, default_value_t = false)]
    dry_run: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone, Default)]
struct SelectionArgs {
    /// Flagged works are refreshed regardless of TTL
    #[arg(long, default_value_t = false)]
    priority: bool,
    /// Ignore the per-pass work caps
    #[arg(long, default_value_t = false)]
    unbounded: bool,
}

#[derive(Args, Debug, Clone, Default)]
struct EnrichArgs {
    /// Retry titles cached as NOT_FOUND
    #[arg(long, default_value_t = false)]
    bypass_not_found: bool,
    /// Only run these external sources (repeatable)
    #[arg(long = "source")]
    sources: Vec<String>,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Scheduled driver: crawl, detail refresh, review refresh, enrichment
    Run {
        #[command(flatten)]
        selection: SelectionArgs,
        #[command(flatten)]
        enrich: EnrichArgs,
        /// Only crawl these platform ids
        #[arg(long = "platform", value_delimiter = ',')]
        platforms: Vec<String>,
        #[arg(long, default_value_t = false)]
        skip_detail: bool,
        #[arg(long, default_value_t = false)]
        skip_reviews: bool,
        #[arg(long, default_value_t = false)]
        skip_external: bool,
    },
    /// Crawl rankings only
    Crawl {
        #[arg(long = "platform", value_delimiter = ',')]
        platforms: Vec<String>,
    },
    /// Refresh work details that are past their TTL
    RefreshDetails {
        #[command(flatten)]
        selection: SelectionArgs,
    },
    /// Refresh reviews that are past their TTL
    RefreshReviews {
        #[command(flatten)]
        selection: SelectionArgs,
    },
    /// Collect external metrics for recently ranked titles
    Enrich {
        #[command(flatten)]
        enrich: EnrichArgs,
        #[arg(long, default_value_t = false)]
        unbounded: bool,
    },
    /// Retry resolution of every unlinked work
    Resolve,
    /// Replay a day's ranking snapshots into the store
    Restore {
        /// Snapshot date (YYYY-MM-DD)
        #[arg(long)]
        date: NaiveDate,
        #[arg(long = "platform", value_delimiter = ',')]
        platforms: Vec<String>,
    },
    /// Record a translated title and re-run resolution
    MapTitle {
        source: String,
        translated: String,
        #[arg(long, default_value_t = false)]
        flagged: bool,
    },
    /// Print rank movement against the previous available ranking
    RankChanges {
        #[arg(long)]
        platform: String,
        /// Defaults to today (UTC)
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long, default_value = "")]
        sub_category: String,
    },
}

struct App {
    cfg: HarvestConfig,
    resolver: Arc<Resolver>,
    cancel: CancellationToken,
    today: NaiveDate,
}

impl App {
    async fn build(dry_run: bool, cancel: CancellationToken) -> Result<Self> {
        let cfg = HarvestConfig::from_env();
        let store: Arc<dyn ResolutionStore> = if dry_run {
            info!("dry run: using in-memory store");
            Arc::new(MemoryStore::new())
        } else {
            let url = db_url()?;
            let db = Db::connect(&url, env_parse("DB_MAX_CONNS", 5u32)).await?;
            Arc::new(PgStore::new(db))
        };
        let mappings = Arc::new(TitleMappingCache::new(&cfg.mappings_dir, cfg.mapping_substring_min_chars));
        let resolver = Arc::new(Resolver::new(
            store,
            mappings,
            cfg.resolver_match_config(),
            cfg.resolve_untranslated,
        ));
        Ok(Self {
            cfg,
            resolver,
            cancel,
            today: Utc::now().date_naive(),
        })
    }

    fn store(&self) -> Arc<dyn ResolutionStore> {
        self.resolver.store().clone()
    }

    async fn registry(&self, only: &[String]) -> Result<PlatformRegistry> {
        let reg = PlatformRegistry::load(&self.cfg.platforms_file).await?.only(only);
        if reg.is_empty() {
            warn!(filter = ?only, "no platforms selected");
        }
        Ok(reg)
    }

    fn agents(&self, adapters: Vec<Arc<dyn SourceAdapter>>, sink: Arc<dyn Persist>, date: NaiveDate) -> Vec<Agent> {
        adapters
            .into_iter()
            .map(|a| Agent::new(a, sink.clone(), &self.cfg, date, self.cancel.clone()))
            .collect()
    }

    async fn crawl(&self, registry: &PlatformRegistry) -> RunSummary {
        let sink = Arc::new(RankingSink::new(
            self.resolver.clone(),
            Some(BackupDir::new(&self.cfg.backup_dir)),
        ));
        let agents = self.agents(registry.feed_adapters(self.cfg.fetch_timeout), sink, self.today);
        run_all(agents).await
    }

    fn scheduler(&self) -> RefreshScheduler {
        RefreshScheduler::new(
            self.store(),
            self.cfg.detail_ttl_days,
            self.cfg.reviews_ttl_days,
            self.cfg.external_recent_days,
        )
    }

    fn refresh_runner(&self, registry: &PlatformRegistry) -> RefreshRunner {
        registry
            .detail_sources(self.cfg.fetch_timeout)
            .into_iter()
            .fold(
                RefreshRunner::new(self.resolver.clone(), &self.cfg, self.cancel.clone()),
                |runner, (platform, source)| runner.with_source(platform, source),
            )
    }

    fn budget(max: usize, unbounded: bool) -> Budget {
        if unbounded {
            Budget::Unbounded
        } else {
            Budget::from_max(max)
        }
    }

    fn mode(selection: &SelectionArgs) -> RefreshMode {
        if selection.priority {
            RefreshMode::Priority
        } else {
            RefreshMode::Normal
        }
    }

    async fn refresh_details(&self, registry: &PlatformRegistry, selection: &SelectionArgs) -> Result<CollectStats> {
        let budget = Self::budget(self.cfg.detail_max_works, selection.unbounded);
        let targets = self.scheduler().due_for_detail(budget, Self::mode(selection)).await?;
        Ok(self.refresh_runner(registry).refresh_details(&targets).await)
    }

    async fn refresh_reviews(&self, registry: &PlatformRegistry, selection: &SelectionArgs) -> Result<CollectStats> {
        let budget = Self::budget(self.cfg.reviews_max_works, selection.unbounded);
        let targets = self.scheduler().due_for_reviews(budget, Self::mode(selection)).await?;
        Ok(self.refresh_runner(registry).refresh_reviews(&targets).await)
    }

    fn collectors(&self, only: &[String]) -> Vec<Arc<dyn Collector>> {
        let timeout = self.cfg.fetch_timeout;
        let listing_source = env_opt("LISTING_SOURCE").unwrap_or_else(|| DEFAULT_SOURCE.to_string());
        let all: Vec<Arc<dyn Collector>> = vec![
            Arc::new(AnilistCollector::new(self.cfg.match_config(), timeout)),
            Arc::new(JikanCollector::new(self.cfg.match_config(), timeout)),
            Arc::new(YoutubeCollector::new(
                env_opt("YOUTUBE_API_KEY"),
                env_parse("YOUTUBE_MAX_TITLES", 80usize),
                timeout,
            )),
            Arc::new(ListingCollector::new(
                listing_source,
                env_opt("LISTING_URL"),
                self.cfg.listing_match_config(),
                timeout,
            )),
        ];
        all.into_iter()
            .filter(|c| only.is_empty() || only.iter().any(|s| s == c.source()))
            .collect()
    }

    async fn enrich(&self, args: &EnrichArgs, unbounded: bool) -> Result<()> {
        // unlinked works get another chance before every pass
        self.resolver.resolve_pending().await?;
        let run = EnrichmentRun {
            store: self.store(),
            today: self.today,
            bypass_not_found: args.bypass_not_found,
            concurrency: self.cfg.external_concurrency,
            call_timeout: self.cfg.fetch_timeout,
            cancel: self.cancel.clone(),
        };
        let collectors = self.collectors(&args.sources);
        let budget = Self::budget(self.cfg.external_max_works, unbounded);
        let results = run.run(&collectors, &self.scheduler(), budget).await;
        for (source, stats) in &results {
            info!(source = %source, success = stats.success, failed = stats.failed, skipped = stats.skipped, "enrichment source done");
        }
        Ok(())
    }
}

async fn execute(cli: Cli, cancel: CancellationToken) -> Result<u8> {
    preflight_check(
        "rankwatch",
        &[],
        &["DATABASE_URL", "PLATFORMS_FILE", "BACKUP_DIR", "MAPPINGS_DIR", "YOUTUBE_API_KEY", "LISTING_URL"],
    )?;
    let app = App::build(cli.dry_run, cancel).await?;

    match cli.command {
        Commands::Run {
            selection,
            enrich,
            platforms,
            skip_detail,
            skip_reviews,
            skip_external,
        } => {
            let registry = app.registry(&platforms).await?;
            let summary = app.crawl(&registry).await;
            let mut steps: Vec<FollowUp<'_>> = Vec::new();
            if !skip_detail {
                steps.push(("details", app.refresh_details(&registry, &selection).map_ok(drop).boxed_local()));
            }
            if !skip_reviews {
                steps.push(("reviews", app.refresh_reviews(&registry, &selection).map_ok(drop).boxed_local()));
            }
            if !skip_external {
                steps.push(("enrichment", app.enrich(&enrich, selection.unbounded).boxed_local()));
            }
            Ok(run_follow_ups(&summary, steps, &app.cancel).await)
        }
        Commands::Crawl { platforms } => {
            let registry = app.registry(&platforms).await?;
            Ok(app.crawl(&registry).await.exit_code())
        }
        Commands::RefreshDetails { selection } => {
            let registry = app.registry(&[]).await?;
            app.refresh_details(&registry, &selection).await?;
            Ok(0)
        }
        Commands::RefreshReviews { selection } => {
            let registry = app.registry(&[]).await?;
            app.refresh_reviews(&registry, &selection).await?;
            Ok(0)
        }
        Commands::Enrich { enrich, unbounded } => {
            app.enrich(&enrich, unbounded).await?;
            Ok(0)
        }
        Commands::Resolve => {
            let stats = app.resolver.resolve_pending().await?;
            println!("linked={} unresolved={}", stats.linked, stats.unresolved);
            Ok(0)
        }
        Commands::Restore { date, platforms } => {
            let registry = app.registry(&platforms).await?;
            let backups = BackupDir::new(&app.cfg.backup_dir);
            let adapters = registry.snapshot_adapters(&backups, date);
            if adapters.is_empty() {
                warn!(%date, dir = %app.cfg.backup_dir.display(), "no snapshots to restore");
                return Ok(1);
            }
            // replaying must not rewrite the snapshots it reads
            let sink = Arc::new(RankingSink::new(app.resolver.clone(), None));
            let summary = run_all(app.agents(adapters, sink, date)).await;
            Ok(summary.exit_code())
        }
        Commands::MapTitle {
            source,
            translated,
            flagged,
        } => {
            app.resolver
                .mappings()
                .record(&source, &translated, flagged)
                .context("recording title mapping")?;
            let stats = app.resolver.resolve_pending().await?;
            println!("mapped {source:?} -> {translated:?}; linked={} unresolved={}", stats.linked, stats.unresolved);
            Ok(0)
        }
        Commands::RankChanges {
            platform,
            date,
            sub_category,
        } => {
            let date = date.unwrap_or(app.today);
            let changes = rank_changes(app.store().as_ref(), date, &platform, &sub_category).await?;
            for (title, change) in &changes {
                println!("{change}\t{title}");
            }
            Ok(0)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_env();
    if let Err(e) = rankwatch::tracing::init_tracing(rankwatch::tracing::DEFAULT_FILTER) {
        eprintln!("{e}");
    }
    let cli = Cli::parse();

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling in-flight work");
            on_interrupt.cancel();
        }
    });

    let result = execute(cli, cancel.clone()).await;
    if cancel.is_cancelled() {
        return ExitCode::from(EXIT_INTERRUPTED);
    }
    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!(error = %format!("{e:#}"), "rankwatch failed");
            ExitCode::from(1)
        }
    }
}
