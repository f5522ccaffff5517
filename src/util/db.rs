use anyhow::{Context, Result};
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions, PgSslMode},
    PgPool, Row,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, instrument};

use crate::util::env::env_flag;

#[derive(Clone)]
pub struct Db {
    pub pool: PgPool,
}

impl Db {
    // SECURITY: never include raw DSNs in tracing spans (they may contain credentials).
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let mut connect_options =
            PgConnectOptions::from_str(database_url).context("invalid database url")?;

        if database_url.contains("sslmode=require") {
            connect_options = connect_options.ssl_mode(PgSslMode::Require);
        }

        if !env_flag("USE_PREPARED", false) {
            // PgBouncer txn mode safe
            connect_options = connect_options.statement_cache_capacity(0);
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .connect_with(connect_options)
            .await
            .context("failed to connect to store")?;
        info!(max_connections, "connected to db");

        // Default off: schema changes are applied by operators unless explicitly requested.
        if env_flag("AUTO_MIGRATE", false) {
            info!("running migrations (AUTO_MIGRATE=on, custom runner)");
            Self::run_migrations(&pool, Path::new("./migrations")).await?;
        } else {
            info!("AUTO_MIGRATE disabled; skipping migrations");
        }
        Ok(Self { pool })
    }
}

/// Numbered `NNNN_description.sql` files in version order; other files are ignored.
fn migration_candidates(dir: &Path) -> Result<Vec<(i64, String, PathBuf)>> {
    let mut candidates = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let Some(fname) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        let num_str: String = fname.chars().take_while(|c| c.is_ascii_digit()).collect();
        if num_str.is_empty() || !fname.ends_with(".sql") {
            continue;
        }
        let Some(rest) = fname[num_str.len()..].strip_prefix('_') else {
            continue;
        };
        if let Ok(version) = num_str.parse::<i64>() {
            candidates.push((version, rest.trim_end_matches(".sql").to_string(), path));
        }
    }
    candidates.sort_by_key(|(v, _, _)| *v);
    Ok(candidates)
}

impl Db {
    // Custom lightweight migration runner that ignores non-numeric filenames.
    async fn run_migrations(pool: &PgPool, dir: &Path) -> Result<()> {
        if !dir.exists() {
            return Ok(());
        }
        // raw_sql avoids prepared statements under PgBouncer
        sqlx::raw_sql(
            "CREATE TABLE IF NOT EXISTS _rankwatch_migrations (
                version BIGINT PRIMARY KEY,
                description TEXT,
                installed_at TIMESTAMPTZ DEFAULT now()
             )",
        )
        .execute(pool)
        .await?;
        let applied_rows = sqlx::raw_sql("SELECT version FROM _rankwatch_migrations")
            .fetch_all(pool)
            .await?;
        let mut applied: HashSet<i64> = HashSet::new();
        for r in applied_rows {
            applied.insert(r.try_get::<i64, _>(0)?);
        }

        for (version, desc, path) in migration_candidates(dir)? {
            if applied.contains(&version) {
                continue;
            }
            let sql = std::fs::read_to_string(&path)
                .with_context(|| format!("reading migration {}", path.display()))?;
            info!(version, file = ?path, "applying migration");
            let mut tx = pool.begin().await?;
            sqlx::raw_sql(&sql).execute(&mut *tx).await?;
            sqlx::query("INSERT INTO _rankwatch_migrations(version, description) VALUES ($1, $2)")
                .bind(version)
                .bind(&desc)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            applied.insert(version);
        }
        info!(applied = applied.len(), "migrations up-to-date (custom)");
        Ok(())
    }
}
