//! The minute tick: a short-lived singleton process that polls the
//! Commitfest app, runs the stale sweepers, materialises at most one new
//! branch, and regenerates the status pages.
//!
//! Transient network failures in one step must not stop the later steps,
//! so each step's error is classified at the boundary: retryable HTTP
//! errors are logged and swallowed; anything else propagates.

use anyhow::Result;
use fs2::FileExt;
use std::fs::File;
use tracing::{error, info};

use crate::cirrus::sweep;
use crate::db::App;
use crate::net::is_retryable_error;
use crate::{commitfest, patch, web};

/// Take the advisory lock guarding the tick singleton.  Returns None when
/// another tick holds it, in which case we exit silently and successfully.
pub fn try_lock(app: &App) -> Result<Option<File>> {
    let file = File::create(&app.config.lock_file)?;
    match file.try_lock_exclusive() {
        Ok(()) => Ok(Some(file)),
        Err(err) if err.kind() == fs2::lock_contended_error().kind() => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Log-and-continue wrapper for a tick step that may fail transiently.
macro_rules! step {
    ($name:literal, $expr:expr) => {
        match $expr {
            Ok(value) => Some(value),
            Err(err) if is_retryable_error(&err) => {
                error!(step = $name, error = %err, "tick step failed transiently, continuing");
                None
            }
            Err(err) => return Err(err.context(concat!("tick step ", $name))),
        }
    };
}

pub async fn run(app: &App) -> Result<()> {
    let Some(_lock) = try_lock(app)? else {
        return Ok(());
    };

    // look for stuck entities first, in case we missed webhooks or it is
    // time to time a branch out
    step!("check-stale-branches", sweep::check_stale_branches(app).await);
    step!("check-stale-builds", sweep::check_stale_builds(app).await);
    step!("check-stale-tasks", sweep::check_stale_tasks(app).await);

    let commitfests = step!(
        "list-commitfests",
        commitfest::list_commitfests(app).await
    )
    .unwrap_or_default();
    if commitfests.is_empty() {
        info!("no commitfests need CI right now");
    }
    for cf in &commitfests {
        step!("pull-submissions", commitfest::pull_submissions(app, cf.id).await);
    }

    step!(
        "pull-modified-threads",
        commitfest::pull_modified_threads(app).await
    );

    let cf_ids: Vec<i32> = commitfests.iter().map(|cf| cf.id).collect();
    step!("materialise", patch::maybe_process_one(app, &cf_ids).await);

    step!("rebuild-pages", web::rebuild(app, &commitfests).await);

    Ok(())
}

/// The hourly maintenance tick.
pub async fn run_hourly(app: &App) -> Result<()> {
    crate::stats::refresh_status_statistics(app).await?;
    web::rebuild_statistics(app).await?;
    Ok(())
}

/// The daily maintenance tick.
pub async fn run_daily(app: &App) -> Result<()> {
    crate::gc::run(app).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::net::Fetcher;
    use std::time::Duration;

    fn lock_only_config(path: &std::path::Path) -> Config {
        let mut config = Config::from_env();
        config.lock_file = path.to_path_buf();
        config
    }

    #[tokio::test]
    async fn test_lock_excludes_second_holder() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = lock_only_config(&dir.path().join("tick.lock"));
        // App without a database: build the pieces by hand
        let app = App {
            http: Fetcher::new("test", Duration::from_secs(1), Duration::ZERO),
            pool: sqlx::postgres::PgPoolOptions::new()
                .max_connections(1)
                .connect_lazy("postgres://localhost/ignored")
                .unwrap(),
            config,
        };
        let first = try_lock(&app).unwrap();
        assert!(first.is_some());
        let second = try_lock(&app).unwrap();
        assert!(second.is_none());
        drop(first);
        let third = try_lock(&app).unwrap();
        assert!(third.is_some());
    }
}
