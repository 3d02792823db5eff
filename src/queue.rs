//! The durable work queue.
//!
//! A single `work_queue` table drives all deferred and retryable work.
//! Producers insert NEW rows and notify the wake-up channel; consumers claim
//! rows with `FOR UPDATE SKIP LOCKED`, take a 15-minute lease, and delete the
//! row on success.  Retryable network failures roll the job's transaction
//! back and let the lease expire; anything else crashes the worker for the
//! supervisor to restart.

pub mod ingest;

use anyhow::{Context, Result};
use sqlx::postgres::{PgListener, PgPoolOptions};
use sqlx::Row;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::db::{App, PgTx};
use crate::{cirrus, commitfest, net, web};

/// Notification channel used for consumer wake-ups.
pub const WAKE_CHANNEL: &str = "work_queue";

/// How long a claimed job is leased before it may be re-claimed.
const LEASE_MINUTES: i32 = 15;

/// How long a worker waits for a notification before polling anyway.
const POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Jobs that hit network APIs get multiple retries; everything else is
/// assumed to be a bug or data problem and requires operator inspection.
pub fn retry_limit(job_type: &str) -> i32 {
    if job_type.starts_with("fetch-")
        || job_type.starts_with("poll-")
        || job_type.starts_with("post-")
    {
        3
    } else {
        0
    }
}

/// Insert a NEW job and wake one consumer.  The notification only fires if
/// the surrounding transaction commits.
pub async fn enqueue(tx: &mut PgTx, job_type: &str, key: &str) -> Result<()> {
    sqlx::query("insert into work_queue (type, key, status) values ($1, $2, 'NEW')")
        .bind(job_type)
        .bind(key)
        .execute(&mut **tx)
        .await?;
    sqlx::query("select pg_notify($1, '')")
        .bind(WAKE_CHANNEL)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Best-effort deduplicating insert: skip if an identical NEW job exists and
/// can be locked without waiting.  A job currently being worked on does not
/// count, so a wake-up is never lost.
pub async fn enqueue_if_not_exists(tx: &mut PgTx, job_type: &str, key: &str) -> Result<()> {
    let existing = sqlx::query(
        "select 1
           from work_queue
          where type = $1
            and key is not distinct from $2
            and status = 'NEW'
            for update skip locked
          limit 1",
    )
    .bind(job_type)
    .bind(key)
    .fetch_optional(&mut **tx)
    .await?;
    if existing.is_none() {
        enqueue(tx, job_type, key).await?;
    }
    Ok(())
}

struct Claim {
    id: i64,
    job_type: String,
    key: Option<String>,
}

enum ClaimOutcome {
    /// Nothing runnable right now.
    Empty,
    /// A retry-exhausted row was moved to FAIL; go around again.
    MarkedFailed,
    Claimed(Claim),
}

/// Claim one runnable job, bump its lease, and commit the claim.
async fn claim_one(app: &App) -> Result<ClaimOutcome> {
    let mut tx = app.begin().await?;
    let row = sqlx::query(
        "select id, type, key, retries
           from work_queue
          where status = 'NEW'
             or (status = 'WORK' and lease < now())
            for update skip locked
          limit 1",
    )
    .fetch_optional(&mut *tx)
    .await?;
    let Some(row) = row else {
        tx.rollback().await?;
        return Ok(ClaimOutcome::Empty);
    };
    let id: i64 = row.get("id");
    let job_type: String = row.get("type");
    let key: Option<String> = row.get("key");
    let retries: Option<i32> = row.get("retries");

    if retries.is_some_and(|r| r >= retry_limit(&job_type)) {
        warn!(id, job_type = %job_type, ?key, "job exhausted its retries, marking FAIL");
        sqlx::query("update work_queue set status = 'FAIL' where id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        return Ok(ClaimOutcome::MarkedFailed);
    }

    sqlx::query(
        "update work_queue
            set lease = now() + make_interval(mins => $2),
                status = 'WORK',
                retries = coalesce(retries + 1, 0)
          where id = $1",
    )
    .bind(id)
    .bind(LEASE_MINUTES)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(ClaimOutcome::Claimed(Claim { id, job_type, key }))
}

fn key_required(claim: &Claim) -> Result<&str> {
    claim
        .key
        .as_deref()
        .with_context(|| format!("job {} of type {} has no key", claim.id, claim.job_type))
}

/// Dispatch a claimed job to its handler inside `tx`.
async fn dispatch(app: &App, tx: &mut PgTx, claim: &Claim) -> Result<()> {
    match claim.job_type.as_str() {
        "fetch-task-commands" => ingest::fetch_task_commands(app, tx, key_required(claim)?).await,
        "fetch-task-logs" => ingest::fetch_task_logs(app, tx, key_required(claim)?).await,
        "ingest-task-logs" => ingest::ingest_task_logs(tx, key_required(claim)?).await,
        "fetch-task-artifacts" => ingest::fetch_task_artifacts(app, tx, key_required(claim)?).await,
        "ingest-task-artifacts" => ingest::ingest_task_artifacts(tx, key_required(claim)?).await,
        "refresh-highlight-pages" => {
            web::highlights::rebuild_type(app, tx, key_required(claim)?).await
        }
        "poll-stale-branch" => {
            let branch_id: i64 = key_required(claim)?.parse().context("bad branch id key")?;
            cirrus::sweep::poll_stale_branch(app, tx, branch_id).await
        }
        "poll-stale-build" => cirrus::sweep::poll_stale_build(app, tx, key_required(claim)?).await,
        "post-task-status" => commitfest::post_task_status(app, tx, key_required(claim)?).await,
        "post-branch-status" => {
            let branch_id: i64 = key_required(claim)?.parse().context("bad branch id key")?;
            commitfest::post_branch_status(app, tx, branch_id).await
        }
        other => {
            // unknown types are dropped rather than crashing the worker
            warn!(job_type = other, "ignoring unrecognised work queue job");
            Ok(())
        }
    }
}

/// Process one job if any is runnable.  Returns true if the caller should
/// immediately go around again.
pub async fn process_one_job(app: &App) -> Result<bool> {
    let claim = match claim_one(app).await? {
        ClaimOutcome::Empty => return Ok(false),
        ClaimOutcome::MarkedFailed => return Ok(true),
        ClaimOutcome::Claimed(claim) => claim,
    };

    let mut tx = app.begin().await?;
    match dispatch(app, &mut tx, &claim).await {
        Ok(()) => {
            sqlx::query("delete from work_queue where id = $1")
                .bind(claim.id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(true)
        }
        Err(err) if net::is_retryable_error(&err) => {
            // roll back; the lease will expire and the row will be re-claimed
            error!(
                id = claim.id,
                job_type = %claim.job_type,
                error = %err,
                "job failed with a transient network error, will retry"
            );
            tx.rollback().await?;
            Ok(true)
        }
        Err(err) => Err(err.context(format!(
            "job {} of type {} failed",
            claim.id, claim.job_type
        ))),
    }
}

/// Long-running queue worker: drain until empty, then sleep on the wake-up
/// channel with a polling fallback.  Exits silently if the configured number
/// of workers is already connected.
pub async fn run_worker(app: &App) -> Result<()> {
    let (nworkers,): (i64,) = sqlx::query_as(
        "select count(*) from pg_stat_activity where application_name = 'cfbot_queue_worker'",
    )
    .fetch_one(&app.pool)
    .await?;
    if nworkers > app.config.concurrent_queue_workers {
        info!(nworkers, "enough queue workers already running, exiting");
        return Ok(());
    }

    // the listener connects under a different application_name so it does
    // not count against the worker limit
    let options: sqlx::postgres::PgConnectOptions = app.config.dsn.parse()?;
    let listen_pool = PgPoolOptions::new()
        .max_connections(1)
        .connect_with(options.application_name("cfbot_queue_listener"))
        .await
        .context("failed to connect queue listener")?;
    let mut listener = PgListener::connect_with(&listen_pool).await?;
    listener.listen(WAKE_CHANNEL).await?;

    loop {
        // drain until empty before waiting again
        while process_one_job(app).await? {}

        // clear notifications buffered while we were draining, so stale
        // wake-ups don't spin the loop
        while matches!(
            tokio::time::timeout(Duration::ZERO, listener.recv()).await,
            Ok(Ok(_))
        ) {}

        match tokio::time::timeout(POLL_INTERVAL, listener.recv()).await {
            Ok(Ok(_notification)) => {}
            Ok(Err(err)) => {
                warn!(error = %err, "queue listener lost its connection, reconnecting");
                listener = PgListener::connect_with(&listen_pool).await?;
                listener.listen(WAKE_CHANNEL).await?;
            }
            Err(_elapsed) => {} // poll fallback
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_limits() {
        assert_eq!(retry_limit("fetch-task-logs"), 3);
        assert_eq!(retry_limit("fetch-task-artifacts"), 3);
        assert_eq!(retry_limit("poll-stale-build"), 3);
        assert_eq!(retry_limit("poll-stale-branch"), 3);
        assert_eq!(retry_limit("post-branch-status"), 3);
        assert_eq!(retry_limit("post-task-status"), 3);
        // data/bug investigation types get no retries
        assert_eq!(retry_limit("ingest-task-logs"), 0);
        assert_eq!(retry_limit("ingest-task-artifacts"), 0);
        assert_eq!(retry_limit("refresh-highlight-pages"), 0);
    }
}
