//! Stale-entity detection and reconciliation against the pull API.
//!
//! The sweepers run from the minute tick and only enqueue deduplicated
//! polling jobs; the poll handlers run from queue workers and do the actual
//! network calls, applying what they learn under the same per-entity locks
//! and CAS discipline as webhook ingestion.

use anyhow::{Context, Result};
use sqlx::Row;
use tracing::{info, warn};

use crate::cirrus::state::{self, BuildSnapshot, TaskSnapshot};
use crate::cirrus::{self, BuildDetail};
use crate::db::{App, PgTx};
use crate::queue;
use crate::types::{branch_name_for_submission, BranchStatus, Source};

/// Fallback staleness threshold when no reference statistics exist.
const FALLBACK_STALE_SECONDS: f64 = 30.0 * 60.0;

/// Hard wall-clock age after which a testing branch times out.
const BRANCH_TIMEOUT_MINUTES: i64 = 60;

/// A testing branch that still has no build after a minute has probably had
/// its build-creation webhook lost; poll for it.
pub async fn check_stale_branches(app: &App) -> Result<()> {
    let mut tx = app.begin().await?;
    let rows = sqlx::query(
        "select id
           from branch
          where status = 'testing'
            and build_id is null
            and created < now() - interval '1 minute'",
    )
    .fetch_all(&mut *tx)
    .await?;
    for row in rows {
        let id: i64 = row.get("id");
        queue::enqueue_if_not_exists(&mut tx, "poll-stale-branch", &id.to_string()).await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Builds sitting in a non-final status much longer than reference-branch
/// builds normally do are suspects for lost webhooks.
pub async fn check_stale_builds(app: &App) -> Result<()> {
    let mut tx = app.begin().await?;
    let rows = sqlx::query(
        "select b.build_id
           from build b
           left join build_status_statistics s
             on s.branch_name = case when b.branch_name = $1
                                       or b.branch_name like $2 || '%'
                                     then b.branch_name
                                     else $1
                                end
            and s.status = b.status
          where b.status not in ('COMPLETED', 'FAILED', 'ABORTED', 'ERRORED', 'SKIPPED', 'DELETED')
            and extract(epoch from now() - b.created) >
                coalesce(case when s.n >= 2
                              then s.avg_elapsed + 3 * s.stddev_elapsed
                         end, $3)",
    )
    .bind(&app.config.mainline_branch)
    .bind(&app.config.release_branch_prefix)
    .bind(FALLBACK_STALE_SECONDS)
    .fetch_all(&mut *tx)
    .await?;
    for row in rows {
        let build_id: String = row.get("build_id");
        queue::enqueue_if_not_exists(&mut tx, "poll-stale-build", &build_id).await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Like `check_stale_builds` but per task, measuring the time the task has
/// sat in its current status since its latest history row.
pub async fn check_stale_tasks(app: &App) -> Result<()> {
    let mut tx = app.begin().await?;
    let rows = sqlx::query(
        "select t.build_id
           from task t
           join build b on b.build_id = t.build_id
           left join lateral (select max(received) as last_received
                                from task_status_history h
                               where h.task_id = t.task_id) h on true
           left join task_status_statistics s
             on s.branch_name = case when b.branch_name = $1
                                       or b.branch_name like $2 || '%'
                                     then b.branch_name
                                     else $1
                                end
            and s.task_name = t.task_name
            and s.status = t.status
          where t.status not in ('COMPLETED', 'FAILED', 'ABORTED', 'ERRORED', 'SKIPPED', 'DELETED')
            and extract(epoch from now() - coalesce(h.last_received, t.created)) >
                coalesce(case when s.n >= 2
                              then s.avg_elapsed + 3 * s.stddev_elapsed
                         end, $3)
          group by t.build_id",
    )
    .bind(&app.config.mainline_branch)
    .bind(&app.config.release_branch_prefix)
    .bind(FALLBACK_STALE_SECONDS)
    .fetch_all(&mut *tx)
    .await?;
    for row in rows {
        let build_id: String = row.get("build_id");
        queue::enqueue_if_not_exists(&mut tx, "poll-stale-build", &build_id).await?;
    }
    tx.commit().await?;
    Ok(())
}

fn build_snapshot(detail: &BuildDetail) -> Result<BuildSnapshot> {
    Ok(BuildSnapshot {
        build_id: detail.id.clone(),
        branch_name: detail.branch.clone(),
        commit_id: detail.change_id_in_repo.clone(),
        status: detail.parsed_status()?,
    })
}

/// Apply everything a poll result tells us about a build and its tasks.
pub async fn reconcile_build(tx: &mut PgTx, detail: &BuildDetail) -> Result<()> {
    let snapshot = build_snapshot(detail)?;
    let existing = sqlx::query("select status from build where build_id = $1 for update")
        .bind(&snapshot.build_id)
        .fetch_optional(&mut **tx)
        .await?;
    match existing {
        None => {
            state::ingest_build_created(tx, &snapshot, Source::Poll).await?;
        }
        Some(row) => {
            let status: crate::types::CiStatus = row
                .get::<String, _>("status")
                .parse()
                .context("stored build status")?;
            state::ingest_build_updated(tx, &snapshot, Some(status), Source::Poll).await?;
        }
    }

    for task in &detail.tasks {
        let task_snapshot = TaskSnapshot {
            task_id: task.id.clone(),
            build_id: snapshot.build_id.clone(),
            task_name: task.name.clone(),
            commit_id: Some(snapshot.commit_id.clone()),
            status: task.parsed_status()?,
            position: task.position(),
            event_timestamp: None,
        };
        let existing = sqlx::query("select status from task where task_id = $1 for update")
            .bind(&task.id)
            .fetch_optional(&mut **tx)
            .await?;
        match existing {
            None => state::ingest_task_created(tx, &task_snapshot, Source::Poll).await?,
            Some(row) => {
                let status: crate::types::CiStatus = row
                    .get::<String, _>("status")
                    .parse()
                    .context("stored task status")?;
                state::ingest_task_updated(tx, &task_snapshot, Some(status), Source::Poll).await?;
            }
        }
    }
    Ok(())
}

/// Queue handler: re-read one build from the CI API and reconcile.
pub async fn poll_stale_build(app: &App, tx: &mut PgTx, build_id: &str) -> Result<()> {
    match cirrus::get_build(&app.http, build_id).await? {
        Some(detail) => reconcile_build(tx, &detail).await,
        None => {
            info!(build_id, "CI service does not know this build");
            state::mark_build_deleted(tx, build_id).await
        }
    }
}

/// Queue handler: a testing branch has no build yet.  Time it out if it is
/// past the hard age limit, otherwise look for its builds by commit.
pub async fn poll_stale_branch(app: &App, tx: &mut PgTx, branch_id: i64) -> Result<()> {
    let row = sqlx::query(
        "select submission_id, commit_id, status, build_id,
                created <= now() - make_interval(mins => $2) as timed_out
           from branch
          where id = $1",
    )
    .bind(branch_id)
    .bind(BRANCH_TIMEOUT_MINUTES as i32)
    .fetch_optional(&mut **tx)
    .await?;
    let Some(row) = row else {
        warn!(branch_id, "poll-stale-branch for unknown branch");
        return Ok(());
    };
    let submission_id: i64 = row.get("submission_id");
    let commit_id: Option<String> = row.get("commit_id");
    let status: BranchStatus = row
        .get::<String, _>("status")
        .parse()
        .context("stored branch status")?;
    let build_id: Option<String> = row.get("build_id");
    let timed_out: bool = row.get("timed_out");

    if status != BranchStatus::Testing {
        return Ok(());
    }

    if timed_out {
        // no cancellation of in-flight CI work is attempted; later webhooks
        // still update build/task state but never revive the branch
        let updated = sqlx::query(
            "update branch
                set status = 'timeout', modified = now()
              where id = $1 and status = 'testing'",
        )
        .bind(branch_id)
        .execute(&mut **tx)
        .await?;
        if updated.rows_affected() > 0 {
            info!(branch_id, submission_id, "branch timed out");
            queue::enqueue(tx, "post-branch-status", &branch_id.to_string()).await?;
        }
        return Ok(());
    }

    if build_id.is_some() {
        return Ok(());
    }
    let Some(commit_id) = commit_id else {
        return Ok(());
    };

    let branch_name = branch_name_for_submission(submission_id);
    let builds = cirrus::search_builds(
        &app.http,
        &app.config.cirrus_user,
        &app.config.cirrus_repo,
        &commit_id,
    )
    .await?;
    for detail in builds.iter().filter(|b| b.branch == branch_name) {
        reconcile_build(tx, detail).await?;
    }
    Ok(())
}
