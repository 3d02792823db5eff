//! Local build/task/branch state transitions.
//!
//! Webhooks may be lost, reordered, or duplicated, so every transition is
//! applied under a row-level exclusive lock with a compare-and-swap check
//! against the event's claimed old status.  Genuine divergence never mutates
//! local state; it enqueues a poll to re-read the truth.  Each accepted
//! transition appends one history row tagged with its source.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::{info, warn};

use crate::db::PgTx;
use crate::queue;
use crate::types::{submission_id_from_branch_name, BranchStatus, CiStatus, Source};

/// Outcome of the CAS check for an `updated` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionAction {
    /// Old status matches (or the dropped-webhook special case applies).
    Apply,
    /// New status equals the current one: idempotent replay.
    IgnoreReplay,
    /// Neither matches; local state may be behind or ahead.  Poll.
    OutOfSync,
}

/// Decide what to do with an `updated` event given the locally held status.
///
/// `allow_dropped_execution` enables the build-only special case: an
/// EXECUTING event whose old and local statuses are both pre-execution is
/// accepted, because the intermediate webhooks were evidently lost.
pub fn decide_transition(
    existing: CiStatus,
    old_status: Option<CiStatus>,
    new_status: CiStatus,
    allow_dropped_execution: bool,
) -> TransitionAction {
    if existing == new_status {
        return TransitionAction::IgnoreReplay;
    }
    if old_status == Some(existing) {
        return TransitionAction::Apply;
    }
    if allow_dropped_execution
        && new_status == CiStatus::Executing
        && existing.is_pre_execution()
        && old_status.is_some_and(|old| old.is_pre_execution())
    {
        return TransitionAction::Apply;
    }
    TransitionAction::OutOfSync
}

/// Entity snapshot carried by a build event or poll result.
#[derive(Debug, Clone)]
pub struct BuildSnapshot {
    pub build_id: String,
    pub branch_name: String,
    pub commit_id: String,
    pub status: CiStatus,
}

/// Entity snapshot carried by a task event or poll result.
#[derive(Debug, Clone)]
pub struct TaskSnapshot {
    pub task_id: String,
    pub build_id: String,
    pub task_name: String,
    pub commit_id: Option<String>,
    pub status: CiStatus,
    pub position: Option<i32>,
    pub event_timestamp: Option<DateTime<Utc>>,
}

async fn record_build_history(
    tx: &mut PgTx,
    build_id: &str,
    status: CiStatus,
    source: Source,
    event_timestamp: Option<DateTime<Utc>>,
) -> Result<()> {
    sqlx::query(
        "insert into build_status_history (build_id, status, source, event_timestamp)
         values ($1, $2, $3, $4)",
    )
    .bind(build_id)
    .bind(status.as_str())
    .bind(source.as_str())
    .bind(event_timestamp)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn record_task_history(
    tx: &mut PgTx,
    task_id: &str,
    status: CiStatus,
    source: Source,
    event_timestamp: Option<DateTime<Utc>>,
) -> Result<()> {
    sqlx::query(
        "insert into task_status_history (task_id, status, source, event_timestamp)
         values ($1, $2, $3, $4)",
    )
    .bind(task_id)
    .bind(status.as_str())
    .bind(source.as_str())
    .bind(event_timestamp)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Lock a build row and return its current status, or None if unknown.
async fn lock_build(tx: &mut PgTx, build_id: &str) -> Result<Option<BuildSnapshot>> {
    let row = sqlx::query(
        "select build_id, branch_name, commit_id, status
           from build
          where build_id = $1
            for update",
    )
    .bind(build_id)
    .fetch_optional(&mut **tx)
    .await?;
    row.map(|r| {
        let status: String = r.get("status");
        Ok(BuildSnapshot {
            build_id: r.get("build_id"),
            branch_name: r.get("branch_name"),
            commit_id: r.get("commit_id"),
            status: status.parse().context("stored build status")?,
        })
    })
    .transpose()
}

async fn lock_task_status(tx: &mut PgTx, task_id: &str) -> Result<Option<CiStatus>> {
    let row = sqlx::query("select status from task where task_id = $1 for update")
        .bind(task_id)
        .fetch_optional(&mut **tx)
        .await?;
    row.map(|r| {
        let status: String = r.get("status");
        status.parse().context("stored task status")
    })
    .transpose()
}

/// Handle a `build created` event.  Returns true if the row was inserted;
/// a conflict means the webhook is out of sync with reality and is dropped.
pub async fn ingest_build_created(
    tx: &mut PgTx,
    snapshot: &BuildSnapshot,
    source: Source,
) -> Result<bool> {
    let result = sqlx::query(
        "insert into build (build_id, branch_name, commit_id, status)
         values ($1, $2, $3, $4)
         on conflict (build_id) do nothing",
    )
    .bind(&snapshot.build_id)
    .bind(&snapshot.branch_name)
    .bind(&snapshot.commit_id)
    .bind(snapshot.status.as_str())
    .execute(&mut **tx)
    .await?;
    if result.rows_affected() == 0 {
        info!(
            build_id = %snapshot.build_id,
            "build creation webhook out of sync with local state, dropping"
        );
        return Ok(false);
    }
    record_build_history(tx, &snapshot.build_id, snapshot.status, source, None).await?;
    branch_update(tx, snapshot).await?;
    Ok(true)
}

/// Handle a `build updated` event (or a poll observation, which passes the
/// locally read status as `old_status`).
pub async fn ingest_build_updated(
    tx: &mut PgTx,
    snapshot: &BuildSnapshot,
    old_status: Option<CiStatus>,
    source: Source,
) -> Result<()> {
    let Some(existing) = lock_build(tx, &snapshot.build_id).await? else {
        queue::enqueue_if_not_exists(tx, "poll-stale-build", &snapshot.build_id).await?;
        return Ok(());
    };
    match decide_transition(existing.status, old_status, snapshot.status, true) {
        TransitionAction::IgnoreReplay => Ok(()),
        TransitionAction::OutOfSync => {
            info!(
                build_id = %snapshot.build_id,
                local = %existing.status,
                claimed_old = ?old_status,
                new = %snapshot.status,
                "build webhook diverges from local state, deferring to poll"
            );
            queue::enqueue_if_not_exists(tx, "poll-stale-build", &snapshot.build_id).await
        }
        TransitionAction::Apply => {
            sqlx::query("update build set status = $2, modified = now() where build_id = $1")
                .bind(&snapshot.build_id)
                .bind(snapshot.status.as_str())
                .execute(&mut **tx)
                .await?;
            record_build_history(tx, &snapshot.build_id, snapshot.status, source, None).await?;
            branch_update(tx, snapshot).await
        }
    }
}

/// Handle a `task created` event.  The parent build must exist locally or
/// we have missed its creation entirely; poll it instead.
pub async fn ingest_task_created(
    tx: &mut PgTx,
    snapshot: &TaskSnapshot,
    source: Source,
) -> Result<()> {
    if lock_build(tx, &snapshot.build_id).await?.is_none() {
        queue::enqueue_if_not_exists(tx, "poll-stale-build", &snapshot.build_id).await?;
        return Ok(());
    }
    let result = sqlx::query(
        "insert into task (task_id, build_id, position, task_name, commit_id, status)
         values ($1, $2, $3, $4, $5, $6)
         on conflict (task_id) do nothing",
    )
    .bind(&snapshot.task_id)
    .bind(&snapshot.build_id)
    .bind(snapshot.position)
    .bind(&snapshot.task_name)
    .bind(&snapshot.commit_id)
    .bind(snapshot.status.as_str())
    .execute(&mut **tx)
    .await?;
    if result.rows_affected() == 0 {
        return Ok(());
    }
    record_task_history(
        tx,
        &snapshot.task_id,
        snapshot.status,
        source,
        snapshot.event_timestamp,
    )
    .await?;
    task_follow_ups(tx, snapshot).await
}

/// Handle a `task updated` event; same CAS discipline as builds but without
/// the dropped-EXECUTING special case.
pub async fn ingest_task_updated(
    tx: &mut PgTx,
    snapshot: &TaskSnapshot,
    old_status: Option<CiStatus>,
    source: Source,
) -> Result<()> {
    let Some(existing) = lock_task_status(tx, &snapshot.task_id).await? else {
        queue::enqueue_if_not_exists(tx, "poll-stale-build", &snapshot.build_id).await?;
        return Ok(());
    };
    match decide_transition(existing, old_status, snapshot.status, false) {
        TransitionAction::IgnoreReplay => Ok(()),
        TransitionAction::OutOfSync => {
            info!(
                task_id = %snapshot.task_id,
                local = %existing,
                claimed_old = ?old_status,
                new = %snapshot.status,
                "task webhook diverges from local state, deferring to poll"
            );
            queue::enqueue_if_not_exists(tx, "poll-stale-build", &snapshot.build_id).await
        }
        TransitionAction::Apply => {
            sqlx::query("update task set status = $2, modified = now() where task_id = $1")
                .bind(&snapshot.task_id)
                .bind(snapshot.status.as_str())
                .execute(&mut **tx)
                .await?;
            record_task_history(
                tx,
                &snapshot.task_id,
                snapshot.status,
                source,
                snapshot.event_timestamp,
            )
            .await?;
            task_follow_ups(tx, snapshot).await
        }
    }
}

/// Work spawned by every accepted task status change.
async fn task_follow_ups(tx: &mut PgTx, snapshot: &TaskSnapshot) -> Result<()> {
    if snapshot.status.is_posted_task_status() {
        queue::enqueue(tx, "post-task-status", &snapshot.task_id).await?;
    }
    if snapshot.status.is_final() {
        queue::enqueue(tx, "fetch-task-commands", &snapshot.task_id).await?;
    }
    Ok(())
}

/// Is this build the one the branch row should track?  The CI provider may
/// re-run builds for the same commit, so this is a decision, not a fact.
async fn is_current_build(tx: &mut PgTx, build: &BuildSnapshot) -> Result<bool> {
    if !build.status.is_final() {
        return Ok(true);
    }
    let other_running = sqlx::query(
        "select 1
           from build
          where branch_name = $1
            and commit_id = $2
            and build_id <> $3
            and status not in ('COMPLETED', 'FAILED', 'ABORTED', 'ERRORED', 'SKIPPED', 'DELETED')
          limit 1",
    )
    .bind(&build.branch_name)
    .bind(&build.commit_id)
    .bind(&build.build_id)
    .fetch_optional(&mut **tx)
    .await?;
    if other_running.is_some() {
        return Ok(false);
    }
    let newest = sqlx::query(
        "select build_id
           from build
          where branch_name = $1
            and commit_id = $2
          order by created desc
          limit 1",
    )
    .bind(&build.branch_name)
    .bind(&build.commit_id)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(newest.is_some_and(|row| row.get::<String, _>("build_id") == build.build_id))
}

/// Merge a build transition into the branch row tracking its submission.
/// Called after any accepted build transition whose branch is `cf/<id>`.
pub async fn branch_update(tx: &mut PgTx, build: &BuildSnapshot) -> Result<()> {
    let Some(submission_id) = submission_id_from_branch_name(&build.branch_name) else {
        return Ok(()); // mainline or release branch, nothing to track
    };
    if !is_current_build(tx, build).await? {
        return Ok(());
    }

    let row = sqlx::query(
        "select id, commitfest_id, status, build_id
           from branch
          where submission_id = $1
            and commit_id = $2
          order by created
          limit 1
            for update",
    )
    .bind(submission_id)
    .bind(&build.commit_id)
    .fetch_optional(&mut **tx)
    .await?;
    let Some(row) = row else {
        warn!(
            branch_name = %build.branch_name,
            commit_id = %build.commit_id,
            "no branch row for build, ignoring"
        );
        return Ok(());
    };
    let branch_id: i64 = row.get("id");
    let commitfest_id: i32 = row.get("commitfest_id");
    let old_branch_status: BranchStatus = row
        .get::<String, _>("status")
        .parse()
        .context("stored branch status")?;
    let old_build_id: Option<String> = row.get("build_id");

    let mut changed = false;
    if old_build_id.as_deref() != Some(build.build_id.as_str()) {
        sqlx::query("update branch set build_id = $2, modified = now() where id = $1")
            .bind(branch_id)
            .bind(&build.build_id)
            .execute(&mut **tx)
            .await?;
        changed = true;
    }

    // timeout is terminal and sticky; later build activity never revives it
    let new_branch_status = BranchStatus::from_build_status(build.status);
    let status_changed =
        old_branch_status != BranchStatus::Timeout && old_branch_status != new_branch_status;
    if status_changed {
        sqlx::query("update branch set status = $2, modified = now() where id = $1")
            .bind(branch_id)
            .bind(new_branch_status.as_str())
            .execute(&mut **tx)
            .await?;
        changed = true;
    }

    if changed {
        queue::enqueue(tx, "post-branch-status", &branch_id.to_string()).await?;
    }
    if status_changed && new_branch_status.is_final() && build.status.is_final() {
        compute_backoff(
            tx,
            commitfest_id,
            submission_id,
            build.status == CiStatus::Completed,
        )
        .await?;
    }
    Ok(())
}

/// Exponential backoff per submission: doubled on every failing final build
/// of the current branch's current build, cleared on a COMPLETED one.
pub async fn compute_backoff(
    tx: &mut PgTx,
    commitfest_id: i32,
    submission_id: i64,
    completed: bool,
) -> Result<()> {
    if completed {
        sqlx::query(
            "update submission
                set backoff_until = null,
                    last_backoff = null
              where commitfest_id = $1 and submission_id = $2",
        )
        .bind(commitfest_id)
        .bind(submission_id)
        .execute(&mut **tx)
        .await?;
    } else {
        sqlx::query(
            "update submission
                set last_backoff = coalesce(last_backoff * 2, interval '1 day'),
                    backoff_until = now() + coalesce(last_backoff * 2, interval '1 day')
              where commitfest_id = $1 and submission_id = $2",
        )
        .bind(commitfest_id)
        .bind(submission_id)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

/// A poll found the CI service denying knowledge of this build.  If we only
/// ever saw it in a pre-execution status, it was evidently cancelled before
/// starting: record the synthetic DELETED terminal status.
pub async fn mark_build_deleted(tx: &mut PgTx, build_id: &str) -> Result<()> {
    let Some(existing) = lock_build(tx, build_id).await? else {
        return Ok(());
    };
    if !existing.status.is_pre_execution() {
        warn!(
            build_id,
            status = %existing.status,
            "CI service denies knowledge of a build past pre-execution, leaving it"
        );
        return Ok(());
    }
    sqlx::query("update build set status = 'DELETED', modified = now() where build_id = $1")
        .bind(build_id)
        .execute(&mut **tx)
        .await?;
    record_build_history(tx, build_id, CiStatus::Deleted, Source::Poll, None).await?;
    let snapshot = BuildSnapshot {
        status: CiStatus::Deleted,
        ..existing
    };
    branch_update(tx, &snapshot).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idempotent_replay() {
        assert_eq!(
            decide_transition(
                CiStatus::Executing,
                Some(CiStatus::Scheduled),
                CiStatus::Executing,
                true
            ),
            TransitionAction::IgnoreReplay
        );
    }

    #[test]
    fn test_matching_old_applies() {
        assert_eq!(
            decide_transition(
                CiStatus::Scheduled,
                Some(CiStatus::Scheduled),
                CiStatus::Executing,
                true
            ),
            TransitionAction::Apply
        );
    }

    #[test]
    fn test_dropped_webhooks_special_case() {
        // local CREATED, event says SCHEDULED -> EXECUTING: the TRIGGERED
        // and SCHEDULED webhooks were lost; accept anyway (builds only)
        assert_eq!(
            decide_transition(
                CiStatus::Created,
                Some(CiStatus::Scheduled),
                CiStatus::Executing,
                true
            ),
            TransitionAction::Apply
        );
        assert_eq!(
            decide_transition(
                CiStatus::Created,
                Some(CiStatus::Scheduled),
                CiStatus::Executing,
                false
            ),
            TransitionAction::OutOfSync
        );
    }

    #[test]
    fn test_genuine_divergence() {
        // local EXECUTING, event claims CREATED -> COMPLETED
        assert_eq!(
            decide_transition(
                CiStatus::Executing,
                Some(CiStatus::Created),
                CiStatus::Completed,
                true
            ),
            TransitionAction::OutOfSync
        );
    }

    #[test]
    fn test_special_case_needs_pre_execution_on_both_sides() {
        // local already EXECUTING: not pre-execution, special case must not fire
        assert_eq!(
            decide_transition(
                CiStatus::Executing,
                Some(CiStatus::Created),
                CiStatus::Executing,
                true
            ),
            TransitionAction::IgnoreReplay
        );
        // old status final: not pre-execution
        assert_eq!(
            decide_transition(
                CiStatus::Created,
                Some(CiStatus::Failed),
                CiStatus::Executing,
                true
            ),
            TransitionAction::OutOfSync
        );
    }

    #[test]
    fn test_missing_old_status() {
        assert_eq!(
            decide_transition(CiStatus::Created, None, CiStatus::Executing, true),
            TransitionAction::OutOfSync
        );
    }
}
