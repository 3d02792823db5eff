//! Client for the Commitfest app: the JSON API we poll, the submission
//! table synchronisation, and the status callbacks we POST back.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use tracing::info;

use crate::archive;
use crate::db::{App, PgTx};
use crate::types::{branch_name_for_submission, CiStatus};

#[derive(Debug, Clone, Deserialize)]
pub struct CommitfestInfo {
    pub id: i32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PatchInfo {
    pub id: i64,
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub authors: Vec<String>,
    pub last_email_time: Option<DateTime<Utc>>,
}

/// The commitfests whose submissions currently need CI.
pub async fn list_commitfests(app: &App) -> Result<Vec<CommitfestInfo>> {
    #[derive(Deserialize)]
    struct Response {
        #[serde(default)]
        commitfests: Vec<CommitfestInfo>,
    }
    let url = format!("{}/api/v1/commitfests/needs_ci", app.config.commitfest_host);
    match app.http.fetch_json::<Response>(&url).await {
        Ok(response) => Ok(response.commitfests),
        Err(err) if err.is_not_found() => Ok(Vec::new()),
        Err(err) => Err(err.into()),
    }
}

/// All submissions of one commitfest.  Empty when it does not exist.
pub async fn list_submissions(app: &App, commitfest_id: i32) -> Result<Vec<PatchInfo>> {
    #[derive(Deserialize)]
    struct Response {
        #[serde(default)]
        patches: Vec<PatchInfo>,
    }
    let url = format!(
        "{}/api/v1/commitfests/{}/patches",
        app.config.commitfest_host, commitfest_id
    );
    match app.http.fetch_json::<Response>(&url).await {
        Ok(response) => Ok(response.patches),
        Err(err) if err.is_not_found() => Ok(Vec::new()),
        Err(err) => Err(err.into()),
    }
}

/// Resolve a submission to its flat-thread URL, if it has one.
pub async fn thread_url(app: &App, submission_id: i64) -> Result<Option<String>> {
    #[derive(Deserialize)]
    struct ThreadInfo {
        url: String,
    }
    #[derive(Deserialize)]
    struct Response {
        #[serde(default)]
        threads: Vec<ThreadInfo>,
    }
    let url = format!(
        "{}/api/v1/patches/{}/threads",
        app.config.commitfest_host, submission_id
    );
    match app.http.fetch_json::<Response>(&url).await {
        Ok(response) => Ok(response.threads.into_iter().next().map(|t| t.url)),
        Err(err) if err.is_not_found() => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Make sure we have an up-to-date submission row for every patch in the
/// commitfest.  The guarded upsert avoids rewriting unchanged rows.
pub async fn pull_submissions(app: &App, commitfest_id: i32) -> Result<()> {
    let patches = list_submissions(app, commitfest_id).await?;
    let mut tx = app.begin().await?;
    for patch in &patches {
        sqlx::query(
            "insert into submission (commitfest_id, submission_id, name, status, authors,
                                     last_email_time)
             values ($1, $2, $3, $4, $5, $6)
             on conflict (commitfest_id, submission_id) do update
                set name = excluded.name,
                    status = excluded.status,
                    authors = excluded.authors,
                    last_email_time = excluded.last_email_time
              where (submission.name, submission.status, submission.authors,
                     submission.last_email_time)
                    is distinct from
                    (excluded.name, excluded.status, excluded.authors,
                     excluded.last_email_time)",
        )
        .bind(commitfest_id)
        .bind(patch.id)
        .bind(&patch.name)
        .bind(&patch.status)
        .bind(&patch.authors)
        .bind(patch.last_email_time)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Check threads we have never checked, or whose last_email_time moved.
/// The archive is eventually consistent, so threads that changed within the
/// last minute are left for the next tick.
pub async fn pull_modified_threads(app: &App) -> Result<()> {
    let rows = sqlx::query(
        "select commitfest_id, submission_id, last_email_time
           from submission
          where last_email_time_checked is null
             or (last_email_time_checked is distinct from last_email_time
                 and last_email_time < now() - interval '1 minute')",
    )
    .fetch_all(&app.pool)
    .await?;

    for row in rows {
        let commitfest_id: i32 = row.get("commitfest_id");
        let submission_id: i64 = row.get("submission_id");
        let last_email_time: Option<DateTime<Utc>> = row.get("last_email_time");
        info!(commitfest_id, submission_id, "checking thread for new patches");

        let message_id = match thread_url(app, submission_id).await? {
            None => None,
            Some(url) => archive::fetch_latest_patch_set(&app.http, &url)
                .await?
                .map(|set| set.message_id),
        };

        sqlx::query(
            "update submission
                set last_email_time_checked = $3,
                    last_message_id = $4
              where commitfest_id = $1 and submission_id = $2",
        )
        .bind(commitfest_id)
        .bind(submission_id)
        .bind(last_email_time)
        .bind(message_id)
        .execute(&app.pool)
        .await?;
    }
    Ok(())
}

/// The branch-status message shape posted to the Commitfest app.
#[derive(Debug, Clone, Serialize)]
pub struct BranchStatusPayload {
    pub shared_secret: String,
    pub submission_id: i64,
    pub branch_name: String,
    pub branch_id: i64,
    pub commit_id: Option<String>,
    pub apply_url: Option<String>,
    pub status: String,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub version: Option<String>,
    pub patch_count: Option<i32>,
    pub first_additions: Option<i32>,
    pub first_deletions: Option<i32>,
    pub all_additions: Option<i32>,
    pub all_deletions: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskStatusPayload {
    pub task_id: String,
    pub commit_id: Option<String>,
    pub task_name: String,
    pub position: Option<i32>,
    pub status: String,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskUpdatePayload {
    pub shared_secret: String,
    pub task_status: TaskStatusPayload,
    pub branch_status: Option<BranchStatusPayload>,
}

fn branch_payload_from_row(row: &sqlx::postgres::PgRow, secret: &str) -> BranchStatusPayload {
    let submission_id: i64 = row.get("submission_id");
    BranchStatusPayload {
        shared_secret: secret.to_string(),
        submission_id,
        branch_name: branch_name_for_submission(submission_id),
        branch_id: row.get("id"),
        commit_id: row.get("commit_id"),
        apply_url: row.get("url"),
        status: row.get("status"),
        created: row.get("created"),
        modified: row.get("modified"),
        version: row.get("version"),
        patch_count: row.get("patch_count"),
        first_additions: row.get("first_additions"),
        first_deletions: row.get("first_deletions"),
        all_additions: row.get("all_additions"),
        all_deletions: row.get("all_deletions"),
    }
}

async fn load_branch_payload(
    tx: &mut PgTx,
    branch_id: i64,
    secret: &str,
) -> Result<Option<BranchStatusPayload>> {
    let row = sqlx::query(
        "select id, submission_id, commit_id, url, status, created, modified, version,
                patch_count, first_additions, first_deletions, all_additions, all_deletions
           from branch
          where id = $1",
    )
    .bind(branch_id)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(row.map(|r| branch_payload_from_row(&r, secret)))
}

async fn load_branch_payload_for_commit(
    tx: &mut PgTx,
    commit_id: &str,
    secret: &str,
) -> Result<Option<BranchStatusPayload>> {
    let row = sqlx::query(
        "select id, submission_id, commit_id, url, status, created, modified, version,
                patch_count, first_additions, first_deletions, all_additions, all_deletions
           from branch
          where commit_id = $1
          order by created
          limit 1",
    )
    .bind(commit_id)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(row.map(|r| branch_payload_from_row(&r, secret)))
}

async fn deliver<T: Serialize + std::fmt::Debug>(app: &App, payload: &T) -> Result<()> {
    match &app.config.commitfest_post_url {
        Some(url) => {
            app.http.post_json_no_response(url, payload).await?;
            Ok(())
        }
        None => {
            info!(payload = ?payload, "no COMMITFEST_POST_URL configured, logging only");
            Ok(())
        }
    }
}

/// Queue handler: report one branch's state to the Commitfest app.
pub async fn post_branch_status(app: &App, tx: &mut PgTx, branch_id: i64) -> Result<()> {
    let Some(payload) =
        load_branch_payload(tx, branch_id, &app.config.commitfest_shared_secret).await?
    else {
        info!(branch_id, "post-branch-status for unknown branch, dropping");
        return Ok(());
    };
    deliver(app, &payload).await
}

/// Queue handler: report one task's state, along with its branch's state,
/// to the Commitfest app.  Tasks still in CREATED or PAUSED are not posted.
pub async fn post_task_status(app: &App, tx: &mut PgTx, task_id: &str) -> Result<()> {
    let row = sqlx::query(
        "select task_id, commit_id, task_name, position, status, created, modified
           from task
          where task_id = $1",
    )
    .bind(task_id)
    .fetch_optional(&mut **tx)
    .await?;
    let Some(row) = row else {
        info!(task_id, "post-task-status for unknown task, dropping");
        return Ok(());
    };
    let status: CiStatus = row
        .get::<String, _>("status")
        .parse()
        .context("stored task status")?;
    if matches!(status, CiStatus::Created | CiStatus::Paused) {
        return Ok(());
    }
    let commit_id: Option<String> = row.get("commit_id");
    let branch_status = match &commit_id {
        Some(commit_id) => {
            load_branch_payload_for_commit(tx, commit_id, &app.config.commitfest_shared_secret)
                .await?
        }
        None => None,
    };
    let payload = TaskUpdatePayload {
        shared_secret: app.config.commitfest_shared_secret.clone(),
        task_status: TaskStatusPayload {
            task_id: row.get("task_id"),
            commit_id,
            task_name: row.get("task_name"),
            position: row.get("position"),
            status: status.as_str().to_string(),
            created: row.get("created"),
            modified: row.get("modified"),
        },
        branch_status,
    };
    deliver(app, &payload).await
}

/// Forget the last branch attempt for a submission so the scheduler picks
/// it up again; used by the requeue endpoint.
pub async fn requeue_submission(
    tx: &mut PgTx,
    commitfest_id: i32,
    submission_id: i64,
) -> Result<bool> {
    let result = sqlx::query(
        "update submission
            set last_branch_message_id = null,
                backoff_until = null,
                last_backoff = null
          where commitfest_id = $1
            and submission_id = $2
            and last_message_id is not null",
    )
    .bind(commitfest_id)
    .bind(submission_id)
    .execute(&mut **tx)
    .await?;
    Ok(result.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_info_shape() {
        let json = r#"{
            "patches": [
                {"id": 4000, "name": "Some feature", "status": "Needs review",
                 "authors": ["A. Hacker", "B. Reviewer"],
                 "last_email_time": "2024-01-01T00:00:00Z"}
            ]
        }"#;
        #[derive(Deserialize)]
        struct Response {
            patches: Vec<PatchInfo>,
        }
        let response: Response = serde_json::from_str(json).unwrap();
        assert_eq!(response.patches[0].id, 4000);
        assert_eq!(response.patches[0].authors.len(), 2);
        assert!(response.patches[0].last_email_time.is_some());
    }

    #[test]
    fn test_branch_payload_shape() {
        let payload = BranchStatusPayload {
            shared_secret: "s3cret".into(),
            submission_id: 4000,
            branch_name: "cf/4000".into(),
            branch_id: 7,
            commit_id: Some("abc".into()),
            apply_url: Some("http://x/patch_4000.log".into()),
            status: "testing".into(),
            created: Utc::now(),
            modified: Utc::now(),
            version: Some("v7".into()),
            patch_count: Some(3),
            first_additions: Some(10),
            first_deletions: Some(2),
            all_additions: Some(20),
            all_deletions: Some(4),
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["branch_name"], "cf/4000");
        assert_eq!(value["patch_count"], 3);
        assert!(value.get("shared_secret").is_some());
    }
}
