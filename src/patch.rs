//! Patch selection and branch materialisation.
//!
//! Each minute tick materialises at most one branch.  Newly posted patches
//! take priority; otherwise submissions are rebuilt round-robin at a rate
//! that gets through all of them once per `CYCLE_TIME` hours, to detect
//! bitrot caused by mainline advancing.

pub mod burner;
pub mod git;

use anyhow::{Context, Result};
use regex::Regex;
use sqlx::Row;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::info;

use crate::archive::{self, LatestPatchSet};
use crate::commitfest;
use crate::db::App;
use crate::queue;
use crate::types::{branch_name_for_submission, ACTIVE_SUBMISSION_STATUSES};

/// Grace period for the archive to catch up before we scrape the thread.
const ARCHIVE_SETTLE_DELAY: Duration = Duration::from_secs(10);

/// Per-submission workspace records live under `patches/<cf>/<submission>/`.
const PATCHES_DIR: &str = "patches";

fn active_statuses() -> Vec<String> {
    ACTIVE_SUBMISSION_STATUSES
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Have we pushed too many branches recently?  Never exceed the configured
/// number of branches under test at once.
async fn need_to_limit_rate(app: &App) -> Result<bool> {
    let (count,): (i64,) =
        sqlx::query_as("select count(*) from branch where status = 'testing'")
            .fetch_one(&app.pool)
            .await?;
    Ok(count >= app.config.concurrent_builds)
}

/// Priority 1: the submission that has been waiting longest with a new
/// patch available.
async fn choose_submission_with_new_patch(
    app: &App,
    cf_ids: &[i32],
) -> Result<Option<(i32, i64)>> {
    let row = sqlx::query(
        "select commitfest_id, submission_id
           from submission
          where last_message_id is not null
            and last_message_id is distinct from last_branch_message_id
            and status = any($1)
            and commitfest_id = any($2)
            and submission_id <> all($3)
          order by last_email_time, submission_id
          limit 1",
    )
    .bind(active_statuses())
    .bind(cf_ids)
    .bind(&app.config.ignore_submissions)
    .fetch_optional(&app.pool)
    .await?;
    Ok(row.map(|r| (r.get("commitfest_id"), r.get("submission_id"))))
}

/// Priority 2: the submission that has waited longest for a bitrot check,
/// but only while we are under the hourly rate implied by the cycle time.
async fn choose_submission_without_new_patch(
    app: &App,
    cf_ids: &[i32],
) -> Result<Option<(i32, i64)>> {
    let (eligible,): (i64,) = sqlx::query_as(
        "select count(*)
           from submission
          where last_message_id is not null
            and commitfest_id = any($1)
            and (backoff_until is null or now() >= backoff_until)
            and status = any($2)",
    )
    .bind(cf_ids)
    .bind(active_statuses())
    .fetch_one(&app.pool)
    .await?;
    let target_per_hour = eligible as f64 / app.config.cycle_time_hours;

    let (recent,): (i64,) = sqlx::query_as(
        "select count(*)
           from submission
          where last_message_id is not null
            and commitfest_id = any($1)
            and status = any($2)
            and last_branch_time > now() - interval '1 hour'",
    )
    .bind(cf_ids)
    .bind(active_statuses())
    .fetch_one(&app.pool)
    .await?;

    if (recent as f64) >= target_per_hour {
        return Ok(None);
    }
    let row = sqlx::query(
        "select commitfest_id, submission_id
           from submission
          where last_message_id is not null
            and commitfest_id = any($1)
            and (backoff_until is null or now() >= backoff_until)
            and status = any($2)
            and submission_id <> all($3)
          order by last_branch_time nulls first, submission_id
          limit 1",
    )
    .bind(cf_ids)
    .bind(active_statuses())
    .bind(&app.config.ignore_submissions)
    .fetch_optional(&app.pool)
    .await?;
    Ok(row.map(|r| (r.get("commitfest_id"), r.get("submission_id"))))
}

async fn choose_submission(app: &App, cf_ids: &[i32]) -> Result<Option<(i32, i64)>> {
    if let Some(choice) = choose_submission_with_new_patch(app, cf_ids).await? {
        return Ok(Some(choice));
    }
    choose_submission_without_new_patch(app, cf_ids).await
}

/// Materialise one branch this tick, if the rate limit allows and any
/// submission deserves it.
pub async fn maybe_process_one(app: &App, cf_ids: &[i32]) -> Result<()> {
    if need_to_limit_rate(app).await? {
        info!("rate limiting in effect, see CONCURRENT_BUILDS");
        return Ok(());
    }
    if let Some((commitfest_id, submission_id)) = choose_submission(app, cf_ids).await? {
        process_submission(app, commitfest_id, submission_id).await?;
    }
    Ok(())
}

/// Extract a patch version string like `v7` from the first filename that
/// follows the `vN-...` convention.
pub fn version_from_filenames<'a>(filenames: impl Iterator<Item = &'a str>) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^[vV]\d+-").unwrap());
    for name in filenames {
        if re.is_match(name) {
            return name.split('-').next().map(|v| v.to_string());
        }
    }
    None
}

/// Always overwrite both message-id fields, success or failure: the
/// commitfest app sometimes reports a new email before the message is
/// visible on the flat thread, and re-probing the same message forever
/// would wedge the scheduler on one submission.
async fn update_submission_bookkeeping(
    tx: &mut crate::db::PgTx,
    commitfest_id: i32,
    submission_id: i64,
    message_id: Option<&str>,
    commit_id: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "update submission
            set last_message_id = $3,
                last_branch_message_id = $3,
                last_branch_commit_id = $4,
                last_branch_time = now()
          where commitfest_id = $1 and submission_id = $2",
    )
    .bind(commitfest_id)
    .bind(submission_id)
    .bind(message_id)
    .bind(commit_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Fetch the selected patch set into the burner's patch directory (and a
/// per-submission workspace copy) and return the derived version string.
async fn stage_patches(
    app: &App,
    patch_dir: &Path,
    workspace: &Path,
    patch_set: &LatestPatchSet,
) -> Result<Option<String>> {
    let mut filenames = Vec::new();
    for url in &patch_set.patch_urls {
        let filename = archive::filename_from_url(url);
        let body = app.http.fetch_binary(url).await?;
        tokio::fs::write(patch_dir.join(&filename), &body)
            .await
            .with_context(|| format!("failed to write patch file {filename}"))?;
        tokio::fs::write(workspace.join(&filename), &body).await?;
        filenames.push(filename);
    }
    Ok(version_from_filenames(filenames.iter().map(|s| s.as_str())))
}

/// Record what we attempted for this submission, for inspection and the
/// generated pages.
async fn record_workspace(
    workspace: &Path,
    name: &str,
    status: &str,
    message_id: &str,
    commit_id: &str,
    apply_status: &str,
) -> Result<()> {
    for (file, value) in [
        ("name", name),
        ("status", status),
        ("message_id", message_id),
        ("commit_id", commit_id),
        ("apply_status", apply_status),
    ] {
        tokio::fs::write(workspace.join(file), value).await?;
    }
    Ok(())
}

/// The full materialisation protocol for one submission.
pub async fn process_submission(app: &App, commitfest_id: i32, submission_id: i64) -> Result<()> {
    info!(commitfest_id, submission_id, "processing submission");
    let config = &app.config;
    let template_repo = burner::template_repo_path(config).await?;
    let burner_repo = burner::burner_repo_path(config).await?;
    let patch_dir = burner::burner_patch_path(config).await?;

    git::update_mainline(&template_repo, &config.mainline_branch).await?;
    let template_commit_id = git::head_commit_id(&template_repo).await?;

    // fresh sandbox for this attempt
    burner::destroy(config).await?;
    burner::create(config).await?;

    // the archives lag the commitfest app; give them a moment
    tokio::time::sleep(ARCHIVE_SETTLE_DELAY).await;

    let thread = commitfest::thread_url(app, submission_id).await?;
    let patch_set = match &thread {
        None => None,
        Some(url) => archive::fetch_latest_patch_set(&app.http, url).await?,
    };
    let Some(patch_set) = patch_set else {
        // entry with no usable thread; clear bookkeeping so we don't spin
        let mut tx = app.begin().await?;
        update_submission_bookkeeping(&mut tx, commitfest_id, submission_id, None, None).await?;
        tx.commit().await?;
        info!(submission_id, "skipping submission with no usable thread");
        return Ok(());
    };

    let workspace = Path::new(PATCHES_DIR)
        .join(commitfest_id.to_string())
        .join(submission_id.to_string());
    tokio::fs::create_dir_all(&workspace).await?;

    let submission = sqlx::query(
        "select name, status, authors from submission
          where commitfest_id = $1 and submission_id = $2",
    )
    .bind(commitfest_id)
    .bind(submission_id)
    .fetch_one(&app.pool)
    .await?;
    let name: Option<String> = submission.get("name");
    let name = name.unwrap_or_default();
    let submission_status: Option<String> = submission.get("status");
    let authors: Vec<String> = submission.get("authors");

    let version = stage_patches(app, &patch_dir, &workspace, &patch_set).await?;
    let branch_name = branch_name_for_submission(submission_id);
    git::make_branch(&burner_repo, &branch_name).await?;

    let (apply_log, applied) = burner::apply(config).await?;
    let log_file = format!("patch_{submission_id}.log");
    write_apply_log(app, &log_file, &template_commit_id, &apply_log).await?;
    let log_url = config.apply_url(&log_file);

    let mut tx = app.begin().await?;
    if !applied {
        info!(commitfest_id, submission_id, "failed to apply patches");
        let (branch_id,): (i64,) = sqlx::query_as(
            "insert into branch (commitfest_id, submission_id, status, url)
             values ($1, $2, 'failed', $3)
             returning id",
        )
        .bind(commitfest_id)
        .bind(submission_id)
        .bind(&log_url)
        .fetch_one(&mut *tx)
        .await?;
        queue::enqueue(&mut tx, "post-branch-status", &branch_id.to_string()).await?;
    } else {
        info!(commitfest_id, submission_id, "applied patches");
        let first = git::first_commit(&burner_repo, &config.mainline_branch).await?;
        let patch_count = git::commit_count(&burner_repo, &config.mainline_branch).await?;

        let message = git::compose_commit_message(
            submission_id,
            &name,
            version.as_deref(),
            &patch_set.message_id,
            &authors,
        );
        git::add_merge_commit(&burner_repo, &config.mainline_branch, &message).await?;

        let (first_additions, first_deletions) = match (&first, patch_count > 0) {
            (Some(commit), true) => {
                git::shortstat(&burner_repo, &config.mainline_branch, commit).await?
            }
            _ => (0, 0),
        };
        let (all_additions, all_deletions) = if patch_count > 0 {
            git::shortstat(&burner_repo, &config.mainline_branch, "HEAD").await?
        } else {
            (0, 0)
        };

        if let Some(remote) = &config.git_remote_name {
            info!(branch_name = %branch_name, "pushing branch");
            git::push(&burner_repo, remote, &branch_name, &config.git_ssh_command).await?;
        }
        let ci_commit_id = git::head_commit_id(&burner_repo).await?;

        let (branch_id,): (i64,) = sqlx::query_as(
            "insert into branch (commitfest_id, submission_id, commit_id, status, url, version,
                                 patch_count, first_additions, first_deletions,
                                 all_additions, all_deletions)
             values ($1, $2, $3, 'testing', $4, $5, $6, $7, $8, $9, $10)
             returning id",
        )
        .bind(commitfest_id)
        .bind(submission_id)
        .bind(&ci_commit_id)
        .bind(&log_url)
        .bind(&version)
        .bind(patch_count)
        .bind(first_additions)
        .bind(first_deletions)
        .bind(all_additions)
        .bind(all_deletions)
        .fetch_one(&mut *tx)
        .await?;
        queue::enqueue(&mut tx, "post-branch-status", &branch_id.to_string()).await?;
    }

    update_submission_bookkeeping(
        &mut tx,
        commitfest_id,
        submission_id,
        Some(&patch_set.message_id),
        Some(&template_commit_id),
    )
    .await?;
    tx.commit().await?;

    record_workspace(
        &workspace,
        &name,
        submission_status.as_deref().unwrap_or(""),
        &patch_set.message_id,
        &template_commit_id,
        if applied { "passing" } else { "failing" },
    )
    .await?;

    // in a dev environment, keep the burner around after a failed apply
    // for debugging; production always cleans up
    if config.git_remote_name.is_some() && (config.production || applied) {
        burner::destroy(config).await?;
    }
    Ok(())
}

async fn write_apply_log(
    app: &App,
    log_file: &str,
    template_commit_id: &str,
    output: &str,
) -> Result<()> {
    tokio::fs::create_dir_all(&app.config.web_root).await?;
    let contents = format!(
        "=== Applying patches on top of commit ID {template_commit_id} ===\n{output}"
    );
    tokio::fs::write(app.config.web_root.join(log_file), contents)
        .await
        .context("failed to write apply log")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_extraction() {
        let names = ["0001-prep.patch", "v7-0002-main.patch"];
        assert_eq!(
            version_from_filenames(names.iter().copied()),
            Some("v7".to_string())
        );
        let names = ["V12-0001-x.patch"];
        assert_eq!(
            version_from_filenames(names.iter().copied()),
            Some("V12".to_string())
        );
        let names = ["feature.patch", "notes.txt"];
        assert_eq!(version_from_filenames(names.iter().copied()), None);
        // the convention requires the hyphen
        let names = ["v7.patch"];
        assert_eq!(version_from_filenames(names.iter().copied()), None);
    }
}
