//! Git plumbing for the template and burner repositories.

use anyhow::{bail, Context, Result};
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;
use tokio::process::Command;

async fn git(repo: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo)
        .output()
        .await
        .with_context(|| format!("failed to run git {args:?}"))?;
    if !output.status.success() {
        bail!(
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Throw away local changes and fast-forward the template clone to the
/// current mainline head.
pub async fn update_mainline(repo: &Path, mainline: &str) -> Result<()> {
    git(repo, &["checkout", "-q", "."]).await?;
    git(repo, &["clean", "-fd"]).await?;
    git(repo, &["checkout", "-q", mainline]).await?;
    git(repo, &["pull", "-q"]).await?;
    Ok(())
}

pub async fn head_commit_id(repo: &Path) -> Result<String> {
    Ok(git(repo, &["rev-parse", "HEAD"]).await?.trim().to_string())
}

/// Create (or recreate) the working branch in the burner repository.
pub async fn make_branch(repo: &Path, branch: &str) -> Result<()> {
    // blow away the branch if it exists already
    let _ = git(repo, &["branch", "-q", "-D", branch]).await;
    git(repo, &["checkout", "-q", "-b", branch]).await?;
    Ok(())
}

/// Replace the branch contents with mainline plus a single merge commit
/// carrying `message`, merging in whatever HEAD pointed at.
pub async fn add_merge_commit(repo: &Path, mainline: &str, message: &str) -> Result<()> {
    let current = head_commit_id(repo).await?;
    git(repo, &["reset", mainline, "--hard", "-q"]).await?;
    git(repo, &["merge", "-q", "--no-ff", "-m", message, &current]).await?;
    Ok(())
}

/// First commit on top of mainline, in topo order, if any.
pub async fn first_commit(repo: &Path, mainline: &str) -> Result<Option<String>> {
    let range = format!("{mainline}..HEAD");
    let output = git(repo, &["rev-list", "--topo-order", &range]).await?;
    Ok(output.lines().last().map(|line| line.trim().to_string()))
}

pub async fn commit_count(repo: &Path, mainline: &str) -> Result<i32> {
    let range = format!("{mainline}..HEAD");
    let output = git(repo, &["rev-list", "--count", &range]).await?;
    output.trim().parse().context("parsing rev-list --count")
}

/// `git diff --shortstat` additions/deletions between mainline and a commit.
pub async fn shortstat(repo: &Path, mainline: &str, commit: &str) -> Result<(i32, i32)> {
    let output = git(repo, &["diff", "--shortstat", mainline, commit]).await?;
    Ok(parse_shortstat(&output))
}

pub fn parse_shortstat(shortstat: &str) -> (i32, i32) {
    static ADDITIONS: OnceLock<Regex> = OnceLock::new();
    static DELETIONS: OnceLock<Regex> = OnceLock::new();
    let additions_re = ADDITIONS.get_or_init(|| Regex::new(r"(\d+) insertion").unwrap());
    let deletions_re = DELETIONS.get_or_init(|| Regex::new(r"(\d+) deletion").unwrap());
    let additions = additions_re
        .captures(shortstat)
        .and_then(|c| c[1].parse().ok())
        .unwrap_or(0);
    let deletions = deletions_re
        .captures(shortstat)
        .and_then(|c| c[1].parse().ok())
        .unwrap_or(0);
    (additions, deletions)
}

/// Force-push the branch to the configured remote using the configured SSH
/// command.
pub async fn push(repo: &Path, remote: &str, branch: &str, ssh_command: &str) -> Result<()> {
    let output = Command::new("git")
        .args(["push", "-q", "-f", remote, branch])
        .env("GIT_SSH_COMMAND", ssh_command)
        .current_dir(repo)
        .output()
        .await
        .context("failed to run git push")?;
    if !output.status.success() {
        bail!(
            "git push of {} to {} failed: {}",
            branch,
            remote,
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(())
}

/// The deterministic merge commit message identifying the submission, the
/// source message, and the authors.
pub fn compose_commit_message(
    submission_id: i64,
    name: &str,
    version: Option<&str>,
    message_id: &str,
    authors: &[String],
) -> String {
    let title = match version {
        Some(version) => format!("{version} - {name}"),
        None => name.to_string(),
    };
    format!(
        "[CF {submission_id}] {title}\n\
         \n\
         This branch was automatically generated by a robot using patches from an\n\
         email thread registered at:\n\
         \n\
         https://commitfest.postgresql.org/patch/{submission_id}\n\
         \n\
         The branch will be overwritten each time a new patch version is posted to\n\
         the thread, and also periodically to check for bitrot caused by changes\n\
         on the master branch.\n\
         \n\
         Patch(es): https://www.postgresql.org/message-id/{message_id}\n\
         Author(s): {}\n",
        authors.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_shortstat() {
        assert_eq!(
            parse_shortstat(" 3 files changed, 120 insertions(+), 15 deletions(-)"),
            (120, 15)
        );
        assert_eq!(
            parse_shortstat(" 1 file changed, 1 insertion(+)"),
            (1, 0)
        );
        assert_eq!(parse_shortstat(""), (0, 0));
    }

    #[test]
    fn test_commit_message() {
        let message = compose_commit_message(
            4000,
            "Make everything faster",
            Some("v7"),
            "abc@example.com",
            &["A. Hacker".to_string(), "B. Reviewer".to_string()],
        );
        assert!(message.starts_with("[CF 4000] v7 - Make everything faster\n"));
        assert!(message.contains("https://commitfest.postgresql.org/patch/4000"));
        assert!(message.contains("Patch(es): https://www.postgresql.org/message-id/abc@example.com"));
        assert!(message.contains("Author(s): A. Hacker, B. Reviewer"));
    }

    #[test]
    fn test_commit_message_without_version() {
        let message = compose_commit_message(4000, "Tidy things", None, "m@x", &["A".to_string()]);
        assert!(message.starts_with("[CF 4000] Tidy things\n"));
    }
}
