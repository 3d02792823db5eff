//! The patchburner sandbox, an external control script that applies patch
//! sets in an isolated filesystem.  We only ever talk to it through its
//! subcommands; the script owns the sandbox lifecycle and layout.

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use tokio::process::Command;

use crate::config::Config;

fn command(config: &Config, subcommand: &str) -> Command {
    // PATCHBURNER_CTL may carry a prefix such as "sudo /path/to/script"
    let mut parts = config.patchburner_ctl.split_whitespace();
    let program = parts.next().unwrap_or("false");
    let mut cmd = Command::new(program);
    cmd.args(parts);
    cmd.arg(subcommand);
    cmd
}

/// Run a control subcommand that must succeed, returning its stdout.
pub async fn ctl(config: &Config, subcommand: &str) -> Result<String> {
    let output = command(config, subcommand)
        .output()
        .await
        .with_context(|| format!("failed to run patchburner {subcommand}"))?;
    if !output.status.success() {
        bail!(
            "patchburner {} failed: {}",
            subcommand,
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Ask the script where things live.  Paths are reported one per call.
pub async fn template_repo_path(config: &Config) -> Result<PathBuf> {
    Ok(PathBuf::from(ctl(config, "template-repo-path").await?.trim()))
}

pub async fn burner_repo_path(config: &Config) -> Result<PathBuf> {
    Ok(PathBuf::from(ctl(config, "burner-repo-path").await?.trim()))
}

pub async fn burner_patch_path(config: &Config) -> Result<PathBuf> {
    Ok(PathBuf::from(ctl(config, "burner-patch-path").await?.trim()))
}

pub async fn create(config: &Config) -> Result<()> {
    ctl(config, "create").await.map(|_| ())
}

pub async fn destroy(config: &Config) -> Result<()> {
    ctl(config, "destroy").await.map(|_| ())
}

/// Apply the staged patches inside the sandbox.  Non-zero exit means the
/// patch set does not apply; combined stdout+stderr is the public log.
pub async fn apply(config: &Config) -> Result<(String, bool)> {
    let output = command(config, "apply")
        .output()
        .await
        .context("failed to run patchburner apply")?;
    let mut log = String::from_utf8_lossy(&output.stdout).into_owned();
    log.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok((log, output.status.success()))
}
