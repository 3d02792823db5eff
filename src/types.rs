//! Shared domain types: CI entity statuses, branch lifecycle, and the
//! observation-source tag carried by every history row.

use serde::{Deserialize, Serialize};

/// Status domain shared by builds and tasks, as reported by the CI service.
/// `Deleted` is synthetic: assigned locally when the CI service denies
/// knowledge of an entity that previously existed in a pre-execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CiStatus {
    Created,
    Triggered,
    Scheduled,
    Paused,
    Executing,
    Completed,
    Failed,
    Aborted,
    Errored,
    Skipped,
    Deleted,
}

impl CiStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CiStatus::Created => "CREATED",
            CiStatus::Triggered => "TRIGGERED",
            CiStatus::Scheduled => "SCHEDULED",
            CiStatus::Paused => "PAUSED",
            CiStatus::Executing => "EXECUTING",
            CiStatus::Completed => "COMPLETED",
            CiStatus::Failed => "FAILED",
            CiStatus::Aborted => "ABORTED",
            CiStatus::Errored => "ERRORED",
            CiStatus::Skipped => "SKIPPED",
            CiStatus::Deleted => "DELETED",
        }
    }

    /// Final statuses never transition again.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            CiStatus::Completed
                | CiStatus::Failed
                | CiStatus::Aborted
                | CiStatus::Errored
                | CiStatus::Skipped
                | CiStatus::Deleted
        )
    }

    /// The pre-execution set: statuses a build sits in before any work has
    /// started.  Webhooks for these are the ones most commonly lost.
    pub fn is_pre_execution(&self) -> bool {
        matches!(
            self,
            CiStatus::Created | CiStatus::Triggered | CiStatus::Scheduled
        )
    }

    /// Task statuses the Commitfest app is informed about.
    pub fn is_posted_task_status(&self) -> bool {
        !matches!(self, CiStatus::Skipped | CiStatus::Deleted)
    }
}

impl std::str::FromStr for CiStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(CiStatus::Created),
            "TRIGGERED" => Ok(CiStatus::Triggered),
            "SCHEDULED" => Ok(CiStatus::Scheduled),
            "PAUSED" => Ok(CiStatus::Paused),
            "EXECUTING" => Ok(CiStatus::Executing),
            "COMPLETED" => Ok(CiStatus::Completed),
            "FAILED" => Ok(CiStatus::Failed),
            "ABORTED" => Ok(CiStatus::Aborted),
            "ERRORED" => Ok(CiStatus::Errored),
            "SKIPPED" => Ok(CiStatus::Skipped),
            "DELETED" => Ok(CiStatus::Deleted),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

impl std::fmt::Display for CiStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognised status {0:?}")]
pub struct UnknownStatus(pub String);

/// Lifecycle of a materialised branch row.
///
/// `failed` before any build exists means the patches did not apply.
/// `testing` moves to `finished`/`failed` from build results, and any
/// non-terminal status moves to `timeout` after a fixed wall-clock age.
/// `timeout` is terminal and sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BranchStatus {
    Failed,
    Testing,
    Finished,
    Timeout,
}

impl BranchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BranchStatus::Failed => "failed",
            BranchStatus::Testing => "testing",
            BranchStatus::Finished => "finished",
            BranchStatus::Timeout => "timeout",
        }
    }

    pub fn is_final(&self) -> bool {
        !matches!(self, BranchStatus::Testing)
    }

    /// The branch status implied by a build status.
    pub fn from_build_status(build: CiStatus) -> BranchStatus {
        if !build.is_final() {
            BranchStatus::Testing
        } else if build == CiStatus::Completed {
            BranchStatus::Finished
        } else {
            BranchStatus::Failed
        }
    }
}

impl std::str::FromStr for BranchStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "failed" => Ok(BranchStatus::Failed),
            "testing" => Ok(BranchStatus::Testing),
            "finished" => Ok(BranchStatus::Finished),
            "timeout" => Ok(BranchStatus::Timeout),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

impl std::fmt::Display for BranchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an observed state transition came from.  Webhooks are fast but
/// lossy; polls are slow but authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Webhook,
    Poll,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Webhook => "webhook",
            Source::Poll => "poll",
        }
    }
}

/// Commitfest submission statuses eligible for building.
pub const ACTIVE_SUBMISSION_STATUSES: &[&str] = &[
    "Ready for Committer",
    "Needs review",
    "Waiting on Author",
];

/// The local branch name pushed to the hosted repo for a submission.
pub fn branch_name_for_submission(submission_id: i64) -> String {
    format!("cf/{submission_id}")
}

/// The inverse: extract the submission id from a `cf/<id>` branch name.
pub fn submission_id_from_branch_name(branch_name: &str) -> Option<i64> {
    branch_name.strip_prefix("cf/")?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for s in [
            "CREATED",
            "TRIGGERED",
            "SCHEDULED",
            "PAUSED",
            "EXECUTING",
            "COMPLETED",
            "FAILED",
            "ABORTED",
            "ERRORED",
            "SKIPPED",
            "DELETED",
        ] {
            let parsed: CiStatus = s.parse().unwrap();
            assert_eq!(parsed.as_str(), s);
        }
        assert!("BOGUS".parse::<CiStatus>().is_err());
    }

    #[test]
    fn test_finality() {
        assert!(!CiStatus::Created.is_final());
        assert!(!CiStatus::Executing.is_final());
        assert!(!CiStatus::Paused.is_final());
        assert!(CiStatus::Completed.is_final());
        assert!(CiStatus::Errored.is_final());
        assert!(CiStatus::Deleted.is_final());
    }

    #[test]
    fn test_pre_execution_set() {
        assert!(CiStatus::Created.is_pre_execution());
        assert!(CiStatus::Triggered.is_pre_execution());
        assert!(CiStatus::Scheduled.is_pre_execution());
        assert!(!CiStatus::Paused.is_pre_execution());
        assert!(!CiStatus::Executing.is_pre_execution());
    }

    #[test]
    fn test_posted_task_statuses() {
        // CREATED and PAUSED are in the posted set (the callback itself
        // filters on the task's current status at post time).
        assert!(CiStatus::Created.is_posted_task_status());
        assert!(CiStatus::Paused.is_posted_task_status());
        assert!(CiStatus::Completed.is_posted_task_status());
        assert!(!CiStatus::Skipped.is_posted_task_status());
        assert!(!CiStatus::Deleted.is_posted_task_status());
    }

    #[test]
    fn test_branch_status_from_build() {
        assert_eq!(
            BranchStatus::from_build_status(CiStatus::Executing),
            BranchStatus::Testing
        );
        assert_eq!(
            BranchStatus::from_build_status(CiStatus::Completed),
            BranchStatus::Finished
        );
        assert_eq!(
            BranchStatus::from_build_status(CiStatus::Aborted),
            BranchStatus::Failed
        );
    }

    #[test]
    fn test_branch_name_round_trip() {
        assert_eq!(branch_name_for_submission(4000), "cf/4000");
        assert_eq!(submission_id_from_branch_name("cf/4000"), Some(4000));
        assert_eq!(submission_id_from_branch_name("master"), None);
        assert_eq!(submission_id_from_branch_name("cf/abc"), None);
    }

    #[test]
    fn test_serde_shapes() {
        let s: CiStatus = serde_json::from_str("\"EXECUTING\"").unwrap();
        assert_eq!(s, CiStatus::Executing);
        assert_eq!(serde_json::to_string(&s).unwrap(), "\"EXECUTING\"");
        let b: BranchStatus = serde_json::from_str("\"testing\"").unwrap();
        assert_eq!(b, BranchStatus::Testing);
    }
}
