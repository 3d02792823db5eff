use cfbot_lib::cirrus::state::{decide_transition, TransitionAction};
use cfbot_lib::types::{BranchStatus, CiStatus};

/// A lost webhook: local build still CREATED, the EXECUTING update claims
/// the build was SCHEDULED.  Both sides are pre-execution, so the update is
/// accepted rather than deferred to a poll.
#[test]
fn lost_webhook_executing_is_accepted() {
    assert_eq!(
        decide_transition(
            CiStatus::Created,
            Some(CiStatus::Scheduled),
            CiStatus::Executing,
            true,
        ),
        TransitionAction::Apply
    );
}

/// Genuine divergence: local EXECUTING, webhook claims CREATED ->
/// COMPLETED.  The transition is rejected; the caller polls instead.
#[test]
fn divergent_webhook_is_rejected() {
    assert_eq!(
        decide_transition(
            CiStatus::Executing,
            Some(CiStatus::Created),
            CiStatus::Completed,
            true,
        ),
        TransitionAction::OutOfSync
    );
}

/// Replaying the same webhook twice must be idempotent.
#[test]
fn replay_is_idempotent() {
    assert_eq!(
        decide_transition(
            CiStatus::Completed,
            Some(CiStatus::Executing),
            CiStatus::Completed,
            true,
        ),
        TransitionAction::IgnoreReplay
    );
}

/// Tasks have no dropped-EXECUTING special case.
#[test]
fn tasks_have_no_special_case() {
    assert_eq!(
        decide_transition(
            CiStatus::Created,
            Some(CiStatus::Scheduled),
            CiStatus::Executing,
            false,
        ),
        TransitionAction::OutOfSync
    );
}

#[test]
fn branch_status_tracks_build_finality() {
    for status in [
        CiStatus::Created,
        CiStatus::Triggered,
        CiStatus::Scheduled,
        CiStatus::Paused,
        CiStatus::Executing,
    ] {
        assert_eq!(
            BranchStatus::from_build_status(status),
            BranchStatus::Testing
        );
    }
    assert_eq!(
        BranchStatus::from_build_status(CiStatus::Completed),
        BranchStatus::Finished
    );
    for status in [
        CiStatus::Failed,
        CiStatus::Aborted,
        CiStatus::Errored,
        CiStatus::Deleted,
    ] {
        assert_eq!(
            BranchStatus::from_build_status(status),
            BranchStatus::Failed
        );
    }
}

#[test]
fn deleted_is_terminal() {
    assert!(CiStatus::Deleted.is_final());
    assert!(!CiStatus::Deleted.is_posted_task_status());
}
