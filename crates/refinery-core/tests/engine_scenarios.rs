//! End-to-end merge queue scenarios against an in-memory git remote.

mod support;

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use refinery_core::{
    checkpoint::{Checkpoint, CheckpointStore, Stage},
    engine::{CandidateOutcome, Fleet, GateClearance, RunMode},
    git::{GitOps, RebaseStrategy},
    lock::{local_hostname, OwnerId},
    Candidate, Error, EventKind, OnConflict, QueueLedger, RefineryConfig, RejectionReason, Result,
};
use support::{Harness, PatchFixer, RecordingTracker};
use tokio_util::sync::CancellationToken;

const A: &str = "polecat/ace/a";
const B: &str = "polecat/nux/b";

fn config() -> RefineryConfig {
    let mut config = RefineryConfig::default();
    config.merge_queue.poll_interval = Duration::from_millis(20);
    config
}

fn older() -> Duration {
    Duration::from_secs(120)
}

fn newer() -> Duration {
    Duration::from_secs(60)
}

async fn kinds(harness: &Harness) -> Result<Vec<EventKind>> {
    let log = refinery_core::EventLog::new(harness.layout.events_file());
    Ok(log.read_all().await?.into_iter().map(|e| e.kind).collect())
}

fn position(kinds: &[EventKind], kind: EventKind) -> Option<usize> {
    kinds.iter().position(|k| *k == kind)
}

fn candidate(branch: &str, head: &str) -> Candidate {
    Candidate {
        branch_name: branch.to_string(),
        base_sha: "base".to_string(),
        head_sha: head.to_string(),
        owner: "ace".to_string(),
        discovered_at: Utc::now(),
    }
}

#[tokio::test]
async fn test_fifo_each_candidate_sees_its_predecessor() -> Result<()> {
    let harness = Harness::new()?;
    harness.git.add_branch(B, newer());
    harness.git.add_branch(A, older());

    let summary = harness.engine(config())?.run_once(CancellationToken::new()).await?;

    assert_eq!(summary.merged_branches(), vec![A, B]);
    let rebases = harness.git.rebases();
    assert_eq!(rebases.len(), 2);
    assert_eq!(rebases[0], (A.to_string(), "base".to_string(), RebaseStrategy::Standard));
    // B is verified against a target that already contains A
    assert_eq!(rebases[1].1, "base+a#1");
    assert_eq!(harness.git.main_patches(), vec!["base", "a#1", "b#1"]);
    assert_eq!(harness.git.deleted_branches(), vec![A, B]);

    let locks = harness.locks(&[])?;
    assert!(locks.inspect(&harness.layout.merge_lock_key())?.is_none());
    assert!(CheckpointStore::new(harness.layout.checkpoint_file())
        .read()?
        .is_none());

    let kinds = kinds(&harness).await?;
    assert_eq!(kinds.iter().filter(|k| **k == EventKind::LockAcquired).count(), 2);
    assert_eq!(kinds.iter().filter(|k| **k == EventKind::LockReleased).count(), 2);
    assert_eq!(kinds.first(), Some(&EventKind::EngineStarted));
    assert_eq!(kinds.last(), Some(&EventKind::EngineStopped));
    Ok(())
}

#[tokio::test]
async fn test_candidate_rebases_onto_current_target_tip() -> Result<()> {
    let harness = Harness::new()?;
    harness.git.add_branch(A, older());
    let tip = harness.git.advance_main("m2");

    let summary = harness.engine(config())?.run_once(CancellationToken::new()).await?;

    assert_eq!(summary.merged, 1);
    assert_eq!(harness.git.rebases()[0].1, tip);
    assert_eq!(harness.git.main_patches(), vec!["base", "m2", "a#1"]);
    Ok(())
}

#[tokio::test]
async fn test_flaky_tests_pass_on_retry() -> Result<()> {
    let harness = Harness::new()?;
    harness.git.add_branch(A, older());
    harness.git.script_tests(&[false, false, true]);
    let mut config = config();
    config.merge_queue.retry_flaky_tests = 2;

    let summary = harness.engine(config)?.run_once(CancellationToken::new()).await?;

    assert!(matches!(
        &summary.outcomes[0],
        CandidateOutcome::Merged { clearance: GateClearance::TestsPassed { attempts: 3 }, .. }
    ));
    assert_eq!(harness.git.test_runs().len(), 3);
    let kinds = kinds(&harness).await?;
    assert!(kinds.contains(&EventKind::TestsFlakyPassed));
    assert!(!kinds.contains(&EventKind::FailureClassified));
    Ok(())
}

#[tokio::test]
async fn test_genuine_failure_is_rejected_and_owner_notified() -> Result<()> {
    let harness = Harness::new()?;
    harness.git.add_branch(A, older());
    harness.git.script_tests(&[false, false, false]);
    let mut config = config();
    config.merge_queue.retry_flaky_tests = 2;

    let mut engine = harness.engine(config)?;
    let summary = engine.run_once(CancellationToken::new()).await?;

    assert_eq!(summary.rejected, 1);
    assert_eq!(harness.git.main_patches(), vec!["base"]);
    // Three candidate runs, then one run of the bare target
    let runs = harness.git.test_runs();
    assert_eq!(runs.len(), 4);
    assert_eq!(runs[3], "base");

    let rejections = harness.notifier.rejections();
    assert_eq!(rejections.len(), 1);
    assert_eq!(rejections[0].reason, RejectionReason::TestsFailed);
    assert_eq!(rejections[0].candidate.branch_name, A);

    let kinds = kinds(&harness).await?;
    assert!(kinds.contains(&EventKind::FailureClassified));
    assert!(kinds.contains(&EventKind::BranchRejected));
    assert!(!kinds.contains(&EventKind::BranchMerged));

    // Same head is not picked up again
    let again = engine.run_once(CancellationToken::new()).await?;
    assert!(again.outcomes.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_preexisting_failure_files_issue_before_merge() -> Result<()> {
    let harness = Harness::new()?;
    harness.git.add_branch(A, older());
    harness.git.script_tests(&[false, false]);
    harness.git.set_main_green(false);

    let summary = harness.engine(config())?.run_once(CancellationToken::new()).await?;

    assert!(matches!(
        &summary.outcomes[0],
        CandidateOutcome::Merged { clearance: GateClearance::IssueFiled { .. }, .. }
    ));
    let drafts = harness.tracker.drafts();
    assert_eq!(drafts.len(), 1);
    assert_eq!(drafts[0].failing_rev, "base");
    assert_eq!(drafts[0].surfaced_by, A);

    let kinds = kinds(&harness).await?;
    let filed = position(&kinds, EventKind::BugFiled);
    let merged = position(&kinds, EventKind::BranchMerged);
    assert!(filed.is_some() && merged.is_some());
    assert!(filed < merged);
    Ok(())
}

#[tokio::test]
async fn test_main_fix_lands_before_candidate() -> Result<()> {
    let harness = Harness::new()?;
    harness.git.add_branch(A, older());
    harness.git.script_tests(&[false, false]);
    harness.git.set_main_green(false);

    let summary = harness
        .engine(config())?
        .with_fixer(Arc::new(PatchFixer::new(harness.git.clone())))
        .run_once(CancellationToken::new())
        .await?;

    assert!(matches!(
        &summary.outcomes[0],
        CandidateOutcome::Merged { clearance: GateClearance::MainFixed { .. }, .. }
    ));
    assert_eq!(harness.git.main_patches(), vec!["base", "fix", "a#1"]);
    assert!(harness.tracker.drafts().is_empty());

    let kinds = kinds(&harness).await?;
    assert!(position(&kinds, EventKind::MainFixApplied) < position(&kinds, EventKind::BranchMerged));
    Ok(())
}

#[tokio::test]
async fn test_gate_fails_closed_without_fix_or_issue() -> Result<()> {
    let harness = Harness::new()?;
    harness.git.add_branch(A, older());
    harness.git.script_tests(&[false, false]);
    harness.git.set_main_green(false);

    let summary = harness
        .engine(config())?
        .with_issue_tracker(Arc::new(RecordingTracker::broken()))
        .run_once(CancellationToken::new())
        .await?;

    assert_eq!(summary.blocked, 1);
    assert_eq!(summary.merged, 0);
    assert_eq!(harness.git.main_patches(), vec!["base"]);
    // Not the branch's fault: no rejection, branch stays queued
    assert!(harness.notifier.rejections().is_empty());
    assert!(harness.git.deleted_branches().is_empty());

    let kinds = kinds(&harness).await?;
    assert!(kinds.contains(&EventKind::MergeBlocked));
    assert!(!kinds.contains(&EventKind::BranchMerged));
    assert!(harness
        .locks(&[])?
        .inspect(&harness.layout.merge_lock_key())?
        .is_none());
    Ok(())
}

#[tokio::test]
async fn test_rejected_push_is_retried_once() -> Result<()> {
    let harness = Harness::new()?;
    harness.git.add_branch(A, older());
    harness.git.reject_pushes(1);

    let summary = harness.engine(config())?.run_once(CancellationToken::new()).await?;

    assert_eq!(summary.merged, 1);
    let rebases = harness.git.rebases();
    assert_eq!(rebases.len(), 2);
    assert_eq!(rebases[1].1, "base+x1");
    assert_eq!(harness.git.main_patches(), vec!["base", "x1", "a#1"]);
    assert!(kinds(&harness).await?.contains(&EventKind::PushRejected));
    Ok(())
}

#[tokio::test]
async fn test_second_push_rejection_needs_manual_intervention() -> Result<()> {
    let harness = Harness::new()?;
    harness.git.add_branch(A, older());
    harness.git.reject_pushes(2);

    let summary = harness.engine(config())?.run_once(CancellationToken::new()).await?;

    assert!(matches!(
        &summary.outcomes[0],
        CandidateOutcome::Rejected { reason: RejectionReason::ManualIntervention, .. }
    ));
    assert_eq!(harness.git.main_patches(), vec!["base", "x1", "x2"]);
    assert!(kinds(&harness).await?.contains(&EventKind::ManualInterventionRequired));
    assert_eq!(harness.notifier.rejections().len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_push_retry_on_red_target_reuses_tracking_issue() -> Result<()> {
    let harness = Harness::new()?;
    harness.git.add_branch(A, older());
    // Fails both passes; the outside commit that beats our push is red too
    harness.git.script_tests(&[false, false, false, false]);
    harness.git.set_main_green(false);
    harness.git.reject_pushes(1);

    let summary = harness.engine(config())?.run_once(CancellationToken::new()).await?;

    assert!(matches!(
        &summary.outcomes[0],
        CandidateOutcome::Merged { clearance: GateClearance::IssueFiled { issue }, .. } if issue.0 == "gt-1"
    ));
    assert_eq!(harness.git.main_patches(), vec!["base", "x1", "a#1"]);
    assert_eq!(harness.tracker.drafts().len(), 1);

    let kinds = kinds(&harness).await?;
    assert!(kinds.contains(&EventKind::PushRejected));
    assert_eq!(kinds.iter().filter(|k| **k == EventKind::BugFiled).count(), 1);
    Ok(())
}

#[tokio::test]
async fn test_unreachable_remote_mid_candidate_leaves_it_queued() -> Result<()> {
    let harness = Harness::new()?;
    harness.git.add_branch(A, older());
    // Discovery fetch works, the rebase stage's own fetch does not
    harness.git.script_fetches(&[true, false]);
    let mut engine = harness.engine(config())?;

    let failed = engine.run_once(CancellationToken::new()).await;

    assert!(matches!(failed, Err(Error::Git { ref command, .. }) if command == "fetch"));
    assert!(harness.notifier.rejections().is_empty());
    assert!(QueueLedger::new(harness.layout.ledger_file()).load()?.is_empty());
    assert!(CheckpointStore::new(harness.layout.checkpoint_file())
        .read()?
        .is_none());
    assert!(harness
        .locks(&[])?
        .inspect(&harness.layout.merge_lock_key())?
        .is_none());
    assert!(!kinds(&harness).await?.contains(&EventKind::BranchRejected));

    let summary = engine.run_once(CancellationToken::new()).await?;

    assert_eq!(summary.merged_branches(), vec![A]);
    assert_eq!(harness.git.main_patches(), vec!["base", "a#1"]);
    Ok(())
}

#[tokio::test]
async fn test_continuous_run_backs_off_while_remote_is_unreachable() -> Result<()> {
    let harness = Harness::new()?;
    harness.git.add_branch(A, older());
    harness.git.script_fetches(&[false, true, false]);
    let mut engine = harness.engine(config())?;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(400)).await;
        trigger.cancel();
    });
    let summary = engine.run(RunMode::Continuous, cancel).await?;

    assert_eq!(summary.merged, 1);
    assert_eq!(summary.rejected, 0);
    assert!(harness.notifier.rejections().is_empty());
    assert!(harness.git.fetches() > 3);
    Ok(())
}

#[tokio::test]
async fn test_conflict_assigns_back_and_queue_continues() -> Result<()> {
    let harness = Harness::new()?;
    harness.git.add_branch(A, older());
    harness.git.add_branch(B, newer());
    harness.git.conflict_on(A);

    let summary = harness.engine(config())?.run_once(CancellationToken::new()).await?;

    assert!(matches!(
        &summary.outcomes[0],
        CandidateOutcome::Rejected { reason: RejectionReason::RebaseConflict, .. }
    ));
    assert_eq!(summary.merged_branches(), vec![B]);
    assert_eq!(harness.git.main_patches(), vec!["base", "b#1"]);
    assert!(kinds(&harness).await?.contains(&EventKind::RebaseConflict));
    Ok(())
}

#[tokio::test]
async fn test_auto_rebase_retries_preferring_candidate() -> Result<()> {
    let harness = Harness::new()?;
    harness.git.add_branch(A, older());
    harness.git.conflict_on(A);
    let mut config = config();
    config.merge_queue.on_conflict = OnConflict::AutoRebase;

    let summary = harness.engine(config)?.run_once(CancellationToken::new()).await?;

    assert_eq!(summary.merged, 1);
    let strategies: Vec<_> = harness.git.rebases().into_iter().map(|r| r.2).collect();
    assert_eq!(
        strategies,
        vec![RebaseStrategy::Standard, RebaseStrategy::PreferCandidate]
    );
    Ok(())
}

#[tokio::test]
async fn test_stage_timeout_rejects_and_releases_lock() -> Result<()> {
    let harness = Harness::new()?;
    harness.git.add_branch(A, older());
    harness.git.slow_tests(Duration::from_secs(5));
    let mut config = config();
    config.runtime.test_timeout = Duration::from_millis(50);

    let summary = harness.engine(config)?.run_once(CancellationToken::new()).await?;

    assert!(matches!(
        &summary.outcomes[0],
        CandidateOutcome::Rejected { reason: RejectionReason::Timeout, .. }
    ));
    assert!(kinds(&harness).await?.contains(&EventKind::StageTimeout));
    assert!(harness
        .locks(&[])?
        .inspect(&harness.layout.merge_lock_key())?
        .is_none());
    assert_eq!(harness.git.main_patches(), vec!["base"]);
    Ok(())
}

#[tokio::test]
async fn test_resume_from_testing_checkpoint_skips_rebase() -> Result<()> {
    let harness = Harness::new()?;
    let head = harness.git.add_branch(A, older());
    let rebased = harness
        .git
        .rebase(A, "base", RebaseStrategy::Standard)
        .await?;

    let key = harness.layout.merge_lock_key();
    harness
        .locks(&[])?
        .acquire(&key, &harness.owner, Duration::from_secs(300))?;
    CheckpointStore::new(harness.layout.checkpoint_file()).write(
        &Checkpoint::new(
            "gastown",
            harness.owner.clone(),
            candidate(A, &head),
            Stage::Testing,
            "base",
        )
        .with_candidate_head(rebased),
    )?;

    let summary = harness.engine(config())?.run_once(CancellationToken::new()).await?;

    assert_eq!(summary.merged_branches(), vec![A]);
    // Only the rebase done by the test itself
    assert_eq!(harness.git.rebases().len(), 1);
    assert!(kinds(&harness).await?.contains(&EventKind::CheckpointResumed));
    Ok(())
}

#[tokio::test]
async fn test_resume_from_rebasing_checkpoint_replays_to_same_head() -> Result<()> {
    let harness = Harness::new()?;
    let head = harness.git.add_branch(A, older());
    let first = harness
        .git
        .rebase(A, "base", RebaseStrategy::Standard)
        .await?;
    let again = harness
        .git
        .rebase(A, "base", RebaseStrategy::Standard)
        .await?;
    assert_eq!(first, again);

    let key = harness.layout.merge_lock_key();
    harness
        .locks(&[])?
        .acquire(&key, &harness.owner, Duration::from_secs(300))?;
    CheckpointStore::new(harness.layout.checkpoint_file()).write(&Checkpoint::pending(
        "gastown",
        harness.owner.clone(),
        candidate(A, &head),
        Stage::Rebasing,
    ))?;

    let summary = harness.engine(config())?.run_once(CancellationToken::new()).await?;

    assert!(matches!(
        &summary.outcomes[0],
        CandidateOutcome::Merged { merged_head, .. } if *merged_head == first
    ));
    assert_eq!(harness.git.main_patches(), vec!["base", "a#1"]);
    assert_eq!(harness.git.rebases().len(), 3);
    Ok(())
}

#[tokio::test]
async fn test_foreign_checkpoint_is_discarded_and_candidate_goes_first() -> Result<()> {
    let harness = Harness::new()?;
    harness.git.add_branch(A, older());
    let head_b = harness.git.add_branch(B, newer());

    let crashed = OwnerId::new(999_999, "crashed", local_hostname());
    let key = harness.layout.merge_lock_key();
    let locks = harness.locks(&["crashed"])?;
    locks.acquire(&key, &crashed, Duration::from_secs(300))?;
    CheckpointStore::new(harness.layout.checkpoint_file()).write(&Checkpoint::new(
        "gastown",
        crashed,
        candidate(B, &head_b),
        Stage::Merging,
        "base",
    ))?;

    let summary = harness
        .engine(config())?
        .with_lock_manager(locks)
        .run_once(CancellationToken::new())
        .await?;

    assert_eq!(summary.merged_branches(), vec![B, A]);
    let kinds = kinds(&harness).await?;
    assert!(kinds.contains(&EventKind::CheckpointDiscarded));
    assert!(kinds.contains(&EventKind::LockStaleReclaimed));
    assert!(!kinds.contains(&EventKind::CheckpointResumed));
    Ok(())
}

#[tokio::test]
async fn test_shutdown_checkpoints_then_resumes_same_owner() -> Result<()> {
    let harness = Harness::new()?;
    harness.git.add_branch(A, older());
    harness.git.slow_tests(Duration::from_millis(300));
    let mut engine = harness.engine(config())?;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });
    let summary = engine.run(RunMode::Continuous, cancel).await?;

    assert!(summary.interrupted);
    assert_eq!(harness.git.main_patches(), vec!["base"]);
    let store = CheckpointStore::new(harness.layout.checkpoint_file());
    let checkpoint = store.read()?;
    assert_eq!(checkpoint.as_ref().map(|c| c.stage), Some(Stage::Merging));
    assert!(harness
        .locks(&[])?
        .is_held_by(&harness.layout.merge_lock_key(), &harness.owner)?);

    let resumed = engine.run_once(CancellationToken::new()).await?;

    assert_eq!(resumed.merged_branches(), vec![A]);
    assert_eq!(harness.git.rebases().len(), 1);
    assert_eq!(harness.git.test_runs().len(), 1);
    assert!(store.read()?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_disabled_queue_does_nothing() -> Result<()> {
    let harness = Harness::new()?;
    harness.git.add_branch(A, older());
    let mut config = config();
    config.merge_queue.enabled = false;

    let summary = harness.engine(config)?.run_once(CancellationToken::new()).await?;

    assert!(summary.outcomes.is_empty());
    assert_eq!(harness.git.main_patches(), vec!["base"]);
    assert!(kinds(&harness).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_fleet_runs_every_rig() -> Result<()> {
    let first = Harness::new()?;
    let second = Harness::new()?;
    first.git.add_branch(A, older());
    second.git.add_branch(B, older());

    let mut fleet = Fleet::new(1);
    fleet.add(first.engine(config())?);
    fleet.add(second.engine(config())?);
    assert_eq!(fleet.len(), 2);

    let results = fleet.run(RunMode::Once, CancellationToken::new()).await;

    assert_eq!(results.len(), 2);
    for (rig, result) in results {
        assert_eq!(rig, "gastown");
        assert_eq!(result?.merged, 1);
    }
    assert_eq!(first.git.main_patches(), vec!["base", "a#1"]);
    assert_eq!(second.git.main_patches(), vec!["base", "b#1"]);
    Ok(())
}
