//! Merge queue engine.
//!
//! One engine serves one rig. Each cycle scans for ready candidates, takes the
//! rig merge lock, and walks the head of the queue through rebase, test, the
//! merge gate and push. Candidates are handled strictly one at a time in
//! discovery order, so every candidate is verified against the target tip that
//! already contains its predecessors.
//!
//! # Durability
//!
//! A checkpoint is written before every stage. After a crash the engine resumes
//! at the recorded stage only when the checkpoint is fresh and the merge lock
//! is still held under the same owner identity; otherwise the checkpoint is
//! discarded, stale locks are reclaimed, and the interrupted candidate goes
//! first through the whole pipeline again.
//!
//! # Errors
//!
//! Failures that belong to one candidate (conflict, red tests, timeouts, a
//! rejected push) reject that candidate and the loop continues. Failures of the
//! refinery's own state (lock files, checkpoint writes) stop the loop. Event
//! log writes never stop it; a lost event is reported through `tracing`.

mod fleet;
mod gate;
mod outcome;
mod state;

use std::{collections::HashSet, future::Future, sync::Arc, time::Duration};

use itertools::Itertools;
use tokio::{sync::Semaphore, task::JoinHandle};
use tokio_util::sync::CancellationToken;

pub use self::{
    fleet::Fleet,
    gate::{classify, issue_draft, FailureOrigin, FixRequest, GateClearance, MainFixer},
    outcome::{CandidateOutcome, RunSummary},
    state::{can_transition, EngineState, StateMachine},
};
use crate::{
    checkpoint::{self, Checkpoint, CheckpointStore, Stage},
    config::{OnConflict, RefineryConfig},
    discovery::{Candidate, CandidateSource, GitBranchSource},
    events::{Event, EventKind, EventLog},
    git::{summarize, GitOps, RebaseStrategy, TestRun},
    layout::RigLayout,
    ledger::QueueLedger,
    lock::{Acquisition, LockManager, OwnerId, ResourceKey},
    notify::{IssueRef, IssueTracker, JsonlOutbox, OwnerNotifier, Rejection, RejectionReason},
    Error, Result,
};

/// Whether `run` drains the queue once or keeps polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Process every ready candidate, then return. A busy merge lock ends the run.
    Once,
    /// Poll until cancelled.
    Continuous,
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Once => write!(f, "once"),
            Self::Continuous => write!(f, "continuous"),
        }
    }
}

/// What startup recovery decided about a leftover checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recovery {
    /// Nothing in flight.
    Fresh,
    /// The next cycle continues the checkpointed candidate at `stage`.
    Resumed { branch: String, stage: Stage },
    /// Checkpoint dropped; `branch` is processed first from the beginning.
    Discarded { branch: String, reason: String },
}

/// Where processing of a candidate continues.
#[derive(Debug, Clone)]
enum Step {
    Rebase,
    Test {
        onto: String,
        head: String,
    },
    Gate {
        onto: String,
        head: String,
        failure: TestRun,
    },
    Merge {
        onto: String,
        head: String,
        clearance: GateClearance,
    },
    Finalize {
        merged_head: String,
        clearance: GateClearance,
    },
}

impl Step {
    const fn state(&self) -> EngineState {
        match self {
            Self::Rebase => EngineState::Rebasing,
            Self::Test { .. } => EngineState::Testing,
            Self::Gate { .. } => EngineState::HandlingFailure,
            Self::Merge { .. } => EngineState::Merging,
            Self::Finalize { .. } => EngineState::Pushed,
        }
    }
}

enum Flow {
    Continue(Step),
    Done(CandidateOutcome),
}

/// What earlier passes over the same candidate already did.
#[derive(Debug, Default)]
struct Progress {
    push_retried: bool,
    /// Issue filed for a red target; reused while the target stays red.
    tracking_issue: Option<IssueRef>,
}

/// Merge lock held for one candidate, kept fresh by a background heartbeat.
struct LockLease {
    /// Cancelled by the heartbeat task when another owner has the lock.
    lost: CancellationToken,
    stop: CancellationToken,
    heartbeat: JoinHandle<()>,
}

impl LockLease {
    async fn stop(self) {
        self.stop.cancel();
        if let Err(e) = self.heartbeat.await {
            tracing::warn!(error = %e, "heartbeat task ended abnormally");
        }
    }
}

/// Run `fut` under a stage budget.
async fn within<T>(
    stage: &str,
    limit: Duration,
    fut: impl Future<Output = Result<T>> + Send,
) -> Result<T> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| Error::Timeout {
            stage: stage.to_string(),
            seconds: limit.as_secs(),
        })?
}

/// Run a git or discovery call under `limit`. Running out of time is a git
/// failure, not a stage timeout charged to the candidate.
async fn within_git<T>(
    command: &str,
    limit: Duration,
    fut: impl Future<Output = Result<T>> + Send,
) -> Result<T> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| Error::Git {
            command: command.to_string(),
            detail: format!("timed out after {}s", limit.as_secs()),
        })?
}

/// Checkpoint written before `step` runs. The rebase stage records no target
/// tip until it has fetched one.
fn step_checkpoint(rig: &str, owner: &OwnerId, candidate: &Candidate, step: &Step) -> Checkpoint {
    let at = |stage: Stage, captured: &str| {
        Checkpoint::new(rig, owner.clone(), candidate.clone(), stage, captured)
    };
    match step {
        Step::Rebase => Checkpoint::pending(rig, owner.clone(), candidate.clone(), Stage::Rebasing),
        Step::Test { onto, head } => at(Stage::Testing, onto).with_candidate_head(head.as_str()),
        Step::Gate { onto, head, .. } => {
            at(Stage::ResolvingFailure, onto).with_candidate_head(head.as_str())
        }
        Step::Merge {
            onto,
            head,
            clearance,
        } => at(Stage::Merging, onto)
            .with_candidate_head(head.as_str())
            .with_clearance(clearance.clone()),
        Step::Finalize {
            merged_head,
            clearance,
        } => at(Stage::Merging, merged_head)
            .with_candidate_head(merged_head.as_str())
            .with_clearance(clearance.clone()),
    }
}

/// Sleep for `period`. Returns `false` if cancelled first.
async fn sleep_or_cancel(cancel: &CancellationToken, period: Duration) -> bool {
    tokio::select! {
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(period) => true,
    }
}

/// The merge queue for one rig.
pub struct MergeQueueEngine {
    rig: String,
    config: RefineryConfig,
    owner: OwnerId,
    merge_key: ResourceKey,
    git: Arc<dyn GitOps>,
    source: Arc<dyn CandidateSource>,
    locks: LockManager,
    checkpoints: CheckpointStore,
    events: Arc<EventLog>,
    ledger: QueueLedger,
    notifier: Arc<dyn OwnerNotifier>,
    issues: Arc<dyn IssueTracker>,
    fixer: Option<Arc<dyn MainFixer>>,
    merge_slots: Option<Arc<Semaphore>>,
    machine: StateMachine,
    resume: Option<Checkpoint>,
    first_up: Option<String>,
    /// Blocked `(branch, head)` pairs skipped until the next idle poll.
    deferred: HashSet<(String, String)>,
}

impl MergeQueueEngine {
    /// Engine over the rig at `layout`, with git-backed discovery and the
    /// rig's JSONL outbox for notifications and issues.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `config` does not validate, or an IO
    /// error if the lock directory cannot be created.
    pub fn new(
        layout: &RigLayout,
        config: RefineryConfig,
        owner: OwnerId,
        git: Arc<dyn GitOps>,
    ) -> Result<Self> {
        config.validate()?;
        let outbox = Arc::new(JsonlOutbox::new(layout.outbox_file()));
        let notifier: Arc<dyn OwnerNotifier> = outbox.clone();
        let source = Arc::new(GitBranchSource::new(
            Arc::clone(&git),
            config.merge_queue.target_branch.clone(),
        ));

        Ok(Self {
            rig: layout.name().to_string(),
            merge_key: layout.merge_lock_key(),
            locks: LockManager::new(layout.lock_dir())?,
            checkpoints: CheckpointStore::new(layout.checkpoint_file()),
            events: Arc::new(EventLog::new(layout.events_file())),
            ledger: QueueLedger::new(layout.ledger_file()),
            notifier,
            issues: outbox,
            source,
            git,
            config,
            owner,
            fixer: None,
            merge_slots: None,
            machine: StateMachine::default(),
            resume: None,
            first_up: None,
            deferred: HashSet::new(),
        })
    }

    #[must_use]
    pub fn with_source(mut self, source: Arc<dyn CandidateSource>) -> Self {
        self.source = source;
        self
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn OwnerNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    #[must_use]
    pub fn with_issue_tracker(mut self, issues: Arc<dyn IssueTracker>) -> Self {
        self.issues = issues;
        self
    }

    #[must_use]
    pub fn with_fixer(mut self, fixer: Arc<dyn MainFixer>) -> Self {
        self.fixer = Some(fixer);
        self
    }

    /// Replace the lock manager, e.g. to change the liveness probe.
    #[must_use]
    pub fn with_lock_manager(mut self, locks: LockManager) -> Self {
        self.locks = locks;
        self
    }

    /// Share merge slots with other engines. A permit is held per candidate.
    #[must_use]
    pub fn with_merge_slots(mut self, slots: Arc<Semaphore>) -> Self {
        self.merge_slots = Some(slots);
        self
    }

    pub fn rig(&self) -> &str {
        &self.rig
    }

    pub const fn owner(&self) -> &OwnerId {
        &self.owner
    }

    pub const fn state(&self) -> EngineState {
        self.machine.current()
    }

    pub const fn events(&self) -> &Arc<EventLog> {
        &self.events
    }

    /// Drain the queue once and return.
    pub async fn run_once(&mut self, cancel: CancellationToken) -> Result<RunSummary> {
        self.run(RunMode::Once, cancel).await
    }

    /// Run the merge queue until the queue is drained (`Once`) or `cancel`
    /// fires (`Continuous`).
    ///
    /// Cancellation is honored between stages: the running stage completes, a
    /// checkpoint describing the next one is written, and the lock stays with
    /// this owner so a restart under the same identity resumes.
    ///
    /// # Errors
    ///
    /// Lock, checkpoint and ledger failures stop the run. In `Once` mode any
    /// failure that is not absorbed by rejecting a candidate is returned; in
    /// `Continuous` mode git failures wait one poll and try again.
    pub async fn run(&mut self, mode: RunMode, cancel: CancellationToken) -> Result<RunSummary> {
        if !self.config.merge_queue.enabled {
            tracing::info!(rig = %self.rig, "merge queue disabled");
            return Ok(RunSummary::new(self.rig.as_str()));
        }

        tracing::info!(rig = %self.rig, owner = %self.owner, %mode, "merge queue starting");
        self.record(
            Event::new(EventKind::EngineStarted, &self.rig)
                .with("owner", self.owner.to_string())
                .with("mode", mode.to_string()),
        )
        .await;

        let result = self.run_loop(mode, &cancel).await;

        let stopped = Event::new(EventKind::EngineStopped, &self.rig);
        let stopped = match &result {
            Ok(summary) => stopped
                .with("merged", summary.merged)
                .with("rejected", summary.rejected)
                .with("blocked", summary.blocked),
            Err(e) => stopped.with_message(e.to_string()),
        };
        self.record(stopped).await;
        tracing::info!(rig = %self.rig, ok = result.is_ok(), "merge queue stopped");
        result
    }

    async fn run_loop(&mut self, mode: RunMode, cancel: &CancellationToken) -> Result<RunSummary> {
        let poll = self.config.merge_queue.poll_interval;
        let mut summary = RunSummary::new(self.rig.as_str());
        self.recover().await?;

        while !cancel.is_cancelled() {
            match self.cycle(mode, cancel).await {
                Ok(Some(outcome)) => {
                    let interrupted = !outcome.releases_lock();
                    summary = summary.add_outcome(outcome);
                    if interrupted {
                        break;
                    }
                }
                Ok(None) => {
                    if mode == RunMode::Once || !sleep_or_cancel(cancel, poll).await {
                        break;
                    }
                    self.deferred.clear();
                }
                Err(e)
                    if mode == RunMode::Continuous
                        && (e.is_candidate_local()
                            || e.is_retryable()
                            || matches!(e, Error::NotOwner { .. })) =>
                {
                    tracing::error!(rig = %self.rig, error = %e, "merge queue cycle failed");
                    if !sleep_or_cancel(cancel, poll).await {
                        break;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(summary)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // RECOVERY
    // ═══════════════════════════════════════════════════════════════════════

    /// Decide what to do with a checkpoint left by an earlier run.
    ///
    /// Runs automatically at the start of [`run`](Self::run).
    pub async fn recover(&mut self) -> Result<Recovery> {
        let Some(checkpoint) = self.checkpoints.read()? else {
            return Ok(Recovery::Fresh);
        };
        let Some(candidate) = checkpoint
            .queue_position
            .clone()
            .filter(|_| checkpoint.is_active())
        else {
            self.checkpoints.clear()?;
            return Ok(Recovery::Fresh);
        };

        let held = self.locks.is_held_by(&self.merge_key, &self.owner)?;
        let stale = checkpoint::is_stale(&checkpoint, self.config.runtime.checkpoint_stale_after);
        let same_owner = checkpoint.owner == self.owner;

        if held && same_owner && !stale {
            let stage = checkpoint.stage;
            tracing::info!(rig = %self.rig, branch = %candidate.branch_name, %stage, "resuming from checkpoint");
            self.record(
                Event::new(EventKind::CheckpointResumed, &self.rig)
                    .with_candidate(&candidate)
                    .with("stage", stage.to_string()),
            )
            .await;
            self.resume = Some(checkpoint);
            return Ok(Recovery::Resumed {
                branch: candidate.branch_name,
                stage,
            });
        }

        let reason = if stale {
            "checkpoint is stale"
        } else if !same_owner {
            "checkpoint belongs to another owner"
        } else {
            "merge lock is not held"
        };
        tracing::warn!(rig = %self.rig, branch = %candidate.branch_name, reason, "discarding checkpoint");
        self.record(
            Event::new(EventKind::CheckpointDiscarded, &self.rig)
                .with_candidate(&candidate)
                .with("stage", checkpoint.stage.to_string())
                .with_message(reason),
        )
        .await;

        self.checkpoints.clear()?;
        if held {
            self.locks.release(&self.merge_key, &self.owner)?;
        }
        for key in self.locks.clean_stale_locks()? {
            self.record(
                Event::new(EventKind::LockStaleReclaimed, &self.rig).with("resource", key.as_str()),
            )
            .await;
        }

        self.first_up = Some(candidate.branch_name.clone());
        Ok(Recovery::Discarded {
            branch: candidate.branch_name,
            reason: reason.to_string(),
        })
    }

    async fn resume_step(&self, checkpoint: &Checkpoint) -> Result<Step> {
        let target_head = self.refresh_target().await?;
        let unchanged = checkpoint.captured_head.as_deref() == Some(target_head.as_str());

        let step = match (
            checkpoint.stage,
            checkpoint.candidate_head.clone(),
            checkpoint.clearance.clone(),
        ) {
            (Stage::Merging, Some(head), Some(clearance)) => {
                let pushed = within_git(
                    "merge-base",
                    self.config.runtime.git_timeout,
                    self.git.is_ancestor(&head, &target_head),
                )
                .await?;
                if pushed {
                    Step::Finalize {
                        merged_head: head,
                        clearance,
                    }
                } else if unchanged {
                    Step::Merge {
                        onto: target_head,
                        head,
                        clearance,
                    }
                } else {
                    Step::Rebase
                }
            }
            (Stage::Testing | Stage::ResolvingFailure, Some(head), _) if unchanged => Step::Test {
                onto: target_head,
                head,
            },
            _ => Step::Rebase,
        };
        tracing::debug!(rig = %self.rig, stage = %checkpoint.stage, resume_at = %step.state(), "resume point chosen");
        Ok(step)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // CYCLE
    // ═══════════════════════════════════════════════════════════════════════

    /// Process the head of the queue. `Ok(None)` when there was nothing to do
    /// or the lock could not be taken.
    async fn cycle(
        &mut self,
        mode: RunMode,
        cancel: &CancellationToken,
    ) -> Result<Option<CandidateOutcome>> {
        let result = self.cycle_inner(mode, cancel).await;
        if self.machine.current() != EngineState::Idle {
            if let Err(e) = self.machine.transition(EngineState::Idle) {
                tracing::error!(error = %e, "could not return engine to idle");
            }
        }
        result
    }

    async fn cycle_inner(
        &mut self,
        mode: RunMode,
        cancel: &CancellationToken,
    ) -> Result<Option<CandidateOutcome>> {
        self.machine.transition(EngineState::Scanning)?;

        let resume = self.resume.take();
        let next = match resume.as_ref().and_then(|cp| cp.queue_position.clone()) {
            Some(candidate) => Some(candidate),
            None => self.next_candidate().await?,
        };
        let Some(candidate) = next else {
            return Ok(None);
        };

        let _slot = match self.merge_slots.clone() {
            Some(slots) => tokio::select! {
                () = cancel.cancelled() => return Ok(None),
                permit = slots.acquire_owned() => permit.ok(),
            },
            None => None,
        };

        self.machine.transition(EngineState::LockWait)?;
        let Some(lease) = self.acquire_merge_lock(mode, cancel).await? else {
            return Ok(None);
        };

        let step = match &resume {
            Some(checkpoint) => self.resume_step(checkpoint).await.unwrap_or_else(|e| {
                tracing::warn!(error = %e, "cannot check resume point; starting candidate over");
                Step::Rebase
            }),
            None => Step::Rebase,
        };

        let result = match self.process(&candidate, step, &lease, cancel).await {
            Err(e) if e.is_candidate_local() => self.reject_for_error(&candidate, &e).await,
            other => other,
        };
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                if e.is_retryable() {
                    // The candidate goes again from the top once git answers
                    tracing::warn!(rig = %self.rig, branch = %candidate.branch_name, error = %e, "git unavailable; candidate stays queued");
                    self.first_up = Some(candidate.branch_name.clone());
                }
                if e.is_retryable() || matches!(e, Error::NotOwner { .. }) {
                    if let Err(clear) = self.checkpoints.clear() {
                        tracing::warn!(error = %clear, "could not clear checkpoint");
                    }
                }
                self.end_lease(lease, true).await;
                return Err(e);
            }
        };

        self.end_lease(lease, outcome.releases_lock()).await;
        match &outcome {
            CandidateOutcome::Merged { branch, .. }
                if self.config.merge_queue.delete_merged_branches =>
            {
                self.delete_merged_branch(branch).await;
            }
            CandidateOutcome::Blocked { .. } => {
                self.deferred
                    .insert((candidate.branch_name.clone(), candidate.head_sha.clone()));
            }
            _ => {}
        }
        if matches!(outcome, CandidateOutcome::Rejected { .. }) {
            self.machine.transition(EngineState::Rejected)?;
        }
        Ok(Some(outcome))
    }

    /// Oldest unsettled candidate, or the one recovery asked to go first.
    async fn next_candidate(&mut self) -> Result<Option<Candidate>> {
        let limit = self.config.runtime.git_timeout;
        within_git("fetch", limit, self.git.fetch()).await?;
        let discovered = within_git("discovery", limit, self.source.list_ready()).await?;

        self.ledger.retain_branches(&discovered)?;
        let settled = self.ledger.load()?;
        let deferred = &self.deferred;

        let queue: Vec<Candidate> = discovered
            .into_iter()
            .filter(|c| {
                !settled
                    .get(&c.branch_name)
                    .is_some_and(|entry| entry.head_sha == c.head_sha)
            })
            .filter(|c| !deferred.contains(&(c.branch_name.clone(), c.head_sha.clone())))
            .sorted_by(|a, b| {
                a.discovered_at
                    .cmp(&b.discovered_at)
                    .then_with(|| a.branch_name.cmp(&b.branch_name))
            })
            .collect();

        let first_up = self.first_up.take();
        let preferred = first_up
            .as_deref()
            .and_then(|branch| queue.iter().find(|c| c.branch_name == branch));
        let next = preferred.or_else(|| queue.first()).cloned();

        if let Some(candidate) = &next {
            tracing::info!(rig = %self.rig, branch = %candidate.branch_name, queued = queue.len(), "next candidate");
            self.record(
                Event::new(EventKind::CandidateDiscovered, &self.rig)
                    .with_candidate(candidate)
                    .with("queued", queue.len()),
            )
            .await;
        }
        Ok(next)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // MERGE LOCK
    // ═══════════════════════════════════════════════════════════════════════

    async fn acquire_merge_lock(
        &self,
        mode: RunMode,
        cancel: &CancellationToken,
    ) -> Result<Option<LockLease>> {
        loop {
            match self
                .locks
                .acquire(&self.merge_key, &self.owner, self.config.runtime.lock_ttl)
            {
                Ok(acquisition) => {
                    if let Acquisition::Reclaimed {
                        previous, reason, ..
                    } = &acquisition
                    {
                        let previous = previous
                            .as_ref()
                            .map_or_else(|| "unknown".to_string(), ToString::to_string);
                        tracing::warn!(rig = %self.rig, %previous, %reason, "reclaimed stale merge lock");
                        self.record(
                            Event::new(EventKind::LockStaleReclaimed, &self.rig)
                                .with("resource", self.merge_key.as_str())
                                .with("previous_owner", previous)
                                .with("reason", reason.to_string()),
                        )
                        .await;
                    }
                    self.record(
                        Event::new(EventKind::LockAcquired, &self.rig)
                            .with("resource", self.merge_key.as_str())
                            .with("owner", self.owner.to_string()),
                    )
                    .await;
                    return Ok(Some(self.start_heartbeat()));
                }
                Err(Error::LockHeld { holder, .. }) => {
                    tracing::info!(rig = %self.rig, %holder, "merge lock busy");
                    if mode == RunMode::Once
                        || !sleep_or_cancel(cancel, self.config.merge_queue.poll_interval).await
                    {
                        return Ok(None);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn start_heartbeat(&self) -> LockLease {
        let lost = CancellationToken::new();
        let stop = CancellationToken::new();
        let (lost_tx, stop_rx) = (lost.clone(), stop.clone());
        let locks = self.locks.clone();
        let key = self.merge_key.clone();
        let owner = self.owner.clone();
        let events = Arc::clone(&self.events);
        let rig = self.rig.clone();
        let interval = self.config.runtime.heartbeat_interval;

        let heartbeat = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = stop_rx.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }
                match locks.heartbeat(&key, &owner) {
                    Ok(_) => tracing::trace!(resource = %key, "merge lock heartbeat"),
                    Err(e @ Error::NotOwner { .. }) => {
                        tracing::error!(%rig, error = %e, "merge lock lost");
                        let event = Event::new(EventKind::LockHeartbeatLost, &rig)
                            .with("resource", key.as_str())
                            .with_message(e.to_string());
                        if let Err(log_err) = events.log(&event).await {
                            tracing::error!(%rig, error = %log_err, "event log write failed");
                        }
                        lost_tx.cancel();
                        break;
                    }
                    Err(e) => tracing::warn!(%rig, error = %e, "merge lock heartbeat failed"),
                }
            }
        });

        LockLease {
            lost,
            stop,
            heartbeat,
        }
    }

    /// Fail with [`Error::NotOwner`] unless this engine still holds the merge lock.
    fn ensure_lock_held(&self, lease: &LockLease) -> Result<()> {
        if !lease.lost.is_cancelled() && self.locks.is_held_by(&self.merge_key, &self.owner)? {
            return Ok(());
        }
        let holder = self
            .locks
            .inspect(&self.merge_key)?
            .map_or_else(|| "nobody".to_string(), |record| record.owner.to_string());
        Err(Error::NotOwner {
            resource: self.merge_key.to_string(),
            caller: self.owner.to_string(),
            holder,
        })
    }

    async fn end_lease(&self, lease: LockLease, release: bool) {
        lease.stop().await;
        if !release {
            return;
        }
        match self.locks.release(&self.merge_key, &self.owner) {
            Ok(()) => {
                self.record(
                    Event::new(EventKind::LockReleased, &self.rig)
                        .with("resource", self.merge_key.as_str()),
                )
                .await;
            }
            Err(e) => tracing::warn!(rig = %self.rig, error = %e, "could not release merge lock"),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // PIPELINE
    // ═══════════════════════════════════════════════════════════════════════

    async fn process(
        &mut self,
        candidate: &Candidate,
        mut step: Step,
        lease: &LockLease,
        cancel: &CancellationToken,
    ) -> Result<CandidateOutcome> {
        let mut progress = Progress::default();
        loop {
            self.machine.transition(step.state())?;
            self.checkpoints.write(&self.checkpoint_for(candidate, &step))?;
            if cancel.is_cancelled() {
                tracing::info!(rig = %self.rig, branch = %candidate.branch_name, next = %step.state(), "shutdown requested; checkpoint kept");
                return Ok(CandidateOutcome::Interrupted {
                    branch: candidate.branch_name.clone(),
                });
            }

            let flow = match step {
                Step::Rebase => self.rebase_stage(candidate, lease).await?,
                Step::Test { onto, head } => self.test_stage(candidate, onto, head).await?,
                Step::Gate {
                    onto,
                    head,
                    failure,
                } => {
                    self.gate_stage(candidate, lease, onto, head, &failure, &mut progress)
                        .await?
                }
                Step::Merge {
                    onto: _,
                    head,
                    clearance,
                } => {
                    self.merge_stage(candidate, lease, head, clearance, &mut progress)
                        .await?
                }
                Step::Finalize {
                    merged_head,
                    clearance,
                } => Flow::Done(self.finalize(candidate, merged_head, clearance).await?),
            };

            match flow {
                Flow::Continue(next) => step = next,
                Flow::Done(outcome) => return Ok(outcome),
            }
        }
    }

    fn checkpoint_for(&self, candidate: &Candidate, step: &Step) -> Checkpoint {
        step_checkpoint(&self.rig, &self.owner, candidate, step)
    }

    async fn rebase_stage(&self, candidate: &Candidate, lease: &LockLease) -> Result<Flow> {
        self.ensure_lock_held(lease)?;
        let onto = self.refresh_target().await?;
        self.checkpoints.write(
            &self
                .checkpoint_for(candidate, &Step::Rebase)
                .at(Stage::Rebasing, onto.as_str()),
        )?;

        let head = self.rebase_candidate(candidate, &onto).await?;
        tracing::info!(rig = %self.rig, branch = %candidate.branch_name, %onto, %head, "rebased candidate");
        self.record(
            Event::new(EventKind::BranchRebased, &self.rig)
                .with_candidate(candidate)
                .with("onto", onto.as_str())
                .with("rebased_head", head.as_str()),
        )
        .await;
        Ok(Flow::Continue(Step::Test { onto, head }))
    }

    async fn rebase_candidate(&self, candidate: &Candidate, onto: &str) -> Result<String> {
        let limit = self.config.runtime.rebase_timeout;
        let branch = candidate.branch_name.as_str();
        match within(
            "rebase",
            limit,
            self.git.rebase(branch, onto, RebaseStrategy::Standard),
        )
        .await
        {
            Err(Error::RebaseConflict { detail, .. })
                if self.config.merge_queue.on_conflict == OnConflict::AutoRebase =>
            {
                tracing::info!(rig = %self.rig, branch, %detail, "conflict; retrying with candidate side preferred");
                within(
                    "rebase",
                    limit,
                    self.git.rebase(branch, onto, RebaseStrategy::PreferCandidate),
                )
                .await
            }
            other => other,
        }
    }

    async fn run_tests(&self, rev: &str) -> Result<TestRun> {
        within(
            "test",
            self.config.runtime.test_timeout,
            self.git.run_tests(rev, &self.config.merge_queue.test_command),
        )
        .await
    }

    async fn test_stage(&self, candidate: &Candidate, onto: String, head: String) -> Result<Flow> {
        if !self.config.merge_queue.run_tests {
            tracing::debug!(rig = %self.rig, "tests disabled");
            return Ok(Flow::Continue(Step::Merge {
                onto,
                head,
                clearance: GateClearance::TestsSkipped,
            }));
        }

        let max_runs = self.config.merge_queue.retry_flaky_tests.saturating_add(1);
        let mut attempt = 1;
        loop {
            let run = self.run_tests(&head).await?;
            if run.passed {
                let kind = if attempt > 1 {
                    EventKind::TestsFlakyPassed
                } else {
                    EventKind::TestsPassed
                };
                self.record(
                    Event::new(kind, &self.rig)
                        .with_candidate(candidate)
                        .with("rev", head.as_str())
                        .with("attempts", attempt),
                )
                .await;
                return Ok(Flow::Continue(Step::Merge {
                    onto,
                    head,
                    clearance: GateClearance::TestsPassed { attempts: attempt },
                }));
            }

            if attempt >= max_runs {
                tracing::warn!(rig = %self.rig, branch = %candidate.branch_name, attempts = attempt, "candidate tests failed");
                self.record(
                    Event::new(EventKind::TestsFailed, &self.rig)
                        .with_candidate(candidate)
                        .with("rev", head.as_str())
                        .with("attempts", attempt)
                        .with_message(summarize(&run.output)),
                )
                .await;
                return Ok(Flow::Continue(Step::Gate {
                    onto,
                    head,
                    failure: run,
                }));
            }

            tracing::warn!(rig = %self.rig, branch = %candidate.branch_name, attempt, max_runs, "test run failed; retrying");
            attempt += 1;
            self.checkpoints.write(
                &self
                    .checkpoint_for(
                        candidate,
                        &Step::Test {
                            onto: onto.clone(),
                            head: head.clone(),
                        },
                    )
                    .with_attempt(attempt),
            )?;
        }
    }

    async fn gate_stage(
        &self,
        candidate: &Candidate,
        lease: &LockLease,
        onto: String,
        head: String,
        failure: &TestRun,
        progress: &mut Progress,
    ) -> Result<Flow> {
        let target_run = self.run_tests(&onto).await?;
        let origin = classify(&target_run);
        tracing::info!(rig = %self.rig, branch = %candidate.branch_name, %origin, "classified test failure");
        self.record(
            Event::new(EventKind::FailureClassified, &self.rig)
                .with_candidate(candidate)
                .with("origin", origin.to_string())
                .with("target_head", onto.as_str()),
        )
        .await;

        if origin == FailureOrigin::Branch {
            let outcome = self
                .reject(candidate, RejectionReason::TestsFailed, summarize(&failure.output))
                .await?;
            return Ok(Flow::Done(outcome));
        }

        if let Some(flow) = self.try_main_fix(candidate, lease, &onto, &target_run).await? {
            return Ok(flow);
        }
        if let Some(issue) = progress.tracking_issue.clone() {
            tracing::info!(rig = %self.rig, branch = %candidate.branch_name, %issue, "target still failing; reusing tracking issue");
            return Ok(Flow::Continue(Step::Merge {
                onto,
                head,
                clearance: GateClearance::IssueFiled { issue },
            }));
        }
        let flow = self
            .file_tracking_issue(candidate, onto, head, &target_run)
            .await?;
        if let Flow::Continue(Step::Merge {
            clearance: GateClearance::IssueFiled { issue },
            ..
        }) = &flow
        {
            progress.tracking_issue = Some(issue.clone());
        }
        Ok(flow)
    }

    /// Ask the fixer for a repair of the target, publish it, and re-verify the
    /// candidate on top. `Ok(None)` means fall through to issue filing.
    async fn try_main_fix(
        &self,
        candidate: &Candidate,
        lease: &LockLease,
        onto: &str,
        target_run: &TestRun,
    ) -> Result<Option<Flow>> {
        let Some(fixer) = &self.fixer else {
            return Ok(None);
        };
        let request = FixRequest {
            rig: self.rig.clone(),
            target_branch: self.config.merge_queue.target_branch.clone(),
            target_head: onto.to_string(),
            failure: target_run.clone(),
        };
        let fix_rev = match fixer.attempt_fix(&request).await {
            Ok(Some(rev)) => rev,
            Ok(None) => {
                tracing::debug!(rig = %self.rig, "no fix available for target");
                return Ok(None);
            }
            Err(e) => {
                tracing::warn!(rig = %self.rig, error = %e, "target fix attempt failed");
                return Ok(None);
            }
        };

        self.ensure_lock_held(lease)?;
        let fixed_head = match self.publish(&fix_rev).await {
            Ok(head) => head,
            Err(e) if e.is_candidate_local() || matches!(e, Error::Git { .. }) => {
                tracing::warn!(rig = %self.rig, %fix_rev, error = %e, "could not publish target fix");
                self.reset_target().await?;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let applied = Event::new(EventKind::MainFixApplied, &self.rig)
            .with_candidate(candidate)
            .with("fix_rev", fix_rev.as_str())
            .with("target_head", fixed_head.as_str());
        if let Err(e) = self.events.log(&applied).await {
            let detail = format!("fix {fix_rev} pushed but not recorded: {e}");
            return Ok(Some(Flow::Done(self.block(candidate, detail).await?)));
        }

        let head = self.rebase_candidate(candidate, &fixed_head).await?;
        let run = self.run_tests(&head).await?;
        if !run.passed {
            let outcome = self
                .reject(candidate, RejectionReason::TestsFailed, summarize(&run.output))
                .await?;
            return Ok(Some(Flow::Done(outcome)));
        }
        Ok(Some(Flow::Continue(Step::Merge {
            onto: fixed_head,
            head,
            clearance: GateClearance::MainFixed { fix_rev },
        })))
    }

    async fn file_tracking_issue(
        &self,
        candidate: &Candidate,
        onto: String,
        head: String,
        target_run: &TestRun,
    ) -> Result<Flow> {
        let target = &self.config.merge_queue.target_branch;
        let draft = issue_draft(&self.rig, target, target_run, candidate);
        let issue = match self.issues.file_issue(&draft).await {
            Ok(issue) => issue,
            Err(e) => {
                let detail = format!("{target} is failing and no tracking issue could be filed: {e}");
                return Ok(Flow::Done(self.block(candidate, detail).await?));
            }
        };

        let filed = Event::new(EventKind::BugFiled, &self.rig)
            .with_candidate(candidate)
            .with("issue", issue.to_string())
            .with("failing_rev", onto.as_str())
            .with_message(draft.title);
        if let Err(e) = self.events.log(&filed).await {
            let detail = format!("issue {issue} filed but not recorded: {e}");
            return Ok(Flow::Done(self.block(candidate, detail).await?));
        }

        tracing::warn!(rig = %self.rig, %issue, "pre-existing failure on target; merging with tracking issue");
        Ok(Flow::Continue(Step::Merge {
            onto,
            head,
            clearance: GateClearance::IssueFiled { issue },
        }))
    }

    async fn merge_stage(
        &self,
        candidate: &Candidate,
        lease: &LockLease,
        head: String,
        clearance: GateClearance,
        progress: &mut Progress,
    ) -> Result<Flow> {
        self.ensure_lock_held(lease)?;
        match self.publish(&head).await {
            Ok(merged_head) => Ok(Flow::Continue(Step::Finalize {
                merged_head,
                clearance,
            })),
            Err(Error::PushRejected { detail, .. }) => {
                self.reset_target().await?;
                if progress.push_retried {
                    tracing::error!(rig = %self.rig, branch = %candidate.branch_name, %detail, "push rejected twice");
                    self.record(
                        Event::new(EventKind::ManualInterventionRequired, &self.rig)
                            .with_candidate(candidate)
                            .with_message(detail.as_str()),
                    )
                    .await;
                    let outcome = self
                        .reject(
                            candidate,
                            RejectionReason::ManualIntervention,
                            format!("push rejected twice: {detail}"),
                        )
                        .await?;
                    return Ok(Flow::Done(outcome));
                }

                progress.push_retried = true;
                tracing::warn!(rig = %self.rig, branch = %candidate.branch_name, %detail, "push rejected; rebasing again");
                self.record(
                    Event::new(EventKind::PushRejected, &self.rig)
                        .with_candidate(candidate)
                        .with_message(detail.as_str()),
                )
                .await;
                Ok(Flow::Continue(Step::Rebase))
            }
            Err(e) => {
                if let Err(reset) = self.reset_target().await {
                    tracing::warn!(rig = %self.rig, error = %reset, "could not reset target after failed merge");
                }
                Err(e)
            }
        }
    }

    async fn finalize(
        &self,
        candidate: &Candidate,
        merged_head: String,
        clearance: GateClearance,
    ) -> Result<CandidateOutcome> {
        self.checkpoints.clear()?;
        self.ledger.record_merge(candidate, &merged_head)?;

        tracing::info!(rig = %self.rig, branch = %candidate.branch_name, %merged_head, %clearance, "merged candidate");
        self.record(
            Event::new(EventKind::BranchPushed, &self.rig)
                .with("target", self.config.merge_queue.target_branch.as_str())
                .with("head", merged_head.as_str()),
        )
        .await;
        self.record(
            Event::new(EventKind::BranchMerged, &self.rig)
                .with_candidate(candidate)
                .with("merged_head", merged_head.as_str())
                .with("clearance", serde_json::to_value(&clearance)?),
        )
        .await;

        Ok(CandidateOutcome::Merged {
            branch: candidate.branch_name.clone(),
            merged_head,
            clearance,
        })
    }

    async fn block(&self, candidate: &Candidate, detail: String) -> Result<CandidateOutcome> {
        self.checkpoints.clear()?;
        tracing::error!(rig = %self.rig, branch = %candidate.branch_name, %detail, "merge gate closed");
        self.record(
            Event::new(EventKind::MergeBlocked, &self.rig)
                .with_candidate(candidate)
                .with_message(detail.as_str()),
        )
        .await;
        Ok(CandidateOutcome::Blocked {
            branch: candidate.branch_name.clone(),
            detail,
        })
    }

    async fn reject_for_error(&self, candidate: &Candidate, error: &Error) -> Result<CandidateOutcome> {
        let reason = match error {
            Error::RebaseConflict { onto, detail, .. } => {
                self.record(
                    Event::new(EventKind::RebaseConflict, &self.rig)
                        .with_candidate(candidate)
                        .with("onto", onto.as_str())
                        .with_message(detail.as_str()),
                )
                .await;
                RejectionReason::RebaseConflict
            }
            Error::Timeout { stage, seconds } => {
                self.record(
                    Event::new(EventKind::StageTimeout, &self.rig)
                        .with_candidate(candidate)
                        .with("stage", stage.as_str())
                        .with("seconds", *seconds),
                )
                .await;
                RejectionReason::Timeout
            }
            Error::TestFailure { .. } => RejectionReason::TestsFailed,
            _ => RejectionReason::ManualIntervention,
        };
        self.reject(candidate, reason, error.to_string()).await
    }

    async fn reject(
        &self,
        candidate: &Candidate,
        reason: RejectionReason,
        detail: String,
    ) -> Result<CandidateOutcome> {
        self.checkpoints.clear()?;
        self.ledger.record_rejection(candidate, reason, detail.as_str())?;

        tracing::warn!(rig = %self.rig, branch = %candidate.branch_name, %reason, "candidate rejected");
        self.record(
            Event::new(EventKind::BranchRejected, &self.rig)
                .with_candidate(candidate)
                .with("reason", reason.to_string())
                .with_message(detail.as_str()),
        )
        .await;

        let rejection = Rejection {
            rig: self.rig.clone(),
            candidate: candidate.clone(),
            reason,
            detail,
        };
        if let Err(e) = self.notifier.notify_rejection(&rejection).await {
            tracing::error!(rig = %self.rig, branch = %candidate.branch_name, error = %e, "could not notify branch owner");
        }

        Ok(CandidateOutcome::Rejected {
            branch: candidate.branch_name.clone(),
            reason,
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // GIT HELPERS
    // ═══════════════════════════════════════════════════════════════════════

    async fn refresh_target(&self) -> Result<String> {
        let limit = self.config.runtime.git_timeout;
        within_git("fetch", limit, self.git.fetch()).await?;
        within_git(
            "rev-parse",
            limit,
            self.git.remote_head(&self.config.merge_queue.target_branch),
        )
        .await
    }

    /// Fast-forward the target to `rev` and push it.
    async fn publish(&self, rev: &str) -> Result<String> {
        let target = &self.config.merge_queue.target_branch;
        let merged = within_git(
            "merge",
            self.config.runtime.git_timeout,
            self.git.fast_forward(target, rev),
        )
        .await?;
        within_git("push", self.config.runtime.push_timeout, self.git.push(target)).await?;
        Ok(merged)
    }

    async fn reset_target(&self) -> Result<()> {
        within_git(
            "reset",
            self.config.runtime.git_timeout,
            self.git.reset_to_remote(&self.config.merge_queue.target_branch),
        )
        .await
    }

    async fn delete_merged_branch(&self, branch: &str) {
        match within_git(
            "delete-branch",
            self.config.runtime.git_timeout,
            self.git.delete_remote_branch(branch),
        )
        .await
        {
            Ok(()) => tracing::debug!(rig = %self.rig, branch, "deleted merged branch"),
            Err(e) => tracing::warn!(rig = %self.rig, branch, error = %e, "could not delete merged branch"),
        }
    }

    /// Log an event; a failed write is reported and otherwise ignored.
    async fn record(&self, event: Event) {
        if let Err(e) = self.events.log(&event).await {
            tracing::error!(rig = %self.rig, kind = %event.kind, error = %e, "event log write failed");
        }
    }
}
