//! Shared fakes for engine integration tests.
//!
//! [`FakeGit`] models history as lists of patch names. A commit's id is its
//! patch list joined with `+`, so rebasing is deterministic and ancestry is a
//! prefix check.

#![allow(dead_code)]

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use refinery_core::{
    engine::{FixRequest, MainFixer},
    git::{GitOps, RebaseStrategy, RemoteBranch, TestRun},
    layout::RigLayout,
    lock::{local_hostname, Liveness, LivenessProbe, LockManager, OwnerId},
    notify::{IssueDraft, IssueRef, IssueTracker, OwnerNotifier, Rejection},
    Error, MergeQueueEngine, RefineryConfig, Result,
};
use tempfile::TempDir;

fn sha(patches: &[String]) -> String {
    patches.join("+")
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[derive(Debug, Clone)]
struct FakeBranch {
    base: Vec<String>,
    own: Vec<String>,
    committed_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Model {
    commits: HashMap<String, Vec<String>>,
    remote_main: Vec<String>,
    local_main: Vec<String>,
    main_history: HashSet<String>,
    branches: BTreeMap<String, FakeBranch>,
    main_green: bool,
    candidate_results: VecDeque<bool>,
    conflicts: HashSet<String>,
    stubborn: HashSet<String>,
    push_rejections: u32,
    external_pushes: u32,
    test_delay: Option<Duration>,
    fetch_results: VecDeque<bool>,
    fetches: u32,
    rebases: Vec<(String, String, RebaseStrategy)>,
    test_runs: Vec<String>,
    deleted: Vec<String>,
}

impl Model {
    fn register(&mut self, patches: Vec<String>) -> String {
        let id = sha(&patches);
        self.commits.insert(id.clone(), patches);
        id
    }

    fn patches(&self, rev: &str) -> Result<Vec<String>> {
        self.commits.get(rev).cloned().ok_or_else(|| Error::Git {
            command: "rev-parse".into(),
            detail: format!("unknown revision {rev}"),
        })
    }

    fn set_remote_main(&mut self, patches: Vec<String>) {
        let id = self.register(patches.clone());
        self.main_history.insert(id);
        self.remote_main = patches;
    }
}

/// In-memory remote plus clone.
#[derive(Debug)]
pub struct FakeGit {
    model: Mutex<Model>,
}

impl FakeGit {
    /// Remote with a single `base` commit on main, which passes its tests.
    pub fn new() -> Arc<Self> {
        let mut model = Model {
            main_green: true,
            ..Model::default()
        };
        model.set_remote_main(vec!["base".to_string()]);
        model.local_main = model.remote_main.clone();
        Arc::new(Self {
            model: Mutex::new(model),
        })
    }

    /// Push a worker branch forked from the current main tip.
    pub fn add_branch(&self, name: &str, age: Duration) -> String {
        let mut model = lock(&self.model);
        let base = model.remote_main.clone();
        let own = vec![format!("{}#1", name.rsplit('/').next().unwrap_or(name))];
        let head = model.register([base.clone(), own.clone()].concat());
        let committed_at = Utc::now() - chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::zero());
        model.branches.insert(
            name.to_string(),
            FakeBranch {
                base,
                own,
                committed_at,
            },
        );
        head
    }

    /// Someone else lands `patch` on main.
    pub fn advance_main(&self, patch: &str) -> String {
        let mut model = lock(&self.model);
        let mut next = model.remote_main.clone();
        next.push(patch.to_string());
        model.set_remote_main(next);
        sha(&model.remote_main)
    }

    /// Create a commit on top of `parent` without publishing it.
    pub fn commit_on(&self, parent: &str, patch: &str) -> Result<String> {
        let mut model = lock(&self.model);
        let mut patches = model.patches(parent)?;
        patches.push(patch.to_string());
        Ok(model.register(patches))
    }

    pub fn set_main_green(&self, green: bool) {
        lock(&self.model).main_green = green;
    }

    /// Results for successive candidate test runs. Runs past the script pass.
    pub fn script_tests(&self, results: &[bool]) {
        lock(&self.model).candidate_results = results.iter().copied().collect();
    }

    pub fn conflict_on(&self, branch: &str) {
        lock(&self.model).conflicts.insert(branch.to_string());
    }

    /// Conflicts even when the candidate side is preferred.
    pub fn stubborn_conflict_on(&self, branch: &str) {
        self.conflict_on(branch);
        lock(&self.model).stubborn.insert(branch.to_string());
    }

    /// Reject the next `n` pushes, landing an outside commit each time.
    pub fn reject_pushes(&self, n: u32) {
        lock(&self.model).push_rejections = n;
    }

    /// Results for successive fetches; `false` is an unreachable remote.
    /// Fetches past the script succeed.
    pub fn script_fetches(&self, results: &[bool]) {
        lock(&self.model).fetch_results = results.iter().copied().collect();
    }

    pub fn fetches(&self) -> u32 {
        lock(&self.model).fetches
    }

    pub fn slow_tests(&self, delay: Duration) {
        lock(&self.model).test_delay = Some(delay);
    }

    pub fn main_head(&self) -> String {
        sha(&lock(&self.model).remote_main)
    }

    pub fn main_patches(&self) -> Vec<String> {
        lock(&self.model).remote_main.clone()
    }

    pub fn rebases(&self) -> Vec<(String, String, RebaseStrategy)> {
        lock(&self.model).rebases.clone()
    }

    pub fn test_runs(&self) -> Vec<String> {
        lock(&self.model).test_runs.clone()
    }

    pub fn deleted_branches(&self) -> Vec<String> {
        lock(&self.model).deleted.clone()
    }
}

#[async_trait]
impl GitOps for FakeGit {
    async fn fetch(&self) -> Result<()> {
        let mut model = lock(&self.model);
        model.fetches += 1;
        if model.fetch_results.pop_front().unwrap_or(true) {
            Ok(())
        } else {
            Err(Error::Git {
                command: "fetch".into(),
                detail: "fatal: unable to access 'https://git.example/gastown.git/': Could not resolve host: git.example".into(),
            })
        }
    }

    async fn remote_head(&self, branch: &str) -> Result<String> {
        let model = lock(&self.model);
        if branch == "main" {
            return Ok(sha(&model.remote_main));
        }
        model
            .branches
            .get(branch)
            .map(|b| sha(&[b.base.clone(), b.own.clone()].concat()))
            .ok_or_else(|| Error::Git {
                command: "rev-parse".into(),
                detail: format!("no remote branch {branch}"),
            })
    }

    async fn list_remote_branches(&self, prefix: &str) -> Result<Vec<RemoteBranch>> {
        let model = lock(&self.model);
        Ok(model
            .branches
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(name, b)| RemoteBranch {
                name: name.clone(),
                head: sha(&[b.base.clone(), b.own.clone()].concat()),
                committed_at: b.committed_at,
            })
            .collect())
    }

    async fn merge_base(&self, a: &str, b: &str) -> Result<String> {
        let mut model = lock(&self.model);
        let left = model.patches(a)?;
        let right = model.patches(b)?;
        let common: Vec<String> = left
            .iter()
            .zip(right.iter())
            .take_while(|(l, r)| l == r)
            .map(|(l, _)| l.clone())
            .collect();
        Ok(model.register(common))
    }

    async fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool> {
        let model = lock(&self.model);
        let a = model.patches(ancestor)?;
        let d = model.patches(descendant)?;
        Ok(d.starts_with(&a))
    }

    async fn rebase(&self, branch: &str, onto: &str, strategy: RebaseStrategy) -> Result<String> {
        let mut model = lock(&self.model);
        model
            .rebases
            .push((branch.to_string(), onto.to_string(), strategy));
        let conflicts = match strategy {
            RebaseStrategy::Standard => model.conflicts.contains(branch),
            RebaseStrategy::PreferCandidate => model.stubborn.contains(branch),
        };
        if conflicts {
            return Err(Error::RebaseConflict {
                branch: branch.to_string(),
                onto: onto.to_string(),
                detail: "README.md".into(),
            });
        }
        let own = model
            .branches
            .get(branch)
            .map(|b| b.own.clone())
            .ok_or_else(|| Error::Git {
                command: "checkout".into(),
                detail: format!("no remote branch {branch}"),
            })?;
        let target = model.patches(onto)?;
        Ok(model.register([target, own].concat()))
    }

    async fn run_tests(&self, rev: &str, _command: &str) -> Result<TestRun> {
        let delay = lock(&self.model).test_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut model = lock(&self.model);
        model.test_runs.push(rev.to_string());
        let passed = if model.main_history.contains(rev) {
            model.main_green
        } else {
            model.candidate_results.pop_front().unwrap_or(true)
        };
        Ok(TestRun {
            rev: rev.to_string(),
            passed,
            output: if passed { "ok".into() } else { "--- FAIL: TestThing".into() },
        })
    }

    async fn fast_forward(&self, _target: &str, rev: &str) -> Result<String> {
        let mut model = lock(&self.model);
        let next = model.patches(rev)?;
        if !next.starts_with(&model.remote_main) {
            return Err(Error::Git {
                command: "merge".into(),
                detail: "Not possible to fast-forward, aborting.".into(),
            });
        }
        model.local_main = next;
        Ok(sha(&model.local_main))
    }

    async fn push(&self, target: &str) -> Result<()> {
        let mut model = lock(&self.model);
        if model.push_rejections > 0 {
            model.push_rejections -= 1;
            model.external_pushes += 1;
            let mut moved = model.remote_main.clone();
            moved.push(format!("x{}", model.external_pushes));
            model.set_remote_main(moved);
            return Err(Error::PushRejected {
                target: target.to_string(),
                detail: "! [rejected] main -> main (fetch first)".into(),
            });
        }
        if !model.local_main.starts_with(&model.remote_main) {
            return Err(Error::PushRejected {
                target: target.to_string(),
                detail: "non-fast-forward".into(),
            });
        }
        let local = model.local_main.clone();
        model.set_remote_main(local);
        Ok(())
    }

    async fn reset_to_remote(&self, _target: &str) -> Result<()> {
        let mut model = lock(&self.model);
        model.local_main = model.remote_main.clone();
        Ok(())
    }

    async fn delete_remote_branch(&self, branch: &str) -> Result<()> {
        let mut model = lock(&self.model);
        model.branches.remove(branch);
        model.deleted.push(branch.to_string());
        Ok(())
    }
}

/// Notifier that keeps every rejection.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    rejections: Mutex<Vec<Rejection>>,
}

impl RecordingNotifier {
    pub fn rejections(&self) -> Vec<Rejection> {
        lock(&self.rejections).clone()
    }
}

#[async_trait]
impl OwnerNotifier for RecordingNotifier {
    async fn notify_rejection(&self, rejection: &Rejection) -> Result<()> {
        lock(&self.rejections).push(rejection.clone());
        Ok(())
    }
}

/// Tracker that keeps drafts, or refuses everything when `broken`.
#[derive(Debug, Default)]
pub struct RecordingTracker {
    broken: bool,
    drafts: Mutex<Vec<IssueDraft>>,
}

impl RecordingTracker {
    pub fn broken() -> Self {
        Self {
            broken: true,
            drafts: Mutex::new(Vec::new()),
        }
    }

    pub fn drafts(&self) -> Vec<IssueDraft> {
        lock(&self.drafts).clone()
    }
}

#[async_trait]
impl IssueTracker for RecordingTracker {
    async fn file_issue(&self, draft: &IssueDraft) -> Result<IssueRef> {
        if self.broken {
            return Err(Error::IssueFiling("tracker unavailable".into()));
        }
        let mut drafts = lock(&self.drafts);
        drafts.push(draft.clone());
        Ok(IssueRef(format!("gt-{}", drafts.len())))
    }
}

/// Fixer that lands one `fix` patch on top of the red target.
#[derive(Debug)]
pub struct PatchFixer {
    git: Arc<FakeGit>,
}

impl PatchFixer {
    pub fn new(git: Arc<FakeGit>) -> Self {
        Self { git }
    }
}

#[async_trait]
impl MainFixer for PatchFixer {
    async fn attempt_fix(&self, request: &FixRequest) -> Result<Option<String>> {
        let fix = self.git.commit_on(&request.target_head, "fix")?;
        // The fixed tip is green from here on
        self.git.set_main_green(true);
        Ok(Some(fix))
    }
}

/// Probe that reports owners of listed sessions dead, all others alive.
#[derive(Debug, Default)]
pub struct SessionProbe {
    dead: HashSet<String>,
}

impl SessionProbe {
    pub fn dead(sessions: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            dead: sessions.iter().map(|s| (*s).to_string()).collect(),
        })
    }
}

impl LivenessProbe for SessionProbe {
    fn probe(&self, owner: &OwnerId) -> Liveness {
        if self.dead.contains(&owner.session) {
            Liveness::Dead
        } else {
            Liveness::Alive
        }
    }
}

/// Everything a scenario needs, rooted in a temp dir.
pub struct Harness {
    pub dir: TempDir,
    pub layout: RigLayout,
    pub git: Arc<FakeGit>,
    pub notifier: Arc<RecordingNotifier>,
    pub tracker: Arc<RecordingTracker>,
    pub owner: OwnerId,
}

impl Harness {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().map_err(|e| Error::io("tempdir", e))?;
        let layout = RigLayout::new(dir.path().join("gastown"))?;
        Ok(Self {
            dir,
            layout,
            git: FakeGit::new(),
            notifier: Arc::new(RecordingNotifier::default()),
            tracker: Arc::new(RecordingTracker::default()),
            owner: OwnerId::new(std::process::id(), "refinery-test", local_hostname()),
        })
    }

    /// Lock manager over the rig's lock dir that treats `dead` sessions as gone.
    pub fn locks(&self, dead: &[&str]) -> Result<LockManager> {
        Ok(LockManager::new(self.layout.lock_dir())?.with_probe(SessionProbe::dead(dead)))
    }

    pub fn engine(&self, config: RefineryConfig) -> Result<MergeQueueEngine> {
        Ok(MergeQueueEngine::new(&self.layout, config, self.owner.clone(), self.git.clone())?
            .with_notifier(self.notifier.clone())
            .with_issue_tracker(self.tracker.clone())
            .with_lock_manager(self.locks(&[])?))
    }
}
