//! Merge gate: what has to be true before a candidate may be merged.
//!
//! Green tests clear the gate. A red candidate is checked against the target
//! tip: if the target is green too, the branch caused the failure and gets
//! rejected. If the target is already red, the failure is pre-existing and the
//! candidate may only merge after the target has been fixed or a tracking
//! issue has been filed. When neither happens the gate stays closed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    discovery::Candidate,
    git::{summarize, TestRun},
    notify::{IssueDraft, IssueRef},
    Result,
};

/// Proof that a candidate may be merged. The merge step requires one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum GateClearance {
    /// Candidate tests passed, possibly after flaky retries.
    TestsPassed { attempts: u32 },
    /// Verification is disabled for the rig.
    TestsSkipped,
    /// The target was red, a fix was pushed, and the candidate passed on top.
    MainFixed { fix_rev: String },
    /// The target was red and a tracking issue records it.
    IssueFiled { issue: IssueRef },
}

impl std::fmt::Display for GateClearance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TestsPassed { attempts } => write!(f, "tests-passed ({attempts} runs)"),
            Self::TestsSkipped => write!(f, "tests-skipped"),
            Self::MainFixed { fix_rev } => write!(f, "main-fixed ({fix_rev})"),
            Self::IssueFiled { issue } => write!(f, "issue-filed ({issue})"),
        }
    }
}

/// Who a red test run is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureOrigin {
    /// Target passes on its own.
    Branch,
    /// Target fails without the candidate.
    PreExisting,
}

impl std::fmt::Display for FailureOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Branch => write!(f, "branch"),
            Self::PreExisting => write!(f, "pre-existing"),
        }
    }
}

/// Attribute a candidate failure given a test run of the bare target tip.
pub const fn classify(target_run: &TestRun) -> FailureOrigin {
    if target_run.passed {
        FailureOrigin::Branch
    } else {
        FailureOrigin::PreExisting
    }
}

/// Context handed to a [`MainFixer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixRequest {
    pub rig: String,
    pub target_branch: String,
    /// Red target tip.
    pub target_head: String,
    pub failure: TestRun,
}

/// Produces a commit that repairs a red target branch.
///
/// The returned revision must descend from `target_head`; the engine
/// fast-forwards and pushes it under the merge lock.
#[async_trait]
pub trait MainFixer: Send + Sync {
    /// `Ok(None)` means no fix is available.
    async fn attempt_fix(&self, request: &FixRequest) -> Result<Option<String>>;
}

/// Tracking issue for a failure found on the target tip.
pub fn issue_draft(
    rig: &str,
    target_branch: &str,
    target_run: &TestRun,
    candidate: &Candidate,
) -> IssueDraft {
    let short: String = target_run.rev.chars().take(12).collect();
    IssueDraft {
        rig: rig.to_string(),
        title: format!("{target_branch} is failing tests at {short}"),
        body: format!(
            "Verification of {branch} found {target_branch} already failing.\n\n```\n{output}\n```",
            branch = candidate.branch_name,
            output = summarize(&target_run.output),
        ),
        target_branch: target_branch.to_string(),
        failing_rev: target_run.rev.clone(),
        surfaced_by: candidate.branch_name.clone(),
    }
}
