//! Per-candidate outcomes and run summaries.

use serde::Serialize;

use crate::notify::RejectionReason;

use super::gate::GateClearance;

/// How processing one candidate ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "kebab-case")]
pub enum CandidateOutcome {
    /// Pushed to the target branch.
    Merged {
        branch: String,
        merged_head: String,
        clearance: GateClearance,
    },
    /// Handed back to its owner.
    Rejected {
        branch: String,
        reason: RejectionReason,
    },
    /// Gate stayed closed; candidate stays queued.
    Blocked { branch: String, detail: String },
    /// Shutdown arrived between stages; a checkpoint records where.
    Interrupted { branch: String },
}

impl CandidateOutcome {
    pub fn branch(&self) -> &str {
        match self {
            Self::Merged { branch, .. }
            | Self::Rejected { branch, .. }
            | Self::Blocked { branch, .. }
            | Self::Interrupted { branch } => branch,
        }
    }

    /// Whether the merge lock should be released after this outcome.
    ///
    /// An interrupted candidate keeps the lock so the same owner can resume.
    pub const fn releases_lock(&self) -> bool {
        !matches!(self, Self::Interrupted { .. })
    }
}

/// Summary of one `run` or `run_once` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub rig: String,
    pub merged: usize,
    pub rejected: usize,
    pub blocked: usize,
    pub interrupted: bool,
    pub outcomes: Vec<CandidateOutcome>,
}

impl RunSummary {
    #[must_use]
    pub fn new(rig: impl Into<String>) -> Self {
        Self {
            rig: rig.into(),
            ..Self::default()
        }
    }

    /// Add one outcome to the tallies.
    #[must_use]
    pub fn add_outcome(self, outcome: CandidateOutcome) -> Self {
        let merged = self.merged + usize::from(matches!(outcome, CandidateOutcome::Merged { .. }));
        let rejected =
            self.rejected + usize::from(matches!(outcome, CandidateOutcome::Rejected { .. }));
        let blocked = self.blocked + usize::from(matches!(outcome, CandidateOutcome::Blocked { .. }));
        let interrupted =
            self.interrupted || matches!(outcome, CandidateOutcome::Interrupted { .. });

        let mut outcomes = self.outcomes;
        outcomes.push(outcome);

        Self {
            rig: self.rig,
            merged,
            rejected,
            blocked,
            interrupted,
            outcomes,
        }
    }

    /// Branches merged, in merge order.
    pub fn merged_branches(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, CandidateOutcome::Merged { .. }))
            .map(CandidateOutcome::branch)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_outcome_tallies() {
        let summary = RunSummary::new("gastown")
            .add_outcome(CandidateOutcome::Merged {
                branch: "polecat/a/x".into(),
                merged_head: "m2".into(),
                clearance: GateClearance::TestsSkipped,
            })
            .add_outcome(CandidateOutcome::Rejected {
                branch: "polecat/b/y".into(),
                reason: RejectionReason::RebaseConflict,
            })
            .add_outcome(CandidateOutcome::Interrupted {
                branch: "polecat/c/z".into(),
            });

        assert_eq!(summary.merged, 1);
        assert_eq!(summary.rejected, 1);
        assert_eq!(summary.blocked, 0);
        assert!(summary.interrupted);
        assert_eq!(summary.merged_branches(), vec!["polecat/a/x"]);
    }

    #[test]
    fn test_only_interrupted_keeps_lock() {
        assert!(!CandidateOutcome::Interrupted { branch: "b".into() }.releases_lock());
        assert!(CandidateOutcome::Blocked {
            branch: "b".into(),
            detail: String::new()
        }
        .releases_lock());
    }
}
