//! Candidate branches waiting to be merged.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{git::GitOps, layout::BRANCH_POLECAT_PREFIX, Result};

/// A worker branch ready for integration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub branch_name: String,
    /// Target-branch commit the candidate diverged from.
    pub base_sha: String,
    /// Branch tip when discovered.
    pub head_sha: String,
    /// Worker that produced the branch.
    pub owner: String,
    pub discovered_at: DateTime<Utc>,
}

/// Yields candidates that are not yet merged into the target branch.
#[async_trait]
pub trait CandidateSource: Send + Sync {
    async fn list_ready(&self) -> Result<Vec<Candidate>>;
}

/// Worker name from a `polecat/<owner>/<topic>` branch.
pub fn owner_from_branch(branch: &str) -> String {
    branch
        .strip_prefix(BRANCH_POLECAT_PREFIX)
        .and_then(|rest| rest.split('/').find(|s| !s.is_empty()))
        .unwrap_or("unknown")
        .to_string()
}

/// Scans remote `polecat/` branches.
///
/// A branch is ready when its tip is not already contained in the target.
/// Discovery time is the tip's commit time, so queue order follows when the
/// worker last pushed.
pub struct GitBranchSource {
    git: Arc<dyn GitOps>,
    target_branch: String,
    prefix: String,
}

impl GitBranchSource {
    pub fn new(git: Arc<dyn GitOps>, target_branch: impl Into<String>) -> Self {
        Self {
            git,
            target_branch: target_branch.into(),
            prefix: BRANCH_POLECAT_PREFIX.to_string(),
        }
    }

    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }
}

#[async_trait]
impl CandidateSource for GitBranchSource {
    async fn list_ready(&self) -> Result<Vec<Candidate>> {
        let target_head = self.git.remote_head(&self.target_branch).await?;
        let branches = self.git.list_remote_branches(&self.prefix).await?;

        let mut ready = Vec::new();
        for branch in branches {
            if self.git.is_ancestor(&branch.head, &target_head).await? {
                continue;
            }
            let base_sha = self.git.merge_base(&branch.head, &target_head).await?;
            ready.push(Candidate {
                owner: owner_from_branch(&branch.name),
                branch_name: branch.name,
                base_sha,
                head_sha: branch.head,
                discovered_at: branch.committed_at,
            });
        }

        tracing::debug!(count = ready.len(), prefix = %self.prefix, "discovered candidates");
        Ok(ready)
    }
}
