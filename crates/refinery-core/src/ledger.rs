//! Persistent record of settled candidate heads.
//!
//! A rejected branch stays visible to discovery until it is deleted, and so
//! does a merged one when `delete_merged_branches` is off. The ledger keeps
//! the queue from reprocessing the same head forever; once the owner pushes new
//! work the head changes and the branch is eligible again.

use std::{collections::BTreeMap, path::PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{discovery::Candidate, fsutil, notify::RejectionReason, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "kebab-case")]
pub enum Settlement {
    Merged,
    Rejected(RejectionReason),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub head_sha: String,
    pub settlement: Settlement,
    pub detail: String,
    pub settled_at: DateTime<Utc>,
}

/// Settled heads keyed by branch name.
#[derive(Debug, Clone)]
pub struct QueueLedger {
    path: PathBuf,
}

impl QueueLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn load(&self) -> Result<BTreeMap<String, LedgerEntry>> {
        let Some(content) = fsutil::read_optional(&self.path)? else {
            return Ok(BTreeMap::new());
        };
        match serde_json::from_str(&content) {
            Ok(entries) => Ok(entries),
            Err(e) => {
                // Losing the ledger only means settled heads get retried
                tracing::warn!(path = %self.path.display(), error = %e, "resetting unreadable queue ledger");
                Ok(BTreeMap::new())
            }
        }
    }

    fn store(&self, entries: &BTreeMap<String, LedgerEntry>) -> Result<()> {
        fsutil::write_atomic(&self.path, &serde_json::to_vec_pretty(entries)?)
    }

    fn settle(
        &self,
        candidate: &Candidate,
        settlement: Settlement,
        detail: String,
    ) -> Result<()> {
        let mut entries = self.load()?;
        entries.insert(
            candidate.branch_name.clone(),
            LedgerEntry {
                head_sha: candidate.head_sha.clone(),
                settlement,
                detail,
                settled_at: Utc::now(),
            },
        );
        self.store(&entries)
    }

    pub fn record_rejection(
        &self,
        candidate: &Candidate,
        reason: RejectionReason,
        detail: impl Into<String>,
    ) -> Result<()> {
        self.settle(candidate, Settlement::Rejected(reason), detail.into())
    }

    pub fn record_merge(&self, candidate: &Candidate, merged_head: &str) -> Result<()> {
        self.settle(candidate, Settlement::Merged, format!("merged as {merged_head}"))
    }

    /// Whether this exact head of the branch was already merged or rejected.
    pub fn is_settled(&self, candidate: &Candidate) -> Result<bool> {
        Ok(self
            .load()?
            .get(&candidate.branch_name)
            .is_some_and(|e| e.head_sha == candidate.head_sha))
    }

    /// Drop entries for branches that are no longer discovered.
    pub fn retain_branches(&self, live: &[Candidate]) -> Result<()> {
        let entries = self.load()?;
        let before = entries.len();
        let kept: BTreeMap<_, _> = entries
            .into_iter()
            .filter(|(branch, _)| live.iter().any(|c| &c.branch_name == branch))
            .collect();
        if kept.len() == before {
            return Ok(());
        }
        self.store(&kept)
    }
}
