//! Durable snapshot of in-flight merge queue work.
//!
//! Written before every stage that mutates the repository and cleared once a
//! candidate is done, so a restarted refinery can decide whether to resume or
//! start over. Writes go through temp-file-and-rename; a reader never sees a
//! half-written checkpoint.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    discovery::Candidate, engine::GateClearance, fsutil, lock::OwnerId, Error, Result,
};

/// Where the queue was when the checkpoint was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Idle,
    Rebasing,
    Testing,
    ResolvingFailure,
    Merging,
    Done,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Rebasing => write!(f, "rebasing"),
            Self::Testing => write!(f, "testing"),
            Self::ResolvingFailure => write!(f, "resolving-failure"),
            Self::Merging => write!(f, "merging"),
            Self::Done => write!(f, "done"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub rig: String,
    /// Engine identity that wrote this checkpoint.
    pub owner: OwnerId,
    /// Candidate being processed, if any.
    pub queue_position: Option<Candidate>,
    pub stage: Stage,
    /// Target branch tip when the stage began.
    pub captured_head: Option<String>,
    /// Rebased candidate tip, once rebasing has finished.
    #[serde(default)]
    pub candidate_head: Option<String>,
    /// How the merge gate was cleared, once it has been.
    #[serde(default)]
    pub clearance: Option<GateClearance>,
    /// Test runs used so far for this candidate.
    #[serde(default)]
    pub attempt: u32,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(
        rig: impl Into<String>,
        owner: OwnerId,
        candidate: Candidate,
        stage: Stage,
        captured_head: impl Into<String>,
    ) -> Self {
        Self {
            captured_head: Some(captured_head.into()),
            ..Self::pending(rig, owner, candidate, stage)
        }
    }

    /// Checkpoint for a stage that has not read the target tip yet.
    pub fn pending(
        rig: impl Into<String>,
        owner: OwnerId,
        candidate: Candidate,
        stage: Stage,
    ) -> Self {
        Self {
            rig: rig.into(),
            owner,
            queue_position: Some(candidate),
            stage,
            captured_head: None,
            candidate_head: None,
            clearance: None,
            attempt: 0,
            updated_at: Utc::now(),
        }
    }

    /// Copy at a new stage with a fresh timestamp.
    #[must_use]
    pub fn at(&self, stage: Stage, captured_head: impl Into<String>) -> Self {
        Self {
            stage,
            captured_head: Some(captured_head.into()),
            updated_at: Utc::now(),
            ..self.clone()
        }
    }

    #[must_use]
    pub fn with_candidate_head(mut self, head: impl Into<String>) -> Self {
        self.candidate_head = Some(head.into());
        self
    }

    #[must_use]
    pub fn with_clearance(mut self, clearance: GateClearance) -> Self {
        self.clearance = Some(clearance);
        self
    }

    #[must_use]
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    /// Whether the checkpoint describes work in progress.
    pub const fn is_active(&self) -> bool {
        !matches!(self.stage, Stage::Idle | Stage::Done)
    }
}

/// True if `updated_at` is older than `threshold`.
pub fn is_stale(checkpoint: &Checkpoint, threshold: Duration) -> bool {
    is_stale_at(checkpoint, threshold, Utc::now())
}

pub(crate) fn is_stale_at(checkpoint: &Checkpoint, threshold: Duration, now: DateTime<Utc>) -> bool {
    (now - checkpoint.updated_at)
        .to_std()
        .is_ok_and(|age| age > threshold)
}

/// One checkpoint file per rig.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically replace the stored checkpoint.
    pub fn write(&self, checkpoint: &Checkpoint) -> Result<()> {
        let data = serde_json::to_vec_pretty(checkpoint)?;
        fsutil::write_atomic(&self.path, &data)?;
        tracing::trace!(stage = %checkpoint.stage, "checkpoint written");
        Ok(())
    }

    /// Stored checkpoint, with corruption reported as [`Error::CheckpointCorrupt`].
    pub fn read_strict(&self) -> Result<Option<Checkpoint>> {
        let Some(content) = fsutil::read_optional(&self.path)? else {
            return Ok(None);
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| Error::CheckpointCorrupt {
                path: self.path.clone(),
                reason: e.to_string(),
            })
    }

    /// Stored checkpoint. A corrupt file is logged and treated as absent.
    pub fn read(&self) -> Result<Option<Checkpoint>> {
        match self.read_strict() {
            Err(err @ Error::CheckpointCorrupt { .. }) => {
                tracing::warn!(error = %err, "ignoring corrupt checkpoint");
                Ok(None)
            }
            other => other,
        }
    }

    /// Remove the checkpoint. Missing is fine.
    pub fn clear(&self) -> Result<()> {
        fsutil::remove_if_exists(&self.path).map(|_| ())
    }
}
