//! Error types for refinery-core

use std::path::PathBuf;

use thiserror::Error;

/// Core error type for lock, checkpoint and merge queue operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Resource is locked by a live owner. Retry on the next poll.
    #[error("lock on '{resource}' is held by {holder}")]
    LockHeld { resource: String, holder: String },

    /// Caller tried to heartbeat or release a lock it does not hold.
    #[error("'{caller}' does not own lock on '{resource}' (holder: {holder})")]
    NotOwner {
        resource: String,
        caller: String,
        holder: String,
    },

    /// Rebasing a candidate onto the target branch produced conflicts.
    #[error("rebase of '{branch}' onto {onto} conflicted: {detail}")]
    RebaseConflict {
        branch: String,
        onto: String,
        detail: String,
    },

    /// The configured test command failed.
    #[error("tests failed at {rev}: {summary}")]
    TestFailure { rev: String, summary: String },

    /// The remote refused the fast-forward push.
    #[error("push to '{target}' rejected: {detail}")]
    PushRejected { target: String, detail: String },

    /// Checkpoint file exists but cannot be decoded.
    #[error("checkpoint at {} is corrupt: {reason}", path.display())]
    CheckpointCorrupt { path: PathBuf, reason: String },

    /// A queue stage exceeded its time budget.
    #[error("{stage} timed out after {seconds}s")]
    Timeout { stage: String, seconds: u64 },

    /// A git command failed for a reason other than conflict or rejection,
    /// such as an unreachable remote or a command that ran out of time.
    #[error("git {command} failed: {detail}")]
    Git { command: String, detail: String },

    /// Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Filesystem errors, with the path that failed.
    #[error("IO error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The OS refused a signal handler.
    #[error("failed to install {signal} handler: {source}")]
    SignalHandler {
        signal: String,
        #[source]
        source: std::io::Error,
    },

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Owner notification sink failed.
    #[error("notification failed: {0}")]
    Notification(String),

    /// Issue tracker refused or failed to file an issue.
    #[error("issue filing failed: {0}")]
    IssueFiling(String),

    /// Engine state machine was asked to make an illegal move.
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
}

impl Error {
    /// Wrap an IO error with the path it occurred on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Errors that belong to one candidate and resolve into a reject or retry.
    ///
    /// [`Error::Git`] is retried instead, since a failed fetch says nothing
    /// about the branch being merged. Disk, lock file, checkpoint and config
    /// errors halt the engine.
    pub const fn is_candidate_local(&self) -> bool {
        matches!(
            self,
            Self::RebaseConflict { .. }
                | Self::TestFailure { .. }
                | Self::PushRejected { .. }
                | Self::Timeout { .. }
        )
    }

    /// Errors where trying again later is the expected response.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LockHeld { .. } | Self::PushRejected { .. } | Self::Git { .. }
        )
    }

    /// Process exit code for the CLI.
    ///
    /// - 1: queue or git failure
    /// - 2: invalid configuration
    /// - 3: lock held by someone else
    /// - 4: lock not owned by the caller
    /// - 5: IO, signal setup or serialization failure
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidConfig(_) => 2,
            Self::LockHeld { .. } => 3,
            Self::NotOwner { .. } => 4,
            Self::Io { .. }
            | Self::SignalHandler { .. }
            | Self::Serialization(_)
            | Self::CheckpointCorrupt { .. } => 5,
            _ => 1,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type alias for refinery-core operations
pub type Result<T> = std::result::Result<T, Error>;
