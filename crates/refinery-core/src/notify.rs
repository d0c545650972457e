//! Outbound collaborators: branch owner notifications and issue filing.
//!
//! Mail delivery and the issue tracker live outside this crate. The default
//! [`JsonlOutbox`] implements both traits by appending records to a file that
//! the rig's mail and beads tooling picks up.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{fs::OpenOptions, io::AsyncWriteExt, sync::Mutex};

use crate::{discovery::Candidate, Error, Result};

/// Why a candidate was sent back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectionReason {
    RebaseConflict,
    TestsFailed,
    Timeout,
    ManualIntervention,
}

impl std::fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RebaseConflict => write!(f, "rebase-conflict"),
            Self::TestsFailed => write!(f, "tests-failed"),
            Self::Timeout => write!(f, "timeout"),
            Self::ManualIntervention => write!(f, "manual-intervention"),
        }
    }
}

/// Message to the owner of a rejected candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub rig: String,
    pub candidate: Candidate,
    pub reason: RejectionReason,
    pub detail: String,
}

/// Tracking issue for a failure that already exists on the target branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueDraft {
    pub rig: String,
    pub title: String,
    pub body: String,
    pub target_branch: String,
    /// Target tip the failure reproduces on.
    pub failing_rev: String,
    /// Candidate whose verification surfaced it.
    pub surfaced_by: String,
}

/// Identifier the tracker assigned to a filed issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueRef(pub String);

impl std::fmt::Display for IssueRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[async_trait]
pub trait OwnerNotifier: Send + Sync {
    async fn notify_rejection(&self, rejection: &Rejection) -> Result<()>;
}

#[async_trait]
pub trait IssueTracker: Send + Sync {
    async fn file_issue(&self, draft: &IssueDraft) -> Result<IssueRef>;
}

/// Record written to the outbox file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum OutboxRecord {
    Rejection {
        at: DateTime<Utc>,
        #[serde(flatten)]
        rejection: Rejection,
    },
    Issue {
        at: DateTime<Utc>,
        id: IssueRef,
        #[serde(flatten)]
        draft: IssueDraft,
    },
}

/// Append-only JSONL outbox for notifications and issues.
#[derive(Debug)]
pub struct JsonlOutbox {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlOutbox {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    async fn append(&self, record: &OutboxRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::io(parent, e))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| Error::io(&self.path, e))?;
        file.write_all(&line)
            .await
            .map_err(|e| Error::io(&self.path, e))?;
        file.flush().await.map_err(|e| Error::io(&self.path, e))
    }

    /// Every record in the outbox, oldest first.
    pub async fn records(&self) -> Result<Vec<OutboxRecord>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::io(&self.path, e)),
        };
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(Error::from))
            .collect()
    }
}

#[async_trait]
impl OwnerNotifier for JsonlOutbox {
    async fn notify_rejection(&self, rejection: &Rejection) -> Result<()> {
        self.append(&OutboxRecord::Rejection {
            at: Utc::now(),
            rejection: rejection.clone(),
        })
        .await
        .map_err(|e| Error::Notification(e.to_string()))
    }
}

#[async_trait]
impl IssueTracker for JsonlOutbox {
    async fn file_issue(&self, draft: &IssueDraft) -> Result<IssueRef> {
        let at = Utc::now();
        let id = IssueRef(format!("{}-mq-{}", draft.rig, at.timestamp_millis()));
        self.append(&OutboxRecord::Issue {
            at,
            id: id.clone(),
            draft: draft.clone(),
        })
        .await
        .map_err(|e| Error::IssueFiling(e.to_string()))?;
        Ok(id)
    }
}
