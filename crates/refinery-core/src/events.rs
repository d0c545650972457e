//! Append-only audit log of lock and queue transitions.
//!
//! One JSON object per line. Writers within a process are serialized by a
//! single async mutex; only the rig's refinery writes its log, so no
//! cross-process locking is needed.

use std::{path::PathBuf, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::{
    fs::{self, File, OpenOptions},
    io::AsyncWriteExt,
    sync::Mutex,
};

use crate::{discovery::Candidate, Error, Result};

/// Event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    EngineStarted,
    EngineStopped,
    LockAcquired,
    LockReleased,
    LockStaleReclaimed,
    LockHeartbeatLost,
    CandidateDiscovered,
    BranchRebased,
    RebaseConflict,
    TestsPassed,
    TestsFailed,
    TestsFlakyPassed,
    FailureClassified,
    MainFixApplied,
    BugFiled,
    MergeBlocked,
    BranchMerged,
    BranchPushed,
    PushRejected,
    BranchRejected,
    ManualInterventionRequired,
    StageTimeout,
    CheckpointResumed,
    CheckpointDiscarded,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_string(self).map_err(|_| std::fmt::Error)?;
        write!(f, "{}", s.trim_matches('"'))
    }
}

impl FromStr for EventKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        serde_json::from_value(Value::String(s.trim().to_string()))
            .map_err(|_| Error::InvalidConfig(format!("unknown event kind '{s}'")))
    }
}

/// An event in the log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub rig: String,
    /// Human-readable message
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// Free-form structured fields
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub payload: Map<String, Value>,
}

impl Event {
    #[must_use]
    pub fn new(kind: EventKind, rig: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            rig: rig.into(),
            message: String::new(),
            payload: Map::new(),
        }
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Add one payload field
    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }

    /// Add the identifying fields of a candidate
    #[must_use]
    pub fn with_candidate(self, candidate: &Candidate) -> Self {
        self.with("branch", candidate.branch_name.as_str())
            .with("owner", candidate.owner.as_str())
            .with("head_sha", candidate.head_sha.as_str())
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }
}

/// Mutex-serialized JSONL sink.
#[derive(Debug)]
pub struct EventLog {
    path: PathBuf,
    writer: Mutex<Option<File>>,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Append one event. The file and its directory are created on first use.
    ///
    /// # Errors
    ///
    /// Propagates serialization and write failures; the caller decides whether
    /// a lost audit record is fatal.
    pub async fn log(&self, event: &Event) -> Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        if writer.is_none() {
            *writer = Some(self.open().await?);
        }
        if let Some(file) = writer.as_mut() {
            file.write_all(&line)
                .await
                .map_err(|e| Error::io(&self.path, e))?;
            file.flush().await.map_err(|e| Error::io(&self.path, e))?;
        }
        drop(writer);
        Ok(())
    }

    async fn open(&self) -> Result<File> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::io(parent, e))?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| Error::io(&self.path, e))
    }

    /// Every decodable event in append order. Torn or foreign lines are skipped.
    pub async fn read_all(&self) -> Result<Vec<Event>> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::io(&self.path, e)),
        };

        Ok(content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .filter_map(|(n, line)| match serde_json::from_str::<Event>(line) {
                Ok(event) => Some(event),
                Err(e) => {
                    tracing::warn!(line = n + 1, error = %e, "skipping undecodable event");
                    None
                }
            })
            .collect())
    }

    /// The last `limit` events, optionally restricted to one kind.
    pub async fn tail(&self, limit: usize, kind: Option<EventKind>) -> Result<Vec<Event>> {
        let mut events: Vec<Event> = self
            .read_all()
            .await?
            .into_iter()
            .filter(|e| kind.map_or(true, |k| e.kind == k))
            .collect();
        let skip = events.len().saturating_sub(limit);
        Ok(events.split_off(skip))
    }
}
