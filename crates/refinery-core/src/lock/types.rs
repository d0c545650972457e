//! Type definitions for the resource lock system.
//!
//! Provides resource keys, owner identity, the on-disk lock record and the
//! outcome types returned by the manager.

use std::{fmt, path::PathBuf, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Reserved keywords that cannot be used as resource names
const RESERVED_KEYWORDS: &[&str] = &["null", "undefined", "true", "false", "none", "nil", "void"];

/// Name of a contended resource, e.g. `rig:gastown:merge` or `workspace:/town/gastown/crew/max`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceKey(String);

impl ResourceKey {
    /// Validate and wrap a raw key.
    pub fn new(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        let trimmed = raw.trim();

        if trimmed.is_empty() {
            return Err(Error::InvalidConfig(
                "Resource key cannot be empty or whitespace-only".to_string(),
            ));
        }

        let lower = trimmed.to_lowercase();
        if RESERVED_KEYWORDS.iter().any(|&keyword| keyword == lower) {
            return Err(Error::InvalidConfig(format!(
                "Resource key '{trimmed}' is a reserved keyword"
            )));
        }

        if !trimmed.chars().any(char::is_alphanumeric) {
            return Err(Error::InvalidConfig(
                "Resource key must contain at least one alphanumeric character".to_string(),
            ));
        }

        Ok(Self(trimmed.to_string()))
    }

    /// The merge lock of a rig.
    pub fn rig_merge(rig: &str) -> Self {
        Self(format!("rig:{rig}:merge"))
    }

    /// Exclusive use of a worker workspace directory.
    pub fn workspace(path: &std::path::Path) -> Self {
        Self(format!("workspace:{}", path.display()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Filesystem-safe stem used for the lock, guard and claim paths.
    pub(crate) fn file_stem(&self) -> String {
        hex::encode(self.0.as_bytes())
    }

    /// Inverse of [`Self::file_stem`].
    pub(crate) fn from_file_stem(stem: &str) -> Option<Self> {
        hex::decode(stem)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .map(Self)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a lock holder: a process on a host, running a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerId {
    pub pid: u32,
    pub session: String,
    pub hostname: String,
}

impl OwnerId {
    pub fn new(pid: u32, session: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            pid,
            session: session.into(),
            hostname: hostname.into(),
        }
    }

    /// Identity of the calling process for the given session.
    pub fn current(session: impl Into<String>) -> Self {
        Self::new(std::process::id(), session, local_hostname())
    }

    /// Filesystem-safe name for this owner's claim marker.
    pub(crate) fn claim_stem(&self) -> String {
        hex::encode(self.to_string().as_bytes())
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.hostname, self.pid, self.session)
    }
}

/// Short hostname of this machine, `unknown` if it cannot be determined.
pub fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .map_or_else(
            |_| "unknown".to_string(),
            |h| {
                h.split('.')
                    .next()
                    .map_or_else(|| "unknown".to_string(), String::from)
            },
        )
}

/// Contents of one lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub resource_key: ResourceKey,
    pub owner: OwnerId,
    pub acquired_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
    /// Heartbeat age after which other contenders may reclaim.
    pub ttl_secs: u64,
}

impl LockRecord {
    pub(crate) fn new(
        resource_key: ResourceKey,
        owner: OwnerId,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            resource_key,
            owner,
            acquired_at: now,
            heartbeat_at: now,
            ttl_secs: ttl.as_secs(),
        }
    }

    /// Time since the last heartbeat, zero if the clock went backwards.
    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.heartbeat_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// Heartbeat is older than the declared ttl.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.heartbeat_age(now) > Duration::from_secs(self.ttl_secs)
    }
}

/// Marker an owner writes when it believes it holds a key.
///
/// Claims are independent of the lock record so that two owners who both
/// think they hold the same key leave visible evidence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRecord {
    pub resource_key: ResourceKey,
    pub owner: OwnerId,
    pub refreshed_at: DateTime<Utc>,
    pub ttl_secs: u64,
}

/// Result of a successful [`LockManager::acquire`](super::LockManager::acquire).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquisition {
    /// Lock file created.
    Acquired(LockRecord),
    /// Caller already held the lock; heartbeat refreshed.
    Refreshed(LockRecord),
    /// Previous holder was dead or silent past its ttl and was replaced.
    Reclaimed {
        record: LockRecord,
        /// `None` when the old lock file could not be parsed.
        previous: Option<OwnerId>,
        reason: Staleness,
    },
}

impl Acquisition {
    pub const fn record(&self) -> &LockRecord {
        match self {
            Self::Acquired(record) | Self::Refreshed(record) | Self::Reclaimed { record, .. } => {
                record
            }
        }
    }

    pub const fn was_reclaimed(&self) -> bool {
        matches!(self, Self::Reclaimed { .. })
    }
}

/// Why a lock may be taken from its recorded owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Staleness {
    /// Owner is alive and heartbeating.
    Live,
    /// Owner process is no longer running on its host.
    DeadOwner,
    /// Heartbeat exceeded the ttl (owner hung or unreachable).
    HeartbeatExpired,
    /// Lock file could not be decoded.
    Unreadable,
}

impl Staleness {
    pub const fn is_reclaimable(self) -> bool {
        !matches!(self, Self::Live)
    }
}

impl fmt::Display for Staleness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Live => write!(f, "live"),
            Self::DeadOwner => write!(f, "dead-owner"),
            Self::HeartbeatExpired => write!(f, "heartbeat-expired"),
            Self::Unreadable => write!(f, "unreadable"),
        }
    }
}

/// Evidence that more than one owner believes it holds a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Collision {
    pub resource_key: ResourceKey,
    /// Owner recorded in the lock file, if any.
    pub recorded_owner: Option<OwnerId>,
    /// Owners with a live claim on the key.
    pub claimants: Vec<OwnerId>,
}

/// What a liveness probe can say about an owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Dead,
    /// Cannot be checked from here (another host, unsupported platform).
    Unknown,
}

/// Process liveness check used to decide whether a lock owner is dead.
pub trait LivenessProbe: Send + Sync + fmt::Debug {
    fn probe(&self, owner: &OwnerId) -> Liveness;
}

/// Shared handle to a probe.
pub type SharedProbe = Arc<dyn LivenessProbe>;

/// Lock manager over one directory of lock files.
///
/// # Invariants
///
/// - `lock_dir` exists and is writable
/// - at most one lock file per resource key
#[derive(Debug, Clone)]
pub struct LockManager {
    pub(super) lock_dir: PathBuf,
    pub(super) probe: SharedProbe,
}
