//! On-disk layout of a rig.
//!
//! ```text
//! <rig>/
//!   settings/config.json            rig settings (merge_queue section)
//!   refinery/rig/                   the refinery's working clone
//!   .runtime/locks/                 resource lock files
//!   .runtime/refinery/              checkpoint, event log, ledger, outbox
//! ```

use std::path::{Path, PathBuf};

use crate::{lock::ResourceKey, Error, Result};

/// Directory holding git-tracked rig settings.
pub const DIR_SETTINGS: &str = "settings";
/// Directory owned by the refinery role.
pub const DIR_REFINERY: &str = "refinery";
/// Working clone inside the refinery directory.
pub const DIR_RIG: &str = "rig";
/// Untracked runtime state.
pub const DIR_RUNTIME: &str = ".runtime";
/// Default integration target.
pub const BRANCH_MAIN: &str = "main";
/// Prefix of branches produced by polecat workers.
pub const BRANCH_POLECAT_PREFIX: &str = "polecat/";
/// Remote every rig clone pushes to.
pub const DEFAULT_REMOTE: &str = "origin";

/// Resolved paths for one rig.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RigLayout {
    root: PathBuf,
    name: String,
}

impl RigLayout {
    /// Build a layout rooted at `root`; the rig name is the final path component.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let name = root
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| !n.trim().is_empty())
            .map(String::from)
            .ok_or_else(|| {
                Error::InvalidConfig(format!(
                    "cannot derive rig name from path {}",
                    root.display()
                ))
            })?;
        Ok(Self { root, name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn settings_file(&self) -> PathBuf {
        self.root.join(DIR_SETTINGS).join("config.json")
    }

    /// The refinery's git clone, where rebases and test runs happen.
    pub fn clone_dir(&self) -> PathBuf {
        self.root.join(DIR_REFINERY).join(DIR_RIG)
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.root.join(DIR_RUNTIME).join("locks")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join(DIR_RUNTIME).join(DIR_REFINERY)
    }

    pub fn checkpoint_file(&self) -> PathBuf {
        self.state_dir().join("checkpoint.json")
    }

    pub fn events_file(&self) -> PathBuf {
        self.state_dir().join("events.jsonl")
    }

    pub fn ledger_file(&self) -> PathBuf {
        self.state_dir().join("ledger.json")
    }

    pub fn outbox_file(&self) -> PathBuf {
        self.state_dir().join("outbox.jsonl")
    }

    /// Key of the lock serializing merges into this rig's target branch.
    pub fn merge_lock_key(&self) -> ResourceKey {
        ResourceKey::rig_merge(&self.name)
    }
}
