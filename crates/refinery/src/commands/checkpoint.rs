//! `refinery checkpoint` - inspect or clear the queue's resume point

use std::{fmt::Write as _, path::PathBuf};

use anyhow::Result;
use refinery_core::{
    lock::Staleness, Checkpoint, CheckpointStore, Error, LockManager, RigLayout,
};
use serde::Serialize;

use super::{print_json, rig_layout};

#[derive(Debug, Clone)]
pub struct ShowOptions {
    pub rig: PathBuf,
    pub json: bool,
}

#[derive(Debug, Clone)]
pub struct ClearOptions {
    pub rig: PathBuf,
    /// Clear even while a live engine holds the merge lock
    pub force: bool,
}

/// What is on disk, including a checkpoint the engine would ignore.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum CheckpointView {
    Missing,
    Present { checkpoint: Checkpoint },
    Corrupt { path: PathBuf, reason: String },
}

pub fn show(options: &ShowOptions) -> Result<()> {
    let layout = rig_layout(&options.rig)?;
    let view = inspect(&CheckpointStore::new(layout.checkpoint_file()))?;
    if options.json {
        print_json(&view)
    } else {
        print!("{}", render(&view));
        Ok(())
    }
}

pub fn inspect(store: &CheckpointStore) -> Result<CheckpointView> {
    match store.read_strict() {
        Ok(Some(checkpoint)) => Ok(CheckpointView::Present { checkpoint }),
        Ok(None) => Ok(CheckpointView::Missing),
        Err(Error::CheckpointCorrupt { path, reason }) => {
            Ok(CheckpointView::Corrupt { path, reason })
        }
        Err(e) => Err(e.into()),
    }
}

pub fn render(view: &CheckpointView) -> String {
    match view {
        CheckpointView::Missing => "No checkpoint\n".to_string(),
        CheckpointView::Corrupt { path, reason } => format!(
            "Checkpoint at {} is corrupt and will be ignored: {reason}\n",
            path.display()
        ),
        CheckpointView::Present { checkpoint } => {
            let mut out = String::new();
            let _ = writeln!(out, "Rig:      {}", checkpoint.rig);
            let _ = writeln!(out, "Stage:    {}", checkpoint.stage);
            let _ = writeln!(out, "Owner:    {}", checkpoint.owner);
            if let Some(candidate) = &checkpoint.queue_position {
                let _ = writeln!(
                    out,
                    "Branch:   {} ({})",
                    candidate.branch_name, candidate.head_sha
                );
            }
            if let Some(head) = &checkpoint.captured_head {
                let _ = writeln!(out, "Target:   {head}");
            }
            if let Some(head) = &checkpoint.candidate_head {
                let _ = writeln!(out, "Rebased:  {head}");
            }
            if let Some(clearance) = &checkpoint.clearance {
                let _ = writeln!(out, "Gate:     {clearance}");
            }
            if checkpoint.attempt > 0 {
                let _ = writeln!(out, "Attempt:  {}", checkpoint.attempt);
            }
            let _ = writeln!(out, "Updated:  {}", checkpoint.updated_at.to_rfc3339());
            out
        }
    }
}

pub fn clear(options: &ClearOptions) -> Result<()> {
    let layout = rig_layout(&options.rig)?;
    clear_in(&layout, options.force)?;
    println!("Cleared checkpoint for rig '{}'", layout.name());
    Ok(())
}

/// Delete the checkpoint unless a live engine holds the merge lock.
pub fn clear_in(layout: &RigLayout, force: bool) -> Result<()> {
    if !force {
        let locks = LockManager::new(layout.lock_dir())?;
        if let Some(record) = locks.inspect(&layout.merge_lock_key())? {
            if locks.staleness(&record) == Staleness::Live {
                return Err(Error::LockHeld {
                    resource: record.resource_key.to_string(),
                    holder: record.owner.to_string(),
                }
                .into());
            }
        }
    }
    CheckpointStore::new(layout.checkpoint_file()).clear()?;
    Ok(())
}
