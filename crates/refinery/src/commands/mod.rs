//! Command implementations
//!
//! Each command takes an options struct built by the CLI handlers and prints
//! its result to stdout, as text or as JSON.

pub mod checkpoint;
pub mod config;
pub mod events;
pub mod fleet;
pub mod lock;
pub mod run;

use std::path::Path;

use anyhow::{Context, Result};
use refinery_core::RigLayout;
use serde::Serialize;

/// Environment variable naming the session when `--session` is absent.
pub const ENV_SESSION: &str = "REFINERY_SESSION";

const DEFAULT_SESSION: &str = "refinery";

/// Layout of the rig at `path`, which must exist.
pub fn rig_layout(path: &Path) -> Result<RigLayout> {
    let root = std::fs::canonicalize(path)
        .with_context(|| format!("rig directory {} not found", path.display()))?;
    Ok(RigLayout::new(root)?)
}

/// Session recorded in lock ownership: the flag, then the environment, then a default.
pub fn session_name(explicit: Option<&str>) -> String {
    explicit
        .map(String::from)
        .or_else(|| std::env::var(ENV_SESSION).ok())
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_SESSION.to_string())
}

/// Process that invoked the CLI. Locks taken from the command line belong to it.
pub fn invoking_pid() -> u32 {
    #[cfg(unix)]
    {
        std::os::unix::process::parent_id()
    }
    #[cfg(not(unix))]
    {
        std::process::id()
    }
}

pub(crate) fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
