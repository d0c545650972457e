//! `refinery lock` - resource locks from the command line
//!
//! Locks taken here belong to the invoking shell (`--pid` to override), so a
//! script can hold a workspace or merge lock across several commands and it
//! becomes reclaimable once that shell exits.

use std::{fmt::Write as _, path::PathBuf, time::Duration};

use anyhow::Result;
use chrono::Utc;
use refinery_core::{
    lock::{local_hostname, Acquisition, Collision, LockRecord, Staleness},
    LockManager, OwnerId, ResourceKey,
};
use serde::Serialize;

use super::{invoking_pid, print_json, rig_layout, session_name};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAction {
    Acquire { ttl: Duration },
    Heartbeat,
    Release,
    Status,
    Clean,
    Collisions,
}

/// Options for the lock command
#[derive(Debug, Clone)]
pub struct LockOptions {
    pub rig: PathBuf,
    pub action: LockAction,
    /// Defaults to the rig merge lock, except for `status` where it filters
    pub resource: Option<String>,
    pub session: Option<String>,
    pub pid: Option<u32>,
    pub json: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct LockStatus {
    #[serde(flatten)]
    pub record: LockRecord,
    pub staleness: Staleness,
}

/// What a lock command did.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum LockReport {
    Acquired {
        record: LockRecord,
        #[serde(skip_serializing_if = "Option::is_none")]
        reclaimed_from: Option<OwnerId>,
    },
    Refreshed {
        record: LockRecord,
    },
    Released {
        resource: ResourceKey,
    },
    Status {
        locks: Vec<LockStatus>,
    },
    Cleaned {
        resources: Vec<ResourceKey>,
    },
    Collisions {
        collisions: Vec<Collision>,
    },
}

pub fn run(options: &LockOptions) -> Result<()> {
    let layout = rig_layout(&options.rig)?;
    let locks = LockManager::new(layout.lock_dir())?;
    let resource = options
        .resource
        .as_deref()
        .map(ResourceKey::new)
        .transpose()?;
    let key = resource.clone().unwrap_or_else(|| layout.merge_lock_key());
    let owner = OwnerId::new(
        options.pid.unwrap_or_else(invoking_pid),
        session_name(options.session.as_deref()),
        local_hostname(),
    );

    let report = match options.action {
        LockAction::Status => status(&locks, resource.as_ref())?,
        action => execute(&locks, &key, &owner, action)?,
    };

    if options.json {
        print_json(&report)?;
    } else {
        print!("{}", render(&report));
    }

    if let LockReport::Collisions { collisions } = &report {
        if !collisions.is_empty() {
            anyhow::bail!("{} lock collision(s) detected", collisions.len());
        }
    }
    Ok(())
}

/// Perform `action` on `key` as `owner`.
pub fn execute(
    locks: &LockManager,
    key: &ResourceKey,
    owner: &OwnerId,
    action: LockAction,
) -> Result<LockReport> {
    Ok(match action {
        LockAction::Acquire { ttl } => match locks.acquire(key, owner, ttl)? {
            Acquisition::Acquired(record) => LockReport::Acquired {
                record,
                reclaimed_from: None,
            },
            Acquisition::Reclaimed {
                record, previous, ..
            } => LockReport::Acquired {
                record,
                reclaimed_from: previous,
            },
            Acquisition::Refreshed(record) => LockReport::Refreshed { record },
        },
        LockAction::Heartbeat => LockReport::Refreshed {
            record: locks.heartbeat(key, owner)?,
        },
        LockAction::Release => {
            locks.release(key, owner)?;
            LockReport::Released {
                resource: key.clone(),
            }
        }
        LockAction::Status => status(locks, Some(key))?,
        LockAction::Clean => LockReport::Cleaned {
            resources: locks.clean_stale_locks()?,
        },
        LockAction::Collisions => LockReport::Collisions {
            collisions: locks.detect_collisions()?,
        },
    })
}

fn status(locks: &LockManager, only: Option<&ResourceKey>) -> Result<LockReport> {
    let statuses = locks
        .list()?
        .into_iter()
        .filter(|record| only.map_or(true, |key| record.resource_key == *key))
        .map(|record| LockStatus {
            staleness: locks.staleness(&record),
            record,
        })
        .collect();
    Ok(LockReport::Status { locks: statuses })
}

pub fn render(report: &LockReport) -> String {
    let mut out = String::new();
    match report {
        LockReport::Acquired {
            record,
            reclaimed_from,
        } => {
            let _ = writeln!(out, "Acquired lock on '{}'", record.resource_key);
            let _ = writeln!(out, "  Holder: {}", record.owner);
            let _ = writeln!(out, "  TTL: {}s", record.ttl_secs);
            if let Some(previous) = reclaimed_from {
                let _ = writeln!(out, "  Reclaimed from: {previous}");
            }
        }
        LockReport::Refreshed { record } => {
            let _ = writeln!(
                out,
                "Refreshed lock on '{}' (heartbeat {})",
                record.resource_key,
                record.heartbeat_at.to_rfc3339()
            );
        }
        LockReport::Released { resource } => {
            let _ = writeln!(out, "Released lock on '{resource}'");
        }
        LockReport::Status { locks } if locks.is_empty() => out.push_str("No active locks\n"),
        LockReport::Status { locks } => {
            let now = Utc::now();
            let _ = writeln!(out, "Active locks ({}):", locks.len());
            for status in locks {
                let age = humantime::format_duration(Duration::from_secs(
                    status.record.heartbeat_age(now).as_secs(),
                ));
                let _ = writeln!(
                    out,
                    "  {} held by {} [{}] (last heartbeat {age} ago)",
                    status.record.resource_key, status.record.owner, status.staleness
                );
            }
        }
        LockReport::Cleaned { resources } if resources.is_empty() => {
            out.push_str("No stale locks\n");
        }
        LockReport::Cleaned { resources } => {
            let _ = writeln!(out, "Removed {} stale lock(s):", resources.len());
            for resource in resources {
                let _ = writeln!(out, "  {resource}");
            }
        }
        LockReport::Collisions { collisions } if collisions.is_empty() => {
            out.push_str("No collisions\n");
        }
        LockReport::Collisions { collisions } => {
            for collision in collisions {
                let recorded = collision
                    .recorded_owner
                    .as_ref()
                    .map_or_else(|| "nobody".to_string(), ToString::to_string);
                let claimants: Vec<String> =
                    collision.claimants.iter().map(ToString::to_string).collect();
                let _ = writeln!(
                    out,
                    "COLLISION {}: recorded {recorded}, claimed by {}",
                    collision.resource_key,
                    claimants.join(", ")
                );
            }
        }
    }
    out
}
