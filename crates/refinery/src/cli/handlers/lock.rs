use std::time::Duration;

use anyhow::Result;
use clap::ArgMatches;

use super::rig_path;
use crate::commands::lock::{self, LockAction, LockOptions};

pub fn handle(matches: &ArgMatches) -> Result<()> {
    let (action, sub_m) = match matches.subcommand() {
        Some(("acquire", sub_m)) => {
            let ttl = sub_m
                .get_one::<Duration>("ttl")
                .copied()
                .ok_or_else(|| anyhow::anyhow!("--ttl is required"))?;
            (LockAction::Acquire { ttl }, sub_m)
        }
        Some(("heartbeat", sub_m)) => (LockAction::Heartbeat, sub_m),
        Some(("release", sub_m)) => (LockAction::Release, sub_m),
        Some(("status", sub_m)) => (LockAction::Status, sub_m),
        Some(("clean", sub_m)) => (LockAction::Clean, sub_m),
        Some(("collisions", sub_m)) => (LockAction::Collisions, sub_m),
        _ => anyhow::bail!("Unknown lock subcommand. Run 'refinery lock --help' for usage."),
    };

    // Not every leaf defines the owner arguments
    let optional = |id: &str| {
        sub_m
            .try_get_one::<String>(id)
            .ok()
            .flatten()
            .cloned()
    };
    let options = LockOptions {
        rig: rig_path(sub_m)?,
        action,
        resource: optional("resource"),
        session: optional("session"),
        pid: sub_m.try_get_one::<u32>("pid").ok().flatten().copied(),
        json: sub_m.get_flag("json"),
    };
    lock::run(&options)
}
