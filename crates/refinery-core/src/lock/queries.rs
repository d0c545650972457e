//! Query operations for the lock system.
//!
//! Pure functions for process liveness, staleness assessment and validation.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::types::{
    local_hostname, ClaimRecord, LivenessProbe, Liveness, LockRecord, OwnerId, Staleness,
};
use crate::{Error, Result};

/// Probe backed by the local process table.
///
/// Only owners recorded on this host can be judged; others are [`Liveness::Unknown`]
/// and fall back to heartbeat expiry.
#[derive(Debug, Clone)]
pub struct ProcessProbe {
    hostname: String,
}

impl ProcessProbe {
    pub fn local() -> Self {
        Self {
            hostname: local_hostname(),
        }
    }
}

impl LivenessProbe for ProcessProbe {
    fn probe(&self, owner: &OwnerId) -> Liveness {
        if owner.hostname != self.hostname {
            return Liveness::Unknown;
        }
        if owner.pid == 0 {
            return Liveness::Dead;
        }
        process_liveness(owner.pid)
    }
}

/// Check if a process is still alive.
#[cfg(target_os = "linux")]
fn process_liveness(pid: u32) -> Liveness {
    if std::path::Path::new(&format!("/proc/{pid}")).exists() {
        Liveness::Alive
    } else {
        Liveness::Dead
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
fn process_liveness(pid: u32) -> Liveness {
    // No procfs; signal 0 checks existence without delivering anything
    match std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
    {
        Ok(status) if status.success() => Liveness::Alive,
        Ok(_) => Liveness::Dead,
        Err(_) => Liveness::Unknown,
    }
}

#[cfg(not(unix))]
const fn process_liveness(_pid: u32) -> Liveness {
    Liveness::Unknown
}

/// Decide whether a lock may be taken from its recorded owner.
///
/// A provably dead owner is reclaimable at once; otherwise the heartbeat must
/// be older than the ttl the holder declared.
pub(super) fn assess(
    record: &LockRecord,
    now: DateTime<Utc>,
    probe: &dyn LivenessProbe,
) -> Staleness {
    if probe.probe(&record.owner) == Liveness::Dead {
        Staleness::DeadOwner
    } else if record.is_expired(now) {
        Staleness::HeartbeatExpired
    } else {
        Staleness::Live
    }
}

/// A claim counts as live evidence while its owner may still be running and
/// it has been refreshed within its ttl.
pub(super) fn claim_is_live(
    claim: &ClaimRecord,
    now: DateTime<Utc>,
    probe: &dyn LivenessProbe,
) -> bool {
    if probe.probe(&claim.owner) == Liveness::Dead {
        return false;
    }
    let age = (now - claim.refreshed_at).to_std().unwrap_or(Duration::ZERO);
    age <= Duration::from_secs(claim.ttl_secs)
}

/// Validate ttl is at least one second (records store whole seconds).
pub(super) fn validate_ttl(ttl: Duration) -> Result<()> {
    if ttl < Duration::from_secs(1) {
        Err(Error::InvalidConfig(format!(
            "lock ttl must be >= 1s, got {ttl:?}"
        )))
    } else {
        Ok(())
    }
}
