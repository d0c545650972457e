//! Lock operations for the resource lock system.
//!
//! File operations, acquisition, heartbeat, release and cleanup. Every
//! read-decide-write sequence on a key runs under a short exclusive flock on
//! that key's guard file, so contenders in other processes cannot interleave.

use std::{
    fs::{self, File, OpenOptions},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use fs2::FileExt;

use super::queries::{assess, claim_is_live, validate_ttl, ProcessProbe};
use super::types::{
    Acquisition, ClaimRecord, Collision, LockManager, LockRecord, OwnerId, ResourceKey,
    SharedProbe, Staleness,
};
use crate::{fsutil, Error, Result};

const LOCK_EXT: &str = "lock";
const GUARD_EXT: &str = "guard";
const CLAIMS_EXT: &str = "claims";

/// Exclusive flock on a key's guard file, released on drop.
struct KeyGuard {
    file: File,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        // Closing the descriptor releases the flock as well
        let _ = FileExt::unlock(&self.file);
    }
}

/// What a lock file currently says.
enum Slot {
    Vacant,
    Held(LockRecord),
    Unreadable(String),
}

impl Slot {
    fn describe_holder(&self) -> String {
        match self {
            Self::Vacant => "nobody".to_string(),
            Self::Held(record) => record.owner.to_string(),
            Self::Unreadable(_) => "unreadable lock file".to_string(),
        }
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec_pretty(value)?)
}

fn read_slot(path: &Path) -> Result<Slot> {
    Ok(match fsutil::read_optional(path)? {
        None => Slot::Vacant,
        Some(content) => match serde_json::from_str::<LockRecord>(&content) {
            Ok(record) => Slot::Held(record),
            Err(e) => Slot::Unreadable(e.to_string()),
        },
    })
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(ext)
}

fn key_from_path(path: &Path) -> Option<ResourceKey> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .and_then(ResourceKey::from_file_stem)
}

impl LockManager {
    /// Create a manager over `lock_dir`, creating the directory if needed.
    ///
    /// Owner liveness is checked against the local process table.
    pub fn new(lock_dir: impl Into<PathBuf>) -> Result<Self> {
        let lock_dir = lock_dir.into();
        fs::create_dir_all(&lock_dir).map_err(|e| Error::io(&lock_dir, e))?;
        Ok(Self {
            lock_dir,
            probe: Arc::new(ProcessProbe::local()),
        })
    }

    /// Replace the liveness probe.
    pub fn with_probe(self, probe: SharedProbe) -> Self {
        Self { probe, ..self }
    }

    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }

    fn lock_path(&self, key: &ResourceKey) -> PathBuf {
        self.lock_dir.join(format!("{}.{LOCK_EXT}", key.file_stem()))
    }

    fn guard_path(&self, key: &ResourceKey) -> PathBuf {
        self.lock_dir.join(format!("{}.{GUARD_EXT}", key.file_stem()))
    }

    fn claims_dir(&self, key: &ResourceKey) -> PathBuf {
        self.lock_dir.join(format!("{}.{CLAIMS_EXT}", key.file_stem()))
    }

    fn claim_path(&self, key: &ResourceKey, owner: &OwnerId) -> PathBuf {
        self.claims_dir(key)
            .join(format!("{}.json", owner.claim_stem()))
    }

    fn guard(&self, key: &ResourceKey) -> Result<KeyGuard> {
        let path = self.guard_path(key);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| Error::io(&path, e))?;
        // Held only for a read and a rename, so blocking here is bounded
        file.lock_exclusive().map_err(|e| Error::io(&path, e))?;
        Ok(KeyGuard { file })
    }

    fn write_claim(&self, claim: &ClaimRecord) -> Result<()> {
        let path = self.claim_path(&claim.resource_key, &claim.owner);
        fsutil::write_atomic(&path, &encode(claim)?)
    }

    fn remove_claim(&self, key: &ResourceKey, owner: &OwnerId) -> Result<()> {
        fsutil::remove_if_exists(&self.claim_path(key, owner)).map(|_| ())
    }

    fn read_claims(&self, key: &ResourceKey) -> Result<Vec<ClaimRecord>> {
        let dir = self.claims_dir(key);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::io(&dir, e)),
        };

        let mut claims = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| Error::io(&dir, e))?.path();
            if fsutil::is_temp_file(&path) || !has_extension(&path, "json") {
                continue;
            }
            let Some(content) = fsutil::read_optional(&path)? else {
                continue;
            };
            match serde_json::from_str::<ClaimRecord>(&content) {
                Ok(claim) => claims.push(claim),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable claim"),
            }
        }
        Ok(claims)
    }

    fn lock_files(&self) -> Result<Vec<PathBuf>> {
        let entries = fs::read_dir(&self.lock_dir).map_err(|e| Error::io(&self.lock_dir, e))?;
        let mut paths = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| Error::io(&self.lock_dir, e))?.path();
            if !fsutil::is_temp_file(&path) && has_extension(&path, LOCK_EXT) {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    fn claim_dirs(&self) -> Result<Vec<ResourceKey>> {
        let entries = fs::read_dir(&self.lock_dir).map_err(|e| Error::io(&self.lock_dir, e))?;
        let mut keys = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| Error::io(&self.lock_dir, e))?.path();
            if path.is_dir() && has_extension(&path, CLAIMS_EXT) {
                if let Some(key) = key_from_path(&path) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// Try once to take `key` for `owner`.
    ///
    /// Never waits on a live holder: contention returns [`Error::LockHeld`] and
    /// the caller decides when to try again.
    pub fn acquire(
        &self,
        key: &ResourceKey,
        owner: &OwnerId,
        ttl: Duration,
    ) -> Result<Acquisition> {
        self.acquire_at(key, owner, ttl, Utc::now())
    }

    pub(crate) fn acquire_at(
        &self,
        key: &ResourceKey,
        owner: &OwnerId,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Acquisition> {
        validate_ttl(ttl)?;
        let _guard = self.guard(key)?;
        let path = self.lock_path(key);
        let fresh = LockRecord::new(key.clone(), owner.clone(), ttl, now);

        let acquisition = match read_slot(&path)? {
            Slot::Vacant => {
                if !fsutil::create_exclusive(&path, &encode(&fresh)?)? {
                    // A writer that ignores the guard beat us to it
                    let holder = read_slot(&path)?.describe_holder();
                    return Err(Error::LockHeld {
                        resource: key.to_string(),
                        holder,
                    });
                }
                Acquisition::Acquired(fresh)
            }
            Slot::Held(existing) if existing.owner == *owner => {
                let refreshed = LockRecord {
                    heartbeat_at: now,
                    ttl_secs: ttl.as_secs(),
                    ..existing
                };
                fsutil::write_atomic(&path, &encode(&refreshed)?)?;
                Acquisition::Refreshed(refreshed)
            }
            Slot::Held(existing) => {
                let staleness = assess(&existing, now, self.probe.as_ref());
                if !staleness.is_reclaimable() {
                    return Err(Error::LockHeld {
                        resource: key.to_string(),
                        holder: existing.owner.to_string(),
                    });
                }
                fsutil::write_atomic(&path, &encode(&fresh)?)?;
                if staleness == Staleness::DeadOwner {
                    self.remove_claim(key, &existing.owner)?;
                }
                tracing::warn!(
                    resource = %key,
                    previous = %existing.owner,
                    reason = %staleness,
                    "reclaimed stale lock"
                );
                Acquisition::Reclaimed {
                    record: fresh,
                    previous: Some(existing.owner),
                    reason: staleness,
                }
            }
            Slot::Unreadable(reason) => {
                tracing::warn!(resource = %key, %reason, "replacing unreadable lock file");
                fsutil::write_atomic(&path, &encode(&fresh)?)?;
                Acquisition::Reclaimed {
                    record: fresh,
                    previous: None,
                    reason: Staleness::Unreadable,
                }
            }
        };

        let record = acquisition.record();
        self.write_claim(&ClaimRecord {
            resource_key: key.clone(),
            owner: owner.clone(),
            refreshed_at: now,
            ttl_secs: record.ttl_secs,
        })?;

        Ok(acquisition)
    }

    /// Refresh the heartbeat of a lock `owner` holds.
    pub fn heartbeat(&self, key: &ResourceKey, owner: &OwnerId) -> Result<LockRecord> {
        self.heartbeat_at(key, owner, Utc::now())
    }

    pub(crate) fn heartbeat_at(
        &self,
        key: &ResourceKey,
        owner: &OwnerId,
        now: DateTime<Utc>,
    ) -> Result<LockRecord> {
        let _guard = self.guard(key)?;
        let path = self.lock_path(key);

        match read_slot(&path)? {
            Slot::Held(record) if record.owner == *owner => {
                let updated = LockRecord {
                    heartbeat_at: now,
                    ..record
                };
                fsutil::write_atomic(&path, &encode(&updated)?)?;
                self.write_claim(&ClaimRecord {
                    resource_key: key.clone(),
                    owner: owner.clone(),
                    refreshed_at: now,
                    ttl_secs: updated.ttl_secs,
                })?;
                Ok(updated)
            }
            other => {
                // The caller just learned it is not the holder; drop its claim
                self.remove_claim(key, owner)?;
                Err(Error::NotOwner {
                    resource: key.to_string(),
                    caller: owner.to_string(),
                    holder: other.describe_holder(),
                })
            }
        }
    }

    /// Delete the lock if `owner` holds it.
    pub fn release(&self, key: &ResourceKey, owner: &OwnerId) -> Result<()> {
        let _guard = self.guard(key)?;
        let path = self.lock_path(key);

        let slot = read_slot(&path)?;
        self.remove_claim(key, owner)?;
        match slot {
            Slot::Held(record) if record.owner == *owner => {
                fsutil::remove_if_exists(&path)?;
                tracing::debug!(resource = %key, owner = %owner, "released lock");
                Ok(())
            }
            other => Err(Error::NotOwner {
                resource: key.to_string(),
                caller: owner.to_string(),
                holder: other.describe_holder(),
            }),
        }
    }

    /// Current lock record for `key`, if one exists and is readable.
    pub fn inspect(&self, key: &ResourceKey) -> Result<Option<LockRecord>> {
        Ok(match read_slot(&self.lock_path(key))? {
            Slot::Held(record) => Some(record),
            Slot::Vacant | Slot::Unreadable(_) => None,
        })
    }

    pub fn is_held_by(&self, key: &ResourceKey, owner: &OwnerId) -> Result<bool> {
        Ok(self
            .inspect(key)?
            .is_some_and(|record| record.owner == *owner))
    }

    /// Staleness of a record as judged right now.
    pub fn staleness(&self, record: &LockRecord) -> Staleness {
        assess(record, Utc::now(), self.probe.as_ref())
    }

    /// All readable lock records, ordered by key.
    pub fn list(&self) -> Result<Vec<LockRecord>> {
        let mut records = Vec::new();
        for path in self.lock_files()? {
            match read_slot(&path)? {
                Slot::Held(record) => records.push(record),
                Slot::Unreadable(reason) => {
                    tracing::warn!(path = %path.display(), %reason, "skipping unreadable lock file");
                }
                Slot::Vacant => {}
            }
        }
        records.sort_by(|a, b| a.resource_key.cmp(&b.resource_key));
        Ok(records)
    }

    /// Remove every lock whose owner is dead or whose heartbeat expired.
    ///
    /// Also prunes claims that no longer count as live evidence. Returns the
    /// keys whose lock was removed.
    pub fn clean_stale_locks(&self) -> Result<Vec<ResourceKey>> {
        self.clean_stale_locks_at(Utc::now())
    }

    pub(crate) fn clean_stale_locks_at(&self, now: DateTime<Utc>) -> Result<Vec<ResourceKey>> {
        let mut reclaimed = Vec::new();

        for path in self.lock_files()? {
            let Some(key) = key_from_path(&path) else {
                tracing::warn!(path = %path.display(), "lock file name is not a resource key");
                continue;
            };
            let _guard = self.guard(&key)?;

            match read_slot(&path)? {
                Slot::Vacant => {}
                Slot::Held(record) => {
                    let staleness = assess(&record, now, self.probe.as_ref());
                    if staleness.is_reclaimable() {
                        fsutil::remove_if_exists(&path)?;
                        if staleness == Staleness::DeadOwner {
                            self.remove_claim(&key, &record.owner)?;
                        }
                        tracing::info!(
                            resource = %key,
                            owner = %record.owner,
                            reason = %staleness,
                            "cleaned stale lock"
                        );
                        reclaimed.push(key);
                    }
                }
                Slot::Unreadable(reason) => {
                    fsutil::remove_if_exists(&path)?;
                    tracing::warn!(resource = %key, %reason, "cleaned unreadable lock file");
                    reclaimed.push(key);
                }
            }
        }

        for key in self.claim_dirs()? {
            let _guard = self.guard(&key)?;
            for claim in self.read_claims(&key)? {
                if !claim_is_live(&claim, now, self.probe.as_ref()) {
                    self.remove_claim(&key, &claim.owner)?;
                }
            }
        }

        Ok(reclaimed)
    }

    /// Report keys where more than one owner believes it holds the lock, or
    /// where a live claimant is not the recorded holder.
    ///
    /// Collisions indicate a coordination bug and are never resolved here.
    pub fn detect_collisions(&self) -> Result<Vec<Collision>> {
        self.detect_collisions_at(Utc::now())
    }

    pub(crate) fn detect_collisions_at(&self, now: DateTime<Utc>) -> Result<Vec<Collision>> {
        let mut collisions = Vec::new();

        for key in self.claim_dirs()? {
            let _guard = self.guard(&key)?;
            let recorded_owner = match read_slot(&self.lock_path(&key))? {
                Slot::Held(record) => Some(record.owner),
                Slot::Vacant | Slot::Unreadable(_) => None,
            };

            let mut claimants: Vec<OwnerId> = self
                .read_claims(&key)?
                .into_iter()
                .filter(|claim| claim_is_live(claim, now, self.probe.as_ref()))
                .map(|claim| claim.owner)
                .collect();
            claimants.sort_by_key(ToString::to_string);

            let foreign = claimants
                .iter()
                .any(|owner| Some(owner) != recorded_owner.as_ref());
            if claimants.len() > 1 || foreign {
                tracing::error!(
                    resource = %key,
                    claimants = claimants.len(),
                    "lock collision detected"
                );
                collisions.push(Collision {
                    resource_key: key,
                    recorded_owner,
                    claimants,
                });
            }
        }

        Ok(collisions)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;

    use super::*;
    use crate::lock::{Liveness, LivenessProbe};

    #[derive(Debug)]
    struct FixedProbe(Liveness);

    impl LivenessProbe for FixedProbe {
        fn probe(&self, _owner: &OwnerId) -> Liveness {
            self.0
        }
    }

    fn manager(liveness: Liveness) -> Result<(TempDir, LockManager)> {
        let dir = tempfile::tempdir().map_err(|e| Error::io("tempdir", e))?;
        let manager =
            LockManager::new(dir.path().join("locks"))?.with_probe(Arc::new(FixedProbe(liveness)));
        Ok((dir, manager))
    }

    fn owner(session: &str) -> OwnerId {
        OwnerId::new(100, session, "host-a")
    }

    const TTL: Duration = Duration::from_secs(60);

    #[test]
    fn test_second_owner_is_refused() -> Result<()> {
        let (_dir, locks) = manager(Liveness::Alive)?;
        let key = ResourceKey::rig_merge("gastown");

        let first = locks.acquire(&key, &owner("a"), TTL)?;
        assert!(matches!(first, Acquisition::Acquired(_)));

        match locks.acquire(&key, &owner("b"), TTL) {
            Err(Error::LockHeld { resource, holder }) => {
                assert_eq!(resource, "rig:gastown:merge");
                assert_eq!(holder, "host-a:100:a");
            }
            other => panic!("expected LockHeld, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn test_same_owner_refreshes() -> Result<()> {
        let (_dir, locks) = manager(Liveness::Alive)?;
        let key = ResourceKey::rig_merge("gastown");
        let t0 = Utc::now();

        locks.acquire_at(&key, &owner("a"), TTL, t0)?;
        let again = locks.acquire_at(&key, &owner("a"), TTL, t0 + ChronoDuration::seconds(5))?;

        match again {
            Acquisition::Refreshed(record) => {
                assert_eq!(record.acquired_at, t0);
                assert_eq!(record.heartbeat_at, t0 + ChronoDuration::seconds(5));
            }
            other => panic!("expected Refreshed, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn test_release_requires_ownership() -> Result<()> {
        let (_dir, locks) = manager(Liveness::Alive)?;
        let key = ResourceKey::new("workspace:/town/gastown/crew/max")?;

        locks.acquire(&key, &owner("a"), TTL)?;
        assert!(matches!(
            locks.release(&key, &owner("b")),
            Err(Error::NotOwner { .. })
        ));
        assert!(locks.is_held_by(&key, &owner("a"))?);

        locks.release(&key, &owner("a"))?;
        assert!(locks.inspect(&key)?.is_none());

        // Releasing again is a coordination bug, not a no-op
        assert!(matches!(
            locks.release(&key, &owner("a")),
            Err(Error::NotOwner { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_heartbeat_updates_timestamp() -> Result<()> {
        let (_dir, locks) = manager(Liveness::Alive)?;
        let key = ResourceKey::rig_merge("gastown");
        let t0 = Utc::now();

        locks.acquire_at(&key, &owner("a"), TTL, t0)?;
        let t1 = t0 + ChronoDuration::seconds(30);
        let record = locks.heartbeat_at(&key, &owner("a"), t1)?;

        assert_eq!(record.heartbeat_at, t1);
        assert_eq!(locks.inspect(&key)?.map(|r| r.heartbeat_at), Some(t1));
        assert!(matches!(
            locks.heartbeat_at(&key, &owner("b"), t1),
            Err(Error::NotOwner { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_unknown_owner_reclaimable_only_after_ttl() -> Result<()> {
        let (_dir, locks) = manager(Liveness::Unknown)?;
        let key = ResourceKey::rig_merge("gastown");
        let t0 = Utc::now();

        locks.acquire_at(&key, &owner("a"), TTL, t0)?;

        let early = locks.acquire_at(&key, &owner("b"), TTL, t0 + ChronoDuration::seconds(59));
        assert!(matches!(early, Err(Error::LockHeld { .. })));

        let late = locks.acquire_at(&key, &owner("b"), TTL, t0 + ChronoDuration::seconds(61))?;
        match late {
            Acquisition::Reclaimed {
                previous, reason, ..
            } => {
                assert_eq!(previous, Some(owner("a")));
                assert_eq!(reason, Staleness::HeartbeatExpired);
            }
            other => panic!("expected Reclaimed, got {other:?}"),
        }

        // The old holder finds out on its next heartbeat
        assert!(matches!(
            locks.heartbeat_at(&key, &owner("a"), t0 + ChronoDuration::seconds(62)),
            Err(Error::NotOwner { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_dead_owner_reclaimed_immediately() -> Result<()> {
        let (_dir, locks) = manager(Liveness::Dead)?;
        let key = ResourceKey::rig_merge("gastown");
        let t0 = Utc::now();

        locks.acquire_at(&key, &owner("a"), Duration::from_secs(3600), t0)?;
        let taken = locks.acquire_at(&key, &owner("b"), TTL, t0)?;
        assert!(taken.was_reclaimed());
        assert!(locks.is_held_by(&key, &owner("b"))?);
        Ok(())
    }

    #[test]
    fn test_unreadable_lock_file_is_replaced() -> Result<()> {
        let (_dir, locks) = manager(Liveness::Alive)?;
        let key = ResourceKey::rig_merge("gastown");
        let path = locks.lock_path(&key);
        fs::write(&path, b"{\"resource_key\": \"rig:gas").map_err(|e| Error::io(&path, e))?;

        let taken = locks.acquire(&key, &owner("a"), TTL)?;
        assert!(matches!(
            taken,
            Acquisition::Reclaimed {
                previous: None,
                reason: Staleness::Unreadable,
                ..
            }
        ));
        Ok(())
    }

    #[test]
    fn test_clean_stale_locks_only_removes_expired() -> Result<()> {
        let (_dir, locks) = manager(Liveness::Unknown)?;
        let old = ResourceKey::rig_merge("old");
        let fresh = ResourceKey::rig_merge("fresh");
        let t0 = Utc::now();

        locks.acquire_at(&old, &owner("a"), TTL, t0)?;
        locks.acquire_at(&fresh, &owner("b"), TTL, t0 + ChronoDuration::seconds(50))?;

        let reclaimed = locks.clean_stale_locks_at(t0 + ChronoDuration::seconds(90))?;
        assert_eq!(reclaimed, vec![old.clone()]);
        assert!(locks.inspect(&old)?.is_none());
        assert!(locks.inspect(&fresh)?.is_some());
        Ok(())
    }

    #[test]
    fn test_no_collisions_in_steady_state() -> Result<()> {
        let (_dir, locks) = manager(Liveness::Alive)?;
        let key = ResourceKey::rig_merge("gastown");

        locks.acquire(&key, &owner("a"), TTL)?;
        assert!(locks.detect_collisions()?.is_empty());

        locks.release(&key, &owner("a"))?;
        locks.acquire(&key, &owner("b"), TTL)?;
        assert!(locks.detect_collisions()?.is_empty());
        Ok(())
    }

    #[test]
    fn test_collision_reported_for_second_live_claim() -> Result<()> {
        let (_dir, locks) = manager(Liveness::Alive)?;
        let key = ResourceKey::rig_merge("gastown");
        let now = Utc::now();

        locks.acquire_at(&key, &owner("a"), TTL, now)?;
        // Owner b believes it holds the key too
        locks.write_claim(&ClaimRecord {
            resource_key: key.clone(),
            owner: owner("b"),
            refreshed_at: now,
            ttl_secs: 60,
        })?;

        let collisions = locks.detect_collisions_at(now)?;
        assert_eq!(collisions.len(), 1);
        assert_eq!(collisions[0].resource_key, key);
        assert_eq!(collisions[0].recorded_owner, Some(owner("a")));
        assert_eq!(collisions[0].claimants, vec![owner("a"), owner("b")]);

        // Surfaced, not resolved
        assert!(locks.is_held_by(&key, &owner("a"))?);
        Ok(())
    }

    #[test]
    fn test_zero_ttl_rejected() -> Result<()> {
        let (_dir, locks) = manager(Liveness::Alive)?;
        let key = ResourceKey::rig_merge("gastown");
        assert!(matches!(
            locks.acquire(&key, &owner("a"), Duration::ZERO),
            Err(Error::InvalidConfig(_))
        ));
        Ok(())
    }

    #[test]
    fn test_list_orders_by_key() -> Result<()> {
        let (_dir, locks) = manager(Liveness::Alive)?;
        locks.acquire(&ResourceKey::rig_merge("zeta"), &owner("a"), TTL)?;
        locks.acquire(&ResourceKey::rig_merge("alpha"), &owner("a"), TTL)?;

        let keys: Vec<String> = locks
            .list()?
            .into_iter()
            .map(|r| r.resource_key.to_string())
            .collect();
        assert_eq!(keys, vec!["rig:alpha:merge", "rig:zeta:merge"]);
        Ok(())
    }
}
