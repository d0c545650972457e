//! Advisory resource locks for coordinating independent worker processes.
//!
//! One JSON file per resource key, kept in a shared lock directory. Locks are
//! advisory: correctness depends on every writer going through this module.
//!
//! # Guarantees
//!
//! - **Mutual Exclusion**: at most one live owner per key
//! - **Non-blocking**: `acquire` tries once and reports the current holder
//! - **Stale Lock Detection**: dead owners are reclaimable at once, hung owners
//!   once their heartbeat is older than the ttl they declared
//! - **Collision Reporting**: per-owner claims expose double ownership
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use refinery_core::lock::{LockManager, OwnerId, ResourceKey};
//!
//! let locks = LockManager::new("/town/gastown/.runtime/locks")?;
//! let key = ResourceKey::rig_merge("gastown");
//! let me = OwnerId::current("refinery");
//!
//! match locks.acquire(&key, &me, Duration::from_secs(300)) {
//!     Ok(acquisition) => println!("holding {}", acquisition.record().resource_key),
//!     Err(refinery_core::Error::LockHeld { holder, .. }) => println!("busy: {holder}"),
//!     Err(e) => return Err(e),
//! }
//! # Ok::<(), refinery_core::Error>(())
//! ```

mod operations;
mod queries;
pub mod types;

pub use queries::ProcessProbe;
pub use types::{
    local_hostname, Acquisition, ClaimRecord, Collision, LivenessProbe, Liveness, LockManager,
    LockRecord, OwnerId, ResourceKey, SharedProbe, Staleness,
};
