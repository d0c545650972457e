//! Several rigs, one process.
//!
//! Every rig gets its own engine task. Engines share a semaphore so that at
//! most `max_concurrent` candidates are being merged across the fleet at once;
//! scanning and idle polling are not limited.

use std::sync::Arc;

use tokio::{sync::Semaphore, task::JoinSet};
use tokio_util::sync::CancellationToken;

use super::{MergeQueueEngine, RunMode, RunSummary};
use crate::Result;

pub struct Fleet {
    engines: Vec<MergeQueueEngine>,
    slots: Option<Arc<Semaphore>>,
}

impl Fleet {
    /// `max_concurrent == 0` leaves merging unbounded.
    pub fn new(max_concurrent: u32) -> Self {
        let slots = (max_concurrent > 0).then(|| {
            let permits = usize::try_from(max_concurrent).unwrap_or(Semaphore::MAX_PERMITS);
            Arc::new(Semaphore::new(permits))
        });
        Self {
            engines: Vec::new(),
            slots,
        }
    }

    pub fn add(&mut self, engine: MergeQueueEngine) {
        let engine = match &self.slots {
            Some(slots) => engine.with_merge_slots(Arc::clone(slots)),
            None => engine,
        };
        self.engines.push(engine);
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    /// Run every engine until it finishes. Results are sorted by rig name.
    pub async fn run(self, mode: RunMode, cancel: CancellationToken) -> Vec<(String, Result<RunSummary>)> {
        let mut tasks = JoinSet::new();
        for mut engine in self.engines {
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let rig = engine.rig().to_string();
                let result = engine.run(mode, cancel).await;
                (rig, result)
            });
        }

        let mut results = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => tracing::error!(error = %e, "rig engine task failed"),
            }
        }
        results.sort_by(|a, b| a.0.cmp(&b.0));
        results
    }
}
