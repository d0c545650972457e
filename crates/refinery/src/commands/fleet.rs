//! `refinery fleet` - several rigs on one runtime

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use refinery_core::{
    load_config, shutdown::shutdown_token, Fleet, GitCli, GitOps, MergeQueueEngine, OwnerId,
    RunMode, RunSummary,
};

use super::{print_json, rig_layout, run::render, session_name};

/// Options for the fleet command
#[derive(Debug, Clone)]
pub struct FleetOptions {
    pub rigs: Vec<PathBuf>,
    pub session: Option<String>,
    pub once: bool,
    /// Overrides the first rig's `max_concurrent`
    pub max_concurrent: Option<u32>,
    pub json: bool,
}

pub async fn run(options: &FleetOptions) -> Result<()> {
    if options.rigs.is_empty() {
        anyhow::bail!("at least one --rig is required");
    }

    let session = session_name(options.session.as_deref());
    let mut engines = Vec::with_capacity(options.rigs.len());
    let mut configured_limit = None;
    for path in &options.rigs {
        let layout = rig_layout(path)?;
        let config = load_config(&layout)
            .await
            .with_context(|| format!("failed to load configuration for rig '{}'", layout.name()))?;
        configured_limit.get_or_insert(config.merge_queue.max_concurrent);

        let git: Arc<dyn GitOps> = Arc::new(GitCli::new(layout.clone_dir()));
        let owner = OwnerId::current(session.as_str());
        engines.push(MergeQueueEngine::new(&layout, config, owner, git)?);
    }

    let limit = options.max_concurrent.or(configured_limit).unwrap_or(1);
    let mut fleet = Fleet::new(limit);
    for engine in engines {
        fleet.add(engine);
    }
    tracing::info!(rigs = fleet.len(), max_concurrent = limit, "starting fleet");

    let mode = if options.once {
        RunMode::Once
    } else {
        RunMode::Continuous
    };
    let results = fleet.run(mode, shutdown_token()?).await;

    let mut summaries: Vec<RunSummary> = Vec::with_capacity(results.len());
    let mut failures = Vec::new();
    for (rig, result) in results {
        match result {
            Ok(summary) => summaries.push(summary),
            Err(e) => {
                tracing::error!(%rig, error = %e, "rig engine failed");
                failures.push(format!("{rig}: {e}"));
            }
        }
    }

    if options.json {
        print_json(&summaries)?;
    } else {
        for summary in &summaries {
            print!("{}", render(summary));
        }
    }

    if !failures.is_empty() {
        anyhow::bail!(
            "{} of {} rigs failed:\n  {}",
            failures.len(),
            options.rigs.len(),
            failures.join("\n  ")
        );
    }
    Ok(())
}
