//! `refinery run` - drive one rig's merge queue

use std::{fmt::Write as _, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use refinery_core::{
    load_config, shutdown::shutdown_token, CandidateOutcome, GitCli, GitOps, MergeQueueEngine,
    OwnerId, RefineryConfig, RunMode, RunSummary,
};

use super::{print_json, rig_layout, session_name};

/// Options for the run command
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub rig: PathBuf,
    pub session: Option<String>,
    /// Drain the queue once instead of polling
    pub once: bool,
    pub target_branch: Option<String>,
    pub poll_interval: Option<Duration>,
    pub json: bool,
}

/// Run the merge queue until drained (`--once`) or interrupted.
///
/// SIGINT and SIGTERM let the current stage finish and checkpoint it.
pub async fn run(options: &RunOptions) -> Result<()> {
    let layout = rig_layout(&options.rig)?;
    let config = load_config(&layout)
        .await
        .with_context(|| format!("failed to load configuration for rig '{}'", layout.name()))?;
    let config = apply_flags(
        config,
        options.target_branch.as_deref(),
        options.poll_interval,
    )?;

    let owner = OwnerId::current(session_name(options.session.as_deref()));
    let git: Arc<dyn GitOps> = Arc::new(GitCli::new(layout.clone_dir()));
    let mut engine = MergeQueueEngine::new(&layout, config, owner, git)?;

    let mode = if options.once {
        RunMode::Once
    } else {
        RunMode::Continuous
    };
    let summary = engine
        .run(mode, shutdown_token()?)
        .await
        .with_context(|| format!("merge queue for rig '{}' stopped", layout.name()))?;

    if options.json {
        print_json(&summary)
    } else {
        print!("{}", render(&summary));
        Ok(())
    }
}

/// Apply command-line overrides, the last configuration layer.
pub fn apply_flags(
    mut config: RefineryConfig,
    target_branch: Option<&str>,
    poll_interval: Option<Duration>,
) -> Result<RefineryConfig> {
    if let Some(branch) = target_branch {
        config.merge_queue.target_branch = branch.to_string();
    }
    if let Some(interval) = poll_interval {
        config.merge_queue.poll_interval = interval;
    }
    config.validate()?;
    Ok(config)
}

/// Human-readable run summary, one line per candidate.
pub fn render(summary: &RunSummary) -> String {
    let mut out = format!(
        "{}: {} merged, {} rejected, {} blocked\n",
        summary.rig, summary.merged, summary.rejected, summary.blocked
    );
    for outcome in &summary.outcomes {
        let line = match outcome {
            CandidateOutcome::Merged {
                branch,
                merged_head,
                clearance,
            } => format!("merged    {branch} at {merged_head} ({clearance})"),
            CandidateOutcome::Rejected { branch, reason } => {
                format!("rejected  {branch}: {reason}")
            }
            CandidateOutcome::Blocked { branch, detail } => format!("blocked   {branch}: {detail}"),
            CandidateOutcome::Interrupted { branch } => {
                format!("paused    {branch} (checkpoint kept)")
            }
        };
        let _ = writeln!(out, "  {line}");
    }
    out
}
