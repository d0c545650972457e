//! Command handlers: `ArgMatches` in, command options out

mod checkpoint;
mod config;
mod events;
mod fleet;
mod lock;
mod run;

use std::path::PathBuf;

use anyhow::Result;
use clap::ArgMatches;

pub async fn dispatch(matches: &ArgMatches) -> Result<()> {
    match matches.subcommand() {
        Some(("run", sub_m)) => run::handle(sub_m).await,
        Some(("fleet", sub_m)) => fleet::handle(sub_m).await,
        Some(("lock", sub_m)) => lock::handle(sub_m),
        Some(("checkpoint", sub_m)) => checkpoint::handle(sub_m),
        Some(("events", sub_m)) => events::handle(sub_m).await,
        Some(("config", sub_m)) => config::handle(sub_m).await,
        _ => anyhow::bail!("Unknown command. Run 'refinery --help' for usage."),
    }
}

/// Error message with its first distinct cause.
pub fn format_error(err: &anyhow::Error) -> String {
    let msg = err.to_string();
    if let Some(source) = err.source() {
        let source_msg = source.to_string();
        if !msg.contains(&source_msg) && !source_msg.is_empty() {
            return format!("{msg}\nCause: {source_msg}");
        }
    }
    msg
}

/// Exit code of the first core error in the chain, else 1.
pub fn exit_code(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<refinery_core::Error>())
        .map_or(1, refinery_core::Error::exit_code)
}

fn rig_path(matches: &ArgMatches) -> Result<PathBuf> {
    matches
        .get_one::<PathBuf>("rig")
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("--rig is required"))
}

fn string_arg(matches: &ArgMatches, id: &str) -> Option<String> {
    matches.get_one::<String>(id).cloned()
}

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use super::*;

    #[test]
    fn test_exit_code_follows_core_error_through_context() {
        let err = Err::<(), _>(refinery_core::Error::LockHeld {
            resource: "rig:gastown:merge".into(),
            holder: "host:1:ops".into(),
        })
        .context("lock acquire failed")
        .err();
        assert_eq!(err.as_ref().map(exit_code), Some(3));
        assert_eq!(exit_code(&anyhow::anyhow!("plain failure")), 1);
    }

    #[test]
    fn test_format_error_appends_cause() {
        let err = anyhow::Error::new(std::io::Error::other("disk full")).context("write failed");
        assert_eq!(format_error(&err), "write failed\nCause: disk full");
    }
}
