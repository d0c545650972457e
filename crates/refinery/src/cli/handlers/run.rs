use std::time::Duration;

use anyhow::Result;
use clap::ArgMatches;

use super::{rig_path, string_arg};
use crate::commands::run::{self, RunOptions};

pub async fn handle(matches: &ArgMatches) -> Result<()> {
    let options = RunOptions {
        rig: rig_path(matches)?,
        session: string_arg(matches, "session"),
        once: matches.get_flag("once"),
        target_branch: string_arg(matches, "target-branch"),
        poll_interval: matches.get_one::<Duration>("poll-interval").copied(),
        json: matches.get_flag("json"),
    };
    run::run(&options).await
}
