use std::path::PathBuf;

use anyhow::Result;
use clap::ArgMatches;

use super::string_arg;
use crate::commands::fleet::{self, FleetOptions};

pub async fn handle(matches: &ArgMatches) -> Result<()> {
    let options = FleetOptions {
        rigs: matches
            .get_many::<PathBuf>("rig")
            .map(|rigs| rigs.cloned().collect())
            .unwrap_or_default(),
        session: string_arg(matches, "session"),
        once: matches.get_flag("once"),
        max_concurrent: matches.get_one::<u32>("max-concurrent").copied(),
        json: matches.get_flag("json"),
    };
    fleet::run(&options).await
}
