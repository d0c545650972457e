use anyhow::Result;
use clap::ArgMatches;

use super::rig_path;
use crate::commands::config::{self, ConfigOptions};

pub async fn handle(matches: &ArgMatches) -> Result<()> {
    let Some(("show", sub_m)) = matches.subcommand() else {
        anyhow::bail!("Unknown config subcommand. Run 'refinery config --help' for usage.");
    };
    config::show(&ConfigOptions {
        rig: rig_path(sub_m)?,
        json: sub_m.get_flag("json"),
    })
    .await
}
