use anyhow::Result;
use clap::ArgMatches;

use super::rig_path;
use crate::commands::checkpoint::{self, ClearOptions, ShowOptions};

pub fn handle(matches: &ArgMatches) -> Result<()> {
    match matches.subcommand() {
        Some(("show", sub_m)) => checkpoint::show(&ShowOptions {
            rig: rig_path(sub_m)?,
            json: sub_m.get_flag("json"),
        }),
        Some(("clear", sub_m)) => checkpoint::clear(&ClearOptions {
            rig: rig_path(sub_m)?,
            force: sub_m.get_flag("force"),
        }),
        _ => anyhow::bail!("Unknown checkpoint subcommand. Run 'refinery checkpoint --help' for usage."),
    }
}
