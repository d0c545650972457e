use anyhow::Result;
use clap::ArgMatches;

use super::{rig_path, string_arg};
use crate::commands::events::{self, EventsOptions};

pub async fn handle(matches: &ArgMatches) -> Result<()> {
    let Some(("list", sub_m)) = matches.subcommand() else {
        anyhow::bail!("Unknown events subcommand. Run 'refinery events --help' for usage.");
    };
    let options = EventsOptions {
        rig: rig_path(sub_m)?,
        kind: string_arg(sub_m, "kind"),
        limit: sub_m.get_one::<usize>("limit").copied().unwrap_or(50),
        json: sub_m.get_flag("json"),
    };
    events::list(&options).await
}
