//! CLI command definitions using `clap`

pub mod handlers;

use std::{path::PathBuf, time::Duration};

use clap::{value_parser, Arg, ArgAction, Command};

pub fn build_cli() -> Command {
    Command::new("refinery")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Merge queue for agent-produced branches")
        .long_about(
            "Refinery rebases worker branches onto the target branch one at a time,\n\
            verifies them, and fast-forwards the target.\n\n\
            Core workflow:\n  \
              refinery run --rig <path>          Process one rig until interrupted\n  \
              refinery run --rig <path> --once   Drain the queue and exit\n  \
              refinery events list               See what the queue did",
        )
        .subcommand_required(true)
        .subcommand(cmd_run())
        .subcommand(cmd_fleet())
        .subcommand(cmd_lock())
        .subcommand(cmd_checkpoint())
        .subcommand(cmd_events())
        .subcommand(cmd_config())
}

fn parse_duration(raw: &str) -> Result<Duration, String> {
    refinery_core::config::parse_duration(raw).map_err(|e| e.to_string())
}

fn rig_arg() -> Arg {
    Arg::new("rig")
        .long("rig")
        .value_name("PATH")
        .value_parser(value_parser!(PathBuf))
        .default_value(".")
        .help("Rig root directory")
}

fn session_arg() -> Arg {
    Arg::new("session")
        .long("session")
        .value_name("ID")
        .help("Session name recorded as lock owner (default: $REFINERY_SESSION or 'refinery')")
}

fn json_arg() -> Arg {
    Arg::new("json")
        .long("json")
        .action(ArgAction::SetTrue)
        .help("Output as JSON")
}

fn cmd_run() -> Command {
    Command::new("run")
        .about("Run the merge queue for one rig")
        .arg(rig_arg())
        .arg(session_arg())
        .arg(
            Arg::new("once")
                .long("once")
                .action(ArgAction::SetTrue)
                .help("Process every ready candidate, then exit"),
        )
        .arg(
            Arg::new("target-branch")
                .long("target-branch")
                .value_name("BRANCH")
                .help("Override merge_queue.target_branch"),
        )
        .arg(
            Arg::new("poll-interval")
                .long("poll-interval")
                .value_name("DURATION")
                .value_parser(parse_duration)
                .help("Override merge_queue.poll_interval (e.g. 30s, 2m)"),
        )
        .arg(json_arg())
}

fn cmd_fleet() -> Command {
    Command::new("fleet")
        .about("Run the merge queues of several rigs in one process")
        .arg(
            Arg::new("rig")
                .long("rig")
                .value_name("PATH")
                .value_parser(value_parser!(PathBuf))
                .action(ArgAction::Append)
                .required(true)
                .help("Rig root directory (repeat for each rig)"),
        )
        .arg(session_arg())
        .arg(
            Arg::new("once")
                .long("once")
                .action(ArgAction::SetTrue)
                .help("Drain every rig's queue, then exit"),
        )
        .arg(
            Arg::new("max-concurrent")
                .long("max-concurrent")
                .value_name("N")
                .value_parser(value_parser!(u32))
                .help("Candidates merged at once across rigs, 0 for unbounded (default: first rig's setting)"),
        )
        .arg(json_arg())
}

fn lock_leaf(name: &'static str, about: &'static str) -> Command {
    Command::new(name)
        .about(about)
        .arg(rig_arg())
        .arg(json_arg())
}

fn with_owner(cmd: Command) -> Command {
    cmd.arg(
        Arg::new("resource")
            .long("resource")
            .value_name("KEY")
            .help("Resource key (default: the rig's merge lock)"),
    )
    .arg(session_arg())
    .arg(
        Arg::new("pid")
            .long("pid")
            .value_name("PID")
            .value_parser(value_parser!(u32))
            .help("Owning process (default: the invoking shell)"),
    )
}

fn cmd_lock() -> Command {
    Command::new("lock")
        .about("Inspect and manage resource locks")
        .subcommand_required(true)
        .subcommand(
            with_owner(lock_leaf("acquire", "Take a lock without waiting")).arg(
                Arg::new("ttl")
                    .long("ttl")
                    .value_name("DURATION")
                    .value_parser(parse_duration)
                    .default_value("5m")
                    .help("Heartbeat age after which the lock may be reclaimed"),
            ),
        )
        .subcommand(with_owner(lock_leaf("heartbeat", "Refresh a held lock")))
        .subcommand(with_owner(lock_leaf("release", "Release a held lock")))
        .subcommand(
            lock_leaf("status", "Show locks and whether their owners are alive").arg(
                Arg::new("resource")
                    .long("resource")
                    .value_name("KEY")
                    .help("Only show this resource"),
            ),
        )
        .subcommand(lock_leaf("clean", "Remove locks held by dead or silent owners"))
        .subcommand(lock_leaf(
            "collisions",
            "Report resources that more than one owner believes it holds",
        ))
}

fn cmd_checkpoint() -> Command {
    Command::new("checkpoint")
        .about("Inspect or clear the merge queue checkpoint")
        .subcommand_required(true)
        .subcommand(
            Command::new("show")
                .about("Show the checkpoint")
                .arg(rig_arg())
                .arg(json_arg()),
        )
        .subcommand(
            Command::new("clear")
                .about("Delete the checkpoint")
                .arg(rig_arg())
                .arg(
                    Arg::new("force")
                        .long("force")
                        .action(ArgAction::SetTrue)
                        .help("Clear even while a live engine holds the merge lock"),
                ),
        )
}

fn cmd_events() -> Command {
    Command::new("events")
        .about("Read the merge queue event log")
        .subcommand_required(true)
        .subcommand(
            Command::new("list")
                .about("List recent events")
                .arg(rig_arg())
                .arg(
                    Arg::new("kind")
                        .long("kind")
                        .value_name("KIND")
                        .help("Only events of this kind (e.g. branch-merged)"),
                )
                .arg(
                    Arg::new("limit")
                        .long("limit")
                        .value_name("N")
                        .value_parser(value_parser!(usize))
                        .default_value("50")
                        .help("Maximum number of events"),
                )
                .arg(json_arg()),
        )
}

fn cmd_config() -> Command {
    Command::new("config")
        .about("Show the effective configuration")
        .subcommand_required(true)
        .subcommand(
            Command::new("show")
                .about("Print configuration after all layers are applied")
                .arg(rig_arg())
                .arg(json_arg()),
        )
}
