//! `refinery events list`

use std::path::PathBuf;

use anyhow::Result;
use refinery_core::{Event, EventKind, EventLog};

use super::{print_json, rig_layout};

#[derive(Debug, Clone)]
pub struct EventsOptions {
    pub rig: PathBuf,
    /// Kebab-case kind name, e.g. `branch-merged`
    pub kind: Option<String>,
    pub limit: usize,
    pub json: bool,
}

pub async fn list(options: &EventsOptions) -> Result<()> {
    let kind = options
        .kind
        .as_deref()
        .map(str::parse::<EventKind>)
        .transpose()?;
    let layout = rig_layout(&options.rig)?;
    let events = EventLog::new(layout.events_file())
        .tail(options.limit, kind)
        .await?;

    if options.json {
        return print_json(&events);
    }
    if events.is_empty() {
        println!("No events");
    }
    for event in &events {
        println!("{}", render(event));
    }
    Ok(())
}

/// One line per event: time, kind, branch if any, message.
pub fn render(event: &Event) -> String {
    let mut line = format!(
        "{} {:<24}",
        event.timestamp.format("%Y-%m-%d %H:%M:%S"),
        event.kind.to_string()
    );
    if let Some(branch) = event.field("branch").and_then(|v| v.as_str()) {
        line.push(' ');
        line.push_str(branch);
    }
    if !event.message.is_empty() {
        line.push_str(" - ");
        line.push_str(&event.message);
    }
    line.trim_end().to_string()
}
