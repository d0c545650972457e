//! `refinery config show`

use std::path::PathBuf;

use anyhow::{Context, Result};
use refinery_core::{config::global_config_path, load_config, RefineryConfig, RigLayout};

use super::{print_json, rig_layout};

#[derive(Debug, Clone)]
pub struct ConfigOptions {
    pub rig: PathBuf,
    pub json: bool,
}

pub async fn show(options: &ConfigOptions) -> Result<()> {
    let layout = rig_layout(&options.rig)?;
    let config = load_config(&layout)
        .await
        .with_context(|| format!("failed to load configuration for rig '{}'", layout.name()))?;

    if options.json {
        print_json(&config)
    } else {
        print!("{}", render(&layout, &config, global_config_path())?);
        Ok(())
    }
}

/// TOML with a header naming the files that were layered.
pub fn render(
    layout: &RigLayout,
    config: &RefineryConfig,
    global: Option<PathBuf>,
) -> Result<String> {
    let describe = |path: PathBuf| {
        let state = if path.exists() { "" } else { " (not found)" };
        format!("{}{state}", path.display())
    };
    let global = global.map_or_else(|| "none".to_string(), describe);
    Ok(format!(
        "# rig: {}\n# global config: {global}\n# rig settings: {}\n\n{}",
        layout.name(),
        describe(layout.settings_file()),
        config.to_toml()?
    ))
}
