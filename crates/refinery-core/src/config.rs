//! Configuration loading and management
//!
//! # Hierarchy
//!
//! Configuration is loaded in this order (later overrides earlier):
//! 1. Built-in defaults
//! 2. Global config: ~/.config/refinery/config.toml
//! 3. Rig settings: `<rig>/settings/config.json` (`merge_queue` section)
//! 4. Environment variables: REFINERY_*
//! 5. CLI flags (command-specific)
//!
//! # Example Global Config
//!
//! ```toml
//! [merge_queue]
//! test_command = "cargo test --workspace"
//! retry_flaky_tests = 2
//! poll_interval = "45s"
//!
//! [runtime]
//! lock_ttl = "10m"
//! test_timeout = "1h"
//! ```

use std::{
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use serde::{Deserialize, Deserializer, Serialize};

use crate::{
    layout::{RigLayout, BRANCH_MAIN},
    Error, Result,
};

/// Highest rig settings schema version this build understands.
pub const CURRENT_RIG_SETTINGS_VERSION: u32 = 1;

// ═══════════════════════════════════════════════════════════════════════════
// CONFLICT STRATEGY
// ═══════════════════════════════════════════════════════════════════════════

/// What to do when a candidate does not rebase cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OnConflict {
    /// Reject the candidate and hand it back to its owner.
    #[default]
    AssignBack,
    /// Retry the rebase with the candidate's side winning conflicting hunks.
    AutoRebase,
}

impl<'de> Deserialize<'de> for OnConflict {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(serde::de::Error::custom)
    }
}

impl FromStr for OnConflict {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "" | "assign_back" => Ok(Self::AssignBack),
            "auto_rebase" => Ok(Self::AutoRebase),
            other => Err(Error::InvalidConfig(format!(
                "invalid on_conflict strategy: got '{other}', want 'assign_back' or 'auto_rebase'"
            ))),
        }
    }
}

impl std::fmt::Display for OnConflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AssignBack => write!(f, "assign_back"),
            Self::AutoRebase => write!(f, "auto_rebase"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// CONFIGURATION STRUCTURES
// ═══════════════════════════════════════════════════════════════════════════

/// Merge queue behaviour for one rig.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeQueueConfig {
    pub enabled: bool,
    pub target_branch: String,
    pub on_conflict: OnConflict,
    pub run_tests: bool,
    pub test_command: String,
    pub delete_merged_branches: bool,
    /// Extra test runs allowed after a failure before it counts as genuine.
    pub retry_flaky_tests: u32,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Rigs processed at once by the fleet runner. `0` means unbounded.
    pub max_concurrent: u32,
}

impl Default for MergeQueueConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            target_branch: BRANCH_MAIN.to_string(),
            on_conflict: OnConflict::AssignBack,
            run_tests: true,
            test_command: "go test ./...".to_string(),
            delete_merged_branches: true,
            retry_flaky_tests: 1,
            poll_interval: Duration::from_secs(30),
            max_concurrent: 1,
        }
    }
}

/// Engine tunables that are not part of the shared rig settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Heartbeat age after which the merge lock counts as stale.
    #[serde(with = "humantime_serde")]
    pub lock_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    /// Checkpoints older than this are discarded instead of resumed.
    #[serde(with = "humantime_serde")]
    pub checkpoint_stale_after: Duration,
    #[serde(with = "humantime_serde")]
    pub rebase_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub test_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub push_timeout: Duration,
    /// Budget for every other git call (fetch, rev-parse, branch deletion).
    #[serde(with = "humantime_serde")]
    pub git_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(60),
            checkpoint_stale_after: Duration::from_secs(30 * 60),
            rebase_timeout: Duration::from_secs(300),
            test_timeout: Duration::from_secs(30 * 60),
            push_timeout: Duration::from_secs(120),
            git_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefineryConfig {
    #[serde(default)]
    pub merge_queue: MergeQueueConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

// ═══════════════════════════════════════════════════════════════════════════
// PARTIAL LAYERS
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default, Deserialize)]
struct MergeQueueLayer {
    enabled: Option<bool>,
    target_branch: Option<String>,
    on_conflict: Option<OnConflict>,
    run_tests: Option<bool>,
    test_command: Option<String>,
    delete_merged_branches: Option<bool>,
    retry_flaky_tests: Option<u32>,
    #[serde(default, deserialize_with = "optional_duration")]
    poll_interval: Option<Duration>,
    max_concurrent: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct RuntimeLayer {
    #[serde(default, deserialize_with = "optional_duration")]
    lock_ttl: Option<Duration>,
    #[serde(default, deserialize_with = "optional_duration")]
    heartbeat_interval: Option<Duration>,
    #[serde(default, deserialize_with = "optional_duration")]
    checkpoint_stale_after: Option<Duration>,
    #[serde(default, deserialize_with = "optional_duration")]
    rebase_timeout: Option<Duration>,
    #[serde(default, deserialize_with = "optional_duration")]
    test_timeout: Option<Duration>,
    #[serde(default, deserialize_with = "optional_duration")]
    push_timeout: Option<Duration>,
    #[serde(default, deserialize_with = "optional_duration")]
    git_timeout: Option<Duration>,
}

/// Global `config.toml`.
#[derive(Debug, Default, Deserialize)]
struct GlobalLayer {
    #[serde(default)]
    merge_queue: MergeQueueLayer,
    #[serde(default)]
    runtime: RuntimeLayer,
}

/// `<rig>/settings/config.json`. Sections owned by other roles are ignored.
#[derive(Debug, Default, Deserialize)]
struct RigSettingsLayer {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    version: u32,
    merge_queue: Option<MergeQueueLayer>,
}

/// Empty strings mean "unset", anything else must be a valid duration.
fn optional_duration<'de, D>(deserializer: D) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => parse_duration(s)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

/// Parse a duration string such as `30s`, `5m` or `1h30m`.
pub fn parse_duration(raw: &str) -> Result<Duration> {
    humantime::parse_duration(raw.trim())
        .map_err(|e| Error::InvalidConfig(format!("invalid duration '{raw}': {e}")))
}

// ═══════════════════════════════════════════════════════════════════════════
// MERGE IMPLEMENTATIONS
// ═══════════════════════════════════════════════════════════════════════════

impl MergeQueueConfig {
    fn merge(&mut self, layer: MergeQueueLayer) {
        if let Some(v) = layer.enabled {
            self.enabled = v;
        }
        if let Some(v) = layer.target_branch.filter(|s| !s.trim().is_empty()) {
            self.target_branch = v;
        }
        if let Some(v) = layer.on_conflict {
            self.on_conflict = v;
        }
        if let Some(v) = layer.run_tests {
            self.run_tests = v;
        }
        if let Some(v) = layer.test_command.filter(|s| !s.trim().is_empty()) {
            self.test_command = v;
        }
        if let Some(v) = layer.delete_merged_branches {
            self.delete_merged_branches = v;
        }
        if let Some(v) = layer.retry_flaky_tests {
            self.retry_flaky_tests = v;
        }
        if let Some(v) = layer.poll_interval {
            self.poll_interval = v;
        }
        if let Some(v) = layer.max_concurrent {
            self.max_concurrent = v;
        }
    }
}

impl RuntimeConfig {
    fn merge(&mut self, layer: RuntimeLayer) {
        let slots = [
            (&mut self.lock_ttl, layer.lock_ttl),
            (&mut self.heartbeat_interval, layer.heartbeat_interval),
            (&mut self.checkpoint_stale_after, layer.checkpoint_stale_after),
            (&mut self.rebase_timeout, layer.rebase_timeout),
            (&mut self.test_timeout, layer.test_timeout),
            (&mut self.push_timeout, layer.push_timeout),
            (&mut self.git_timeout, layer.git_timeout),
        ];
        for (slot, value) in slots {
            if let Some(v) = value {
                *slot = v;
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// LOADING
// ═══════════════════════════════════════════════════════════════════════════

/// Load configuration for a rig using the full hierarchy.
///
/// # Errors
///
/// Returns error if:
/// - A config file is malformed
/// - Rig settings carry an unknown type or a newer schema version
/// - An environment override cannot be parsed
/// - The merged values fail validation
pub async fn load_config(layout: &RigLayout) -> Result<RefineryConfig> {
    let global = global_config_path();
    load_config_from(global.as_deref(), layout).await
}

/// Same as [`load_config`] with an explicit global config location.
pub async fn load_config_from(
    global_path: Option<&Path>,
    layout: &RigLayout,
) -> Result<RefineryConfig> {
    // 1. Start with built-in defaults
    let mut config = RefineryConfig::default();

    // 2. Global config
    if let Some(path) = global_path.filter(|p| p.exists()) {
        let global = load_global_file(path).await?;
        config.merge_queue.merge(global.merge_queue);
        config.runtime.merge(global.runtime);
    }

    // 3. Rig settings
    let settings_path = layout.settings_file();
    if settings_path.exists() {
        if let Some(layer) = load_rig_settings(&settings_path).await? {
            config.merge_queue.merge(layer);
        }
    }

    // 4. Environment overrides
    config.apply_env_vars()?;

    // 5. Validate
    config.validate()?;

    tracing::debug!(rig = layout.name(), ?config, "configuration loaded");
    Ok(config)
}

/// Location of the global config file, if the platform has a config dir.
pub fn global_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "refinery")
        .map(|proj_dirs| proj_dirs.config_dir().join("config.toml"))
}

async fn load_global_file(path: &Path) -> Result<GlobalLayer> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::io(path, e))?;

    toml::from_str(&content).map_err(|e| {
        Error::InvalidConfig(format!("failed to parse {}: {e}", path.display()))
    })
}

async fn load_rig_settings(path: &Path) -> Result<Option<MergeQueueLayer>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::io(path, e))?;

    let settings: RigSettingsLayer = serde_json::from_str(&content).map_err(|e| {
        Error::InvalidConfig(format!("failed to parse {}: {e}", path.display()))
    })?;

    if !settings.kind.is_empty() && settings.kind != "rig-settings" {
        return Err(Error::InvalidConfig(format!(
            "expected type 'rig-settings', got '{}'",
            settings.kind
        )));
    }
    if settings.version > CURRENT_RIG_SETTINGS_VERSION {
        return Err(Error::InvalidConfig(format!(
            "rig settings version {} is newer than supported {CURRENT_RIG_SETTINGS_VERSION}",
            settings.version
        )));
    }

    Ok(settings.merge_queue)
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    std::env::var(name).ok().map_or(Ok(None), |value| {
        value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::InvalidConfig(format!("Invalid {name} value: {e}")))
    })
}

fn env_duration(name: &str) -> Result<Option<Duration>> {
    std::env::var(name).ok().map_or(Ok(None), |value| {
        parse_duration(&value)
            .map(Some)
            .map_err(|e| Error::InvalidConfig(format!("Invalid {name} value: {e}")))
    })
}

impl RefineryConfig {
    /// Apply environment variable overrides
    ///
    /// # Errors
    ///
    /// Returns error if environment variable values are invalid
    pub fn apply_env_vars(&mut self) -> Result<()> {
        let layer = MergeQueueLayer {
            enabled: env_parse("REFINERY_ENABLED")?,
            target_branch: std::env::var("REFINERY_TARGET_BRANCH").ok(),
            on_conflict: env_parse("REFINERY_ON_CONFLICT")?,
            run_tests: env_parse("REFINERY_RUN_TESTS")?,
            test_command: std::env::var("REFINERY_TEST_COMMAND").ok(),
            delete_merged_branches: env_parse("REFINERY_DELETE_MERGED_BRANCHES")?,
            retry_flaky_tests: env_parse("REFINERY_RETRY_FLAKY_TESTS")?,
            poll_interval: env_duration("REFINERY_POLL_INTERVAL")?,
            max_concurrent: env_parse("REFINERY_MAX_CONCURRENT")?,
        };
        self.merge_queue.merge(layer);

        let runtime = RuntimeLayer {
            lock_ttl: env_duration("REFINERY_LOCK_TTL")?,
            heartbeat_interval: env_duration("REFINERY_HEARTBEAT_INTERVAL")?,
            checkpoint_stale_after: env_duration("REFINERY_CHECKPOINT_STALE_AFTER")?,
            test_timeout: env_duration("REFINERY_TEST_TIMEOUT")?,
            ..RuntimeLayer::default()
        };
        self.runtime.merge(runtime);

        Ok(())
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any values are out of range or inconsistent
    pub fn validate(&self) -> Result<()> {
        let mq = &self.merge_queue;
        let rt = &self.runtime;

        if mq.target_branch.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "target_branch must not be empty".to_string(),
            ));
        }
        if mq.run_tests && mq.test_command.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "test_command is required when run_tests is enabled".to_string(),
            ));
        }
        if mq.poll_interval.is_zero() {
            return Err(Error::InvalidConfig("poll_interval must be > 0".to_string()));
        }

        let timeouts = [
            ("lock_ttl", rt.lock_ttl),
            ("heartbeat_interval", rt.heartbeat_interval),
            ("rebase_timeout", rt.rebase_timeout),
            ("test_timeout", rt.test_timeout),
            ("push_timeout", rt.push_timeout),
            ("git_timeout", rt.git_timeout),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, d)| d.is_zero()) {
            return Err(Error::InvalidConfig(format!("{name} must be > 0")));
        }
        if rt.heartbeat_interval >= rt.lock_ttl {
            return Err(Error::InvalidConfig(format!(
                "heartbeat_interval ({:?}) must be < lock_ttl ({:?})",
                rt.heartbeat_interval, rt.lock_ttl
            )));
        }

        Ok(())
    }

    /// Render as TOML, for `refinery config show`.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════
