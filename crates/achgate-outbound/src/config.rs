//! Service configuration.
//!
//! The configuration is a camelCase JSON document loaded with
//! [`OutboundConfig::load`]. A handful of deployment-specific settings can be
//! overridden from `ACHGATE_*` environment variables.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use achgate_core::merge::MergeOptions;
use achgate_core::observability::LogFormat;
use achgate_core::transform::Encoding;
use achgate_core::{ShardKey, ShardName};
use serde::{Deserialize, Serialize};

use crate::cleanup::CleanupConfig;
use crate::error::{Error, Result};
use crate::receiver::ReceiverOptions;
use crate::schedule::CutoffScheduler;
use crate::upload::AgentPaths;
use crate::upload::retry::RetryConfig;

/// Default name of the staging directory under `storage.directory`.
pub const DEFAULT_MERGABLE_DIR: &str = "mergable";

/// Top-level service configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OutboundConfig {
    /// Staging storage.
    pub storage: StorageConfig,
    /// Configured shards.
    pub shards: Vec<ShardConfig>,
    /// Static shard key to shard name mappings.
    pub shard_mappings: HashMap<ShardKey, ShardName>,
    /// Shard receiving files whose mapped shard is not configured here.
    pub default_shard: Option<ShardName>,
    /// Named upload agents shards deliver through.
    pub upload_agents: Vec<UploadAgentConfig>,
    /// Settings shared by all upload agents.
    pub upload: UploadConfig,
    /// Staging cleanup.
    pub cleanup: CleanupConfig,
    /// Intake dispatch.
    pub receiver: ReceiverConfig,
    /// Leader election.
    pub leader: LeaderConfig,
    /// Identity of this replica; generated when unset.
    pub instance_id: Option<String>,
    /// Log output format.
    pub log_format: LogFormat,
    /// Port for the Prometheus exporter; disabled when unset.
    pub metrics_port: Option<u16>,
}

/// Where staged files live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageConfig {
    /// Base storage directory.
    pub directory: PathBuf,
    /// Name of the staging directory under `directory`.
    pub mergable_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("storage"),
            mergable_dir: DEFAULT_MERGABLE_DIR.to_string(),
        }
    }
}

impl StorageConfig {
    /// Root of the staging tree.
    #[must_use]
    pub fn staging_root(&self) -> PathBuf {
        self.directory.join(&self.mergable_dir)
    }
}

/// One shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardConfig {
    /// Shard name.
    pub name: ShardName,
    /// Cutoff schedule.
    pub cutoffs: CutoffConfig,
    /// ID of the upload agent this shard delivers through.
    pub upload_agent: String,
    /// Merge behavior.
    #[serde(default)]
    pub merging: MergeOptions,
    /// Delivery notifications.
    #[serde(default)]
    pub notifications: NotificationConfig,
}

/// Daily cutoff windows in one timezone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CutoffConfig {
    /// IANA timezone name.
    pub timezone: String,
    /// `HH:MM` wall-clock times.
    pub windows: Vec<String>,
}

impl CutoffConfig {
    /// Builds the scheduler for these windows.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown timezone or a malformed window.
    pub fn scheduler(&self) -> Result<CutoffScheduler> {
        CutoffScheduler::new(&self.timezone, &self.windows)
    }
}

/// Notification settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NotificationConfig {
    /// Whether delivery outcomes are sent to the notifier.
    pub enabled: bool,
}

/// An upload agent definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum UploadAgentConfig {
    /// Writes outbound files under a local directory.
    Local {
        /// Agent ID referenced by shards.
        id: String,
        /// Directory standing in for the remote host.
        root: PathBuf,
        /// Remote directory layout.
        #[serde(default)]
        paths: AgentPaths,
    },
    /// Keeps uploads in memory.
    Memory {
        /// Agent ID referenced by shards.
        id: String,
    },
}

impl UploadAgentConfig {
    /// Agent ID.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Local { id, .. } | Self::Memory { id } => id,
        }
    }
}

/// Settings shared by all upload agents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UploadConfig {
    /// Retry settings; retries are disabled when unset.
    pub retry: Option<RetryConfig>,
}

/// Intake dispatch settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReceiverConfig {
    /// Payloads buffered between subscriptions and workers.
    pub queue_capacity: usize,
    /// Concurrent dispatch workers.
    pub workers: usize,
    /// How payloads are revealed.
    pub transform: TransformConfig,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        let options = ReceiverOptions::default();
        Self {
            queue_capacity: options.queue_capacity,
            workers: options.workers,
            transform: TransformConfig::default(),
        }
    }
}

impl ReceiverConfig {
    /// Queue and worker sizing for the receiver.
    #[must_use]
    pub fn options(&self) -> ReceiverOptions {
        ReceiverOptions {
            queue_capacity: self.queue_capacity,
            workers: self.workers,
        }
    }
}

/// Payload transform settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransformConfig {
    /// Text encoding of intake payloads.
    pub encoding: Encoding,
}

/// Leader election settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LeaderConfig {
    /// Lease length in seconds.
    pub lease_secs: u64,
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            lease_secs: 24 * 60 * 60,
        }
    }
}

impl LeaderConfig {
    /// Lease length.
    #[must_use]
    pub const fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }
}

impl OutboundConfig {
    /// Reads a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("reading {}: {e}", path.display())))?;
        Self::from_json(&raw)
            .map_err(|e| Error::config(format!("parsing {}: {e}", path.display())))
    }

    /// Parses a JSON configuration document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not valid configuration.
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| Error::config(e.to_string()))
    }

    /// Applies `ACHGATE_*` overrides from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a set variable has an invalid value.
    pub fn apply_process_env(&mut self) -> Result<()> {
        self.apply_env_overrides(|name| std::env::var(name).ok())
    }

    /// Applies `ACHGATE_*` overrides read through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns an error if a set variable has an invalid value.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let env = Env(&lookup);

        if let Some(directory) = env.string("ACHGATE_STORAGE_DIRECTORY") {
            self.storage.directory = PathBuf::from(directory);
        }
        if let Some(id) = env.string("ACHGATE_INSTANCE_ID") {
            self.instance_id = Some(id);
        }
        if let Some(format) = env.string("ACHGATE_LOG_FORMAT") {
            self.log_format = format
                .parse()
                .map_err(|e| Error::config(format!("ACHGATE_LOG_FORMAT: {e}")))?;
        }
        if let Some(port) = env.u16("ACHGATE_METRICS_PORT")? {
            self.metrics_port = Some(port);
        }
        if let Some(shard) = env.string("ACHGATE_DEFAULT_SHARD") {
            self.default_shard = Some(
                ShardName::new(shard)
                    .map_err(|e| Error::config(format!("ACHGATE_DEFAULT_SHARD: {e}")))?,
            );
        }
        if let Some(enabled) = env.bool("ACHGATE_CLEANUP_ENABLED")? {
            self.cleanup.enabled = enabled;
        }
        if let Some(secs) = env.u64("ACHGATE_CLEANUP_INTERVAL_SECS")? {
            self.cleanup.interval_secs = secs;
        }
        if let Some(secs) = env.u64("ACHGATE_CLEANUP_RETENTION_SECS")? {
            self.cleanup.retention_secs = secs;
        }
        if let Some(workers) = env.usize("ACHGATE_RECEIVER_WORKERS")? {
            self.receiver.workers = workers;
        }
        if let Some(capacity) = env.usize("ACHGATE_RECEIVER_QUEUE_CAPACITY")? {
            self.receiver.queue_capacity = capacity;
        }
        if let Some(encoding) = env.string("ACHGATE_TRANSFORM_ENCODING") {
            self.receiver.transform.encoding = parse_encoding("ACHGATE_TRANSFORM_ENCODING", &encoding)?;
        }
        Ok(())
    }

    /// Checks cross-field consistency.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.shards.is_empty() {
            return Err(Error::config("at least one shard must be configured"));
        }
        if self.storage.mergable_dir.trim().is_empty() {
            return Err(Error::config("storage.mergableDir must not be empty"));
        }

        let mut agent_ids = HashSet::new();
        for agent in &self.upload_agents {
            if !agent_ids.insert(agent.id()) {
                return Err(Error::config(format!(
                    "duplicate upload agent id {}",
                    agent.id()
                )));
            }
        }

        let mut shard_names = HashSet::new();
        for shard in &self.shards {
            if !shard_names.insert(&shard.name) {
                return Err(Error::config(format!("duplicate shard {}", shard.name)));
            }
            if shard.cutoffs.windows.is_empty() {
                return Err(Error::config(format!(
                    "shard {} has no cutoff windows",
                    shard.name
                )));
            }
            shard.cutoffs.scheduler()?;
            if !agent_ids.contains(shard.upload_agent.as_str()) {
                return Err(Error::config(format!(
                    "shard {} references unknown upload agent {}",
                    shard.name, shard.upload_agent
                )));
            }
        }

        if let Some(default) = &self.default_shard {
            if !shard_names.contains(default) {
                return Err(Error::config(format!(
                    "default shard {default} is not configured"
                )));
            }
        } else if let Some((key, shard)) = self
            .shard_mappings
            .iter()
            .find(|(_, shard)| !shard_names.contains(shard))
        {
            return Err(Error::config(format!(
                "shard key {key} maps to unconfigured shard {shard} and no default shard is set"
            )));
        }

        if self.receiver.workers == 0 {
            return Err(Error::config("receiver.workers must be at least 1"));
        }
        if self.receiver.queue_capacity == 0 {
            return Err(Error::config("receiver.queueCapacity must be at least 1"));
        }
        if self.leader.lease_secs == 0 {
            return Err(Error::config("leader.leaseSecs must be at least 1"));
        }
        if let Some(message) = self.cleanup.validate() {
            return Err(Error::config(message));
        }
        Ok(())
    }

    /// Looks up an upload agent by ID.
    #[must_use]
    pub fn upload_agent(&self, id: &str) -> Option<&UploadAgentConfig> {
        self.upload_agents.iter().find(|agent| agent.id() == id)
    }

    /// Names of all configured shards.
    pub fn shard_names(&self) -> impl Iterator<Item = &ShardName> {
        self.shards.iter().map(|shard| &shard.name)
    }
}

struct Env<'a>(&'a dyn Fn(&str) -> Option<String>);

impl Env<'_> {
    fn string(&self, name: &str) -> Option<String> {
        (self.0)(name).and_then(|v| {
            let trimmed = v.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    fn u16(&self, name: &str) -> Result<Option<u16>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<u16>()
            .map(Some)
            .map_err(|e| Error::config(format!("{name} must be a u16: {e}")))
    }

    fn u64(&self, name: &str) -> Result<Option<u64>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<u64>()
            .map(Some)
            .map_err(|e| Error::config(format!("{name} must be a u64: {e}")))
    }

    fn usize(&self, name: &str) -> Result<Option<usize>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<usize>()
            .map(Some)
            .map_err(|e| Error::config(format!("{name} must be a usize: {e}")))
    }

    fn bool(&self, name: &str) -> Result<Option<bool>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        parse_bool(name, &v).map(Some)
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    let value = value.trim().to_ascii_lowercase();
    match value.as_str() {
        "true" | "1" | "yes" | "y" => Ok(true),
        "false" | "0" | "no" | "n" => Ok(false),
        _ => Err(Error::config(format!(
            "{name} must be a boolean (true/false/1/0)"
        ))),
    }
}

fn parse_encoding(name: &str, value: &str) -> Result<Encoding> {
    match value.trim().to_ascii_lowercase().as_str() {
        "none" => Ok(Encoding::None),
        "base64" => Ok(Encoding::Base64),
        other => Err(Error::config(format!(
            "{name} must be none or base64, got {other}"
        ))),
    }
}
