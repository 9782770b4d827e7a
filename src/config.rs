//! Configuration for the chunk store, auto-linker and execution sessions
//!
//! Every struct deserializes with defaults, so a partial TOML file (or none
//! at all) is valid. Environment variables override file values.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{MeridianError, Result};

/// Default ceiling for any single sandbox value (10 MiB)
pub const DEFAULT_MAX_VALUE_BYTES: usize = 10 * 1024 * 1024;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeridianConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub linker: LinkerConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

/// Configuration for the storage engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to SQLite database (":memory:" for an ephemeral store)
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Storage mode (local or cloud-safe)
    #[serde(default)]
    pub storage_mode: StorageMode,
    /// Confidence assigned when the caller gives none
    #[serde(default = "default_confidence")]
    pub default_confidence: f32,
}

fn default_db_path() -> String {
    ":memory:".to_string()
}

fn default_confidence() -> f32 {
    0.7
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            storage_mode: StorageMode::default(),
            default_confidence: default_confidence(),
        }
    }
}

/// Storage mode for SQLite
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StorageMode {
    #[default]
    Local,
    CloudSafe,
}

impl StorageMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageMode::Local => "local",
            StorageMode::CloudSafe => "cloud-safe",
        }
    }
}

impl std::str::FromStr for StorageMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" | "wal" => Ok(StorageMode::Local),
            "cloud-safe" | "cloud_safe" | "cloudsafe" => Ok(StorageMode::CloudSafe),
            _ => Err(format!("Unknown storage mode: {}", s)),
        }
    }
}

/// Auto-linker tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkerConfig {
    /// Recency window for `follows` links, in seconds
    #[serde(default = "default_temporal_window_secs")]
    pub temporal_window_secs: u64,
    /// How many of the most recent predecessors a new chunk follows
    #[serde(default = "default_max_predecessors")]
    pub max_predecessors: usize,
    /// Shared tags required for a `related_to` link
    #[serde(default = "default_min_shared_tags")]
    pub min_shared_tags: usize,
    /// Upper bound on candidates inspected per pass
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,
}

fn default_temporal_window_secs() -> u64 {
    5 * 60
}

fn default_max_predecessors() -> usize {
    1
}

fn default_min_shared_tags() -> usize {
    2
}

fn default_max_candidates() -> usize {
    200
}

impl Default for LinkerConfig {
    fn default() -> Self {
        Self {
            temporal_window_secs: default_temporal_window_secs(),
            max_predecessors: default_max_predecessors(),
            min_shared_tags: default_min_shared_tags(),
            max_candidates: default_max_candidates(),
        }
    }
}

impl LinkerConfig {
    pub fn temporal_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.temporal_window_secs as i64)
    }
}

/// Budgets and limits for one execution session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Maximum recursive-query calls per session
    #[serde(default = "default_max_recursion")]
    pub max_recursion: usize,
    /// Wall-clock budget for the whole session, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Maximum code steps (executed snippets) per session
    #[serde(default = "default_max_code_steps")]
    pub max_code_steps: usize,
    /// Ceiling for any single value built by sandboxed code
    #[serde(default = "default_max_value_bytes")]
    pub max_value_bytes: usize,
    /// Ceiling for a snippet's source text
    #[serde(default = "default_max_snippet_bytes")]
    pub max_snippet_bytes: usize,
    /// Maximum nesting depth of a parsed snippet
    #[serde(default = "default_max_nesting_depth")]
    pub max_nesting_depth: usize,
    /// Limit used when `search_chunks` is called without one
    #[serde(default = "default_search_limit")]
    pub default_search_limit: usize,
    /// Hard cap on nodes returned by `traverse_chunks`
    #[serde(default = "default_max_traversal_nodes")]
    pub max_traversal_nodes: usize,
}

fn default_max_recursion() -> usize {
    10
}

fn default_timeout_ms() -> u64 {
    60_000
}

fn default_max_code_steps() -> usize {
    20
}

fn default_max_value_bytes() -> usize {
    DEFAULT_MAX_VALUE_BYTES
}

fn default_max_snippet_bytes() -> usize {
    64 * 1024
}

fn default_max_nesting_depth() -> usize {
    48
}

fn default_search_limit() -> usize {
    10
}

fn default_max_traversal_nodes() -> usize {
    200
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_recursion: default_max_recursion(),
            timeout_ms: default_timeout_ms(),
            max_code_steps: default_max_code_steps(),
            max_value_bytes: default_max_value_bytes(),
            max_snippet_bytes: default_max_snippet_bytes(),
            max_nesting_depth: default_max_nesting_depth(),
            default_search_limit: default_search_limit(),
            max_traversal_nodes: default_max_traversal_nodes(),
        }
    }
}

impl SessionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn with_max_recursion(mut self, max_recursion: usize) -> Self {
        self.max_recursion = max_recursion;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_code_steps(mut self, max_code_steps: usize) -> Self {
        self.max_code_steps = max_code_steps;
        self
    }

    pub fn with_max_value_bytes(mut self, max_value_bytes: usize) -> Self {
        self.max_value_bytes = max_value_bytes;
        self
    }
}

impl MeridianConfig {
    /// Parse a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: MeridianConfig =
            toml::from_str(s).map_err(|e| MeridianError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `MERIDIAN_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = MeridianConfig::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `MERIDIAN_*` environment variables on top of the current values
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("MERIDIAN_DB_PATH") {
            self.storage.db_path = path;
        }
        if let Some(mode) = lookup("MERIDIAN_STORAGE_MODE") {
            self.storage.storage_mode = mode.parse().map_err(MeridianError::Config)?;
        }
        if let Some(v) = lookup("MERIDIAN_TEMPORAL_WINDOW_SECS") {
            self.linker.temporal_window_secs = parse_env("MERIDIAN_TEMPORAL_WINDOW_SECS", &v)?;
        }
        if let Some(v) = lookup("MERIDIAN_MAX_RECURSION") {
            self.session.max_recursion = parse_env("MERIDIAN_MAX_RECURSION", &v)?;
        }
        if let Some(v) = lookup("MERIDIAN_SESSION_TIMEOUT_SECS") {
            let secs: u64 = parse_env("MERIDIAN_SESSION_TIMEOUT_SECS", &v)?;
            self.session.timeout_ms = secs.saturating_mul(1000);
        }
        if let Some(v) = lookup("MERIDIAN_MAX_CODE_STEPS") {
            self.session.max_code_steps = parse_env("MERIDIAN_MAX_CODE_STEPS", &v)?;
        }
        if let Some(v) = lookup("MERIDIAN_MAX_VALUE_BYTES") {
            self.session.max_value_bytes = parse_env("MERIDIAN_MAX_VALUE_BYTES", &v)?;
        }
        Ok(())
    }

    /// Reject configurations that would make every session fail
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.storage.default_confidence) {
            return Err(MeridianError::Config(format!(
                "default_confidence must be within [0.0, 1.0], got {}",
                self.storage.default_confidence
            )));
        }
        if self.linker.max_candidates == 0 {
            return Err(MeridianError::Config(
                "linker.max_candidates must be at least 1".into(),
            ));
        }
        if self.session.timeout_ms == 0 {
            return Err(MeridianError::Config(
                "session.timeout_ms must be non-zero".into(),
            ));
        }
        if self.session.max_code_steps == 0 {
            return Err(MeridianError::Config(
                "session.max_code_steps must be at least 1".into(),
            ));
        }
        if self.session.max_value_bytes < 1024 {
            return Err(MeridianError::Config(
                "session.max_value_bytes must be at least 1024".into(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| MeridianError::Config(format!("{} has an invalid value: {}", key, value)))
}
