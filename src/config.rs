//! Configuration System
//!
//! Provides hierarchical configuration loading from:
//! - constellation.toml (default configuration)
//! - constellation.local.toml (git-ignored local overrides)
//! - Environment variables (CONSTELLATION_* prefix)
//!
//! ## Example
//!
//! ```toml
//! # constellation.toml
//! [engine]
//! worker_threads = 8
//! default_module_timeout_ms = 30000
//!
//! [conversion]
//! max_payload_bytes = 104857600
//! ```
//!
//! Environment variable overrides:
//! ```bash
//! CONSTELLATION_ENGINE__WORKER_THREADS=4
//! CONSTELLATION_CONVERSION__MAX_NESTING_DEPTH=100
//! ```

use crate::value::ConversionLimits;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub conversion: ConversionConfig,
    #[serde(default)]
    pub suspend: SuspendConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Process-wide boundary checking mode.
///
/// The engine executes correctly in `Off`: the checks are redundant by
/// construction when the compiler has done its job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DebugMode {
    /// No boundary checks
    Off,
    /// Log violations, keep going
    ErrorsOnly,
    /// Convert violations into typed errors
    Full,
}

impl Default for DebugMode {
    fn default() -> Self {
        DebugMode::Off
    }
}

/// Execution engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Worker parallelism for module bodies (0 = all available cores)
    #[serde(default)]
    pub worker_threads: usize,

    /// Default module body timeout when neither the module config nor the
    /// call options set one
    #[serde(default = "default_module_timeout_ms")]
    pub default_module_timeout_ms: u64,

    /// Default wait for a module's inputs
    #[serde(default = "default_inputs_timeout_ms")]
    pub default_inputs_timeout_ms: u64,

    /// Whole-execution timeout (0 = none)
    #[serde(default)]
    pub global_timeout_ms: u64,

    /// Boundary type-check mode
    #[serde(default)]
    pub debug_mode: DebugMode,

    /// Result-cache capacity in entries
    #[serde(default = "default_cache_entries")]
    pub max_cache_entries: usize,
}

/// JSON conversion limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionConfig {
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,

    #[serde(default = "default_max_array_elements")]
    pub max_array_elements: usize,

    #[serde(default = "default_max_nesting_depth")]
    pub max_nesting_depth: usize,

    #[serde(default = "default_lazy_threshold_bytes")]
    pub lazy_threshold_bytes: usize,

    #[serde(default = "default_streaming_threshold_bytes")]
    pub streaming_threshold_bytes: usize,
}

/// Suspension store configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SuspendConfig {
    /// Directory for persisted snapshots (unset = in-memory only)
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

/// Logging configuration
///
/// Consumed by hosts installing a tracing subscriber; the engine itself
/// only emits events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_module_timeout_ms() -> u64 {
    30_000
}
fn default_inputs_timeout_ms() -> u64 {
    60_000
}
fn default_cache_entries() -> usize {
    10_000
}
fn default_max_payload_bytes() -> usize {
    100 * 1024 * 1024
}
fn default_max_array_elements() -> usize {
    1_000_000
}
fn default_max_nesting_depth() -> usize {
    50
}
fn default_lazy_threshold_bytes() -> usize {
    10 * 1024
}
fn default_streaming_threshold_bytes() -> usize {
    100 * 1024
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            worker_threads: 0,
            default_module_timeout_ms: default_module_timeout_ms(),
            default_inputs_timeout_ms: default_inputs_timeout_ms(),
            global_timeout_ms: 0,
            debug_mode: DebugMode::default(),
            max_cache_entries: default_cache_entries(),
        }
    }
}

impl Default for ConversionConfig {
    fn default() -> Self {
        ConversionConfig {
            max_payload_bytes: default_max_payload_bytes(),
            max_array_elements: default_max_array_elements(),
            max_nesting_depth: default_max_nesting_depth(),
            lazy_threshold_bytes: default_lazy_threshold_bytes(),
            streaming_threshold_bytes: default_streaming_threshold_bytes(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Merges in order:
    /// 1. constellation.toml (base configuration)
    /// 2. constellation.local.toml (local overrides, git-ignored)
    /// 3. Environment variables (CONSTELLATION_* prefix)
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file("constellation.toml"))
            .merge(Toml::file("constellation.local.toml"))
            .merge(Env::prefixed("CONSTELLATION_").split("__"))
            .extract()
    }

    /// Load configuration from a specific file path
    pub fn from_file(path: &str) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("CONSTELLATION_").split("__"))
            .extract()
    }
}

impl EngineConfig {
    /// Effective worker count (resolves 0 to the core count).
    pub fn effective_workers(&self) -> usize {
        if self.worker_threads == 0 {
            num_cpus::get()
        } else {
            self.worker_threads
        }
    }

    pub fn default_module_timeout(&self) -> Duration {
        Duration::from_millis(self.default_module_timeout_ms)
    }

    pub fn default_inputs_timeout(&self) -> Duration {
        Duration::from_millis(self.default_inputs_timeout_ms)
    }

    pub fn global_timeout(&self) -> Option<Duration> {
        if self.global_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.global_timeout_ms))
        }
    }
}

impl ConversionConfig {
    /// Lower into the value layer's limit record.
    pub fn limits(&self) -> ConversionLimits {
        ConversionLimits {
            max_payload_bytes: self.max_payload_bytes,
            max_array_elements: self.max_array_elements,
            max_nesting_depth: self.max_nesting_depth,
            lazy_threshold_bytes: self.lazy_threshold_bytes,
            streaming_threshold_bytes: self.streaming_threshold_bytes,
        }
    }
}
