/// Configuration loading from hostpool.json and HOSTPOOL_* environment variables
use crate::config::types::{HostError, Result};
use crate::sandbox::policy::SandboxPolicy;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default file name looked up by [`HostConfig::load_default`]
pub const DEFAULT_CONFIG_FILE: &str = "hostpool.json";

const MIB: usize = 1024 * 1024;

/// Native buffer allocator limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Allocations strictly below this size use inline heap backing
    pub inline_threshold_bytes: usize,
    /// Per-allocation ceiling
    pub max_allocation_bytes: usize,
    /// Cumulative outstanding bytes allowed across the whole process
    pub process_budget_bytes: usize,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            inline_threshold_bytes: 64 * 1024,
            max_allocation_bytes: 256 * MIB,
            process_budget_bytes: 1024 * MIB,
        }
    }
}

/// Execution context pool sizing and recycling budget
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PoolConfig {
    /// Contexts created eagerly at pool construction
    pub min_idle: usize,
    /// Hard ceiling on live contexts; admission waits beyond it
    pub max_contexts: usize,
    /// How long `acquire` waits for a free context
    pub acquire_timeout_ms: u64,
    /// Lendings after which a context is retired (0 = unlimited)
    pub max_reuse: u64,
    /// Failed executions after which a context is retired (0 = unlimited)
    pub max_errors: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_idle: 2,
            max_contexts: 8,
            acquire_timeout_ms: 5_000,
            max_reuse: 1_000,
            max_errors: 3,
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

/// Cancellation bridge dispatch settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    /// Worker threads for the dispatch runtime
    pub worker_threads: usize,
    /// Hard timeout applied to every operation (0 = none)
    pub default_timeout_ms: u64,
    /// Response body cap; exceeding it fails the operation
    pub max_response_bytes: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            worker_threads: 2,
            default_timeout_ms: 30_000,
            max_response_bytes: 32 * MIB,
        }
    }
}

impl BridgeConfig {
    pub fn default_timeout(&self) -> Option<Duration> {
        if self.default_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.default_timeout_ms))
        }
    }
}

/// Full hostpool.json structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct HostConfig {
    pub allocator: AllocatorConfig,
    pub pool: PoolConfig,
    pub bridge: BridgeConfig,
    pub sandbox: SandboxPolicy,
    /// Fail fast on validation errors instead of logging them
    pub strict_mode: bool,
    /// Optional JSON-lines audit trail
    pub audit_log: Option<std::path::PathBuf>,
}

impl HostConfig {
    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| HostError::Config(format!("Failed to read config file: {}", e)))?;

        let config: HostConfig = serde_json::from_str(&content)
            .map_err(|e| HostError::Config(format!("Failed to parse config JSON: {}", e)))?;

        info!("Loaded configuration from {}", path.as_ref().display());
        Ok(config)
    }

    /// Load ./hostpool.json, falling back to built-in defaults when absent
    pub fn load_default() -> Result<Self> {
        let config_path = std::env::current_dir()
            .map_err(|e| HostError::Config(format!("Failed to get current directory: {}", e)))?
            .join(DEFAULT_CONFIG_FILE);

        if !config_path.exists() {
            warn!("{} not found, using built-in defaults", DEFAULT_CONFIG_FILE);
            return Ok(Self::default());
        }

        Self::load_from_file(config_path)
    }

    /// Apply HOSTPOOL_* overrides from the process environment
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary key lookup.
    ///
    /// Unparseable values are logged and ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, raw: Option<String>) -> Option<T> {
            let raw = raw?;
            match raw.trim().parse::<T>() {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!("Ignoring unparseable {}={:?}", key, raw);
                    None
                }
            }
        }

        macro_rules! override_field {
            ($key:literal, $field:expr) => {
                if let Some(v) = parse($key, lookup($key)) {
                    $field = v;
                }
            };
        }

        override_field!("HOSTPOOL_INLINE_THRESHOLD", self.allocator.inline_threshold_bytes);
        override_field!("HOSTPOOL_MAX_ALLOCATION", self.allocator.max_allocation_bytes);
        override_field!("HOSTPOOL_PROCESS_BUDGET", self.allocator.process_budget_bytes);
        override_field!("HOSTPOOL_MIN_IDLE", self.pool.min_idle);
        override_field!("HOSTPOOL_MAX_CONTEXTS", self.pool.max_contexts);
        override_field!("HOSTPOOL_ACQUIRE_TIMEOUT_MS", self.pool.acquire_timeout_ms);
        override_field!("HOSTPOOL_MAX_REUSE", self.pool.max_reuse);
        override_field!("HOSTPOOL_MAX_ERRORS", self.pool.max_errors);
        override_field!("HOSTPOOL_BRIDGE_THREADS", self.bridge.worker_threads);
        override_field!("HOSTPOOL_TIMEOUT_MS", self.bridge.default_timeout_ms);
        override_field!("HOSTPOOL_MAX_RESPONSE", self.bridge.max_response_bytes);

        if let Some(v) = lookup("HOSTPOOL_STRICT") {
            self.strict_mode = v != "0" && v != "false";
        }
    }
}
