//! Daemon configuration

use adaptest_common::{Error, ResourceLimits, Result, DEFAULT_ADAPTATION_PENALTY};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Store directory path
    pub store_path: PathBuf,

    /// Directory scanned for YAML test cases
    pub specs_dir: PathBuf,

    /// Sandbox pool configuration
    pub pool: PoolConfig,

    /// Execution engine configuration
    pub engine: EngineConfig,

    /// Container runtime configuration
    pub runtime: RuntimeConfig,

    /// Step validator/adapter configuration
    pub advisor: AdvisorConfig,

    /// Reliability scoring configuration
    pub reliability: ReliabilityConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            store_path: adaptest_common::default_store_path(),
            specs_dir: PathBuf::from("tests/cases"),
            pool: PoolConfig::default(),
            engine: EngineConfig::default(),
            runtime: RuntimeConfig::default(),
            advisor: AdvisorConfig::default(),
            reliability: ReliabilityConfig::default(),
        }
    }
}

/// Sandbox pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of sandboxes, idle or busy
    pub max_size: usize,

    /// Idle sandboxes kept warm by the health monitor
    pub min_idle: usize,

    /// Sandbox image
    pub image: String,

    /// Reset the browser context when a sandbox is handed out
    pub reset_on_allocate: bool,

    /// Reset the browser context when a sandbox is returned
    pub reset_on_release: bool,

    /// Seconds between health probes
    pub health_interval_secs: u64,

    /// Consecutive failed probes before a sandbox is quarantined
    pub unhealthy_threshold: u32,

    /// Allocations older than this are force-released
    pub stale_allocation_timeout_secs: u64,

    /// How long `acquire` waits for a free sandbox
    pub acquire_timeout_secs: u64,

    /// Poll interval for `acquire` when no release wakes it
    pub acquire_backoff_ms: u64,

    /// Per-sandbox resource limits
    pub resources: ResourceLimits,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 4,
            min_idle: 0,
            image: "mcr.microsoft.com/playwright:v1.48.0-jammy".to_string(),
            reset_on_allocate: false,
            reset_on_release: true,
            health_interval_secs: 15,
            unhealthy_threshold: 3,
            stale_allocation_timeout_secs: 1800,
            acquire_timeout_secs: 300,
            acquire_backoff_ms: 500,
            resources: ResourceLimits::default(),
        }
    }
}

impl PoolConfig {
    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    pub fn stale_allocation_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_allocation_timeout_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn acquire_backoff(&self) -> Duration {
        Duration::from_millis(self.acquire_backoff_ms)
    }
}

/// What happens to the rest of a run after a step fails unrecoverably
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop the run, mark remaining steps skipped
    Abort,
    /// Keep executing later steps; the run still ends failed
    Continue,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self::Abort
    }
}

/// Execution engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Adaptations allowed per run before it fails
    pub max_adaptations: u32,

    pub failure_policy: FailurePolicy,

    /// Upper bound on a single action execution
    pub step_timeout_secs: u64,

    /// A "valid" verdict below this confidence is treated as invalid
    pub validation_confidence_threshold: f64,

    pub retry: RetryConfig,

    pub recovery: RecoveryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_adaptations: 5,
            failure_policy: FailurePolicy::Abort,
            step_timeout_secs: 30,
            validation_confidence_threshold: 0.0,
            retry: RetryConfig::default(),
            recovery: RecoveryConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    /// Apply per-job overrides
    pub fn with_overrides(&self, overrides: &RunOverrides) -> Self {
        let mut config = self.clone();
        if let Some(max) = overrides.max_adaptations {
            config.max_adaptations = max;
        }
        if let Some(policy) = overrides.failure_policy {
            config.failure_policy = policy;
        }
        if let Some(secs) = overrides.step_timeout_secs {
            config.step_timeout_secs = secs;
        }
        config
    }
}

/// Bounded retry with exponential backoff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Randomise each delay by up to this fraction
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 250,
            max_delay_ms: 5000,
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

/// Recovery strategy tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Attempts made by the wait-and-retry strategy
    pub wait_attempts: u32,
    /// Wait before each wait-and-retry attempt
    pub wait_ms: u64,
    /// Candidates tried by the alternative-selector strategy
    pub max_alternative_selectors: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            wait_attempts: 3,
            wait_ms: 1000,
            max_alternative_selectors: 3,
        }
    }
}

/// Container runtime configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// `docker` or `podman`; auto-detected when unset
    pub binary: Option<String>,

    /// Driver executable inside the sandbox image
    pub driver_command: String,

    /// Port the in-sandbox automation endpoint listens on
    pub debug_port: u16,

    /// Timeout for a single runtime CLI call
    pub command_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            binary: None,
            driver_command: "adaptest-driver".to_string(),
            debug_port: 9222,
            command_timeout_secs: 60,
        }
    }
}

/// Which step advisor backs validation and adaptation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvisorKind {
    Http,
    Heuristic,
}

/// Step validator/adapter configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvisorConfig {
    pub kind: AdvisorKind,
    pub endpoint: String,
    pub timeout_secs: u64,
}

impl Default for AdvisorConfig {
    fn default() -> Self {
        Self {
            kind: AdvisorKind::Heuristic,
            endpoint: "http://127.0.0.1:8700".to_string(),
            timeout_secs: 30,
        }
    }
}

/// Reliability scoring configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReliabilityConfig {
    /// Coefficient on the adaptation rate
    pub adaptation_penalty: f64,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            adaptation_penalty: DEFAULT_ADAPTATION_PENALTY,
        }
    }
}

/// Per-job overrides carried by a job request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOverrides {
    pub max_adaptations: Option<u32>,
    pub failure_policy: Option<FailurePolicy>,
    pub step_timeout_secs: Option<u64>,
}

impl DaemonConfig {
    /// Load configuration from file
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject configurations the pool or engine cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.pool.max_size == 0 {
            return Err(Error::InvalidConfig("pool.max_size must be at least 1".into()));
        }
        if self.pool.min_idle > self.pool.max_size {
            return Err(Error::InvalidConfig(
                "pool.min_idle must not exceed pool.max_size".into(),
            ));
        }
        if self.pool.unhealthy_threshold == 0 {
            return Err(Error::InvalidConfig(
                "pool.unhealthy_threshold must be at least 1".into(),
            ));
        }
        if self.engine.retry.max_attempts == 0 {
            return Err(Error::InvalidConfig(
                "engine.retry.max_attempts must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.engine.validation_confidence_threshold) {
            return Err(Error::InvalidConfig(
                "engine.validation_confidence_threshold must be within [0, 1]".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.reliability.adaptation_penalty) {
            return Err(Error::InvalidConfig(
                "reliability.adaptation_penalty must be within [0, 1]".into(),
            ));
        }
        Ok(())
    }

    /// Get the database path
    pub fn db_path(&self) -> PathBuf {
        self.store_path.join("state.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: DaemonConfig = toml::from_str(
            r#"
            [pool]
            max_size = 2
            reset_on_allocate = true

            [engine]
            max_adaptations = 1
            failure_policy = "continue"

            [engine.retry]
            max_attempts = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.pool.max_size, 2);
        assert!(config.pool.reset_on_allocate);
        assert!(config.pool.reset_on_release);
        assert_eq!(config.engine.failure_policy, FailurePolicy::Continue);
        assert_eq!(config.engine.retry.max_attempts, 5);
        assert_eq!(config.engine.retry.base_delay_ms, 250);
        assert_eq!(config.reliability.adaptation_penalty, 0.3);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_empty_pool() {
        let mut config = DaemonConfig::default();
        config.pool.max_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overrides() {
        let base = EngineConfig::default();
        let merged = base.with_overrides(&RunOverrides {
            max_adaptations: Some(0),
            failure_policy: Some(FailurePolicy::Continue),
            step_timeout_secs: None,
        });
        assert_eq!(merged.max_adaptations, 0);
        assert_eq!(merged.failure_policy, FailurePolicy::Continue);
        assert_eq!(merged.step_timeout_secs, base.step_timeout_secs);
    }

    #[test]
    fn test_db_path_follows_store_path() {
        let mut config = DaemonConfig::default();
        assert_eq!(config.db_path(), config.store_path.join("state.db"));

        config.store_path = PathBuf::from("/var/lib/adaptest");
        assert_eq!(config.db_path(), PathBuf::from("/var/lib/adaptest/state.db"));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = DaemonConfig::default();
        config.pool.max_size = 7;
        config.save(&path).unwrap();

        let loaded = DaemonConfig::load(&path).unwrap();
        assert_eq!(loaded.pool, config.pool);
        assert_eq!(loaded.engine, config.engine);
    }
}
