//! Configuration Module - TOML-based Service Configuration
//!
//! Loads and validates configuration from `config.toml`. Market seeds,
//! account grants, retry budgets and feed backoff are all externalized
//! here - nothing is hardcoded in the use-case layer.

pub mod loader;

use serde::Deserialize;

/// Top-level service configuration.
///
/// Loaded from `config.toml` at startup. All fields are validated
/// before the service begins operation.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
  /// Service identity and logging.
  pub service: ServiceConfig,
  /// Markets created at startup if absent.
  #[serde(default)]
  pub markets: Vec<MarketSeed>,
  /// Account opening parameters.
  #[serde(default)]
  pub accounts: AccountsConfig,
  /// Trade executor tuning.
  #[serde(default)]
  pub executor: ExecutorConfig,
  /// Change propagator tuning.
  #[serde(default)]
  pub propagator: PropagatorConfig,
  /// Metrics and monitoring.
  #[serde(default)]
  pub metrics: MetricsConfig,
  /// Persistence configuration.
  #[serde(default)]
  pub persistence: PersistenceConfig,
}

/// Service identity configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
  /// Human-readable service name.
  pub name: String,
  /// Log level (trace, debug, info, warn, error).
  #[serde(default = "default_log_level")]
  pub log_level: String,
}

/// A market to create at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct MarketSeed {
  /// Stable market identifier.
  pub id: String,
  /// Market question.
  pub question: String,
  /// Outcome labels (at least two).
  pub outcomes: Vec<String>,
  /// LMSR liquidity parameter (b).
  #[serde(default = "default_liquidity")]
  pub liquidity: f64,
}

/// Account opening configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountsConfig {
  /// Token grant for a newly opened account.
  #[serde(default = "default_starting_balance")]
  pub starting_balance: f64,
}

/// Trade executor configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
  /// Retries after a compare-and-swap conflict before giving up.
  #[serde(default = "default_max_retries")]
  pub max_retries: u32,
  /// Base delay between conflict retries (milliseconds).
  #[serde(default = "default_retry_backoff")]
  pub retry_backoff_ms: u64,
}

/// Change propagator configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PropagatorConfig {
  /// First reconnect delay (milliseconds).
  #[serde(default = "default_initial_backoff")]
  pub initial_backoff_ms: u64,
  /// Reconnect delay ceiling (milliseconds).
  #[serde(default = "default_max_backoff")]
  pub max_backoff_ms: u64,
  /// Consecutive failed reconnects before reporting unhealthy.
  #[serde(default = "default_max_reconnect_attempts")]
  pub max_reconnect_attempts: u32,
}

/// Metrics and monitoring configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
  /// Enable Prometheus metrics export.
  #[serde(default = "default_true")]
  pub enabled: bool,
  /// Metrics server bind address.
  #[serde(default = "default_metrics_addr")]
  pub bind_address: String,
  /// Health check endpoint port.
  #[serde(default = "default_health_port")]
  pub health_port: u16,
}

/// Persistence configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
  /// Directory for store snapshots.
  #[serde(default = "default_data_dir")]
  pub data_dir: String,
  /// Snapshot interval (seconds).
  #[serde(default = "default_snapshot_interval")]
  pub snapshot_interval_seconds: u64,
  /// Change-log entries retained for resuming feed cursors.
  #[serde(default = "default_change_retention")]
  pub change_retention: usize,
}

impl Default for AppConfig {
  fn default() -> Self {
    Self {
      service: ServiceConfig::default(),
      markets: Vec::new(),
      accounts: AccountsConfig::default(),
      executor: ExecutorConfig::default(),
      propagator: PropagatorConfig::default(),
      metrics: MetricsConfig::default(),
      persistence: PersistenceConfig::default(),
    }
  }
}

impl Default for ServiceConfig {
  fn default() -> Self {
    Self {
      name: "lmsr-exchange".to_string(),
      log_level: default_log_level(),
    }
  }
}

impl Default for AccountsConfig {
  fn default() -> Self {
    Self {
      starting_balance: default_starting_balance(),
    }
  }
}

impl Default for ExecutorConfig {
  fn default() -> Self {
    Self {
      max_retries: default_max_retries(),
      retry_backoff_ms: default_retry_backoff(),
    }
  }
}

impl Default for PropagatorConfig {
  fn default() -> Self {
    Self {
      initial_backoff_ms: default_initial_backoff(),
      max_backoff_ms: default_max_backoff(),
      max_reconnect_attempts: default_max_reconnect_attempts(),
    }
  }
}

impl Default for MetricsConfig {
  fn default() -> Self {
    Self {
      enabled: default_true(),
      bind_address: default_metrics_addr(),
      health_port: default_health_port(),
    }
  }
}

impl Default for PersistenceConfig {
  fn default() -> Self {
    Self {
      data_dir: default_data_dir(),
      snapshot_interval_seconds: default_snapshot_interval(),
      change_retention: default_change_retention(),
    }
  }
}

// Default value functions for serde

fn default_log_level() -> String {
  "info".to_string()
}

fn default_true() -> bool {
  true
}

fn default_liquidity() -> f64 {
  100.0
}

fn default_starting_balance() -> f64 {
  1000.0
}

fn default_max_retries() -> u32 {
  3
}

fn default_retry_backoff() -> u64 {
  5
}

fn default_initial_backoff() -> u64 {
  250
}

fn default_max_backoff() -> u64 {
  10_000
}

fn default_max_reconnect_attempts() -> u32 {
  8
}

fn default_metrics_addr() -> String {
  "0.0.0.0:9090".to_string()
}

fn default_health_port() -> u16 {
  8080
}

fn default_data_dir() -> String {
  "data".to_string()
}

fn default_snapshot_interval() -> u64 {
  60
}

fn default_change_retention() -> usize {
  100_000
}
