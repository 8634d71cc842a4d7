//! Configuration Loader - File Loading and Validation
//!
//! Handles loading `config.toml`, validating all parameters,
//! and providing clear error messages for misconfiguration.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use super::AppConfig;

/// Load and validate configuration from a TOML file.
///
/// # Errors
/// Returns detailed error if:
/// - File doesn't exist or can't be read
/// - TOML parsing fails
/// - Validation rules are violated
pub fn load_config(path: &str) -> Result<AppConfig> {
  let path = Path::new(path);

  let content = std::fs::read_to_string(path)
    .with_context(|| format!("Failed to read config file: {}", path.display()))?;

  let config = parse_config(&content)?;

  info!(
    markets = config.markets.len(),
    starting_balance = config.accounts.starting_balance,
    max_retries = config.executor.max_retries,
    "Configuration loaded successfully"
  );

  Ok(config)
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<AppConfig> {
  let config: AppConfig =
    toml::from_str(content).with_context(|| "Failed to parse config.toml")?;
  validate_config(&config)?;
  Ok(config)
}

/// Validate all configuration parameters.
///
/// Checks for:
/// - Well-formed market seeds (unique ids, >= 2 outcomes, b > 0)
/// - Non-negative account grants
/// - Sensible backoff bounds
fn validate_config(config: &AppConfig) -> Result<()> {
  anyhow::ensure!(
    !config.service.name.trim().is_empty(),
    "service.name must not be empty"
  );

  // Market validation
  let mut seen = HashSet::new();
  for (i, market) in config.markets.iter().enumerate() {
    anyhow::ensure!(!market.id.is_empty(), "Market {} has empty id", i);
    anyhow::ensure!(
      seen.insert(market.id.as_str()),
      "Market id {} is configured twice",
      market.id
    );
    anyhow::ensure!(
      market.outcomes.len() >= 2,
      "Market {} needs at least 2 outcomes, got {}",
      market.id,
      market.outcomes.len()
    );
    anyhow::ensure!(
      market.outcomes.iter().all(|o| !o.trim().is_empty()),
      "Market {} has a blank outcome label",
      market.id
    );
    anyhow::ensure!(
      market.liquidity.is_finite() && market.liquidity > 0.0,
      "Market {} liquidity must be positive, got {}",
      market.id,
      market.liquidity
    );
  }

  // Account validation
  anyhow::ensure!(
    config.accounts.starting_balance.is_finite() && config.accounts.starting_balance >= 0.0,
    "accounts.starting_balance must be >= 0, got {}",
    config.accounts.starting_balance
  );

  // Propagator validation
  anyhow::ensure!(
    config.propagator.initial_backoff_ms > 0,
    "propagator.initial_backoff_ms must be positive"
  );
  anyhow::ensure!(
    config.propagator.max_backoff_ms >= config.propagator.initial_backoff_ms,
    "propagator.max_backoff_ms ({}) must be >= initial_backoff_ms ({})",
    config.propagator.max_backoff_ms,
    config.propagator.initial_backoff_ms
  );
  anyhow::ensure!(
    config.propagator.max_reconnect_attempts > 0,
    "propagator.max_reconnect_attempts must be positive"
  );

  // Persistence validation
  anyhow::ensure!(
    config.persistence.snapshot_interval_seconds > 0,
    "persistence.snapshot_interval_seconds must be positive"
  );
  anyhow::ensure!(
    config.persistence.change_retention > 0,
    "persistence.change_retention must be positive"
  );

  Ok(())
}
