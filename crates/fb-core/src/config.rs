//! Configuration parsing for the brokerage session.
//!
//! The runner reads its settings from a single JSON config file. Every section
//! has defaults, so an empty object `{}` is a valid config.
//!
//! # Example config
//!
//! ```json
//! {
//!   "session": { "module_name": "fb-runner", "log_path": "/tmp/log" },
//!   "marketdata": { "connections": 2, "capacity": 200, "replay_interval_ms": 100 },
//!   "reconnect": { "initial_backoff_ms": 500, "max_backoff_ms": 30000,
//!                  "trade_max_attempts": 20, "md_max_attempts": 5 },
//!   "reconciler": { "interval_ms": 1000 },
//!   "account": "9809789",
//!   "instruments": ["0050", "006208"]
//! }
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::backoff::BackoffPolicy;
use crate::error::FbError;
use crate::types::Credentials;

/// Hard upper bound on market-data connections per login.
pub const MAX_MD_CONNECTIONS: usize = 5;

/// Top-level application config, deserialized from a JSON file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    /// Module metadata (name, log path).
    #[serde(default)]
    pub session: ModuleMeta,

    /// Market-data gateway pool settings.
    #[serde(default)]
    pub marketdata: MarketDataConfig,

    /// Reconnect backoff settings.
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Order status reconciler settings.
    #[serde(default)]
    pub reconciler: ReconcilerConfig,

    /// Account number to activate after login.
    #[serde(default)]
    pub account: Option<String>,

    /// Instruments to subscribe at startup.
    #[serde(default)]
    pub instruments: Vec<String>,

    /// Login credentials. Usually injected by the caller instead.
    #[serde(default)]
    pub credentials: Option<Credentials>,
}

/// Module metadata block.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModuleMeta {
    pub module_name: Option<String>,
    pub log_path: Option<String>,
}

impl AppConfig {
    /// Returns the module name, defaulting to `"fb-runner"`.
    pub fn module_name(&self) -> String {
        self.session.module_name.clone().unwrap_or_else(|| "fb-runner".to_string())
    }

    /// Returns the log path.
    pub fn log_path(&self) -> Option<String> {
        self.session.log_path.clone()
    }

    /// Reject settings that cannot produce a working session.
    pub fn validate(&self) -> Result<(), FbError> {
        if self.marketdata.capacity == 0 {
            return Err(FbError::Config("marketdata.capacity must be positive".into()));
        }
        if self.reconciler.interval_ms == 0 {
            return Err(FbError::Config("reconciler.interval_ms must be positive".into()));
        }
        Ok(())
    }
}

/// Market-data gateway pool settings.
#[derive(Debug, Clone, Deserialize)]
pub struct MarketDataConfig {
    /// Number of market-data connections (clamped to `1..=5`).
    #[serde(default = "default_md_connections")]
    pub connections: usize,

    /// Maximum concurrent subscriptions per connection.
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Pause between resubscriptions while replaying after a reconnect.
    #[serde(default = "default_replay_interval_ms")]
    pub replay_interval_ms: u64,
}

impl MarketDataConfig {
    /// Connection count clamped to the supported range.
    pub fn effective_connections(&self) -> usize {
        self.connections.clamp(1, MAX_MD_CONNECTIONS)
    }

    pub fn replay_interval(&self) -> Duration {
        Duration::from_millis(self.replay_interval_ms)
    }
}

impl Default for MarketDataConfig {
    fn default() -> Self {
        Self {
            connections: default_md_connections(),
            capacity: default_capacity(),
            replay_interval_ms: default_replay_interval_ms(),
        }
    }
}

/// Reconnect backoff settings shared by the trading and market-data paths.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Login attempts before the trading session is declared failed.
    #[serde(default = "default_trade_max_attempts")]
    pub trade_max_attempts: u32,

    /// Connect attempts before a market-data connection is declared failed.
    #[serde(default = "default_md_max_attempts")]
    pub md_max_attempts: u32,
}

impl ReconnectConfig {
    pub fn trade_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.initial_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
            self.trade_max_attempts,
        )
    }

    pub fn md_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.initial_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
            self.md_max_attempts,
        )
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            trade_max_attempts: default_trade_max_attempts(),
            md_max_attempts: default_md_max_attempts(),
        }
    }
}

/// Order status reconciler settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconcilerConfig {
    #[serde(default = "default_reconcile_interval_ms")]
    pub interval_ms: u64,
}

impl ReconcilerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self { interval_ms: default_reconcile_interval_ms() }
    }
}

// ---------------------------------------------------------------------------
// Defaults (used by serde)
// ---------------------------------------------------------------------------

fn default_md_connections() -> usize {
    2
}

fn default_capacity() -> usize {
    200
}

fn default_replay_interval_ms() -> u64 {
    100
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_trade_max_attempts() -> u32 {
    20
}

fn default_md_max_attempts() -> u32 {
    5
}

fn default_reconcile_interval_ms() -> u64 {
    1_000
}

/// Load and parse a JSON config file.
pub fn load_config(path: &std::path::Path) -> anyhow::Result<AppConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: AppConfig = serde_json::from_str(&content)?;
    config.validate()?;
    Ok(config)
}
