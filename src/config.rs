use figment::{
  providers::{Env, Format, Serialized, Toml},
  Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

// Wire-protocol constants, must match the canonical server exactly.
pub const DEFAULT_PORT: u16 = 8126;
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const DEFAULT_UPSTREAM: &str = "https://dojo.nplusplus.ninja";
/// Path prefix the game client inserts between pack and operation.
pub const CANONICAL_PREFIX: &str = "prod/steam";
/// Read timeout applied to forwarded upstream requests.
pub const UPSTREAM_READ_TIMEOUT_SECS: u64 = 5;

/// Top-level configuration (`scorekeeper.toml` + `SCOREKEEPER_*` env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub gateway: GatewayConfig,
  #[serde(default)]
  pub scheduler: SchedulerConfig,
}

impl Config {
  /// Load configuration by merging, in increasing precedence:
  /// built-in defaults, the given TOML file (if any), and
  /// `SCOREKEEPER_*` environment variables (`__` separates nesting).
  pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(Config::default()));
    if let Some(path) = path {
      figment = figment.merge(Toml::file(path));
    }
    let config: Config = figment
      .merge(Env::prefixed("SCOREKEEPER_").split("__"))
      .extract()?;
    if config.gateway.bind.parse::<std::net::IpAddr>().is_err() {
      return Err(ConfigError::InvalidBind(config.gateway.bind.clone()));
    }
    Ok(config)
  }
}

/// Settings for the leaderboard protocol gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
  #[serde(default = "default_bind")]
  pub bind: String,
  #[serde(default = "default_port")]
  pub port: u16,
  /// Base URL of the canonical upstream server.
  #[serde(default = "default_upstream")]
  pub upstream: String,
  /// When false, requests that would be forwarded get an empty 400 instead.
  #[serde(default = "bool_true")]
  pub forward: bool,
  /// Path prefix stripped between the pack segment and the operation.
  #[serde(default = "default_prefix")]
  pub canonical_prefix: String,
  /// Hard cap on request body size, in bytes.
  #[serde(default = "default_max_body")]
  pub max_body_bytes: usize,
}

impl Default for GatewayConfig {
  fn default() -> Self {
    Self {
      bind: default_bind(),
      port: default_port(),
      upstream: default_upstream(),
      forward: true,
      canonical_prefix: default_prefix(),
      max_body_bytes: default_max_body(),
    }
  }
}

/// Settings for the background scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
  /// Pause at the top of every loop iteration, preventing hot loops when a
  /// schedule resolves to "now" repeatedly.
  #[serde(default = "default_spacing")]
  pub spacing_ms: u64,
  /// Initial backoff after a loop-bookkeeping error.
  #[serde(default = "default_backoff")]
  pub retry_backoff_ms: u64,
  /// Ceiling the backoff doubles up to.
  #[serde(default = "default_backoff_max")]
  pub retry_backoff_max_ms: u64,
  /// Warn when persisted-schedule catch-up skips more than this many runs.
  #[serde(default = "default_missed_warn")]
  pub missed_runs_warn: u32,
}

impl Default for SchedulerConfig {
  fn default() -> Self {
    Self {
      spacing_ms: default_spacing(),
      retry_backoff_ms: default_backoff(),
      retry_backoff_max_ms: default_backoff_max(),
      missed_runs_warn: default_missed_warn(),
    }
  }
}

fn default_bind() -> String {
  DEFAULT_BIND.to_string()
}
fn default_port() -> u16 {
  DEFAULT_PORT
}
fn default_upstream() -> String {
  DEFAULT_UPSTREAM.to_string()
}
fn default_prefix() -> String {
  CANONICAL_PREFIX.to_string()
}
fn default_max_body() -> usize {
  4 * 1024 * 1024
}
fn default_spacing() -> u64 {
  250
}
fn default_backoff() -> u64 {
  500
}
fn default_backoff_max() -> u64 {
  30_000
}
fn default_missed_warn() -> u32 {
  24
}
fn bool_true() -> bool {
  true
}
