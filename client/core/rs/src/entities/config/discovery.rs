use serde::Deserialize;

use crate::entities::logger::{LogLevel, StdioLogMode};

/// # Jiji Discovery Environment Variables
///
/// The discovery daemon is configured by environment only.
#[derive(Debug, Clone, Deserialize)]
pub struct Env {
  /// Comma separated list of `host:port` udp listeners. Required.
  pub jiji_listen_addr: String,
  /// The state store http api address.
  /// default: `http://127.0.0.1:31220`
  #[serde(default = "default_corrosion_api")]
  pub jiji_corrosion_api: String,
  /// The suffix under which lookups are answered authoritatively.
  /// default: `jiji`
  #[serde(default = "default_service_domain")]
  pub jiji_service_domain: String,
  /// TTL in seconds on answered records. default: 60
  #[serde(default = "default_dns_ttl")]
  pub jiji_dns_ttl: u32,
  /// Base reconnect backoff in milliseconds. default: 5000
  #[serde(default = "default_reconnect_interval")]
  pub jiji_reconnect_interval: u64,
  /// Reconnect attempts before giving up.
  /// 0 means unlimited. default: 0
  #[serde(default)]
  pub jiji_max_reconnect_attempts: u32,

  // LOGGING
  /// Override `logging.level`
  #[serde(default)]
  pub jiji_logging_level: Option<LogLevel>,
  /// Override `logging.stdio`
  #[serde(default)]
  pub jiji_logging_stdio: Option<StdioLogMode>,
  /// Override `logging.pretty`
  #[serde(default)]
  pub jiji_logging_pretty: Option<bool>,
}

pub fn default_corrosion_api() -> String {
  String::from("http://127.0.0.1:31220")
}

pub fn default_service_domain() -> String {
  String::from("jiji")
}

pub fn default_dns_ttl() -> u32 {
  60
}

pub fn default_reconnect_interval() -> u64 {
  5000
}
