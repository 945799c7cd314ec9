use std::{net::SocketAddr, time::Duration};

use anyhow::Context;
use jiji_client::entities::{
  config::discovery::Env,
  logger::LogConfig,
};

/// The resolved daemon configuration. Built once in main from an
/// explicit [Env] and passed down; nothing reads the process
/// environment past construction.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
  pub listeners: Vec<SocketAddr>,
  pub corrosion_api: String,
  /// Lowercased service domain suffix.
  pub service_domain: String,
  pub dns_ttl: u32,
  pub reconnect_interval: Duration,
  pub max_reconnect_attempts: u32,
  pub logging: LogConfig,
}

impl DiscoveryConfig {
  pub fn from_env() -> anyhow::Result<DiscoveryConfig> {
    let env: Env = envy::from_env().context(
      "Failed to parse discovery environment. Is JIJI_LISTEN_ADDR set?",
    )?;
    DiscoveryConfig::resolve(env)
  }

  /// Validate and resolve an environment into the frozen config.
  pub fn resolve(env: Env) -> anyhow::Result<DiscoveryConfig> {
    let mut listeners = Vec::new();
    for addr in env
      .jiji_listen_addr
      .split(',')
      .map(str::trim)
      .filter(|addr| !addr.is_empty())
    {
      let addr = addr.parse::<SocketAddr>().with_context(|| {
        format!("Invalid listener address '{addr}'")
      })?;
      listeners.push(addr);
    }
    if listeners.is_empty() {
      return Err(anyhow::anyhow!(
        "JIJI_LISTEN_ADDR did not contain any listener"
      ));
    }
    Ok(DiscoveryConfig {
      listeners,
      corrosion_api: env.jiji_corrosion_api,
      service_domain: env.jiji_service_domain.to_lowercase(),
      dns_ttl: env.jiji_dns_ttl,
      reconnect_interval: Duration::from_millis(
        env.jiji_reconnect_interval,
      ),
      max_reconnect_attempts: env.jiji_max_reconnect_attempts,
      logging: LogConfig {
        level: env.jiji_logging_level.unwrap_or_default(),
        stdio: env.jiji_logging_stdio.unwrap_or_default(),
        pretty: env.jiji_logging_pretty.unwrap_or_default(),
      },
    })
  }
}
