use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use jiji_client::entities::config::{
  DeployConfig, KNOWN_TOP_LEVEL_KEYS, ResolvedConfig,
  cli::{CliArgs, Env},
};
use jiji_client::entities::logger::{LogConfig, LogLevel};

/// The explicit configuration sources of one cli invocation:
/// parsed args and environment, built once in main and passed
/// down. Nothing reads the process environment past this point.
pub struct CliContext {
  pub args: CliArgs,
  pub env: Env,
}

impl CliContext {
  pub fn from_env() -> anyhow::Result<CliContext> {
    Ok(CliContext {
      args: CliArgs::parse(),
      env: envy::from_env()
        .context("Failed to parse jiji CLI environment")?,
    })
  }

  pub fn log_config(&self) -> LogConfig {
    LogConfig {
      level: self
        .args
        .log_level
        .map(LogLevel::from)
        .or(self.env.jiji_logging_level)
        .unwrap_or_default(),
      stdio: self.env.jiji_logging_stdio.unwrap_or_default(),
      pretty: self.env.jiji_logging_pretty.unwrap_or_default(),
    }
  }

  /// The deploy file path in play: explicit override, or
  /// `.jiji/deploy.yml` / `.jiji/deploy.<env>.yml`.
  pub fn deploy_file_path(&self) -> PathBuf {
    if let Some(path) = self
      .args
      .config_path
      .clone()
      .or(self.env.jiji_config_path.clone())
    {
      return path;
    }
    match self.args.env.as_ref().or(self.env.jiji_env.as_ref()) {
      Some(environment) => {
        PathBuf::from(format!(".jiji/deploy.{environment}.yml"))
      }
      None => PathBuf::from(".jiji/deploy.yml"),
    }
  }

  /// Load, validate and resolve the deploy file.
  /// The returned warnings cover unknown top-level keys.
  pub fn load_deploy_config(
    &self,
  ) -> anyhow::Result<(ResolvedConfig, Vec<String>)> {
    let path = self.deploy_file_path();
    if !path.is_file() {
      return Err(anyhow::anyhow!(
        "No deploy file found at {}",
        path.display()
      ));
    }
    let map = (config::ConfigLoader {
      paths: &[&path],
      match_wildcards: &[],
      merge_nested: true,
      extend_array: true,
      debug_print: false,
    })
    .load_map()
    .with_context(|| {
      format!("Failed to load deploy file at {}", path.display())
    })?;
    let warnings = map
      .keys()
      .filter(|key| !KNOWN_TOP_LEVEL_KEYS.contains(&key.as_str()))
      .map(|key| {
        format!(
          "Unknown key '{key}' in {} is ignored",
          path.display()
        )
      })
      .collect::<Vec<_>>();
    let mut config: DeployConfig =
      serde_json::from_value(serde_json::Value::Object(map))
        .with_context(|| {
          format!(
            "Failed to parse deploy file at {}",
            path.display()
          )
        })?;
    if let Some(registry) = &self.env.jiji_registry {
      config.builder.registry = Some(registry.clone());
    }
    let resolved = config
      .resolve()
      .context("Deploy configuration is invalid")?;
    Ok((resolved, warnings))
  }
}
