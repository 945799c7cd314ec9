use std::path::PathBuf;

use serde::Deserialize;

use crate::entities::logger::{LogLevel, StdioLogMode};

/// # Jiji CLI Environment Variables
///
/// Overrides applied on top of the deploy file.
#[derive(Debug, Clone, Deserialize)]
pub struct Env {
  /// Override the deploy file path.
  /// default: `.jiji/deploy.yml` (or `.jiji/deploy.<env>.yml`)
  #[serde(default)]
  pub jiji_config_path: Option<PathBuf>,
  /// Select the `.jiji/deploy.<env>.yml` variant.
  #[serde(default)]
  pub jiji_env: Option<String>,
  /// The container engine binary used on the hosts.
  /// default: `docker`
  #[serde(default = "default_engine")]
  pub jiji_engine: String,
  /// Override `builder.registry`.
  #[serde(default)]
  pub jiji_registry: Option<String>,

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

fn default_engine() -> String {
  String::from("docker")
}

#[derive(Debug, clap::Parser)]
#[command(
  name = "jiji",
  version,
  about = "Multi server container deployment tool",
  author
)]
pub struct CliArgs {
  /// The command to run
  #[command(subcommand)]
  pub command: Command,

  /// Sets the path of the deploy file to use.
  #[arg(long, short = 'c')]
  pub config_path: Option<PathBuf>,

  /// Use `.jiji/deploy.<env>.yml` instead of `.jiji/deploy.yml`.
  #[arg(long, short = 'e')]
  pub env: Option<String>,

  /// Override the log level. One of trace, debug, info, warn, error.
  #[arg(long)]
  pub log_level: Option<tracing::Level>,
}

#[derive(Debug, Clone, clap::Subcommand)]
pub enum Command {
  /// Deploy services to their configured hosts. (aliases: `d`, `up`)
  #[clap(alias = "d", alias = "up")]
  Deploy(Deploy),

  /// Print the resolved deploy configuration. (aliases: `cfg`, `cf`)
  #[clap(alias = "cfg", alias = "cf")]
  Config {
    /// Print secret values instead of redacting them.
    #[arg(long, action)]
    unsanitized: bool,
  },

  /// Edge proxy utilities.
  Proxy {
    #[command(subcommand)]
    command: ProxyCommand,
  },
}

#[derive(Debug, Clone, clap::Args)]
pub struct Deploy {
  /// Service name patterns. Supports `*` and `?` wildcards,
  /// matched case sensitively. Empty selects every service.
  pub services: Vec<String>,

  /// The version tag to build / deploy.
  #[arg(long, short = 'v')]
  pub version: Option<String>,

  /// Skip building and pushing images for `build` sourced services.
  #[arg(long)]
  pub skip_build: bool,
}

#[derive(Debug, Clone, clap::Subcommand)]
pub enum ProxyCommand {
  /// Show the proxy routing table per host. (alias: `ls`)
  #[clap(alias = "ls")]
  List {
    /// Only query this server.
    #[arg(long, short = 's')]
    server: Option<String>,
  },
}
