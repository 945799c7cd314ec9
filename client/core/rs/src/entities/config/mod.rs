use std::{collections::HashMap, path::PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::{
  server::{ServerConfig, ServerRef, SshConfig},
  service::{Environment, ServiceConfig, ServiceSpec},
  to_docker_compatible_name,
};

pub mod cli;
pub mod discovery;

/// Top-level keys accepted in the deploy file.
/// Anything else produces a load warning.
pub const KNOWN_TOP_LEVEL_KEYS: &[&str] = &[
  "project",
  "ssh",
  "servers",
  "services",
  "environment",
  "builder",
  "network",
  "secrets",
  "secrets_path",
];

/// Image build / push configuration shared by all services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuilderConfig {
  /// Registry prefix for built images, eg. `ghcr.io/acme`.
  #[serde(default)]
  pub registry: Option<String>,
  /// Push built images before deploying. default: true
  #[serde(default = "default_push")]
  pub push: bool,
}

fn default_push() -> bool {
  true
}

impl Default for BuilderConfig {
  fn default() -> BuilderConfig {
    BuilderConfig {
      registry: None,
      push: default_push(),
    }
  }
}

/// The `.jiji/deploy.yml` schema.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeployConfig {
  /// The project namespace. Containers are named
  /// `<project>-<service>`.
  #[serde(default)]
  pub project: String,
  /// Global ssh connection defaults.
  #[serde(default)]
  pub ssh: SshConfig,
  /// The target servers by name.
  #[serde(default)]
  pub servers: IndexMap<String, ServerConfig>,
  /// The deployable services by name.
  #[serde(default)]
  pub services: IndexMap<String, ServiceConfig>,
  /// Environment merged into every service (service wins).
  #[serde(default)]
  pub environment: Environment,
  #[serde(default)]
  pub builder: BuilderConfig,
  /// Docker network containers attach to. default: the project name
  #[serde(default)]
  pub network: Option<String>,
  /// Secret names resolved for every service.
  #[serde(default)]
  pub secrets: Vec<String>,
  /// Extra dotenv-format file consulted for secret values.
  #[serde(default)]
  pub secrets_path: Option<PathBuf>,
}

/// The frozen configuration handed to the deployment engine.
/// Every field validated and resolved at load.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedConfig {
  pub project: String,
  pub network: String,
  pub ssh: SshConfig,
  pub servers: IndexMap<String, ServerRef>,
  pub services: Vec<ServiceSpec>,
  pub registry: Option<String>,
  pub push_builds: bool,
  pub secrets: Vec<String>,
  pub secrets_path: Option<PathBuf>,
}

impl DeployConfig {
  /// Validate the loaded file and resolve every service into
  /// its frozen [ServiceSpec].
  pub fn resolve(&self) -> anyhow::Result<ResolvedConfig> {
    if self.project.trim().is_empty() {
      return Err(anyhow::anyhow!("'project' must be set"));
    }
    let project = to_docker_compatible_name(&self.project);
    if self.servers.is_empty() {
      return Err(anyhow::anyhow!("no 'servers' configured"));
    }
    let servers = self
      .servers
      .iter()
      .map(|(name, config)| {
        (
          name.clone(),
          ServerRef::resolve(name, config, &self.ssh),
        )
      })
      .collect::<IndexMap<_, _>>();
    let host_lookup = servers
      .values()
      .map(|server| (server.name.clone(), server.host.clone()))
      .collect::<HashMap<_, _>>();
    let mut services = Vec::with_capacity(self.services.len());
    for (name, config) in &self.services {
      let mut config = config.clone();
      merge_environment(&mut config.env, &self.environment);
      services.push(config.resolve(&project, name, &host_lookup)?);
    }
    let network = self
      .network
      .clone()
      .map(|network| to_docker_compatible_name(&network))
      .unwrap_or_else(|| project.clone());
    Ok(ResolvedConfig {
      project,
      network,
      ssh: self.ssh.clone(),
      servers,
      services,
      registry: self.builder.registry.clone(),
      push_builds: self.builder.push,
      secrets: self.secrets.clone(),
      secrets_path: self.secrets_path.clone(),
    })
  }
}

/// Service environment wins over the global one.
fn merge_environment(env: &mut Environment, global: &Environment) {
  for (key, value) in &global.clear {
    if !env.clear.contains_key(key) {
      env.clear.insert(key.clone(), value.clone());
    }
  }
  for secret in &global.secrets {
    if !env.secrets.contains(secret) {
      env.secrets.push(secret.clone());
    }
  }
}

impl ResolvedConfig {
  pub fn server(&self, name: &str) -> Option<&ServerRef> {
    self.servers.get(name)
  }
}
