use std::{collections::HashMap, str::FromStr};

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, de::Error};
use strum::Display;

use crate::deserializers::{
  HostEntry, env_map_deserializer, option_item_or_vec_deserializer,
};

/// Where the service image comes from.
/// Exactly one of `image` / `build` must be configured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServiceSource {
  /// Use a prebuilt image reference, eg. `nginx:1.27`.
  Image(String),
  /// Build the image from a local context.
  Build(BuildConfig),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildConfig {
  /// The build context directory. default: `.`
  #[serde(default = "default_build_context")]
  pub context: String,
  /// Path to the Dockerfile, relative to the context.
  #[serde(default)]
  pub dockerfile: Option<String>,
  /// `--build-arg` key value pairs.
  #[serde(default, deserialize_with = "env_map_deserializer")]
  pub args: IndexMap<String, String>,
  /// Multi stage build target.
  #[serde(default)]
  pub target: Option<String>,
}

fn default_build_context() -> String {
  String::from(".")
}

#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PortProtocol {
  #[default]
  Tcp,
  Udp,
}

/// A parsed port mapping. Accepted input shapes:
/// `[host_ip:]host_port:container_port[/tcp|udp]`
/// or `container_port[/tcp|udp]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortMapping {
  pub host_ip: Option<String>,
  pub host_port: Option<u16>,
  pub container_port: u16,
  pub protocol: PortProtocol,
}

impl FromStr for PortMapping {
  type Err = anyhow::Error;

  fn from_str(s: &str) -> Result<PortMapping, Self::Err> {
    let (spec, protocol) = match s.split_once('/') {
      Some((spec, "tcp")) => (spec, PortProtocol::Tcp),
      Some((spec, "udp")) => (spec, PortProtocol::Udp),
      Some((_, proto)) => {
        return Err(anyhow::anyhow!(
          "invalid port protocol '{proto}', expected tcp or udp"
        ));
      }
      None => (s, PortProtocol::Tcp),
    };
    let parts = spec.split(':').collect::<Vec<_>>();
    let parse_port = |part: &str| {
      part
        .parse::<u16>()
        .ok()
        .filter(|port| *port != 0)
        .ok_or_else(|| {
          anyhow::anyhow!(
            "invalid port '{part}', expected 1 to 65535"
          )
        })
    };
    match parts.as_slice() {
      [container] => Ok(PortMapping {
        host_ip: None,
        host_port: None,
        container_port: parse_port(container)?,
        protocol,
      }),
      [host, container] => Ok(PortMapping {
        host_ip: None,
        host_port: Some(parse_port(host)?),
        container_port: parse_port(container)?,
        protocol,
      }),
      [ip, host, container] => Ok(PortMapping {
        host_ip: Some(ip.to_string()),
        host_port: Some(parse_port(host)?),
        container_port: parse_port(container)?,
        protocol,
      }),
      _ => Err(anyhow::anyhow!("invalid port mapping '{s}'")),
    }
  }
}

impl std::fmt::Display for PortMapping {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    if let Some(ip) = &self.host_ip {
      write!(f, "{ip}:")?;
    }
    if let Some(host_port) = self.host_port {
      write!(f, "{host_port}:")?;
    }
    write!(f, "{}", self.container_port)?;
    if self.protocol == PortProtocol::Udp {
      write!(f, "/udp")?;
    }
    Ok(())
  }
}

impl<'de> Deserialize<'de> for PortMapping {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: Deserializer<'de>,
  {
    struct PortVisitor;

    impl serde::de::Visitor<'_> for PortVisitor {
      type Value = PortMapping;

      fn expecting(
        &self,
        formatter: &mut std::fmt::Formatter,
      ) -> std::fmt::Result {
        write!(formatter, "port mapping string or port number")
      }

      fn visit_str<E: Error>(
        self,
        v: &str,
      ) -> Result<Self::Value, E> {
        v.parse().map_err(|e| Error::custom(format!("{e:#}")))
      }

      fn visit_u64<E: Error>(self, v: u64) -> Result<Self::Value, E> {
        self.visit_str(&v.to_string())
      }

      fn visit_i64<E: Error>(self, v: i64) -> Result<Self::Value, E> {
        self.visit_str(&v.to_string())
      }
    }

    deserializer.deserialize_any(PortVisitor)
  }
}

/// Environment configuration for a service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Environment {
  /// Plain variables, passed through as given.
  /// Integer / boolean values are coerced to strings.
  #[serde(default, deserialize_with = "env_map_deserializer")]
  pub clear: IndexMap<String, String>,
  /// Variable names resolved from the secret store at deploy time.
  #[serde(default)]
  pub secrets: Vec<String>,
}

/// Container resource constraints, passed through to `docker run`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
  #[serde(default)]
  pub cpus: Option<String>,
  #[serde(default)]
  pub memory: Option<String>,
  #[serde(default)]
  pub gpus: Option<String>,
  #[serde(default)]
  pub devices: Vec<String>,
  #[serde(default)]
  pub privileged: bool,
  #[serde(default)]
  pub cap_add: Vec<String>,
}

/// Health probe parameters handed to the edge proxy on cut-over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthcheckConfig {
  /// Http path probed on the target. default: `/up`
  #[serde(default = "default_health_path")]
  pub path: String,
  /// Seconds between probes. default: 1
  #[serde(default = "default_health_interval")]
  pub interval: u64,
  /// Seconds before a single probe fails. default: 5
  #[serde(default = "default_health_timeout")]
  pub timeout: u64,
  /// Seconds the target gets to become healthy before the
  /// cut-over is abandoned and rolled back. default: 30
  #[serde(default = "default_deploy_timeout")]
  pub deploy_timeout: u64,
}

fn default_health_path() -> String {
  String::from("/up")
}

fn default_health_interval() -> u64 {
  1
}

fn default_health_timeout() -> u64 {
  5
}

fn default_deploy_timeout() -> u64 {
  30
}

impl Default for HealthcheckConfig {
  fn default() -> HealthcheckConfig {
    HealthcheckConfig {
      path: default_health_path(),
      interval: default_health_interval(),
      timeout: default_health_timeout(),
      deploy_timeout: default_deploy_timeout(),
    }
  }
}

/// A single proxy routing target after shape normalization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProxyTarget {
  /// Public hostname routed to the service.
  /// None routes all unmatched traffic.
  #[serde(default)]
  pub host: Option<String>,
  /// Terminate tls for this host.
  #[serde(default)]
  pub ssl: bool,
  #[serde(default)]
  pub healthcheck: HealthcheckConfig,
}

/// Reverse proxy configuration for a service.
///
/// The file accepts three shapes, merged into `targets`:
/// a single inline target (`host` / `ssl` / `healthcheck` directly
/// on the proxy block), a `hosts` list sharing one healthcheck,
/// or an explicit `targets` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "ProxyConfigShape")]
pub struct ProxyConfig {
  pub enabled: bool,
  pub targets: Vec<ProxyTarget>,
}

#[derive(Deserialize)]
struct ProxyConfigShape {
  #[serde(default = "default_proxy_enabled")]
  enabled: bool,
  #[serde(default)]
  host: Option<String>,
  #[serde(default)]
  hosts: Vec<String>,
  #[serde(default)]
  ssl: bool,
  #[serde(default)]
  healthcheck: Option<HealthcheckConfig>,
  #[serde(default)]
  targets: Vec<ProxyTarget>,
}

fn default_proxy_enabled() -> bool {
  true
}

impl From<ProxyConfigShape> for ProxyConfig {
  fn from(shape: ProxyConfigShape) -> ProxyConfig {
    let mut targets = shape.targets;
    let healthcheck = shape.healthcheck.unwrap_or_default();
    if !shape.hosts.is_empty() {
      targets.extend(shape.hosts.into_iter().map(|host| {
        ProxyTarget {
          host: Some(host),
          ssl: shape.ssl,
          healthcheck: healthcheck.clone(),
        }
      }));
    } else if targets.is_empty() {
      // Single inline target, possibly hostless.
      targets.push(ProxyTarget {
        host: shape.host,
        ssl: shape.ssl,
        healthcheck,
      });
    }
    ProxyConfig {
      enabled: shape.enabled,
      targets,
    }
  }
}

/// The `services.<name>` entry in the deploy file.
/// Resolved and validated into a [ServiceSpec] after load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
  /// Prebuilt image reference. Mutually exclusive with `build`.
  #[serde(default)]
  pub image: Option<String>,
  /// Image build configuration. Mutually exclusive with `image`.
  #[serde(default)]
  pub build: Option<BuildConfig>,
  /// The servers this service deploys to.
  /// Entries are server names, or inline `{ host: ... }` objects
  /// matched against server addresses.
  #[serde(default)]
  pub hosts: Vec<HostEntry>,
  #[serde(default)]
  pub ports: Vec<PortMapping>,
  #[serde(default)]
  pub env: Environment,
  /// Volume mounts in `name:/container/path` form.
  #[serde(default)]
  pub volumes: Vec<String>,
  /// Container command, string or argv list.
  #[serde(
    default,
    deserialize_with = "option_item_or_vec_deserializer"
  )]
  pub command: Option<Vec<String>>,
  #[serde(flatten)]
  pub resources: ResourceLimits,
  #[serde(default)]
  pub proxy: Option<ProxyConfig>,
  /// Generations kept after a successful deploy, counting the
  /// current one. `1` removes every archived generation on
  /// cleanup. Minimum 1. default: 1
  #[serde(default = "default_retain")]
  pub retain: u32,
}

fn default_retain() -> u32 {
  1
}

impl Default for ServiceConfig {
  fn default() -> ServiceConfig {
    ServiceConfig {
      image: None,
      build: None,
      hosts: Vec::new(),
      ports: Vec::new(),
      env: Default::default(),
      volumes: Vec::new(),
      command: None,
      resources: Default::default(),
      proxy: None,
      retain: default_retain(),
    }
  }
}

/// A fully resolved, validated deployable unit.
/// Every field is computed at config load, then frozen.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceSpec {
  /// The project namespace.
  pub project: String,
  /// Unique within the project.
  pub name: String,
  pub source: ServiceSource,
  /// Resolved server names, non-empty.
  pub hosts: Vec<String>,
  pub ports: Vec<PortMapping>,
  pub env: Environment,
  pub volumes: Vec<String>,
  pub command: Option<Vec<String>>,
  pub resources: ResourceLimits,
  pub proxy: Option<ProxyConfig>,
  pub retain: u32,
}

pub const ARCHIVE_INFIX: &str = "_old_";

impl ServiceSpec {
  /// The canonical container name: `<project>-<name>`.
  pub fn container_name(&self) -> String {
    format!("{}-{}", self.project, self.name)
  }

  /// The archived container name for a given epoch:
  /// `<project>-<name>_old_<epoch>`.
  pub fn archived_container_name(&self, epoch: i64) -> String {
    format!("{}{ARCHIVE_INFIX}{epoch}", self.container_name())
  }

  pub fn proxy_enabled(&self) -> bool {
    self
      .proxy
      .as_ref()
      .map(|proxy| proxy.enabled)
      .unwrap_or_default()
  }

  /// Resolve the image reference deployed to hosts.
  ///
  /// - `image` source without override version: reference kept as
  ///   given (implicit `latest` stays implicit).
  /// - `image` source with override version: tag replaced / appended.
  /// - `build` source: `[<registry>/]<project>-<name>:<version>`,
  ///   defaulting the version to `latest`.
  pub fn image_reference(
    &self,
    registry: Option<&str>,
    version: Option<&str>,
  ) -> String {
    match &self.source {
      ServiceSource::Image(image) => match version {
        Some(version) => {
          format!("{}:{version}", strip_image_tag(image))
        }
        None => image.clone(),
      },
      ServiceSource::Build(_) => {
        let name = self.built_image_name(registry);
        format!("{name}:{}", version.unwrap_or("latest"))
      }
    }
  }

  /// Image name for `build` sources, without tag.
  pub fn built_image_name(&self, registry: Option<&str>) -> String {
    match registry {
      Some(registry) if !registry.is_empty() => {
        format!("{registry}/{}-{}", self.project, self.name)
      }
      _ => format!("{}-{}", self.project, self.name),
    }
  }

  /// Tags pushed after a successful build: the exact version,
  /// and `latest`.
  pub fn pushed_tags(
    &self,
    registry: Option<&str>,
    version: &str,
  ) -> Vec<String> {
    let name = self.built_image_name(registry);
    let mut tags = vec![format!("{name}:{version}")];
    if version != "latest" {
      tags.push(format!("{name}:latest"));
    }
    tags
  }
}

/// Strip the tag from an image reference, careful not to eat
/// a registry port (`registry:5000/app`).
fn strip_image_tag(image: &str) -> &str {
  match image.rsplit_once(':') {
    Some((name, tag)) if !tag.contains('/') => name,
    _ => image,
  }
}

impl ServiceConfig {
  /// Validate and resolve into a frozen [ServiceSpec].
  ///
  /// `servers` maps server name -> host address, used to resolve
  /// both shapes of `hosts` entries to the named-ref model.
  pub fn resolve(
    &self,
    project: &str,
    name: &str,
    servers: &HashMap<String, String>,
  ) -> anyhow::Result<ServiceSpec> {
    let source = match (&self.image, &self.build) {
      (Some(image), None) => ServiceSource::Image(image.clone()),
      (None, Some(build)) => ServiceSource::Build(build.clone()),
      (Some(_), Some(_)) => {
        return Err(anyhow::anyhow!(
          "service '{name}' specifies both 'image' and 'build'"
        ));
      }
      (None, None) => {
        return Err(anyhow::anyhow!(
          "service '{name}' needs either 'image' or 'build'"
        ));
      }
    };
    if self.hosts.is_empty() {
      return Err(anyhow::anyhow!(
        "service '{name}' has no hosts configured"
      ));
    }
    let mut hosts = Vec::with_capacity(self.hosts.len());
    for entry in &self.hosts {
      let resolved = match entry {
        HostEntry::Name(server) => servers
          .contains_key(server)
          .then(|| server.clone())
          .ok_or_else(|| {
            anyhow::anyhow!(
              "service '{name}' host '{server}' does not match any server"
            )
          })?,
        HostEntry::Inline(host) => servers
          .iter()
          .find(|(_, address)| *address == host)
          .map(|(server, _)| server.clone())
          .ok_or_else(|| {
            anyhow::anyhow!(
              "service '{name}' inline host '{host}' does not match any server address"
            )
          })?,
      };
      hosts.push(resolved);
    }
    for var in self.env.clear.keys().chain(self.env.secrets.iter()) {
      if !super::valid_env_var_name(var) {
        return Err(anyhow::anyhow!(
          "service '{name}' has invalid env variable name '{var}'"
        ));
      }
    }
    if let Some(proxy) = &self.proxy
      && proxy.enabled
      && proxy.targets.is_empty()
    {
      return Err(anyhow::anyhow!(
        "service '{name}' enables proxy without any target"
      ));
    }
    if self.retain < 1 {
      return Err(anyhow::anyhow!(
        "service '{name}' retain must be at least 1"
      ));
    }
    Ok(ServiceSpec {
      project: project.to_string(),
      name: name.to_string(),
      source,
      hosts,
      ports: self.ports.clone(),
      env: self.env.clone(),
      volumes: self.volumes.clone(),
      command: self.command.clone(),
      resources: self.resources.clone(),
      proxy: self.proxy.clone(),
      retain: self.retain,
    })
  }
}
