use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use strum::Display;

/// Cpu architecture of a target host.
/// Used to select the right image variant on multi-arch builds.
#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Hash,
  Serialize,
  Deserialize,
  Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Architecture {
  #[default]
  Amd64,
  Arm64,
}

/// Global ssh connection parameters,
/// overridable per server in [ServerConfig].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SshConfig {
  /// The login user. default: `root`
  #[serde(default = "default_ssh_user")]
  pub user: String,
  /// The ssh port. default: `22`
  #[serde(default = "default_ssh_port")]
  pub port: u16,
  /// Path to the private key passed to `ssh -i`.
  #[serde(default)]
  pub key_file: Option<PathBuf>,
  /// Optional jump host passed to `ssh -J`.
  #[serde(default)]
  pub proxy_jump: Option<String>,
}

fn default_ssh_user() -> String {
  String::from("root")
}

fn default_ssh_port() -> u16 {
  22
}

impl Default for SshConfig {
  fn default() -> SshConfig {
    SshConfig {
      user: default_ssh_user(),
      port: default_ssh_port(),
      key_file: None,
      proxy_jump: None,
    }
  }
}

/// The `servers.<name>` entry in the deploy file.
/// The name comes from the map key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
  /// IP or DNS name the ssh connection targets.
  pub host: String,
  /// Cpu architecture of the host. default: `amd64`
  #[serde(default)]
  pub arch: Architecture,
  /// Override the global ssh user for this server.
  #[serde(default)]
  pub user: Option<String>,
  /// Override the global ssh port for this server.
  #[serde(default)]
  pub port: Option<u16>,
  /// Override the global ssh key file for this server.
  #[serde(default)]
  pub key_file: Option<PathBuf>,
  /// Override the global jump host for this server.
  #[serde(default)]
  pub proxy_jump: Option<String>,
}

/// A named remote endpoint with resolved shell credentials.
/// Immutable after config load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerRef {
  /// Unique name from the `servers` map key.
  pub name: String,
  /// IP or DNS name the ssh connection targets.
  pub host: String,
  pub arch: Architecture,
  pub user: String,
  pub port: u16,
  pub key_file: Option<PathBuf>,
  pub proxy_jump: Option<String>,
}

impl ServerRef {
  pub fn resolve(
    name: &str,
    config: &ServerConfig,
    ssh: &SshConfig,
  ) -> ServerRef {
    ServerRef {
      name: name.to_string(),
      host: config.host.clone(),
      arch: config.arch,
      user: config.user.clone().unwrap_or_else(|| ssh.user.clone()),
      port: config.port.unwrap_or(ssh.port),
      key_file: config
        .key_file
        .clone()
        .or_else(|| ssh.key_file.clone()),
      proxy_jump: config
        .proxy_jump
        .clone()
        .or_else(|| ssh.proxy_jump.clone()),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn server_ref_merges_ssh_defaults() {
    let ssh = SshConfig {
      user: String::from("deploy"),
      port: 2222,
      key_file: Some(PathBuf::from("/keys/id_ed25519")),
      proxy_jump: None,
    };
    let config = ServerConfig {
      host: String::from("10.0.0.5"),
      arch: Architecture::Arm64,
      user: None,
      port: Some(22),
      key_file: None,
      proxy_jump: Some(String::from("bastion")),
    };
    let server = ServerRef::resolve("web-1", &config, &ssh);
    assert_eq!(server.user, "deploy");
    assert_eq!(server.port, 22);
    assert_eq!(
      server.key_file,
      Some(PathBuf::from("/keys/id_ed25519"))
    );
    assert_eq!(server.proxy_jump.as_deref(), Some("bastion"));
  }
}
