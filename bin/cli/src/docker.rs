//! The container engine command surface.
//!
//! Every engine interaction goes over the remote shell as a
//! POSIX sh snippet built here. `docker` and `podman` share the
//! surface relied upon: run, ps, rm, rename, inspect, logs, pull,
//! network create, volume create.

use std::borrow::Cow;

use jiji_client::entities::service::ServiceSpec;

/// Builds engine commands for a configured binary.
#[derive(Debug, Clone)]
pub struct Engine {
  binary: String,
}

impl Engine {
  pub fn new(binary: impl Into<String>) -> Engine {
    Engine {
      binary: binary.into(),
    }
  }

  pub fn binary(&self) -> &str {
    &self.binary
  }

  pub fn pull(&self, image: &str) -> String {
    format!("{} pull {image}", self.binary)
  }

  pub fn start(&self, name: &str) -> String {
    format!("{} start {name}", self.binary)
  }

  /// Exact container names, one per line.
  /// `name_filter` anchors on the full name.
  pub fn ps_names(&self, name_filter: &str) -> String {
    format!(
      "{} ps -a --format '{{{{.Names}}}}' --filter name='^{name_filter}$'",
      self.binary
    )
  }

  pub fn rename(&self, from: &str, to: &str) -> String {
    format!("{} rename {from} {to}", self.binary)
  }

  pub fn rm(&self, name: &str, force: bool) -> String {
    let force = if force { " --force" } else { "" };
    format!("{} rm{force} {name}", self.binary)
  }

  pub fn inspect_state(&self, name: &str) -> String {
    format!(
      "{} inspect --format '{{{{.State.Status}}}}' {name}",
      self.binary
    )
  }

  pub fn inspect_health(&self, name: &str) -> String {
    format!(
      "{} inspect --format '{{{{if .State.Health}}}}{{{{.State.Health.Status}}}}{{{{end}}}}' {name}",
      self.binary
    )
  }

  /// The container ip on the given network.
  pub fn inspect_ip(&self, name: &str, network: &str) -> String {
    format!(
      "{} inspect --format '{{{{.NetworkSettings.Networks.{network}.IPAddress}}}}' {name}",
      self.binary
    )
  }

  pub fn logs_tail(&self, name: &str, tail: u32) -> String {
    format!("{} logs --tail {tail} {name}", self.binary)
  }

  pub fn ensure_network(&self, network: &str) -> String {
    format!(
      "{bin} network inspect {network} >/dev/null 2>&1 || {bin} network create {network}",
      bin = self.binary
    )
  }

  pub fn ensure_volume(&self, volume: &str) -> String {
    format!("{} volume create {volume}", self.binary)
  }

  pub fn exec(&self, container: &str, command: &str) -> String {
    format!("{} exec {container} {command}", self.binary)
  }

  /// The full `run` command booting a new service generation.
  ///
  /// `env` carries the merged clear + resolved secret variables.
  /// Values are single-quote escaped for the remote sh.
  pub fn run_service(
    &self,
    spec: &ServiceSpec,
    image: &str,
    network: &str,
    env: &[(String, String)],
  ) -> String {
    let mut cmd = format!(
      "{} run -d --name {} --restart unless-stopped --network {network} --network-alias {}",
      self.binary,
      spec.container_name(),
      spec.name,
    );
    for port in &spec.ports {
      cmd.push_str(&format!(" -p {port}"));
    }
    for (var, value) in env {
      cmd.push_str(&format!(
        " -e {var}={}",
        shell_escape::escape(Cow::Borrowed(value.as_str()))
      ));
    }
    for volume in &spec.volumes {
      cmd.push_str(&format!(" -v {volume}"));
    }
    let resources = &spec.resources;
    if let Some(cpus) = &resources.cpus {
      cmd.push_str(&format!(" --cpus {cpus}"));
    }
    if let Some(memory) = &resources.memory {
      cmd.push_str(&format!(" --memory {memory}"));
    }
    if let Some(gpus) = &resources.gpus {
      cmd.push_str(&format!(" --gpus {gpus}"));
    }
    for device in &resources.devices {
      cmd.push_str(&format!(" --device {device}"));
    }
    if resources.privileged {
      cmd.push_str(" --privileged");
    }
    for cap in &resources.cap_add {
      cmd.push_str(&format!(" --cap-add {cap}"));
    }
    cmd.push_str(&format!(" {image}"));
    if let Some(command) = &spec.command {
      for part in command {
        cmd.push_str(&format!(
          " {}",
          shell_escape::escape(Cow::Borrowed(part.as_str()))
        ));
      }
    }
    cmd
  }
}
