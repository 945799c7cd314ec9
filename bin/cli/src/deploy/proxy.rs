//! Edge proxy management.
//!
//! The edge proxy (kamal-proxy) is an external container owning
//! the http/https listeners on every host. Installing it is
//! idempotent; the `deploy` subcommand performs the health-gated
//! traffic cut-over and only returns zero once the new target is
//! healthy.

use anyhow::Context;
use jiji_client::entities::{
  Log,
  deployment::{ProxyConfigResult, ProxyInstallResult},
  dns::parse_ipv4,
  service::ServiceSpec,
};

use crate::{
  docker::Engine,
  shell::{CommandResult, RemoteShell},
};

pub const PROXY_CONTAINER: &str = "kamal-proxy";
pub const PROXY_IMAGE: &str = "basecamp/kamal-proxy:latest";

/// Ensure the edge proxy container is present and running.
pub async fn ensure_proxy<S: RemoteShell>(
  shell: &S,
  engine: &Engine,
  network: &str,
) -> ProxyInstallResult {
  let host = shell.host().to_string();
  match install(shell, engine, network).await {
    Ok(()) => ProxyInstallResult {
      host,
      success: true,
      error: None,
    },
    Err(e) => ProxyInstallResult {
      host,
      success: false,
      error: Some(format!("proxy installation failed | {e:#}")),
    },
  }
}

async fn install<S: RemoteShell>(
  shell: &S,
  engine: &Engine,
  network: &str,
) -> anyhow::Result<()> {
  let network_res = shell
    .execute_command(&engine.ensure_network(network))
    .await?;
  if !network_res.success() {
    return Err(anyhow::anyhow!(
      "Failed to ensure network {network} | {}",
      network_res.combined()
    ));
  }

  let existing = shell
    .execute_command(&engine.ps_names(PROXY_CONTAINER))
    .await?;
  if !existing.stdout.trim().is_empty() {
    // Present. Start it in case it is stopped; `start` on a
    // running container is a no-op.
    let start = shell
      .execute_command(&engine.start(PROXY_CONTAINER))
      .await?;
    if !start.success() {
      return Err(anyhow::anyhow!(
        "Failed to start existing proxy | {}",
        start.combined()
      ));
    }
    return Ok(());
  }

  debug!("installing {PROXY_CONTAINER} on {}", shell.host());
  let run =
    shell.execute_command(&run_command(engine, network)).await?;
  if !run.success() {
    return Err(anyhow::anyhow!(
      "Failed to run {PROXY_CONTAINER} | {}",
      run.combined()
    ));
  }
  Ok(())
}

fn run_command(engine: &Engine, network: &str) -> String {
  format!(
    "{} run -d --name {PROXY_CONTAINER} --network {network} --restart unless-stopped -p 80:80 -p 443:443 -v /var/run/docker.sock:/var/run/docker.sock {PROXY_IMAGE}",
    engine.binary(),
  )
}

/// Issue the health-gated cut-over for one (service, host).
///
/// Resolves the new container ip, then asks the proxy to swap its
/// target. A non-zero exit means the target never became healthy
/// within `deploy_timeout` and the caller must roll back.
pub async fn configure_service<S: RemoteShell>(
  shell: &S,
  engine: &Engine,
  spec: &ServiceSpec,
  network: &str,
  logs: &mut Vec<Log>,
) -> ProxyConfigResult {
  let mut result = ProxyConfigResult {
    service: spec.name.clone(),
    host: shell.host().to_string(),
    target: None,
    success: false,
    error: None,
  };
  match cut_over(shell, engine, spec, network, logs).await {
    Ok(target) => {
      result.target = Some(target);
      result.success = true;
    }
    Err(e) => result.error = Some(format!("{e:#}")),
  }
  result
}

async fn cut_over<S: RemoteShell>(
  shell: &S,
  engine: &Engine,
  spec: &ServiceSpec,
  network: &str,
  logs: &mut Vec<Log>,
) -> anyhow::Result<String> {
  let name = spec.container_name();
  let inspect_cmd = engine.inspect_ip(&name, network);
  let inspect = shell.execute_command(&inspect_cmd).await?;
  push_log(logs, "Proxy Deploy", inspect_cmd, &inspect);
  let ip = inspect.stdout.trim().to_string();
  if !inspect.success() || parse_ipv4(&ip).is_none() {
    return Err(anyhow::anyhow!(
      "Could not resolve container ip for {name} | got '{ip}'"
    ));
  }
  let port = spec
    .ports
    .first()
    .map(|port| port.container_port)
    .unwrap_or(80);
  let target = format!("{ip}:{port}");

  let proxy = spec
    .proxy
    .as_ref()
    .context("service has no proxy configuration")?;
  let healthcheck = proxy
    .targets
    .first()
    .map(|t| t.healthcheck.clone())
    .unwrap_or_default();
  let mut cmd = format!(
    "kamal-proxy deploy {} --target {target} --health-path {} --health-interval {}s --health-timeout {}s --deploy-timeout {}s",
    spec.name,
    healthcheck.path,
    healthcheck.interval,
    healthcheck.timeout,
    healthcheck.deploy_timeout,
  );
  for proxy_target in &proxy.targets {
    if let Some(host) = &proxy_target.host {
      cmd.push_str(&format!(" --host {host}"));
    }
  }
  if proxy.targets.iter().any(|t| t.ssl) {
    cmd.push_str(" --tls");
  }
  let exec_cmd = engine.exec(PROXY_CONTAINER, &cmd);
  let deploy = shell.execute_command(&exec_cmd).await?;
  push_log(logs, "Proxy Deploy", exec_cmd, &deploy);
  if !deploy.success() {
    return Err(anyhow::anyhow!(
      "Proxy cut-over failed for {} | {}",
      spec.name,
      deploy.combined()
    ));
  }
  Ok(target)
}

/// One row of the proxy routing table.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyListEntry {
  pub service: String,
  pub host: String,
  pub path: String,
  pub target: String,
  /// One of `starting`, `deployed`, `error`.
  pub state: String,
  pub tls: String,
}

/// Query and parse the proxy routing table on a host.
pub async fn list<S: RemoteShell>(
  shell: &S,
  engine: &Engine,
) -> anyhow::Result<Vec<ProxyListEntry>> {
  let cmd = engine.exec(PROXY_CONTAINER, "kamal-proxy list");
  let result = shell.execute_command(&cmd).await?;
  if !result.success() {
    return Err(anyhow::anyhow!(
      "Failed to list proxy routes | {}",
      result.combined()
    ));
  }
  Ok(parse_list(&result.stdout))
}

fn parse_list(output: &str) -> Vec<ProxyListEntry> {
  output
    .lines()
    .skip(1) // header
    .filter_map(|line| {
      let cols = line
        .split_whitespace()
        .map(str::to_string)
        .collect::<Vec<_>>();
      let [service, host, path, target, state, tls] =
        cols.try_into().ok()?;
      Some(ProxyListEntry {
        service,
        host,
        path,
        target,
        state,
        tls,
      })
    })
    .collect()
}

fn push_log(
  logs: &mut Vec<Log>,
  stage: &str,
  command: String,
  result: &CommandResult,
) {
  let ts = jiji_client::entities::jiji_timestamp();
  logs.push(Log {
    stage: stage.to_string(),
    command,
    stdout: result.stdout.clone(),
    stderr: result.stderr.clone(),
    success: result.success(),
    start_ts: ts,
    end_ts: ts,
  });
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn proxy_run_command_shape() {
    let cmd = run_command(&Engine::new("docker"), "test");
    assert!(cmd.starts_with("docker run -d --name kamal-proxy"));
    assert!(cmd.contains("-p 80:80"));
    assert!(cmd.contains("-p 443:443"));
    assert!(cmd.contains("/var/run/docker.sock"));
    assert!(cmd.ends_with(PROXY_IMAGE));
  }

  #[test]
  fn list_parsing_skips_header() {
    let output = "\
Service  Host             Path  Target           State     TLS
web      app.example.com  /     172.18.0.5:8080  deployed  yes
api      -                /     172.18.0.6:3000  starting  no
";
    let entries = parse_list(output);
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].service, "web");
    assert_eq!(entries[0].state, "deployed");
    assert_eq!(entries[1].target, "172.18.0.6:3000");
  }
}
