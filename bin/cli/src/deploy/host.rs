//! The per (service, host) zero-downtime swap.
//!
//! Prepare -> ArchiveOld -> BootNew -> HealthGate -> Finalize,
//! with a Rollback edge out of BootNew and HealthGate. Proxied
//! services defer their health gate to the proxy cut-over phase,
//! which calls back into [rollback_generation] on failure.

use std::time::Duration;

use jiji_client::entities::{
  Log, jiji_timestamp,
  deployment::ServiceDeployResult,
  service::{ARCHIVE_INFIX, ServiceSource, ServiceSpec},
};

use crate::{
  docker::Engine,
  shell::{CommandResult, RemoteShell},
};

/// Attempts to see the new container `running` before giving up.
const START_RETRIES: u32 = 10;
const START_POLL: Duration = Duration::from_secs(1);

/// Bound on the engine-level health gate for unproxied services.
const HEALTH_RETRIES: u32 = 30;
const HEALTH_POLL: Duration = Duration::from_secs(1);

/// Lines of container output attached to start failures.
const FAILURE_LOG_TAIL: u32 = 15;

pub struct HostDriver<'a, S: RemoteShell> {
  pub shell: &'a S,
  pub engine: &'a Engine,
  pub spec: &'a ServiceSpec,
  pub network: &'a str,
  /// The fully resolved image reference.
  pub image: &'a str,
  /// Merged clear + resolved secret variables.
  pub env: &'a [(String, String)],
  /// Secret value replacers applied to every log.
  pub replacers: &'a [(String, String)],
}

impl<S: RemoteShell> HostDriver<'_, S> {
  /// Drive the swap to completion on this host.
  /// Never panics, never leaves a gap: on any failure past
  /// ArchiveOld the prior generation is restored.
  pub async fn deploy(&self) -> ServiceDeployResult {
    let mut result = ServiceDeployResult {
      service: self.spec.name.clone(),
      host: self.shell.host().to_string(),
      ..Default::default()
    };

    // Prepare
    if let Err(e) = self.prepare(&mut result.logs).await {
      result.error = Some(format!("{e:#}"));
      return result;
    }

    // ArchiveOld
    let old_container =
      match self.archive_old(&mut result.logs).await {
        Ok(old_container) => old_container,
        Err(e) => {
          result.error = Some(format!("{e:#}"));
          return result;
        }
      };
    result.fresh = old_container.is_none();
    result.old_container = old_container.clone();

    // BootNew + engine level HealthGate
    match self.boot_new(&mut result.logs).await {
      Ok(()) => {}
      Err(e) => {
        result.error = Some(format!("{e:#}"));
        result.rolled_back = rollback_generation(
          self.shell,
          self.engine,
          self.spec,
          old_container.as_deref(),
          &mut result.logs,
        )
        .await;
        return result;
      }
    }

    result.success = true;
    result
  }

  async fn prepare(&self, logs: &mut Vec<Log>) -> anyhow::Result<()> {
    let pull = self
      .run("Pull Image", &self.engine.pull(self.image), logs)
      .await?;
    if !pull.success() {
      return Err(anyhow::anyhow!(
        "Failed to pull image {} | {}",
        self.image,
        pull.combined()
      ));
    }
    let network = self
      .run(
        "Ensure Network",
        &self.engine.ensure_network(self.network),
        logs,
      )
      .await?;
    if !network.success() {
      return Err(anyhow::anyhow!(
        "Failed to ensure network {} | {}",
        self.network,
        network.combined()
      ));
    }
    for volume in named_volumes(self.spec) {
      let volume_res = self
        .run(
          "Ensure Volume",
          &self.engine.ensure_volume(&volume),
          logs,
        )
        .await?;
      if !volume_res.success() {
        return Err(anyhow::anyhow!(
          "Failed to ensure volume {volume} | {}",
          volume_res.combined()
        ));
      }
    }
    Ok(())
  }

  /// Rename the current generation out of the way.
  /// Returns the archived name when one existed.
  async fn archive_old(
    &self,
    logs: &mut Vec<Log>,
  ) -> anyhow::Result<Option<String>> {
    let name = self.spec.container_name();
    let existing = self
      .run("Check Existing", &self.engine.ps_names(&name), logs)
      .await?;
    if existing.stdout.trim().is_empty() {
      logs.push(Log::simple(
        "Archive Old",
        String::from("Fresh deployment, no existing container"),
      ));
      return Ok(None);
    }
    let archived =
      self.spec.archived_container_name(jiji_timestamp());
    let rename = self
      .run(
        "Archive Old",
        &self.engine.rename(&name, &archived),
        logs,
      )
      .await?;
    if !rename.success() {
      return Err(anyhow::anyhow!(
        "Failed to archive container {name} | {}",
        rename.combined()
      ));
    }
    Ok(Some(archived))
  }

  async fn boot_new(&self, logs: &mut Vec<Log>) -> anyhow::Result<()> {
    let name = self.spec.container_name();
    let run = self
      .run(
        "Start Container",
        &self.engine.run_service(
          self.spec,
          self.image,
          self.network,
          self.env,
        ),
        logs,
      )
      .await?;
    if !run.success() {
      return Err(anyhow::anyhow!(
        "Engine refused to start {name} | {}",
        run.combined()
      ));
    }

    // Wait for the engine to report `running`.
    let mut running = false;
    for _ in 0..START_RETRIES {
      let state = self
        .run("Check State", &self.engine.inspect_state(&name), logs)
        .await?;
      match state.stdout.trim() {
        "running" => {
          running = true;
          break;
        }
        "exited" | "dead" => break,
        _ => tokio::time::sleep(START_POLL).await,
      }
    }
    if !running {
      let tail = self
        .run(
          "Container Logs",
          &self.engine.logs_tail(&name, FAILURE_LOG_TAIL),
          logs,
        )
        .await?;
      return Err(anyhow::anyhow!(
        "Container {name} did not reach running state | {}",
        tail.combined()
      ));
    }

    if !self.spec.proxy_enabled() {
      self.engine_health_gate(&name, logs).await?;
    }
    Ok(())
  }

  /// Engine-level health gate for unproxied services.
  /// No-op when the image carries no healthcheck.
  async fn engine_health_gate(
    &self,
    name: &str,
    logs: &mut Vec<Log>,
  ) -> anyhow::Result<()> {
    for _ in 0..HEALTH_RETRIES {
      let health = self
        .run("Health Check", &self.engine.inspect_health(name), logs)
        .await?;
      match health.stdout.trim() {
        // No healthcheck configured on the image.
        "" | "none" => return Ok(()),
        "healthy" => return Ok(()),
        "unhealthy" => {
          return Err(anyhow::anyhow!(
            "Container {name} is unhealthy"
          ));
        }
        _ => tokio::time::sleep(HEALTH_POLL).await,
      }
    }
    Err(anyhow::anyhow!(
      "Container {name} did not become healthy in time"
    ))
  }

  async fn run(
    &self,
    stage: &str,
    cmd: &str,
    logs: &mut Vec<Log>,
  ) -> anyhow::Result<CommandResult> {
    run_logged(self.shell, stage, cmd, self.replacers, logs).await
  }
}

/// Rewind to the prior generation: remove the failed new
/// container, rename the archive back. Returns whether the
/// rollback fully succeeded.
pub async fn rollback_generation<S: RemoteShell>(
  shell: &S,
  engine: &Engine,
  spec: &ServiceSpec,
  old_container: Option<&str>,
  logs: &mut Vec<Log>,
) -> bool {
  let name = spec.container_name();
  let Ok(rm) =
    run_logged(shell, "Rollback", &engine.rm(&name, true), &[], logs)
      .await
  else {
    return false;
  };
  let mut ok = rm.success();
  if let Some(old_container) = old_container {
    match run_logged(
      shell,
      "Rollback",
      &engine.rename(old_container, &name),
      &[],
      logs,
    )
    .await
    {
      Ok(rename) => ok = ok && rename.success(),
      Err(_) => return false,
    }
  }
  ok
}

/// Best-effort removal of archived generations beyond `retain`.
/// Returns the removed container names.
pub async fn cleanup_generations<S: RemoteShell>(
  shell: &S,
  engine: &Engine,
  spec: &ServiceSpec,
  logs: &mut Vec<Log>,
) -> anyhow::Result<Vec<String>> {
  let prefix =
    format!("{}{ARCHIVE_INFIX}", spec.container_name());
  let listing = run_logged(
    shell,
    "Cleanup",
    &engine.ps_names(&format!("{prefix}.*")),
    &[],
    logs,
  )
  .await?;
  let mut archived = listing
    .stdout
    .lines()
    .filter_map(|line| {
      let name = line.trim();
      let epoch =
        name.strip_prefix(&prefix)?.parse::<i64>().ok()?;
      Some((epoch, name.to_string()))
    })
    .collect::<Vec<_>>();
  // Newest first, keep everything within retain.
  archived.sort_by(|a, b| b.0.cmp(&a.0));
  let keep = spec.retain.saturating_sub(1) as usize;
  let mut removed = Vec::new();
  for (_, name) in archived.into_iter().skip(keep) {
    let rm =
      run_logged(shell, "Cleanup", &engine.rm(&name, true), &[], logs)
        .await?;
    if rm.success() {
      removed.push(name);
    }
  }
  Ok(removed)
}

/// Resolve the image reference for a service + version pair.
pub fn resolve_image(
  spec: &ServiceSpec,
  registry: Option<&str>,
  version: Option<&str>,
) -> String {
  match &spec.source {
    ServiceSource::Image(_) => spec.image_reference(None, version),
    ServiceSource::Build(_) => {
      spec.image_reference(registry, version)
    }
  }
}

/// Named volumes to pre-create: `name:/path` mounts where the
/// source is not a host path.
fn named_volumes(spec: &ServiceSpec) -> Vec<String> {
  spec
    .volumes
    .iter()
    .filter_map(|volume| {
      let (source, _) = volume.split_once(':')?;
      (!source.starts_with('/') && !source.starts_with('.'))
        .then(|| source.to_string())
    })
    .collect()
}

async fn run_logged<S: RemoteShell>(
  shell: &S,
  stage: &str,
  cmd: &str,
  replacers: &[(String, String)],
  logs: &mut Vec<Log>,
) -> anyhow::Result<CommandResult> {
  let start_ts = jiji_timestamp();
  let result = shell.execute_command(cmd).await?;
  let mut log = Log {
    stage: stage.to_string(),
    command: cmd.to_string(),
    stdout: result.stdout.clone(),
    stderr: result.stderr.clone(),
    success: result.success(),
    start_ts,
    end_ts: jiji_timestamp(),
  };
  if !replacers.is_empty() {
    log.command = svi::replace_in_string(&log.command, replacers);
    log.stdout = svi::replace_in_string(&log.stdout, replacers);
    log.stderr = svi::replace_in_string(&log.stderr, replacers);
  }
  logs.push(log);
  Ok(result)
}
