//! The deployment orchestrator.
//!
//! Four barrier-separated phases over the (service, host) work
//! set: ProxyInstall -> Deploy -> ProxyConfig -> Cleanup. Within
//! a phase every task runs in parallel, one per targeted pair.
//! Failures are collected into the typed [DeploymentResult];
//! rollback is local to the affected pair and strictly
//! health-driven.

use std::collections::{HashMap, HashSet};

use futures::future::join_all;
use indexmap::{IndexMap, IndexSet};
use jiji_client::entities::{
  config::ResolvedConfig,
  deployment::{DeploymentResult, ServiceDeployResult},
  service::ServiceSpec,
};
use tokio_util::sync::CancellationToken;

use crate::{docker::Engine, shell::RemoteShell};

pub mod host;
pub mod proxy;

pub struct Orchestrator<'a, S: RemoteShell> {
  pub config: &'a ResolvedConfig,
  /// One shell per targeted server, keyed by server name.
  pub shells: &'a IndexMap<String, S>,
  pub engine: Engine,
  /// Override version tag for this run.
  pub version: Option<String>,
  /// Resolved secret values by variable name.
  pub secret_values: HashMap<String, String>,
  /// Secret value replacers applied to all captured logs.
  pub replacers: Vec<(String, String)>,
}

impl<S: RemoteShell> Orchestrator<'_, S> {
  /// Run the full deployment over the selected services.
  pub async fn deploy(
    &self,
    services: &[&ServiceSpec],
    cancel: &CancellationToken,
  ) -> DeploymentResult {
    let mut result = DeploymentResult::default();

    let work = services
      .iter()
      .flat_map(|service| {
        service
          .hosts
          .iter()
          .map(move |host| (*service, host.as_str()))
      })
      .collect::<Vec<_>>();
    let hosts = work
      .iter()
      .map(|(_, host)| *host)
      .collect::<IndexSet<_>>();

    // Phase 1: ProxyInstall, every targeted host.
    let installs =
      join_all(hosts.iter().map(|&host| async move {
        proxy::ensure_proxy(
          &self.shells[host],
          &self.engine,
          &self.config.network,
        )
        .await
      }))
      .await;
    let failed_proxy_hosts = installs
      .iter()
      .filter(|install| !install.success)
      .map(|install| install.host.clone())
      .collect::<HashSet<_>>();
    for install in &installs {
      if let Some(error) = &install.error {
        result
          .errors
          .push(format!("[{}] {error}", install.host));
      }
    }
    result.proxy_install_results = installs;

    // Phase 2: Deploy, every (service, host) pair.
    if cancel.is_cancelled() {
      result
        .warnings
        .push(String::from("Deployment cancelled before deploy phase"));
      return finish(result);
    }
    let failed_proxy_hosts = &failed_proxy_hosts;
    let deployments =
      join_all(work.iter().map(|&(service, host)| async move {
        if service.proxy_enabled()
          && failed_proxy_hosts.contains(host)
        {
          return ServiceDeployResult {
            service: service.name.clone(),
            host: host.to_string(),
            error: Some(String::from(
              "Skipped: proxy installation failed on host",
            )),
            ..Default::default()
          };
        }
        let image = host::resolve_image(
          service,
          self.config.registry.as_deref(),
          self.version.as_deref(),
        );
        let env = self.service_env(service);
        let driver = host::HostDriver {
          shell: &self.shells[host],
          engine: &self.engine,
          spec: service,
          network: &self.config.network,
          image: &image,
          env: &env,
          replacers: &self.replacers,
        };
        driver.deploy().await
      }))
      .await;
    for deployment in &deployments {
      if let Some(error) = &deployment.error {
        result.errors.push(format!(
          "[{}/{}] {error}",
          deployment.host, deployment.service
        ));
      }
    }
    result.deployment_results = deployments;

    // Phase 3: ProxyConfig, the health gate. The only phase which
    // can trigger rollback.
    if cancel.is_cancelled() {
      result.warnings.push(String::from(
        "Deployment cancelled before proxy configuration",
      ));
      return finish(result);
    }
    let cut_overs = join_all(
      result
        .deployment_results
        .iter()
        .filter(|deployment| {
          deployment.success
            && service_by_name(services, &deployment.service)
              .map(|service| service.proxy_enabled())
              .unwrap_or_default()
        })
        .map(|deployment| async move {
          let service =
            service_by_name(services, &deployment.service)
              .expect("filtered on existing service");
          let shell = &self.shells[deployment.host.as_str()];
          let mut logs = Vec::new();
          let config_result = proxy::configure_service(
            shell,
            &self.engine,
            service,
            &self.config.network,
            &mut logs,
          )
          .await;
          let rolled_back = if config_result.success {
            false
          } else {
            host::rollback_generation(
              shell,
              &self.engine,
              service,
              deployment.old_container.as_deref(),
              &mut logs,
            )
            .await
          };
          (config_result, rolled_back, logs)
        }),
    )
    .await;
    for (config_result, rolled_back, logs) in cut_overs {
      if let Some(error) = &config_result.error {
        result.errors.push(format!(
          "[{}/{}] {error}",
          config_result.host, config_result.service
        ));
      }
      if let Some(deployment) = result
        .deployment_results
        .iter_mut()
        .find(|deployment| {
          deployment.service == config_result.service
            && deployment.host == config_result.host
        })
      {
        deployment.logs.extend(logs);
        if !config_result.success {
          deployment.success = false;
          deployment.rolled_back = rolled_back;
          deployment.error = config_result.error.clone();
        }
      }
      result.proxy_config_results.push(config_result);
    }

    // Phase 4: Cleanup, best effort.
    if cancel.is_cancelled() {
      result
        .warnings
        .push(String::from("Deployment cancelled before cleanup"));
      return finish(result);
    }
    let cleanups = join_all(
      result
        .deployment_results
        .iter()
        .filter(|deployment| deployment.success)
        .map(|deployment| async move {
          let service =
            service_by_name(services, &deployment.service)
              .expect("deployment result names a selected service");
          let shell = &self.shells[deployment.host.as_str()];
          let mut logs = Vec::new();
          let outcome = host::cleanup_generations(
            shell,
            &self.engine,
            service,
            &mut logs,
          )
          .await;
          (
            deployment.service.clone(),
            deployment.host.clone(),
            outcome,
            logs,
          )
        }),
    )
    .await;
    for (service, host, outcome, logs) in cleanups {
      if let Err(e) = outcome {
        result.warnings.push(format!(
          "[{host}/{service}] Cleanup failed | {e:#}"
        ));
      }
      if let Some(deployment) =
        result.deployment_results.iter_mut().find(|deployment| {
          deployment.service == service && deployment.host == host
        })
      {
        deployment.logs.extend(logs);
      }
    }

    finish(result)
  }

  /// Merged env handed to `docker run`: clear variables in file
  /// order, then resolved secrets.
  fn service_env(
    &self,
    service: &ServiceSpec,
  ) -> Vec<(String, String)> {
    let mut env = service
      .env
      .clear
      .iter()
      .map(|(key, value)| (key.clone(), value.clone()))
      .collect::<Vec<_>>();
    for name in &service.env.secrets {
      if let Some(value) = self.secret_values.get(name) {
        env.push((name.clone(), value.clone()));
      }
    }
    env
  }
}

fn service_by_name<'a>(
  services: &[&'a ServiceSpec],
  name: &str,
) -> Option<&'a ServiceSpec> {
  services
    .iter()
    .find(|service| service.name == name)
    .copied()
}

fn finish(mut result: DeploymentResult) -> DeploymentResult {
  result.success = result.errors.is_empty()
    && result
      .proxy_install_results
      .iter()
      .all(|install| install.success)
    && result
      .deployment_results
      .iter()
      .all(|deployment| deployment.success)
    && result
      .proxy_config_results
      .iter()
      .all(|config| config.success);
  result
}

#[cfg(test)]
mod tests {
  use jiji_client::entities::{
    config::DeployConfig, deployment::summary,
  };

  use crate::shell::testing::RecordingShell;

  use super::*;

  /// Two web replicas behind the proxy, one unproxied api.
  fn config() -> ResolvedConfig {
    let config: DeployConfig = serde_json::from_value(
      serde_json::json!({
        "project": "test",
        "servers": {
          "web-1": { "host": "10.0.1.1" },
          "web-2": { "host": "10.0.1.2" },
          "api-1": { "host": "10.0.1.3" }
        },
        "services": {
          "web": {
            "image": "acme/web",
            "hosts": ["web-1", "web-2"],
            "ports": ["80:8080"],
            "proxy": {
              "host": "app.example.com",
              "healthcheck": { "deploy_timeout": 2 }
            }
          },
          "api": {
            "image": "acme/api",
            "hosts": ["api-1"],
            "ports": ["3000"]
          }
        }
      }),
    )
    .unwrap();
    config.resolve().unwrap()
  }

  /// Fresh host: nothing listed, new containers report running.
  fn fresh_shell(host: &str) -> RecordingShell {
    RecordingShell::new(host)
      .rule(".State.Status", 0, "running\n", "")
      .rule("IPAddress", 0, "172.18.0.5\n", "")
  }

  /// Host with a prior generation of the named service.
  fn updating_shell(host: &str, container: &str) -> RecordingShell {
    RecordingShell::new(host)
      .rule(
        &format!("name='^{container}$'"),
        0,
        &format!("{container}\n"),
        "",
      )
      .rule(
        &format!("name='^{container}_old_"),
        0,
        &format!("{container}_old_1700000000000\n"),
        "",
      )
      .rule(".State.Status", 0, "running\n", "")
      .rule("IPAddress", 0, "172.18.0.5\n", "")
  }

  fn shells_of(
    entries: Vec<(&str, RecordingShell)>,
  ) -> IndexMap<String, RecordingShell> {
    entries
      .into_iter()
      .map(|(host, shell)| (host.to_string(), shell))
      .collect()
  }

  fn orchestrator<'a>(
    config: &'a ResolvedConfig,
    shells: &'a IndexMap<String, RecordingShell>,
    version: &str,
  ) -> Orchestrator<'a, RecordingShell> {
    Orchestrator {
      config,
      shells,
      engine: Engine::new("docker"),
      version: Some(version.to_string()),
      secret_values: HashMap::new(),
      replacers: Vec::new(),
    }
  }

  #[tokio::test]
  async fn fresh_deploy_two_web_replicas_one_api() {
    let config = config();
    let shells = shells_of(vec![
      ("web-1", fresh_shell("web-1")),
      ("web-2", fresh_shell("web-2")),
      ("api-1", fresh_shell("api-1")),
    ]);
    let services = config.services.iter().collect::<Vec<_>>();
    let result = orchestrator(&config, &shells, "v1.0.0")
      .deploy(&services, &CancellationToken::new())
      .await;

    assert!(result.success, "errors: {:?}", result.errors);
    assert_eq!(result.proxy_install_results.len(), 3);
    assert!(
      result.proxy_install_results.iter().all(|r| r.success)
    );
    assert_eq!(result.deployment_results.len(), 3);
    assert!(
      result
        .deployment_results
        .iter()
        .all(|r| r.success && r.fresh && r.old_container.is_none())
    );
    assert_eq!(result.proxy_config_results.len(), 2);
    assert!(result.proxy_config_results.iter().all(|r| r.success));
    let summary = summary(&result);
    assert_eq!(summary.total_services, 3);
    assert_eq!(summary.failed_deployments, 0);
    assert!(!summary.has_errors);
  }

  #[tokio::test]
  async fn update_archives_and_removes_old_generation() {
    let config = config();
    let shells = shells_of(vec![
      ("web-1", updating_shell("web-1", "test-web")),
      ("web-2", updating_shell("web-2", "test-web")),
      ("api-1", updating_shell("api-1", "test-api")),
    ]);
    let services = config.services.iter().collect::<Vec<_>>();
    let result = orchestrator(&config, &shells, "v1.1.0")
      .deploy(&services, &CancellationToken::new())
      .await;

    assert!(result.success, "errors: {:?}", result.errors);
    let summary = summary(&result);
    assert_eq!(summary.successful_deployments, 3);
    for (host, container) in [
      ("web-1", "test-web"),
      ("web-2", "test-web"),
      ("api-1", "test-api"),
    ] {
      let commands = shells[host].commands();
      assert!(
        commands.iter().any(|cmd| cmd
          .starts_with(&format!("docker rename {container} "))),
        "[{host}] missing archive rename: {commands:#?}"
      );
      assert!(
        commands.iter().any(|cmd| cmd
          == &format!(
            "docker rm --force {container}_old_1700000000000"
          )),
        "[{host}] missing old removal: {commands:#?}"
      );
    }
    // Archived generations are recorded on the results.
    assert!(
      result
        .deployment_results
        .iter()
        .all(|r| !r.fresh && r.old_container.is_some())
    );
  }

  #[tokio::test]
  async fn health_gate_failure_rolls_back() {
    let config = config();
    let failing_web = |host: &str| {
      updating_shell(host, "test-web")
        .rule("kamal-proxy deploy web", 1, "", "target timed out")
    };
    let shells = shells_of(vec![
      ("web-1", failing_web("web-1")),
      ("web-2", failing_web("web-2")),
      ("api-1", updating_shell("api-1", "test-api")),
    ]);
    let services = config.services.iter().collect::<Vec<_>>();
    let result = orchestrator(&config, &shells, "v1.1.0")
      .deploy(&services, &CancellationToken::new())
      .await;

    assert!(!result.success);
    for host in ["web-1", "web-2"] {
      let commands = shells[host].commands();
      let renames = commands
        .iter()
        .filter(|cmd| cmd.starts_with("docker rename "))
        .count();
      assert!(
        renames >= 2,
        "[{host}] expected archive + restore renames: {commands:#?}"
      );
      // The failed new generation is removed, not the archive.
      assert!(
        commands
          .iter()
          .any(|cmd| cmd == "docker rm --force test-web"),
      );
      let web = result
        .deployment_results
        .iter()
        .find(|r| r.host == host && r.service == "web")
        .unwrap();
      assert!(!web.success);
      assert!(web.rolled_back);
    }
    // The restore rename points the archive back at the
    // canonical name.
    let commands = shells["web-1"].commands();
    assert!(commands.iter().any(|cmd| {
      cmd.starts_with("docker rename test-web_old_")
        && cmd.ends_with(" test-web")
    }));
    let api = result
      .deployment_results
      .iter()
      .find(|r| r.service == "api")
      .unwrap();
    assert!(api.success);
  }

  #[tokio::test]
  async fn partial_proxy_install_failure() {
    let config = config();
    let shells = shells_of(vec![
      ("web-1", fresh_shell("web-1")),
      (
        "web-2",
        fresh_shell("web-2").rule(
          "run -d --name kamal-proxy",
          1,
          "",
          "port 80 already bound",
        ),
      ),
      ("api-1", fresh_shell("api-1")),
    ]);
    let services = config.services.iter().collect::<Vec<_>>();
    let result = orchestrator(&config, &shells, "v1.0.0")
      .deploy(&services, &CancellationToken::new())
      .await;

    assert!(!result.success);
    assert_eq!(result.proxy_install_results.len(), 3);
    assert_eq!(
      result
        .proxy_install_results
        .iter()
        .filter(|r| !r.success)
        .count(),
      1
    );
    assert!(
      result
        .errors
        .iter()
        .any(|error| error.contains("proxy installation"))
    );
    // The proxied service is skipped on the failed host only.
    let web_2 = result
      .deployment_results
      .iter()
      .find(|r| r.host == "web-2" && r.service == "web")
      .unwrap();
    assert!(!web_2.success);
    let api = result
      .deployment_results
      .iter()
      .find(|r| r.service == "api")
      .unwrap();
    assert!(api.success);
  }

  #[tokio::test]
  async fn unreachable_host_is_a_local_failure() {
    let config = config();
    let shells = shells_of(vec![
      ("web-1", fresh_shell("web-1")),
      ("web-2", RecordingShell::unreachable("web-2")),
      ("api-1", fresh_shell("api-1")),
    ]);
    let services = config.services.iter().collect::<Vec<_>>();
    let result = orchestrator(&config, &shells, "v1.0.0")
      .deploy(&services, &CancellationToken::new())
      .await;

    assert!(!result.success);
    let summary = summary(&result);
    assert_eq!(summary.total_services, 3);
    assert_eq!(summary.failed_deployments, 1);
    assert!(summary.has_errors);
    // Other hosts proceed.
    assert_eq!(summary.successful_deployments, 2);
  }

  #[tokio::test]
  async fn cancellation_stops_new_phases_only() {
    let config = config();
    let shells = shells_of(vec![
      ("web-1", fresh_shell("web-1")),
      ("web-2", fresh_shell("web-2")),
      ("api-1", fresh_shell("api-1")),
    ]);
    let services = config.services.iter().collect::<Vec<_>>();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = orchestrator(&config, &shells, "v1.0.0")
      .deploy(&services, &cancel)
      .await;

    // Proxy install already ran, deploy never started.
    assert_eq!(result.proxy_install_results.len(), 3);
    assert!(result.deployment_results.is_empty());
    assert!(!result.warnings.is_empty());
  }
}

