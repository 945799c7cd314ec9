use std::{collections::HashMap, process::ExitCode};

use comfy_table::{Cell, Table};
use indexmap::IndexMap;
use jiji_client::entities::{
  config::cli::Deploy,
  deployment::{DeploymentResult, summary},
  server::Architecture,
};
use tokio_util::sync::CancellationToken;

use crate::{
  builder::ImageBuilder,
  config::CliContext,
  deploy::Orchestrator,
  docker::Engine,
  helpers::matcher::select_services,
  secrets::SecretStore,
  shell::SshShell,
};

pub async fn handle(
  ctx: &CliContext,
  args: &Deploy,
) -> anyhow::Result<ExitCode> {
  let (deploy_config, warnings) = match ctx.load_deploy_config() {
    Ok(loaded) => loaded,
    Err(e) => {
      error!("Invalid configuration | {e:#}");
      return Ok(ExitCode::from(2));
    }
  };
  for warning in &warnings {
    warn!("{warning}");
  }

  let selected = match select_services(
    &deploy_config.services,
    &args.services,
  ) {
    Ok(selected) => selected,
    Err(e) => {
      error!("{e:#}");
      return Ok(ExitCode::from(2));
    }
  };
  if selected.is_empty() {
    warn!("No services matched the given patterns");
    return Ok(ExitCode::SUCCESS);
  }
  info!(
    "Deploying services: {}",
    selected
      .iter()
      .map(|service| service.name.as_str())
      .collect::<Vec<_>>()
      .join(", ")
  );

  // Resolve every needed secret before touching any host.
  let store =
    SecretStore::load(deploy_config.secrets_path.as_deref());
  let mut secret_names = deploy_config.secrets.clone();
  for service in &selected {
    for name in &service.env.secrets {
      if !secret_names.contains(name) {
        secret_names.push(name.clone());
      }
    }
  }
  let resolved_secrets = match store.resolve(&secret_names) {
    Ok(resolved) => resolved,
    Err(e) => {
      error!("{e:#}");
      return Ok(ExitCode::from(2));
    }
  };
  let replacers = SecretStore::replacers(&resolved_secrets);
  let secret_values = resolved_secrets
    .into_iter()
    .collect::<HashMap<String, String>>();

  let engine = Engine::new(ctx.env.jiji_engine.as_str());

  // Build + push images before any host sees the new version.
  if !args.skip_build {
    let builder = ImageBuilder {
      engine: &engine,
      registry: deploy_config.registry.as_deref(),
      push: deploy_config.push_builds,
    };
    let version = args.version.as_deref().unwrap_or("latest");
    for service in &selected {
      let archs = service_archs(service, &deploy_config);
      if let Err(e) =
        builder.build_service(service, &archs, version).await
      {
        error!("{e:#}");
        return Ok(ExitCode::FAILURE);
      }
    }
  }

  let mut shells = IndexMap::new();
  for service in &selected {
    for host in &service.hosts {
      if shells.contains_key(host) {
        continue;
      }
      // Resolution guarantees the server exists.
      let server = deploy_config.servers[host.as_str()].clone();
      shells.insert(host.clone(), SshShell::new(server));
    }
  }

  let cancel = CancellationToken::new();
  tokio::spawn({
    let cancel = cancel.clone();
    async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        warn!(
          "Interrupt received, finishing in-flight work without starting new phases"
        );
        cancel.cancel();
      }
    }
  });

  let orchestrator = Orchestrator {
    config: &deploy_config,
    shells: &shells,
    engine,
    version: args.version.clone(),
    secret_values,
    replacers,
  };
  let result = orchestrator.deploy(&selected, &cancel).await;

  render(&result);
  if result.success {
    Ok(ExitCode::SUCCESS)
  } else {
    Ok(ExitCode::FAILURE)
  }
}

fn service_archs(
  service: &jiji_client::entities::service::ServiceSpec,
  config: &jiji_client::entities::config::ResolvedConfig,
) -> Vec<Architecture> {
  let mut archs = Vec::new();
  for host in &service.hosts {
    if let Some(server) = config.server(host)
      && !archs.contains(&server.arch)
    {
      archs.push(server.arch);
    }
  }
  archs
}

fn render(result: &DeploymentResult) {
  for deployment in &result.deployment_results {
    if deployment.success {
      continue;
    }
    error!(
      "[{}/{}] deployment failed{}",
      deployment.host,
      deployment.service,
      if deployment.rolled_back {
        " (rolled back to prior generation)"
      } else {
        ""
      },
    );
    for log in &deployment.logs {
      if !log.success {
        error!(
          "[{}/{}] {} | {} | {}",
          deployment.host,
          deployment.service,
          log.stage,
          log.command,
          log.combined(),
        );
      }
    }
  }
  for warning in &result.warnings {
    warn!("{warning}");
  }

  let summary = summary(result);
  let mut table = Table::new();
  table.set_header(vec![
    "Deployments",
    "Successful",
    "Failed",
    "Proxy installs",
    "Proxy configs",
  ]);
  table.add_row(vec![
    Cell::new(summary.total_services),
    Cell::new(summary.successful_deployments),
    Cell::new(summary.failed_deployments),
    Cell::new(summary.proxy_installations),
    Cell::new(summary.proxy_configurations),
  ]);
  println!("{table}");

  if result.success {
    info!("Deployment complete");
  } else {
    error!("Deployment finished with errors");
    for error in &result.errors {
      error!("{error}");
    }
  }
}
