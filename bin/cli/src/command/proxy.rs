use std::process::ExitCode;

use comfy_table::Table;
use jiji_client::entities::config::cli::ProxyCommand;

use crate::{
  config::CliContext, deploy::proxy, docker::Engine,
  shell::SshShell,
};

pub async fn handle(
  ctx: &CliContext,
  command: &ProxyCommand,
) -> anyhow::Result<ExitCode> {
  match command {
    ProxyCommand::List { server } => {
      list(ctx, server.as_deref()).await
    }
  }
}

async fn list(
  ctx: &CliContext,
  server: Option<&str>,
) -> anyhow::Result<ExitCode> {
  let (deploy_config, _) = match ctx.load_deploy_config() {
    Ok(loaded) => loaded,
    Err(e) => {
      error!("Invalid configuration | {e:#}");
      return Ok(ExitCode::from(2));
    }
  };
  let engine = Engine::new(ctx.env.jiji_engine.as_str());

  let mut failed = false;
  for server_ref in deploy_config.servers.values() {
    if let Some(only) = server
      && server_ref.name != only
    {
      continue;
    }
    let shell = SshShell::new(server_ref.clone());
    match proxy::list(&shell, &engine).await {
      Ok(entries) => {
        let mut table = Table::new();
        table.set_header(vec![
          "Service", "Host", "Path", "Target", "State", "TLS",
        ]);
        for entry in entries {
          table.add_row(vec![
            entry.service,
            entry.host,
            entry.path,
            entry.target,
            entry.state,
            entry.tls,
          ]);
        }
        println!("{}:\n{table}", server_ref.name);
      }
      Err(e) => {
        error!("[{}] {e:#}", server_ref.name);
        failed = true;
      }
    }
  }
  if failed {
    Ok(ExitCode::FAILURE)
  } else {
    Ok(ExitCode::SUCCESS)
  }
}
