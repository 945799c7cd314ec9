#[macro_use]
extern crate tracing;

use std::process::ExitCode;

use anyhow::Context;
use jiji_client::entities::config::cli::Command;

use crate::config::CliContext;

mod builder;
mod command;
mod config;
mod deploy;
mod docker;
mod helpers;
mod secrets;
mod shell;

async fn app() -> anyhow::Result<ExitCode> {
  dotenvy::dotenv().ok();
  let ctx = CliContext::from_env()?;
  logger::init(&ctx.log_config())?;

  match &ctx.args.command {
    Command::Deploy(args) => {
      command::deploy::handle(&ctx, args).await
    }
    Command::Config { unsanitized } => {
      let (deploy_config, warnings) =
        match ctx.load_deploy_config() {
          Ok(loaded) => loaded,
          Err(e) => {
            error!("Invalid configuration | {e:#}");
            return Ok(ExitCode::from(2));
          }
        };
      for warning in &warnings {
        warn!("{warning}");
      }
      println!(
        "{}",
        serde_json::to_string_pretty(&deploy_config)
          .context("Failed to serialize config for pretty print")?
      );
      if *unsanitized {
        let store = crate::secrets::SecretStore::load(
          deploy_config.secrets_path.as_deref(),
        );
        match store.resolve(&deploy_config.secrets) {
          Ok(resolved) => {
            for (name, value) in resolved {
              println!("{name}={value}");
            }
          }
          Err(e) => warn!("{e:#}"),
        }
      }
      Ok(ExitCode::SUCCESS)
    }
    Command::Proxy { command } => {
      command::proxy::handle(&ctx, command).await
    }
  }
}

#[tokio::main]
async fn main() -> ExitCode {
  let mut term_signal = match tokio::signal::unix::signal(
    tokio::signal::unix::SignalKind::terminate(),
  ) {
    Ok(signal) => signal,
    Err(e) => {
      eprintln!("Failed to install signal handler | {e:?}");
      return ExitCode::FAILURE;
    }
  };
  let res = tokio::select! {
    res = tokio::spawn(app()) => res,
    _ = term_signal.recv() => return ExitCode::FAILURE,
  };
  match res {
    Ok(Ok(code)) => code,
    Ok(Err(e)) => {
      eprintln!("{e:#}");
      ExitCode::FAILURE
    }
    Err(e) => {
      eprintln!("{e:?}");
      ExitCode::FAILURE
    }
  }
}
