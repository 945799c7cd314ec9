#[macro_use]
extern crate tracing;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::{
  config::DiscoveryConfig, dns::DnsServer, index::ServiceIndex,
  subscriber::Subscriber,
};

mod config;
mod dns;
mod index;
mod subscriber;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  dotenvy::dotenv().ok();
  let config = DiscoveryConfig::from_env()?;
  logger::init(&config.logging)?;
  info!(
    "jiji-discovery starting | domain: {} | listeners: {:?}",
    config.service_domain, config.listeners
  );

  let index = Arc::new(ServiceIndex::new());
  let cancel = CancellationToken::new();

  let subscriber_task = tokio::spawn({
    let index = index.clone();
    let cancel = cancel.clone();
    let subscriber = Subscriber {
      api: config.corrosion_api.clone(),
      reconnect_base: config.reconnect_interval,
      max_attempts: config.max_reconnect_attempts,
      handler: index,
    };
    async move { subscriber.run(cancel).await }
  });

  let server = Arc::new(DnsServer {
    index,
    service_domain: config.service_domain.clone(),
    ttl: config.dns_ttl,
    resolvers: dns::load_resolvers(
      &config
        .listeners
        .iter()
        .map(|listener| listener.ip())
        .collect::<Vec<_>>(),
    ),
  });
  let server_task = tokio::spawn(
    server.run(config.listeners.clone(), cancel.clone()),
  );

  let mut term_signal = tokio::signal::unix::signal(
    tokio::signal::unix::SignalKind::terminate(),
  )?;
  tokio::select! {
    _ = tokio::signal::ctrl_c() => {}
    _ = term_signal.recv() => {}
  }
  info!("shutting down");
  cancel.cancel();
  let _ = subscriber_task.await;
  server_task.await??;
  Ok(())
}
