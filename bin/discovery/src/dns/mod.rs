//! The udp dns server.
//!
//! One socket per configured listener, one spawned task per
//! inbound datagram so slow upstream forwarding never stalls a
//! receive loop. Names under the service domain are answered
//! from the index; everything else is forwarded to the first
//! usable upstream resolver.

use std::{
  net::{IpAddr, Ipv4Addr, SocketAddr},
  sync::Arc,
  time::Duration,
};

use anyhow::Context;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::index::ServiceIndex;

pub mod packet;

use packet::{
  DnsQuery, RCODE_NOERROR, RCODE_NXDOMAIN, RCODE_SERVFAIL, TYPE_A,
};

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5);
const RECV_BUFFER: usize = 1024;
/// Udp response budget. Answers beyond it are dropped rather
/// than truncating mid-record.
const MAX_RESPONSE: usize = 512;
const ANSWER_LEN: usize = 16;
const FALLBACK_RESOLVERS: [Ipv4Addr; 2] =
  [Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(1, 1, 1, 1)];

pub struct DnsServer {
  pub index: Arc<ServiceIndex>,
  /// Lowercased suffix answered authoritatively.
  pub service_domain: String,
  pub ttl: u32,
  /// Upstreams tried in order for out-of-domain names.
  pub resolvers: Vec<IpAddr>,
}

impl DnsServer {
  /// Bind every listener and serve until cancelled.
  pub async fn run(
    self: Arc<Self>,
    listeners: Vec<SocketAddr>,
    cancel: CancellationToken,
  ) -> anyhow::Result<()> {
    let mut tasks = Vec::with_capacity(listeners.len());
    for addr in listeners {
      let socket =
        Arc::new(UdpSocket::bind(addr).await.with_context(|| {
          format!("Failed to bind udp listener on {addr}")
        })?);
      info!("dns listening on {addr}");
      let server = self.clone();
      let cancel = cancel.clone();
      tasks.push(tokio::spawn(async move {
        server.listen(socket, cancel).await;
      }));
    }
    futures::future::join_all(tasks).await;
    Ok(())
  }

  async fn listen(
    self: Arc<Self>,
    socket: Arc<UdpSocket>,
    cancel: CancellationToken,
  ) {
    let mut buf = [0u8; RECV_BUFFER];
    loop {
      tokio::select! {
        _ = cancel.cancelled() => return,
        received = socket.recv_from(&mut buf) => {
          let (len, peer) = match received {
            Ok(received) => received,
            Err(e) => {
              warn!("udp receive failed | {e:?}");
              continue;
            }
          };
          let datagram = buf[..len].to_vec();
          let server = self.clone();
          let socket = socket.clone();
          tokio::spawn(async move {
            if let Some(response) = server.handle(&datagram).await
              && let Err(e) = socket.send_to(&response, peer).await
            {
              debug!("failed to send response to {peer} | {e:?}");
            }
          });
        }
      }
    }
  }

  /// Handle one datagram. None means drop silently.
  pub async fn handle(&self, datagram: &[u8]) -> Option<Vec<u8>> {
    let query = match packet::parse_query(datagram) {
      Ok(query) => query,
      Err(e) => {
        debug!("malformed query | {e}");
        return packet::transaction_id(datagram)
          .map(packet::build_servfail);
      }
    };
    if self.in_service_domain(&query.name) {
      Some(self.answer_local(&query))
    } else {
      Some(self.forward(datagram, &query).await)
    }
  }

  /// Whole-label suffix match, case insensitive: `jiji` matches
  /// `x.jiji` and the bare `jiji`, not `x.jijii`.
  fn in_service_domain(&self, name: &str) -> bool {
    let name = name.to_lowercase();
    name == self.service_domain
      || name
        .strip_suffix(&self.service_domain)
        .is_some_and(|prefix| prefix.ends_with('.'))
  }

  fn answer_local(&self, query: &DnsQuery) -> Vec<u8> {
    if query.qtype != TYPE_A {
      // AAAA and friends: empty NOERROR, qtype echoed with the
      // question section.
      return packet::build_response(
        query,
        RCODE_NOERROR,
        &[],
        self.ttl,
      );
    }
    let name = query.name.to_lowercase();
    let hostname = name
      .strip_suffix(&self.service_domain)
      .map(|prefix| prefix.trim_end_matches('.'))
      .unwrap_or_default();
    let mut ips = self.index.get(hostname);
    if ips.is_empty() {
      return packet::build_response(
        query,
        RCODE_NXDOMAIN,
        &[],
        self.ttl,
      );
    }
    let budget =
      (MAX_RESPONSE - 12 - query.question.len()) / ANSWER_LEN;
    if ips.len() > budget {
      warn!(
        "{} answers for {hostname} exceed the udp budget, keeping {budget}",
        ips.len()
      );
      ips.truncate(budget);
    }
    packet::build_response(query, RCODE_NOERROR, &ips, self.ttl)
  }

  /// Relay the raw datagram to the first upstream that answers.
  async fn forward(
    &self,
    datagram: &[u8],
    query: &DnsQuery,
  ) -> Vec<u8> {
    for resolver in &self.resolvers {
      match forward_to(*resolver, datagram).await {
        Ok(response) => return response,
        Err(e) => {
          debug!("resolver {resolver} failed for {} | {e:#}", query.name);
        }
      }
    }
    warn!("every upstream resolver failed for {}", query.name);
    packet::build_response(query, RCODE_SERVFAIL, &[], self.ttl)
  }
}

async fn forward_to(
  resolver: IpAddr,
  datagram: &[u8],
) -> anyhow::Result<Vec<u8>> {
  let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
    .await
    .context("Failed to bind ephemeral socket")?;
  socket
    .send_to(datagram, (resolver, 53))
    .await
    .context("send failed")?;
  let mut buf = [0u8; 4096];
  let (len, _) =
    tokio::time::timeout(UPSTREAM_TIMEOUT, socket.recv_from(&mut buf))
      .await
      .context("timed out")?
      .context("receive failed")?;
  Ok(buf[..len].to_vec())
}

/// Upstream resolvers from the system config, excluding loopback
/// and our own listen addresses, with public fallbacks.
pub fn load_resolvers(own_ips: &[IpAddr]) -> Vec<IpAddr> {
  let contents = std::fs::read_to_string("/etc/resolv.conf")
    .unwrap_or_default();
  let mut resolvers = system_resolvers(&contents, own_ips);
  if resolvers.is_empty() {
    resolvers
      .extend(FALLBACK_RESOLVERS.into_iter().map(IpAddr::V4));
  }
  resolvers
}

fn system_resolvers(
  resolv_conf: &str,
  own_ips: &[IpAddr],
) -> Vec<IpAddr> {
  let mut resolvers = Vec::new();
  for line in resolv_conf.lines() {
    let Some(rest) = line.trim().strip_prefix("nameserver") else {
      continue;
    };
    let Ok(ip) = rest.trim().parse::<IpAddr>() else {
      continue;
    };
    if ip.is_loopback()
      || own_ips.contains(&ip)
      || resolvers.contains(&ip)
    {
      continue;
    }
    resolvers.push(ip);
  }
  resolvers
}
