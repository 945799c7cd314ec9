use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

/// A container's discovery record, mirrored from the state store.
///
/// The store owns the record; the local index holds a read-through
/// projection which is never written back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsRecord {
  /// Primary key, opaque.
  pub container_id: String,
  pub service: String,
  pub project: String,
  /// The server the container runs on.
  pub server_id: String,
  pub ip: Ipv4Addr,
  pub healthy: bool,
  /// Monotonic start marker, newest wins per (hostname, server).
  pub started_at: i64,
  #[serde(default)]
  pub instance_id: Option<String>,
}

impl DnsRecord {
  /// Hostnames the record answers on, lowercased:
  /// `<project>-<service>` and, with an instance id,
  /// `<project>-<service>-<instance_id>`.
  pub fn hostnames(&self) -> Vec<String> {
    let primary =
      format!("{}-{}", self.project, self.service).to_lowercase();
    match &self.instance_id {
      Some(instance_id) => {
        let instance = format!("{primary}-{instance_id}")
          .to_lowercase();
        vec![primary, instance]
      }
      None => vec![primary],
    }
  }
}

/// Strict dotted-quad parse: exactly four octets in 0-255,
/// no leading zeros, no extraneous characters.
pub fn parse_ipv4(s: &str) -> Option<Ipv4Addr> {
  let mut octets = [0u8; 4];
  let mut count = 0;
  for part in s.split('.') {
    if count == 4 {
      return None;
    }
    if part.is_empty() || part.len() > 3 {
      return None;
    }
    if part.len() > 1 && part.starts_with('0') {
      return None;
    }
    if !part.bytes().all(|b| b.is_ascii_digit()) {
      return None;
    }
    octets[count] = part.parse::<u16>().ok().filter(|o| *o <= 255)?
      as u8;
    count += 1;
  }
  (count == 4).then(|| Ipv4Addr::from(octets))
}
