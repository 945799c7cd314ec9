//! The in-memory hostname -> ips index.
//!
//! Holds a health-filtered projection of the state store's
//! container records. The subscriber writes, the dns server
//! reads. Both maps live behind one lock so an upsert appears
//! atomic to readers.

use std::{
  collections::HashMap,
  net::Ipv4Addr,
  sync::RwLock,
};

use jiji_client::entities::dns::DnsRecord;

#[derive(Default)]
pub struct ServiceIndex {
  inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
  /// hostname -> container_id -> record
  by_hostname: HashMap<String, HashMap<String, DnsRecord>>,
  by_container_id: HashMap<String, DnsRecord>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexStats {
  pub total_records: usize,
  pub healthy_records: usize,
  pub hostnames: usize,
}

impl ServiceIndex {
  pub fn new() -> ServiceIndex {
    ServiceIndex::default()
  }

  /// Insert or replace a record under every hostname it answers
  /// on. Replacing drops the prior version's hostnames first, in
  /// case the instance id changed.
  pub fn set(&self, record: DnsRecord) {
    let mut inner = self.inner.write().expect("index lock");
    if let Some(prior) =
      inner.by_container_id.remove(&record.container_id)
    {
      remove_hostnames(&mut inner, &prior);
    }
    for hostname in record.hostnames() {
      inner
        .by_hostname
        .entry(hostname)
        .or_default()
        .insert(record.container_id.clone(), record.clone());
    }
    inner
      .by_container_id
      .insert(record.container_id.clone(), record);
  }

  /// Healthy ips for a hostname, newest per server, in stable
  /// (server, container) order. Lookup is case insensitive.
  pub fn get(&self, hostname: &str) -> Vec<Ipv4Addr> {
    let inner = self.inner.read().expect("index lock");
    let Some(records) =
      inner.by_hostname.get(&hostname.to_lowercase())
    else {
      return Vec::new();
    };
    // Newest record per server wins, ties broken by the
    // lexically greater container id.
    let mut winners: HashMap<&str, &DnsRecord> = HashMap::new();
    for record in
      records.values().filter(|record| record.healthy)
    {
      match winners.get(record.server_id.as_str()) {
        Some(current)
          if (current.started_at, &current.container_id)
            >= (record.started_at, &record.container_id) => {}
        _ => {
          winners.insert(&record.server_id, record);
        }
      }
    }
    let mut winners = winners.into_values().collect::<Vec<_>>();
    winners.sort_by(|a, b| {
      (&a.server_id, &a.container_id)
        .cmp(&(&b.server_id, &b.container_id))
    });
    winners.into_iter().map(|record| record.ip).collect()
  }

  /// Returns whether a record existed.
  pub fn remove(&self, container_id: &str) -> bool {
    let mut inner = self.inner.write().expect("index lock");
    let Some(record) = inner.by_container_id.remove(container_id)
    else {
      return false;
    };
    remove_hostnames(&mut inner, &record);
    true
  }

  pub fn stats(&self) -> IndexStats {
    let inner = self.inner.read().expect("index lock");
    IndexStats {
      total_records: inner.by_container_id.len(),
      healthy_records: inner
        .by_container_id
        .values()
        .filter(|record| record.healthy)
        .count(),
      hostnames: inner.by_hostname.len(),
    }
  }
}

fn remove_hostnames(inner: &mut Inner, record: &DnsRecord) {
  for hostname in record.hostnames() {
    if let Some(records) = inner.by_hostname.get_mut(&hostname) {
      records.remove(&record.container_id);
      if records.is_empty() {
        inner.by_hostname.remove(&hostname);
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn record(
    container_id: &str,
    server_id: &str,
    ip: [u8; 4],
    healthy: bool,
    started_at: i64,
  ) -> DnsRecord {
    DnsRecord {
      container_id: container_id.to_string(),
      service: String::from("api"),
      project: String::from("casa"),
      server_id: server_id.to_string(),
      ip: Ipv4Addr::from(ip),
      healthy,
      started_at,
      instance_id: None,
    }
  }

  #[test]
  fn lookup_is_case_insensitive() {
    let index = ServiceIndex::new();
    index.set(record("c1", "s1", [10, 0, 0, 1], true, 1000));
    assert_eq!(
      index.get("CASA-API"),
      vec![Ipv4Addr::new(10, 0, 0, 1)]
    );
  }

  #[test]
  fn unhealthy_records_do_not_resolve() {
    let index = ServiceIndex::new();
    index.set(record("c1", "s1", [10, 0, 0, 1], false, 1000));
    assert!(index.get("casa-api").is_empty());
    assert_eq!(index.stats().total_records, 1);
    assert_eq!(index.stats().healthy_records, 0);
  }

  #[test]
  fn newest_per_server_wins() {
    let index = ServiceIndex::new();
    index.set(record("c1", "s1", [10, 0, 0, 1], true, 1000));
    index.set(record("c2", "s1", [10, 0, 0, 2], true, 2000));
    index.set(record("c3", "s2", [10, 0, 1, 1], true, 500));
    assert_eq!(
      index.get("casa-api"),
      vec![Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(10, 0, 1, 1)]
    );
    // The shadowed record stays until its delete arrives.
    assert_eq!(index.stats().total_records, 3);
    assert!(index.remove("c2"));
    assert_eq!(
      index.get("casa-api"),
      vec![Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 1, 1)]
    );
  }

  #[test]
  fn started_at_tie_prefers_greater_container_id() {
    let index = ServiceIndex::new();
    index.set(record("ca", "s1", [10, 0, 0, 1], true, 1000));
    index.set(record("cb", "s1", [10, 0, 0, 2], true, 1000));
    assert_eq!(
      index.get("casa-api"),
      vec![Ipv4Addr::new(10, 0, 0, 2)]
    );
  }

  #[test]
  fn instance_hostname_resolves() {
    let index = ServiceIndex::new();
    let mut with_instance =
      record("c1", "s1", [10, 0, 0, 1], true, 1000);
    with_instance.instance_id = Some(String::from("Blue"));
    index.set(with_instance);
    assert_eq!(
      index.get("casa-api-blue"),
      vec![Ipv4Addr::new(10, 0, 0, 1)]
    );
    assert_eq!(index.stats().hostnames, 2);
  }

  #[test]
  fn set_then_remove_restores_exactly() {
    let index = ServiceIndex::new();
    index.set(record("c1", "s1", [10, 0, 0, 1], true, 1000));
    let before = index.stats();
    index.set(record("c2", "s2", [10, 0, 0, 2], true, 2000));
    assert!(index.remove("c2"));
    assert_eq!(index.stats(), before);
    assert!(!index.remove("c2"));
  }

  #[test]
  fn upsert_replaces_prior_hostnames() {
    let index = ServiceIndex::new();
    let mut initial = record("c1", "s1", [10, 0, 0, 1], true, 1000);
    initial.instance_id = Some(String::from("blue"));
    index.set(initial);
    assert_eq!(index.stats().hostnames, 2);
    // Same container comes back without an instance id.
    index.set(record("c1", "s1", [10, 0, 0, 1], true, 1001));
    assert_eq!(index.stats().hostnames, 1);
    assert!(index.get("casa-api-blue").is_empty());
  }
}
