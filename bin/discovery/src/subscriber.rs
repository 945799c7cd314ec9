//! Live subscription to the state store's container view.
//!
//! One long-lived chunked NDJSON response body per connection.
//! The decoder maps rows and change events into index mutations
//! through a [SubscriberHandler]; the reconnect loop applies
//! capped exponential backoff with jitter.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use futures::StreamExt;
use jiji_client::entities::dns::{DnsRecord, parse_ipv4};
use rand::Rng;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

pub const SUBSCRIPTION_ID: &str = "jiji-dns";
/// The containers-with-project view mirrored into the index.
pub const SUBSCRIPTION_QUERY: &str = "\
SELECT c.id, c.service, c.server_id, c.ip, c.health_status, \
c.started_at, c.instance_id, s.project \
FROM containers c JOIN services s ON c.service = s.name";

// Column indices are fixed; the stream's `columns` header is
// informational only.
const COL_ID: usize = 0;
const COL_SERVICE: usize = 1;
const COL_SERVER_ID: usize = 2;
const COL_IP: usize = 3;
const COL_HEALTH: usize = 4;
const COL_STARTED_AT: usize = 5;
const COL_INSTANCE_ID: usize = 6;
const COL_PROJECT: usize = 7;

/// Line assembly cap. A connection exceeding this is dropped and
/// re-established rather than growing without bound.
const MAX_LINE_BYTES: usize = 1024 * 1024;

const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Receives decoded subscription events.
pub trait SubscriberHandler {
  fn on_upsert(&self, record: DnsRecord);
  fn on_delete(&self, container_id: &str);
  /// Initial snapshot fully applied.
  fn on_ready(&self) {}
  fn on_reconnect(&self, _attempt: u32) {}
  /// Terminal failure, the subscriber has stopped.
  fn on_error(&self, _error: &anyhow::Error) {}
}

impl<H: SubscriberHandler> SubscriberHandler for Arc<H> {
  fn on_upsert(&self, record: DnsRecord) {
    self.as_ref().on_upsert(record);
  }
  fn on_delete(&self, container_id: &str) {
    self.as_ref().on_delete(container_id);
  }
  fn on_ready(&self) {
    self.as_ref().on_ready();
  }
  fn on_reconnect(&self, attempt: u32) {
    self.as_ref().on_reconnect(attempt);
  }
  fn on_error(&self, error: &anyhow::Error) {
    self.as_ref().on_error(error);
  }
}

impl SubscriberHandler for crate::index::ServiceIndex {
  fn on_upsert(&self, record: DnsRecord) {
    self.set(record);
  }
  fn on_delete(&self, container_id: &str) {
    self.remove(container_id);
  }
  fn on_ready(&self) {
    let stats = self.stats();
    info!(
      "initial snapshot applied | {} records, {} healthy, {} hostnames",
      stats.total_records, stats.healthy_records, stats.hostnames
    );
  }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum QueryEvent {
  Columns(Vec<String>),
  Row((u64, Vec<serde_json::Value>)),
  Change(
    (ChangeOp, u64, Vec<serde_json::Value>, serde_json::Value),
  ),
  Eoq(serde_json::Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ChangeOp {
  Insert,
  Update,
  Delete,
}

pub struct Subscriber<H> {
  /// The state store http api address.
  pub api: String,
  /// Base backoff, doubled per attempt.
  pub reconnect_base: Duration,
  /// 0 means reconnect forever.
  pub max_attempts: u32,
  pub handler: H,
}

impl<H: SubscriberHandler> Subscriber<H> {
  /// Maintain the subscription until cancelled or, with a
  /// configured attempt limit, until reconnects are exhausted.
  pub async fn run(&self, cancel: CancellationToken) {
    let client = reqwest::Client::new();
    let mut attempt: u32 = 0;
    loop {
      if cancel.is_cancelled() {
        return;
      }
      if let Err(e) =
        self.stream(&client, &cancel, &mut attempt).await
      {
        warn!("subscription stream failed | {e:#}");
      } else if cancel.is_cancelled() {
        return;
      }
      attempt += 1;
      if self.max_attempts > 0 && attempt > self.max_attempts {
        let error = anyhow::anyhow!(
          "state store unreachable after {} reconnect attempts",
          self.max_attempts
        );
        error!("{error:#}");
        self.handler.on_error(&error);
        return;
      }
      self.handler.on_reconnect(attempt);
      let delay = backoff_delay(self.reconnect_base, attempt);
      debug!("reconnecting in {delay:?} (attempt {attempt})");
      tokio::select! {
        _ = cancel.cancelled() => return,
        _ = tokio::time::sleep(delay) => {}
      }
    }
  }

  /// One connection lifetime. Resets `attempt` once the store
  /// accepts the subscription.
  async fn stream(
    &self,
    client: &reqwest::Client,
    cancel: &CancellationToken,
    attempt: &mut u32,
  ) -> anyhow::Result<()> {
    let response = client
      .post(format!("{}/v1/subscriptions", self.api))
      .json(&serde_json::json!({
        "id": SUBSCRIPTION_ID,
        "query": SUBSCRIPTION_QUERY,
      }))
      .send()
      .await
      .context("Failed to reach state store")?
      .error_for_status()
      .context("State store rejected subscription")?;
    *attempt = 0;
    info!("subscribed to state store at {}", self.api);

    let mut body = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();
    loop {
      let chunk = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        chunk = body.next() => chunk,
      };
      match chunk {
        Some(Ok(bytes)) => {
          buffer.extend_from_slice(&bytes);
          while let Some(pos) =
            buffer.iter().position(|b| *b == b'\n')
          {
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line[..pos]);
            let line = line.trim();
            if !line.is_empty() {
              self.apply_line(line);
            }
          }
          if buffer.len() > MAX_LINE_BYTES {
            return Err(anyhow::anyhow!(
              "line exceeds {MAX_LINE_BYTES} bytes, dropping connection"
            ));
          }
        }
        Some(Err(e)) => {
          return Err(e).context("Stream read failed");
        }
        None => {
          return Err(anyhow::anyhow!("Stream ended"));
        }
      }
    }
  }

  fn apply_line(&self, line: &str) {
    match serde_json::from_str::<QueryEvent>(line) {
      Ok(QueryEvent::Columns(columns)) => {
        debug!("subscription schema: {columns:?}");
      }
      Ok(QueryEvent::Row((_, values))) => self.upsert(&values),
      Ok(QueryEvent::Change((op, _, values, _))) => match op {
        ChangeOp::Insert | ChangeOp::Update => {
          self.upsert(&values)
        }
        ChangeOp::Delete => {
          // Delete rows carry only the primary key.
          match values.first().and_then(|v| v.as_str()) {
            Some(container_id) => {
              self.handler.on_delete(container_id)
            }
            None => {
              warn!("delete event without container id: {line}")
            }
          }
        }
      },
      Ok(QueryEvent::Eoq(_)) => self.handler.on_ready(),
      Err(e) => {
        warn!("undecodable subscription message | {e} | {line}");
      }
    }
  }

  fn upsert(&self, values: &[serde_json::Value]) {
    match record_from_row(values) {
      Some(record) => self.handler.on_upsert(record),
      None => warn!("discarding invalid row: {values:?}"),
    }
  }
}

/// Map a row to a record by fixed column index. None when any
/// required field is missing, mistyped, or the ip is not a
/// strict dotted quad.
pub fn record_from_row(
  values: &[serde_json::Value],
) -> Option<DnsRecord> {
  let as_str = |index: usize| {
    values.get(index).and_then(|value| value.as_str())
  };
  let ip = parse_ipv4(as_str(COL_IP)?)?;
  Some(DnsRecord {
    container_id: as_str(COL_ID)?.to_string(),
    service: as_str(COL_SERVICE)?.to_string(),
    project: as_str(COL_PROJECT)?.to_string(),
    server_id: as_str(COL_SERVER_ID)?.to_string(),
    ip,
    healthy: as_str(COL_HEALTH) == Some("healthy"),
    started_at: values.get(COL_STARTED_AT)?.as_i64()?,
    instance_id: as_str(COL_INSTANCE_ID).map(str::to_string),
  })
}

/// `min(base * 2^(attempt-1), 60s)` plus up to a second of
/// jitter.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
  let doubled = base.saturating_mul(
    2u32.saturating_pow(attempt.saturating_sub(1)),
  );
  doubled.min(MAX_BACKOFF)
    + Duration::from_millis(rand::rng().random_range(0..1000))
}

#[cfg(test)]
mod tests {
  use std::net::Ipv4Addr;

  use crate::index::ServiceIndex;

  use super::*;

  fn subscriber(
    index: Arc<ServiceIndex>,
  ) -> Subscriber<Arc<ServiceIndex>> {
    Subscriber {
      api: String::new(),
      reconnect_base: Duration::from_millis(5000),
      max_attempts: 0,
      handler: index,
    }
  }

  #[test]
  fn snapshot_then_delete_follows_precedence() {
    let index = Arc::new(ServiceIndex::new());
    let subscriber = subscriber(index.clone());
    // Two generations of the same service on one server: the
    // newer one wins, until its delete arrives.
    subscriber.apply_line(
      r#"{"columns":["id","service","server_id","ip","health_status","started_at","instance_id","project"]}"#,
    );
    subscriber.apply_line(
      r#"{"row":[1,["c1","api","server1","10.210.1.5","healthy",1000,null,"casa"]]}"#,
    );
    subscriber.apply_line(
      r#"{"row":[2,["c2","api","server1","10.210.1.9","healthy",2000,null,"casa"]]}"#,
    );
    subscriber
      .apply_line(r#"{"eoq":{"time":123.4,"change_id":2}}"#);
    assert_eq!(
      index.get("casa-api"),
      vec![Ipv4Addr::new(10, 210, 1, 9)]
    );

    subscriber.apply_line(r#"{"change":["delete",2,["c2"],3]}"#);
    assert_eq!(
      index.get("casa-api"),
      vec![Ipv4Addr::new(10, 210, 1, 5)]
    );
  }

  #[test]
  fn updates_flip_health() {
    let index = Arc::new(ServiceIndex::new());
    let subscriber = subscriber(index.clone());
    subscriber.apply_line(
      r#"{"change":["insert",1,["c1","api","server1","10.210.1.5","healthy",1000,null,"casa"],1]}"#,
    );
    assert_eq!(index.get("casa-api").len(), 1);
    subscriber.apply_line(
      r#"{"change":["update",1,["c1","api","server1","10.210.1.5","unhealthy",1000,null,"casa"],2]}"#,
    );
    assert!(index.get("casa-api").is_empty());
    assert_eq!(index.stats().total_records, 1);
  }

  #[test]
  fn invalid_rows_are_discarded() {
    let rows = [
      // Bad ip forms.
      r#"["c1","api","s1","10.210.1","healthy",1000,null,"casa"]"#,
      r#"["c1","api","s1","01.2.3.4","healthy",1000,null,"casa"]"#,
      r#"["c1","api","s1","256.1.1.1","healthy",1000,null,"casa"]"#,
      // Mistyped required fields.
      r#"[42,"api","s1","10.0.0.1","healthy",1000,null,"casa"]"#,
      r#"["c1","api","s1","10.0.0.1","healthy",1000,null,7]"#,
      r#"["c1","api","s1","10.0.0.1","healthy","soon",null,"casa"]"#,
      // Too short.
      r#"["c1","api","s1"]"#,
    ];
    for row in rows {
      let values: Vec<serde_json::Value> =
        serde_json::from_str(row).unwrap();
      assert!(
        record_from_row(&values).is_none(),
        "accepted: {row}"
      );
    }
  }

  #[test]
  fn non_string_health_means_unhealthy() {
    let values: Vec<serde_json::Value> = serde_json::from_str(
      r#"["c1","api","s1","10.0.0.1",null,1000,null,"casa"]"#,
    )
    .unwrap();
    let record = record_from_row(&values).unwrap();
    assert!(!record.healthy);
  }

  #[test]
  fn instance_id_is_optional() {
    let values: Vec<serde_json::Value> = serde_json::from_str(
      r#"["c1","api","s1","10.0.0.1","healthy",1000,"blue","casa"]"#,
    )
    .unwrap();
    assert_eq!(
      record_from_row(&values).unwrap().instance_id.as_deref(),
      Some("blue")
    );
  }

  #[test]
  fn backoff_doubles_and_caps() {
    let base = Duration::from_millis(5000);
    let first = backoff_delay(base, 1);
    assert!(first >= Duration::from_millis(5000));
    assert!(first < Duration::from_millis(6000));
    let third = backoff_delay(base, 3);
    assert!(third >= Duration::from_millis(20000));
    assert!(third < Duration::from_millis(21000));
    // Far attempts stay capped at 60s (+ jitter).
    let late = backoff_delay(base, 30);
    assert!(late >= Duration::from_secs(60));
    assert!(late < Duration::from_secs(61));
  }
}
