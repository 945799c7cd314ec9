//! # Service hosts deserializer.
//!
//! `services.<name>.hosts` entries come in two shapes:
//! plain server names (`- web-1`) and inline objects
//! (`- host: web-1`). Both deserialize to [HostEntry],
//! normalized to named server refs at config resolution.

use serde::{
  Deserialize, Deserializer, Serialize, Serializer,
  de::{Error, Visitor},
  ser::SerializeMap,
};

/// A single, not yet resolved `hosts` entry.
#[derive(Debug, Clone, PartialEq)]
pub enum HostEntry {
  /// Plain server name.
  Name(String),
  /// Inline `{ host: ... }` object.
  Inline(String),
}

impl HostEntry {
  pub fn raw(&self) -> &str {
    match self {
      HostEntry::Name(name) => name,
      HostEntry::Inline(host) => host,
    }
  }
}

impl Serialize for HostEntry {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: Serializer,
  {
    match self {
      HostEntry::Name(name) => serializer.serialize_str(name),
      HostEntry::Inline(host) => {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry("host", host)?;
        map.end()
      }
    }
  }
}

impl<'de> Deserialize<'de> for HostEntry {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: Deserializer<'de>,
  {
    struct HostEntryVisitor;

    impl<'de> Visitor<'de> for HostEntryVisitor {
      type Value = HostEntry;

      fn expecting(
        &self,
        formatter: &mut std::fmt::Formatter,
      ) -> std::fmt::Result {
        write!(formatter, "server name or {{ host: ... }} object")
      }

      fn visit_str<E: Error>(
        self,
        v: &str,
      ) -> Result<Self::Value, E> {
        Ok(HostEntry::Name(v.to_string()))
      }

      fn visit_map<A>(
        self,
        mut map: A,
      ) -> Result<Self::Value, A::Error>
      where
        A: serde::de::MapAccess<'de>,
      {
        let mut host = None;
        while let Some(key) = map.next_key::<String>()? {
          if key == "host" {
            host = Some(map.next_value::<String>()?);
          } else {
            let _ = map.next_value::<serde::de::IgnoredAny>()?;
          }
        }
        host.map(HostEntry::Inline).ok_or_else(|| {
          Error::custom("inline host object requires 'host' key")
        })
      }
    }

    deserializer.deserialize_any(HostEntryVisitor)
  }
}
