//! # Environment map deserializer.
//!
//! Accepts `KEY: value` maps where values may be strings,
//! integers, floats or booleans, coercing everything to string.

use indexmap::IndexMap;
use serde::{
  Deserialize, Deserializer,
  de::{Error, Visitor},
};

pub fn env_map_deserializer<'de, D>(
  deserializer: D,
) -> Result<IndexMap<String, String>, D::Error>
where
  D: Deserializer<'de>,
{
  deserializer.deserialize_any(EnvMapVisitor)
}

struct EnvMapVisitor;

impl<'de> Visitor<'de> for EnvMapVisitor {
  type Value = IndexMap<String, String>;

  fn expecting(
    &self,
    formatter: &mut std::fmt::Formatter,
  ) -> std::fmt::Result {
    write!(formatter, "map of variable name to scalar value")
  }

  fn visit_unit<E>(self) -> Result<Self::Value, E>
  where
    E: Error,
  {
    Ok(IndexMap::new())
  }

  fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
  where
    A: serde::de::MapAccess<'de>,
  {
    let mut res =
      IndexMap::with_capacity(map.size_hint().unwrap_or_default());
    while let Some((key, value)) =
      map.next_entry::<String, ScalarString>()?
    {
      res.insert(key, value.0);
    }
    Ok(res)
  }
}

/// A string deserialized from any scalar value.
struct ScalarString(String);

impl<'de> Deserialize<'de> for ScalarString {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: Deserializer<'de>,
  {
    struct ScalarVisitor;

    impl Visitor<'_> for ScalarVisitor {
      type Value = ScalarString;

      fn expecting(
        &self,
        formatter: &mut std::fmt::Formatter,
      ) -> std::fmt::Result {
        write!(formatter, "string, number, or boolean")
      }

      fn visit_str<E: Error>(
        self,
        v: &str,
      ) -> Result<Self::Value, E> {
        Ok(ScalarString(v.to_string()))
      }

      fn visit_i64<E: Error>(self, v: i64) -> Result<Self::Value, E> {
        Ok(ScalarString(v.to_string()))
      }

      fn visit_u64<E: Error>(self, v: u64) -> Result<Self::Value, E> {
        Ok(ScalarString(v.to_string()))
      }

      fn visit_f64<E: Error>(self, v: f64) -> Result<Self::Value, E> {
        Ok(ScalarString(v.to_string()))
      }

      fn visit_bool<E: Error>(
        self,
        v: bool,
      ) -> Result<Self::Value, E> {
        Ok(ScalarString(v.to_string()))
      }
    }

    deserializer.deserialize_any(ScalarVisitor)
  }
}
