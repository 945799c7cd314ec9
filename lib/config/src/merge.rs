use crate::{Error, Result};

/// Merge `source` into `target`, source winning on conflicts.
///
/// Nested objects recurse when `merge_nested` is set, otherwise
/// the object is replaced wholesale at its key. Arrays extend
/// when `extend_array` is set, otherwise they are replaced.
/// Mismatched types on the two sides of a merged key are an
/// error.
pub fn merge_objects(
  mut target: serde_json::Map<String, serde_json::Value>,
  source: serde_json::Map<String, serde_json::Value>,
  merge_nested: bool,
  extend_array: bool,
) -> Result<serde_json::Map<String, serde_json::Value>> {
  for (key, value) in source {
    let merged = match (target.remove(&key), value) {
      (
        Some(serde_json::Value::Object(target_obj)),
        serde_json::Value::Object(source_obj),
      ) if merge_nested => serde_json::Value::Object(
        merge_objects(
          target_obj,
          source_obj,
          merge_nested,
          extend_array,
        )?,
      ),
      (Some(serde_json::Value::Object(_)), value)
        if merge_nested =>
      {
        return Err(Error::ObjectFieldTypeMismatch { key, value });
      }
      (
        Some(serde_json::Value::Array(mut target_arr)),
        serde_json::Value::Array(source_arr),
      ) if extend_array => {
        target_arr.extend(source_arr);
        serde_json::Value::Array(target_arr)
      }
      (Some(serde_json::Value::Array(_)), value)
        if extend_array =>
      {
        return Err(Error::ArrayFieldTypeMismatch { key, value });
      }
      // Scalars, and objects / arrays in replace mode.
      (_, value) => value,
    };
    target.insert(key, merged);
  }
  Ok(target)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn obj(
    json: serde_json::Value,
  ) -> serde_json::Map<String, serde_json::Value> {
    match json {
      serde_json::Value::Object(map) => map,
      _ => panic!("fixture must be an object"),
    }
  }

  #[test]
  fn source_wins_on_scalars() {
    let merged = merge_objects(
      obj(serde_json::json!({ "a": 1, "b": "keep" })),
      obj(serde_json::json!({ "a": 2, "c": true })),
      true,
      true,
    )
    .unwrap();
    assert_eq!(
      serde_json::Value::Object(merged),
      serde_json::json!({ "a": 2, "b": "keep", "c": true })
    );
  }

  #[test]
  fn nested_objects_merge_or_replace() {
    let target =
      obj(serde_json::json!({ "ssh": { "user": "root", "port": 22 } }));
    let source =
      obj(serde_json::json!({ "ssh": { "port": 2222 } }));

    let merged =
      merge_objects(target.clone(), source.clone(), true, true)
        .unwrap();
    assert_eq!(
      serde_json::Value::Object(merged),
      serde_json::json!({ "ssh": { "user": "root", "port": 2222 } })
    );

    let replaced =
      merge_objects(target, source, false, true).unwrap();
    assert_eq!(
      serde_json::Value::Object(replaced),
      serde_json::json!({ "ssh": { "port": 2222 } })
    );
  }

  #[test]
  fn arrays_extend_or_replace() {
    let target = obj(serde_json::json!({ "secrets": ["A"] }));
    let source = obj(serde_json::json!({ "secrets": ["B"] }));

    let extended =
      merge_objects(target.clone(), source.clone(), true, true)
        .unwrap();
    assert_eq!(
      serde_json::Value::Object(extended),
      serde_json::json!({ "secrets": ["A", "B"] })
    );

    let replaced =
      merge_objects(target, source, true, false).unwrap();
    assert_eq!(
      serde_json::Value::Object(replaced),
      serde_json::json!({ "secrets": ["B"] })
    );
  }

  #[test]
  fn type_mismatch_errors() {
    let err = merge_objects(
      obj(serde_json::json!({ "ssh": { "user": "root" } })),
      obj(serde_json::json!({ "ssh": "root@host" })),
      true,
      true,
    )
    .unwrap_err();
    assert!(matches!(err, Error::ObjectFieldTypeMismatch { .. }));

    let err = merge_objects(
      obj(serde_json::json!({ "secrets": ["A"] })),
      obj(serde_json::json!({ "secrets": "A" })),
      true,
      true,
    )
    .unwrap_err();
    assert!(matches!(err, Error::ArrayFieldTypeMismatch { .. }));
  }
}
