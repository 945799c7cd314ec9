//! Service selection by name pattern.
//!
//! Patterns support `*` (any run) and `?` (single char) wildcards,
//! matched case sensitively. Per pattern: exact name match first,
//! else glob match, else the pattern contributes nothing.

use anyhow::Context;
use jiji_client::entities::service::ServiceSpec;

pub fn select_services<'a>(
  services: &'a [ServiceSpec],
  patterns: &[String],
) -> anyhow::Result<Vec<&'a ServiceSpec>> {
  if patterns.is_empty() {
    return Ok(services.iter().collect());
  }
  let mut selected = Vec::new();
  for pattern in patterns {
    let exact = services
      .iter()
      .filter(|service| service.name == *pattern)
      .collect::<Vec<_>>();
    let matched = if exact.is_empty() {
      let wildcard = wildcard::Wildcard::new(pattern.as_bytes())
        .with_context(|| {
          format!("invalid service pattern. got: {pattern}")
        })?;
      services
        .iter()
        .filter(|service| wildcard.is_match(service.name.as_bytes()))
        .collect()
    } else {
      exact
    };
    for service in matched {
      if !selected
        .iter()
        .any(|s: &&ServiceSpec| s.name == service.name)
      {
        selected.push(service);
      }
    }
  }
  Ok(selected)
}

#[cfg(test)]
mod tests {
  use std::collections::HashMap;

  use jiji_client::entities::service::ServiceConfig;

  use super::*;

  fn services(names: &[&str]) -> Vec<ServiceSpec> {
    let servers = HashMap::from([(
      String::from("s1"),
      String::from("10.0.0.1"),
    )]);
    names
      .iter()
      .map(|name| {
        let config: ServiceConfig = serde_json::from_value(
          serde_json::json!({
            "image": "nginx",
            "hosts": ["s1"]
          }),
        )
        .unwrap();
        config.resolve("test", name, &servers).unwrap()
      })
      .collect()
  }

  #[test]
  fn empty_patterns_select_all() {
    let services = services(&["web", "api"]);
    let selected = select_services(&services, &[]).unwrap();
    assert_eq!(selected.len(), 2);
  }

  #[test]
  fn exact_match_wins_over_glob() {
    let services = services(&["web", "web2"]);
    let selected =
      select_services(&services, &[String::from("web")]).unwrap();
    assert_eq!(selected.len(), 1);
    assert_eq!(selected[0].name, "web");
  }

  #[test]
  fn single_char_wildcard() {
    let services = services(&["web1", "web2", "web12"]);
    let selected =
      select_services(&services, &[String::from("web?")]).unwrap();
    let names =
      selected.iter().map(|s| s.name.as_str()).collect::<Vec<_>>();
    assert_eq!(names, vec!["web1", "web2"]);
  }

  #[test]
  fn matching_is_case_sensitive() {
    let services = services(&["Web"]);
    let selected =
      select_services(&services, &[String::from("web*")]).unwrap();
    assert!(selected.is_empty());
  }

  #[test]
  fn unmatched_pattern_contributes_nothing() {
    let services = services(&["web"]);
    let selected = select_services(
      &services,
      &[String::from("db*"), String::from("web")],
    )
    .unwrap();
    assert_eq!(selected.len(), 1);
  }
}
