use async_timing_util::unix_timestamp_ms;
use serde::{Deserialize, Serialize};

pub mod config;
pub mod deployment;
pub mod dns;
pub mod logger;
pub mod server;
pub mod service;

/// Unix timestamp in milliseconds as i64
pub fn jiji_timestamp() -> i64 {
  unix_timestamp_ms() as i64
}

/// Enforce common docker naming rules, such as only lowercase, and no '.'.
/// These apply to:
///   - Projects (container name prefix)
///   - Images built from service sources
///   - Networks
pub fn to_docker_compatible_name(name: &str) -> String {
  name
    .to_lowercase()
    .replace([' ', '.', ',', '\n', '&'], "_")
    .trim()
    .to_string()
}

/// Environment variable names must match `[A-Za-z_][A-Za-z0-9_]*`.
pub fn valid_env_var_name(name: &str) -> bool {
  let mut chars = name.chars();
  let Some(first) = chars.next() else {
    return false;
  };
  if !(first.is_ascii_alphabetic() || first == '_') {
    return false;
  }
  chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// The result of running a single command against a host,
/// with the full output attached.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Log {
  /// Which deployment stage produced the log.
  pub stage: String,
  /// The command which was executed.
  pub command: String,
  pub stdout: String,
  pub stderr: String,
  pub success: bool,
  pub start_ts: i64,
  pub end_ts: i64,
}

impl Log {
  pub fn simple(stage: &str, msg: String) -> Log {
    let ts = jiji_timestamp();
    Log {
      stage: stage.to_string(),
      stdout: msg,
      success: true,
      start_ts: ts,
      end_ts: ts,
      ..Default::default()
    }
  }

  /// Combined output for error reporting, stderr first.
  pub fn combined(&self) -> String {
    match (
      self.stderr.trim().is_empty(),
      self.stdout.trim().is_empty(),
    ) {
      (false, false) => {
        format!("{}\n{}", self.stderr.trim(), self.stdout.trim())
      }
      (false, true) => self.stderr.trim().to_string(),
      (true, false) => self.stdout.trim().to_string(),
      (true, true) => String::new(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn env_var_names() {
    assert!(valid_env_var_name("FOO"));
    assert!(valid_env_var_name("_private"));
    assert!(valid_env_var_name("A1_B2"));
    assert!(!valid_env_var_name(""));
    assert!(!valid_env_var_name("1FOO"));
    assert!(!valid_env_var_name("FOO-BAR"));
    assert!(!valid_env_var_name("FOO BAR"));
  }

  #[test]
  fn docker_compatible_names() {
    assert_eq!(to_docker_compatible_name("My App"), "my_app");
    assert_eq!(to_docker_compatible_name("a.b"), "a_b");
  }
}
