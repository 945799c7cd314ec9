//! Secret resolution for `env.secrets` names.
//!
//! Precedence: process environment > `.env` > `secrets_path` file.
//! Resolved values are registered as log replacers so they never
//! show up in command output.

use std::{collections::HashMap, path::Path};

use anyhow::Context;

pub struct SecretStore {
  values: HashMap<String, String>,
}

impl SecretStore {
  /// Load the store from the optional dotenv-format sources.
  /// Missing files are skipped, unreadable entries warn.
  pub fn load(secrets_path: Option<&Path>) -> SecretStore {
    let mut values = HashMap::new();
    // Lowest precedence first, later inserts override.
    if let Some(path) = secrets_path {
      read_dotenv_file(path, &mut values);
    }
    read_dotenv_file(Path::new(".env"), &mut values);
    for (key, value) in std::env::vars() {
      values.insert(key, value);
    }
    SecretStore { values }
  }

  #[cfg(test)]
  pub fn from_values(values: HashMap<String, String>) -> SecretStore {
    SecretStore { values }
  }

  /// Resolve every name, erroring on the full set of missing ones.
  pub fn resolve(
    &self,
    names: &[String],
  ) -> anyhow::Result<Vec<(String, String)>> {
    let mut resolved = Vec::with_capacity(names.len());
    let mut missing = Vec::new();
    for name in names {
      match self.values.get(name) {
        Some(value) => resolved.push((name.clone(), value.clone())),
        None => missing.push(name.as_str()),
      }
    }
    if !missing.is_empty() {
      return Err(anyhow::anyhow!(
        "Missing secrets: {}",
        missing.join(", ")
      ));
    }
    Ok(resolved)
  }

  /// Replacers handed to the log sanitizer:
  /// secret value -> `[VAR_NAME]`.
  pub fn replacers(
    resolved: &[(String, String)],
  ) -> Vec<(String, String)> {
    resolved
      .iter()
      .filter(|(_, value)| !value.is_empty())
      .map(|(name, value)| (value.clone(), format!("[{name}]")))
      .collect()
  }
}

fn read_dotenv_file(
  path: &Path,
  values: &mut HashMap<String, String>,
) {
  if !path.is_file() {
    return;
  }
  let iter = match dotenvy::from_path_iter(path)
    .with_context(|| format!("Failed to read {}", path.display()))
  {
    Ok(iter) => iter,
    Err(e) => {
      warn!("{e:#}");
      return;
    }
  };
  for item in iter {
    match item {
      Ok((key, value)) => {
        values.insert(key, value);
      }
      Err(e) => {
        warn!(
          "Skipping invalid entry in {} | {e:?}",
          path.display()
        );
      }
    }
  }
}
