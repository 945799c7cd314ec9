//! # Jiji Config
//!
//! This library is used to parse jiji config files.
//! It supports interpolating in environment variables
//! (only '${VAR}' syntax), as well as merging together multiple
//! files into a final configuration object.

use std::path::Path;

use colored::Colorize;
use indexmap::IndexSet;
use serde::de::DeserializeOwned;

mod error;
mod load;
mod merge;

pub use error::Error;
pub use merge::merge_objects;

pub type Result<T> = ::core::result::Result<T, Error>;

/// Set the configuration for loading config files.
pub struct ConfigLoader<'outer, 'inner> {
  /// Paths to either files or directories
  /// to include in the final configuration.
  ///
  /// Path coming later in the array (higher index) will override
  /// configuration in earlier paths.
  pub paths: &'outer [&'inner Path],
  /// Wilcard patterns to match file names in given directories.
  pub match_wildcards: &'outer [&'inner str],
  /// Whether to merge nested config objects.
  /// Otherwise, the object will be replaced at
  /// the top-level key by the highest priority config file
  /// in which it is specified.
  pub merge_nested: bool,
  /// Whether to extend array in configuration files.
  /// Otherwise, the array will be replaced at
  /// the top-level key by the highest priority config file
  /// in which it is specified.
  pub extend_array: bool,
  /// Print some extra information on configuation load.
  ///
  /// Note. This is different than application level log level.
  pub debug_print: bool,
}

impl ConfigLoader<'_, '_> {
  pub fn load<T: DeserializeOwned>(self) -> Result<T> {
    let map = self.load_map()?;
    serde_json::from_value(serde_json::Value::Object(map))
      .map_err(|e| Error::ParseFinalJson { e })
  }

  /// Load and merge the config files into the raw key-value map,
  /// before parsing into the final type. Used by callers which
  /// check for unknown keys.
  pub fn load_map(
    self,
  ) -> Result<serde_json::Map<String, serde_json::Value>> {
    let ConfigLoader {
      paths,
      match_wildcards,
      merge_nested,
      extend_array,
      debug_print,
    } = self;
    let mut wildcards = Vec::with_capacity(match_wildcards.len());
    for &wc in match_wildcards {
      match wildcard::Wildcard::new(wc.as_bytes()) {
        Ok(wc) => wildcards.push(wc),
        Err(e) => {
          eprintln!(
            "{}: Keyword '{}' is invalid wildcard | {e:?}",
            "ERROR".red(),
            wc.bold(),
          );
        }
      }
    }
    let mut all_files = IndexSet::new();
    for &path in paths {
      let Ok(metadata) = std::fs::metadata(path) else {
        continue;
      };
      if metadata.is_dir() {
        let mut files = Vec::new();
        load::load_config_files(&mut files, path, &wildcards);
        files.sort_by(|(a_index, a_path), (b_index, b_path)| {
          a_index.cmp(b_index).then(a_path.cmp(b_path))
        });
        all_files.extend(files.into_iter().map(|(_, path)| path));
      } else if metadata.is_file() {
        let path = path.to_path_buf();
        // If the same path comes up again later on, it should be removed and
        // reinserted so it maintains higher priority.
        all_files.shift_remove(&path);
        all_files.insert(path);
      }
    }
    if debug_print {
      println!(
        "{}: {}: {all_files:?}",
        "DEBUG".cyan(),
        "Found Files".dimmed()
      );
    }
    load::load_merge_config_files(
      &all_files.into_iter().collect::<Vec<_>>(),
      merge_nested,
      extend_array,
    )
  }
}
