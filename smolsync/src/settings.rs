//! The typed counterpart of the `smolsync.json` document. Loading the file
//! from a settings directory, and resolving that directory from the
//! environment, are CLI concerns; this module only owns the schema so an
//! embedding caller can share it without pulling in the CLI.

use std::collections::BTreeMap;
use std::io::Read;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SmolsyncError};

pub const SETTINGS_FILE_NAME: &str = "smolsync.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
	pub root: Utf8PathBuf,
	#[serde(default)]
	pub ignore: Vec<String>,
}

/// A target name -> configuration map, serialized as a flat JSON object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Settings {
	pub targets: BTreeMap<String, TargetConfig>,
}

impl Settings {
	pub fn parse(r: impl Read) -> Result<Self> {
		serde_json::from_reader(r).map_err(|e| SmolsyncError::ArchiveFormatError(format!("invalid settings JSON: {e}")))
	}

	pub fn to_json(&self) -> Result<String> {
		serde_json::to_string_pretty(&self.targets).map_err(|e| SmolsyncError::ArchiveFormatError(format!("{e}")))
	}

	/// Restricts this set of targets to `names`, in `;`-separated selection
	/// order. `names == None` means "all targets". Returns the names that
	/// weren't found, for the caller to report as `TargetsNotFound`.
	pub fn select<'a>(&self, names: impl Iterator<Item = &'a str>) -> (Vec<(&str, &TargetConfig)>, Vec<String>) {
		let mut selected = Vec::new();
		let mut missing = Vec::new();
		for name in names {
			match self.targets.get_key_value(name) {
				Some((k, v)) => selected.push((k.as_str(), v)),
				None => missing.push(name.to_string()),
			}
		}
		(selected, missing)
	}

	pub fn all(&self) -> Vec<(&str, &TargetConfig)> {
		self.targets.iter().map(|(k, v)| (k.as_str(), v)).collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_flat_target_map() {
		let json = r#"{
			"docs": { "root": "/home/me/docs", "ignore": ["*.tmp"] },
			"photos": { "root": "/home/me/photos" }
		}"#;
		let settings = Settings::parse(json.as_bytes()).unwrap();
		assert_eq!(settings.targets.len(), 2);
		assert_eq!(settings.targets["docs"].ignore, vec!["*.tmp"]);
		assert!(settings.targets["photos"].ignore.is_empty());
	}

	#[test]
	fn select_reports_missing_names() {
		let json = r#"{"a": {"root": "/a"}}"#;
		let settings = Settings::parse(json.as_bytes()).unwrap();
		let (found, missing) = settings.select(["a", "b"].into_iter());
		assert_eq!(found.len(), 1);
		assert_eq!(missing, vec!["b".to_string()]);
	}
}
