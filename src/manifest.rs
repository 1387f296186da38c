// Copyright (c) chess-pos-db-core contributors.
// Licensed under the Apache License, Version 2.0 or the MIT license, at your option.
// `manifest.json` read/write (spec.md §6). The one external-interface
// artifact the spec commits to a concrete format for; everything else in
// §6 is an external-collaborator trait (see collab.rs/header.rs).

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Manifest {
	pub name: String,
	pub requires_position_index: bool,
	/// Schema version of the on-disk layout this manifest describes.
	#[serde(default = "default_version")]
	pub version: u32,
}

fn default_version() -> u32 {
	1
}

impl Manifest {
	pub fn new(name: impl Into<String>) -> Manifest {
		Manifest { name: name.into(), requires_position_index: true, version: default_version() }
	}

	pub fn load(path: &Path) -> Result<Manifest> {
		let bytes = std::fs::read(path)?;
		Ok(serde_json::from_slice(&bytes)?)
	}

	pub fn load_or_default(path: &Path, name: impl Into<String>) -> Result<Manifest> {
		if path.exists() {
			Manifest::load(path)
		} else {
			Ok(Manifest::new(name))
		}
	}

	pub fn save(&self, path: &Path) -> Result<()> {
		let bytes = serde_json::to_vec_pretty(self)?;
		if let Some(parent) = path.parent() {
			std::fs::create_dir_all(parent)?;
		}
		let tmp = path.with_extension("json.tmp");
		std::fs::write(&tmp, bytes)?;
		std::fs::rename(&tmp, path)?;
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use super::*;

	fn temp_path(name: &str) -> std::path::PathBuf {
		let mut p = std::env::temp_dir();
		p.push("chess-pos-db-test");
		std::fs::create_dir_all(&p).unwrap();
		p.push(format!("manifest_{}_{}", name, std::process::id()));
		p
	}

	#[test]
	fn round_trips_through_json() {
		let path = temp_path("roundtrip");
		let _ = std::fs::remove_file(&path);
		let manifest = Manifest::new("hdd");
		manifest.save(&path).unwrap();
		let loaded = Manifest::load(&path).unwrap();
		assert_eq!(manifest, loaded);
		std::fs::remove_file(&path).unwrap();
	}

	#[test]
	fn load_or_default_falls_back_when_absent() {
		let path = temp_path("missing");
		let _ = std::fs::remove_file(&path);
		let manifest = Manifest::load_or_default(&path, "hdd").unwrap();
		assert_eq!(manifest.name, "hdd");
		assert!(manifest.requires_position_index);
	}
}
