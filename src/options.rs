// Copyright (c) chess-pos-db-core contributors.
// Licensed under the Apache License, Version 2.0 or the MIT license, at your option.
use std::path::PathBuf;

/// Startup configuration. Consumed once and never mutated afterwards
/// (spec.md §6): nothing in this crate reads environment variables or
/// re-reads `Options` after a `Database`/`Partition` is opened.
#[derive(Clone, Debug)]
pub struct Options {
	/// Root directory. `data/` and the header-store directories live under it.
	pub path: PathBuf,

	/// Maximum length, in entries, of a single range-index span (`G`),
	/// unless a K-rm equivalence class runs longer.
	pub index_granularity: u32,

	/// Memory budget, in bytes, for a single external-sort/merge pass.
	pub max_merge_buffer_size: usize,

	/// Memory budget, in bytes, handed to the ingest pipeline; divided
	/// between the reusable entry buffers.
	pub pgn_parser_memory: usize,

	/// Path-prefix -> volume-pool-id routing table for the I/O scheduler.
	pub volume_map: Vec<(PathBuf, u32)>,

	/// Maximum number of inputs merged in a single k-way merge pass (`F`).
	pub max_merge_fanout: usize,

	/// Worker threads per volume pool (`T`).
	pub io_threads_per_volume: usize,

	/// Soft cap on concurrently open unpooled file handles.
	pub max_unpooled_files: usize,

	/// Maximum number of handles kept open by the pooled file layer (`P`).
	pub max_pooled_files: usize,

	/// Enable the cross-update optimisation during batched equal-range
	/// search (spec.md §4.6).
	pub enable_cross_update: bool,
}

impl Default for Options {
	fn default() -> Self {
		Options {
			path: PathBuf::from("."),
			index_granularity: 1024,
			max_merge_buffer_size: 64 * 1024 * 1024,
			pgn_parser_memory: 256 * 1024 * 1024,
			volume_map: Vec::new(),
			max_merge_fanout: 192,
			io_threads_per_volume: 8,
			max_unpooled_files: 128,
			max_pooled_files: 256,
			enable_cross_update: true,
		}
	}
}

impl Options {
	pub fn with_path(path: impl Into<PathBuf>) -> Self {
		Options { path: path.into(), ..Options::default() }
	}

	pub fn data_dir(&self) -> PathBuf {
		self.path.join("data")
	}

	pub fn header_dir(&self, level: crate::key::GameLevel) -> PathBuf {
		self.path.join(level.header_dir_name())
	}

	pub fn manifest_path(&self) -> PathBuf {
		self.path.join("manifest.json")
	}
}
