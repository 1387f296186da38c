// Copyright (c) chess-pos-db-core contributors.
// Licensed under the Apache License, Version 2.0 or the MIT license, at your option.
use std::path::PathBuf;

use thiserror::Error;

/// Error type for the position store.
#[derive(Error, Debug)]
pub enum Error {
	/// Generic IO error not otherwise classified below.
	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),

	/// `open()` failed for the given path.
	#[error("failed to open {path}: {source}")]
	OpenFailure { path: PathBuf, #[source] source: std::io::Error },

	/// A read returned fewer elements than requested.
	#[error("short read on {path}: requested {requested}, got {actual}")]
	ShortRead { path: PathBuf, requested: u64, actual: u64 },

	/// An append wrote fewer elements than requested.
	#[error("short append on {path}: requested {requested}, wrote {actual}")]
	ShortAppend { path: PathBuf, requested: u64, actual: u64 },

	/// `truncate()` failed.
	#[error("failed to truncate {path}: {source}")]
	TruncateFailure { path: PathBuf, #[source] source: std::io::Error },

	/// An upstream PGN reader failed partway through a file; ingest of that
	/// file stops but the overall import proceeds.
	#[error("PGN parse error in {path}: {message}")]
	ParseBackpressure { path: PathBuf, message: String },

	/// A forced-id write targeted a segment id that already exists.
	#[error("segment id {id} already exists in {path}")]
	IdConflict { path: PathBuf, id: u32 },

	/// A job was submitted to the ingest pipeline after `wait_for_completion`.
	#[error("ingest pipeline has already shut down")]
	PipelineShutdown,

	/// On-disk structure failed a consistency check.
	#[error("corruption: {0}")]
	Corruption(String),

	/// manifest.json failed to parse.
	#[error("manifest error: {0}")]
	Serde(#[from] serde_json::Error),
}

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
