// Copyright (c) chess-pos-db-core contributors.
// Licensed under the Apache License, Version 2.0 or the MIT license, at your option.
// Range index over a K-rm-sorted segment (spec.md §4.5): a compact sibling
// file of `(low, high, lowKey, highKey)` spans, each covering at most `G`
// (`Options::index_granularity`) consecutive entries unless a single K-rm
// equivalence class runs longer. Building is a single forward pass over
// the segment, grounded on the three-state scan shape used by
// `table.rs`'s `for_parts` walk in the teacher (sequential scan classifying
// runs of equal keys) adapted to emit fixed-size index records instead.

use std::convert::TryInto;
use std::path::PathBuf;
use std::sync::Arc;

use crate::entry::Entry;
use crate::error::Result;
use crate::file::{OpenMode, PooledFile};
use crate::key::Key;
use crate::scheduler::IoScheduler;
use crate::span::{FixedSizeRecord, ImmutableSpan};
use crate::vector::{BackInserter, Vector};

pub const RANGE_INDEX_ENTRY_SIZE: usize = 8 + 8 + 16 + 16;

/// One span of the range index: entries `[low, high)` of the segment all
/// share a K-rm run that starts at `low_key` and ends at `high_key`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RangeIndexEntry {
	pub low: u64,
	pub high: u64,
	pub low_key: Key,
	pub high_key: Key,
}

impl FixedSizeRecord for RangeIndexEntry {
	const SIZE: usize = RANGE_INDEX_ENTRY_SIZE;

	fn encode(&self, out: &mut [u8]) {
		out[0..8].copy_from_slice(&self.low.to_le_bytes());
		out[8..16].copy_from_slice(&self.high.to_le_bytes());
		out[16..32].copy_from_slice(&self.low_key.to_bytes());
		out[32..48].copy_from_slice(&self.high_key.to_bytes());
	}

	fn decode(buf: &[u8]) -> Self {
		let low = u64::from_le_bytes(buf[0..8].try_into().unwrap());
		let high = u64::from_le_bytes(buf[8..16].try_into().unwrap());
		let low_key = Key::from_bytes(&buf[16..32]);
		let high_key = Key::from_bytes(&buf[32..48]);
		RangeIndexEntry { low, high, low_key, high_key }
	}
}

/// Accumulates range-index spans incrementally as a segment is written,
/// so the index can be finalised right after the segment without a second
/// pass over it.
pub struct RangeIndexBuilder {
	granularity: u64,
	span_start: u64,
	span_start_key: Option<Key>,
	last_key: Option<Key>,
	cursor: u64,
	spans: Vec<RangeIndexEntry>,
}

impl RangeIndexBuilder {
	pub fn new(granularity: u64) -> RangeIndexBuilder {
		RangeIndexBuilder {
			granularity: granularity.max(1),
			span_start: 0,
			span_start_key: None,
			last_key: None,
			cursor: 0,
			spans: Vec::new(),
		}
	}

	/// Feeds one more segment entry's key, in segment order.
	pub fn push(&mut self, key: Key) {
		match self.span_start_key {
			None => {
				self.span_start_key = Some(key);
				self.span_start = self.cursor;
			}
			Some(_) => {
				let starts_new_rm_run = self.last_key.map_or(false, |last| !last.eq_rm(&key));
				let span_len = self.cursor - self.span_start;
				if starts_new_rm_run && span_len >= self.granularity {
					self.flush_span(self.last_key.unwrap());
					self.span_start_key = Some(key);
					self.span_start = self.cursor;
				}
			}
		}
		self.last_key = Some(key);
		self.cursor += 1;
	}

	fn flush_span(&mut self, high_key: Key) {
		if let Some(low_key) = self.span_start_key.take() {
			self.spans.push(RangeIndexEntry { low: self.span_start, high: self.cursor, low_key, high_key });
		}
	}

	/// Closes out the final in-progress span and returns the completed list.
	pub fn finish(mut self) -> Vec<RangeIndexEntry> {
		if let Some(last) = self.last_key {
			self.flush_span(last);
		}
		self.spans
	}
}

/// Runs the one-pass builder over an already-written K-rm-sorted segment
/// span and writes the resulting index spans out through `output`.
pub fn build_range_index(mut segment: ImmutableSpan<Entry>, granularity: u64, mut output: BackInserter<RangeIndexEntry>) -> Result<u64> {
	let mut builder = RangeIndexBuilder::new(granularity);
	while let Some(entry) = segment.next()? {
		builder.push(entry.key);
	}
	let spans = builder.finish();
	for span in &spans {
		output.push(span)?;
	}
	let written = spans.len() as u64;
	output.seal()?;
	Ok(written)
}

pub fn open_range_index(
	path: PathBuf,
	scheduler: Arc<IoScheduler>,
) -> Result<ImmutableSpan<RangeIndexEntry>> {
	let file = Arc::new(PooledFile::open(&path, OpenMode::Read)?);
	let len = file.size()? / RangeIndexEntry::SIZE as u64;
	Ok(ImmutableSpan::<RangeIndexEntry>::new(file, path, scheduler, 0, len))
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::entry::CountAndOffset;
	use crate::options::Options;

	fn temp_path(name: &str) -> PathBuf {
		let mut p = std::env::temp_dir();
		p.push("chess-pos-db-test");
		std::fs::create_dir_all(&p).unwrap();
		p.push(format!("rindex_{}_{}", name, std::process::id()));
		p
	}

	fn write_segment(path: &PathBuf, scheduler: &Arc<IoScheduler>, keys: &[Key]) -> u64 {
		let file = Arc::new(PooledFile::open(path, OpenMode::Truncate).unwrap());
		let mut vector = Vector::<Entry>::new(file.clone(), path.clone(), scheduler.clone()).unwrap();
		for k in keys {
			vector.push(&Entry::new(*k, CountAndOffset::new(1, Some(0)))).unwrap();
		}
		let len = vector.len();
		vector.seal().unwrap();
		len
	}

	#[test]
	fn builds_spans_that_respect_granularity_and_rm_run_boundaries() {
		let path = temp_path("segment");
		let _ = std::fs::remove_file(&path);
		let scheduler = Arc::new(IoScheduler::new(&Options::default().volume_map, 2));

		// Two K-rm runs: h[0..2] = (1,0,0) repeated 3x, then (2,0,0) repeated 3x.
		let keys: Vec<Key> =
			(0..3).map(|i| Key::new(1, 0, 0, i)).chain((0..3).map(|i| Key::new(2, 0, 0, i))).collect();
		let len = write_segment(&path, &scheduler, &keys);

		let file = Arc::new(PooledFile::open(&path, OpenMode::Read).unwrap());
		let segment = ImmutableSpan::<Entry>::new(file.clone(), path.clone(), scheduler.clone(), 0, len);

		let index_path = temp_path("index");
		let _ = std::fs::remove_file(&index_path);
		let index_file = Arc::new(PooledFile::open(&index_path, OpenMode::Truncate).unwrap());
		let index_vector = Vector::<RangeIndexEntry>::new(index_file.clone(), index_path.clone(), scheduler.clone()).unwrap();
		let sink = BackInserter::new(index_vector);

		// Granularity 2 forces a split as soon as a new rm-run starts past 2 entries.
		let written = build_range_index(segment, 2, sink).unwrap();
		assert!(written >= 2);

		let mut index_span = ImmutableSpan::<RangeIndexEntry>::new(index_file.clone(), index_path.clone(), scheduler, 0, written);
		let mut covered = 0u64;
		while let Some(span) = index_span.next().unwrap() {
			assert!(span.low < span.high);
			covered += span.high - span.low;
		}
		assert_eq!(covered, len);
		file.close();
		index_file.close();
		std::fs::remove_file(&path).unwrap();
		std::fs::remove_file(&index_path).unwrap();
	}
}
