// Copyright (c) chess-pos-db-core contributors.
// Licensed under the Apache License, Version 2.0 or the MIT license, at your option.
// Segment file + sibling range index pairing, and query-time bucket
// aggregation (spec.md §4.7). A segment's entries are sorted under
// K-full; its sibling index is built under K-rm. Writing happens in one
// pass: each sorted, deduplicated entry both appends to the segment
// `Vector` and feeds `range_index::RangeIndexBuilder`, and both sinks are
// sealed under a temp name before an atomic rename publishes the pair
// (spec.md §3 "Lifecycles").

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::entry::Entry;
use crate::error::Result;
use crate::file::{OpenMode, PooledFile};
use crate::key::{GameLevel, GameResult, Key};
use crate::range_index::{RangeIndexBuilder, RangeIndexEntry};
use crate::scheduler::IoScheduler;
use crate::search;
use crate::span::{FixedSizeRecord, ImmutableSpan};
use crate::vector::{BackInserter, Vector};

/// Which entries of a K-rm equal-range a query should keep.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Select {
	/// K+rm-equal to the query: same board, side to move, and last move.
	Continuations,
	/// K-rm-equal but not K+rm-equal: same board and side to move, different
	/// last move (a transposition).
	Transpositions,
	/// Every K-rm-equal entry.
	All,
}

fn matches_select(query: &Key, candidate: &Key, select: Select) -> bool {
	match select {
		Select::All => candidate.eq_rm(query),
		Select::Continuations => candidate.eq_rm_full(query),
		Select::Transpositions => candidate.eq_rm(query) && !candidate.eq_rm_full(query),
	}
}

/// Per-(game_level, game_result) aggregated counts for one query key.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct Stats {
	buckets: [[Option<crate::entry::CountAndOffset>; 3]; 3],
}

impl Stats {
	pub fn add(&mut self, level: GameLevel, result: GameResult, counts: crate::entry::CountAndOffset) {
		let slot = &mut self.buckets[level.bits() as usize][result.bits() as usize];
		*slot = Some(match slot {
			Some(existing) => existing.combine(&counts),
			None => counts,
		});
	}

	pub fn get(&self, level: GameLevel, result: GameResult) -> Option<crate::entry::CountAndOffset> {
		self.buckets[level.bits() as usize][result.bits() as usize]
	}

	pub fn merge(&mut self, other: &Stats) {
		for level in GameLevel::ALL {
			for result in GameResult::ALL {
				if let Some(co) = other.get(level, result) {
					self.add(level, result, co);
				}
			}
		}
	}

	pub fn total_count(&self) -> u64 {
		let mut total = 0u64;
		for level in GameLevel::ALL {
			for result in GameResult::ALL {
				if let Some(co) = self.get(level, result) {
					total += co.count();
				}
			}
		}
		total
	}
}

pub fn segment_path(dir: &Path, id: u32) -> PathBuf {
	dir.join(id.to_string())
}

pub fn index_path(dir: &Path, id: u32) -> PathBuf {
	dir.join(format!("{}_index", id))
}

/// An open segment: its entry file, its fully-loaded sibling range index
/// (small enough to keep resident — at worst `len / G` entries), and the
/// id it was published under.
pub struct Segment {
	pub id: u32,
	file: Arc<PooledFile>,
	len: u64,
	index: Vec<RangeIndexEntry>,
	scheduler: Arc<IoScheduler>,
	path: PathBuf,
}

impl Segment {
	pub fn open(dir: &Path, id: u32, scheduler: Arc<IoScheduler>) -> Result<Segment> {
		let path = segment_path(dir, id);
		let idx_path = index_path(dir, id);
		let file = Arc::new(PooledFile::open(&path, OpenMode::Read)?);
		let len = file.size()? / Entry::SIZE as u64;

		let idx_file = Arc::new(PooledFile::open(&idx_path, OpenMode::Read)?);
		let idx_len = idx_file.size()? / RangeIndexEntry::SIZE as u64;
		let mut idx_span = ImmutableSpan::<RangeIndexEntry>::new(idx_file.clone(), idx_path, scheduler.clone(), 0, idx_len);
		let mut index = Vec::with_capacity(idx_len as usize);
		while let Some(entry) = idx_span.next()? {
			index.push(entry);
		}
		idx_file.close();

		Ok(Segment { id, file, len, index, scheduler, path })
	}

	pub fn len(&self) -> u64 {
		self.len
	}

	pub fn is_empty(&self) -> bool {
		self.len == 0
	}

	fn read_range(&self, low: u64, high: u64) -> Result<Vec<Entry>> {
		if low >= high {
			return Ok(Vec::new());
		}
		let count = high - low;
		let mut buf = vec![0u8; (count as usize) * Entry::SIZE];
		let got = self.file.read(&mut buf, low * Entry::SIZE as u64, Entry::SIZE, count)?;
		Ok((0..got).map(|i| Entry::from_bytes(&buf[(i as usize) * Entry::SIZE..(i as usize + 1) * Entry::SIZE])).collect())
	}

	/// Resolves `stats[select]` for each of `keys`, in the caller's order.
	pub fn query(&self, keys: &[Key], select: Select, enable_cross_update: bool) -> Result<Vec<Stats>> {
		let batch = search::equal_range_batch(&self.file, self.len, Some(&self.index), keys, enable_cross_update)?;
		let mut results = vec![Stats::default(); keys.len()];
		for r in &batch {
			let query_key = &keys[r.original_index];
			let candidates = self.read_range(r.low, r.high)?;
			let stats = &mut results[r.original_index];
			for candidate in &candidates {
				if matches_select(query_key, &candidate.key, select) {
					stats.add(candidate.key.game_level(), candidate.key.game_result(), candidate.counts);
				}
			}
		}
		Ok(results)
	}

	pub fn as_span(&self) -> ImmutableSpan<Entry> {
		ImmutableSpan::<Entry>::new(self.file.clone(), self.path.clone(), self.scheduler.clone(), 0, self.len)
	}

	pub fn close(&self) {
		self.file.close();
	}
}

/// Writes an already K-full-sorted, deduplicated slice of entries as a new
/// segment: streams it through a `Vector` and a `RangeIndexBuilder` in one
/// pass, seals both under temporary names, then renames them into place
/// together so the pair only ever becomes visible atomically.
pub fn write_segment(
	dir: &Path,
	id: u32,
	scheduler: Arc<IoScheduler>,
	granularity: u64,
	entries: &[Entry],
) -> Result<Segment> {
	std::fs::create_dir_all(dir)?;
	let tmp_seg = dir.join(format!("{}.tmp", id));
	let tmp_idx = dir.join(format!("{}_index.tmp", id));

	let seg_file = Arc::new(PooledFile::open(&tmp_seg, OpenMode::Truncate)?);
	let mut seg_vector = Vector::<Entry>::new(seg_file.clone(), tmp_seg.clone(), scheduler.clone())?;
	let idx_file = Arc::new(PooledFile::open(&tmp_idx, OpenMode::Truncate)?);
	let idx_vector = Vector::<RangeIndexEntry>::new(idx_file.clone(), tmp_idx.clone(), scheduler.clone())?;
	let mut idx_sink = BackInserter::new(idx_vector);

	let mut builder = RangeIndexBuilder::new(granularity);
	for entry in entries {
		seg_vector.push(entry)?;
		builder.push(entry.key);
	}
	seg_vector.seal()?;
	for span in builder.finish() {
		idx_sink.push(&span)?;
	}
	idx_sink.seal()?;
	seg_file.close();
	idx_file.close();

	let final_seg = segment_path(dir, id);
	let final_idx = index_path(dir, id);
	std::fs::rename(&tmp_seg, &final_seg)?;
	std::fs::rename(&tmp_idx, &final_idx)?;

	Segment::open(dir, id, scheduler)
}
