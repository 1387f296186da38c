// Copyright (c) chess-pos-db-core contributors.
// Licensed under the Apache License, Version 2.0 or the MIT license, at your option.
// A partition: a directory of numbered segment files plus their sibling
// range indices (spec.md §3 "Partition", §4.7). Segment ids are a
// monotonically increasing `u32`; segments may freely overlap in K-full
// keyspace (no invariant requires otherwise). Writes happen off the
// calling thread as "future files" the caller later awaits with
// `collect_future_files`, grounded on the same submit-then-await shape
// `scheduler.rs`/`vector.rs` use for their own async jobs.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::entry::{CountAndOffset, Entry};
use crate::error::{Error, Result};
use crate::key::Key;
use crate::merge::{merge_k_way, DedupCombine};
use crate::range_index::{build_range_index, RangeIndexEntry};
use crate::scheduler::IoScheduler;
use crate::segment::{self, Segment, Select, Stats};
use crate::span::ImmutableSpan;
use crate::vector::{BackInserter, Vector};

fn cmp_full_then_offset(a: &Entry, b: &Entry) -> Ordering {
	a.key.cmp_full(&b.key).then_with(|| {
		// Ties under K-full compare equal on every key bit; break on whose
		// game was seen first so the in-memory dedup pass below keeps the
		// earliest `first_game_offset` (spec.md §4.8 sort-stage note).
		let oa = a.counts.first_game_offset().unwrap_or(u64::MAX);
		let ob = b.counts.first_game_offset().unwrap_or(u64::MAX);
		oa.cmp(&ob)
	})
}

/// Sorts `entries` under K-full (earliest game first on ties) and collapses
/// adjacent K-full-equal runs with `CountAndOffset::combine`, a
/// `std::unique`-style pass distinct from the deduplicating merge used by
/// `merge_all` (spec.md §4.4: "not applied during in-memory preparation of
/// a new segment").
/// Collapses adjacent K-full-equal entries in an already-sorted slice,
/// combining their counts. A `std::unique`-style pass, distinct from the
/// deduplicating merge `merge_all` uses (spec.md §4.4: "not applied during
/// in-memory preparation of a new segment").
fn dedup_adjacent(entries: Vec<Entry>) -> Vec<Entry> {
	let mut out: Vec<Entry> = Vec::with_capacity(entries.len());
	for entry in entries {
		match out.last_mut() {
			Some(last) if last.key.eq_full(&entry.key) => {
				last.counts = last.counts.combine(&entry.counts);
			}
			_ => out.push(entry),
		}
	}
	out
}

fn sort_and_dedup(mut entries: Vec<Entry>) -> Vec<Entry> {
	entries.sort_by(cmp_full_then_offset);
	dedup_adjacent(entries)
}

/// A pending asynchronous segment write: the id it was granted and a
/// handle to join once the sort+dedup+write work completes.
struct FutureFile {
	id: u32,
	handle: std::thread::JoinHandle<Result<Segment>>,
}

pub struct Partition {
	dir: PathBuf,
	scheduler: Arc<IoScheduler>,
	granularity: u64,
	max_fanout: usize,
	segments: Mutex<Vec<Segment>>,
	future: Mutex<Vec<FutureFile>>,
	next_id: Mutex<u32>,
}

impl Partition {
	/// Opens (or creates) a partition directory, rediscovering any segments
	/// already present. A data file is skipped with a `log::warn!` if its
	/// sibling index is absent, zero-sized itself, or its name doesn't
	/// parse as a segment id — matching the policy spec.md §5/§9 settles on
	/// for the "absent/corrupt sibling index" open question.
	pub fn open(dir: impl Into<PathBuf>, scheduler: Arc<IoScheduler>, granularity: u64, max_fanout: usize) -> Result<Partition> {
		let dir = dir.into();
		std::fs::create_dir_all(&dir)?;
		let mut ids = Vec::new();
		for entry in std::fs::read_dir(&dir)? {
			let entry = entry?;
			let name = entry.file_name();
			let name = name.to_string_lossy();
			if name.ends_with("_index") || name.ends_with(".tmp") {
				continue;
			}
			let id: u32 = match name.parse() {
				Ok(id) => id,
				Err(_) => {
					log::warn!(target: "chess-pos-db", "skipping non-segment file {:?} in partition {:?}", name, dir);
					continue;
				}
			};
			let meta = entry.metadata()?;
			if meta.len() == 0 {
				log::warn!(target: "chess-pos-db", "skipping zero-size segment {} in partition {:?}", id, dir);
				continue;
			}
			if !dir.join(format!("{}_index", id)).exists() {
				log::warn!(target: "chess-pos-db", "skipping segment {} in partition {:?}: sibling index absent", id, dir);
				continue;
			}
			ids.push(id);
		}
		ids.sort_unstable();
		let mut segments = Vec::with_capacity(ids.len());
		for id in ids {
			segments.push(Segment::open(&dir, id, scheduler.clone())?);
		}
		let next_id = segments.iter().map(|s| s.id).max().map_or(0, |m| m + 1);
		Ok(Partition {
			dir,
			scheduler,
			granularity,
			max_fanout,
			segments: Mutex::new(segments),
			future: Mutex::new(Vec::new()),
			next_id: Mutex::new(next_id),
		})
	}

	fn alloc_id(&self) -> u32 {
		let mut next = self.next_id.lock();
		let id = *next;
		*next += 1;
		id
	}

	/// Reserves `id` for a forced-id write (spec.md §4.8 parallel ingest),
	/// failing if it is already present or pending.
	fn reserve_forced_id(&self, id: u32) -> Result<()> {
		let segments = self.segments.lock();
		if segments.iter().any(|s| s.id == id) {
			return Err(Error::IdConflict { path: segment::segment_path(&self.dir, id), id });
		}
		drop(segments);
		let future = self.future.lock();
		if future.iter().any(|f| f.id == id) {
			return Err(Error::IdConflict { path: segment::segment_path(&self.dir, id), id });
		}
		drop(future);
		let mut next = self.next_id.lock();
		if id >= *next {
			*next = id + 1;
		}
		Ok(())
	}

	/// Grabs the next id, sorts and dedups `entries` off-thread, and writes
	/// the resulting segment + sibling index. Returns the id the eventual
	/// segment will be published under; call `collect_future_files` to wait
	/// for it and promote it into the queryable segment list.
	pub fn store_unordered(&self, entries: Vec<Entry>, forced_id: Option<u32>) -> Result<u32> {
		let id = match forced_id {
			Some(id) => {
				self.reserve_forced_id(id)?;
				id
			}
			None => self.alloc_id(),
		};
		let dir = self.dir.clone();
		let scheduler = self.scheduler.clone();
		let granularity = self.granularity;
		let handle = std::thread::spawn(move || {
			let deduped = sort_and_dedup(entries);
			segment::write_segment(&dir, id, scheduler, granularity, &deduped)
		});
		self.future.lock().push(FutureFile { id, handle });
		Ok(id)
	}

	/// Writes an already K-full-sorted buffer directly under `id`, skipping
	/// the dedup pass (spec.md §4.7: "writes an already-sorted buffer
	/// directly (no dedup)").
	pub fn store_ordered(&self, entries: &[Entry], id: u32) -> Result<()> {
		self.reserve_forced_id(id)?;
		let segment = segment::write_segment(&self.dir, id, self.scheduler.clone(), self.granularity, entries)?;
		let mut segments = self.segments.lock();
		segments.push(segment);
		segments.sort_by_key(|s| s.id);
		Ok(())
	}

	/// Used by the ingest pipeline's write stage (pipeline.rs): `entries`
	/// has already been sorted by the sort stage, so this only collapses
	/// adjacent duplicates before writing, then publishes the segment
	/// synchronously (the pipeline's single write worker already serialises
	/// this, so no extra background thread is needed here).
	pub fn finish_sorted_dedup_write(&self, entries: Vec<Entry>, forced_id: Option<u32>) -> Result<u32> {
		let id = match forced_id {
			Some(id) => {
				self.reserve_forced_id(id)?;
				id
			}
			None => self.alloc_id(),
		};
		let deduped = dedup_adjacent(entries);
		let segment = segment::write_segment(&self.dir, id, self.scheduler.clone(), self.granularity, &deduped)?;
		let mut segments = self.segments.lock();
		segments.push(segment);
		segments.sort_by_key(|s| s.id);
		Ok(id)
	}

	/// Awaits every pending `store_unordered` write and promotes the
	/// resulting segments into the queryable list, sorted by id.
	pub fn collect_future_files(&self) -> Result<()> {
		let pending: Vec<FutureFile> = std::mem::take(&mut *self.future.lock());
		let mut segments = self.segments.lock();
		for future in pending {
			let segment = future.handle.join().map_err(|_| Error::Corruption("segment write thread panicked".into()))??;
			segments.push(segment);
		}
		segments.sort_by_key(|s| s.id);
		Ok(())
	}

	/// The id the next unforced `store_unordered`/`store_ordered` call
	/// would be granted, without reserving it. Used by the facade to plan
	/// forced-id blocks for parallel ingest before any worker starts.
	pub fn peek_next_id(&self) -> u32 {
		*self.next_id.lock()
	}

	pub fn segment_count(&self) -> usize {
		self.segments.lock().len()
	}

	/// Awaits pending writes, then deletes every segment and its sibling
	/// index, leaving an empty partition.
	pub fn clear(&self) -> Result<()> {
		self.collect_future_files()?;
		let mut segments = self.segments.lock();
		for segment in segments.drain(..) {
			segment.close();
			let _ = std::fs::remove_file(segment::segment_path(&self.dir, segment.id));
			let _ = std::fs::remove_file(segment::index_path(&self.dir, segment.id));
		}
		Ok(())
	}

	/// Queries every current segment for every key, merging per-segment
	/// `Stats` (spec.md §5: "Across segment files: no cross-file ordering;
	/// queries must visit every segment").
	pub fn query(&self, keys: &[Key], select: Select, enable_cross_update: bool) -> Result<Vec<Stats>> {
		let segments = self.segments.lock();
		let mut out = vec![Stats::default(); keys.len()];
		for segment in segments.iter() {
			let per_segment = segment.query(keys, select, enable_cross_update)?;
			for (acc, s) in out.iter_mut().zip(per_segment.iter()) {
				acc.merge(s);
			}
		}
		Ok(out)
	}

	fn dedup_combine() -> DedupCombine<Entry> {
		DedupCombine {
			is_duplicate: |a: &Entry, b: &Entry| a.key.eq_full(&b.key),
			combine: |a: &Entry, b: &Entry| Entry::new(a.key, a.counts.combine(&b.counts)),
		}
	}

	/// Builds one new segment from every current segment via a
	/// deduplicating k-way merge (spec.md §4.4), writes it under a
	/// temporary name, deletes the originals, then renames the merged
	/// result into place under the lowest original id.
	pub fn merge_all(&self) -> Result<()> {
		self.collect_future_files()?;
		self.merge_into(&self.dir)?;
		Ok(())
	}

	/// As `merge_all`, but writes into a fresh directory and leaves the
	/// source partition untouched (spec.md §4.7 `replicate_merge_all`).
	pub fn replicate_merge_all(&self, dst_dir: impl Into<PathBuf>) -> Result<()> {
		self.collect_future_files()?;
		let dst_dir = dst_dir.into();
		std::fs::create_dir_all(&dst_dir)?;
		self.merge_into_fresh(&dst_dir)
	}

	fn merge_into(&self, dir: &Path) -> Result<()> {
		let mut segments = self.segments.lock();
		if segments.len() <= 1 {
			return Ok(());
		}
		let lowest_id = segments.iter().map(|s| s.id).min().unwrap();
		let spans: Vec<ImmutableSpan<Entry>> = segments.iter().map(|s| s.as_span()).collect();

		let merged_id = u32::MAX; // temporary id, never collides with a real one
		let merged = Self::merge_segments(dir, merged_id, self.scheduler.clone(), self.granularity, self.max_fanout, spans)?;

		let old_ids: Vec<u32> = segments.iter().map(|s| s.id).collect();
		for s in segments.drain(..) {
			s.close();
		}
		for id in old_ids {
			let _ = std::fs::remove_file(segment::segment_path(dir, id));
			let _ = std::fs::remove_file(segment::index_path(dir, id));
		}
		merged.close();
		std::fs::rename(segment::segment_path(dir, merged_id), segment::segment_path(dir, lowest_id))?;
		std::fs::rename(segment::index_path(dir, merged_id), segment::index_path(dir, lowest_id))?;

		*segments = vec![Segment::open(dir, lowest_id, self.scheduler.clone())?];
		Ok(())
	}

	fn merge_into_fresh(&self, dst_dir: &Path) -> Result<()> {
		let segments = self.segments.lock();
		if segments.is_empty() {
			return Ok(());
		}
		let lowest_id = segments.iter().map(|s| s.id).min().unwrap();
		let spans: Vec<ImmutableSpan<Entry>> = segments.iter().map(|s| s.as_span()).collect();
		let merged = Self::merge_segments(dst_dir, lowest_id, self.scheduler.clone(), self.granularity, self.max_fanout, spans)?;
		merged.close();
		Ok(())
	}

	/// Merges `spans` (presumed K-full-sorted) into a freshly-written
	/// segment `id` under `dir`: a dedup k-way merge into a plain entries
	/// file, then a second pass building the sibling range index, then the
	/// usual write-temp/rename-into-place handoff.
	fn merge_segments(
		dir: &Path,
		id: u32,
		scheduler: Arc<IoScheduler>,
		granularity: u64,
		max_fanout: usize,
		spans: Vec<ImmutableSpan<Entry>>,
	) -> Result<Segment> {
		std::fs::create_dir_all(dir)?;
		let tmp_seg = dir.join(format!("{}.tmp", id));
		let tmp_idx = dir.join(format!("{}_index.tmp", id));

		let out_file = Arc::new(crate::file::PooledFile::open(&tmp_seg, crate::file::OpenMode::Truncate)?);
		let out_vector = Vector::<Entry>::new(out_file.clone(), tmp_seg.clone(), scheduler.clone())?;
		let sink = BackInserter::new(out_vector);

		let tmp_merge_dir = dir.join(format!("merge_tmp_{}", id));
		let written = merge_k_way(
			spans,
			&scheduler,
			&tmp_merge_dir,
			max_fanout,
			|a: &Entry, b: &Entry| a.key.cmp_full(&b.key),
			sink,
			Some(Self::dedup_combine()),
		)?;
		out_file.close();
		let _ = std::fs::remove_dir_all(&tmp_merge_dir);

		let idx_file = Arc::new(crate::file::PooledFile::open(&tmp_idx, crate::file::OpenMode::Truncate)?);
		let idx_vector = Vector::<RangeIndexEntry>::new(idx_file.clone(), tmp_idx.clone(), scheduler.clone())?;
		let idx_sink = BackInserter::new(idx_vector);
		let merged_file = Arc::new(crate::file::PooledFile::open(&tmp_seg, crate::file::OpenMode::Read)?);
		let merged_span = ImmutableSpan::<Entry>::new(merged_file.clone(), tmp_seg.clone(), scheduler.clone(), 0, written);
		build_range_index(merged_span, granularity, idx_sink)?;
		merged_file.close();
		idx_file.close();

		let final_seg = segment::segment_path(dir, id);
		let final_idx = segment::index_path(dir, id);
		std::fs::rename(&tmp_seg, &final_seg)?;
		std::fs::rename(&tmp_idx, &final_idx)?;
		Segment::open(dir, id, scheduler)
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::key::{GameLevel, GameResult};

	fn temp_dir(name: &str) -> PathBuf {
		let mut p = std::env::temp_dir();
		p.push("chess-pos-db-test");
		p.push(format!("partition_{}_{}", name, std::process::id()));
		let _ = std::fs::remove_dir_all(&p);
		std::fs::create_dir_all(&p).unwrap();
		p
	}

	fn entry(h0: u32, count: u64, offset: u64) -> Entry {
		Entry::new(
			Key::from_rm_parts(h0, 0, 0, 0, GameLevel::Human, GameResult::Draw),
			CountAndOffset::new(count, Some(offset)),
		)
	}

	#[test]
	fn store_unordered_dedups_and_becomes_queryable_after_collect() {
		let dir = temp_dir("store");
		let scheduler = Arc::new(IoScheduler::new(&[], 2));
		let partition = Partition::open(&dir, scheduler, 4, 8).unwrap();

		let entries = vec![entry(1, 1, 10), entry(1, 1, 3), entry(2, 1, 7)];
		let id = partition.store_unordered(entries, None).unwrap();
		assert_eq!(id, 0);
		partition.collect_future_files().unwrap();
		assert_eq!(partition.segment_count(), 1);

		let query_key = Key::from_rm_parts(1, 0, 0, 0, GameLevel::Human, GameResult::Draw);
		let stats = partition.query(&[query_key], Select::All, true).unwrap();
		assert_eq!(stats[0].total_count(), 2);
		assert_eq!(stats[0].get(GameLevel::Human, GameResult::Draw).unwrap().first_game_offset(), Some(3));
	}

	#[test]
	fn merge_all_collapses_segments_and_preserves_counts() {
		let dir = temp_dir("merge");
		let scheduler = Arc::new(IoScheduler::new(&[], 2));
		let partition = Partition::open(&dir, scheduler, 4, 8).unwrap();

		for i in 0..5u64 {
			partition.store_unordered(vec![entry(1, 1, i)], None).unwrap();
		}
		partition.collect_future_files().unwrap();
		assert_eq!(partition.segment_count(), 5);

		partition.merge_all().unwrap();
		assert_eq!(partition.segment_count(), 1);

		let query_key = Key::from_rm_parts(1, 0, 0, 0, GameLevel::Human, GameResult::Draw);
		let stats = partition.query(&[query_key], Select::All, true).unwrap();
		assert_eq!(stats[0].total_count(), 5);
		assert_eq!(stats[0].get(GameLevel::Human, GameResult::Draw).unwrap().first_game_offset(), Some(0));
	}

	#[test]
	fn replicate_merge_all_leaves_source_intact() {
		let dir = temp_dir("replicate_src");
		let dst = temp_dir("replicate_dst");
		let scheduler = Arc::new(IoScheduler::new(&[], 2));
		let partition = Partition::open(&dir, scheduler.clone(), 4, 8).unwrap();

		partition.store_unordered(vec![entry(1, 1, 0)], None).unwrap();
		partition.store_unordered(vec![entry(2, 1, 1)], None).unwrap();
		partition.collect_future_files().unwrap();
		assert_eq!(partition.segment_count(), 2);

		partition.replicate_merge_all(&dst).unwrap();
		assert_eq!(partition.segment_count(), 2); // source untouched

		let replicated = Partition::open(&dst, scheduler, 4, 8).unwrap();
		assert_eq!(replicated.segment_count(), 1);
		let query_key = Key::from_rm_parts(1, 0, 0, 0, GameLevel::Human, GameResult::Draw);
		let stats = replicated.query(&[query_key], Select::All, true).unwrap();
		assert_eq!(stats[0].total_count(), 1);
	}
}
