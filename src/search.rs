// Copyright (c) chess-pos-db-core contributors.
// Licensed under the Apache License, Version 2.0 or the MIT license, at your option.
// Equal-range search over a K-full-sorted segment (spec.md §4.6).
//
// Every entry sharing the same K-rm fields is contiguous in K-full order
// (K-full only adds a tiebreaker after the K-rm fields), so the search for
// "every entry at this position" is a classic lower/upper-bound search
// under `Key::cmp_rm`. Large brackets are narrowed with an interpolation
// guess (assuming the opaque hash lanes are close to uniformly
// distributed) falling back to plain bisection; once a bracket is no
// wider than the read window `W` it is finished with one windowed read and
// a linear scan. A batch of lookups is sorted and walked with a
// monotonically-advancing floor (the "cross-update" optimisation): since
// distinct rm-classes in a K-full-sorted segment never overlap or regress,
// each key's search only needs to start where the previous, strictly
// smaller key's search left off. A key that is rm-equal to the previous
// one shares its range outright rather than being floored past it.

use std::cmp::Ordering;

use crate::entry::{Entry, ENTRY_SIZE};
use crate::error::Result;
use crate::file::PooledFile;
use crate::key::Key;
use crate::range_index::RangeIndexEntry;

fn window_size() -> u64 {
	(32 * 1024 / ENTRY_SIZE).max(3) as u64
}

fn read_entry(file: &PooledFile, idx: u64) -> Result<Entry> {
	let mut buf = [0u8; ENTRY_SIZE];
	file.read(&mut buf, idx * ENTRY_SIZE as u64, ENTRY_SIZE, 1)?;
	Ok(Entry::from_bytes(&buf))
}

fn read_window(file: &PooledFile, start: u64, count: u64) -> Result<Vec<Entry>> {
	if count == 0 {
		return Ok(Vec::new());
	}
	let mut buf = vec![0u8; (count as usize) * ENTRY_SIZE];
	let got = file.read(&mut buf, start * ENTRY_SIZE as u64, ENTRY_SIZE, count)?;
	Ok((0..got).map(|i| Entry::from_bytes(&buf[(i as usize) * ENTRY_SIZE..(i as usize + 1) * ENTRY_SIZE])).collect())
}

/// Interpolates assuming `h[0]` is roughly uniform over its range; falls
/// back to the midpoint whenever the interpolation would be degenerate.
fn guess_index(lo: u64, hi: u64, lo_key: Key, hi_key: Key, target: Key) -> u64 {
	let span = hi - lo;
	if span <= 1 {
		return lo;
	}
	let lo_v = lo_key.h[0] as u64;
	let hi_v = hi_key.h[0] as u64;
	let t_v = target.h[0] as u64;
	if hi_v <= lo_v || t_v <= lo_v {
		return lo + span / 2;
	}
	if t_v >= hi_v {
		return lo + span - 1;
	}
	let fraction_num = (t_v - lo_v) as u128 * span as u128;
	let guess = lo + (fraction_num / (hi_v - lo_v) as u128) as u64;
	guess.clamp(lo, hi.saturating_sub(1))
}

/// First index in `[lo, hi)` whose key is not `Less` than `target` under
/// `cmp_rm`.
fn lower_bound_rm(file: &PooledFile, target: &Key, mut lo: u64, mut hi: u64) -> Result<u64> {
	let w = window_size();
	while hi - lo > w {
		let lo_key = read_entry(file, lo)?.key;
		let hi_key = read_entry(file, hi - 1)?.key;
		let mid = guess_index(lo, hi, lo_key, hi_key, *target).max(lo).min(hi - 1);
		let mid_key = read_entry(file, mid)?.key;
		if mid_key.cmp_rm(target) == Ordering::Less {
			lo = mid + 1;
		} else {
			hi = mid;
		}
	}
	let window = read_window(file, lo, hi - lo)?;
	for (i, e) in window.iter().enumerate() {
		if e.key.cmp_rm(target) != Ordering::Less {
			return Ok(lo + i as u64);
		}
	}
	Ok(hi)
}

/// First index in `[lo, hi)` whose key is `Greater` than `target` under
/// `cmp_rm`.
fn upper_bound_rm(file: &PooledFile, target: &Key, mut lo: u64, mut hi: u64) -> Result<u64> {
	let w = window_size();
	while hi - lo > w {
		let lo_key = read_entry(file, lo)?.key;
		let hi_key = read_entry(file, hi - 1)?.key;
		let mid = guess_index(lo, hi, lo_key, hi_key, *target).max(lo).min(hi - 1);
		let mid_key = read_entry(file, mid)?.key;
		if mid_key.cmp_rm(target) == Ordering::Greater {
			hi = mid;
		} else {
			lo = mid + 1;
		}
	}
	let window = read_window(file, lo, hi - lo)?;
	for (i, e) in window.iter().enumerate() {
		if e.key.cmp_rm(target) == Ordering::Greater {
			return Ok(lo + i as u64);
		}
	}
	Ok(hi)
}

/// Narrows `[0, len)` to the range-index span bracketing `target`, or
/// returns the full segment bounds if no index is supplied or no span
/// matches (e.g. an empty segment).
fn seed_from_range_index(index: Option<&[RangeIndexEntry]>, target: &Key, len: u64) -> (u64, u64) {
	let index = match index {
		Some(index) if !index.is_empty() => index,
		_ => return (0, len),
	};
	// Spans are produced in ascending segment order, so a plain binary
	// search over `low` suffices.
	let mut lo = 0usize;
	let mut hi = index.len();
	while lo < hi {
		let mid = lo + (hi - lo) / 2;
		if index[mid].high_key.cmp_rm(target) == Ordering::Less {
			lo = mid + 1;
		} else {
			hi = mid;
		}
	}
	match index.get(lo) {
		Some(span) => (span.low, span.high),
		None => (0, len),
	}
}

/// Finds the `[low, high)` range of `target`'s K-rm equivalence class
/// within a K-full-sorted segment of `len` entries.
pub fn equal_range(
	file: &PooledFile,
	len: u64,
	index: Option<&[RangeIndexEntry]>,
	target: &Key,
	floor: u64,
) -> Result<(u64, u64)> {
	if floor >= len {
		return Ok((len, len));
	}
	let (seed_lo, seed_hi) = seed_from_range_index(index, target, len);
	let lo = seed_lo.max(floor).min(len);
	let hi = seed_hi.max(lo).min(len);
	let low = lower_bound_rm(file, target, lo, hi)?;
	let high = upper_bound_rm(file, target, low, hi.max(low))?;
	Ok((low, high))
}

/// One batched lookup's resolved `[low, high)` range, alongside the index
/// of the key in the caller's original (unsorted) input order.
pub struct BatchResult {
	pub original_index: usize,
	pub low: u64,
	pub high: u64,
}

/// Searches every key in `keys` against the segment, applying the
/// cross-update optimisation when `enable_cross_update` is set: keys are
/// processed in ascending `cmp_rm` order, and a key whose `cmp_rm` class is
/// strictly greater than the previous key's starts its search no earlier
/// than the previous key's resolved upper bound (ranges of distinct K-rm
/// classes never overlap or regress in a K-full-sorted segment). A key
/// that is K-rm-equal to the previous one — a transposition sharing the
/// same board, or a literal duplicate key across two `PositionQuery`s —
/// shares that same range outright rather than being floored past it,
/// which would otherwise search an empty `[prev_high, prev_high)` window
/// and silently report zero occurrences (spec.md §4.6, §8 property #7).
pub fn equal_range_batch(
	file: &PooledFile,
	len: u64,
	index: Option<&[RangeIndexEntry]>,
	keys: &[Key],
	enable_cross_update: bool,
) -> Result<Vec<BatchResult>> {
	let mut order: Vec<usize> = (0..keys.len()).collect();
	order.sort_by(|&a, &b| keys[a].cmp_rm(&keys[b]));

	let mut results = Vec::with_capacity(keys.len());
	let mut prev: Option<(Key, u64, u64)> = None;
	for &original_index in &order {
		let target = keys[original_index];
		let (low, high) = match prev {
			Some((prev_key, prev_low, prev_high)) if enable_cross_update && target.eq_rm(&prev_key) => (prev_low, prev_high),
			Some((_, _, prev_high)) if enable_cross_update => equal_range(file, len, index, &target, prev_high)?,
			_ => equal_range(file, len, index, &target, 0)?,
		};
		prev = Some((target, low, high));
		results.push(BatchResult { original_index, low, high });
	}
	results.sort_by_key(|r| r.original_index);
	Ok(results)
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::entry::CountAndOffset;
	use crate::file::OpenMode;
	use std::path::PathBuf;

	fn temp_path(name: &str) -> PathBuf {
		let mut p = std::env::temp_dir();
		p.push("chess-pos-db-test");
		std::fs::create_dir_all(&p).unwrap();
		p.push(format!("search_{}_{}", name, std::process::id()));
		p
	}

	fn write_segment(path: &PathBuf, groups: &[(u32, usize)]) -> u64 {
		let file = PooledFile::open(path, OpenMode::Truncate).unwrap();
		let mut buf = Vec::new();
		let mut total = 0u64;
		for (h0, count) in groups {
			for i in 0..*count {
				let e = Entry::new(Key::new(*h0, 0, 0, i as u32), CountAndOffset::new(1, Some(0)));
				buf.extend_from_slice(&e.to_bytes());
				total += 1;
			}
		}
		file.append(&buf, ENTRY_SIZE, total).unwrap();
		file.close();
		total
	}

	#[test]
	fn finds_the_exact_contiguous_range_for_a_repeated_key() {
		let path = temp_path("ranges");
		let _ = std::fs::remove_file(&path);
		let groups = [(1u32, 3usize), (2, 5), (3, 1), (4, 10)];
		let len = write_segment(&path, &groups);

		let file = PooledFile::open(&path, OpenMode::Read).unwrap();
		let (low, high) = equal_range(&file, len, None, &Key::new(2, 0, 0, 0), 0).unwrap();
		assert_eq!((low, high), (3, 8));

		let (low, high) = equal_range(&file, len, None, &Key::new(4, 0, 0, 0), 0).unwrap();
		assert_eq!((low, high), (9, 19));

		let (low, high) = equal_range(&file, len, None, &Key::new(99, 0, 0, 0), 0).unwrap();
		assert_eq!(low, high);

		file.close();
		std::fs::remove_file(&path).unwrap();
	}

	#[test]
	fn batch_search_with_cross_update_matches_individual_lookups() {
		let path = temp_path("batch");
		let _ = std::fs::remove_file(&path);
		let groups = [(1u32, 3usize), (2, 5), (3, 1), (4, 10)];
		let len = write_segment(&path, &groups);
		let file = PooledFile::open(&path, OpenMode::Read).unwrap();

		let keys = vec![Key::new(4, 0, 0, 0), Key::new(1, 0, 0, 0), Key::new(3, 0, 0, 0)];
		let batch = equal_range_batch(&file, len, None, &keys, true).unwrap();
		let mut by_index: Vec<_> = batch.iter().collect();
		by_index.sort_by_key(|r| r.original_index);
		assert_eq!((by_index[0].low, by_index[0].high), (9, 19));
		assert_eq!((by_index[1].low, by_index[1].high), (0, 3));
		assert_eq!((by_index[2].low, by_index[2].high), (8, 9));

		file.close();
		std::fs::remove_file(&path).unwrap();
	}

	#[test]
	fn batch_search_with_cross_update_handles_rm_equal_duplicate_keys() {
		// Two keys that are K-rm-equal but K-full-distinct (same board and
		// side to move, different reverse-move/result/level bits) must not
		// have the second one's range zeroed out by the first one's floor.
		let path = temp_path("batch_rm_equal");
		let _ = std::fs::remove_file(&path);
		let groups = [(1u32, 3usize), (2, 5), (3, 1)];
		let len = write_segment(&path, &groups);
		let file = PooledFile::open(&path, OpenMode::Read).unwrap();

		let a = Key::new(2, 0, 0, 0);
		let b = Key::new(2, 0, 0, 1);
		assert!(a.eq_rm(&b));
		assert_ne!(a, b);

		let keys = vec![a, b];
		let batch = equal_range_batch(&file, len, None, &keys, true).unwrap();
		let mut by_index: Vec<_> = batch.iter().collect();
		by_index.sort_by_key(|r| r.original_index);
		let individual_a = equal_range(&file, len, None, &a, 0).unwrap();
		let individual_b = equal_range(&file, len, None, &b, 0).unwrap();
		assert_eq!((by_index[0].low, by_index[0].high), individual_a);
		assert_eq!((by_index[1].low, by_index[1].high), individual_b);
		assert_eq!((by_index[0].low, by_index[0].high), (3, 8));
		assert_eq!((by_index[1].low, by_index[1].high), (3, 8));

		file.close();
		std::fs::remove_file(&path).unwrap();
	}
}
