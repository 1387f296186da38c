// Copyright (c) chess-pos-db-core contributors.
// Licensed under the Apache License, Version 2.0 or the MIT license, at your option.
// External sort: chunked in-memory sort, spilled to disk, then merged
// (spec.md §4.4). Chunk boundaries are decided purely by the caller's
// memory budget (`Options::max_merge_buffer_size`); the actual k-way merge
// lives in merge.rs. Chunk-partition bookkeeping is grounded on
// `qouteall-MiscAlgoRs`'s `concurrent_merge_sort.rs` (its `RangePartition`
// / chunk-index idiom), adapted to spill through `vector::Vector` instead
// of an in-memory `Vec` merge.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::Result;
use crate::file::{OpenMode, PooledFile};
use crate::merge::merge_k_way;
use crate::scheduler::IoScheduler;
use crate::span::{FixedSizeRecord, ImmutableSpan};
use crate::vector::{BackInserter, Vector};

/// One sorted run spilled to its own temporary file, ready to be merged.
pub struct Chunk<T: FixedSizeRecord> {
	pub path: PathBuf,
	pub len: u64,
	_marker: std::marker::PhantomData<T>,
}

fn chunk_path(dir: &Path, index: usize) -> PathBuf {
	dir.join(format!("chunk_{:08}.tmp", index))
}

/// Sorts `records` in place by `cmp`, then streams it to a fresh chunk file
/// via a `BackInserter`. Used when one batch of parsed/prepared records
/// already fits the merge buffer budget.
pub fn spill_sorted_chunk<T, F>(
	scheduler: &Arc<IoScheduler>,
	dir: &Path,
	index: usize,
	mut records: Vec<T>,
	cmp: F,
) -> Result<Chunk<T>>
where
	T: FixedSizeRecord,
	F: Fn(&T, &T) -> Ordering,
{
	records.sort_by(|a, b| cmp(a, b));
	let path = chunk_path(dir, index);
	let file = Arc::new(PooledFile::open(&path, OpenMode::Truncate)?);
	let vector = Vector::<T>::new(file, path.clone(), scheduler.clone())?;
	let mut sink = BackInserter::new(vector);
	for record in &records {
		sink.push(record)?;
	}
	let len = sink.len();
	sink.seal()?;
	Ok(Chunk { path, len, _marker: std::marker::PhantomData })
}

/// Divides an input `ImmutableSpan` into sorted chunks of at most
/// `records_per_chunk` elements each, reading the whole input once.
pub fn sort_into_chunks<T, F>(
	scheduler: &Arc<IoScheduler>,
	dir: &Path,
	mut input: ImmutableSpan<T>,
	records_per_chunk: usize,
	cmp: F,
) -> Result<Vec<Chunk<T>>>
where
	T: FixedSizeRecord,
	F: Fn(&T, &T) -> Ordering + Clone,
{
	let mut chunks = Vec::new();
	let mut buffer = Vec::with_capacity(records_per_chunk);
	let mut index = 0;
	while let Some(record) = input.next()? {
		buffer.push(record);
		if buffer.len() >= records_per_chunk {
			let batch = std::mem::replace(&mut buffer, Vec::with_capacity(records_per_chunk));
			chunks.push(spill_sorted_chunk(scheduler, dir, index, batch, cmp.clone())?);
			index += 1;
		}
	}
	if !buffer.is_empty() {
		chunks.push(spill_sorted_chunk(scheduler, dir, index, buffer, cmp.clone())?);
	}
	Ok(chunks)
}

/// Sorts an entire input span end to end: chunk, spill, then fanout-limited
/// k-way merge into `output`, deleting the chunk files once merged.
pub fn external_sort<T, F>(
	scheduler: &Arc<IoScheduler>,
	tmp_dir: &Path,
	input: ImmutableSpan<T>,
	records_per_chunk: usize,
	max_fanout: usize,
	cmp: F,
	output: BackInserter<T>,
) -> Result<u64>
where
	T: FixedSizeRecord,
	F: Fn(&T, &T) -> Ordering + Clone,
{
	std::fs::create_dir_all(tmp_dir)?;
	let chunks = sort_into_chunks(scheduler, tmp_dir, input, records_per_chunk, cmp.clone())?;
	let spans: Result<Vec<ImmutableSpan<T>>> = chunks
		.iter()
		.map(|c| {
			let file = Arc::new(PooledFile::open(&c.path, OpenMode::Read)?);
			Ok(ImmutableSpan::<T>::new(file, c.path.clone(), scheduler.clone(), 0, c.len))
		})
		.collect();
	let spans = spans?;
	let written = merge_k_way(spans, scheduler, &tmp_dir.join("merge"), max_fanout, cmp, output, None)?;
	for chunk in &chunks {
		let _ = std::fs::remove_file(&chunk.path);
	}
	Ok(written)
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::entry::{CountAndOffset, Entry};
	use crate::options::Options;

	fn temp_dir(name: &str) -> PathBuf {
		let mut p = std::env::temp_dir();
		p.push("chess-pos-db-test");
		p.push(format!("sort_{}_{}", name, std::process::id()));
		std::fs::create_dir_all(&p).unwrap();
		p
	}

	fn by_key(a: &Entry, b: &Entry) -> Ordering {
		a.key.cmp_full(&b.key)
	}

	#[test]
	fn external_sort_merges_out_of_order_chunks_correctly() {
		let dir = temp_dir("run");
		let scheduler = Arc::new(IoScheduler::new(&Options::default().volume_map, 2));

		let input_path = dir.join("input.dat");
		let input_file = Arc::new(PooledFile::open(&input_path, OpenMode::Truncate).unwrap());
		let mut vector = Vector::<Entry>::new(input_file.clone(), input_path.clone(), scheduler.clone()).unwrap();
		let mut values: Vec<u32> = (0..97u32).collect();
		// simple deterministic shuffle
		values.reverse();
		for v in &values {
			vector.push(&Entry::new(crate::key::Key::new(*v, 0, 0, 0), CountAndOffset::new(1, Some(*v as u64)))).unwrap();
		}
		let total = vector.len();
		vector.seal().unwrap();

		let input_span =
			ImmutableSpan::<Entry>::new(input_file.clone(), input_path.clone(), scheduler.clone(), 0, total);

		let out_path = dir.join("output.dat");
		let out_file = Arc::new(PooledFile::open(&out_path, OpenMode::Truncate).unwrap());
		let out_vector = Vector::<Entry>::new(out_file.clone(), out_path.clone(), scheduler.clone()).unwrap();
		let sink = BackInserter::new(out_vector);

		let written = external_sort(&scheduler, &dir.join("tmp"), input_span, 10, 4, by_key, sink).unwrap();
		assert_eq!(written, 97);

		let mut out_span = ImmutableSpan::<Entry>::new(out_file.clone(), out_path.clone(), scheduler, 0, written);
		let mut prev: Option<Entry> = None;
		let mut count = 0;
		while let Some(e) = out_span.next().unwrap() {
			if let Some(p) = prev {
				assert!(p.key.cmp_full(&e.key) != Ordering::Greater);
			}
			prev = Some(e);
			count += 1;
		}
		assert_eq!(count, 97);

		input_file.close();
		out_file.close();
		std::fs::remove_dir_all(&dir).ok();
	}
}
