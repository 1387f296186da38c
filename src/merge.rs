// Copyright (c) chess-pos-db-core contributors.
// Licensed under the Apache License, Version 2.0 or the MIT license, at your option.
// Fanout-limited k-way merge (spec.md §4.4).
//
// Direct merges switch between a manual binary min-heap (N > 32 inputs) and
// a linear scan over the current fronts (N <= 32), both tie-broken on
// input index so equal keys come out in the order their source spans were
// given. When the input count exceeds the configured fanout `F`, inputs
// are merged in groups of `F` into intermediate spill files and the
// process recurses, grounded on the chunked-merge recursion in
// `qouteall-MiscAlgoRs`'s `concurrent_merge_sort.rs`.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::Result;
use crate::file::{OpenMode, PooledFile};
use crate::scheduler::IoScheduler;
use crate::span::{FixedSizeRecord, ImmutableSpan};
use crate::vector::{BackInserter, Vector};

/// Collapses adjacent records the merge considers duplicates, combining
/// them instead of emitting both. Used by partition compaction to fold
/// repeated keys' `CountAndOffset`s together.
pub struct DedupCombine<T> {
	pub is_duplicate: fn(&T, &T) -> bool,
	pub combine: fn(&T, &T) -> T,
}

struct Heap<'a, T, F: Fn(&T, &T) -> Ordering> {
	items: Vec<(T, usize)>,
	cmp: &'a F,
}

impl<'a, T, F: Fn(&T, &T) -> Ordering> Heap<'a, T, F> {
	fn new(cmp: &'a F) -> Self {
		Heap { items: Vec::new(), cmp }
	}

	fn order(&self, a: &(T, usize), b: &(T, usize)) -> Ordering {
		(self.cmp)(&a.0, &b.0).then_with(|| a.1.cmp(&b.1))
	}

	fn push(&mut self, item: (T, usize)) {
		self.items.push(item);
		let mut i = self.items.len() - 1;
		while i > 0 {
			let parent = (i - 1) / 2;
			if self.order(&self.items[i], &self.items[parent]) == Ordering::Less {
				self.items.swap(i, parent);
				i = parent;
			} else {
				break;
			}
		}
	}

	fn pop(&mut self) -> Option<(T, usize)> {
		if self.items.is_empty() {
			return None;
		}
		let last = self.items.len() - 1;
		self.items.swap(0, last);
		let result = self.items.pop();
		let mut i = 0;
		loop {
			let l = 2 * i + 1;
			let r = 2 * i + 2;
			let mut smallest = i;
			if l < self.items.len() && self.order(&self.items[l], &self.items[smallest]) == Ordering::Less {
				smallest = l;
			}
			if r < self.items.len() && self.order(&self.items[r], &self.items[smallest]) == Ordering::Less {
				smallest = r;
			}
			if smallest == i {
				break;
			}
			self.items.swap(i, smallest);
			i = smallest;
		}
		result
	}
}

fn merge_push<T: FixedSizeRecord>(
	pending: Option<T>,
	value: T,
	dedup: Option<&DedupCombine<T>>,
	output: &mut BackInserter<T>,
	written: &mut u64,
) -> Result<Option<T>> {
	match (pending, dedup) {
		(Some(p), Some(d)) if (d.is_duplicate)(&p, &value) => Ok(Some((d.combine)(&p, &value))),
		(Some(p), _) => {
			output.push(&p)?;
			*written += 1;
			Ok(Some(value))
		}
		(None, _) => Ok(Some(value)),
	}
}

/// Merges every record of every span in `spans`, in order, into `output`.
/// Switches strategy at 32 inputs; does not limit fanout itself (that is
/// `merge_k_way`'s job).
fn merge_direct<T, F>(
	mut spans: Vec<ImmutableSpan<T>>,
	cmp: &F,
	dedup: Option<&DedupCombine<T>>,
	output: &mut BackInserter<T>,
) -> Result<u64>
where
	T: FixedSizeRecord,
	F: Fn(&T, &T) -> Ordering,
{
	let mut written = 0u64;
	let mut pending: Option<T> = None;

	if spans.len() > 32 {
		let mut heap = Heap::new(cmp);
		for (idx, span) in spans.iter_mut().enumerate() {
			if let Some(v) = span.next()? {
				heap.push((v, idx));
			}
		}
		while let Some((value, idx)) = heap.pop() {
			if let Some(next) = spans[idx].next()? {
				heap.push((next, idx));
			}
			pending = merge_push(pending, value, dedup, output, &mut written)?;
		}
	} else {
		let n = spans.len();
		let mut fronts: Vec<Option<T>> = Vec::with_capacity(n);
		for span in spans.iter_mut() {
			fronts.push(span.next()?);
		}
		loop {
			let mut min_idx: Option<usize> = None;
			for i in 0..n {
				if let Some(v) = &fronts[i] {
					min_idx = match min_idx {
						None => Some(i),
						Some(mi) => {
							if cmp(v, fronts[mi].as_ref().unwrap()) == Ordering::Less {
								Some(i)
							} else {
								Some(mi)
							}
						}
					};
				}
			}
			let i = match min_idx {
				Some(i) => i,
				None => break,
			};
			let value = fronts[i].take().unwrap();
			fronts[i] = spans[i].next()?;
			pending = merge_push(pending, value, dedup, output, &mut written)?;
		}
	}

	if let Some(p) = pending {
		output.push(&p)?;
		written += 1;
	}
	Ok(written)
}

/// Fanout-limited k-way merge: recurses through intermediate spill files
/// whenever `spans.len()` exceeds `max_fanout`, then performs one final
/// direct merge into `output`, sealing it.
pub fn merge_k_way<T, F>(
	mut spans: Vec<ImmutableSpan<T>>,
	scheduler: &Arc<IoScheduler>,
	tmp_dir: &Path,
	max_fanout: usize,
	cmp: F,
	mut output: BackInserter<T>,
	dedup: Option<DedupCombine<T>>,
) -> Result<u64>
where
	T: FixedSizeRecord,
	F: Fn(&T, &T) -> Ordering + Clone,
{
	let fanout = max_fanout.max(2);
	std::fs::create_dir_all(tmp_dir)?;
	let mut level = 0;
	let mut intermediate_paths: Vec<PathBuf> = Vec::new();

	while spans.len() > fanout {
		let mut next_spans = Vec::new();
		let mut idx = 0;
		while !spans.is_empty() {
			let take = fanout.min(spans.len());
			let group: Vec<_> = spans.drain(0..take).collect();
			let path = tmp_dir.join(format!("merge_l{}_{}.tmp", level, idx));
			let file = Arc::new(PooledFile::open(&path, OpenMode::Truncate)?);
			let vector = Vector::<T>::new(file.clone(), path.clone(), scheduler.clone())?;
			let mut sink = BackInserter::new(vector);
			let written = merge_direct(group, &cmp, dedup.as_ref(), &mut sink)?;
			sink.seal()?;
			let read_file = Arc::new(PooledFile::open(&path, OpenMode::Read)?);
			next_spans.push(ImmutableSpan::<T>::new(read_file, path.clone(), scheduler.clone(), 0, written));
			intermediate_paths.push(path);
			idx += 1;
		}
		spans = next_spans;
		level += 1;
	}

	let written = merge_direct(spans, &cmp, dedup.as_ref(), &mut output)?;
	output.seal()?;
	for path in &intermediate_paths {
		let _ = std::fs::remove_file(path);
	}
	Ok(written)
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::entry::{CountAndOffset, Entry};
	use crate::key::Key;
	use crate::options::Options;

	fn temp_dir(name: &str) -> PathBuf {
		let mut p = std::env::temp_dir();
		p.push("chess-pos-db-test");
		p.push(format!("merge_{}_{}", name, std::process::id()));
		std::fs::create_dir_all(&p).unwrap();
		p
	}

	fn make_span(
		scheduler: &Arc<IoScheduler>,
		dir: &Path,
		name: &str,
		values: &[u32],
	) -> (Arc<PooledFile>, PathBuf, u64) {
		let path = dir.join(name);
		let _ = std::fs::remove_file(&path);
		let file = Arc::new(PooledFile::open(&path, OpenMode::Truncate).unwrap());
		let mut vector = Vector::<Entry>::new(file.clone(), path.clone(), scheduler.clone()).unwrap();
		for v in values {
			vector.push(&Entry::new(Key::new(*v, 0, 0, 0), CountAndOffset::new(1, Some(*v as u64)))).unwrap();
		}
		let len = vector.len();
		vector.seal().unwrap();
		(file, path, len)
	}

	fn by_key(a: &Entry, b: &Entry) -> Ordering {
		a.key.cmp_full(&b.key)
	}

	#[test]
	fn merges_many_small_sorted_runs_with_fanout_limit() {
		let dir = temp_dir("fanout");
		let scheduler = Arc::new(IoScheduler::new(&Options::default().volume_map, 2));

		let mut spans = Vec::new();
		for run in 0..10 {
			let values: Vec<u32> = (0..5).map(|i| run * 5 + i).collect();
			let (file, path, len) = make_span(&scheduler, &dir, &format!("run_{}.dat", run), &values);
			spans.push(ImmutableSpan::<Entry>::new(file, path, scheduler.clone(), 0, len));
		}

		let out_path = dir.join("out.dat");
		let out_file = Arc::new(PooledFile::open(&out_path, OpenMode::Truncate).unwrap());
		let out_vector = Vector::<Entry>::new(out_file.clone(), out_path.clone(), scheduler.clone()).unwrap();
		let sink = BackInserter::new(out_vector);

		let written = merge_k_way(spans, &scheduler, &dir.join("tmp"), 3, by_key, sink, None).unwrap();
		assert_eq!(written, 50);

		let mut out_span = ImmutableSpan::<Entry>::new(out_file.clone(), out_path.clone(), scheduler, 0, written);
		let mut prev: Option<u32> = None;
		let mut count = 0;
		while let Some(e) = out_span.next().unwrap() {
			if let Some(p) = prev {
				assert!(p <= e.key.h[0]);
			}
			prev = Some(e.key.h[0]);
			count += 1;
		}
		assert_eq!(count, 50);
		out_file.close();
		std::fs::remove_dir_all(&dir).ok();
	}

	#[test]
	fn dedup_combine_folds_equal_keys() {
		let dir = temp_dir("dedup");
		let scheduler = Arc::new(IoScheduler::new(&Options::default().volume_map, 2));

		let (f1, p1, l1) = make_span(&scheduler, &dir, "a.dat", &[1, 2, 2, 3]);
		let (f2, p2, l2) = make_span(&scheduler, &dir, "b.dat", &[2, 4]);
		let spans = vec![
			ImmutableSpan::<Entry>::new(f1, p1, scheduler.clone(), 0, l1),
			ImmutableSpan::<Entry>::new(f2, p2, scheduler.clone(), 0, l2),
		];

		let out_path = dir.join("out.dat");
		let out_file = Arc::new(PooledFile::open(&out_path, OpenMode::Truncate).unwrap());
		let out_vector = Vector::<Entry>::new(out_file.clone(), out_path.clone(), scheduler.clone()).unwrap();
		let sink = BackInserter::new(out_vector);

		let dedup = DedupCombine {
			is_duplicate: |a: &Entry, b: &Entry| a.key.eq_full(&b.key),
			combine: |a: &Entry, b: &Entry| Entry::new(a.key, a.counts.combine(&b.counts)),
		};

		let written = merge_k_way(spans, &scheduler, &dir.join("tmp"), 8, by_key, sink, Some(dedup)).unwrap();
		assert_eq!(written, 4); // 1, 2(merged x3), 3, 4

		let mut out_span = ImmutableSpan::<Entry>::new(out_file.clone(), out_path.clone(), scheduler, 0, written);
		let mut counts = Vec::new();
		while let Some(e) = out_span.next().unwrap() {
			counts.push((e.key.h[0], e.counts.count()));
		}
		assert_eq!(counts, vec![(1, 1), (2, 3), (3, 1), (4, 1)]);
		out_file.close();
		std::fs::remove_dir_all(&dir).ok();
	}
}
