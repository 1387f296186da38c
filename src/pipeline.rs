// Copyright (c) chess-pos-db-core contributors.
// Licensed under the Apache License, Version 2.0 or the MIT license, at your option.
// Bounded three-stage ingest pipeline: parse (caller-controlled) -> sort ->
// write (spec.md §4.8). A pool of reusable entry buffers of capacity `C`
// bounds memory; workers hand buffers down the pipeline via
// `crossbeam::channel`s and the channel's own disconnect propagation
// drives shutdown, the same worker-loop-per-stage shape `scheduler.rs`
// uses for its job queues.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::channel::{self, Receiver, Sender};

use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::partition::Partition;

/// A fixed-size pool of reusable entry buffers. `acquire` blocks until one
/// is returned if the pool is momentarily exhausted (spec.md §5: "pipeline
/// buffer acquisition ... waits on a condvar when the buffer queue is
/// empty" — modelled here with a bounded channel instead of an explicit
/// condvar, for the same blocking behaviour).
pub struct BufferPool {
	capacity: usize,
	tx: Sender<Vec<Entry>>,
	rx: Receiver<Vec<Entry>>,
}

impl BufferPool {
	pub fn new(num_buffers: usize, capacity: usize) -> Arc<BufferPool> {
		let (tx, rx) = channel::bounded(num_buffers.max(1));
		for _ in 0..num_buffers.max(1) {
			tx.send(Vec::with_capacity(capacity)).expect("freshly created buffer pool channel is never full");
		}
		Arc::new(BufferPool { capacity, tx, rx })
	}

	pub fn acquire(&self) -> Vec<Entry> {
		self.rx.recv().expect("buffer pool outlives every borrower")
	}

	pub fn release(&self, mut buffer: Vec<Entry>) {
		buffer.clear();
		// The channel is sized to the pool, so this never blocks; a full
		// channel here would mean a buffer was returned twice.
		let _ = self.tx.send(buffer);
	}

	pub fn capacity(&self) -> usize {
		self.capacity
	}
}

struct SortJob {
	entries: Vec<Entry>,
	forced_id: Option<u32>,
}

struct WriteJob {
	entries: Vec<Entry>,
	forced_id: Option<u32>,
}

fn cmp_full_then_offset(a: &Entry, b: &Entry) -> std::cmp::Ordering {
	a.key.cmp_full(&b.key).then_with(|| {
		let oa = a.counts.first_game_offset().unwrap_or(u64::MAX);
		let ob = b.counts.first_game_offset().unwrap_or(u64::MAX);
		oa.cmp(&ob)
	})
}

/// Runs the sort and write stages as background threads; `submit_unordered`
/// is the only entry point the parse stage (caller-owned worker threads)
/// needs. Dropping the pipeline's sender side (via `wait_for_completion`)
/// is what unwinds the whole pipeline: sort workers drain and exit when
/// the sort channel disconnects, which drops their write-stage senders,
/// which lets the write worker drain and exit in turn.
pub struct Pipeline {
	partition: Arc<Partition>,
	buffer_pool: Arc<BufferPool>,
	sort_tx: Option<Sender<SortJob>>,
	sort_handles: Vec<std::thread::JoinHandle<()>>,
	write_handle: Option<std::thread::JoinHandle<()>>,
	errors: Arc<AtomicU64>,
	segments_written: Arc<AtomicU64>,
}

impl Pipeline {
	pub fn new(partition: Arc<Partition>, buffer_pool: Arc<BufferPool>, num_sort_workers: usize) -> Pipeline {
		let (sort_tx, sort_rx) = channel::unbounded::<SortJob>();
		let (write_tx, write_rx) = channel::unbounded::<WriteJob>();
		let errors = Arc::new(AtomicU64::new(0));
		let segments_written = Arc::new(AtomicU64::new(0));

		let mut sort_handles = Vec::with_capacity(num_sort_workers.max(1));
		for i in 0..num_sort_workers.max(1) {
			let sort_rx = sort_rx.clone();
			let write_tx = write_tx.clone();
			sort_handles.push(
				std::thread::Builder::new()
					.name(format!("pipeline-sort-{}", i))
					.spawn(move || {
						while let Ok(job) = sort_rx.recv() {
							let mut entries = job.entries;
							entries.sort_by(cmp_full_then_offset);
							if write_tx.send(WriteJob { entries, forced_id: job.forced_id }).is_err() {
								break;
							}
						}
					})
					.expect("failed to spawn pipeline sort worker"),
			);
		}
		// Drop this constructor's own write_tx so the channel closes once
		// every sort worker's clone is dropped, not before.
		drop(write_tx);

		let write_handle = {
			let partition = partition.clone();
			let buffer_pool = buffer_pool.clone();
			let errors = errors.clone();
			let segments_written = segments_written.clone();
			std::thread::Builder::new()
				.name("pipeline-write".to_string())
				.spawn(move || {
					while let Ok(job) = write_rx.recv() {
						let capacity = buffer_pool.capacity();
						match partition.finish_sorted_dedup_write(job.entries, job.forced_id) {
							Ok(_) => {
								segments_written.fetch_add(1, Ordering::Relaxed);
							}
							Err(e) => {
								log::error!(target: "chess-pos-db", "pipeline write stage failed: {}", e);
								errors.fetch_add(1, Ordering::Relaxed);
							}
						}
						buffer_pool.release(Vec::with_capacity(capacity));
					}
				})
				.expect("failed to spawn pipeline write worker")
		};

		Pipeline {
			partition,
			buffer_pool,
			sort_tx: Some(sort_tx),
			sort_handles,
			write_handle: Some(write_handle),
			errors,
			segments_written,
		}
	}

	pub fn buffer_pool(&self) -> &Arc<BufferPool> {
		&self.buffer_pool
	}

	/// Hands a filled buffer to the sort stage. `forced_id` pins the
	/// resulting segment's id (spec.md §4.8 parallel-ingest block
	/// division); `None` lets the partition allocate the next free id.
	pub fn submit_unordered(&self, entries: Vec<Entry>, forced_id: Option<u32>) -> Result<()> {
		match &self.sort_tx {
			Some(tx) => tx.send(SortJob { entries, forced_id }).map_err(|_| Error::PipelineShutdown),
			None => Err(Error::PipelineShutdown),
		}
	}

	pub fn errors(&self) -> u64 {
		self.errors.load(Ordering::Relaxed)
	}

	pub fn segments_written(&self) -> u64 {
		self.segments_written.load(Ordering::Relaxed)
	}

	/// Closes the sort stage's input, letting the disconnect cascade drain
	/// every stage in order, then joins every worker thread and awaits the
	/// partition's own pending future-file writes.
	pub fn wait_for_completion(mut self) -> Result<()> {
		self.sort_tx.take();
		for handle in self.sort_handles.drain(..) {
			let _ = handle.join();
		}
		if let Some(handle) = self.write_handle.take() {
			let _ = handle.join();
		}
		self.partition.collect_future_files()
	}
}

/// Divides a PGN byte range of size `total_bytes` into `n_threads` roughly
/// equal parse blocks, each pre-assigned a forced starting segment id so
/// parallel parse workers cannot race on id allocation (spec.md §4.8).
/// `offset` advances conservatively: a block of `block_size` bytes can
/// produce at most one segment per full buffer of `buffer_capacity`
/// entries, and a buffer can hold at most `buffer_capacity /
/// min_pgn_bytes_per_move` entries once `min_pgn_bytes_per_move` bytes of
/// PGN are assumed per half-move.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParseBlock {
	pub start_byte: u64,
	pub end_byte: u64,
	pub forced_first_id: u32,
}

pub fn divide_for_parallel_ingest(
	total_bytes: u64,
	n_threads: usize,
	buffer_capacity: u64,
	min_pgn_bytes_per_move: u64,
	base_next_id: u32,
) -> Vec<ParseBlock> {
	let n_threads = n_threads.max(1) as u64;
	let block_size = (total_bytes + n_threads - 1) / n_threads;
	let min_pgn_bytes_per_move = min_pgn_bytes_per_move.max(1);

	let mut blocks = Vec::with_capacity(n_threads as usize);
	let mut offset = 0u32;
	for i in 0..n_threads {
		let start_byte = i * block_size;
		if start_byte >= total_bytes {
			break;
		}
		let end_byte = (start_byte + block_size).min(total_bytes);
		let this_block_bytes = end_byte - start_byte;
		blocks.push(ParseBlock { start_byte, end_byte, forced_first_id: base_next_id.wrapping_add(offset) });
		let max_entries_per_buffer = buffer_capacity.max(1) * min_pgn_bytes_per_move;
		let ids_for_this_block = (this_block_bytes / max_entries_per_buffer) as u32 + 1;
		offset = offset.wrapping_add(ids_for_this_block);
	}
	blocks
}
