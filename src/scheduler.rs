// Copyright (c) chess-pos-db-core contributors.
// Licensed under the Apache License, Version 2.0 or the MIT license, at your option.
// Per-volume I/O thread pools (spec.md §4.2).
//
// A small static routing table maps path prefixes to a pool id; each pool
// is a FIFO job queue served by `T` worker threads. Grounded on
// `bonujel-PNA-Rust-Project/src/thread_pool/shared_queue.rs`: one
// `crossbeam::channel` per pool, one worker loop per thread, panics caught
// so a single bad job can't take the pool down.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crossbeam::channel::{self, Receiver, Sender};

use crate::error::Result;
use crate::file::PooledFile;

pub enum JobKind {
	Read { dst: Vec<u8>, offset: u64, elem: usize, count: u64 },
	Append { src: Vec<u8>, elem: usize, count: u64 },
}

struct Job {
	file: Arc<PooledFile>,
	kind: JobKind,
	reply: Sender<Result<JobOutcome>>,
}

pub enum JobOutcome {
	Read { transferred: u64, data: Vec<u8> },
	Append { transferred: u64 },
}

/// A handle to a job's eventual result. `wait()` is the suspension point
/// spec.md §5 calls out: "Operations that may block the calling thread ...
/// reading from a depleted sequential iterator (waits for the prefetch)".
pub struct JobHandle {
	rx: Receiver<Result<JobOutcome>>,
}

impl JobHandle {
	pub fn wait(self) -> Result<JobOutcome> {
		self.rx.recv().expect("worker dropped the reply channel without a panic bubbling up")
	}
}

struct Pool {
	tx: Sender<Job>,
}

impl Pool {
	fn new(threads: usize) -> Pool {
		let (tx, rx) = channel::unbounded::<Job>();
		for id in 0..threads.max(1) {
			let rx = rx.clone();
			spawn_worker(id, rx);
		}
		Pool { tx }
	}

	fn submit(&self, job: Job) {
		// Jobs submitted to the same pool are dequeued FIFO by the queue,
		// but concurrent workers give no cross-job ordering guarantee
		// beyond that (spec.md §5) — callers that need ordering sequence
		// their `wait()`s themselves.
		self.tx.send(job).expect("volume pool has no active workers");
	}
}

fn spawn_worker(id: usize, rx: Receiver<Job>) {
	std::thread::Builder::new()
		.name(format!("io-worker-{}", id))
		.spawn(move || {
			while let Ok(job) = rx.recv() {
				let Job { file, kind, reply } = job;
				let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| run_job(&file, kind)))
					.unwrap_or_else(|_| Err(crate::error::Error::Corruption("io worker panicked".into())));
				let _ = reply.send(outcome);
			}
		})
		.expect("failed to spawn io worker thread");
}

fn run_job(file: &PooledFile, kind: JobKind) -> Result<JobOutcome> {
	match kind {
		JobKind::Read { mut dst, offset, elem, count } => {
			let transferred = file.read(&mut dst, offset, elem, count)?;
			Ok(JobOutcome::Read { transferred, data: dst })
		}
		JobKind::Append { src, elem, count } => {
			let transferred = file.append(&src, elem, count)?;
			Ok(JobOutcome::Append { transferred })
		}
	}
}

/// Routes paths to per-volume thread pools by longest matching prefix,
/// falling back to a shared pool for anything unmapped.
pub struct IoScheduler {
	prefixes: Vec<(PathBuf, usize)>,
	pools: Vec<Pool>,
	fallback: Pool,
}

impl IoScheduler {
	pub fn new(volume_map: &[(PathBuf, u32)], threads_per_volume: usize) -> IoScheduler {
		let mut pool_ids: HashMap<u32, usize> = HashMap::new();
		let mut pools = Vec::new();
		let mut prefixes = Vec::new();
		for (prefix, pool_id) in volume_map {
			let idx = *pool_ids.entry(*pool_id).or_insert_with(|| {
				pools.push(Pool::new(threads_per_volume));
				pools.len() - 1
			});
			prefixes.push((prefix.clone(), idx));
		}
		// Longest prefix wins on a tie in insertion order.
		prefixes.sort_by(|a, b| b.0.as_os_str().len().cmp(&a.0.as_os_str().len()));
		IoScheduler { prefixes, pools, fallback: Pool::new(threads_per_volume) }
	}

	fn pool_for(&self, path: &Path) -> &Pool {
		for (prefix, idx) in &self.prefixes {
			if path.starts_with(prefix) {
				return &self.pools[*idx];
			}
		}
		&self.fallback
	}

	pub fn submit_read(&self, file: Arc<PooledFile>, offset: u64, elem: usize, count: u64, path_hint: &Path) -> JobHandle {
		let (tx, rx) = channel::bounded(1);
		let dst = vec![0u8; (elem as u64 * count) as usize];
		self.pool_for(path_hint).submit(Job { file, kind: JobKind::Read { dst, offset, elem, count }, reply: tx });
		JobHandle { rx }
	}

	pub fn submit_append(&self, file: Arc<PooledFile>, src: Vec<u8>, elem: usize, count: u64, path_hint: &Path) -> JobHandle {
		let (tx, rx) = channel::bounded(1);
		self.pool_for(path_hint).submit(Job { file, kind: JobKind::Append { src, elem, count }, reply: tx });
		JobHandle { rx }
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::file::OpenMode;

	fn temp_path(name: &str) -> PathBuf {
		let mut p = std::env::temp_dir();
		p.push("chess-pos-db-test");
		std::fs::create_dir_all(&p).unwrap();
		p.push(format!("sched_{}_{}", name, std::process::id()));
		p
	}

	#[test]
	fn append_then_read_round_trips_through_the_scheduler() {
		let path = temp_path("roundtrip");
		let _ = std::fs::remove_file(&path);
		let file = Arc::new(PooledFile::open(&path, OpenMode::Truncate).unwrap());
		let scheduler = IoScheduler::new(&[], 2);

		let handle = scheduler.submit_append(file.clone(), vec![9, 8, 7], 1, 3, &path);
		match handle.wait().unwrap() {
			JobOutcome::Append { transferred } => assert_eq!(transferred, 3),
			_ => panic!("expected append outcome"),
		}

		let handle = scheduler.submit_read(file.clone(), 0, 1, 3, &path);
		match handle.wait().unwrap() {
			JobOutcome::Read { transferred, data } => {
				assert_eq!(transferred, 3);
				assert_eq!(&data[0..3], &[9, 8, 7]);
			}
			_ => panic!("expected read outcome"),
		}
		file.close();
		std::fs::remove_file(&path).unwrap();
	}
}
