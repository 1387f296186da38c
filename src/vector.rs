// Copyright (c) chess-pos-db-core contributors.
// Licensed under the Apache License, Version 2.0 or the MIT license, at your option.
// Double-buffered typed append sink over a pooled file (spec.md §4.3).
//
// `Vector<T>` accumulates records in an in-memory buffer and flushes it to
// disk asynchronously once full, so the caller filling the next buffer
// overlaps with the previous buffer's append job. `BackInserter<T>` is the
// push-only handle ingest/merge code actually holds. Grounded on the same
// prefetch/overlap idiom as span.rs, mirrored for writes.

use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::file::PooledFile;
use crate::scheduler::{IoScheduler, JobHandle, JobOutcome};
use crate::span::FixedSizeRecord;

const DEFAULT_BUFFER_ELEMS: usize = 4096;

/// An append-only, asynchronously-flushed sequence of fixed-size records.
pub struct Vector<T: FixedSizeRecord> {
	file: Arc<PooledFile>,
	path: PathBuf,
	scheduler: Arc<IoScheduler>,
	buffer_cap: usize,
	buffer: Vec<u8>,
	buffered_count: usize,
	in_flight: Option<JobHandle>,
	total_written: u64,
	_marker: std::marker::PhantomData<T>,
}

impl<T: FixedSizeRecord> Vector<T> {
	pub fn new(file: Arc<PooledFile>, path: PathBuf, scheduler: Arc<IoScheduler>) -> Result<Vector<T>> {
		Vector::with_buffer_elems(file, path, scheduler, DEFAULT_BUFFER_ELEMS)
	}

	pub fn with_buffer_elems(
		file: Arc<PooledFile>,
		path: PathBuf,
		scheduler: Arc<IoScheduler>,
		buffer_elems: usize,
	) -> Result<Vector<T>> {
		let total_written = file.size()? / T::SIZE as u64;
		Ok(Vector {
			file,
			path,
			scheduler,
			buffer_cap: buffer_elems.max(1),
			buffer: Vec::with_capacity(buffer_elems.max(1) * T::SIZE),
			buffered_count: 0,
			in_flight: None,
			total_written,
			_marker: std::marker::PhantomData,
		})
	}

	pub fn len(&self) -> u64 {
		self.total_written + self.buffered_count as u64
	}

	pub fn push(&mut self, record: &T) -> Result<()> {
		let mut slot = [0u8; 256];
		debug_assert!(T::SIZE <= slot.len());
		record.encode(&mut slot[..T::SIZE]);
		self.buffer.extend_from_slice(&slot[..T::SIZE]);
		self.buffered_count += 1;
		if self.buffered_count >= self.buffer_cap {
			self.flush_buffer()?;
		}
		Ok(())
	}

	fn flush_buffer(&mut self) -> Result<()> {
		if self.buffered_count == 0 {
			return Ok(());
		}
		self.await_in_flight()?;
		let count = self.buffered_count as u64;
		let payload = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.buffer_cap * T::SIZE));
		self.in_flight = Some(self.scheduler.submit_append(self.file.clone(), payload, T::SIZE, count, &self.path));
		self.total_written += count;
		self.buffered_count = 0;
		Ok(())
	}

	fn await_in_flight(&mut self) -> Result<()> {
		if let Some(handle) = self.in_flight.take() {
			match handle.wait()? {
				JobOutcome::Append { .. } => Ok(()),
				JobOutcome::Read { .. } => Err(Error::Corruption("vector append job returned a read outcome".into())),
			}
		} else {
			Ok(())
		}
	}

	/// Flushes any buffered records and waits for the last append to land.
	/// Per spec.md §9 (Open Question on `seal()`/in-flight appends), this
	/// only awaits this vector's own outstanding job, not siblings sharing
	/// the same underlying file.
	pub fn seal(mut self) -> Result<()> {
		self.flush_buffer()?;
		self.await_in_flight()?;
		self.file.flush()
	}
}

impl<T: FixedSizeRecord> Drop for Vector<T> {
	/// Best-effort flush on drop (spec.md §4.3): a caller that forgets to
	/// call `seal()` does not lose already-buffered records, but a flush
	/// failure here has nowhere to go and is swallowed.
	fn drop(&mut self) {
		let _ = self.flush_buffer();
		let _ = self.await_in_flight();
	}
}

/// A push-only handle to a `Vector<T>`, matching the teacher's
/// back-inserter-style sink used by the merge/pipeline stages.
pub struct BackInserter<T: FixedSizeRecord> {
	vector: Vector<T>,
}

impl<T: FixedSizeRecord> BackInserter<T> {
	pub fn new(vector: Vector<T>) -> BackInserter<T> {
		BackInserter { vector }
	}

	pub fn push(&mut self, record: &T) -> Result<()> {
		self.vector.push(record)
	}

	pub fn len(&self) -> u64 {
		self.vector.len()
	}

	pub fn seal(self) -> Result<()> {
		self.vector.seal()
	}
}
