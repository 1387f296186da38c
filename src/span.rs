// Copyright (c) chess-pos-db-core contributors.
// Licensed under the Apache License, Version 2.0 or the MIT license, at your option.
// Double-buffered typed sequential reader over a pooled file (spec.md §4.3).
//
// `ImmutableSpan<T>` walks a fixed, already-written range of a file
// front-to-back, prefetching the next window on a background job while the
// caller consumes the current one. Grounded on the prefetching-iterator
// shape of `qouteall-MiscAlgoRs`'s merge_sort reader loop, adapted to route
// its I/O through `scheduler::IoScheduler` rather than a raw `Read`.

use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::file::PooledFile;
use crate::scheduler::{IoScheduler, JobHandle, JobOutcome};

/// Encodes/decodes a fixed-size record of type `Self` to/from a byte buffer.
pub trait FixedSizeRecord: Sized + Copy {
	const SIZE: usize;
	fn encode(&self, out: &mut [u8]);
	fn decode(buf: &[u8]) -> Self;
}

impl FixedSizeRecord for crate::entry::Entry {
	const SIZE: usize = crate::entry::ENTRY_SIZE;
	fn encode(&self, out: &mut [u8]) {
		out.copy_from_slice(&self.to_bytes());
	}
	fn decode(buf: &[u8]) -> Self {
		crate::entry::Entry::from_bytes(buf)
	}
}

const DEFAULT_WINDOW_BYTES: usize = 32 * 1024;

/// A read-only, forward-only view over `[low, high)` records of type `T`
/// stored contiguously in a file, double-buffered so decoding one window
/// overlaps with prefetching the next.
pub struct ImmutableSpan<T: FixedSizeRecord> {
	file: Arc<PooledFile>,
	path: PathBuf,
	scheduler: Arc<IoScheduler>,
	low: u64,
	high: u64,
	cursor: u64,
	window_elems: u64,
	current: Vec<u8>,
	current_pos: usize,
	current_len: usize,
	prefetch: Option<JobHandle>,
	_marker: PhantomData<T>,
}

impl<T: FixedSizeRecord> ImmutableSpan<T> {
	pub fn new(file: Arc<PooledFile>, path: PathBuf, scheduler: Arc<IoScheduler>, low: u64, high: u64) -> ImmutableSpan<T> {
		let window_elems = (DEFAULT_WINDOW_BYTES / T::SIZE).max(1) as u64;
		ImmutableSpan {
			file,
			path,
			scheduler,
			low,
			high,
			cursor: low,
			window_elems,
			current: Vec::new(),
			current_pos: 0,
			current_len: 0,
			prefetch: None,
			_marker: PhantomData,
		}
	}

	pub fn len(&self) -> u64 {
		self.high - self.low
	}

	pub fn is_empty(&self) -> bool {
		self.low >= self.high
	}

	fn remaining_in_buffer(&self) -> bool {
		self.current_pos < self.current_len
	}

	fn issue_read(&self, start: u64) -> JobHandle {
		let count = self.window_elems.min(self.high - start);
		self.scheduler.submit_read(self.file.clone(), start * T::SIZE as u64, T::SIZE, count, &self.path)
	}

	fn fill_next(&mut self) -> Result<()> {
		if self.cursor >= self.high {
			self.current_len = 0;
			self.current_pos = 0;
			return Ok(());
		}
		let handle = self.prefetch.take().unwrap_or_else(|| self.issue_read(self.cursor));
		match handle.wait()? {
			JobOutcome::Read { transferred, data } => {
				self.current = data;
				self.current_len = transferred as usize;
				self.current_pos = 0;
				self.cursor += transferred;
				if self.cursor < self.high {
					self.prefetch = Some(self.issue_read(self.cursor));
				}
				Ok(())
			}
			JobOutcome::Append { .. } => Err(Error::Corruption("span read a job that returned an append outcome".into())),
		}
	}

	/// Blocks if the current window is exhausted and the prefetch for the
	/// next one has not completed yet (spec.md §5).
	pub fn next(&mut self) -> Result<Option<T>> {
		if !self.remaining_in_buffer() {
			self.fill_next()?;
			if !self.remaining_in_buffer() {
				return Ok(None);
			}
		}
		let offset = self.current_pos * T::SIZE;
		let record = T::decode(&self.current[offset..offset + T::SIZE]);
		self.current_pos += 1;
		Ok(Some(record))
	}
}
