// Copyright (c) chess-pos-db-core contributors.
// Licensed under the Apache License, Version 2.0 or the MIT license, at your option.
// Pooled random-access file layer (spec.md §4.1).
//
// Two variants share the read/append/size/truncate contract: `UnpooledFile`
// holds its OS handle for its whole lifetime and is refused above a
// process-wide soft cap; `PooledFile` never holds a handle itself and asks
// the process-global `FilePool` for one on every operation. The pool is an
// LRU of open handles behind its own mutex, grounded on the
// `Mutex`/`RwLock`-guarded pool idiom in parity-db's own log-file pool
// (xcaptain-parity-db's fork of `log.rs`).

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::error::{Error, Result};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OpenMode {
	/// Open for random-access reads only; the file must already exist.
	Read,
	/// Open for reads and appends; create the file if absent.
	Append,
	/// Create the file, truncating any existing content to zero length.
	Truncate,
}

fn open_with_mode(path: &Path, mode: OpenMode) -> std::io::Result<File> {
	match mode {
		OpenMode::Read => std::fs::OpenOptions::new().read(true).open(path),
		OpenMode::Append => std::fs::OpenOptions::new().create(true).read(true).write(true).open(path),
		OpenMode::Truncate => std::fs::OpenOptions::new().create(true).read(true).write(true).truncate(true).open(path),
	}
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
	use std::os::unix::fs::FileExt;
	// Short reads at EOF are not an error here; the caller compares the
	// element count transferred against the element count requested.
	let mut total = 0;
	loop {
		match file.read_at(&mut buf[total..], offset + total as u64) {
			Ok(0) => break,
			Ok(n) => total += n,
			Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
			Err(e) => return Err(e),
		}
		if total == buf.len() {
			break;
		}
	}
	Ok(total)
}

#[cfg(unix)]
fn write_at(file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
	use std::os::unix::fs::FileExt;
	file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
	use std::os::windows::fs::FileExt;
	let mut total = 0;
	loop {
		match file.seek_read(&mut buf[total..], offset + total as u64) {
			Ok(0) => break,
			Ok(n) => total += n,
			Err(e) => return Err(e),
		}
		if total == buf.len() {
			break;
		}
	}
	Ok(total)
}

#[cfg(windows)]
fn write_at(file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
	use std::os::windows::fs::FileExt;
	file.seek_write(buf, offset)?;
	Ok(())
}

/// A file that holds its OS handle for its entire lifetime. Guarded by a
/// process-wide counter so unpooled files leave room for the pool.
pub struct UnpooledFile {
	path: PathBuf,
	file: Mutex<File>,
}

static UNPOOLED_COUNT: AtomicUsize = AtomicUsize::new(0);
static UNPOOLED_CAP: AtomicUsize = AtomicUsize::new(128);

pub fn set_unpooled_cap(cap: usize) {
	UNPOOLED_CAP.store(cap, Ordering::Relaxed);
}

impl UnpooledFile {
	pub fn open(path: impl Into<PathBuf>, mode: OpenMode) -> Result<UnpooledFile> {
		let path = path.into();
		let cap = UNPOOLED_CAP.load(Ordering::Relaxed);
		loop {
			let current = UNPOOLED_COUNT.load(Ordering::Relaxed);
			if current >= cap {
				return Err(Error::OpenFailure {
					path,
					source: std::io::Error::new(std::io::ErrorKind::Other, "unpooled file cap reached"),
				});
			}
			if UNPOOLED_COUNT.compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::Relaxed).is_ok() {
				break;
			}
		}
		let file = open_with_mode(&path, mode).map_err(|source| Error::OpenFailure { path: path.clone(), source })?;
		Ok(UnpooledFile { path, file: Mutex::new(file) })
	}

	pub fn size(&self) -> Result<u64> {
		Ok(self.file.lock().metadata()?.len())
	}

	pub fn read(&self, dst: &mut [u8], offset: u64, elem: usize, count: u64) -> Result<u64> {
		let file = self.file.lock();
		let n = read_at(&file, dst, offset)?;
		let elems = (n / elem.max(1)) as u64;
		if elems < count && n % elem.max(1) != 0 {
			return Err(Error::ShortRead { path: self.path.clone(), requested: count, actual: elems });
		}
		Ok(elems)
	}

	pub fn append(&self, src: &[u8], elem: usize, count: u64) -> Result<u64> {
		let file = self.file.lock();
		let offset = file.metadata()?.len();
		write_at(&file, src, offset).map_err(|source| Error::ShortAppend {
			path: self.path.clone(),
			requested: count,
			actual: 0,
		})?;
		let _ = elem;
		Ok(count)
	}

	pub fn flush(&self) -> Result<()> {
		Ok(self.file.lock().sync_data()?)
	}

	pub fn truncate(&self) -> Result<()> {
		self.file.lock().set_len(0).map_err(|source| Error::TruncateFailure { path: self.path.clone(), source })
	}
}

impl Drop for UnpooledFile {
	fn drop(&mut self) {
		UNPOOLED_COUNT.fetch_sub(1, Ordering::Relaxed);
	}
}

struct PooledFileState {
	file: Option<File>,
	mode: OpenMode,
	ever_opened: bool,
}

struct FilePoolInner {
	files: HashMap<PathBuf, Arc<Mutex<PooledFileState>>>,
	lru: VecDeque<PathBuf>,
	capacity: usize,
}

/// Process-global LRU of open file handles. Pooled files never hold a
/// handle themselves; every operation routes through here.
pub struct FilePool {
	inner: Mutex<FilePoolInner>,
}

impl FilePool {
	pub fn new(capacity: usize) -> FilePool {
		FilePool { inner: Mutex::new(FilePoolInner { files: HashMap::new(), lru: VecDeque::new(), capacity }) }
	}

	pub fn global() -> &'static FilePool {
		static POOL: OnceLock<FilePool> = OnceLock::new();
		POOL.get_or_init(|| FilePool::new(256))
	}

	/// Overrides the pool's capacity (spec.md §4.1's configurable cap `P`,
	/// wired from `Options::max_pooled_files` by `Database::open`). Takes
	/// effect immediately: if the new capacity is smaller than the current
	/// LRU length, the next `admit` evicts down to it one entry at a time
	/// as usual.
	pub fn set_capacity(&self, capacity: usize) {
		self.inner.lock().capacity = capacity;
	}

	fn state_for(&self, path: &Path, mode: OpenMode) -> Arc<Mutex<PooledFileState>> {
		let mut inner = self.inner.lock();
		if let Some(existing) = inner.files.get(path) {
			return existing.clone();
		}
		let arc = Arc::new(Mutex::new(PooledFileState { file: None, mode, ever_opened: false }));
		inner.files.insert(path.to_path_buf(), arc.clone());
		arc
	}

	fn touch_mru(&self, path: &Path) {
		let mut inner = self.inner.lock();
		if let Some(pos) = inner.lru.iter().position(|p| p == path) {
			inner.lru.remove(pos);
			inner.lru.push_back(path.to_path_buf());
		}
	}

	/// Evicts the LRU entry if the pool is at capacity and `path` is not
	/// already tracked as open, then records `path` as open.
	fn admit(&self, path: &Path) -> Result<()> {
		let evicted = {
			let mut inner = self.inner.lock();
			if inner.lru.iter().any(|p| p == path) {
				return Ok(());
			}
			let evicted = if inner.lru.len() >= inner.capacity { inner.lru.pop_front() } else { None };
			inner.lru.push_back(path.to_path_buf());
			evicted
		};
		if let Some(evicted_path) = evicted {
			let arc = self.state_for(&evicted_path, OpenMode::Append);
			let mut state = arc.lock();
			state.file = None;
		}
		Ok(())
	}

	fn with_open<R>(&self, path: &Path, mode: OpenMode, f: impl FnOnce(&mut File) -> Result<R>) -> Result<R> {
		let arc = self.state_for(path, mode);
		let mut state = arc.lock();
		if state.file.is_some() {
			drop(state);
			self.touch_mru(path);
			state = arc.lock();
		}
		if state.file.is_none() {
			// Either never opened, or evicted by a concurrent `admit` in the
			// window between the `drop`/`touch_mru` above and re-locking
			// here — re-check rather than assume the lock above settled it.
			self.admit(path)?;
			// Reopening an evicted file is always done in append mode, even
			// if it was originally opened to truncate, so data already
			// written is not lost a second time.
			let effective_mode = if state.ever_opened { OpenMode::Append } else { mode };
			let file =
				open_with_mode(path, effective_mode).map_err(|source| Error::OpenFailure { path: path.to_path_buf(), source })?;
			state.file = Some(file);
			state.mode = effective_mode;
			state.ever_opened = true;
		}
		f(state.file.as_mut().unwrap())
	}

	pub fn close(&self, path: &Path) {
		let mut inner = self.inner.lock();
		if let Some(pos) = inner.lru.iter().position(|p| p == path) {
			inner.lru.remove(pos);
		}
		inner.files.remove(path);
	}
}

/// A file accessed through the process-global `FilePool`; holds no OS
/// handle of its own.
pub struct PooledFile {
	path: PathBuf,
	pool: &'static FilePool,
}

impl PooledFile {
	pub fn open(path: impl Into<PathBuf>, mode: OpenMode) -> Result<PooledFile> {
		let path = path.into();
		let pool = FilePool::global();
		// Touch once so a later read/append against an empty file does not
		// have to distinguish "never opened" from "opened, currently empty".
		pool.with_open(&path, mode, |_| Ok(()))?;
		Ok(PooledFile { path, pool })
	}

	pub fn size(&self) -> Result<u64> {
		self.pool.with_open(&self.path, OpenMode::Append, |f| Ok(f.metadata()?.len()))
	}

	pub fn read(&self, dst: &mut [u8], offset: u64, elem: usize, count: u64) -> Result<u64> {
		let path = self.path.clone();
		self.pool.with_open(&self.path, OpenMode::Append, |f| {
			let n = read_at(f, dst, offset)?;
			let elems = (n / elem.max(1)) as u64;
			if elems < count && n % elem.max(1) != 0 {
				return Err(Error::ShortRead { path: path.clone(), requested: count, actual: elems });
			}
			Ok(elems)
		})
	}

	pub fn append(&self, src: &[u8], elem: usize, count: u64) -> Result<u64> {
		let path = self.path.clone();
		self.pool.with_open(&self.path, OpenMode::Append, move |f| {
			let offset = f.metadata()?.len();
			write_at(f, src, offset).map_err(|_| Error::ShortAppend { path: path.clone(), requested: count, actual: 0 })?;
			let _ = elem;
			Ok(count)
		})
	}

	pub fn flush(&self) -> Result<()> {
		self.pool.with_open(&self.path, OpenMode::Append, |f| Ok(f.sync_data()?))
	}

	/// Bypasses the pool's LRU position: truncates the native handle
	/// directly and marks it for reopening in append mode (spec.md §9, Open
	/// Question on `truncate`/pool position).
	pub fn truncate(&self) -> Result<()> {
		let path = self.path.clone();
		self.pool.with_open(&self.path, OpenMode::Truncate, move |f| {
			f.set_len(0).map_err(|source| Error::TruncateFailure { path: path.clone(), source })?;
			f.seek(SeekFrom::Start(0))?;
			Ok(())
		})
	}

	pub fn close(&self) {
		self.pool.close(&self.path);
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use std::io::Write as _;

	fn temp_path(name: &str) -> PathBuf {
		let mut p = std::env::temp_dir();
		p.push("chess-pos-db-test");
		std::fs::create_dir_all(&p).unwrap();
		p.push(format!("file_{}_{}", name, std::process::id()));
		p
	}

	#[test]
	fn pooled_roundtrip() {
		let path = temp_path("pooled_roundtrip");
		let _ = std::fs::remove_file(&path);
		let f = PooledFile::open(&path, OpenMode::Truncate).unwrap();
		let written = f.append(&[1, 2, 3, 4], 1, 4).unwrap();
		assert_eq!(written, 4);
		let mut buf = [0u8; 4];
		let read = f.read(&mut buf, 0, 1, 4).unwrap();
		assert_eq!(read, 4);
		assert_eq!(buf, [1, 2, 3, 4]);
		f.close();
		std::fs::remove_file(&path).unwrap();
	}

	#[test]
	fn pool_eviction_reopens_in_append_mode() {
		let pool = FilePool::new(1);
		let p1 = temp_path("evict_a");
		let p2 = temp_path("evict_b");
		for p in [&p1, &p2] {
			let _ = std::fs::remove_file(p);
		}
		pool.with_open(&p1, OpenMode::Truncate, |f| {
			f.write_all(b"hello").unwrap();
			Ok(())
		})
		.unwrap();
		// Opening p2 evicts p1's handle from the pool (capacity 1).
		pool.with_open(&p2, OpenMode::Truncate, |_| Ok(())).unwrap();
		// Re-accessing p1 reopens it; its previously-written bytes survive
		// because reopen forces append mode rather than truncate.
		let len = pool.with_open(&p1, OpenMode::Truncate, |f| Ok(f.metadata()?.len())).unwrap();
		assert_eq!(len, 5);
		for p in [&p1, &p2] {
			let _ = std::fs::remove_file(p);
		}
	}
}
