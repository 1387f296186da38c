// Copyright (c) chess-pos-db-core contributors.
// Licensed under the Apache License, Version 2.0 or the MIT license, at your option.
// The game-header store (spec.md §1: "a simple append-only (offset, bytes)
// log — specified only by the operations the core consumes"). Out of scope
// as a real implementation; `HeaderStore` is the trait the facade (db.rs)
// consumes, and `FlatHeaderStore` is a minimal reference implementation so
// ingest/query can be exercised end to end in this crate's own tests.

use std::convert::TryInto;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::file::{OpenMode, PooledFile};

/// One stored game header: the opaque payload handed to `add`, and the
/// sequential game offset it was stored under.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PackedGameHeader {
	pub offset: u64,
	pub bytes: Vec<u8>,
}

/// The external header-store collaborator (spec.md §6): appends opaque
/// per-game payloads and answers batched lookups by the sequential offset
/// `Entry::counts`'s `first_game_offset` refers to.
pub trait HeaderStore {
	fn add(&self, plies: Option<u32>, payload: &[u8]) -> Result<u64>;
	fn query_by_offsets(&self, offsets: &[u64]) -> Result<Vec<Option<PackedGameHeader>>>;
	fn clear(&self) -> Result<()>;
	fn flush(&self) -> Result<()>;
	fn replicate(&self, dst: &Path) -> Result<()>;
}

/// `add`'s payload is length-prefixed and appended to `header`; the byte
/// offset it landed at is appended to `index` (one `u64` per game, so game
/// offset `i` is a direct index into that file). `plies` rides along as a
/// 4-byte field ahead of the payload purely so a reader can skip a record
/// without decoding it, matching the "(offset, bytes)" shape spec.md names.
pub struct FlatHeaderStore {
	dir: PathBuf,
	header_file: Arc<PooledFile>,
	index_file: Arc<PooledFile>,
	next_offset: Mutex<u64>,
}

const INDEX_ENTRY_SIZE: usize = 8;

impl FlatHeaderStore {
	pub fn open(dir: impl Into<PathBuf>) -> Result<FlatHeaderStore> {
		let dir = dir.into();
		std::fs::create_dir_all(&dir)?;
		let header_file = Arc::new(PooledFile::open(dir.join("header"), OpenMode::Append)?);
		let index_file = Arc::new(PooledFile::open(dir.join("index"), OpenMode::Append)?);
		let next_offset = index_file.size()? / INDEX_ENTRY_SIZE as u64;
		Ok(FlatHeaderStore { dir, header_file, index_file, next_offset: Mutex::new(next_offset) })
	}

	fn byte_offset_for(&self, game_offset: u64) -> Result<Option<u64>> {
		let mut buf = [0u8; INDEX_ENTRY_SIZE];
		let got = self.index_file.read(&mut buf, game_offset * INDEX_ENTRY_SIZE as u64, INDEX_ENTRY_SIZE, 1)?;
		if got == 0 {
			return Ok(None);
		}
		Ok(Some(u64::from_le_bytes(buf)))
	}

	fn read_record_at(&self, byte_offset: u64) -> Result<Vec<u8>> {
		let mut len_buf = [0u8; 4];
		self.header_file.read(&mut len_buf, byte_offset, 4, 1)?;
		let len = u32::from_le_bytes(len_buf) as usize;
		let mut payload = vec![0u8; len];
		if len > 0 {
			self.header_file.read(&mut payload, byte_offset + 8, 1, len as u64)?;
		}
		Ok(payload)
	}
}

impl HeaderStore for FlatHeaderStore {
	fn add(&self, plies: Option<u32>, payload: &[u8]) -> Result<u64> {
		let mut next = self.next_offset.lock();
		let byte_offset = self.header_file.size()?;

		let mut record = Vec::with_capacity(8 + payload.len());
		record.extend_from_slice(&(payload.len() as u32).to_le_bytes());
		record.extend_from_slice(&plies.unwrap_or(0).to_le_bytes());
		record.extend_from_slice(payload);
		self.header_file.append(&record, 1, record.len() as u64)?;

		self.index_file.append(&byte_offset.to_le_bytes(), INDEX_ENTRY_SIZE, 1)?;

		let game_offset = *next;
		*next += 1;
		Ok(game_offset)
	}

	fn query_by_offsets(&self, offsets: &[u64]) -> Result<Vec<Option<PackedGameHeader>>> {
		let mut out = Vec::with_capacity(offsets.len());
		for &offset in offsets {
			match self.byte_offset_for(offset)? {
				Some(byte_offset) => {
					let bytes = self.read_record_at(byte_offset)?;
					out.push(Some(PackedGameHeader { offset, bytes }));
				}
				None => out.push(None),
			}
		}
		Ok(out)
	}

	fn clear(&self) -> Result<()> {
		self.header_file.truncate()?;
		self.index_file.truncate()?;
		*self.next_offset.lock() = 0;
		Ok(())
	}

	fn flush(&self) -> Result<()> {
		self.header_file.flush()?;
		self.index_file.flush()
	}

	fn replicate(&self, dst: &Path) -> Result<()> {
		self.flush()?;
		std::fs::create_dir_all(dst)?;
		std::fs::copy(self.dir.join("header"), dst.join("header"))?;
		std::fs::copy(self.dir.join("index"), dst.join("index"))?;
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use super::*;

	fn temp_dir(name: &str) -> PathBuf {
		let mut p = std::env::temp_dir();
		p.push("chess-pos-db-test");
		p.push(format!("header_{}_{}", name, std::process::id()));
		let _ = std::fs::remove_dir_all(&p);
		std::fs::create_dir_all(&p).unwrap();
		p
	}

	#[test]
	fn add_then_query_round_trips_payloads_in_order() {
		let dir = temp_dir("roundtrip");
		let store = FlatHeaderStore::open(&dir).unwrap();

		let a = store.add(Some(4), b"game-a").unwrap();
		let b = store.add(Some(12), b"game-b-longer").unwrap();
		assert_eq!(a, 0);
		assert_eq!(b, 1);

		let results = store.query_by_offsets(&[b, a]).unwrap();
		assert_eq!(results[0].as_ref().unwrap().bytes, b"game-b-longer");
		assert_eq!(results[1].as_ref().unwrap().bytes, b"game-a");
	}

	#[test]
	fn query_for_unknown_offset_is_none() {
		let dir = temp_dir("missing");
		let store = FlatHeaderStore::open(&dir).unwrap();
		store.add(None, b"only-game").unwrap();
		let results = store.query_by_offsets(&[5]).unwrap();
		assert_eq!(results, vec![None]);
	}

	#[test]
	fn clear_resets_the_log() {
		let dir = temp_dir("clear");
		let store = FlatHeaderStore::open(&dir).unwrap();
		store.add(None, b"will-be-cleared").unwrap();
		store.clear().unwrap();
		let next = store.add(None, b"first-again").unwrap();
		assert_eq!(next, 0);
	}
}
