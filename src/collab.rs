// Copyright (c) chess-pos-db-core contributors.
// Licensed under the Apache License, Version 2.0 or the MIT license, at your option.
// External-collaborator interfaces (spec.md §6). PGN parsing, chess move
// generation, and position hashing are explicitly out of scope for this
// crate (spec.md §1); what lives here is only the trait surface the core
// consumes, plus a small deterministic test double so pipeline.rs/db.rs
// have something runnable to drive in their own tests.

use crate::key::{GameLevel, GameResult, Key};

/// One game as handed to the core by an upstream PGN reader. The core only
/// consumes `result`, `ply_count`, and `moves`; everything else (date, eco,
/// event, white, black) is opaque payload forwarded to the header store.
pub trait PgnGame {
	fn result(&self) -> GameResult;
	fn ply_count(&self) -> Option<u32>;
	fn moves(&self) -> &[String];
	/// Opaque header payload, forwarded to the header store unexamined.
	fn header_payload(&self) -> &[u8];
}

/// One position reached by a game: its fully-packed key (board/side-to-move
/// hash plus reverse move, level, and result already folded in via
/// `Key::from_rm_parts`) and the byte offset of the game that reached it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExtractedPosition {
	pub key: Key,
	pub game_offset: u64,
}

/// The chess-state/position-hashing collaborator (spec.md §6: `Position`,
/// `ReverseMove`, `Key::from`, `san_to_move`). Given a game and the
/// game-level/result to bake into every key, walks every position the game
/// reaches (starting position included) and returns one `ExtractedPosition`
/// per ply plus one for the start.
pub trait PositionKeySource {
	fn extract(&self, game: &dyn PgnGame, level: GameLevel, game_offset: u64) -> crate::error::Result<Vec<ExtractedPosition>>;
}

/// The upstream PGN reader (spec.md §6): turns one file on disk into the
/// games it contains. A file-level parse failure becomes
/// `Error::ParseBackpressure` and the import proceeds with the next file
/// (spec.md §7); this crate does not implement PGN syntax itself.
pub trait PgnFileReader {
	fn read_games(&self, path: &std::path::Path) -> crate::error::Result<Vec<Box<dyn PgnGame>>>;
}

#[cfg(any(test, feature = "test-support"))]
pub mod test_support {
	use super::*;

	/// A minimal in-memory `PgnGame` for tests: no real PGN parsing, just
	/// the fields the core actually reads.
	pub struct FakeGame {
		pub result: GameResult,
		pub moves: Vec<String>,
	}

	impl FakeGame {
		pub fn new(result: GameResult, moves: &[&str]) -> FakeGame {
			FakeGame { result, moves: moves.iter().map(|m| m.to_string()).collect() }
		}
	}

	impl PgnGame for FakeGame {
		fn result(&self) -> GameResult {
			self.result
		}
		fn ply_count(&self) -> Option<u32> {
			Some(self.moves.len() as u32)
		}
		fn moves(&self) -> &[String] {
			&self.moves
		}
		fn header_payload(&self) -> &[u8] {
			&[]
		}
	}

	/// Deterministically hashes the sequence of SAN moves played so far
	/// into an opaque 3-lane board/side-to-move hash, standing in for a
	/// real chess engine's position hashing. Not collision-free — good
	/// enough to drive ingest/query tests without depending on one.
	fn fnv1a(bytes: &[u8], seed: u64) -> u64 {
		let mut hash = seed ^ 0xcbf29ce484222325;
		for &b in bytes {
			hash ^= b as u64;
			hash = hash.wrapping_mul(0x100000001b3);
		}
		hash
	}

	pub struct FakePositionSource;

	impl PositionKeySource for FakePositionSource {
		fn extract(&self, game: &dyn PgnGame, level: GameLevel, game_offset: u64) -> crate::error::Result<Vec<ExtractedPosition>> {
			let result = game.result();
			let mut out = Vec::with_capacity(game.moves().len() + 1);
			let mut board_hash: u64 = fnv1a(b"startpos", 0);
			let mut reverse_move: u32 = 0;
			let key_for = |board_hash: u64, reverse_move: u32| -> Key {
				let h0 = (board_hash >> 32) as u32;
				let h1 = board_hash as u32;
				let h2 = (board_hash.rotate_left(17)) as u32;
				Key::from_rm_parts(h0, h1, h2, reverse_move & ((1 << 27) - 1), level, result)
			};
			out.push(ExtractedPosition { key: key_for(board_hash, 0), game_offset });
			for (ply, mv) in game.moves().iter().enumerate() {
				board_hash = fnv1a(mv.as_bytes(), board_hash);
				reverse_move = fnv1a(mv.as_bytes(), ply as u64) as u32;
				out.push(ExtractedPosition { key: key_for(board_hash, reverse_move), game_offset });
			}
			Ok(out)
		}
	}

	/// Hands back a fixed, in-memory roster of games regardless of the path
	/// asked for — stands in for a real PGN reader in db.rs's own tests.
	pub struct FakePgnFileReader {
		pub games_per_file: Vec<FakeGame>,
	}

	impl PgnFileReader for FakePgnFileReader {
		fn read_games(&self, _path: &std::path::Path) -> crate::error::Result<Vec<Box<dyn PgnGame>>> {
			Ok(self
				.games_per_file
				.iter()
				.map(|g| Box::new(FakeGame { result: g.result, moves: g.moves.clone() }) as Box<dyn PgnGame>)
				.collect())
		}
	}

	#[test]
	fn extraction_is_deterministic_across_runs() {
		let game = FakeGame::new(GameResult::Draw, &["e4", "e5", "Nf3", "Nc6"]);
		let source = FakePositionSource;
		let a = source.extract(&game, GameLevel::Human, 0).unwrap();
		let b = source.extract(&game, GameLevel::Human, 0).unwrap();
		assert_eq!(a, b);
		assert_eq!(a.len(), 5); // start position plus 4 plies
	}
}
