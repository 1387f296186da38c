// Copyright (c) chess-pos-db-core contributors.
// Licensed under the Apache License, Version 2.0 or the MIT license, at your option.
// Small formatting helpers shared by the log targets across this crate.

pub fn hex(data: &[u8]) -> String {
	hex::encode(data)
}
