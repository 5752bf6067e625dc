// Copyright 2015-2020 Parity Technologies (UK) Ltd.
// This file is part of Parity.

// Parity is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// Parity is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with Parity.  If not, see <http://www.gnu.org/licenses/>.

//! Diagnostic formatting. Not to be confused with `fs::digest_to_path`,
//! which encodes digests with the historical low-nibble-first ordering --
//! this is plain, conventional hex for log lines.

pub fn hex(bytes: &[u8]) -> String {
	hex::encode(bytes)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn encodes_conventional_high_nibble_first() {
		assert_eq!(hex(&[0xab, 0x01]), "ab01");
	}
}
