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

//! Content address for cache keys.
//!
//! The digest doubles as the DB tier's bucket-selection hash: the first
//! four bytes, read in native byte order, are reused directly so the DB
//! never has to run its own hash function over the key.

use sha1::{Digest as _, Sha1};

pub const DIGEST_LEN: usize = 20;

pub type Digest = [u8; DIGEST_LEN];

/// SHA-1 of `key`.
pub fn digest(key: &[u8]) -> Digest {
	let mut hasher = Sha1::new();
	hasher.update(key);
	let out = hasher.finalize();
	let mut d = [0u8; DIGEST_LEN];
	d.copy_from_slice(&out);
	d
}

/// First four bytes of the digest, native-endian, used as the DB's bucket
/// hash. Bypasses the DB's own rehash since the input is already a uniform
/// cryptographic digest.
pub fn bucket_hash(d: &Digest) -> u32 {
	u32::from_ne_bytes([d[0], d[1], d[2], d[3]])
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn known_vector() {
		// echo -n "hello" | sha1sum
		let d = digest(b"hello");
		assert_eq!(hex::encode(d), "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d");
	}

	#[test]
	fn empty_key_is_not_required_to_be_supported() {
		// keys are documented as |k| >= 1, but the digest function itself
		// has no opinion on empty input.
		let d = digest(b"");
		assert_eq!(d.len(), DIGEST_LEN);
	}

	#[test]
	fn bucket_hash_reads_first_four_bytes_native_endian() {
		let d: Digest = [1, 2, 3, 4, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
		let h = bucket_hash(&d);
		assert_eq!(h, u32::from_ne_bytes([1, 2, 3, 4]));
	}
}
