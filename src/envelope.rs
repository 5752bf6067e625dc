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

// On-disk envelope, identical in both the DB and FS tiers:
//
// [FLAGS: 2][MTIME: 2][ATIME: 2][PAD: 2][PAYLOAD: ...]
// FLAGS  - bit 0: legacy codec A (Snappy), bit 1: codec B (Zstd).
//          At most one bit set; both clear means payload is the value
//          verbatim.
// MTIME  - day-index at write, DB tier only (FS tier leaves this zero and
//          relies on the file's own inode mtime, see fs.rs).
// ATIME  - day-index at last read, DB tier only, lazily updated.
// PAD    - zero on write.

use std::fmt;
use std::ops::Deref;

pub const HEADER_LEN: usize = 8;
pub const MAX_DB_VALUE_SIZE: usize = 32 * 1024;

/// Values shorter than this are documented as incompressible in the
/// historical codec and skip compression unconditionally.
pub const TINY_THRESHOLD: usize = 18;

pub const FLAG_COMPRESSED_A: u16 = 1 << 0;
pub const FLAG_COMPRESSED_B: u16 = 1 << 1;
const KNOWN_FLAGS: u16 = FLAG_COMPRESSED_A | FLAG_COMPRESSED_B;

const ZSTD_LEVEL: i32 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compression {
	Verbatim,
	/// Recognized so a reader can tell a legacy entry is stale; never
	/// produced by `wrap` and never decoded by `unwrap`.
	CodecALegacy,
	CodecB,
}

impl Compression {
	fn from_flags(flags: u16) -> Option<Compression> {
		match flags & KNOWN_FLAGS {
			0 => Some(Compression::Verbatim),
			FLAG_COMPRESSED_A => Some(Compression::CodecALegacy),
			FLAG_COMPRESSED_B => Some(Compression::CodecB),
			_ => None, // both bits set is not a valid envelope
		}
	}

	fn flag_bits(self) -> u16 {
		match self {
			Compression::Verbatim => 0,
			Compression::CodecALegacy => FLAG_COMPRESSED_A,
			Compression::CodecB => FLAG_COMPRESSED_B,
		}
	}
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Header {
	pub flags: u16,
	pub mtime: u16,
	pub atime: u16,
}

impl Header {
	pub fn parse(bytes: &[u8]) -> Option<Header> {
		if bytes.len() < HEADER_LEN {
			return None;
		}
		Some(Header {
			flags: u16::from_le_bytes([bytes[0], bytes[1]]),
			mtime: u16::from_le_bytes([bytes[2], bytes[3]]),
			atime: u16::from_le_bytes([bytes[4], bytes[5]]),
		})
	}

	pub fn write_to(&self, out: &mut [u8]) {
		debug_assert!(out.len() >= HEADER_LEN);
		out[0..2].copy_from_slice(&self.flags.to_le_bytes());
		out[2..4].copy_from_slice(&self.mtime.to_le_bytes());
		out[4..6].copy_from_slice(&self.atime.to_le_bytes());
		out[6..8].copy_from_slice(&0u16.to_le_bytes());
	}

	/// Unsigned 16-bit day-index arithmetic, wraparound permitted (see
	/// the 16-bit day-index open question in DESIGN.md).
	pub fn expired(&self, now: u16, days: u16) -> bool {
		self.mtime.wrapping_add(days) < now && self.atime.wrapping_add(days) < now
	}
}

#[derive(Debug)]
pub enum UnwrapError {
	TooSmall,
	UnknownFlags(u16),
	StaleLegacyCodec,
	SizeOutOfRange,
	Decompress(String),
}

impl fmt::Display for UnwrapError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			UnwrapError::TooSmall => write!(f, "envelope smaller than header"),
			UnwrapError::UnknownFlags(flags) => write!(f, "unknown envelope flags: {:#06x}", flags),
			UnwrapError::StaleLegacyCodec => write!(f, "entry uses legacy codec A, treated as stale"),
			UnwrapError::SizeOutOfRange => write!(f, "decompressed size out of range"),
			UnwrapError::Decompress(msg) => write!(f, "decompress failed: {}", msg),
		}
	}
}

/// A decoded value with a trailing NUL appended, not counted in `len()`.
/// Lets callers treat the buffer as a C string without a re-copy; the NUL
/// is never part of the stored envelope.
pub struct Payload(Vec<u8>);

impl Payload {
	fn from_value(value: &[u8]) -> Payload {
		let mut buf = Vec::with_capacity(value.len() + 1);
		buf.extend_from_slice(value);
		buf.push(0);
		Payload(buf)
	}

	pub fn len(&self) -> usize {
		self.0.len() - 1
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// The stored bytes plus the trailing NUL sentinel.
	pub fn as_bytes_with_nul(&self) -> &[u8] {
		&self.0
	}
}

impl Deref for Payload {
	type Target = [u8];
	fn deref(&self) -> &[u8] {
		&self.0[..self.0.len() - 1]
	}
}

/// Wrap a value into a full envelope (header + payload). `mtime`/`atime`
/// are left at zero; the DB tier stamps them on put, the FS tier leaves
/// them zero and relies on the file's inode timestamps.
pub fn wrap(value: &[u8]) -> Vec<u8> {
	let (compression, payload) = if value.len() < TINY_THRESHOLD {
		(Compression::Verbatim, None)
	} else {
		match zstd::bulk::compress(value, ZSTD_LEVEL) {
			Ok(compressed) if compressed.len() < value.len() => (Compression::CodecB, Some(compressed)),
			Ok(_) => (Compression::Verbatim, None),
			Err(e) => {
				log::warn!(target: "blobcache", "zstd compress failed, storing verbatim: {}", e);
				(Compression::Verbatim, None)
			}
		}
	};

	let payload: &[u8] = payload.as_deref().unwrap_or(value);
	let mut envelope = Vec::with_capacity(HEADER_LEN + payload.len());
	envelope.resize(HEADER_LEN, 0);
	let header = Header { flags: compression.flag_bits(), mtime: 0, atime: 0 };
	header.write_to(&mut envelope);
	envelope.extend_from_slice(payload);
	envelope
}

/// Validate and decode an envelope, returning the original value with a
/// trailing NUL sentinel appended. An envelope that fails any invariant
/// is corruption, surfaced to the caller as a miss.
pub fn unwrap(envelope: &[u8]) -> Result<Payload, UnwrapError> {
	let header = Header::parse(envelope).ok_or(UnwrapError::TooSmall)?;
	let compression = Compression::from_flags(header.flags)
		.ok_or(UnwrapError::UnknownFlags(header.flags))?;
	let payload = &envelope[HEADER_LEN..];

	match compression {
		Compression::Verbatim => Ok(Payload::from_value(payload)),
		Compression::CodecALegacy => Err(UnwrapError::StaleLegacyCodec),
		Compression::CodecB => decompress_zstd(payload).map(|v| Payload::from_value(&v)),
	}
}

fn decompress_zstd(payload: &[u8]) -> Result<Vec<u8>, UnwrapError> {
	let content_size = zstd::zstd_safe::get_frame_content_size(payload)
		.ok()
		.flatten()
		.ok_or_else(|| UnwrapError::Decompress("missing frame content size".into()))?;

	if content_size < TINY_THRESHOLD as u64 || content_size > i32::MAX as u64 {
		return Err(UnwrapError::SizeOutOfRange);
	}

	let mut decompressor =
		zstd::bulk::Decompressor::new().map_err(|e| UnwrapError::Decompress(e.to_string()))?;
	let out = decompressor
		.decompress(payload, content_size as usize)
		.map_err(|e| UnwrapError::Decompress(e.to_string()))?;

	if out.len() as u64 != content_size {
		return Err(UnwrapError::Decompress("decompressed size mismatch".into()));
	}
	Ok(out)
}
