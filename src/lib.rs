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

//! A persistent, content-addressed cache: small values live in an
//! embedded hash-table file, large values as one file per digest. A
//! [`Cache`] handle owns an advisory lock on its directory, so multiple
//! processes may open the same cache directory concurrently; a single
//! handle must not be shared across threads without external
//! synchronization (see [`Cache`]'s docs).

mod db;
mod digest;
mod display;
mod envelope;
mod error;
mod fs;
mod guard;
mod options;

pub use crate::envelope::Payload as CacheValue;
pub use crate::error::{Error, Result};
pub use crate::options::CacheOptions;

use std::fs::File;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Values at or below this size (after `envelope::wrap`'s header and any
/// compression) live in the embedded DB; larger ones are promoted to the
/// filesystem tier.
const DB_VALUE_THRESHOLD: usize = envelope::MAX_DB_VALUE_SIZE;

fn day_now() -> u16 {
	let secs = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
	(secs / 86400) as u16
}

/// A handle on an open cache directory.
///
/// Thread-compatible, not thread-safe: nothing here serializes two
/// threads calling `get`/`put` on the same handle concurrently (the
/// multi-step find-then-write sequences in the DB tier are not atomic
/// with respect to each other in-process). Share a handle across
/// threads behind a `Mutex`, or open one handle per thread. Multiple
/// *processes* may open the same directory at once; the directory's
/// advisory lock serializes their critical sections, which is a
/// cross-process guarantee only, not an in-process one.
///
/// A handle inherited across `fork` is only valid for teardown in the
/// process that opened it: a forked child's `Cache` does no work on
/// drop, since tearing down a handle it doesn't own could race the
/// parent.
pub struct Cache {
	root: PathBuf,
	dir_lock: File,
	db: db::Db,
	umask: libc::mode_t,
	now: u16,
	opener_pid: u32,
}

impl Cache {
	/// Open (creating if absent) the cache directory at `dir`, with
	/// default options.
	pub fn open<P: AsRef<Path>>(dir: P) -> Result<Cache> {
		Cache::open_with(dir, &CacheOptions::default())
	}

	/// Open with explicit tunables. `options.bucket_count` only takes
	/// effect the first time `cache.db` is created; reopening an
	/// existing cache keeps whatever bucket count it was created with.
	pub fn open_with<P: AsRef<Path>>(dir: P, options: &CacheOptions) -> Result<Cache> {
		let root = dir.as_ref().to_path_buf();
		let meta = std::fs::metadata(&root).map_err(Error::Io)?;
		if !meta.is_dir() {
			return Err(Error::InvalidPath(root));
		}
		let umask = (!meta.permissions().mode()) & 0o022;
		let dir_lock = File::open(&root).map_err(Error::Io)?;
		let db = db::Db::open(&root.join("cache.db"), options.bucket_count).map_err(Error::Io)?;
		let now = day_now();
		let opener_pid = std::process::id();

		log::debug!(target: "blobcache", "opened cache at {}", root.display());
		Ok(Cache { root, dir_lock, db, umask, now, opener_pid })
	}

	/// Look up `key`, returning the decoded value if present. A corrupt
	/// entry (bad flags, truncated envelope, failed decompression) is
	/// logged and treated as a miss, without falling through to the
	/// other tier -- a digest lives in exactly one tier at a time.
	pub fn get(&self, key: &[u8]) -> Option<CacheValue> {
		let d = digest::digest(key);

		let mut buf = [0u8; db::STACK_BUF_LEN];
		if let Some(len) = self.db.get(&self.dir_lock, &d, &mut buf, self.now) {
			return self.decode(&buf[..len]);
		}

		let mapping = fs::get(&self.root, &d)?;
		self.decode(&mapping)
	}

	fn decode(&self, envelope: &[u8]) -> Option<CacheValue> {
		match envelope::unwrap(envelope) {
			Ok(payload) => Some(payload),
			Err(e) => {
				log::warn!(target: "blobcache", "{}", e);
				None
			}
		}
	}

	/// Store `value` under `key`, overwriting any previous entry. Values
	/// that fit the DB tier's envelope budget go there; larger ones are
	/// promoted to the filesystem tier, with any stale DB copy purged
	/// first so a digest never lives in both tiers at once.
	pub fn put(&self, key: &[u8], value: &[u8]) {
		let d = digest::digest(key);
		let envelope = envelope::wrap(value);
		let payload_len = envelope.len() - envelope::HEADER_LEN;

		if payload_len <= DB_VALUE_THRESHOLD {
			self.db.put(&self.dir_lock, self.umask, &d, &envelope, self.now);
			return;
		}

		self.db.del(&self.dir_lock, self.umask, &d);
		if let Err(e) = fs::put(&self.root, std::process::id(), &d, &envelope) {
			log::warn!(target: "blobcache", "fs put: {}", e);
		}
	}

	/// Remove every entry whose age exceeds `days` in both tiers.
	/// `days` must be at least 1.
	pub fn clean(&self, days: i32) -> Result<()> {
		if days < 1 || days > u16::MAX as i32 {
			return Err(Error::InvalidDays(days));
		}
		let days = days as u16;
		self.db.clean(&self.dir_lock, self.umask, self.now, days);
		fs::clean(&self.root, self.now, days);
		Ok(())
	}
}

impl Drop for Cache {
	fn drop(&mut self) {
		if std::process::id() != self.opener_pid {
			log::debug!(target: "blobcache", "skipping teardown in forked child");
			return;
		}
		log::debug!(target: "blobcache", "closed cache at {}", self.root.display());
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn open_tmp() -> (tempfile::TempDir, Cache) {
		env_logger::try_init().ok();
		let tmp = tempfile::tempdir().unwrap();
		let cache = Cache::open(tmp.path()).unwrap();
		(tmp, cache)
	}

	#[test]
	fn put_then_get_round_trips_small_value() {
		let (_tmp, cache) = open_tmp();
		cache.put(b"key", b"value");
		let got = cache.get(b"key").unwrap();
		assert_eq!(&*got, b"value");
	}

	#[test]
	fn missing_key_is_none() {
		let (_tmp, cache) = open_tmp();
		assert!(cache.get(b"nope").is_none());
	}

	#[test]
	fn empty_value_round_trips() {
		let (_tmp, cache) = open_tmp();
		cache.put(b"key", b"");
		let got = cache.get(b"key").unwrap();
		assert!(got.is_empty());
	}

	#[test]
	fn large_value_is_promoted_to_fs_tier_and_readable() {
		let (_tmp, cache) = open_tmp();
		let value = vec![b'x'; DB_VALUE_THRESHOLD + 4096];
		cache.put(b"big", &value);
		let got = cache.get(b"big").unwrap();
		assert_eq!(got.len(), value.len());
		assert_eq!(&*got, &value[..]);
	}

	#[test]
	fn overwrite_with_larger_value_leaves_no_stale_db_copy() {
		let (tmp, cache) = open_tmp();
		cache.put(b"key", b"small value fits in db");
		let big = vec![b'y'; DB_VALUE_THRESHOLD + 1024];
		cache.put(b"key", &big);

		// Reopen so the only source of truth is what's actually on disk.
		drop(cache);
		let cache = Cache::open(tmp.path()).unwrap();
		let got = cache.get(b"key").unwrap();
		assert_eq!(got.len(), big.len());
	}

	#[test]
	fn clean_rejects_non_positive_days() {
		let (_tmp, cache) = open_tmp();
		assert!(matches!(cache.clean(0), Err(Error::InvalidDays(0))));
		assert!(matches!(cache.clean(-1), Err(Error::InvalidDays(-1))));
	}

	#[test]
	fn open_rejects_non_directory() {
		let tmp = tempfile::tempdir().unwrap();
		let file_path = tmp.path().join("not_a_dir");
		std::fs::write(&file_path, b"x").unwrap();
		assert!(matches!(Cache::open(&file_path), Err(Error::InvalidPath(_))));
	}

	#[test]
	fn reopen_preserves_small_and_large_entries() {
		let tmp = tempfile::tempdir().unwrap();
		{
			let cache = Cache::open(tmp.path()).unwrap();
			cache.put(b"small", b"tiny");
			cache.put(b"large", &vec![b'z'; DB_VALUE_THRESHOLD + 1024]);
		}
		let cache = Cache::open(tmp.path()).unwrap();
		assert_eq!(&*cache.get(b"small").unwrap(), b"tiny");
		assert_eq!(cache.get(b"large").unwrap().len(), DB_VALUE_THRESHOLD + 1024);
	}
}
