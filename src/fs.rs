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

//! Large-value tier: one file per digest under `<root>/XX/YYYY...`, a
//! 2-char hex subdirectory and a 38-char hex basename. Publish is
//! temp-file + mmap + rename, giving crash atomicity per entry.
//!
//! Unlike `db.rs`, this tier does not trust the envelope's embedded
//! mtime/atime (those are left zero by `envelope::wrap`): age is tracked
//! through the file's own inode timestamps, which the OS maintains for
//! free.

use crate::digest::{Digest, DIGEST_LEN};
use memmap2::{Mmap, MmapMut};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

const HEX: &[u8; 16] = b"0123456789abcdef";

/// Two hex characters for one byte, low nibble first -- a format wart
/// preserved from the original C implementation, not a bug.
fn hh(byte: u8) -> [u8; 2] {
	[HEX[(byte & 0x0f) as usize], HEX[(byte >> 4) as usize]]
}

fn push_hex(out: &mut String, byte: u8) {
	let pair = hh(byte);
	out.push(pair[0] as char);
	out.push(pair[1] as char);
}

/// Splits a digest into its 2-char subdirectory and 38-char basename.
pub fn path_components(digest: &Digest) -> (String, String) {
	let mut dir = String::with_capacity(2);
	push_hex(&mut dir, digest[0]);
	let mut name = String::with_capacity((DIGEST_LEN - 1) * 2);
	for &b in &digest[1..] {
		push_hex(&mut name, b);
	}
	(dir, name)
}

fn entry_path(root: &Path, digest: &Digest) -> PathBuf {
	let (dir, name) = path_components(digest);
	root.join(dir).join(name)
}

/// Eight hex chars mixing a random value with the writer's pid, so
/// concurrent writers racing to publish the same digest never collide on
/// the temp name.
fn temp_suffix(pid: u32) -> String {
	let r: u32 = rand::random();
	let mixed = (r << 1) ^ pid;
	let mut s = String::with_capacity(8);
	for b in mixed.to_ne_bytes() {
		push_hex(&mut s, b);
	}
	s
}

fn day_index(t: SystemTime) -> u16 {
	let secs = t.duration_since(SystemTime::UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
	(secs / 86400) as u16
}

/// Read-only mapping of a large-value entry. Dropping it unmaps (the
/// `Unget` of the original API).
pub struct Mapping(Mmap);

impl std::ops::Deref for Mapping {
	type Target = [u8];
	fn deref(&self) -> &[u8] {
		&self.0
	}
}

pub fn get(root: &Path, digest: &Digest) -> Option<Mapping> {
	let path = entry_path(root, digest);
	let file = match File::open(&path) {
		Ok(f) => f,
		Err(e) => {
			if e.kind() != io::ErrorKind::NotFound {
				log::warn!(target: "blobcache", "open {}: {}", path.display(), e);
			}
			return None;
		}
	};
	match unsafe { Mmap::map(&file) } {
		Ok(m) => Some(Mapping(m)),
		Err(e) => {
			log::warn!(target: "blobcache", "mmap {}: {}", path.display(), e);
			None
		}
	}
}

pub fn put(root: &Path, pid: u32, digest: &Digest, envelope: &[u8]) -> io::Result<()> {
	let (dir, name) = path_components(digest);
	let dir_path = root.join(&dir);
	if let Err(e) = fs::create_dir(&dir_path) {
		if e.kind() != io::ErrorKind::AlreadyExists {
			return Err(e);
		}
	}

	let tmp_name = format!("{}.{}", name, temp_suffix(pid));
	let tmp_path = dir_path.join(&tmp_name);
	let file = OpenOptions::new().read(true).write(true).create_new(true).open(&tmp_path)?;
	file.set_len(envelope.len() as u64)?;
	{
		let mut mmap = unsafe { MmapMut::map_mut(&file)? };
		mmap.copy_from_slice(envelope);
		mmap.flush()?;
	}
	drop(file);

	let perm_path = dir_path.join(&name);
	fs::rename(&tmp_path, &perm_path)
}

/// Scan all 256 two-hex subdirectories, removing permanent entries whose
/// inode mtime and atime are both older than `days`, and temp entries
/// (basename longer than 38 chars, orphaned by a crash mid-publish)
/// older than one day regardless of `days`. `now` is the caller's
/// cached day-index (the same value passed to the DB tier's `clean`),
/// not resampled here, so both tiers agree on what "now" means for the
/// lifetime of a single `Cache::clean` call.
pub fn clean(root: &Path, now: u16, days: u16) {
	for hi in 0..16u8 {
		for lo in 0..16u8 {
			let mut name = String::with_capacity(2);
			push_hex(&mut name, hi << 4 | lo);
			let subdir = root.join(&name);
			clean_subdir(&subdir, now, days);
		}
	}
}

fn clean_subdir(subdir: &Path, now: u16, days: u16) {
	let entries = match fs::read_dir(subdir) {
		Ok(e) => e,
		Err(e) => {
			if e.kind() != io::ErrorKind::NotFound {
				log::warn!(target: "blobcache", "read_dir {}: {}", subdir.display(), e);
			}
			return;
		}
	};

	for entry in entries {
		let entry = match entry {
			Ok(e) => e,
			Err(e) => {
				log::warn!(target: "blobcache", "readdir {}: {}", subdir.display(), e);
				continue;
			}
		};
		let name = entry.file_name();
		let len = name.len();
		if len < 38 {
			continue;
		}
		let meta = match entry.metadata() {
			Ok(m) => m,
			Err(e) => {
				log::warn!(target: "blobcache", "stat {}: {}", entry.path().display(), e);
				continue;
			}
		};
		let mtime = day_index(meta.modified().unwrap_or(SystemTime::UNIX_EPOCH));
		let atime = day_index(meta.accessed().unwrap_or(mtime_as_systime(mtime)));
		let threshold = if len == 38 { days } else { 1 };
		if mtime.wrapping_add(threshold) >= now {
			continue;
		}
		if atime.wrapping_add(threshold) >= now {
			continue;
		}
		if let Err(e) = fs::remove_file(entry.path()) {
			log::warn!(target: "blobcache", "remove {}: {}", entry.path().display(), e);
		}
	}
}

fn mtime_as_systime(day: u16) -> SystemTime {
	SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(day as u64 * 86400)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn path_components_use_low_nibble_first_hex() {
		let digest: Digest = [0x1a; DIGEST_LEN];
		let (dir, name) = path_components(&digest);
		// low nibble (0xa) first, then high nibble (0x1)
		assert_eq!(dir, "a1");
		assert_eq!(name.len(), 38);
		assert!(name.starts_with("a1"));
	}

	#[test]
	fn put_then_get_round_trips() {
		let tmp = tempfile::tempdir().unwrap();
		let digest: Digest = [7u8; DIGEST_LEN];
		let envelope = vec![9u8; 128];
		put(tmp.path(), std::process::id(), &digest, &envelope).unwrap();
		let mapping = get(tmp.path(), &digest).unwrap();
		assert_eq!(&*mapping, &envelope[..]);
	}

	#[test]
	fn get_missing_is_silent_none() {
		let tmp = tempfile::tempdir().unwrap();
		let digest: Digest = [1u8; DIGEST_LEN];
		assert!(get(tmp.path(), &digest).is_none());
	}

	#[test]
	fn clean_removes_aged_temp_file_regardless_of_days() {
		env_logger::try_init().ok();
		let tmp = tempfile::tempdir().unwrap();
		let (dir, name) = path_components(&[3u8; DIGEST_LEN]);
		let dir_path = tmp.path().join(&dir);
		fs::create_dir_all(&dir_path).unwrap();
		let tmp_name = format!("{}.deadbeef0", name);
		let tmp_path = dir_path.join(&tmp_name);
		fs::write(&tmp_path, b"partial").unwrap();
		let old = SystemTime::now() - std::time::Duration::from_secs(3 * 86400);
		let old_file = File::open(&tmp_path).unwrap();
		old_file.set_modified(old).unwrap();
		let now = day_index(SystemTime::now());
		clean(tmp.path(), now, 365); // days argument irrelevant to temp-file threshold
		assert!(!tmp_path.exists());
	}
}
