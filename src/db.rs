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

// On-disk format of cache.db, a chained hash table keyed by digest:
//
// File header (32 bytes):
// [MAGIC: 4][VERSION: 4][BUCKET_COUNT: 8][FREE_HEAD: 8][ENTRY_COUNT: 8]
//
// Bucket table, BUCKET_COUNT * 8 bytes immediately after the header:
// each entry is the file offset of the head of that bucket's slot chain,
// 0 meaning empty (offset 0 falls inside the header and can never be a
// real slot).
//
// Slot (variable length, SLOT_HEADER_LEN + cap bytes):
// [NEXT: 8][STATE: 1][DIGEST: 20][CAP: 4][LEN: 4][CRC: 4][PAYLOAD: cap]
// NEXT  - next slot in whichever chain currently holds this slot (bucket
//         chain while occupied, free list while free).
// STATE - 0 free, 1 occupied.
// CAP   - bytes reserved for payload; LEN <= CAP. A slot is reused in
//         place on overwrite when the new envelope fits within CAP.
// CRC   - crc32 over DIGEST + envelope flags/pad/compressed-payload,
//         deliberately excluding the envelope's mtime/atime bytes so the
//         lazy atime bump on get never requires a checksum recompute.
//         Verified on every get; a mismatch is logged and reported as a
//         miss, never returned to the caller.
//
// The DB never runs its own hash function: the caller supplies
// `crate::digest::bucket_hash`, already the first four bytes of the SHA-1
// key digest, as bucket selection input.

use crate::digest::{Digest, DIGEST_LEN};
use crate::envelope::{self, Header, HEADER_LEN, MAX_DB_VALUE_SIZE};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

const MAGIC: u32 = 0x4243_4442; // "BCDB"
const VERSION: u32 = 1;
const FILE_HEADER_LEN: u64 = 32;
const SLOT_HEADER_LEN: u64 = 8 + 1 + DIGEST_LEN as u64 + 4 + 4 + 4;

pub const DEFAULT_BUCKET_COUNT: u64 = 4096;

/// Size of the stack-resident read buffer used by `get`: header plus the
/// largest envelope the DB tier will ever hold.
pub const STACK_BUF_LEN: usize = HEADER_LEN + MAX_DB_VALUE_SIZE;

struct FileHeader {
	bucket_count: u64,
	free_head: u64,
	entry_count: u64,
}

impl FileHeader {
	fn read(file: &File) -> io::Result<FileHeader> {
		let mut buf = [0u8; FILE_HEADER_LEN as usize];
		file.read_exact_at(&mut buf, 0)?;
		let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
		let version = u32::from_le_bytes(buf[4..8].try_into().unwrap());
		if magic != MAGIC {
			return Err(io::Error::new(io::ErrorKind::InvalidData, "bad cache.db magic"));
		}
		if version != VERSION {
			return Err(io::Error::new(io::ErrorKind::InvalidData, "unsupported cache.db version"));
		}
		Ok(FileHeader {
			bucket_count: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
			free_head: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
			entry_count: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
		})
	}

	fn write_new(file: &File, bucket_count: u64) -> io::Result<()> {
		let mut buf = [0u8; FILE_HEADER_LEN as usize];
		buf[0..4].copy_from_slice(&MAGIC.to_le_bytes());
		buf[4..8].copy_from_slice(&VERSION.to_le_bytes());
		buf[8..16].copy_from_slice(&bucket_count.to_le_bytes());
		// free_head and entry_count start at zero
		file.write_all_at(&buf, 0)?;
		let bucket_bytes = vec![0u8; (bucket_count * 8) as usize];
		file.write_all_at(&bucket_bytes, FILE_HEADER_LEN)?;
		Ok(())
	}
}

/// Embedded hash database backing the small-value tier. Thread-
/// compatible, not thread-safe: a handle must not be called from two
/// threads at once without external serialization, matching the
/// crate-wide contract described on `Cache`.
pub struct Db {
	file: File,
	bucket_count: u64,
	free_head: AtomicU64,
	entry_count: AtomicU64,
	write_cursor: AtomicU64,
}

struct SlotHeader {
	next: u64,
	state: u8,
	digest: Digest,
	cap: u32,
	len: u32,
	crc: u32,
}

impl SlotHeader {
	fn parse(buf: &[u8]) -> SlotHeader {
		let mut digest = [0u8; DIGEST_LEN];
		digest.copy_from_slice(&buf[9..9 + DIGEST_LEN]);
		SlotHeader {
			next: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
			state: buf[8],
			digest,
			cap: u32::from_le_bytes(buf[29..33].try_into().unwrap()),
			len: u32::from_le_bytes(buf[33..37].try_into().unwrap()),
			crc: u32::from_le_bytes(buf[37..41].try_into().unwrap()),
		}
	}

	fn write_to(&self, buf: &mut [u8]) {
		buf[0..8].copy_from_slice(&self.next.to_le_bytes());
		buf[8] = self.state;
		buf[9..9 + DIGEST_LEN].copy_from_slice(&self.digest);
		buf[29..33].copy_from_slice(&self.cap.to_le_bytes());
		buf[33..37].copy_from_slice(&self.len.to_le_bytes());
		buf[37..41].copy_from_slice(&self.crc.to_le_bytes());
	}

	fn is_occupied(&self) -> bool {
		self.state == 1
	}
}

fn crc_of(digest: &Digest, envelope: &[u8]) -> u32 {
	let mut hasher = crc32fast::Hasher::new();
	hasher.update(digest);
	hasher.update(&envelope[0..2]); // flags
	hasher.update(&envelope[6..]); // pad + payload, skips mtime/atime
	hasher.finalize()
}

impl Db {
	pub fn open(path: &Path, bucket_count: u64) -> io::Result<Db> {
		let file = OpenOptions::new().read(true).write(true).create(true).open(path)?;
		let len = file.metadata()?.len();
		let header = if len == 0 {
			FileHeader::write_new(&file, bucket_count)?;
			FileHeader { bucket_count, free_head: 0, entry_count: 0 }
		} else {
			FileHeader::read(&file)?
		};
		let data_start = FILE_HEADER_LEN + header.bucket_count * 8;
		let write_cursor = std::cmp::max(len, data_start);
		log::debug!(
			target: "blobcache",
			"opened cache.db with {} buckets, {} entries",
			header.bucket_count,
			header.entry_count,
		);
		Ok(Db {
			file,
			bucket_count: header.bucket_count,
			free_head: AtomicU64::new(header.free_head),
			entry_count: AtomicU64::new(header.entry_count),
			write_cursor: AtomicU64::new(write_cursor),
		})
	}

	fn bucket_slot_offset(&self, digest: &Digest) -> u64 {
		let index = crate::digest::bucket_hash(digest) as u64 % self.bucket_count;
		FILE_HEADER_LEN + index * 8
	}

	fn read_bucket_head(&self, bucket_slot_offset: u64) -> io::Result<u64> {
		let mut buf = [0u8; 8];
		self.file.read_exact_at(&mut buf, bucket_slot_offset)?;
		Ok(u64::from_le_bytes(buf))
	}

	fn write_bucket_head(&self, bucket_slot_offset: u64, head: u64) -> io::Result<()> {
		self.file.write_all_at(&head.to_le_bytes(), bucket_slot_offset)
	}

	fn read_slot_header(&self, offset: u64) -> io::Result<SlotHeader> {
		let mut buf = [0u8; SLOT_HEADER_LEN as usize];
		self.file.read_exact_at(&mut buf, offset)?;
		Ok(SlotHeader::parse(&buf))
	}

	fn write_slot_header(&self, offset: u64, header: &SlotHeader) -> io::Result<()> {
		let mut buf = [0u8; SLOT_HEADER_LEN as usize];
		header.write_to(&mut buf);
		self.file.write_all_at(&buf, offset)
	}

	/// Walks the bucket chain for `digest`, returning the slot offset and
	/// header if found, and the offset of the slot whose `next` field
	/// points at it (0 meaning it's the bucket head).
	fn find(&self, digest: &Digest) -> io::Result<Option<(u64, u64, SlotHeader)>> {
		let bucket_slot_offset = self.bucket_slot_offset(digest);
		let mut prev = 0u64;
		let mut offset = self.read_bucket_head(bucket_slot_offset)?;
		while offset != 0 {
			let header = self.read_slot_header(offset)?;
			if header.is_occupied() && header.digest == *digest {
				return Ok(Some((offset, prev, header)));
			}
			prev = offset;
			offset = header.next;
		}
		Ok(None)
	}

	fn unlink(&self, bucket_slot_offset: u64, prev: u64, next: u64) -> io::Result<()> {
		if prev == 0 {
			self.write_bucket_head(bucket_slot_offset, next)
		} else {
			let mut prev_header = self.read_slot_header(prev)?;
			prev_header.next = next;
			self.write_slot_header(prev, &prev_header)
		}
	}

	fn push_free(&self, offset: u64, cap: u32, digest: Digest) -> io::Result<()> {
		let free_head = self.free_head.load(Ordering::Relaxed);
		let header = SlotHeader { next: free_head, state: 0, digest, cap, len: 0, crc: 0 };
		self.write_slot_header(offset, &header)?;
		self.free_head.store(offset, Ordering::Relaxed);
		self.sync_header()
	}

	/// First-fit scan over the free list, bounded so a long chain of
	/// tiny freed slots can't turn every put into a linear scan.
	fn take_free(&self, needed: u32) -> io::Result<Option<u64>> {
		const MAX_SCAN: usize = 32;
		let mut prev = 0u64;
		let mut offset = self.free_head.load(Ordering::Relaxed);
		for _ in 0..MAX_SCAN {
			if offset == 0 {
				break;
			}
			let header = self.read_slot_header(offset)?;
			if header.cap >= needed {
				if prev == 0 {
					self.free_head.store(header.next, Ordering::Relaxed);
				} else {
					let mut prev_header = self.read_slot_header(prev)?;
					prev_header.next = header.next;
					self.write_slot_header(prev, &prev_header)?;
				}
				self.sync_header()?;
				return Ok(Some(offset));
			}
			prev = offset;
			offset = header.next;
		}
		Ok(None)
	}

	fn allocate(&self, needed: u32) -> io::Result<(u64, u32)> {
		if let Some(offset) = self.take_free(needed)? {
			let header = self.read_slot_header(offset)?;
			return Ok((offset, header.cap));
		}
		let offset = self.write_cursor.fetch_add(SLOT_HEADER_LEN + needed as u64, Ordering::Relaxed);
		self.file.set_len(offset + SLOT_HEADER_LEN + needed as u64)?;
		Ok((offset, needed))
	}

	fn sync_header(&self) -> io::Result<()> {
		let mut buf = [0u8; 24];
		buf[0..8].copy_from_slice(&self.bucket_count.to_le_bytes());
		buf[8..16].copy_from_slice(&self.free_head.load(Ordering::Relaxed).to_le_bytes());
		buf[16..24].copy_from_slice(&self.entry_count.load(Ordering::Relaxed).to_le_bytes());
		self.file.write_all_at(&buf, 8)
	}

	/// `USERMEM`-style get: reads directly into the caller's stack buffer,
	/// returns the valid length. Bumps the entry's atime in a second,
	/// exclusive critical section if it's stale -- mirroring the original
	/// C implementation's two-phase get.
	pub fn get(&self, dir_lock: &File, digest: &Digest, buf: &mut [u8; STACK_BUF_LEN], now: u16) -> Option<usize> {
		let found = {
			let _cs = crate::guard::CriticalSection::shared(dir_lock);
			match self.find(digest) {
				Ok(Some((offset, _, header))) => {
					if let Err(e) = self.read_payload(offset, header.len, &mut buf[..header.len as usize]) {
						log::warn!(target: "blobcache", "db read payload for {}: {}", crate::display::hex(digest), e);
						None
					} else {
						let actual = crc_of(digest, &buf[..header.len as usize]);
						if actual != header.crc {
							log::warn!(
								target: "blobcache",
								"db get: crc mismatch for {}, treating as miss",
								crate::display::hex(digest),
							);
							None
						} else {
							Some((offset, header))
						}
					}
				}
				Ok(None) => None,
				Err(e) => {
					log::warn!(target: "blobcache", "db get {}: {}", crate::display::hex(digest), e);
					None
				}
			}
		};

		let (offset, header) = found?;
		if header.len < HEADER_LEN as u32 {
			log::warn!(target: "blobcache", "vent too small for {}", crate::display::hex(digest));
			return None;
		}
		let len = header.len as usize;
		if let Some(envelope_header) = Header::parse(&buf[..len]) {
			if envelope_header.atime < now {
				let _cs = crate::guard::CriticalSection::exclusive(dir_lock, 0o022);
				let atime_offset = offset + SLOT_HEADER_LEN + 4; // header.atime is at envelope[4..6]
				if let Err(e) = self.file.write_all_at(&now.to_le_bytes(), atime_offset) {
					log::warn!(target: "blobcache", "db atime update: {}", e);
				}
			}
		}
		Some(len)
	}

	fn read_payload(&self, slot_offset: u64, len: u32, out: &mut [u8]) -> io::Result<()> {
		self.file.read_exact_at(&mut out[..len as usize], slot_offset + SLOT_HEADER_LEN)
	}

	/// Stamps `mtime`/`atime` to `now` and stores `envelope`, overwriting
	/// any previous entry for the same digest (growing its slot or
	/// replacing it if it no longer fits).
	pub fn put(&self, dir_lock: &File, umask: libc::mode_t, digest: &Digest, envelope: &[u8], now: u16) {
		if envelope.len() > STACK_BUF_LEN {
			log::warn!(
				target: "blobcache",
				"envelope too large for db tier: {} ({} bytes)",
				crate::display::hex(digest),
				envelope.len(),
			);
			return;
		}
		let mut stamped = envelope.to_vec();
		let mut header = match Header::parse(&stamped) {
			Some(h) => h,
			None => {
				log::warn!(target: "blobcache", "db put {}: envelope too small", crate::display::hex(digest));
				return;
			}
		};
		header.mtime = now;
		header.atime = now;
		header.write_to(&mut stamped[..HEADER_LEN]);
		let crc = crc_of(digest, &stamped);

		let _cs = crate::guard::CriticalSection::exclusive(dir_lock, umask);
		if let Err(e) = self.put_locked(digest, &stamped, crc) {
			log::warn!(target: "blobcache", "db put {}: {}", crate::display::hex(digest), e);
		}
	}

	fn put_locked(&self, digest: &Digest, envelope: &[u8], crc: u32) -> io::Result<()> {
		let bucket_slot_offset = self.bucket_slot_offset(digest);
		let needed = envelope.len() as u32;

		if let Some((offset, _, existing)) = self.find(digest)? {
			if existing.cap >= needed {
				self.write_payload(offset, envelope)?;
				let header = SlotHeader { next: existing.next, state: 1, digest: *digest, cap: existing.cap, len: needed, crc };
				return self.write_slot_header(offset, &header);
			}
			// Doesn't fit: unlink, free, and fall through to allocate fresh.
			let head = self.read_bucket_head(bucket_slot_offset)?;
			let prev = if head == offset { 0 } else { self.chain_predecessor(bucket_slot_offset, offset)? };
			self.unlink(bucket_slot_offset, prev, existing.next)?;
			self.push_free(offset, existing.cap, existing.digest)?;
		} else {
			self.entry_count.fetch_add(1, Ordering::Relaxed);
		}

		let (offset, cap) = self.allocate(needed)?;
		self.write_payload(offset, envelope)?;
		let bucket_head = self.read_bucket_head(bucket_slot_offset)?;
		let header = SlotHeader { next: bucket_head, state: 1, digest: *digest, cap, len: needed, crc };
		self.write_slot_header(offset, &header)?;
		self.write_bucket_head(bucket_slot_offset, offset)?;
		self.sync_header()
	}

	fn chain_predecessor(&self, bucket_slot_offset: u64, target: u64) -> io::Result<u64> {
		let mut prev = 0u64;
		let mut offset = self.read_bucket_head(bucket_slot_offset)?;
		while offset != 0 && offset != target {
			prev = offset;
			offset = self.read_slot_header(offset)?.next;
		}
		Ok(prev)
	}

	fn write_payload(&self, slot_offset: u64, envelope: &[u8]) -> io::Result<()> {
		self.file.write_all_at(envelope, slot_offset + SLOT_HEADER_LEN)
	}

	/// Deletes an entry; a missing entry is not an error.
	pub fn del(&self, dir_lock: &File, umask: libc::mode_t, digest: &Digest) {
		let _cs = crate::guard::CriticalSection::exclusive(dir_lock, umask);
		if let Err(e) = self.del_locked(digest) {
			log::warn!(target: "blobcache", "db del {}: {}", crate::display::hex(digest), e);
		}
	}

	fn del_locked(&self, digest: &Digest) -> io::Result<()> {
		let bucket_slot_offset = self.bucket_slot_offset(digest);
		if let Some((offset, prev, header)) = self.find(digest)? {
			self.unlink(bucket_slot_offset, prev, header.next)?;
			self.push_free(offset, header.cap, header.digest)?;
			self.entry_count.fetch_sub(1, Ordering::Relaxed);
			self.sync_header()?;
		}
		Ok(())
	}

	/// Removes every entry whose mtime and atime are both older than
	/// `days`. A single exclusive critical section for the whole scan,
	/// as in the original's cursor-based walk.
	pub fn clean(&self, dir_lock: &File, umask: libc::mode_t, now: u16, days: u16) {
		let _cs = crate::guard::CriticalSection::exclusive(dir_lock, umask);
		if let Err(e) = self.clean_locked(now, days) {
			log::warn!(target: "blobcache", "db clean: {}", e);
		}
	}

	fn clean_locked(&self, now: u16, days: u16) -> io::Result<()> {
		for bucket in 0..self.bucket_count {
			let bucket_slot_offset = FILE_HEADER_LEN + bucket * 8;
			let mut prev = 0u64;
			let mut offset = self.read_bucket_head(bucket_slot_offset)?;
			while offset != 0 {
				let header = self.read_slot_header(offset)?;
				let next = header.next;
				let mut envelope_header_buf = [0u8; HEADER_LEN];
				self.file.read_exact_at(&mut envelope_header_buf, offset + SLOT_HEADER_LEN)?;
				let envelope_header = Header::parse(&envelope_header_buf).unwrap_or_default();
				if envelope_header.expired(now, days) {
					self.unlink(bucket_slot_offset, prev, next)?;
					self.push_free(offset, header.cap, header.digest)?;
					self.entry_count.fetch_sub(1, Ordering::Relaxed);
				} else {
					prev = offset;
				}
				offset = next;
			}
		}
		self.sync_header()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::digest::digest;

	fn open_tmp() -> (tempfile::TempDir, Db) {
		env_logger::try_init().ok();
		let tmp = tempfile::tempdir().unwrap();
		let db = Db::open(&tmp.path().join("cache.db"), 16).unwrap();
		(tmp, db)
	}

	fn lock_file(tmp: &tempfile::TempDir) -> File {
		File::open(tmp.path()).unwrap()
	}

	#[test]
	fn put_then_get_round_trips() {
		let (tmp, db) = open_tmp();
		let lock = lock_file(&tmp);
		let d = digest(b"hello");
		let env = envelope::wrap(b"world");
		db.put(&lock, 0o022, &d, &env, 100);

		let mut buf = [0u8; STACK_BUF_LEN];
		let len = db.get(&lock, &d, &mut buf, 100).unwrap();
		let payload = envelope::unwrap(&buf[..len]).unwrap();
		assert_eq!(&*payload, b"world");
	}

	#[test]
	fn missing_key_is_none() {
		let (tmp, db) = open_tmp();
		let lock = lock_file(&tmp);
		let d = digest(b"nope");
		let mut buf = [0u8; STACK_BUF_LEN];
		assert!(db.get(&lock, &d, &mut buf, 1).is_none());
	}

	#[test]
	fn last_writer_wins() {
		let (tmp, db) = open_tmp();
		let lock = lock_file(&tmp);
		let d = digest(b"k");
		db.put(&lock, 0o022, &d, &envelope::wrap(b"v1"), 10);
		db.put(&lock, 0o022, &d, &envelope::wrap(b"v2 is longer than v1"), 10);

		let mut buf = [0u8; STACK_BUF_LEN];
		let len = db.get(&lock, &d, &mut buf, 10).unwrap();
		let payload = envelope::unwrap(&buf[..len]).unwrap();
		assert_eq!(&*payload, b"v2 is longer than v1");
	}

	#[test]
	fn del_then_get_misses() {
		let (tmp, db) = open_tmp();
		let lock = lock_file(&tmp);
		let d = digest(b"k");
		db.put(&lock, 0o022, &d, &envelope::wrap(b"v"), 10);
		db.del(&lock, 0o022, &d);
		let mut buf = [0u8; STACK_BUF_LEN];
		assert!(db.get(&lock, &d, &mut buf, 10).is_none());
	}

	#[test]
	fn del_of_missing_key_is_not_an_error() {
		let (tmp, db) = open_tmp();
		let lock = lock_file(&tmp);
		db.del(&lock, 0o022, &digest(b"nope")); // must not panic
	}

	#[test]
	fn clean_removes_entries_older_than_days() {
		let (tmp, db) = open_tmp();
		let lock = lock_file(&tmp);
		let d = digest(b"old");
		db.put(&lock, 0o022, &d, &envelope::wrap(b"v"), 0);
		// entry stamped at day 0; "now" is day 30, clean(7) should remove it
		db.clean(&lock, 0o022, 30, 7);
		let mut buf = [0u8; STACK_BUF_LEN];
		assert!(db.get(&lock, &d, &mut buf, 30).is_none());
	}

	#[test]
	fn clean_keeps_recent_entries() {
		let (tmp, db) = open_tmp();
		let lock = lock_file(&tmp);
		let d = digest(b"fresh");
		db.put(&lock, 0o022, &d, &envelope::wrap(b"v"), 25);
		db.clean(&lock, 0o022, 30, 7);
		let mut buf = [0u8; STACK_BUF_LEN];
		assert!(db.get(&lock, &d, &mut buf, 30).is_some());
	}

	#[test]
	fn reopen_preserves_entries() {
		let tmp = tempfile::tempdir().unwrap();
		let path = tmp.path().join("cache.db");
		let d = digest(b"persisted");
		{
			let db = Db::open(&path, 16).unwrap();
			let lock = lock_file(&tmp);
			db.put(&lock, 0o022, &d, &envelope::wrap(b"value"), 5);
		}
		let db = Db::open(&path, 16).unwrap();
		let lock = lock_file(&tmp);
		let mut buf = [0u8; STACK_BUF_LEN];
		let len = db.get(&lock, &d, &mut buf, 5).unwrap();
		let payload = envelope::unwrap(&buf[..len]).unwrap();
		assert_eq!(&*payload, b"value");
	}
}
