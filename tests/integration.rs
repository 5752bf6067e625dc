// Black-box tests exercising the crate purely through its public API,
// plus direct filesystem inspection of the documented on-disk layout
// (two-hex subdirectories, temp-then-rename publish) where a property
// can only be observed that way.

use blobcache::Cache;
use std::fs;
use std::time::{SystemTime, UNIX_EPOCH};

const HEX: &[u8; 16] = b"0123456789abcdef";

/// Mirrors the crate's documented low-nibble-first path encoding, so a
/// test can compute the exact on-disk path for a key without reaching
/// into the crate's private modules.
fn digest_path(key: &[u8]) -> (String, String) {
	use sha1::{Digest as _, Sha1};
	let mut hasher = Sha1::new();
	hasher.update(key);
	let d = hasher.finalize();

	let hh = |b: u8| [HEX[(b & 0x0f) as usize] as char, HEX[(b >> 4) as usize] as char];
	let pair = hh(d[0]);
	let dir: String = pair.iter().collect();
	let mut name = String::new();
	for &b in &d[1..] {
		name.extend(hh(b).iter());
	}
	(dir, name)
}

fn incompressible(len: usize) -> Vec<u8> {
	let mut value = Vec::with_capacity(len);
	let mut x: u32 = 0xdead_beef;
	for _ in 0..len {
		x ^= x << 13;
		x ^= x >> 17;
		x ^= x << 5;
		value.push((x & 0xff) as u8);
	}
	value
}

fn two_hex_subdirs(root: &std::path::Path) -> Vec<std::path::PathBuf> {
	fs::read_dir(root)
		.unwrap()
		.filter_map(|e| e.ok())
		.map(|e| e.path())
		.filter(|p| p.is_dir() && p.file_name().map(|n| n.len()) == Some(2))
		.collect()
}

#[test]
fn small_value_stays_in_db_tier_only() {
	let tmp = tempfile::tempdir().unwrap();
	let cache = Cache::open(tmp.path()).unwrap();
	let value = incompressible(512);
	cache.put(b"k", &value);

	let got = cache.get(b"k").unwrap();
	assert_eq!(&*got, &value[..]);
	assert!(two_hex_subdirs(tmp.path()).is_empty());
}

#[test]
fn large_incompressible_value_lands_in_fs_tier_at_documented_path() {
	let tmp = tempfile::tempdir().unwrap();
	let cache = Cache::open(tmp.path()).unwrap();
	let value = incompressible(64 * 1024);
	cache.put(b"big", &value);

	let got = cache.get(b"big").unwrap();
	assert_eq!(got.len(), value.len());

	let (dir, name) = digest_path(b"big");
	let path = tmp.path().join(&dir).join(&name);
	let on_disk = fs::metadata(&path).unwrap();
	// Envelope header plus payload; payload is at most the verbatim size
	// (wrap only keeps a compressed form when it's strictly smaller).
	assert!(on_disk.len() <= 8 + value.len() as u64);
	assert!(on_disk.len() > 8);
}

#[test]
fn migration_from_small_to_large_removes_db_entry_but_not_fs_readability() {
	let tmp = tempfile::tempdir().unwrap();
	let cache = Cache::open(tmp.path()).unwrap();
	cache.put(b"k", b"small value, stays under the db threshold easily");
	let big = incompressible(64 * 1024);
	cache.put(b"k", &big);

	let got = cache.get(b"k").unwrap();
	assert_eq!(got.len(), big.len());

	// Reopening forces every subsequent read through a fresh db.rs parse
	// of cache.db, so a stale small-tier entry would resurface here.
	drop(cache);
	let cache = Cache::open(tmp.path()).unwrap();
	let got = cache.get(b"k").unwrap();
	assert_eq!(got.len(), big.len());
}

#[test]
fn orphaned_temp_file_is_invisible_to_get_and_removed_by_clean() {
	env_logger::try_init().ok();
	let tmp = tempfile::tempdir().unwrap();
	let cache = Cache::open(tmp.path()).unwrap();

	let (dir, name) = digest_path(b"never-published");
	let dir_path = tmp.path().join(&dir);
	fs::create_dir_all(&dir_path).unwrap();
	let temp_path = dir_path.join(format!("{}.deadbeef0", name));
	fs::write(&temp_path, b"partial publish, crashed before rename").unwrap();
	let old = SystemTime::now() - std::time::Duration::from_secs(2 * 86400);
	let f = fs::File::open(&temp_path).unwrap();
	f.set_modified(old).unwrap();

	assert!(cache.get(b"never-published").is_none());

	cache.clean(1).unwrap();
	assert!(!temp_path.exists());
}

#[test]
fn age_based_cleanup_respects_day_threshold_across_reopen() {
	let tmp = tempfile::tempdir().unwrap();
	{
		let cache = Cache::open(tmp.path()).unwrap();
		cache.put(b"k", b"value old enough to expire soon");
	}

	// Backdate cache.db's own mtime doesn't matter: entries carry their
	// own day-index stamps, stamped relative to "now" at put time, which
	// was just now -- so clean(0 days) worth of margin would already
	// remove it, but clean requires days >= 1. Assert the rejection and
	// that a 1-day-old fresh entry survives a generous clean(7).
	let cache = Cache::open(tmp.path()).unwrap();
	assert!(cache.clean(0).is_err());
	cache.clean(7).unwrap();
	assert!(cache.get(b"k").is_some());
}

#[test]
fn content_addressing_matches_documented_digest_and_path_layout() {
	let (dir, name) = digest_path(b"hello");
	assert_eq!(dir.len(), 2);
	assert_eq!(name.len(), 38);

	let unix_day = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() / 86400;
	assert!(unix_day < u16::MAX as u64, "sanity check: day-index still fits in 16 bits today");
}
