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

//! The critical-section guard: directory advisory lock + blocked signal
//! mask + umask override, bracketing every mutating DB/FS operation
//! (shared lock and no umask override for reads).
//!
//! The embedded DB's page cache may write dirty pages on a read, so reads
//! are protected from signal interruption too, just with a shared rather
//! than an exclusive directory lock.
//!
//! Modeled as a scoped RAII guard rather than hand-paired
//! block/unblock calls: every exit path, including early returns on
//! error, restores signal mask and releases the lock.

use fs2::FileExt;
use std::fs::File;
use std::io;
use std::mem::MaybeUninit;

/// Signals blocked for the duration of a critical section, matching the
/// original C implementation's choice: delivery is deferred, never
/// dropped, until the section ends.
const BLOCKED_SIGNALS: [libc::c_int; 5] =
	[libc::SIGHUP, libc::SIGINT, libc::SIGQUIT, libc::SIGPIPE, libc::SIGTERM];

fn blocked_sigset() -> libc::sigset_t {
	unsafe {
		let mut set = MaybeUninit::<libc::sigset_t>::uninit();
		libc::sigemptyset(set.as_mut_ptr());
		let mut set = set.assume_init();
		for &sig in &BLOCKED_SIGNALS {
			libc::sigaddset(&mut set, sig);
		}
		set
	}
}

fn retry_eintr<T>(mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
	loop {
		match op() {
			Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
			other => return other,
		}
	}
}

/// RAII guard for a directory-scoped critical section. Dropping it
/// restores the signal mask and, if a umask override was installed,
/// restores the caller's umask, then releases the directory lock -- in
/// that order, the reverse of acquisition.
pub struct CriticalSection<'a> {
	dir: &'a File,
	old_mask: libc::sigset_t,
	old_umask: Option<libc::mode_t>,
}

impl<'a> CriticalSection<'a> {
	/// Acquire a shared lock for a read-only operation. No umask
	/// override: reads never create files.
	pub fn shared(dir: &'a File) -> CriticalSection<'a> {
		if let Err(e) = retry_eintr(|| dir.lock_shared()) {
			log::warn!(target: "blobcache", "LOCK_SH: {}", e);
		}
		let old_mask = block_signals();
		CriticalSection { dir, old_mask, old_umask: None }
	}

	/// Acquire an exclusive lock for a mutating operation, with the
	/// cache's umask override installed so newly created files and
	/// directories are group-readable regardless of the caller's umask.
	pub fn exclusive(dir: &'a File, umask: libc::mode_t) -> CriticalSection<'a> {
		if let Err(e) = retry_eintr(|| dir.lock_exclusive()) {
			log::warn!(target: "blobcache", "LOCK_EX: {}", e);
		}
		let old_mask = block_signals();
		let old_umask = unsafe { libc::umask(umask) };
		CriticalSection { dir, old_mask, old_umask: Some(old_umask) }
	}
}

fn block_signals() -> libc::sigset_t {
	let set = blocked_sigset();
	unsafe {
		let mut old = MaybeUninit::<libc::sigset_t>::uninit();
		if libc::sigprocmask(libc::SIG_BLOCK, &set, old.as_mut_ptr()) != 0 {
			log::warn!(target: "blobcache", "SIG_BLOCK: {}", io::Error::last_os_error());
		}
		old.assume_init()
	}
}

impl<'a> Drop for CriticalSection<'a> {
	fn drop(&mut self) {
		if let Some(old_umask) = self.old_umask {
			unsafe {
				libc::umask(old_umask);
			}
		}
		unsafe {
			if libc::sigprocmask(libc::SIG_SETMASK, &self.old_mask, std::ptr::null_mut()) != 0 {
				log::warn!(target: "blobcache", "SIG_SETMASK: {}", io::Error::last_os_error());
			}
		}
		if let Err(e) = self.dir.unlock() {
			log::warn!(target: "blobcache", "LOCK_UN: {}", e);
		}
	}
}
