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

use crate::db;

/// Tunables a caller may reasonably want to override at `Cache::open`
/// time. Everything else (envelope threshold, tiny-value compression
/// cutoff, blocked signal set) is a fixed constant, matching the
/// original's `#define`s.
#[derive(Clone, Debug)]
pub struct CacheOptions {
	/// Number of buckets in the embedded DB's hash table, fixed for the
	/// lifetime of the on-disk `cache.db` file once created.
	pub bucket_count: u64,
}

impl Default for CacheOptions {
	fn default() -> CacheOptions {
		CacheOptions { bucket_count: db::DEFAULT_BUCKET_COUNT }
	}
}
