// This file is part of flint-db.
//
// flint-db is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// flint-db is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

//! Keyspace (KS): sixteen (configurable) logical databases, each a map
//! from key bytes to `TypedValue` plus a parallel map from key bytes to
//! absolute millisecond expiration. Lazy expiration on read/write access
//! plus a bounded active-expiration sweep keep set-and-forget keys from
//! growing memory without bound (spec §4.2).

use crate::error::{Error, Result};
use crate::value::TypedValue;
use rand::seq::IteratorRandom;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Stats {
	pub hits: u64,
	pub misses: u64,
	pub expired_keys: u64,
	/// Counts every mutating keyspace operation. `AtomicU64` rather than a
	/// plain counter so its type matches the snapshot-at-fork contract in
	/// `Keyspace::snapshot_dirty_before_bgsave` byte-for-byte, even though
	/// the single-threaded command loop never contends on it concurrently.
	pub dirty: AtomicU64,
	/// Snapshot of `dirty` taken the moment a `BGSAVE`/rewrite child is
	/// forked, so a successful completion can subtract exactly the writes
	/// that made it into that snapshot rather than zeroing out writes that
	/// happened while the child was still running.
	pub dirty_before_bgsave: AtomicU64,
}

pub struct Database {
	data: HashMap<Vec<u8>, TypedValue>,
	expires: HashMap<Vec<u8>, u64>,
}

impl Default for Database {
	fn default() -> Database {
		Database { data: HashMap::new(), expires: HashMap::new() }
	}
}

/// Deletions produced by lazy or active expiration, which the caller must
/// propagate to AOF (as a synthetic `DEL`) and to any replica channel.
pub struct ExpiredKey {
	pub db: usize,
	pub key: Vec<u8>,
}

pub struct Keyspace {
	dbs: Vec<Database>,
	pub stats: Stats,
	pending_expired: Vec<ExpiredKey>,
	pub watch_touches: Vec<(usize, Vec<u8>)>,
}

impl Keyspace {
	pub fn new(num_dbs: usize) -> Keyspace {
		let mut dbs = Vec::with_capacity(num_dbs);
		dbs.resize_with(num_dbs, Database::default);
		Keyspace { dbs, stats: Stats::default(), pending_expired: Vec::new(), watch_touches: Vec::new() }
	}

	pub fn num_dbs(&self) -> usize {
		self.dbs.len()
	}

	pub fn dirty(&self) -> u64 {
		self.stats.dirty.load(Ordering::SeqCst)
	}

	/// Snapshot `dirty` into `dirty_before_bgsave`, called the moment a
	/// `BGSAVE`/rewrite child is forked (spec §5/§9's dirty-counter note).
	pub fn snapshot_dirty_before_bgsave(&self) -> u64 {
		let current = self.dirty();
		self.stats.dirty_before_bgsave.store(current, Ordering::SeqCst);
		current
	}

	/// Subtract the snapshot taken at fork time from `dirty`, called once a
	/// `BGSAVE`/rewrite completes successfully -- writes that landed after
	/// the snapshot (the child was still running) stay counted as dirty
	/// rather than being silently zeroed out.
	pub fn mark_bgsave_complete(&self) {
		let snapshot = self.stats.dirty_before_bgsave.load(Ordering::SeqCst);
		self.stats.dirty.fetch_sub(snapshot, Ordering::SeqCst);
	}

	/// Drains deletions produced by lazy/active expiration since the last
	/// call, for the caller to append to AOF / forward to replicas.
	pub fn drain_expired(&mut self) -> Vec<ExpiredKey> {
		std::mem::take(&mut self.pending_expired)
	}

	fn expire_if_due(&mut self, db: usize, key: &[u8], now_ms: u64) -> bool {
		let due = match self.dbs[db].expires.get(key) {
			Some(&deadline) if deadline <= now_ms => true,
			_ => false,
		};
		if due {
			self.dbs[db].data.remove(key);
			self.dbs[db].expires.remove(key);
			self.stats.expired_keys += 1;
			self.stats.dirty.fetch_add(1, Ordering::SeqCst);
			self.pending_expired.push(ExpiredKey { db, key: key.to_vec() });
		}
		due
	}

	pub fn lookup_read(&mut self, db: usize, key: &[u8], now_ms: u64) -> Option<&TypedValue> {
		self.expire_if_due(db, key, now_ms);
		let found = self.dbs[db].data.get(key);
		if found.is_some() {
			self.stats.hits += 1;
		} else {
			self.stats.misses += 1;
		}
		self.dbs[db].data.get(key)
	}

	pub fn lookup_write(&mut self, db: usize, key: &[u8], now_ms: u64) -> Option<&mut TypedValue> {
		self.expire_if_due(db, key, now_ms);
		self.dbs[db].data.get_mut(key)
	}

	pub fn exists(&mut self, db: usize, key: &[u8], now_ms: u64) -> bool {
		!self.expire_if_due(db, key, now_ms) && self.dbs[db].data.contains_key(key)
	}

	fn touch(&mut self, db: usize, key: &[u8]) {
		self.stats.dirty.fetch_add(1, Ordering::SeqCst);
		self.watch_touches.push((db, key.to_vec()));
	}

	pub fn insert(&mut self, db: usize, key: &[u8], value: TypedValue, now_ms: u64) -> Result<()> {
		self.expire_if_due(db, key, now_ms);
		if self.dbs[db].data.contains_key(key) {
			return Err(Error::KeyExists);
		}
		self.dbs[db].data.insert(key.to_vec(), value);
		self.touch(db, key);
		Ok(())
	}

	pub fn overwrite(&mut self, db: usize, key: &[u8], value: TypedValue, now_ms: u64) -> Result<()> {
		self.expire_if_due(db, key, now_ms);
		if !self.dbs[db].data.contains_key(key) {
			return Err(Error::NoKey);
		}
		self.dbs[db].data.insert(key.to_vec(), value);
		self.dbs[db].expires.remove(key);
		self.touch(db, key);
		Ok(())
	}

	/// SET-style upsert: insert if absent, overwrite (clearing any TTL) if
	/// present. Used by the command layer; does not itself appear in spec
	/// §4.2's contract list but is a thin composition of `insert`/
	/// `overwrite` kept here so callers don't duplicate the expiry dance.
	pub fn set(&mut self, db: usize, key: &[u8], value: TypedValue, now_ms: u64) {
		self.expire_if_due(db, key, now_ms);
		self.dbs[db].data.insert(key.to_vec(), value);
		self.dbs[db].expires.remove(key);
		self.touch(db, key);
	}

	pub fn delete(&mut self, db: usize, key: &[u8], now_ms: u64) -> bool {
		self.expire_if_due(db, key, now_ms);
		let removed = self.dbs[db].data.remove(key).is_some();
		self.dbs[db].expires.remove(key);
		if removed {
			self.touch(db, key);
		}
		removed
	}

	pub fn set_expiry(&mut self, db: usize, key: &[u8], deadline_ms: u64, now_ms: u64) -> Result<()> {
		self.expire_if_due(db, key, now_ms);
		if !self.dbs[db].data.contains_key(key) {
			return Err(Error::NoKey);
		}
		self.dbs[db].expires.insert(key.to_vec(), deadline_ms);
		self.touch(db, key);
		Ok(())
	}

	pub fn remove_expiry(&mut self, db: usize, key: &[u8]) -> bool {
		self.dbs[db].expires.remove(key).is_some()
	}

	pub fn get_expiry(&mut self, db: usize, key: &[u8], now_ms: u64) -> Option<u64> {
		self.expire_if_due(db, key, now_ms);
		self.dbs[db].expires.get(key).copied()
	}

	pub fn random_key(&mut self, db: usize, now_ms: u64) -> Option<Vec<u8>> {
		let mut rng = rand::thread_rng();
		for _ in 0..16 {
			let candidate = self.dbs[db].data.keys().choose(&mut rng).cloned();
			match candidate {
				None => return None,
				Some(k) => {
					if !self.expire_if_due(db, &k, now_ms) {
						return Some(k);
					}
				}
			}
		}
		None
	}

	pub fn dbsize(&self, db: usize) -> usize {
		self.dbs[db].data.len()
	}

	pub fn flushdb(&mut self, db: usize) {
		self.dbs[db].data.clear();
		self.dbs[db].expires.clear();
		self.stats.dirty.fetch_add(1, Ordering::SeqCst);
	}

	pub fn flushall(&mut self) {
		for db in &mut self.dbs {
			db.data.clear();
			db.expires.clear();
		}
		self.stats.dirty.fetch_add(1, Ordering::SeqCst);
	}

	/// Active expiration: sample up to `sample_size` keys with a deadline
	/// in each database and delete those already past due (spec §4.2).
	pub fn active_expire_cycle(&mut self, sample_size: usize, now_ms: u64) {
		for db in 0..self.dbs.len() {
			let candidates: Vec<Vec<u8>> = self.dbs[db]
				.expires
				.iter()
				.filter(|(_, &deadline)| deadline <= now_ms)
				.take(sample_size)
				.map(|(k, _)| k.clone())
				.collect();
			for key in candidates {
				self.expire_if_due(db, &key, now_ms);
			}
		}
	}

	/// Iterate every live (key, value) pair in a database, for RDB save.
	/// Already-expired keys are skipped without mutating state (the
	/// snapshot simply omits them, per spec §4.5).
	pub fn iter_live(&self, db: usize, now_ms: u64) -> impl Iterator<Item = (&Vec<u8>, &TypedValue, Option<u64>)> {
		self.dbs[db].data.iter().filter_map(move |(k, v)| {
			match self.dbs[db].expires.get(k) {
				Some(&deadline) if deadline <= now_ms => None,
				other => Some((k, v, other.copied())),
			}
		})
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::value::TypedValue;

	#[test]
	fn insert_then_duplicate_insert_fails() {
		let mut ks = Keyspace::new(1);
		ks.insert(0, b"a", TypedValue::new_string(b"1"), 0).unwrap();
		assert!(matches!(ks.insert(0, b"a", TypedValue::new_string(b"2"), 0), Err(Error::KeyExists)));
	}

	#[test]
	fn overwrite_requires_existing_key() {
		let mut ks = Keyspace::new(1);
		assert!(matches!(ks.overwrite(0, b"a", TypedValue::new_string(b"1"), 0), Err(Error::NoKey)));
		ks.insert(0, b"a", TypedValue::new_string(b"1"), 0).unwrap();
		ks.overwrite(0, b"a", TypedValue::new_string(b"2"), 0).unwrap();
	}

	#[test]
	fn lazy_expiration_removes_on_access() {
		let mut ks = Keyspace::new(1);
		ks.set(0, b"a", TypedValue::new_string(b"v"), 0);
		ks.set_expiry(0, b"a", 100, 0).unwrap();
		assert!(ks.lookup_read(0, b"a", 50).is_some());
		assert!(ks.lookup_read(0, b"a", 150).is_none());
		assert!(!ks.exists(0, b"a", 200));
		let expired = ks.drain_expired();
		assert_eq!(expired.len(), 1);
		assert_eq!(expired[0].key, b"a");
	}

	#[test]
	fn active_expire_cycle_sweeps_without_access() {
		let mut ks = Keyspace::new(1);
		for i in 0..5 {
			let key = format!("k{}", i).into_bytes();
			ks.set(0, &key, TypedValue::new_string(b"v"), 0);
			ks.set_expiry(0, &key, 10, 0).unwrap();
		}
		ks.active_expire_cycle(10, 1000);
		assert_eq!(ks.dbsize(0), 0);
	}

	#[test]
	fn hit_miss_counters_only_for_read() {
		let mut ks = Keyspace::new(1);
		ks.set(0, b"a", TypedValue::new_string(b"v"), 0);
		ks.lookup_read(0, b"a", 0);
		ks.lookup_write(0, b"missing", 0);
		assert_eq!(ks.stats.hits, 1);
		assert_eq!(ks.stats.misses, 0);
	}

	#[test]
	fn bgsave_completion_subtracts_the_fork_time_snapshot() {
		let mut ks = Keyspace::new(1);
		ks.set(0, b"a", TypedValue::new_string(b"v"), 0);
		let before_fork = ks.snapshot_dirty_before_bgsave();
		assert_eq!(before_fork, ks.dirty());

		// A write lands while the (simulated) child is still running.
		ks.set(0, b"b", TypedValue::new_string(b"v"), 0);
		let dirty_during_save = ks.dirty();
		assert!(dirty_during_save > before_fork);

		ks.mark_bgsave_complete();
		assert_eq!(ks.dirty(), dirty_during_save - before_fork);
	}
}
