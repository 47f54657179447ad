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

//! Typed value (TV): the polymorphic reference-counted cell holding one
//! logical datum. Every logical type starts in a compact "small" encoding
//! and transitions one-way to a "large" encoding once a configured
//! threshold is exceeded (spec §4.1). Reference counting models the shared
//! small-integer/canned-reply pool from spec §5/§9.

use crate::config::EncodingLimits;
use crate::dbs::DynStr;
use crate::error::{Error, Result};
use crate::intset::IntSet;
use crate::packed_list::{ListEntry, PackedList};
use crate::zset::ZSet;
use std::cell::Cell;
use std::collections::HashMap;
use std::rc::Rc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueType {
	String,
	List,
	Set,
	Hash,
	Zset,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Encoding {
	Raw,
	Int,
	PackedList,
	LinkedList,
	IntSet,
	HashTable,
	SkipList,
}

pub enum StringPayload {
	Raw(DynStr),
	Int(i64),
}

pub enum ListPayload {
	Packed(PackedList),
	Linked(std::collections::VecDeque<Vec<u8>>),
}

pub enum SetPayload {
	Ints(IntSet),
	Table(std::collections::HashSet<Vec<u8>>),
}

pub enum HashPayload {
	Packed(PackedList),
	Table(HashMap<Vec<u8>, Vec<u8>>),
}

pub enum ZsetPayload {
	Packed(PackedList),
	Skip(ZSet),
}

pub enum Payload {
	String(StringPayload),
	List(ListPayload),
	Set(SetPayload),
	Hash(HashPayload),
	Zset(ZsetPayload),
}

/// A reference-counted, polymorphic cell. Cloning a `TypedValue` bumps the
/// reference count rather than deep-copying; `make_writable` on the string
/// payload performs the copy-on-write spec §4.1/§9 require before any
/// mutation of a shared value.
pub struct TypedValue {
	payload: Rc<std::cell::RefCell<Payload>>,
	refs: Rc<Cell<u32>>,
	pub last_access: Cell<u32>,
	shared: bool,
}

impl Clone for TypedValue {
	fn clone(&self) -> TypedValue {
		self.refs.set(self.refs.get() + 1);
		TypedValue {
			payload: self.payload.clone(),
			refs: self.refs.clone(),
			last_access: Cell::new(self.last_access.get()),
			shared: self.shared,
		}
	}
}

impl TypedValue {
	fn wrap(payload: Payload) -> TypedValue {
		TypedValue {
			payload: Rc::new(std::cell::RefCell::new(payload)),
			refs: Rc::new(Cell::new(1)),
			last_access: Cell::new(0),
			shared: false,
		}
	}

	pub fn ref_count(&self) -> u32 {
		self.refs.get()
	}

	pub fn is_shared(&self) -> bool {
		self.shared
	}

	/// Build a value from the process-wide shared pool; writers must copy
	/// on touch (see `make_writable`) and must never mutate it in place -
	/// a debug assertion trips if they try.
	pub fn new_shared_int(i: i64) -> TypedValue {
		let mut v = TypedValue::wrap(Payload::String(StringPayload::Int(i)));
		v.shared = true;
		v
	}

	/// Clone an entry out of a pre-built shared-integer pool when `i` falls
	/// inside it, falling back to a fresh private value otherwise. `pool` is
	/// expected to be indexed by value, as built by `new_shared_int(0..N)`.
	pub fn shared_or_new_int(pool: &[TypedValue], i: i64) -> TypedValue {
		if i >= 0 && (i as usize) < pool.len() {
			pool[i as usize].clone()
		} else {
			TypedValue::new_int(i)
		}
	}

	pub fn value_type(&self) -> ValueType {
		match &*self.payload.borrow() {
			Payload::String(_) => ValueType::String,
			Payload::List(_) => ValueType::List,
			Payload::Set(_) => ValueType::Set,
			Payload::Hash(_) => ValueType::Hash,
			Payload::Zset(_) => ValueType::Zset,
		}
	}

	pub fn encoding(&self) -> Encoding {
		match &*self.payload.borrow() {
			Payload::String(StringPayload::Raw(_)) => Encoding::Raw,
			Payload::String(StringPayload::Int(_)) => Encoding::Int,
			Payload::List(ListPayload::Packed(_)) => Encoding::PackedList,
			Payload::List(ListPayload::Linked(_)) => Encoding::LinkedList,
			Payload::Set(SetPayload::Ints(_)) => Encoding::IntSet,
			Payload::Set(SetPayload::Table(_)) => Encoding::HashTable,
			Payload::Hash(HashPayload::Packed(_)) => Encoding::PackedList,
			Payload::Hash(HashPayload::Table(_)) => Encoding::HashTable,
			Payload::Zset(ZsetPayload::Packed(_)) => Encoding::PackedList,
			Payload::Zset(ZsetPayload::Skip(_)) => Encoding::SkipList,
		}
	}

	fn expect_type(&self, t: ValueType) -> Result<()> {
		if self.value_type() == t { Ok(()) } else { Err(Error::WrongType) }
	}

	// ---- string ----

	pub fn new_string(data: &[u8]) -> TypedValue {
		match parse_int_exact(data) {
			Some(i) => TypedValue::wrap(Payload::String(StringPayload::Int(i))),
			None => TypedValue::wrap(Payload::String(StringPayload::Raw(DynStr::from_slice(data)))),
		}
	}

	pub fn new_int(i: i64) -> TypedValue {
		TypedValue::wrap(Payload::String(StringPayload::Int(i)))
	}

	pub fn string_bytes(&self) -> Result<Vec<u8>> {
		self.expect_type(ValueType::String)?;
		Ok(match &*self.payload.borrow() {
			Payload::String(StringPayload::Raw(s)) => s.as_slice().to_vec(),
			Payload::String(StringPayload::Int(i)) => i.to_string().into_bytes(),
			_ => unreachable!(),
		})
	}

	pub fn as_integer(&self) -> Result<Option<i64>> {
		self.expect_type(ValueType::String)?;
		Ok(match &*self.payload.borrow() {
			Payload::String(StringPayload::Int(i)) => Some(*i),
			Payload::String(StringPayload::Raw(s)) => parse_int_exact(s.as_slice()),
			_ => unreachable!(),
		})
	}

	/// INCR/DECR-style arithmetic directly on the integer payload, without
	/// reparsing text (spec §4.1). Materializes a private copy first if the
	/// value is shared, the same as any other in-place string mutation.
	pub fn incr_by(&mut self, delta: i64) -> Result<i64> {
		self.expect_type(ValueType::String)?;
		let cur = self.as_integer()?.ok_or(Error::OutOfRange)?;
		let new_val = cur.checked_add(delta).ok_or(Error::OutOfRange)?;
		if self.shared || self.refs.get() > 1 {
			*self = TypedValue::new_int(new_val);
		} else {
			*self.payload.borrow_mut() = Payload::String(StringPayload::Int(new_val));
		}
		Ok(new_val)
	}

	/// Materialize a private, mutable `DynStr` copy before any in-place
	/// mutation, per spec §4.1: "An attempt to append or otherwise mutate a
	/// shared or integer-encoded string MUST first materialize a private
	/// DBS copy." Returns an error on a value that isn't a string.
	pub fn make_writable_string(&mut self) -> Result<()> {
		self.expect_type(ValueType::String)?;
		debug_assert!(!self.shared || self.refs.get() >= 1, "shared constant touched without copy-on-write");
		if self.shared || self.refs.get() > 1 {
			let bytes = self.string_bytes()?;
			*self = TypedValue::wrap(Payload::String(StringPayload::Raw(DynStr::from_slice(&bytes))));
			return Ok(());
		}
		let mut p = self.payload.borrow_mut();
		if let Payload::String(StringPayload::Int(i)) = &*p {
			*p = Payload::String(StringPayload::Raw(DynStr::from_slice(i.to_string().as_bytes())));
		}
		Ok(())
	}

	pub fn append_string(&mut self, data: &[u8]) -> Result<usize> {
		self.make_writable_string()?;
		let mut p = self.payload.borrow_mut();
		if let Payload::String(StringPayload::Raw(s)) = &mut *p {
			s.append(data);
			Ok(s.len())
		} else {
			unreachable!()
		}
	}

	// ---- list ----

	pub fn new_list() -> TypedValue {
		TypedValue::wrap(Payload::List(ListPayload::Packed(PackedList::new())))
	}

	pub fn list_len(&self) -> Result<usize> {
		self.expect_type(ValueType::List)?;
		Ok(match &*self.payload.borrow() {
			Payload::List(ListPayload::Packed(p)) => p.count() as usize,
			Payload::List(ListPayload::Linked(l)) => l.len(),
			_ => unreachable!(),
		})
	}

	pub fn list_push(&mut self, data: &[u8], front: bool, limits: &EncodingLimits) -> Result<usize> {
		self.expect_type(ValueType::List)?;
		let mut p = self.payload.borrow_mut();
		if let Payload::List(ListPayload::Packed(pl)) = &mut *p {
			let entry = ListEntry::from_bytes(data);
			let would_exceed_count = pl.count() as usize + 1 > limits.list_max_entries;
			let would_exceed_size = PackedList::serialized_entry_bytes(&entry) > limits.list_max_value_bytes;
			if would_exceed_count || would_exceed_size {
				let mut linked: std::collections::VecDeque<Vec<u8>> = pl.iter().map(|e| e.as_bytes()).collect();
				if front {
					linked.push_front(data.to_vec());
				} else {
					linked.push_back(data.to_vec());
				}
				let len = linked.len();
				*p = Payload::List(ListPayload::Linked(linked));
				return Ok(len);
			}
			if front {
				pl.push_front(entry);
			} else {
				pl.push_back(entry);
			}
			return Ok(pl.count() as usize);
		}
		if let Payload::List(ListPayload::Linked(l)) = &mut *p {
			if front {
				l.push_front(data.to_vec());
			} else {
				l.push_back(data.to_vec());
			}
			return Ok(l.len());
		}
		unreachable!()
	}

	pub fn list_pop(&mut self, front: bool) -> Result<Option<Vec<u8>>> {
		self.expect_type(ValueType::List)?;
		let mut p = self.payload.borrow_mut();
		Ok(match &mut *p {
			Payload::List(ListPayload::Packed(pl)) => {
				let entry = if front { pl.pop_front() } else { pl.pop_back() };
				entry.map(|e| e.as_bytes())
			}
			Payload::List(ListPayload::Linked(l)) => if front { l.pop_front() } else { l.pop_back() },
			_ => unreachable!(),
		})
	}

	pub fn list_items(&self) -> Result<Vec<Vec<u8>>> {
		self.expect_type(ValueType::List)?;
		Ok(match &*self.payload.borrow() {
			Payload::List(ListPayload::Packed(pl)) => pl.iter().map(|e| e.as_bytes()).collect(),
			Payload::List(ListPayload::Linked(l)) => l.iter().cloned().collect(),
			_ => unreachable!(),
		})
	}

	// ---- set ----

	pub fn new_set() -> TypedValue {
		TypedValue::wrap(Payload::Set(SetPayload::Ints(IntSet::new())))
	}

	pub fn set_add(&mut self, member: &[u8], limits: &EncodingLimits) -> Result<bool> {
		self.expect_type(ValueType::Set)?;
		let mut p = self.payload.borrow_mut();
		let as_int = parse_int_exact(member);
		if let Payload::Set(SetPayload::Ints(is)) = &mut *p {
			match as_int {
				Some(i) if is.len() + 1 <= limits.set_max_entries => return Ok(is.insert(i)),
				_ => {
					let mut table: std::collections::HashSet<Vec<u8>> = is.iter().map(|i| i.to_string().into_bytes()).collect();
					let inserted = table.insert(member.to_vec());
					*p = Payload::Set(SetPayload::Table(table));
					return Ok(inserted);
				}
			}
		}
		if let Payload::Set(SetPayload::Table(t)) = &mut *p {
			return Ok(t.insert(member.to_vec()));
		}
		unreachable!()
	}

	pub fn set_members(&self) -> Result<Vec<Vec<u8>>> {
		self.expect_type(ValueType::Set)?;
		Ok(match &*self.payload.borrow() {
			Payload::Set(SetPayload::Ints(is)) => is.iter().map(|i| i.to_string().into_bytes()).collect(),
			Payload::Set(SetPayload::Table(t)) => t.iter().cloned().collect(),
			_ => unreachable!(),
		})
	}

	pub fn set_len(&self) -> Result<usize> {
		self.expect_type(ValueType::Set)?;
		Ok(match &*self.payload.borrow() {
			Payload::Set(SetPayload::Ints(is)) => is.len(),
			Payload::Set(SetPayload::Table(t)) => t.len(),
			_ => unreachable!(),
		})
	}

	// ---- hash ----

	pub fn new_hash() -> TypedValue {
		TypedValue::wrap(Payload::Hash(HashPayload::Packed(PackedList::new())))
	}

	pub fn hash_set(&mut self, field: &[u8], value: &[u8], limits: &EncodingLimits) -> Result<bool> {
		self.expect_type(ValueType::Hash)?;
		let mut p = self.payload.borrow_mut();
		if let Payload::Hash(HashPayload::Packed(pl)) = &mut *p {
			let mut table: HashMap<Vec<u8>, Vec<u8>> = HashMap::new();
			{
				let mut it = pl.iter();
				while let (Some(f), Some(v)) = (it.next(), it.next()) {
					table.insert(f.as_bytes(), v.as_bytes());
				}
			}
			let is_new = !table.contains_key(field);
			table.insert(field.to_vec(), value.to_vec());
			let exceeds = table.len() > limits.hash_max_entries
				|| field.len() > limits.hash_max_value_bytes
				|| value.len() > limits.hash_max_value_bytes;
			if exceeds {
				*p = Payload::Hash(HashPayload::Table(table));
			} else {
				let mut rebuilt = PackedList::new();
				for (f, v) in table {
					rebuilt.push_back(ListEntry::from_bytes(&f));
					rebuilt.push_back(ListEntry::from_bytes(&v));
				}
				*p = Payload::Hash(HashPayload::Packed(rebuilt));
			}
			return Ok(is_new);
		}
		if let Payload::Hash(HashPayload::Table(t)) = &mut *p {
			return Ok(t.insert(field.to_vec(), value.to_vec()).is_none());
		}
		unreachable!()
	}

	pub fn hash_get(&self, field: &[u8]) -> Result<Option<Vec<u8>>> {
		self.expect_type(ValueType::Hash)?;
		Ok(match &*self.payload.borrow() {
			Payload::Hash(HashPayload::Packed(pl)) => {
				let mut it = pl.iter();
				let mut found = None;
				while let (Some(f), Some(v)) = (it.next(), it.next()) {
					if f.as_bytes() == field {
						found = Some(v.as_bytes());
						break;
					}
				}
				found
			}
			Payload::Hash(HashPayload::Table(t)) => t.get(field).cloned(),
			_ => unreachable!(),
		})
	}

	pub fn hash_len(&self) -> Result<usize> {
		self.expect_type(ValueType::Hash)?;
		Ok(match &*self.payload.borrow() {
			Payload::Hash(HashPayload::Packed(pl)) => pl.count() as usize / 2,
			Payload::Hash(HashPayload::Table(t)) => t.len(),
			_ => unreachable!(),
		})
	}

	/// All field/value pairs, for snapshot and replication use (spec §4.5).
	pub fn hash_items(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
		self.expect_type(ValueType::Hash)?;
		Ok(match &*self.payload.borrow() {
			Payload::Hash(HashPayload::Packed(pl)) => {
				let mut it = pl.iter();
				let mut out = Vec::new();
				while let (Some(f), Some(v)) = (it.next(), it.next()) {
					out.push((f.as_bytes(), v.as_bytes()));
				}
				out
			}
			Payload::Hash(HashPayload::Table(t)) => t.iter().map(|(f, v)| (f.clone(), v.clone())).collect(),
			_ => unreachable!(),
		})
	}

	// ---- zset ----

	pub fn new_zset() -> TypedValue {
		TypedValue::wrap(Payload::Zset(ZsetPayload::Packed(PackedList::new())))
	}

	pub fn zset_add(&mut self, member: &[u8], score: f64, limits: &EncodingLimits) -> Result<bool> {
		self.expect_type(ValueType::Zset)?;
		let mut p = self.payload.borrow_mut();
		if let Payload::Zset(ZsetPayload::Packed(pl)) = &mut *p {
			let mut zs = ZSet::new();
			{
				let mut it = pl.iter();
				while let (Some(m), Some(s)) = (it.next(), it.next()) {
					let score: f64 = std::str::from_utf8(&s.as_bytes()).unwrap().parse().unwrap_or(0.0);
					zs.insert(m.as_bytes(), score);
				}
			}
			let is_new = zs.score(member).is_none();
			zs.insert(member.to_vec(), score);
			let exceeds = zs.len() > limits.zset_max_entries || member.len() > limits.zset_max_value_bytes;
			if exceeds {
				*p = Payload::Zset(ZsetPayload::Skip(zs));
			} else {
				let mut rebuilt = PackedList::new();
				for (m, s) in zs.iter_ascending() {
					rebuilt.push_back(ListEntry::from_bytes(m));
					rebuilt.push_back(ListEntry::Str(format_score(s)));
				}
				*p = Payload::Zset(ZsetPayload::Packed(rebuilt));
			}
			return Ok(is_new);
		}
		if let Payload::Zset(ZsetPayload::Skip(zs)) = &mut *p {
			let is_new = zs.score(member).is_none();
			zs.insert(member.to_vec(), score);
			return Ok(is_new);
		}
		unreachable!()
	}

	pub fn zset_score(&self, member: &[u8]) -> Result<Option<f64>> {
		self.expect_type(ValueType::Zset)?;
		Ok(match &*self.payload.borrow() {
			Payload::Zset(ZsetPayload::Packed(pl)) => {
				let mut it = pl.iter();
				let mut found = None;
				while let (Some(m), Some(s)) = (it.next(), it.next()) {
					if m.as_bytes() == member {
						found = std::str::from_utf8(&s.as_bytes()).unwrap().parse().ok();
						break;
					}
				}
				found
			}
			Payload::Zset(ZsetPayload::Skip(zs)) => zs.score(member),
			_ => unreachable!(),
		})
	}

	pub fn zset_len(&self) -> Result<usize> {
		self.expect_type(ValueType::Zset)?;
		Ok(match &*self.payload.borrow() {
			Payload::Zset(ZsetPayload::Packed(pl)) => pl.count() as usize / 2,
			Payload::Zset(ZsetPayload::Skip(zs)) => zs.len(),
			_ => unreachable!(),
		})
	}

	pub fn zset_range(&self, start: i64, stop: i64) -> Result<Vec<(Vec<u8>, f64)>> {
		self.expect_type(ValueType::Zset)?;
		let all: Vec<(Vec<u8>, f64)> = match &*self.payload.borrow() {
			Payload::Zset(ZsetPayload::Packed(pl)) => {
				let mut it = pl.iter();
				let mut out = Vec::new();
				while let (Some(m), Some(s)) = (it.next(), it.next()) {
					let score: f64 = std::str::from_utf8(&s.as_bytes()).unwrap().parse().unwrap_or(0.0);
					out.push((m.as_bytes(), score));
				}
				out
			}
			Payload::Zset(ZsetPayload::Skip(zs)) => zs.iter_ascending().map(|(m, s)| (m.to_vec(), s)).collect(),
			_ => unreachable!(),
		};
		Ok(normalize_range(all, start, stop))
	}
}

fn normalize_range(all: Vec<(Vec<u8>, f64)>, start: i64, stop: i64) -> Vec<(Vec<u8>, f64)> {
	let len = all.len() as i64;
	if len == 0 {
		return Vec::new();
	}
	let norm = |i: i64| -> i64 {
		if i < 0 { (len + i).max(0) } else { i }
	};
	let start = norm(start).min(len - 1).max(0);
	let stop = norm(stop).min(len - 1);
	if stop < start {
		return Vec::new();
	}
	all[start as usize..=stop as usize].to_vec()
}

fn format_score(s: f64) -> Vec<u8> {
	format!("{:.17}", s).into_bytes()
}

pub fn parse_int_exact(data: &[u8]) -> Option<i64> {
	if data.is_empty() || data.len() > 20 {
		return None;
	}
	let s = std::str::from_utf8(data).ok()?;
	let v: i64 = s.parse().ok()?;
	if v.to_string() == s { Some(v) } else { None }
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::config::EncodingLimits;

	#[test]
	fn string_int_fast_path() {
		let mut v = TypedValue::new_string(b"41");
		assert_eq!(v.encoding(), Encoding::Int);
		assert_eq!(v.incr_by(1).unwrap(), 42);
		assert_eq!(v.string_bytes().unwrap(), b"42");
	}

	#[test]
	fn shared_string_copies_on_write() {
		let mut shared = TypedValue::new_shared_int(7);
		let clone = shared.clone();
		assert_eq!(clone.ref_count(), 2);
		shared.make_writable_string().unwrap();
		assert_eq!(shared.string_bytes().unwrap(), b"7");
		assert_eq!(clone.string_bytes().unwrap(), b"7");
	}

	#[test]
	fn incrementing_a_shared_value_does_not_mutate_other_holders() {
		let pool = vec![TypedValue::new_shared_int(0)];
		let mut a = TypedValue::shared_or_new_int(&pool, 0);
		let b = TypedValue::shared_or_new_int(&pool, 0);
		assert_eq!(a.incr_by(5).unwrap(), 5);
		assert_eq!(a.string_bytes().unwrap(), b"5");
		assert_eq!(b.string_bytes().unwrap(), b"0");
		assert_eq!(pool[0].string_bytes().unwrap(), b"0");
	}

	#[test]
	fn wrong_type_is_rejected() {
		let v = TypedValue::new_list();
		assert!(matches!(v.as_integer(), Err(Error::WrongType)));
	}

	#[test]
	fn list_transitions_to_linked_past_threshold() {
		let limits = EncodingLimits { list_max_entries: 4, ..EncodingLimits::default() };
		let mut v = TypedValue::new_list();
		for i in 0..4 {
			v.list_push(format!("{}", i).as_bytes(), false, &limits).unwrap();
		}
		assert_eq!(v.encoding(), Encoding::PackedList);
		v.list_push(b"overflow", false, &limits).unwrap();
		assert_eq!(v.encoding(), Encoding::LinkedList);
		// Encoding transitions are one-way: further small writes don't revert.
		v.list_pop(true).unwrap();
		v.list_pop(true).unwrap();
		v.list_pop(true).unwrap();
		assert_eq!(v.encoding(), Encoding::LinkedList);
	}

	#[test]
	fn zset_transitions_to_skiplist_past_threshold() {
		let limits = EncodingLimits { zset_max_entries: 4, ..EncodingLimits::default() };
		let mut v = TypedValue::new_zset();
		for i in 0..5 {
			v.zset_add(format!("m{}", i).as_bytes(), i as f64, &limits).unwrap();
		}
		assert_eq!(v.encoding(), Encoding::SkipList);
	}
}
