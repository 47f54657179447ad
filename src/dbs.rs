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

//! Dynamic byte string: a binary-safe, length-prefixed mutable buffer with
//! amortized O(1) appends. Backed by `Vec<u8>`, whose growth doubling already
//! gives amortized O(1) push; this type adds the explicit preallocation and
//! trim behavior spec'd for the keyspace's string payloads.

const MAX_PREALLOC: usize = 1024 * 1024;

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct DynStr {
	buf: Vec<u8>,
}

impl DynStr {
	pub fn new() -> DynStr {
		DynStr { buf: Vec::new() }
	}

	pub fn from_slice(data: &[u8]) -> DynStr {
		DynStr { buf: data.to_vec() }
	}

	pub fn with_capacity(cap: usize) -> DynStr {
		DynStr { buf: Vec::with_capacity(cap) }
	}

	pub fn len(&self) -> usize {
		self.buf.len()
	}

	pub fn is_empty(&self) -> bool {
		self.buf.is_empty()
	}

	pub fn as_slice(&self) -> &[u8] {
		&self.buf
	}

	pub fn as_mut_slice(&mut self) -> &mut [u8] {
		&mut self.buf
	}

	/// Grow the buffer geometrically: doubling while small, capped growth
	/// increments once a string is large, mirroring the classic sds.c policy
	/// that avoids doubling multi-megabyte strings.
	fn grow_for(&mut self, additional: usize) {
		let needed = self.buf.len() + additional;
		if self.buf.capacity() >= needed {
			return;
		}
		let extra = if needed < MAX_PREALLOC { needed } else { additional + MAX_PREALLOC };
		self.buf.reserve(extra.saturating_sub(self.buf.len()));
	}

	pub fn append(&mut self, data: &[u8]) {
		self.grow_for(data.len());
		self.buf.extend_from_slice(data);
	}

	pub fn truncate(&mut self, new_len: usize) {
		self.buf.truncate(new_len);
	}

	/// In-place range overwrite, growing the buffer with zero padding if the
	/// range extends past the current length (SETRANGE-style semantics).
	pub fn set_range(&mut self, offset: usize, data: &[u8]) {
		let end = offset + data.len();
		if end > self.buf.len() {
			self.grow_for(end - self.buf.len());
			self.buf.resize(end, 0);
		}
		self.buf[offset..end].copy_from_slice(data);
	}

	pub fn into_vec(self) -> Vec<u8> {
		self.buf
	}
}

impl From<Vec<u8>> for DynStr {
	fn from(buf: Vec<u8>) -> DynStr {
		DynStr { buf }
	}
}

impl From<&[u8]> for DynStr {
	fn from(buf: &[u8]) -> DynStr {
		DynStr::from_slice(buf)
	}
}

impl AsRef<[u8]> for DynStr {
	fn as_ref(&self) -> &[u8] {
		&self.buf
	}
}

#[cfg(test)]
mod test {
	use super::DynStr;

	#[test]
	fn append_grows_and_preserves_content() {
		let mut s = DynStr::new();
		s.append(b"hello");
		s.append(b" world");
		assert_eq!(s.as_slice(), b"hello world");
		assert_eq!(s.len(), 11);
	}

	#[test]
	fn set_range_pads_with_zeros() {
		let mut s = DynStr::from_slice(b"abc");
		s.set_range(5, b"xy");
		assert_eq!(s.as_slice(), b"abc\0\0xy");
	}

	#[test]
	fn truncate_shrinks() {
		let mut s = DynStr::from_slice(b"abcdef");
		s.truncate(3);
		assert_eq!(s.as_slice(), b"abc");
	}
}
