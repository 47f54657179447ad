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

//! Per-connection client state: the input buffer fed to the protocol
//! parser, and the reply buffering pipeline of spec §4.4 -- a fixed-size
//! static buffer plus a list of spillover chunks, with a deferred-length
//! placeholder for replies whose size prefix is only known after the body
//! is produced.

use std::os::unix::io::RawFd;

pub const STATIC_BUF_SIZE: usize = 16 * 1024;
const CHUNK_MERGE_THRESHOLD: usize = 16 * 1024;

enum Chunk {
	Data(Vec<u8>),
	/// Reserved space for a length prefix the caller will fill in once it
	/// knows the final reply size (e.g. a multi-bulk whose item count is
	/// discovered while iterating a collection).
	Placeholder(Vec<u8>),
}

pub struct OutputBuffer {
	static_buf: Vec<u8>,
	chunks: Vec<Chunk>,
}

impl Default for OutputBuffer {
	fn default() -> OutputBuffer {
		OutputBuffer { static_buf: Vec::with_capacity(STATIC_BUF_SIZE), chunks: Vec::new() }
	}
}

impl OutputBuffer {
	pub fn append(&mut self, data: &[u8]) {
		if self.chunks.is_empty() && self.static_buf.len() + data.len() <= STATIC_BUF_SIZE {
			self.static_buf.extend_from_slice(data);
			return;
		}
		match self.chunks.last_mut() {
			Some(Chunk::Data(d)) if d.len() + data.len() <= CHUNK_MERGE_THRESHOLD => {
				d.extend_from_slice(data);
			}
			_ => self.chunks.push(Chunk::Data(data.to_vec())),
		}
	}

	/// Reserve a placeholder the caller can later fill in with
	/// `fill_placeholder`, fused into the preceding/following chunk once
	/// flushed.
	pub fn reserve_placeholder(&mut self) -> usize {
		self.chunks.push(Chunk::Placeholder(Vec::new()));
		self.chunks.len() - 1
	}

	pub fn fill_placeholder(&mut self, token: usize, data: &[u8]) {
		if let Some(Chunk::Placeholder(slot)) = self.chunks.get_mut(token) {
			*slot = data.to_vec();
		}
	}

	pub fn total_len(&self) -> usize {
		self.static_buf.len()
			+ self
				.chunks
				.iter()
				.map(|c| match c {
					Chunk::Data(d) => d.len(),
					Chunk::Placeholder(d) => d.len(),
				})
				.sum::<usize>()
	}

	pub fn is_empty(&self) -> bool {
		self.static_buf.is_empty() && self.chunks.is_empty()
	}

	/// Drain up to `quota` bytes for the write handler, static buffer
	/// first, then chunks in order, so no single client can monopolize the
	/// loop with one giant reply (spec §4.4).
	pub fn drain_up_to(&mut self, quota: usize) -> Vec<u8> {
		let mut out = Vec::with_capacity(quota.min(self.total_len()));
		let take = quota.min(self.static_buf.len());
		out.extend_from_slice(&self.static_buf[0..take]);
		self.static_buf.drain(0..take);
		let mut remaining = quota - take;
		while remaining > 0 && !self.chunks.is_empty() {
			let data_len = match &self.chunks[0] {
				Chunk::Data(d) => d.len(),
				Chunk::Placeholder(d) => d.len(),
			};
			if data_len <= remaining {
				let chunk = self.chunks.remove(0);
				let data = match chunk {
					Chunk::Data(d) => d,
					Chunk::Placeholder(d) => d,
				};
				remaining -= data.len();
				out.extend_from_slice(&data);
			} else {
				let (front, back) = match &mut self.chunks[0] {
					Chunk::Data(d) => (d[0..remaining].to_vec(), d.split_off(remaining)),
					Chunk::Placeholder(d) => (d[0..remaining].to_vec(), d.split_off(remaining)),
				};
				self.chunks[0] = Chunk::Data(back);
				out.extend_from_slice(&front);
				remaining = 0;
			}
		}
		out
	}
}

pub enum CloseReason {
	Graceful,
	ProtocolError,
	BufferLimitExceeded,
}

pub struct Client {
	pub fd: RawFd,
	pub db: usize,
	pub input: Vec<u8>,
	pub output: OutputBuffer,
	pub pending_close: Option<CloseReason>,
	over_soft_limit_since: Option<u64>,
	pub watched_keys: Vec<(usize, Vec<u8>)>,
}

impl Client {
	pub fn new(fd: RawFd) -> Client {
		Client {
			fd,
			db: 0,
			input: Vec::new(),
			output: OutputBuffer::default(),
			pending_close: None,
			over_soft_limit_since: None,
			watched_keys: Vec::new(),
		}
	}

	/// Enforce the hard/soft output buffer limits of spec §4.4. `now_ms`
	/// drives the "longer than N seconds over the soft limit" rule.
	pub fn check_output_limits(&mut self, hard: usize, soft: usize, soft_seconds: u64, now_ms: u64) {
		let len = self.output.total_len();
		if len > hard {
			self.pending_close = Some(CloseReason::BufferLimitExceeded);
			return;
		}
		if len > soft {
			let since = *self.over_soft_limit_since.get_or_insert(now_ms);
			if now_ms.saturating_sub(since) > soft_seconds * 1000 {
				self.pending_close = Some(CloseReason::BufferLimitExceeded);
			}
		} else {
			self.over_soft_limit_since = None;
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn small_replies_stay_in_static_buffer() {
		let mut ob = OutputBuffer::default();
		ob.append(b"+OK\r\n");
		assert_eq!(ob.total_len(), 5);
		assert_eq!(ob.drain_up_to(5), b"+OK\r\n");
		assert!(ob.is_empty());
	}

	#[test]
	fn overflow_spills_into_chunks_and_merges() {
		let mut ob = OutputBuffer::default();
		ob.append(&vec![b'a'; STATIC_BUF_SIZE]);
		ob.append(b"tail1");
		ob.append(b"tail2");
		assert_eq!(ob.total_len(), STATIC_BUF_SIZE + 10);
	}

	#[test]
	fn drain_respects_quota() {
		let mut ob = OutputBuffer::default();
		ob.append(b"0123456789");
		let first = ob.drain_up_to(4);
		assert_eq!(first, b"0123");
		let second = ob.drain_up_to(100);
		assert_eq!(second, b"456789");
		assert!(ob.is_empty());
	}

	#[test]
	fn placeholder_is_filled_and_flushed_in_order() {
		let mut ob = OutputBuffer::default();
		ob.append(&vec![b'a'; STATIC_BUF_SIZE]); // force spill to chunks
		let token = ob.reserve_placeholder();
		ob.append(b"body");
		ob.fill_placeholder(token, b"$4\r\n");
		let all = ob.drain_up_to(ob.total_len());
		assert!(all.ends_with(b"$4\r\nbody"));
	}

	#[test]
	fn hard_limit_schedules_close() {
		let mut c = Client::new(3);
		c.output.append(&vec![b'x'; 100]);
		c.check_output_limits(50, 10, 60, 0);
		assert!(matches!(c.pending_close, Some(CloseReason::BufferLimitExceeded)));
	}

	#[test]
	fn soft_limit_closes_only_after_grace_period() {
		let mut c = Client::new(3);
		c.output.append(&vec![b'x'; 20]);
		c.check_output_limits(1000, 10, 5, 0);
		assert!(c.pending_close.is_none());
		c.check_output_limits(1000, 10, 5, 4_000);
		assert!(c.pending_close.is_none());
		c.check_output_limits(1000, 10, 5, 6_000);
		assert!(matches!(c.pending_close, Some(CloseReason::BufferLimitExceeded)));
	}
}
