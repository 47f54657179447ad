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

//! Protocol I/O (PIO): parses inline and multi-bulk requests from a
//! client's input buffer, resumably (a partial request leaves the buffer
//! untouched until more bytes arrive). Grounded in
//! `original_source/src/networking.c`'s `processInlineBuffer`/
//! `processMultibulkBuffer`.

use crate::error::Error;

pub const MAX_MULTIBULK_ARGS: i64 = 1024 * 1024;

#[derive(Debug, PartialEq, Eq)]
pub enum ParseOutcome {
	/// A complete command frame was parsed; `consumed` bytes should be
	/// dropped from the front of the input buffer.
	Command { args: Vec<Vec<u8>>, consumed: usize },
	/// Not enough bytes yet; try again once more data arrives.
	Incomplete,
	/// The request violated a limit; the connection should close once any
	/// pending reply drains.
	Invalid(String),
}

/// Parse exactly one request frame from the front of `buf`. Never consumes
/// bytes on `Incomplete`, so splitting a legal byte stream at arbitrary
/// positions across repeated calls reproduces the same command sequence as
/// feeding it whole (spec property 5).
pub fn parse_request(buf: &[u8], max_inline_len: usize, max_bulk_len: usize) -> ParseOutcome {
	if buf.is_empty() {
		return ParseOutcome::Incomplete;
	}
	if buf[0] == b'*' {
		parse_multibulk(buf, max_bulk_len)
	} else {
		parse_inline(buf, max_inline_len)
	}
}

fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
	let mut i = from;
	while i + 1 < buf.len() {
		if buf[i] == b'\r' && buf[i + 1] == b'\n' {
			return Some(i);
		}
		i += 1;
	}
	None
}

fn parse_inline(buf: &[u8], max_inline_len: usize) -> ParseOutcome {
	let newline = match find_crlf(buf, 0) {
		Some(pos) => pos,
		None => {
			if buf.len() > max_inline_len {
				return ParseOutcome::Invalid("inline request too long".into());
			}
			return ParseOutcome::Incomplete;
		}
	};
	if newline > max_inline_len {
		return ParseOutcome::Invalid("inline request too long".into());
	}
	let line = &buf[0..newline];
	let args: Vec<Vec<u8>> = line.split(|&b| b == b' ').filter(|s| !s.is_empty()).map(|s| s.to_vec()).collect();
	ParseOutcome::Command { args, consumed: newline + 2 }
}

fn parse_decimal(buf: &[u8], from: usize) -> Option<(i64, usize)> {
	let line_end = find_crlf(buf, from)?;
	let s = std::str::from_utf8(&buf[from..line_end]).ok()?;
	let v: i64 = s.parse().ok()?;
	Some((v, line_end + 2))
}

fn parse_multibulk(buf: &[u8], max_bulk_len: usize) -> ParseOutcome {
	let (count, mut pos) = match parse_decimal(buf, 1) {
		Some(v) => v,
		None => {
			if find_crlf(buf, 1).is_some() {
				return ParseOutcome::Invalid("invalid multibulk length".into());
			}
			return ParseOutcome::Incomplete;
		}
	};
	if count > MAX_MULTIBULK_ARGS {
		return ParseOutcome::Invalid("invalid multibulk length".into());
	}
	if count <= 0 {
		return ParseOutcome::Command { args: Vec::new(), consumed: pos };
	}
	let mut args = Vec::with_capacity(count as usize);
	for _ in 0..count {
		if pos >= buf.len() {
			return ParseOutcome::Incomplete;
		}
		if buf[pos] != b'$' {
			return ParseOutcome::Invalid(format!("expected '$', got '{}'", buf[pos] as char));
		}
		let (len, after_len) = match parse_decimal(buf, pos + 1) {
			Some(v) => v,
			None => return ParseOutcome::Incomplete,
		};
		if len < 0 || len as usize > max_bulk_len {
			return ParseOutcome::Invalid("invalid bulk length".into());
		}
		let len = len as usize;
		let data_end = after_len + len;
		let terminator_end = data_end + 2;
		if buf.len() < terminator_end {
			return ParseOutcome::Incomplete;
		}
		args.push(buf[after_len..data_end].to_vec());
		pos = terminator_end;
	}
	ParseOutcome::Command { args, consumed: pos }
}

/// Encode a reply in the five sigil-prefixed forms spec'd in §6.
#[derive(Debug)]
pub enum Reply {
	Status(String),
	Error(String),
	Integer(i64),
	Bulk(Option<Vec<u8>>),
	Array(Option<Vec<Reply>>),
	Double(f64),
}

impl Reply {
	pub fn encode(&self, out: &mut Vec<u8>) {
		match self {
			Reply::Status(s) => {
				out.push(b'+');
				out.extend_from_slice(s.as_bytes());
				out.extend_from_slice(b"\r\n");
			}
			Reply::Error(s) => {
				out.push(b'-');
				out.extend_from_slice(s.as_bytes());
				out.extend_from_slice(b"\r\n");
			}
			Reply::Integer(i) => {
				out.push(b':');
				out.extend_from_slice(i.to_string().as_bytes());
				out.extend_from_slice(b"\r\n");
			}
			Reply::Bulk(None) => out.extend_from_slice(b"$-1\r\n"),
			Reply::Bulk(Some(data)) => {
				out.push(b'$');
				out.extend_from_slice(data.len().to_string().as_bytes());
				out.extend_from_slice(b"\r\n");
				out.extend_from_slice(data);
				out.extend_from_slice(b"\r\n");
			}
			Reply::Array(None) => out.extend_from_slice(b"*-1\r\n"),
			Reply::Array(Some(items)) => {
				out.push(b'*');
				out.extend_from_slice(items.len().to_string().as_bytes());
				out.extend_from_slice(b"\r\n");
				for item in items {
					item.encode(out);
				}
			}
			// Doubles are emitted as bulk strings with >= 17 significant
			// digits (spec §6).
			Reply::Double(d) => {
				let s = format!("{:.17}", d);
				Reply::Bulk(Some(s.into_bytes())).encode(out);
			}
		}
	}
}

impl From<Error> for Reply {
	fn from(e: Error) -> Reply {
		let code = match &e {
			Error::WrongType => "WRONGTYPE",
			Error::SyntaxError | Error::ProtocolError(_) => "ERR",
			Error::OutOfRange => "ERR",
			Error::NoKey | Error::KeyExists => "ERR",
			Error::OutOfMemory => "OOM",
			_ => "ERR",
		};
		Reply::Error(format!("{} {}", code, e))
	}
}

pub fn reply_to_bytes(r: &Reply) -> Vec<u8> {
	let mut out = Vec::new();
	r.encode(&mut out);
	out
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn inline_parses_split_on_spaces() {
		let buf = b"SET foo bar\r\n";
		match parse_request(buf, 1024, 1024) {
			ParseOutcome::Command { args, consumed } => {
				assert_eq!(args, vec![b"SET".to_vec(), b"foo".to_vec(), b"bar".to_vec()]);
				assert_eq!(consumed, buf.len());
			}
			other => panic!("unexpected {:?}", std::mem::discriminant(&other)),
		}
	}

	#[test]
	fn multibulk_parses() {
		let buf = b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n";
		match parse_request(buf, 1024, 1024) {
			ParseOutcome::Command { args, consumed } => {
				assert_eq!(args, vec![b"GET".to_vec(), b"foo".to_vec()]);
				assert_eq!(consumed, buf.len());
			}
			other => panic!("unexpected {:?}", std::mem::discriminant(&other)),
		}
	}

	#[test]
	fn incomplete_frame_consumes_nothing_and_is_retried_whole() {
		let buf = b"*2\r\n$3\r\nGET\r\n$3\r\nfo";
		assert_eq!(parse_request(buf, 1024, 1024), ParseOutcome::Incomplete);
	}

	#[test]
	fn splitting_the_stream_reproduces_the_same_commands() {
		let whole = b"*1\r\n$4\r\nPING\r\n*2\r\n$3\r\nGET\r\n$1\r\nk\r\n".to_vec();
		let mut commands_whole = Vec::new();
		let mut rest = &whole[..];
		loop {
			match parse_request(rest, 1024, 1024) {
				ParseOutcome::Command { args, consumed } => {
					commands_whole.push(args);
					rest = &rest[consumed..];
				}
				ParseOutcome::Incomplete => break,
				ParseOutcome::Invalid(e) => panic!("{}", e),
			}
		}

		// Now feed the same bytes split at every possible position and make
		// sure the same command sequence comes out once enough data has
		// arrived, never early and never corrupted.
		for split in 1..whole.len() {
			let mut buf: Vec<u8> = whole[..split].to_vec();
			let mut fed = split;
			let mut commands = Vec::new();
			loop {
				match parse_request(&buf, 1024, 1024) {
					ParseOutcome::Command { args, consumed } => {
						commands.push(args);
						buf.drain(0..consumed);
					}
					ParseOutcome::Incomplete => {
						if fed == whole.len() {
							break;
						}
						buf.push(whole[fed]);
						fed += 1;
					}
					ParseOutcome::Invalid(e) => panic!("{}", e),
				}
			}
			assert_eq!(commands, commands_whole, "split at {} diverged", split);
		}
	}

	#[test]
	fn oversized_bulk_len_is_rejected() {
		let buf = b"*1\r\n$999999999\r\n";
		match parse_request(buf, 1024, 1024) {
			ParseOutcome::Invalid(_) => {}
			other => panic!("expected Invalid, got {:?}", std::mem::discriminant(&other)),
		}
	}
}
