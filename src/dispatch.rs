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

//! Command dispatch: the minimal procedure set needed to exercise the
//! keyspace and value layers end to end (`SET`/`GET`/`INCR`/`DEL`/`EXPIRE`/
//! family, plus basic list/set/hash/zset commands). The full per-command
//! library (string ranges, blocking pops, scripting hooks, ...) is out of
//! scope; this module exists to drive the core, not to be a complete server.

use crate::config::EncodingLimits;
use crate::error::{Error, Result};
use crate::keyspace::Keyspace;
use crate::protocol::Reply;
use crate::value::TypedValue;

fn eq(a: &[u8], s: &str) -> bool {
	a.eq_ignore_ascii_case(s.as_bytes())
}

fn parse_i64(data: &[u8]) -> Result<i64> {
	std::str::from_utf8(data).ok().and_then(|s| s.parse().ok()).ok_or(Error::SyntaxError)
}

fn parse_f64(data: &[u8]) -> Result<f64> {
	std::str::from_utf8(data).ok().and_then(|s| s.parse().ok()).ok_or(Error::SyntaxError)
}

/// Whether `name` mutates the keyspace and therefore needs to be propagated
/// to the append log and counted toward the dirty counter.
pub fn is_write_command(name: &[u8]) -> bool {
	const WRITE_COMMANDS: &[&str] = &[
		"SET", "SETEX", "PSETEX", "INCR", "INCRBY", "DECR", "DECRBY", "APPEND", "DEL", "EXPIRE", "PEXPIRE", "EXPIREAT",
		"PEXPIREAT", "PERSIST", "RPUSH", "LPUSH", "RPOP", "LPOP", "SADD", "SREM", "HSET", "ZADD", "FLUSHDB", "FLUSHALL",
	];
	WRITE_COMMANDS.iter().any(|c| eq(name, c))
}

/// Execute one already-parsed command against `ks`. `db` is mutated in place
/// for `SELECT`. Returns the reply to send back to the client (or to discard,
/// when replaying the append log). `shared_ints` is the process-wide small-
/// integer pool (may be empty, in which case every integer is freshly
/// allocated).
pub fn dispatch(
	ks: &mut Keyspace,
	db: &mut usize,
	limits: &EncodingLimits,
	shared_ints: &[TypedValue],
	args: &[Vec<u8>],
	now_ms: u64,
) -> Reply {
	if args.is_empty() {
		return Reply::Error("ERR empty command".into());
	}
	let name = &args[0];
	let a = &args[1..];
	let result = run(ks, db, limits, shared_ints, name, a, now_ms);
	match result {
		Ok(reply) => reply,
		Err(e) => Reply::from(e),
	}
}

fn run(
	ks: &mut Keyspace,
	db: &mut usize,
	limits: &EncodingLimits,
	shared_ints: &[TypedValue],
	name: &[u8],
	a: &[Vec<u8>],
	now_ms: u64,
) -> Result<Reply> {
	if eq(name, "PING") {
		return Ok(Reply::Status("PONG".into()));
	}
	if eq(name, "SELECT") {
		let target = parse_i64(arg(a, 0)?)? as usize;
		if target >= ks.num_dbs() {
			return Err(Error::OutOfRange);
		}
		*db = target;
		return Ok(Reply::Status("OK".into()));
	}
	if eq(name, "FLUSHDB") {
		ks.flushdb(*db);
		return Ok(Reply::Status("OK".into()));
	}
	if eq(name, "FLUSHALL") {
		ks.flushall();
		return Ok(Reply::Status("OK".into()));
	}
	if eq(name, "DBSIZE") {
		return Ok(Reply::Integer(ks.dbsize(*db) as i64));
	}
	if eq(name, "EXISTS") {
		return Ok(Reply::Integer(ks.exists(*db, arg(a, 0)?, now_ms) as i64));
	}
	if eq(name, "DEL") {
		let mut n = 0;
		for key in a {
			if ks.delete(*db, key, now_ms) {
				n += 1;
			}
		}
		return Ok(Reply::Integer(n));
	}
	if eq(name, "SET") {
		let data = arg(a, 1)?;
		let value = match crate::value::parse_int_exact(data) {
			Some(i) => TypedValue::shared_or_new_int(shared_ints, i),
			None => TypedValue::new_string(data),
		};
		ks.set(*db, arg(a, 0)?, value, now_ms);
		return Ok(Reply::Status("OK".into()));
	}
	if eq(name, "GET") {
		return Ok(match ks.lookup_read(*db, arg(a, 0)?, now_ms) {
			Some(v) => Reply::Bulk(Some(v.string_bytes()?)),
			None => Reply::Bulk(None),
		});
	}
	if eq(name, "SETEX") || eq(name, "PSETEX") {
		let secs_or_ms = parse_i64(arg(a, 1)?)?;
		let deadline = if eq(name, "SETEX") { now_ms + (secs_or_ms as u64) * 1000 } else { now_ms + secs_or_ms as u64 };
		ks.set(*db, arg(a, 0)?, TypedValue::new_string(arg(a, 2)?), now_ms);
		ks.set_expiry(*db, arg(a, 0)?, deadline, now_ms)?;
		return Ok(Reply::Status("OK".into()));
	}
	if eq(name, "INCR") || eq(name, "INCRBY") || eq(name, "DECR") || eq(name, "DECRBY") {
		let delta = match name {
			n if eq(n, "INCR") => 1,
			n if eq(n, "DECR") => -1,
			n if eq(n, "INCRBY") => parse_i64(arg(a, 1)?)?,
			_ => -parse_i64(arg(a, 1)?)?,
		};
		let key = arg(a, 0)?;
		if ks.lookup_write(*db, key, now_ms).is_none() {
			ks.set(*db, key, TypedValue::shared_or_new_int(shared_ints, 0), now_ms);
		}
		let v = ks.lookup_write(*db, key, now_ms).unwrap();
		let new_val = v.incr_by(delta)?;
		return Ok(Reply::Integer(new_val));
	}
	if eq(name, "APPEND") {
		let key = arg(a, 0)?;
		if ks.lookup_write(*db, key, now_ms).is_none() {
			ks.set(*db, key, TypedValue::new_string(b""), now_ms);
		}
		let v = ks.lookup_write(*db, key, now_ms).unwrap();
		let new_len = v.append_string(arg(a, 1)?)?;
		return Ok(Reply::Integer(new_len as i64));
	}
	if eq(name, "EXPIRE") || eq(name, "PEXPIRE") || eq(name, "EXPIREAT") || eq(name, "PEXPIREAT") {
		let key = arg(a, 0)?;
		let n = parse_i64(arg(a, 1)?)?;
		let deadline: u64 = match name {
			x if eq(x, "EXPIRE") => now_ms + (n.max(0) as u64) * 1000,
			x if eq(x, "PEXPIRE") => now_ms + n.max(0) as u64,
			x if eq(x, "EXPIREAT") => (n.max(0) as u64) * 1000,
			_ => n.max(0) as u64,
		};
		return match ks.set_expiry(*db, key, deadline, now_ms) {
			Ok(()) => Ok(Reply::Integer(1)),
			Err(Error::NoKey) => Ok(Reply::Integer(0)),
			Err(e) => Err(e),
		};
	}
	if eq(name, "PERSIST") {
		return Ok(Reply::Integer(ks.remove_expiry(*db, arg(a, 0)?) as i64));
	}
	if eq(name, "TTL") || eq(name, "PTTL") {
		return Ok(match ks.get_expiry(*db, arg(a, 0)?, now_ms) {
			Some(deadline) => {
				let remaining_ms = deadline.saturating_sub(now_ms);
				Reply::Integer(if eq(name, "TTL") { (remaining_ms / 1000) as i64 } else { remaining_ms as i64 })
			}
			None => {
				if ks.exists(*db, arg(a, 0)?, now_ms) {
					Reply::Integer(-1)
				} else {
					Reply::Integer(-2)
				}
			}
		});
	}
	if eq(name, "RPUSH") || eq(name, "LPUSH") {
		let key = arg(a, 0)?;
		if ks.lookup_write(*db, key, now_ms).is_none() {
			ks.set(*db, key, TypedValue::new_list(), now_ms);
		}
		let v = ks.lookup_write(*db, key, now_ms).unwrap();
		let mut len = 0;
		for item in &a[1..] {
			len = v.list_push(item, eq(name, "LPUSH"), limits)?;
		}
		return Ok(Reply::Integer(len as i64));
	}
	if eq(name, "LPOP") || eq(name, "RPOP") {
		let key = arg(a, 0)?;
		let popped = match ks.lookup_write(*db, key, now_ms) {
			Some(v) => v.list_pop(eq(name, "LPOP"))?,
			None => None,
		};
		return Ok(Reply::Bulk(popped));
	}
	if eq(name, "LLEN") {
		return Ok(match ks.lookup_read(*db, arg(a, 0)?, now_ms) {
			Some(v) => Reply::Integer(v.list_len()? as i64),
			None => Reply::Integer(0),
		});
	}
	if eq(name, "LRANGE") {
		let start = parse_i64(arg(a, 1)?)?;
		let stop = parse_i64(arg(a, 2)?)?;
		let items = match ks.lookup_read(*db, arg(a, 0)?, now_ms) {
			Some(v) => v.list_items()?,
			None => Vec::new(),
		};
		let len = items.len() as i64;
		let norm = |i: i64| -> i64 {
			if i < 0 { (len + i).max(0) } else { i }
		};
		let start = norm(start).min((len - 1).max(0)).max(0) as usize;
		let stop = norm(stop).min(len - 1);
		let slice: Vec<Reply> = if stop < start as i64 || len == 0 {
			Vec::new()
		} else {
			items[start..=(stop as usize)].iter().map(|i| Reply::Bulk(Some(i.clone()))).collect()
		};
		return Ok(Reply::Array(Some(slice)));
	}
	if eq(name, "SADD") {
		let key = arg(a, 0)?;
		if ks.lookup_write(*db, key, now_ms).is_none() {
			ks.set(*db, key, TypedValue::new_set(), now_ms);
		}
		let v = ks.lookup_write(*db, key, now_ms).unwrap();
		let mut added = 0;
		for member in &a[1..] {
			if v.set_add(member, limits)? {
				added += 1;
			}
		}
		return Ok(Reply::Integer(added));
	}
	if eq(name, "SMEMBERS") {
		let members = match ks.lookup_read(*db, arg(a, 0)?, now_ms) {
			Some(v) => v.set_members()?,
			None => Vec::new(),
		};
		return Ok(Reply::Array(Some(members.into_iter().map(|m| Reply::Bulk(Some(m))).collect())));
	}
	if eq(name, "SCARD") {
		return Ok(match ks.lookup_read(*db, arg(a, 0)?, now_ms) {
			Some(v) => Reply::Integer(v.set_len()? as i64),
			None => Reply::Integer(0),
		});
	}
	if eq(name, "HSET") {
		let key = arg(a, 0)?;
		if ks.lookup_write(*db, key, now_ms).is_none() {
			ks.set(*db, key, TypedValue::new_hash(), now_ms);
		}
		let v = ks.lookup_write(*db, key, now_ms).unwrap();
		let mut created = 0;
		let mut i = 1;
		while i + 1 <= a.len() {
			if v.hash_set(arg(a, i)?, arg(a, i + 1)?, limits)? {
				created += 1;
			}
			i += 2;
		}
		return Ok(Reply::Integer(created));
	}
	if eq(name, "HGET") {
		return Ok(match ks.lookup_read(*db, arg(a, 0)?, now_ms) {
			Some(v) => Reply::Bulk(v.hash_get(arg(a, 1)?)?),
			None => Reply::Bulk(None),
		});
	}
	if eq(name, "HLEN") {
		return Ok(match ks.lookup_read(*db, arg(a, 0)?, now_ms) {
			Some(v) => Reply::Integer(v.hash_len()? as i64),
			None => Reply::Integer(0),
		});
	}
	if eq(name, "ZADD") {
		let key = arg(a, 0)?;
		if ks.lookup_write(*db, key, now_ms).is_none() {
			ks.set(*db, key, TypedValue::new_zset(), now_ms);
		}
		let v = ks.lookup_write(*db, key, now_ms).unwrap();
		let mut added = 0;
		let mut i = 1;
		while i + 1 <= a.len() {
			let score = parse_f64(arg(a, i)?)?;
			if v.zset_add(arg(a, i + 1)?, score, limits)? {
				added += 1;
			}
			i += 2;
		}
		return Ok(Reply::Integer(added));
	}
	if eq(name, "ZSCORE") {
		return Ok(match ks.lookup_read(*db, arg(a, 0)?, now_ms) {
			Some(v) => match v.zset_score(arg(a, 1)?)? {
				Some(s) => Reply::Double(s),
				None => Reply::Bulk(None),
			},
			None => Reply::Bulk(None),
		});
	}
	if eq(name, "ZCARD") {
		return Ok(match ks.lookup_read(*db, arg(a, 0)?, now_ms) {
			Some(v) => Reply::Integer(v.zset_len()? as i64),
			None => Reply::Integer(0),
		});
	}
	if eq(name, "ZRANGE") {
		let start = parse_i64(arg(a, 1)?)?;
		let stop = parse_i64(arg(a, 2)?)?;
		let with_scores = a.len() > 3 && eq(arg(a, 3)?, "WITHSCORES");
		let pairs = match ks.lookup_read(*db, arg(a, 0)?, now_ms) {
			Some(v) => v.zset_range(start, stop)?,
			None => Vec::new(),
		};
		let mut out = Vec::new();
		for (m, s) in pairs {
			out.push(Reply::Bulk(Some(m)));
			if with_scores {
				out.push(Reply::Double(s));
			}
		}
		return Ok(Reply::Array(Some(out)));
	}
	Err(Error::SyntaxError)
}

fn arg<'a>(a: &'a [Vec<u8>], i: usize) -> Result<&'a [u8]> {
	a.get(i).map(|v| v.as_slice()).ok_or(Error::SyntaxError)
}
