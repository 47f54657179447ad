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

//! End-to-end scenarios driving dispatch, the keyspace, and the two
//! persistence codecs together, the way a client session would.

use flintdb::aof::{self, AofWriter};
use flintdb::bio::Bio;
use flintdb::config::{AofFsyncPolicy, EncodingLimits};
use flintdb::dispatch::dispatch;
use flintdb::keyspace::Keyspace;
use flintdb::protocol::{reply_to_bytes, Reply};
use flintdb::rdb;
use flintdb::value::Encoding;
use std::sync::Arc;

fn tmp_dir(name: &str) -> std::path::PathBuf {
	let dir = std::env::temp_dir().join(format!("flintdb-integration-{}-{}", name, std::process::id()));
	std::fs::create_dir_all(&dir).unwrap();
	dir
}

fn run(ks: &mut Keyspace, db: &mut usize, limits: &EncodingLimits, args: &[&[u8]], now_ms: u64) -> Reply {
	let owned: Vec<Vec<u8>> = args.iter().map(|a| a.to_vec()).collect();
	dispatch(ks, db, limits, &[], &owned, now_ms)
}

#[test]
fn set_incr_get_roundtrip() {
	let limits = EncodingLimits::default();
	let mut ks = Keyspace::new(1);
	let mut db = 0;

	run(&mut ks, &mut db, &limits, &[b"SET", b"visits", b"10"], 0);
	let incr = run(&mut ks, &mut db, &limits, &[b"INCR", b"visits"], 0);
	assert_eq!(reply_to_bytes(&incr), b":11\r\n");

	let get = run(&mut ks, &mut db, &limits, &[b"GET", b"visits"], 0);
	assert_eq!(reply_to_bytes(&get), b"$2\r\n11\r\n");
}

#[test]
fn list_push_len_and_pop_cycle() {
	let limits = EncodingLimits::default();
	let mut ks = Keyspace::new(1);
	let mut db = 0;

	run(&mut ks, &mut db, &limits, &[b"RPUSH", b"queue", b"first", b"second", b"third"], 0);
	let len = run(&mut ks, &mut db, &limits, &[b"LLEN", b"queue"], 0);
	assert_eq!(reply_to_bytes(&len), b":3\r\n");

	let popped = run(&mut ks, &mut db, &limits, &[b"LPOP", b"queue"], 0);
	assert_eq!(reply_to_bytes(&popped), b"$5\r\nfirst\r\n");

	let remaining = run(&mut ks, &mut db, &limits, &[b"LRANGE", b"queue", b"0", b"-1"], 0);
	assert_eq!(reply_to_bytes(&remaining), b"*2\r\n$6\r\nsecond\r\n$5\r\nthird\r\n");
}

#[test]
fn expire_with_relative_seconds_then_recheck_after_deadline() {
	let limits = EncodingLimits::default();
	let mut ks = Keyspace::new(1);
	let mut db = 0;

	run(&mut ks, &mut db, &limits, &[b"SET", b"session", b"token"], 0);
	run(&mut ks, &mut db, &limits, &[b"EXPIRE", b"session", b"1"], 0);

	let still_there = run(&mut ks, &mut db, &limits, &[b"GET", b"session"], 500);
	assert_eq!(reply_to_bytes(&still_there), b"$5\r\ntoken\r\n");

	let gone = run(&mut ks, &mut db, &limits, &[b"GET", b"session"], 1_500);
	assert_eq!(reply_to_bytes(&gone), b"$-1\r\n");

	let expired = ks.drain_expired();
	assert_eq!(expired.len(), 1);
	assert_eq!(expired[0].key, b"session");
}

#[test]
fn zset_grows_past_listpack_threshold_and_keeps_score_order() {
	let limits = EncodingLimits::default();
	let mut ks = Keyspace::new(1);
	let mut db = 0;

	for i in 0..300 {
		let member = format!("member{}", i).into_bytes();
		let score = (300 - i).to_string().into_bytes();
		run(&mut ks, &mut db, &limits, &[b"ZADD", b"leaderboard", &score, &member], 0);
	}

	let value = ks.lookup_read(0, b"leaderboard", 0).unwrap();
	assert_eq!(value.encoding(), Encoding::SkipList);

	let reply = run(&mut ks, &mut db, &limits, &[b"ZRANGE", b"leaderboard", b"0", b"2", b"WITHSCORES"], 0);
	match reply {
		Reply::Array(Some(items)) => {
			assert_eq!(items.len(), 6);
			match &items[0] {
				Reply::Bulk(Some(m)) => assert_eq!(m, b"member299"),
				other => panic!("expected lowest-score member first, got {:?}", other),
			}
			match &items[1] {
				Reply::Double(s) => assert_eq!(*s, 1.0),
				other => panic!("expected a score for the first member, got {:?}", other),
			}
		}
		other => panic!("expected an array reply, got {:?}", other),
	}
}

#[test]
fn rdb_save_and_reload_survives_a_restart() {
	let limits = EncodingLimits::default();
	let mut ks = Keyspace::new(4);
	let mut db = 0;

	run(&mut ks, &mut db, &limits, &[b"SET", b"name", b"flint"], 0);
	run(&mut ks, &mut db, &limits, &[b"RPUSH", b"todo", b"write docs", b"ship it"], 0);
	run(&mut ks, &mut db, &limits, &[b"SADD", b"tags", b"rust", b"kv"], 0);
	run(&mut ks, &mut db, &limits, &[b"HSET", b"config", b"retries", b"3"], 0);
	run(&mut ks, &mut db, &limits, &[b"ZADD", b"scores", b"9.5", b"alice"], 0);
	run(&mut ks, &mut db, &limits, &[b"SET", b"transient", b"gone-soon"], 0);
	run(&mut ks, &mut db, &limits, &[b"EXPIRE", b"transient", b"30"], 0);

	let dir = tmp_dir("restart");
	let rdb_path = dir.join("dump.rdb");
	rdb::save(&ks, &rdb_path, 0).unwrap();

	// Simulate a process restart: a brand new, empty keyspace reloads from
	// the snapshot the previous process wrote.
	let mut reloaded = Keyspace::new(4);
	rdb::load(&mut reloaded, &rdb_path, &limits, true, 0).unwrap();

	assert_eq!(reloaded.lookup_read(0, b"name", 0).unwrap().string_bytes().unwrap(), b"flint");
	assert_eq!(reloaded.lookup_read(0, b"todo", 0).unwrap().list_items().unwrap(), vec![b"write docs".to_vec(), b"ship it".to_vec()]);
	assert_eq!(reloaded.lookup_read(0, b"tags", 0).unwrap().set_len().unwrap(), 2);
	assert_eq!(reloaded.lookup_read(0, b"config", 0).unwrap().hash_get(b"retries").unwrap(), Some(b"3".to_vec()));
	assert_eq!(reloaded.lookup_read(0, b"scores", 0).unwrap().zset_score(b"alice").unwrap(), Some(9.5));
	assert_eq!(reloaded.get_expiry(0, b"transient", 0), Some(30_000));

	std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn aof_everysecond_policy_accumulates_then_flushes_and_replays() {
	let limits = EncodingLimits::default();
	let mut ks = Keyspace::new(1);
	let mut db = 0;

	let dir = tmp_dir("everysec-scenario");
	let aof_path = dir.join("appendonly.aof");
	let bio = Arc::new(Bio::start());
	let mut writer = AofWriter::open(&aof_path, AofFsyncPolicy::EverySecond, bio).unwrap();

	// A burst of writes within the same second accumulates in the writer's
	// in-memory buffer; nothing reaches disk until `flush` runs.
	for i in 0..5 {
		let key = format!("k{}", i).into_bytes();
		run(&mut ks, &mut db, &limits, &[b"SET", &key, b"v"], i * 100);
		writer.feed(db, &[b"SET".to_vec(), key, b"v".to_vec()], i * 100).unwrap();
		writer.maybe_fsync(i * 100).unwrap();
	}

	run(&mut ks, &mut db, &limits, &[b"SET", b"slow", b"v"], 5_000);
	writer.feed(db, &[b"SET".to_vec(), b"slow".to_vec(), b"v".to_vec()], 5_000).unwrap();
	writer.maybe_fsync(5_000).unwrap();

	writer.flush(5_000).unwrap();

	let mut replay_ks = Keyspace::new(1);
	let mut replay_db = 0usize;
	let outcome = aof::load(&aof_path, false, |args| {
		if args[0].eq_ignore_ascii_case(b"SELECT") {
			replay_db = std::str::from_utf8(&args[1]).unwrap().parse().unwrap();
		} else {
			dispatch(&mut replay_ks, &mut replay_db, &limits, &[], args, 0);
		}
		Ok(())
	})
	.unwrap();

	assert_eq!(outcome.truncated_bytes, 0);
	assert_eq!(replay_ks.dbsize(0), 6);
	assert_eq!(replay_ks.lookup_read(0, b"slow", 0).unwrap().string_bytes().unwrap(), b"v");

	std::fs::remove_dir_all(&dir).ok();
}
