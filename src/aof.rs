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

//! Append-only log (AOF): every mutating command is normalized (relative
//! expirations become absolute `PEXPIREAT`s, `SETEX`/`PSETEX` split into
//! `SET` + `PEXPIREAT`) and appended as a RESP multi-bulk array, so replay
//! never depends on wall-clock time at load. Grounded in
//! `original_source/src/aof.c`.

use crate::bio::Bio;
use crate::config::{AofFsyncPolicy, EncodingLimits};
use crate::dbs::DynStr;
use crate::error::{Error, Result};
use crate::keyspace::Keyspace;
use crate::protocol::ParseOutcome;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Command batches emitted per key during a rewrite stay under this size, the
/// way `original_source/src/aof.c`'s `rewriteListObject` caps `RPUSH` argc.
const ITEMS_PER_CMD: usize = 64;

/// How long a flush waits for an in-flight background fsync before giving up
/// and writing anyway, counting the write as delayed (spec §4.6).
const EVERYSEC_FORCE_AFTER_MS: u64 = 2000;
const EVERYSEC_INTERVAL_MS: u64 = 1000;

/// Size of one rewrite-buffer block (spec §4.6: "a list of 10 MiB blocks").
const REWRITE_BLOCK_SIZE: usize = 10 * 1024 * 1024;

pub fn encode_multibulk(args: &[Vec<u8>]) -> Vec<u8> {
	let mut out = Vec::new();
	out.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
	for a in args {
		out.extend_from_slice(format!("${}\r\n", a.len()).as_bytes());
		out.extend_from_slice(a);
		out.extend_from_slice(b"\r\n");
	}
	out
}

fn bulk(s: &[u8]) -> Vec<u8> {
	s.to_vec()
}

fn parse_u64(data: &[u8]) -> Result<u64> {
	std::str::from_utf8(data).ok().and_then(|s| s.parse().ok()).ok_or(Error::SyntaxError)
}

fn eq_ignore_ascii_case(a: &[u8], b: &str) -> bool {
	a.eq_ignore_ascii_case(b.as_bytes())
}

/// Rewrite relative/now-relative commands into absolute, replay-safe form.
/// `SETEX`/`PSETEX` split into two commands; everything else passes through
/// unchanged, in a single-element vector.
pub fn normalize_command(args: &[Vec<u8>], now_ms: u64) -> Result<Vec<Vec<Vec<u8>>>> {
	if args.is_empty() {
		return Ok(vec![args.to_vec()]);
	}
	let name = &args[0];
	if eq_ignore_ascii_case(name, "EXPIRE") && args.len() == 3 {
		let secs = parse_u64(&args[2])?;
		return Ok(vec![vec![bulk(b"PEXPIREAT"), args[1].clone(), (now_ms + secs * 1000).to_string().into_bytes()]]);
	}
	if eq_ignore_ascii_case(name, "PEXPIRE") && args.len() == 3 {
		let ms = parse_u64(&args[2])?;
		return Ok(vec![vec![bulk(b"PEXPIREAT"), args[1].clone(), (now_ms + ms).to_string().into_bytes()]]);
	}
	if eq_ignore_ascii_case(name, "EXPIREAT") && args.len() == 3 {
		let secs_abs = parse_u64(&args[2])?;
		return Ok(vec![vec![bulk(b"PEXPIREAT"), args[1].clone(), (secs_abs * 1000).to_string().into_bytes()]]);
	}
	if eq_ignore_ascii_case(name, "SETEX") && args.len() == 4 {
		let secs = parse_u64(&args[2])?;
		return Ok(vec![
			vec![bulk(b"SET"), args[1].clone(), args[3].clone()],
			vec![bulk(b"PEXPIREAT"), args[1].clone(), (now_ms + secs * 1000).to_string().into_bytes()],
		]);
	}
	if eq_ignore_ascii_case(name, "PSETEX") && args.len() == 4 {
		let ms = parse_u64(&args[2])?;
		return Ok(vec![
			vec![bulk(b"SET"), args[1].clone(), args[3].clone()],
			vec![bulk(b"PEXPIREAT"), args[1].clone(), (now_ms + ms).to_string().into_bytes()],
		]);
	}
	Ok(vec![args.to_vec()])
}

pub struct AofWriter {
	file: File,
	policy: AofFsyncPolicy,
	current_db: Option<usize>,
	last_fsync_ms: u64,
	fsync_wait_since_ms: Option<u64>,
	pub delayed_fsync_count: u64,
	/// Bytes appended since the last successful `flush`, mirroring spec
	/// §4.6's "appended bytes accumulate in a DBS" model: `append_command`
	/// only ever touches this buffer, never the fd directly.
	buf: DynStr,
	/// File length as of the last successful `flush`, used to truncate back
	/// to on a short write (spec §7's `ShortWrite` recovery).
	good_size: u64,
	bio: Arc<Bio>,
	/// While `Some`, every appended record is mirrored here in addition to
	/// `buf` -- the parent-side rewrite-buffer of spec §4.6, capturing
	/// commands written during a concurrent background rewrite so they can
	/// be replayed onto the child's file before the swap.
	rewrite_buffer: Option<Vec<DynStr>>,
}

impl AofWriter {
	pub fn open(path: &Path, policy: AofFsyncPolicy, bio: Arc<Bio>) -> Result<AofWriter> {
		let file = OpenOptions::new().create(true).append(true).open(path)?;
		let good_size = file.metadata()?.len();
		Ok(AofWriter {
			file,
			policy,
			current_db: None,
			last_fsync_ms: 0,
			fsync_wait_since_ms: None,
			delayed_fsync_count: 0,
			buf: DynStr::new(),
			good_size,
			bio,
			rewrite_buffer: None,
		})
	}

	/// Append one already-normalized command, injecting a `SELECT` ahead of
	/// it whenever the target database differs from the last one written.
	pub fn append_command(&mut self, db: usize, args: &[Vec<u8>]) -> Result<()> {
		let mut out = Vec::new();
		if self.current_db != Some(db) {
			let select = vec![bulk(b"SELECT"), db.to_string().into_bytes()];
			out.extend_from_slice(&encode_multibulk(&select));
			self.current_db = Some(db);
		}
		out.extend_from_slice(&encode_multibulk(args));
		self.buf.append(&out);
		self.capture_for_rewrite(&out);
		Ok(())
	}

	/// Normalize and append a raw client command in one step.
	pub fn feed(&mut self, db: usize, args: &[Vec<u8>], now_ms: u64) -> Result<()> {
		for normalized in normalize_command(args, now_ms)? {
			self.append_command(db, &normalized)?;
		}
		Ok(())
	}

	/// Apply the configured fsync policy. `always` fsyncs synchronously
	/// (the caller is about to acknowledge the write, so durability must be
	/// established before returning); `no` never does; `everysec` hands the
	/// fsync to the background worker pool at most once a second, matching
	/// `aof.c`'s dedicated bio fsync thread.
	pub fn maybe_fsync(&mut self, now_ms: u64) -> Result<()> {
		match self.policy {
			AofFsyncPolicy::No => Ok(()),
			AofFsyncPolicy::Always => {
				self.file.sync_data()?;
				self.last_fsync_ms = now_ms;
				Ok(())
			}
			AofFsyncPolicy::EverySecond => {
				if now_ms.saturating_sub(self.last_fsync_ms) >= EVERYSEC_INTERVAL_MS && self.bio.fsync_pending() == 0 {
					self.bio.queue_fsync(self.file.as_raw_fd());
					self.last_fsync_ms = now_ms;
				}
				Ok(())
			}
		}
	}

	/// Write the accumulated buffer to the log fd. In `everysec` mode, if a
	/// background fsync is still in flight, the write is postponed up to
	/// [`EVERYSEC_FORCE_AFTER_MS`]; past that it proceeds anyway and
	/// [`AofWriter::delayed_fsync_count`] is incremented, so a slow disk
	/// can't unboundedly delay command acknowledgment (spec §4.6).
	///
	/// A short write truncates the file back to the last known good size
	/// and returns [`Error::ShortWrite`]; if the truncate itself fails the
	/// process exits, because the log is now unrecoverable (spec §7).
	pub fn flush(&mut self, now_ms: u64) -> Result<()> {
		if self.buf.is_empty() {
			return Ok(());
		}
		if matches!(self.policy, AofFsyncPolicy::EverySecond) && self.bio.fsync_pending() > 0 {
			let since = *self.fsync_wait_since_ms.get_or_insert(now_ms);
			if now_ms.saturating_sub(since) < EVERYSEC_FORCE_AFTER_MS {
				return Ok(());
			}
			self.delayed_fsync_count += 1;
		}
		self.fsync_wait_since_ms = None;
		self.write_buffered()
	}

	fn write_buffered(&mut self) -> Result<()> {
		let len = self.buf.len();
		let fd = self.file.as_raw_fd();
		let n = unsafe { libc::write(fd, self.buf.as_slice().as_ptr() as *const libc::c_void, len) };
		if n < 0 {
			return Err(std::io::Error::last_os_error().into());
		}
		let written = n as usize;
		if written == len {
			self.good_size += written as u64;
			self.buf.truncate(0);
			return Ok(());
		}
		self.handle_short_write(written, len)
	}

	/// Truncate the log back to the last known good size after a short
	/// write of `written` (of `total` intended) bytes. If the truncate
	/// itself fails the log is unrecoverable and the process exits (spec
	/// §7's table).
	fn handle_short_write(&mut self, written: usize, total: usize) -> Result<()> {
		log::error!(
			target: "flintdb",
			"short write appending to aof ({} of {} bytes); truncating back to last known good size {}",
			written,
			total,
			self.good_size
		);
		match self.file.set_len(self.good_size) {
			Ok(()) => {
				self.buf.truncate(0);
				Err(Error::ShortWrite)
			}
			Err(e) => {
				log::error!(target: "flintdb", "failed to truncate aof after short write: {} -- the log is unrecoverable", e);
				std::process::exit(1);
			}
		}
	}

	/// Begin mirroring every appended record into the rewrite-buffer (spec
	/// §4.6), called once a background rewrite child has been forked.
	/// Resets `SELECT` tracking so the very next record re-emits one: the
	/// rewrite-buffer must be self-contained once replayed onto the child's
	/// file, which has no memory of what database this writer last selected.
	pub fn begin_rewrite_capture(&mut self) {
		self.reset_db_tracking();
		self.rewrite_buffer = Some(vec![DynStr::new()]);
	}

	fn capture_for_rewrite(&mut self, data: &[u8]) {
		if let Some(blocks) = &mut self.rewrite_buffer {
			let fits = blocks.last().map(|b| b.len() + data.len() <= REWRITE_BLOCK_SIZE).unwrap_or(false);
			if !fits {
				blocks.push(DynStr::new());
			}
			blocks.last_mut().unwrap().append(data);
		}
	}

	/// Stop capturing and hand the accumulated blocks to the caller, for a
	/// successful rewrite to replay onto the child's file before the swap.
	pub fn take_rewrite_capture(&mut self) -> Option<Vec<DynStr>> {
		self.rewrite_buffer.take()
	}

	/// Stop capturing and discard the accumulated blocks (a failed rewrite:
	/// the active log is unchanged, so there is nothing to replay).
	pub fn discard_rewrite_capture(&mut self) {
		self.rewrite_buffer = None;
	}

	/// Forget which database the last-written `SELECT` targeted, so the next
	/// `append_command` re-emits one. Needed after swapping in a freshly
	/// rewritten file, whose first command might target the same database
	/// the old writer last selected.
	pub fn reset_db_tracking(&mut self) {
		self.current_db = None;
	}

	/// Hand this writer's fd to the background worker pool to close,
	/// instead of blocking the calling thread in `close(fd)` (spec §5's
	/// two job kinds). Any unflushed buffer is dropped -- callers swap in a
	/// new writer only after a successful rewrite or explicit final flush.
	pub fn close_in_background(mut self, bio: &Bio) {
		let fd = self.file.as_raw_fd();
		self.buf = DynStr::new();
		self.rewrite_buffer = None;
		std::mem::forget(self);
		bio.queue_close(fd);
	}
}

/// Outcome of loading a log: how many commands were applied, and how many
/// trailing bytes (if any) were discarded as an unterminated record left by
/// a crash mid-write.
pub struct LoadOutcome {
	pub commands_applied: usize,
	pub truncated_bytes: usize,
}

/// Replay a log file through `apply`, which receives the active database
/// index and the raw argument vector for each command (including `SELECT`,
/// which `apply` is expected to handle by switching its own notion of the
/// current database). If the file ends mid-record -- a partial write left by
/// a crash -- and `repair` is set, the file is truncated to the last
/// complete record and loading proceeds; otherwise a corruption error is
/// returned, matching `aof.c`'s `redis-check-aof`-or-bail default.
pub fn load<F: FnMut(&[Vec<u8>]) -> Result<()>>(path: &Path, repair: bool, mut apply: F) -> Result<LoadOutcome> {
	let mut file = File::open(path)?;
	let mut data = Vec::new();
	file.read_to_end(&mut data)?;

	let mut offset = 0usize;
	let mut commands_applied = 0usize;
	loop {
		match crate::protocol::parse_request(&data[offset..], usize::MAX, usize::MAX) {
			ParseOutcome::Command { args, consumed } => {
				if args.is_empty() {
					offset += consumed;
					continue;
				}
				apply(&args)?;
				commands_applied += 1;
				offset += consumed;
			}
			ParseOutcome::Incomplete => break,
			ParseOutcome::Invalid(msg) => {
				if !repair {
					return Err(Error::Corruption(format!("aof parse error at byte {}: {}", offset, msg)));
				}
				break;
			}
		}
	}

	let truncated_bytes = data.len() - offset;
	if truncated_bytes > 0 {
		if !repair {
			return Err(Error::Corruption(format!("{} trailing bytes after last complete aof record", truncated_bytes)));
		}
		log::warn!(target: "flintdb", "truncating {} trailing bytes from a partially written aof record", truncated_bytes);
		let f = OpenOptions::new().write(true).open(path)?;
		f.set_len(offset as u64)?;
	}

	Ok(LoadOutcome { commands_applied, truncated_bytes })
}

fn write_in_batches<W: Write>(w: &mut W, head: &[Vec<u8>], items: &[Vec<u8>]) -> Result<()> {
	for chunk in items.chunks(ITEMS_PER_CMD) {
		let mut cmd = head.to_vec();
		cmd.extend_from_slice(chunk);
		w.write_all(&encode_multibulk(&cmd))?;
	}
	Ok(())
}

/// The exact temp-file name a rewrite of `aof_path` by `pid` uses (spec §6):
/// `temp-rewriteaof-bg-<pid>.aof`, sitting next to `aof_path`.
pub fn rewrite_temp_path(aof_path: &Path, pid: libc::pid_t) -> PathBuf {
	aof_path.with_file_name(format!("temp-rewriteaof-bg-{}.aof", pid))
}

/// Compact rewrite: emit the minimal command sequence that reconstructs the
/// current keyspace to `tmp_path`. Unlike a self-contained save, the caller
/// (the parent, once this -- normally forked -- child exits successfully) is
/// responsible for layering the rewrite-buffer on top and renaming onto the
/// active log; see [`finish_rewrite`].
pub fn rewrite(ks: &Keyspace, tmp_path: &Path) -> Result<()> {
	let mut file = OpenOptions::new().create(true).write(true).truncate(true).open(tmp_path)?;
	for db in 0..ks.num_dbs() {
		if ks.dbsize(db) == 0 {
			continue;
		}
		file.write_all(&encode_multibulk(&[bulk(b"SELECT"), db.to_string().into_bytes()]))?;
		for (key, value, expiry) in ks.iter_live(db, 0) {
			use crate::value::ValueType;
			match value.value_type() {
				ValueType::String => {
					let bytes = value.string_bytes()?;
					file.write_all(&encode_multibulk(&[bulk(b"SET"), key.clone(), bytes]))?;
				}
				ValueType::List => {
					let items = value.list_items()?;
					write_in_batches(&mut file, &[bulk(b"RPUSH"), key.clone()], &items)?;
				}
				ValueType::Set => {
					let members = value.set_members()?;
					write_in_batches(&mut file, &[bulk(b"SADD"), key.clone()], &members)?;
				}
				ValueType::Hash => {
					let pairs = value.hash_items()?;
					let flat: Vec<Vec<u8>> = pairs.into_iter().flat_map(|(f, v)| vec![f, v]).collect();
					write_in_batches(&mut file, &[bulk(b"HSET"), key.clone()], &flat)?;
				}
				ValueType::Zset => {
					let pairs = value.zset_range(0, -1)?;
					let flat: Vec<Vec<u8>> =
						pairs.into_iter().flat_map(|(m, s)| vec![format!("{:.17}", s).into_bytes(), m]).collect();
					write_in_batches(&mut file, &[bulk(b"ZADD"), key.clone()], &flat)?;
				}
			}
			if let Some(deadline) = expiry {
				file.write_all(&encode_multibulk(&[bulk(b"PEXPIREAT"), key.clone(), deadline.to_string().into_bytes()]))?;
			}
		}
	}
	file.flush()?;
	file.sync_all()?;
	Ok(())
}

/// Fork a child to perform [`rewrite`] without blocking the parent's event
/// loop, the same Unix-only substitution used by `rdb::save_background`. The
/// child only writes the compacted temp file named after its own pid; it does
/// not rename it into place -- that happens in [`finish_rewrite`], on the
/// parent, once the rewrite-buffer has been layered on top.
#[cfg(unix)]
pub fn rewrite_background(ks: &Keyspace, aof_path: &Path) -> Result<libc::pid_t> {
	let pid = unsafe { libc::fork() };
	if pid < 0 {
		return Err(std::io::Error::last_os_error().into());
	}
	if pid == 0 {
		let tmp_path = rewrite_temp_path(aof_path, std::process::id() as libc::pid_t);
		let status = match rewrite(ks, &tmp_path) {
			Ok(()) => 0,
			Err(e) => {
				log::error!(target: "flintdb", "background aof rewrite failed: {}", e);
				1
			}
		};
		std::process::exit(status);
	}
	log::info!(target: "flintdb", "background aof rewrite started by pid {}", pid);
	Ok(pid)
}

/// Parent-side completion of a successful rewrite (spec §4.6): append the
/// rewrite-buffer -- commands executed between fork and reap -- onto the
/// child's temp file, fsync it, then atomically rename it over the active
/// log. Without this step every command fed to the old writer during the
/// rewrite window would be lost the moment the new file is swapped in.
pub fn finish_rewrite(aof_path: &Path, pid: libc::pid_t, rewrite_buffer: &[DynStr]) -> Result<()> {
	let tmp_path = rewrite_temp_path(aof_path, pid);
	{
		let mut file = OpenOptions::new().append(true).open(&tmp_path)?;
		for block in rewrite_buffer {
			file.write_all(block.as_slice())?;
		}
		file.flush()?;
		file.sync_all()?;
	}
	std::fs::rename(&tmp_path, aof_path)?;
	Ok(())
}

/// Parent-side cleanup after a failed rewrite: the rewrite-buffer is
/// discarded by the caller and the child's (incomplete) temp file is
/// removed; the active log is left untouched.
pub fn discard_rewrite(aof_path: &Path, pid: libc::pid_t) {
	let tmp_path = rewrite_temp_path(aof_path, pid);
	let _ = std::fs::remove_file(&tmp_path);
}

#[cfg(test)]
mod test {
	use super::*;

	fn tmp_path(name: &str) -> std::path::PathBuf {
		let dir = std::env::temp_dir().join(format!("flintdb-test-aof-{}-{}", name, std::process::id()));
		std::fs::create_dir_all(&dir).unwrap();
		dir.join("appendonly.aof")
	}

	fn open(path: &Path, policy: AofFsyncPolicy) -> AofWriter {
		AofWriter::open(path, policy, Arc::new(Bio::start())).unwrap()
	}

	#[test]
	fn expire_is_normalized_to_absolute_pexpireat() {
		let cmds = normalize_command(&[b"EXPIRE".to_vec(), b"k".to_vec(), b"10".to_vec()], 5_000).unwrap();
		assert_eq!(cmds.len(), 1);
		assert_eq!(cmds[0], vec![b"PEXPIREAT".to_vec(), b"k".to_vec(), b"15000".to_vec()]);
	}

	#[test]
	fn setex_splits_into_set_and_pexpireat() {
		let cmds = normalize_command(&[b"SETEX".to_vec(), b"k".to_vec(), b"10".to_vec(), b"v".to_vec()], 5_000).unwrap();
		assert_eq!(cmds.len(), 2);
		assert_eq!(cmds[0], vec![b"SET".to_vec(), b"k".to_vec(), b"v".to_vec()]);
		assert_eq!(cmds[1], vec![b"PEXPIREAT".to_vec(), b"k".to_vec(), b"15000".to_vec()]);
	}

	#[test]
	fn plain_command_passes_through_unchanged() {
		let cmds = normalize_command(&[b"SET".to_vec(), b"k".to_vec(), b"v".to_vec()], 0).unwrap();
		assert_eq!(cmds, vec![vec![b"SET".to_vec(), b"k".to_vec(), b"v".to_vec()]]);
	}

	#[test]
	fn write_then_load_replays_commands_in_order() {
		let path = tmp_path("replay");
		{
			let mut w = open(&path, AofFsyncPolicy::Always);
			w.feed(0, &[b"SET".to_vec(), b"a".to_vec(), b"1".to_vec()], 0).unwrap();
			w.feed(1, &[b"SET".to_vec(), b"b".to_vec(), b"2".to_vec()], 0).unwrap();
			w.flush(0).unwrap();
		}

		let mut seen = Vec::new();
		let outcome = load(&path, false, |args| {
			seen.push(args.to_vec());
			Ok(())
		})
		.unwrap();
		assert_eq!(outcome.commands_applied, 4); // SELECT 0, SET a 1, SELECT 1, SET b 2
		assert_eq!(outcome.truncated_bytes, 0);
		assert_eq!(seen[0], vec![b"SELECT".to_vec(), b"0".to_vec()]);
		assert_eq!(seen[1], vec![b"SET".to_vec(), b"a".to_vec(), b"1".to_vec()]);
		std::fs::remove_dir_all(path.parent().unwrap()).ok();
	}

	#[test]
	fn flush_is_postponed_while_a_background_fsync_is_in_flight_then_forced() {
		let path = tmp_path("everysec");
		let mut w = open(&path, AofFsyncPolicy::EverySecond);
		w.feed(0, &[b"SET".to_vec(), b"a".to_vec(), b"1".to_vec()], 0).unwrap();

		// Simulate a background fsync still running, without racing the
		// real worker thread that would otherwise service a queued job
		// almost immediately.
		w.bio.set_fsync_pending_for_test(1);

		w.flush(0).unwrap();
		assert_eq!(w.delayed_fsync_count, 0, "first flush should be postponed, not forced");

		w.flush(500).unwrap();
		assert_eq!(w.delayed_fsync_count, 0, "still within the 2s grace window");

		w.flush(2_500).unwrap();
		assert_eq!(w.delayed_fsync_count, 1, "past the grace window the write proceeds and is counted");

		std::fs::remove_dir_all(path.parent().unwrap()).ok();
	}

	#[test]
	fn truncated_trailing_record_is_repaired_when_allowed() {
		let path = tmp_path("repair");
		{
			let mut w = open(&path, AofFsyncPolicy::Always);
			w.feed(0, &[b"SET".to_vec(), b"a".to_vec(), b"1".to_vec()], 0).unwrap();
			w.flush(0).unwrap();
		}
		// Simulate a crash mid-write of the next command.
		{
			let mut f = OpenOptions::new().append(true).open(&path).unwrap();
			f.write_all(b"*3\r\n$3\r\nSET\r\n$1\r\nb").unwrap();
		}
		let before_len = std::fs::metadata(&path).unwrap().len();
		let outcome = load(&path, true, |_args| Ok(())).unwrap();
		assert_eq!(outcome.commands_applied, 2); // SELECT 0, SET a 1
		assert!(outcome.truncated_bytes > 0);
		let after_len = std::fs::metadata(&path).unwrap().len();
		assert!(after_len < before_len);
		std::fs::remove_dir_all(path.parent().unwrap()).ok();
	}

	#[test]
	fn truncated_trailing_record_errors_when_repair_disallowed() {
		let path = tmp_path("no-repair");
		{
			let mut w = open(&path, AofFsyncPolicy::Always);
			w.feed(0, &[b"SET".to_vec(), b"a".to_vec(), b"1".to_vec()], 0).unwrap();
			w.flush(0).unwrap();
		}
		{
			let mut f = OpenOptions::new().append(true).open(&path).unwrap();
			f.write_all(b"*3\r\n$3\r\nSET\r\n$1\r\nb").unwrap();
		}
		assert!(load(&path, false, |_args| Ok(())).is_err());
		std::fs::remove_dir_all(path.parent().unwrap()).ok();
	}

	#[test]
	fn rewrite_reconstructs_equivalent_commands() {
		let limits = EncodingLimits::default();
		let mut ks = Keyspace::new(1);
		ks.set(0, b"k", crate::value::TypedValue::new_string(b"v"), 0);
		let mut list = crate::value::TypedValue::new_list();
		list.list_push(b"x", false, &limits).unwrap();
		ks.set(0, b"l", list, 0);

		let path = tmp_path("rewrite");
		let tmp = rewrite_temp_path(&path, std::process::id() as libc::pid_t);
		rewrite(&ks, &tmp).unwrap();
		std::fs::rename(&tmp, &path).unwrap();

		let mut seen = Vec::new();
		load(&path, false, |args| {
			seen.push(args.to_vec());
			Ok(())
		})
		.unwrap();
		assert!(seen.iter().any(|c| c[0] == b"SET" && c[1] == b"k"));
		assert!(seen.iter().any(|c| c[0] == b"RPUSH" && c[1] == b"l"));
		std::fs::remove_dir_all(path.parent().unwrap()).ok();
	}

	#[test]
	fn rewrite_buffer_captures_concurrent_writes_and_is_replayed_after_finish() {
		let mut ks = Keyspace::new(1);
		ks.set(0, b"k", crate::value::TypedValue::new_string(b"v"), 0);

		let path = tmp_path("rewrite-buffer");
		let pid = std::process::id() as libc::pid_t;
		let tmp = rewrite_temp_path(&path, pid);
		rewrite(&ks, &tmp).unwrap();

		let mut w = open(&path, AofFsyncPolicy::Always);
		w.begin_rewrite_capture();
		w.feed(0, &[b"SET".to_vec(), b"during_rewrite".to_vec(), b"1".to_vec()], 0).unwrap();
		let blocks = w.take_rewrite_capture().unwrap();

		finish_rewrite(&path, pid, &blocks).unwrap();

		let mut seen = Vec::new();
		load(&path, false, |args| {
			seen.push(args.to_vec());
			Ok(())
		})
		.unwrap();
		assert!(seen.iter().any(|c| c[0] == b"SET" && c[1] == b"k"));
		assert!(seen.iter().any(|c| c[0] == b"SET" && c[1] == b"during_rewrite"));
		std::fs::remove_dir_all(path.parent().unwrap()).ok();
	}

	#[test]
	fn short_write_truncates_back_to_last_known_good_size() {
		let path = tmp_path("short-write");
		let mut w = open(&path, AofFsyncPolicy::Always);
		w.feed(0, &[b"SET".to_vec(), b"a".to_vec(), b"1".to_vec()], 0).unwrap();
		w.flush(0).unwrap();
		let good_size = w.good_size;

		// Simulate the kernel having physically written a few garbage bytes
		// past the last known good size before giving up partway through a
		// write -- exactly what `handle_short_write` must undo.
		{
			let mut f = OpenOptions::new().append(true).open(&path).unwrap();
			f.write_all(b"@@@").unwrap();
		}
		assert!(std::fs::metadata(&path).unwrap().len() > good_size);

		w.buf.append(b"pretend this never made it to disk");
		let result = w.handle_short_write(3, w.buf.len());
		assert!(matches!(result, Err(Error::ShortWrite)));
		assert_eq!(std::fs::metadata(&path).unwrap().len(), good_size);
		assert!(w.buf.is_empty());

		std::fs::remove_dir_all(path.parent().unwrap()).ok();
	}
}
