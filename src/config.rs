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

//! Server configuration, loaded from CLI flags the way the teacher's
//! `admin`/`migrate` binaries parse theirs with `structopt`.

use std::path::PathBuf;
use structopt::StructOpt;

#[derive(Clone, Copy, Debug)]
pub struct EncodingLimits {
	pub list_max_entries: usize,
	pub list_max_value_bytes: usize,
	pub set_max_entries: usize,
	pub hash_max_entries: usize,
	pub hash_max_value_bytes: usize,
	pub zset_max_entries: usize,
	pub zset_max_value_bytes: usize,
}

impl Default for EncodingLimits {
	fn default() -> EncodingLimits {
		EncodingLimits {
			list_max_entries: 128,
			list_max_value_bytes: 64,
			set_max_entries: 512,
			hash_max_entries: 128,
			hash_max_value_bytes: 64,
			zset_max_entries: 128,
			zset_max_value_bytes: 64,
		}
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AofFsyncPolicy {
	Always,
	EverySecond,
	No,
}

impl std::str::FromStr for AofFsyncPolicy {
	type Err = String;
	fn from_str(s: &str) -> Result<AofFsyncPolicy, String> {
		match s {
			"always" => Ok(AofFsyncPolicy::Always),
			"everysec" | "every_second" => Ok(AofFsyncPolicy::EverySecond),
			"no" => Ok(AofFsyncPolicy::No),
			other => Err(format!("unknown appendfsync policy {:?}", other)),
		}
	}
}

#[derive(Debug, StructOpt)]
#[structopt(name = "flintd", about = "Single-threaded, event-driven in-memory key-value store")]
pub struct Config {
	/// Directory holding the RDB file, AOF file and value tables.
	#[structopt(long, default_value = ".")]
	pub dir: PathBuf,

	/// Bind address for the client-facing TCP listener.
	#[structopt(long, default_value = "127.0.0.1:6390")]
	pub bind: String,

	/// Number of logical databases.
	#[structopt(long, default_value = "16")]
	pub databases: usize,

	#[structopt(long, default_value = "dump.rdb")]
	pub rdb_filename: String,

	#[structopt(long, default_value = "appendonly.aof")]
	pub aof_filename: String,

	/// Whether the append-only log is enabled at all.
	#[structopt(long)]
	pub appendonly: bool,

	#[structopt(long, default_value = "everysec")]
	pub appendfsync: AofFsyncPolicy,

	/// Max bytes accepted for a single inline request line.
	#[structopt(long, default_value = "65536")]
	pub max_inline_len: usize,

	/// Max bytes accepted for a single multi-bulk argument.
	#[structopt(long, default_value = "536870912")]
	pub max_bulk_len: usize,

	/// Hard limit on a client's queued output bytes before an async close.
	#[structopt(long, default_value = "268435456")]
	pub client_output_hard_limit: usize,

	/// Soft limit on a client's queued output bytes.
	#[structopt(long, default_value = "67108864")]
	pub client_output_soft_limit: usize,

	/// Seconds a client may stay over the soft limit before being closed.
	#[structopt(long, default_value = "60")]
	pub client_output_soft_seconds: u64,

	/// Keys sampled per database per maintenance tick for active expiration.
	#[structopt(long, default_value = "20")]
	pub maintenance_sample_size: usize,

	/// Event loop maintenance tick period, in milliseconds.
	#[structopt(long, default_value = "100")]
	pub maintenance_period_ms: u64,

	#[structopt(skip)]
	pub encoding_limits: EncodingLimitsArg,
}

/// Wrapper so `EncodingLimits` (which isn't itself CLI-parseable field by
/// field without a lot of boilerplate flags nobody will tune per spec
/// scope) can still live on `Config` with `#[structopt(skip)]` defaulting
/// it.
#[derive(Clone, Copy, Debug)]
pub struct EncodingLimitsArg(pub EncodingLimits);

impl Default for EncodingLimitsArg {
	fn default() -> EncodingLimitsArg {
		EncodingLimitsArg(EncodingLimits::default())
	}
}

impl Config {
	pub fn rdb_path(&self) -> PathBuf {
		self.dir.join(&self.rdb_filename)
	}

	pub fn aof_path(&self) -> PathBuf {
		self.dir.join(&self.aof_filename)
	}

	pub fn limits(&self) -> EncodingLimits {
		self.encoding_limits.0
	}
}
