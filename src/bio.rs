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

//! Background I/O (BIO): a small fixed-size pool of worker threads taking
//! `fsync(fd)`/`close(fd)` jobs off a FIFO queue, so a slow disk never blocks
//! the single command-dispatch thread (spec §5/§9). One worker per job kind;
//! producers bump a per-kind pending counter before sending and workers
//! decrement it after the syscall returns, so the main thread can sample it
//! without a lock.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

enum Job {
	Fsync(RawFd),
	Close(RawFd),
}

pub struct Bio {
	tx: Sender<Job>,
	fsync_pending: Arc<AtomicU64>,
	close_pending: Arc<AtomicU64>,
}

impl Bio {
	/// Spawn the worker pool. Workers run until the last `Bio`/`Sender` is
	/// dropped, which only happens at process exit (the server holds one for
	/// its entire lifetime), so there is no join/shutdown handshake.
	pub fn start() -> Bio {
		let (tx, rx) = mpsc::channel::<Job>();
		let rx = Arc::new(Mutex::new(rx));
		let fsync_pending = Arc::new(AtomicU64::new(0));
		let close_pending = Arc::new(AtomicU64::new(0));

		for _ in 0..2 {
			let rx = rx.clone();
			let fsync_pending = fsync_pending.clone();
			let close_pending = close_pending.clone();
			thread::spawn(move || loop {
				let job = {
					let rx = rx.lock().unwrap();
					rx.recv()
				};
				match job {
					Ok(Job::Fsync(fd)) => {
						unsafe {
							libc::fsync(fd);
						}
						fsync_pending.fetch_sub(1, Ordering::SeqCst);
					}
					Ok(Job::Close(fd)) => {
						unsafe {
							libc::close(fd);
						}
						close_pending.fetch_sub(1, Ordering::SeqCst);
					}
					Err(_) => break,
				}
			});
		}

		Bio { tx, fsync_pending, close_pending }
	}

	pub fn queue_fsync(&self, fd: RawFd) {
		self.fsync_pending.fetch_add(1, Ordering::SeqCst);
		let _ = self.tx.send(Job::Fsync(fd));
	}

	pub fn queue_close(&self, fd: RawFd) {
		self.close_pending.fetch_add(1, Ordering::SeqCst);
		let _ = self.tx.send(Job::Close(fd));
	}

	/// Number of `fsync` jobs submitted but not yet completed. Sampled by
	/// `AofWriter::flush` to decide whether to postpone a write (spec §4.6).
	pub fn fsync_pending(&self) -> u64 {
		self.fsync_pending.load(Ordering::SeqCst)
	}

	#[cfg(test)]
	pub fn close_pending(&self) -> u64 {
		self.close_pending.load(Ordering::SeqCst)
	}

	/// Deterministically simulate a job still being in flight, without
	/// racing the real worker threads that would otherwise service it
	/// almost immediately for a local test fixture.
	#[cfg(test)]
	pub fn set_fsync_pending_for_test(&self, n: u64) {
		self.fsync_pending.store(n, Ordering::SeqCst);
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use std::io::Write;

	#[test]
	fn fsync_job_runs_and_counter_drains() {
		let dir = std::env::temp_dir().join(format!("flintdb-test-bio-fsync-{}", std::process::id()));
		std::fs::create_dir_all(&dir).unwrap();
		let path = dir.join("f");
		let mut f = std::fs::File::create(&path).unwrap();
		f.write_all(b"hello").unwrap();

		use std::os::unix::io::AsRawFd;
		let bio = Bio::start();
		bio.queue_fsync(f.as_raw_fd());

		let mut waited_ms = 0;
		while bio.fsync_pending() > 0 && waited_ms < 2000 {
			thread::sleep(std::time::Duration::from_millis(10));
			waited_ms += 10;
		}
		assert_eq!(bio.fsync_pending(), 0);
		std::fs::remove_dir_all(&dir).ok();
	}

	#[test]
	fn close_job_runs_and_counter_drains() {
		use std::os::unix::io::IntoRawFd;
		let dir = std::env::temp_dir().join(format!("flintdb-test-bio-close-{}", std::process::id()));
		std::fs::create_dir_all(&dir).unwrap();
		let path = dir.join("f");
		let f = std::fs::File::create(&path).unwrap();
		let fd = f.into_raw_fd();

		let bio = Bio::start();
		bio.queue_close(fd);

		let mut waited_ms = 0;
		while bio.close_pending() > 0 && waited_ms < 2000 {
			thread::sleep(std::time::Duration::from_millis(10));
			waited_ms += 10;
		}
		assert_eq!(bio.close_pending(), 0);
		std::fs::remove_dir_all(&dir).ok();
	}
}
