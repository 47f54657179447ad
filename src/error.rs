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

use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
	Io(std::io::Error),
	WrongType,
	OutOfRange,
	NoKey,
	KeyExists,
	SyntaxError,
	ProtocolError(String),
	OutOfMemory,
	Corruption(String),
	ShortWrite,
	ChildFailure(String),
	BufferLimitExceeded,
	Locked(String),
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Error::Io(e) => write!(f, "io error: {}", e),
			Error::WrongType => write!(f, "WRONGTYPE operation against a key holding the wrong kind of value"),
			Error::OutOfRange => write!(f, "value is out of range"),
			Error::NoKey => write!(f, "no such key"),
			Error::KeyExists => write!(f, "key already exists"),
			Error::SyntaxError => write!(f, "syntax error"),
			Error::ProtocolError(msg) => write!(f, "protocol error: {}", msg),
			Error::OutOfMemory => write!(f, "command not allowed when used memory > 'maxmemory'"),
			Error::Corruption(msg) => write!(f, "data corruption: {}", msg),
			Error::ShortWrite => write!(f, "short write while appending to the log"),
			Error::ChildFailure(msg) => write!(f, "background child failed: {}", msg),
			Error::BufferLimitExceeded => write!(f, "client output buffer limit exceeded"),
			Error::Locked(msg) => write!(f, "{}", msg),
		}
	}
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
	fn from(e: std::io::Error) -> Error {
		Error::Io(e)
	}
}

impl Error {
	/// Whether this error is recoverable at the client-reply level, as opposed
	/// to requiring process termination (see spec §7).
	pub fn is_fatal(&self) -> bool {
		matches!(self, Error::Corruption(_) | Error::Locked(_))
	}
}
