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

use flintdb::config::Config;
use flintdb::server::Server;
use structopt::StructOpt;

fn main() {
	env_logger::init();
	let config = Config::from_args();

	match fdlimit::raise_fd_limit() {
		Some(limit) => log::info!(target: "flintdb", "raised fd limit to {}", limit),
		None => log::warn!(target: "flintdb", "failed to raise fd limit"),
	}

	let mut server = match Server::new(config) {
		Ok(s) => s,
		Err(e) => {
			log::error!(target: "flintdb", "failed to start: {}", e);
			std::process::exit(1);
		}
	};

	if let Err(e) = server.run() {
		log::error!(target: "flintdb", "event loop exited with error: {}", e);
		std::process::exit(1);
	}
}
