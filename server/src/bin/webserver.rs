// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! CLI entry point: parse configuration, bind the server, run to completion.

use clap::Parser;
use rask_server::{config::Config, server::Server};
use tracing::error;

fn main() {
    let _guard = rask_server::logging::init();
    let config = Config::parse();

    let server = match Server::bind(&config) {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "failed to start server");
            std::process::exit(e.exit_code());
        }
    };

    server.run();
}
