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

//! Binary entry point: builds the default configuration, wires up
//! structured logging, and runs the server loop to completion.

use std::process::ExitCode;
use std::sync::Arc;

use tinyweb::config::Config;
use tinyweb::context::Context;
use tinyweb::server::Server;

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let config = Config::default();
    let context = match Context::new(config) {
        Ok(context) => Arc::new(context),
        Err(e) => {
            tracing::error!(error = %e, "failed to initialize server context");
            return ExitCode::FAILURE;
        }
    };

    let mut server = match Server::new(context) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "failed to bind listener");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = server.run() {
        tracing::error!(error = %e, "server loop exited with an error");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
