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

//! Server-wide collaborators, constructed once and shared by reference.
//!
//! The original reached for a pair of process-wide singletons — `Log` and
//! `SqlConnPool` — each with its own `Instance()` accessor. Here they are
//! plain fields on a `Context` built once at startup and handed to the
//! server loop and, via `Arc`, to every worker task (§9 of the design
//! notes: dependency injection in place of singletons).

use std::sync::Arc;

use crate::config::Config;
use crate::db::DbPool;
use crate::error::ServerError;
use crate::logging::Logger;

/// Configuration, the optional background logger, and the database pool —
/// everything a connection's worker task needs beyond its own state.
pub struct Context {
    /// The configuration this context was built from.
    pub config: Config,
    logger: Option<Logger>,
    /// Shared handle to the bounded database connection pool.
    pub db: Arc<DbPool>,
}

impl Context {
    /// Validates `config`, then establishes the logger (if enabled) and the
    /// database pool.
    pub fn new(config: Config) -> Result<Self, ServerError> {
        config.validate()?;

        let logger = if config.log.enabled {
            Some(Logger::init(&config.log.dir, config.log.queue_capacity)?)
        } else {
            None
        };

        let db = DbPool::init(&config.db, config.db_pool_size)?;

        Ok(Self { config, logger, db })
    }

    /// Queues a line to the background logger, if one is configured.
    pub fn log(&self, line: impl Into<String>) {
        if let Some(logger) = &self.logger {
            logger.log(line);
        }
    }
}
