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

//! Crate-wide error types.
//!
//! POSIX-facing operations (buffer, reactor, connection) stay on
//! [`std::io::Result`] the way the rest of this crate's lineage does.
//! `thiserror` is reserved for the boundaries where a plain [`std::io::Error`]
//! would throw away useful context: database pool setup and configuration.

use thiserror::Error;

/// Failures constructing or operating the database handle pool.
#[derive(Debug, Error)]
pub enum DbError {
    /// The underlying MySQL client returned an error.
    #[error("mysql error: {0}")]
    Mysql(#[from] mysql::Error),
    /// `init` was asked to create a pool of size zero.
    #[error("db pool size must be non-zero")]
    ZeroSize,
    /// The pool's bounded queue was empty and the caller used the
    /// non-blocking path.
    #[error("db pool busy")]
    Busy,
}

/// Failures building a [`crate::config::Config`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A pool size field was zero.
    #[error("{field} must be non-zero")]
    ZeroSize {
        /// Name of the offending field.
        field: &'static str,
    },
    /// The configured resource directory does not exist.
    #[error("resource directory {0:?} does not exist")]
    MissingResourceDir(std::path::PathBuf),
}

/// Aggregate error type for the server's non-I/O fallible boundaries.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Wraps any POSIX-level I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Wraps a database pool failure.
    #[error(transparent)]
    Db(#[from] DbError),
    /// Wraps a configuration failure.
    #[error(transparent)]
    Config(#[from] ConfigError),
}
