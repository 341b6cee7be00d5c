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

//! Server configuration surface.

use std::path::PathBuf;

use crate::error::ConfigError;

/// Readiness trigger mode for the listener and connection sockets.
///
/// Matches the original `trigMode` switch: `0` leaves both level-triggered,
/// `1`/`2` flip one side to edge-triggered, and anything else (including the
/// default) flips both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerMode {
    /// Whether the listening socket is armed edge-triggered.
    pub listen_et: bool,
    /// Whether connection sockets are armed edge-triggered.
    pub conn_et: bool,
}

impl TriggerMode {
    /// Builds a [`TriggerMode`] from the original's numeric `trigMode` values.
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => TriggerMode { listen_et: false, conn_et: false },
            1 => TriggerMode { listen_et: false, conn_et: true },
            2 => TriggerMode { listen_et: true, conn_et: false },
            _ => TriggerMode { listen_et: true, conn_et: true },
        }
    }
}

impl Default for TriggerMode {
    fn default() -> Self {
        Self::from_code(3)
    }
}

/// Database connection parameters.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Hostname or address of the database server.
    pub host: String,
    /// TCP port of the database server.
    pub port: u16,
    /// Username used to authenticate.
    pub user: String,
    /// Password used to authenticate.
    pub password: String,
    /// Database (schema) name to select after connecting.
    pub db_name: String,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3306,
            user: "root".to_string(),
            password: String::new(),
            db_name: "tinyweb".to_string(),
        }
    }
}

/// Logging parameters.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Whether the background file logger is enabled at all.
    pub enabled: bool,
    /// Minimum level a record must meet to be queued.
    pub level: tracing::Level,
    /// Capacity of the bounded producer/consumer queue.
    pub queue_capacity: usize,
    /// Directory dated log files are written under.
    pub dir: PathBuf,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: tracing::Level::INFO,
            queue_capacity: 1024,
            dir: PathBuf::from("./log"),
        }
    }
}

/// Top-level server configuration, gathering every parameter named in the
/// external interface: listen port, trigger mode, idle timeout, DB
/// connection and pool size, worker pool size, logging, and the resource
/// directory root static files are served from.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP port the listener binds.
    pub port: u16,
    /// Edge/level trigger configuration for listener and connections.
    pub trigger_mode: TriggerMode,
    /// Idle-connection timeout, in milliseconds. Zero disables the timer.
    pub timeout_ms: u64,
    /// Database connection parameters.
    pub db: DbConfig,
    /// Number of handles held open in the database pool.
    pub db_pool_size: usize,
    /// Number of worker threads draining the task queue.
    pub worker_pool_size: usize,
    /// Root directory static files and error pages are served from.
    pub resource_dir: PathBuf,
    /// Logging configuration.
    pub log: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 9006,
            trigger_mode: TriggerMode::default(),
            timeout_ms: 60_000,
            db: DbConfig::default(),
            db_pool_size: 8,
            worker_pool_size: 8,
            resource_dir: PathBuf::from("./resources"),
            log: LogConfig::default(),
        }
    }
}

impl Config {
    /// Validates the configuration, rejecting zero-sized pools and a
    /// resource directory that does not exist.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.db_pool_size == 0 {
            return Err(ConfigError::ZeroSize { field: "db_pool_size" });
        }
        if self.worker_pool_size == 0 {
            return Err(ConfigError::ZeroSize { field: "worker_pool_size" });
        }
        if !self.resource_dir.exists() {
            return Err(ConfigError::MissingResourceDir(self.resource_dir.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn trigger_mode_matches_original_switch() {
        assert_eq!(TriggerMode::from_code(0), TriggerMode { listen_et: false, conn_et: false });
        assert_eq!(TriggerMode::from_code(1), TriggerMode { listen_et: false, conn_et: true });
        assert_eq!(TriggerMode::from_code(2), TriggerMode { listen_et: true, conn_et: false });
        assert_eq!(TriggerMode::from_code(3), TriggerMode { listen_et: true, conn_et: true });
        assert_eq!(TriggerMode::from_code(99), TriggerMode::from_code(3));
    }

    #[test]
    fn validate_rejects_zero_pool_sizes() {
        let mut cfg = Config { resource_dir: std::env::temp_dir(), ..Config::default() };
        cfg.db_pool_size = 0;
        assert!(cfg.validate().is_err());
    }
}
