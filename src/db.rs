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

//! Bounded database handle pool.
//!
//! Ported from the original's `SqlConnPool`: a mutex-guarded queue of
//! handles with an external counting semaphore whose value tracks the
//! number of free handles. The scoped-acquisition guard
//! ([`PooledConn`]) is this crate's Rust `Drop` translation of
//! `SqlConnRAII` — it releases the handle back to the pool on every exit
//! path, including early returns and panics, which the original's
//! constructor/destructor pair achieved through RAII in C++.
//!
//! `get()` is the blocking path used by the common call site: it waits on
//! the semaphore, then pops the queue. `try_get()` is the non-blocking path
//! used by the one call site the original special-cased with an upfront
//! `connQue_.empty()` check that bypasses the semaphore wait entirely —
//! both branches are preserved per §7/§9 of the design notes, rather than
//! collapsing them into a single blocking path.

use std::collections::VecDeque;
use std::mem::ManuallyDrop;
use std::sync::{Arc, Mutex};

use std_semaphore::Semaphore;

use crate::config::DbConfig;
use crate::error::DbError;

/// A bounded pool of [`mysql::Conn`] handles.
pub struct DbPool {
    queue: Mutex<VecDeque<mysql::Conn>>,
    free: Semaphore,
    capacity: usize,
}

impl std::fmt::Debug for DbPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbPool").field("capacity", &self.capacity).finish()
    }
}

impl DbPool {
    /// Establishes `db.pool_size`-equivalent handles up front and
    /// initializes the counting semaphore to that count.
    pub fn init(config: &DbConfig, size: usize) -> Result<Arc<Self>, DbError> {
        if size == 0 {
            return Err(DbError::ZeroSize);
        }

        let opts = mysql::OptsBuilder::new()
            .ip_or_hostname(Some(config.host.clone()))
            .tcp_port(config.port)
            .user(Some(config.user.clone()))
            .pass(Some(config.password.clone()))
            .db_name(Some(config.db_name.clone()));

        let mut queue = VecDeque::with_capacity(size);
        for _ in 0..size {
            queue.push_back(mysql::Conn::new(opts.clone())?);
        }

        Ok(Arc::new(Self { queue: Mutex::new(queue), free: Semaphore::new(size as isize), capacity: size }))
    }

    /// Blocks on the counting semaphore until a handle is free, then pops
    /// the queue head. Matches the common `GetConn` call site.
    pub fn get(self: &Arc<Self>) -> PooledConn {
        self.free.acquire();
        let conn = self
            .queue
            .lock()
            .unwrap()
            .pop_front()
            .expect("semaphore permit without a queued connection");
        PooledConn { conn: ManuallyDrop::new(conn), pool: Arc::clone(self) }
    }

    /// Non-blocking variant used by the one call site that checks for an
    /// empty queue up front and gives up immediately rather than waiting,
    /// preserving the original's two-branch quirk.
    pub fn try_get(self: &Arc<Self>) -> Result<PooledConn, DbError> {
        let mut queue = self.queue.lock().unwrap();
        if queue.is_empty() {
            return Err(DbError::Busy);
        }
        self.free.acquire();
        let conn = queue.pop_front().expect("checked non-empty above");
        drop(queue);
        Ok(PooledConn { conn: ManuallyDrop::new(conn), pool: Arc::clone(self) })
    }

    fn check_in(&self, conn: mysql::Conn) {
        self.queue.lock().unwrap().push_back(conn);
        self.free.release();
    }

    /// Number of handles currently free (approximate under concurrent use,
    /// exact at any instant the queue lock is held).
    pub fn free_count(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// Total handles the pool was initialised with.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// A scoped acquisition guard over a [`mysql::Conn`]. Returns its handle to
/// the owning [`DbPool`] on drop, on every exit path.
pub struct PooledConn {
    conn: ManuallyDrop<mysql::Conn>,
    pool: Arc<DbPool>,
}

impl std::ops::Deref for PooledConn {
    type Target = mysql::Conn;
    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl std::ops::DerefMut for PooledConn {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        // SAFETY: `conn` is never read again after this `take`.
        let conn = unsafe { ManuallyDrop::take(&mut self.conn) };
        self.pool.check_in(conn);
    }
}

#[cfg(test)]
mod test {
    // `DbPool::init` requires a live MySQL server to connect to, so these
    // tests exercise only the parts that do not need a real connection.
    use super::*;

    #[test]
    fn init_rejects_zero_size() {
        let err = DbPool::init(&DbConfig::default(), 0).unwrap_err();
        assert!(matches!(err, DbError::ZeroSize));
    }
}
