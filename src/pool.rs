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

//! Fixed-size worker pool draining a FIFO task queue.
//!
//! Ported from the original's `ThreadPool`: a shared `Mutex<VecDeque<Task>>`
//! guarded by a `Condvar`, with a `closed` flag distinguishing "stop
//! accepting new work" from "let in-flight tasks finish". Unlike the
//! original's detached threads, shutdown here is structured: `Drop` joins
//! every worker, per this repository's "detached worker threads" redesign
//! flag.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

type Task = Box<dyn FnOnce() + Send + 'static>;

struct Shared {
    queue: Mutex<VecDeque<Task>>,
    condvar: Condvar,
    closed: Mutex<bool>,
}

/// A fixed set of worker threads draining a shared task queue.
pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool").field("workers", &self.workers.len()).finish()
    }
}

impl WorkerPool {
    /// Spawns `size` worker threads (the original's default is 8).
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "worker pool size must be non-zero");

        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
            closed: Mutex::new(false),
        });

        let workers = (0..size)
            .map(|i| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("worker-{i}"))
                    .spawn(move || Self::run(shared))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self { shared, workers }
    }

    fn run(shared: Arc<Shared>) {
        loop {
            let mut queue = shared.queue.lock().unwrap();
            loop {
                if let Some(task) = queue.pop_front() {
                    drop(queue);
                    task();
                    break;
                }
                if *shared.closed.lock().unwrap() {
                    return;
                }
                queue = shared.condvar.wait(queue).unwrap();
            }
        }
    }

    /// Enqueues `task`, waking exactly one waiting worker. Silently dropped
    /// if the pool has already been closed.
    pub fn submit(&self, task: impl FnOnce() + Send + 'static) {
        if *self.shared.closed.lock().unwrap() {
            return;
        }
        self.shared.queue.lock().unwrap().push_back(Box::new(task));
        self.shared.condvar.notify_one();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        *self.shared.closed.lock().unwrap() = true;
        self.shared.condvar.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn submitted_tasks_run() {
        let pool = WorkerPool::new(4);
        let (tx, rx) = mpsc::channel();
        for i in 0..16 {
            let tx = tx.clone();
            pool.submit(move || tx.send(i).unwrap());
        }
        drop(tx);
        let mut results: Vec<_> = rx.iter().collect();
        results.sort_unstable();
        assert_eq!(results, (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn drop_drains_in_flight_tasks_before_returning() {
        let (tx, rx) = mpsc::channel();
        {
            let pool = WorkerPool::new(2);
            for i in 0..4 {
                let tx = tx.clone();
                pool.submit(move || {
                    thread::sleep(Duration::from_millis(5));
                    tx.send(i).unwrap();
                });
            }
        } // Drop runs here, joining all workers.
        drop(tx);
        assert_eq!(rx.iter().count(), 4);
    }
}
