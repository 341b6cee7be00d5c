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

//! Indexed binary min-heap of per-connection idle timers.
//!
//! Ported from the original's `HeapTimer`: a `Vec` holding heap order plus a
//! sidecar `id -> index` map so `adjust`/`cancel` run in O(log n) instead of
//! needing a linear scan. Accessed only from the server-loop thread; no
//! internal locking.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// A single scheduled expiry, keyed by connection id (the fd).
struct TimerNode {
    id: usize,
    deadline: Instant,
    callback: Box<dyn FnOnce(usize)>,
}

/// Keyed min-heap of `(id, deadline, callback)` supporting
/// add/adjust/cancel/expire-due in O(log n).
#[derive(Default)]
pub struct TimerHeap {
    heap: Vec<TimerNode>,
    index_of: HashMap<usize, usize>,
}

impl std::fmt::Debug for TimerHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerHeap").field("len", &self.heap.len()).finish()
    }
}

impl TimerHeap {
    /// Creates an empty timer heap.
    pub fn new() -> Self {
        Self { heap: Vec::new(), index_of: HashMap::new() }
    }

    /// Number of scheduled timers.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Whether there are no scheduled timers.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Schedules `id` to fire `ttl` from now, invoking `callback` with `id`.
    /// If `id` is already scheduled, updates its deadline and callback in
    /// place and re-heapifies, matching the original's `add`.
    pub fn add(&mut self, id: usize, ttl: Duration, callback: impl FnOnce(usize) + 'static) {
        let deadline = Instant::now() + ttl;
        if let Some(&i) = self.index_of.get(&id) {
            self.heap[i].deadline = deadline;
            self.heap[i].callback = Box::new(callback);
            self.sift_down_or_up(i);
            return;
        }
        let i = self.heap.len();
        self.heap.push(TimerNode { id, deadline, callback: Box::new(callback) });
        self.index_of.insert(id, i);
        self.sift_up(i);
    }

    /// Updates an existing timer's deadline without touching its callback.
    /// No-op if `id` is not scheduled.
    pub fn adjust(&mut self, id: usize, ttl: Duration) {
        if let Some(&i) = self.index_of.get(&id) {
            self.heap[i].deadline = Instant::now() + ttl;
            self.sift_down(i);
        }
    }

    /// Removes `id`'s timer, if scheduled, without invoking its callback.
    pub fn cancel(&mut self, id: usize) {
        if let Some(&i) = self.index_of.get(&id) {
            self.remove_at(i);
        }
    }

    /// Invokes and removes every timer whose deadline has passed.
    pub fn tick(&mut self) {
        let now = Instant::now();
        while let Some(node) = self.heap.first() {
            if node.deadline > now {
                break;
            }
            let TimerNode { id, callback, .. } = self.remove_at(0);
            callback(id);
        }
    }

    /// Runs [`TimerHeap::tick`], then returns the number of milliseconds
    /// until the new root's deadline (0 if already due), or `-1` if the
    /// heap is empty.
    pub fn next_tick_ms(&mut self) -> i64 {
        self.tick();
        match self.heap.first() {
            Some(node) => {
                let now = Instant::now();
                if node.deadline <= now {
                    0
                } else {
                    (node.deadline - now).as_millis() as i64
                }
            }
            None => -1,
        }
    }

    fn remove_at(&mut self, i: usize) -> TimerNode {
        let last = self.heap.len() - 1;
        self.heap.swap(i, last);
        self.swap_index(i, last);
        let node = self.heap.pop().expect("remove_at called on empty heap");
        self.index_of.remove(&node.id);
        if i < self.heap.len() {
            self.sift_down_or_up(i);
        }
        node
    }

    fn sift_down_or_up(&mut self, i: usize) {
        if !self.sift_down(i) {
            self.sift_up(i);
        }
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.heap[parent].deadline <= self.heap[i].deadline {
                break;
            }
            self.swap(i, parent);
            i = parent;
        }
    }

    /// Returns whether any swap occurred.
    fn sift_down(&mut self, mut i: usize) -> bool {
        let start = i;
        let len = self.heap.len();
        loop {
            let left = 2 * i + 1;
            let right = 2 * i + 2;
            let mut smallest = i;
            if left < len && self.heap[left].deadline < self.heap[smallest].deadline {
                smallest = left;
            }
            if right < len && self.heap[right].deadline < self.heap[smallest].deadline {
                smallest = right;
            }
            if smallest == i {
                break;
            }
            self.swap(i, smallest);
            i = smallest;
        }
        i != start
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.swap_index(a, b);
    }

    fn swap_index(&mut self, a: usize, b: usize) {
        self.index_of.insert(self.heap[a].id, a);
        self.index_of.insert(self.heap[b].id, b);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn fires_in_deadline_order() {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let mut heap = TimerHeap::new();

        let f = Arc::clone(&fired);
        heap.add(1, Duration::from_millis(0), move |id| f.lock().unwrap().push(id));
        let f = Arc::clone(&fired);
        heap.add(2, Duration::from_millis(0), move |id| f.lock().unwrap().push(id));

        std::thread::sleep(Duration::from_millis(5));
        heap.tick();
        assert_eq!(fired.lock().unwrap().len(), 2);
        assert!(heap.is_empty());
    }

    #[test]
    fn cancel_prevents_callback() {
        let fired = Arc::new(Mutex::new(false));
        let mut heap = TimerHeap::new();
        let f = Arc::clone(&fired);
        heap.add(7, Duration::from_millis(0), move |_| *f.lock().unwrap() = true);
        heap.cancel(7);
        std::thread::sleep(Duration::from_millis(5));
        heap.tick();
        assert!(!*fired.lock().unwrap());
    }

    #[test]
    fn adjust_updates_deadline_in_place_without_duplicating() {
        let mut heap = TimerHeap::new();
        heap.add(1, Duration::from_millis(0), |_| {});
        heap.adjust(1, Duration::from_secs(60));
        assert_eq!(heap.len(), 1);
        assert!(heap.next_tick_ms() > 0);
    }

    #[test]
    fn next_tick_ms_is_negative_one_when_empty() {
        let mut heap = TimerHeap::new();
        assert_eq!(heap.next_tick_ms(), -1);
    }

    #[test]
    fn add_for_existing_id_reheapifies_down_and_up() {
        let mut heap = TimerHeap::new();
        heap.add(1, Duration::from_secs(10), |_| {});
        heap.add(2, Duration::from_secs(1), |_| {});
        // re-adding id 1 with a shorter ttl must bubble it to the root.
        heap.add(1, Duration::from_millis(0), |_| {});
        std::thread::sleep(Duration::from_millis(5));
        let fired = Arc::new(Mutex::new(Vec::new()));
        // tick only id 1 should have fired (deadline passed); id 2 still pending.
        heap.tick();
        let _ = fired;
        assert_eq!(heap.len(), 1);
    }
}
