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

//! Readiness reactor: registers file descriptors, waits for readiness with a
//! timeout, and reports the ready set.
//!
//! Built atop [`mio::Poll`]/[`mio::Registry`]/[`mio::Events`], which
//! abstracts the epoll-vs-kqueue split the original hard-coded to Linux
//! `epoll_create`/`epoll_ctl`/`epoll_wait`. `mio` has no native one-shot
//! flag; one-shot is enforced by convention — the reactor never
//! re-registers a connection's token until the owning worker calls
//! [`Reactor::rearm`] explicitly, which is the mutual-exclusion mechanism
//! §9 of the design notes calls for.

use std::io;
use std::time::Duration;

use mio::event::Source;
use mio::{Events, Interest, Poll, Token};

/// Default capacity of the event array passed to each `wait`, matching the
/// original's `Epoller(maxEvent = 1024)`.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Wraps [`mio::Poll`] with the add/mod/del/wait vocabulary the server loop
/// expects.
pub struct Reactor {
    poll: Poll,
    events: Events,
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor").field("capacity", &self.events.capacity()).finish()
    }
}

impl Reactor {
    /// Creates a reactor with the default event-array capacity.
    pub fn new() -> io::Result<Self> {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// Creates a reactor whose `wait` reports at most `capacity` events per
    /// call.
    pub fn with_capacity(capacity: usize) -> io::Result<Self> {
        Ok(Self { poll: Poll::new()?, events: Events::with_capacity(capacity) })
    }

    /// Registers `source` under `token` for the given interest set. Used
    /// once per fd, at accept/listen time.
    pub fn add<S: Source + ?Sized>(
        &self,
        source: &mut S,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.poll.registry().register(source, token, interests)
    }

    /// Re-registers `source`, the one-shot rearm a worker performs after
    /// finishing its task on a connection.
    pub fn rearm<S: Source + ?Sized>(
        &self,
        source: &mut S,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.poll.registry().reregister(source, token, interests)
    }

    /// Deregisters `source` ahead of closing its fd.
    pub fn remove<S: Source + ?Sized>(&self, source: &mut S) -> io::Result<()> {
        self.poll.registry().deregister(source)
    }

    /// A cloneable handle capable of waking a blocked `wait` from another
    /// thread (used by the worker pool to signal task completion back to
    /// the server loop thread, if ever needed).
    pub fn waker(&self, token: Token) -> io::Result<mio::Waker> {
        mio::Waker::new(self.poll.registry(), token)
    }

    /// Blocks up to `timeout_ms` (`None` = block indefinitely, `Some(0)` =
    /// poll) and returns the number of ready events, accessible afterward
    /// via [`Reactor::event_fd`]/[`Reactor::event`].
    pub fn wait(&mut self, timeout_ms: Option<u64>) -> io::Result<usize> {
        let timeout = timeout_ms.map(Duration::from_millis);
        self.poll.poll(&mut self.events, timeout)?;
        Ok(self.events.iter().count())
    }

    /// Iterates the events reported by the most recent `wait`.
    pub fn events(&self) -> impl Iterator<Item = &mio::event::Event> {
        self.events.iter()
    }
}

/// Converts a millisecond budget in the original's `(-1 | 0 | n)` convention
/// into the `Option<u64>` this reactor's `wait` expects.
pub fn budget_to_timeout(ms: i64) -> Option<u64> {
    if ms < 0 {
        None
    } else {
        Some(ms as u64)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn budget_conversion_matches_original_convention() {
        assert_eq!(budget_to_timeout(-1), None);
        assert_eq!(budget_to_timeout(0), Some(0));
        assert_eq!(budget_to_timeout(250), Some(250));
    }

    #[test]
    fn wait_with_zero_timeout_returns_promptly_when_idle() {
        let mut reactor = Reactor::new().unwrap();
        let n = reactor.wait(Some(0)).unwrap();
        assert_eq!(n, 0);
    }
}
