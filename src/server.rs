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

//! The server loop: owns the listener, reactor, timer heap, worker pool and
//! connection table, and drives accept/read/process/write to completion.
//!
//! Ported from the original's `WebServer::Start`. Connections live behind
//! `Arc<Mutex<Connection>>` in a [`Slab`] keyed by the same integer used as
//! the connection's reactor [`Token`] and timer id — a pattern borrowed from
//! the teacher's own listener/worker split, generalised here from
//! TLS-handshake events to the read/process/write pipeline. A worker task
//! reports back to the server-loop thread over an unbounded channel rather
//! than touching the reactor or timer directly, since both are single
//! threaded by design (§5).

use std::io;
use std::net::SocketAddr;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use mio::net::TcpListener;
use mio::{Interest, Token};
use slab::Slab;
use socket2::{Domain, Protocol, Socket, Type};

use crate::connection::{Connection, CLIENT_COUNT, MAX_CLIENTS};
use crate::context::Context;
use crate::pool::WorkerPool;
use crate::reactor::{budget_to_timeout, Reactor};
use crate::timer::TimerHeap;

const LISTEN_TOKEN: Token = Token(usize::MAX - 1);
const WAKE_TOKEN: Token = Token(usize::MAX - 2);

/// A worker's report of what should happen next to a connection it was
/// handed, sent back to the server-loop thread which alone owns the
/// reactor and timer.
enum Completion {
    /// Re-register the connection for `Interest`, one-shot.
    Rearm(usize, Interest),
    /// Tear the connection down.
    Close(usize),
}

/// Drives the accept/reactor/timer loop described in §4.9 of the design
/// notes.
pub struct Server {
    context: Arc<Context>,
    listener: TcpListener,
    reactor: Reactor,
    timer: TimerHeap,
    pool: WorkerPool,
    connections: Slab<Arc<Mutex<Connection>>>,
    completion_tx: Sender<Completion>,
    completion_rx: Receiver<Completion>,
    waker: Arc<mio::Waker>,
    expired: Rc<RefCell<Vec<usize>>>,
    closed: bool,
}

impl Server {
    /// Binds the configured port with `SO_REUSEADDR` and a backlog of 8,
    /// spins up the worker pool, and registers the listener with a fresh
    /// reactor.
    pub fn new(context: Arc<Context>) -> io::Result<Self> {
        let addr = SocketAddr::from(([0, 0, 0, 0], context.config.port));
        let mut listener = bind_listener(addr)?;

        let reactor = Reactor::new()?;
        reactor.add(&mut listener, LISTEN_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(reactor.waker(WAKE_TOKEN)?);

        let pool = WorkerPool::new(context.config.worker_pool_size);
        let (completion_tx, completion_rx) = unbounded();

        Ok(Self {
            context,
            listener,
            reactor,
            timer: TimerHeap::new(),
            pool,
            connections: Slab::new(),
            completion_tx,
            completion_rx,
            waker,
            expired: Rc::new(RefCell::new(Vec::new())),
            closed: false,
        })
    }

    /// Runs the accept/reactor/timer loop until told to stop. Does not
    /// return under normal operation.
    pub fn run(&mut self) -> io::Result<()> {
        let _span = tracing::info_span!("server_loop", port = self.context.config.port).entered();
        tracing::info!("server loop starting");

        while !self.closed {
            let budget = self.timer.next_tick_ms();
            let due: Vec<usize> = self.expired.borrow_mut().drain(..).collect();
            for id in due {
                self.close_connection(id, "idle timeout");
            }

            self.reactor.wait(budget_to_timeout(budget))?;

            let events: Vec<(Token, bool, bool, bool)> = self
                .reactor
                .events()
                .map(|e| (e.token(), e.is_readable(), e.is_writable(), is_terminal(e)))
                .collect();

            for (token, readable, writable, terminal) in events {
                if token == WAKE_TOKEN {
                    self.drain_completions();
                } else if token == LISTEN_TOKEN {
                    self.accept_loop();
                } else {
                    self.dispatch(token.0, readable, writable, terminal);
                }
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, id: usize, readable: bool, writable: bool, terminal: bool) {
        if terminal {
            self.close_connection(id, "peer hangup or socket error");
            return;
        }
        let timeout = Duration::from_millis(self.context.config.timeout_ms);
        if readable {
            self.timer.adjust(id, timeout);
            self.submit_read(id);
        } else if writable {
            self.timer.adjust(id, timeout);
            self.submit_write(id);
        }
    }

    fn accept_loop(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, addr)) => {
                    if CLIENT_COUNT.load(Ordering::SeqCst) >= MAX_CLIENTS {
                        let _ = std::io::Write::write_all(&mut stream, b"Server busy!");
                        tracing::warn!(%addr, "server busy, rejecting connection");
                        continue;
                    }

                    let entry = self.connections.vacant_entry();
                    let id = entry.key();
                    let token = Token(id);
                    let mut conn = Connection::new(stream, token, addr);
                    if let Err(e) = self.reactor.add(conn.stream_mut(), token, Interest::READABLE) {
                        tracing::warn!(?e, "failed to register accepted connection");
                        continue;
                    }
                    entry.insert(Arc::new(Mutex::new(conn)));
                    self.arm_timeout(id);
                    tracing::info!(id, %addr, "client in");
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::warn!(?e, "accept failed");
                    break;
                }
            }
            if !self.context.config.trigger_mode.listen_et {
                break;
            }
        }
    }

    fn arm_timeout(&mut self, id: usize) {
        if self.context.config.timeout_ms == 0 {
            return;
        }
        let expired = Rc::clone(&self.expired);
        self.timer.add(id, Duration::from_millis(self.context.config.timeout_ms), move |id| {
            expired.borrow_mut().push(id);
        });
    }

    fn submit_read(&mut self, id: usize) {
        let Some(conn) = self.connections.get(id).cloned() else { return };
        let context = Arc::clone(&self.context);
        let completion_tx = self.completion_tx.clone();
        let waker = Arc::clone(&self.waker);

        self.pool.submit(move || {
            let outcome = {
                let mut conn = conn.lock().unwrap();
                run_read_and_process(&mut conn, &context)
            };
            let completion = match outcome {
                Ok(true) => Completion::Rearm(id, Interest::WRITABLE),
                Ok(false) => Completion::Rearm(id, Interest::READABLE),
                Err(_) => Completion::Close(id),
            };
            let _ = completion_tx.send(completion);
            let _ = waker.wake();
        });
    }

    fn submit_write(&mut self, id: usize) {
        let Some(conn) = self.connections.get(id).cloned() else { return };
        let context = Arc::clone(&self.context);
        let completion_tx = self.completion_tx.clone();
        let waker = Arc::clone(&self.waker);

        self.pool.submit(move || {
            let edge_triggered = context.config.trigger_mode.conn_et;
            let write_result = conn.lock().unwrap().write(edge_triggered);

            let completion = match write_result {
                Ok(_) => {
                    let guard = conn.lock().unwrap();
                    if guard.to_write_bytes() > 0 {
                        Completion::Rearm(id, Interest::WRITABLE)
                    } else if guard.keep_alive() {
                        Completion::Rearm(id, Interest::READABLE)
                    } else {
                        Completion::Close(id)
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if conn.lock().unwrap().keep_alive() {
                        Completion::Rearm(id, Interest::WRITABLE)
                    } else {
                        Completion::Close(id)
                    }
                }
                Err(_) => Completion::Close(id),
            };
            let _ = completion_tx.send(completion);
            let _ = waker.wake();
        });
    }

    fn drain_completions(&mut self) {
        while let Ok(completion) = self.completion_rx.try_recv() {
            match completion {
                Completion::Rearm(id, interest) => self.rearm(id, interest),
                Completion::Close(id) => self.close_connection(id, "connection finished"),
            }
        }
    }

    fn rearm(&mut self, id: usize, interest: Interest) {
        let Some(conn) = self.connections.get(id) else { return };
        let mut guard = conn.lock().unwrap();
        if guard.is_closed() {
            return;
        }
        if let Err(e) = self.reactor.rearm(guard.stream_mut(), Token(id), interest) {
            tracing::warn!(id, ?e, "rearm failed");
            drop(guard);
            self.close_connection(id, "rearm failed");
        }
    }

    fn close_connection(&mut self, id: usize, reason: &'static str) {
        self.timer.cancel(id);
        if let Some(conn) = self.connections.try_remove(id) {
            let mut guard = conn.lock().unwrap();
            let _ = self.reactor.remove(guard.stream_mut());
            guard.close();
            tracing::info!(id, reason, "client out");
        }
    }
}

fn is_terminal(event: &mio::event::Event) -> bool {
    event.is_read_closed() || event.is_write_closed() || event.is_error()
}

/// Reads whatever is available, then hands off to [`Connection::process`].
/// A `WouldBlock` with nothing read is not an error here — it just means
/// there was nothing new to read this time, matching the original's
/// tolerance of a trailing `EAGAIN` after a successful edge-triggered
/// drain.
fn run_read_and_process(conn: &mut Connection, context: &Context) -> io::Result<bool> {
    match conn.read(context.config.trigger_mode.conn_et) {
        Ok(0) => return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed")),
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e),
    }
    Ok(conn.process(&context.config.resource_dir, &context.db))
}

fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(8)?;
    socket.set_nonblocking(true)?;
    Ok(TcpListener::from_std(socket.into()))
}
