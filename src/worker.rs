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

//! Workers.
//!
//! A worker is one single-threaded event loop owning its connections,
//! streams, job queue, wait queues and stat cache. No worker ever touches
//! another worker's requests; everything crossing threads goes through the
//! wakeup channel plus the poll waker. The loop order per turn is: poll,
//! drain cross-thread messages, expire timers and wait queues, then run up
//! to three job generations.

use std::collections::BinaryHeap;
use std::fmt;
use std::io::Read;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use bytes::BytesMut;
use crossbeam_channel::{Receiver, Sender};
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;

use crate::backend::{self, BackendPool, BackendSocket, WorkerBackendCon};
use crate::collect::CollectInfo;
use crate::connection::{self, Connection};
use crate::jobqueue::{JobId, JobQueue, JobTarget};
use crate::parser::date::format_imf_fixdate;
use crate::server::ServerShared;
use crate::stat_cache::{StatCache, StatResult};
use crate::stream::{run_stream_job, Streams};
use crate::waitqueue::WaitQueue;

/// Per-worker transfer and request counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct Statistics {
    /// Bytes received from clients.
    pub bytes_in: u64,
    /// Bytes sent to clients.
    pub bytes_out: u64,
    /// Requests processed.
    pub requests: u64,
    /// Action frames executed.
    pub actions_executed: u64,
}

/// Message into a worker from another thread.
pub enum Wakeup {
    /// A freshly accepted client connection.
    NewConnection {
        /// The non-blocking socket.
        sock: mio::net::TcpStream,
        /// Peer address as reported by accept.
        remote: SocketAddr,
    },
    /// Detach an idle connection of `pool` and ship it to worker `dest`.
    BackendDetach {
        /// The pool asking.
        pool: Arc<BackendPool>,
        /// Destination worker index.
        dest: usize,
    },
    /// A shipped backend connection arriving at its new worker.
    BackendAttach {
        /// The owning pool.
        pool: Arc<BackendPool>,
        /// The detached socket.
        sock: BackendSocket,
        /// Requests already served on it.
        requests: u32,
    },
    /// Pool capacity may have freed up for a local waiter.
    BackendKick {
        /// The pool to re-examine.
        pool: Arc<BackendPool>,
    },
    /// Run a collect function on this worker.
    CollectRun(Arc<CollectInfo>),
    /// Deliver finished collect results on the origin worker.
    CollectDone(Arc<CollectInfo>),
    /// Finish outstanding work and stop the loop.
    Stop,
}

impl fmt::Debug for Wakeup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match *self {
            Wakeup::NewConnection { .. } => "NewConnection",
            Wakeup::BackendDetach { .. } => "BackendDetach",
            Wakeup::BackendAttach { .. } => "BackendAttach",
            Wakeup::BackendKick { .. } => "BackendKick",
            Wakeup::CollectRun(_) => "CollectRun",
            Wakeup::CollectDone(_) => "CollectDone",
            Wakeup::Stop => "Stop",
        })
    }
}

/// Cheap cloneable address of a worker, used for cross-thread sends.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    ndx: usize,
    tx: Sender<Wakeup>,
    waker: Arc<Waker>,
}

impl WorkerHandle {
    /// The worker's index.
    pub fn ndx(&self) -> usize {
        self.ndx
    }

    /// Sends `wakeup` and wakes the worker's poll.
    pub fn send(&self, wakeup: Wakeup) {
        if self.tx.send(wakeup).is_ok() {
            let _ = self.waker.wake();
        }
    }
}

/// Timer payloads of the worker's deadline heap.
#[derive(Debug, Clone, Copy)]
pub enum TimerEvent {
    /// A backend connect deadline.
    BackendPending(usize),
    /// A backend idle deadline.
    BackendIdle(usize),
    /// Re-arm a job at the deadline.
    WakeJob(JobId),
    /// Force-close a draining socket.
    CloseSocket(usize),
}

struct TimerEntry {
    at: Instant,
    seq: u64,
    event: TimerEvent,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // reversed: BinaryHeap is a max-heap, we want the earliest deadline
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Deadline heap for timeouts that do not share a uniform delay.
#[derive(Default)]
pub struct TimerHeap {
    heap: BinaryHeap<TimerEntry>,
    seq: u64,
}

impl fmt::Debug for TimerHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHeap")
            .field("len", &self.heap.len())
            .finish()
    }
}

impl TimerHeap {
    /// Arms `event` for `at`.
    pub fn push(&mut self, at: Instant, event: TimerEvent) {
        self.seq += 1;
        let seq = self.seq;
        self.heap.push(TimerEntry { at, seq, event });
    }

    /// Earliest armed deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|e| e.at)
    }

    fn pop_ready(&mut self, now: Instant) -> Option<TimerEvent> {
        if self.heap.peek().map(|e| e.at <= now).unwrap_or(false) {
            return self.heap.pop().map(|e| e.event);
        }
        None
    }
}

enum TokenTarget {
    Waker,
    Connection(usize),
    Backend(usize),
    Closing(usize),
}

struct ClosingSocket {
    sock: mio::net::TcpStream,
    token: Token,
}

/// One single-threaded worker.
pub struct Worker {
    /// Worker index.
    pub(crate) ndx: usize,
    /// Server-wide shared state.
    pub shared: Arc<ServerShared>,
    poll: Poll,
    events: Option<Events>,
    waker: Arc<Waker>,
    /// The cooperative job scheduler.
    pub jobqueue: JobQueue,
    /// The stream pipeline set.
    pub streams: Streams,
    /// The per-worker stat cache.
    pub stat_cache: StatCache,
    stat_rx: Receiver<StatResult>,
    wake_rx: Receiver<Wakeup>,
    wake_tx: Sender<Wakeup>,
    pub(crate) connections: Slab<Option<Box<Connection>>>,
    /// Physical backend connections owned by this worker.
    pub(crate) backend_cons: Slab<WorkerBackendCon>,
    token_map: Slab<TokenTarget>,
    pub(crate) timers: TimerHeap,
    pub(crate) io_timeout_queue: WaitQueue<usize>,
    pub(crate) keep_alive_queue: WaitQueue<usize>,
    pub(crate) throttle_queue: WaitQueue<usize>,
    closing: Slab<ClosingSocket>,
    /// Transfer counters.
    pub stats: Statistics,
    pub(crate) read_buf: BytesMut,
    date_cache: (u64, String),
    stopping: bool,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("ndx", &self.ndx)
            .field("connections", &self.connections.len())
            .field("backend_cons", &self.backend_cons.len())
            .finish()
    }
}

const EVENTS_CAPACITY: usize = 1024;
const CLOSING_TIMEOUT: Duration = Duration::from_secs(2);

impl Worker {
    /// Creates worker `ndx`.
    pub fn new(shared: Arc<ServerShared>, ndx: usize) -> std::io::Result<Worker> {
        let poll = Poll::new()?;
        let mut token_map = Slab::new();
        let waker_token = Token(token_map.insert(TokenTarget::Waker));
        let waker = Arc::new(Waker::new(poll.registry(), waker_token)?);
        let jobqueue = JobQueue::new(waker.clone());
        let (stat_tx, stat_rx) = crossbeam_channel::unbounded();
        let stat_cache = StatCache::new(shared.config.stat_cache_ttl, stat_tx, waker.clone());
        let (wake_tx, wake_rx) = crossbeam_channel::unbounded();

        Ok(Worker {
            ndx,
            io_timeout_queue: WaitQueue::new(shared.config.io_timeout),
            keep_alive_queue: WaitQueue::new(shared.config.keep_alive_timeout),
            throttle_queue: WaitQueue::new(crate::throttle::THROTTLE_GRANULARITY),
            shared,
            poll,
            events: Some(Events::with_capacity(EVENTS_CAPACITY)),
            waker,
            jobqueue,
            streams: Streams::new(),
            stat_cache,
            stat_rx,
            wake_rx,
            wake_tx,
            connections: Slab::new(),
            backend_cons: Slab::new(),
            token_map,
            timers: TimerHeap::default(),
            closing: Slab::new(),
            stats: Statistics::default(),
            read_buf: BytesMut::with_capacity(16 * 1024),
            date_cache: (u64::MAX, String::new()),
            stopping: false,
        })
    }

    /// The worker's index.
    pub fn ndx(&self) -> usize {
        self.ndx
    }

    /// A handle other threads use to message this worker.
    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            ndx: self.ndx,
            tx: self.wake_tx.clone(),
            waker: self.waker.clone(),
        }
    }

    /// The poll registry.
    pub(crate) fn registry(&self) -> &mio::Registry {
        self.poll.registry()
    }

    /// The cached `Date` header value, regenerated at most once a second.
    pub fn date_str(&mut self) -> &str {
        let now = SystemTime::now();
        let secs = now
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        if self.date_cache.0 != secs {
            self.date_cache = (secs, format_imf_fixdate(now));
        }
        &self.date_cache.1
    }

    /// Sends `wakeup` to worker `ndx` (possibly this one).
    pub(crate) fn send_to_worker(&self, ndx: usize, wakeup: Wakeup) {
        if ndx == self.ndx {
            let _ = self.wake_tx.send(wakeup);
            return;
        }
        match self.shared.worker_handle(ndx) {
            Some(handle) => handle.send(wakeup),
            None => log::error!("no handle for worker {}, dropping message", ndx),
        }
    }

    // --- connection plumbing -------------------------------------------

    pub(crate) fn alloc_conn_token(&mut self, conn: usize) -> Token {
        Token(self.token_map.insert(TokenTarget::Connection(conn)))
    }

    pub(crate) fn free_token(&mut self, token: Token) {
        if self.token_map.contains(token.0) {
            self.token_map.remove(token.0);
        }
    }

    /// Hands a drained socket over for a graceful close: write side is
    /// already shut down, we wait for the peer's EOF before closing.
    pub(crate) fn add_closing_socket(&mut self, mut sock: mio::net::TcpStream) {
        use mio::event::Source;
        let entry = self.closing.vacant_entry();
        let idx = entry.key();
        let token = Token(self.token_map.insert(TokenTarget::Closing(idx)));
        if sock.register(self.poll.registry(), token, Interest::READABLE).is_err() {
            self.token_map.remove(token.0);
            return;
        }
        entry.insert(ClosingSocket { sock, token });
        self.timers
            .push(Instant::now() + CLOSING_TIMEOUT, TimerEvent::CloseSocket(idx));
    }

    fn finish_closing_socket(&mut self, idx: usize) {
        use mio::event::Source;
        if !self.closing.contains(idx) {
            return;
        }
        let mut closing = self.closing.remove(idx);
        let _ = closing.sock.deregister(self.poll.registry());
        self.free_token(closing.token);
    }

    fn closing_socket_event(&mut self, idx: usize) {
        let done = match self.closing.get_mut(idx) {
            Some(closing) => {
                let mut buf = [0u8; 512];
                match closing.sock.read(&mut buf) {
                    Ok(0) => true,
                    Ok(_) => false,
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => false,
                    Err(_) => true,
                }
            }
            None => return,
        };
        if done {
            self.finish_closing_socket(idx);
        }
    }

    // --- backend plumbing ----------------------------------------------

    pub(crate) fn insert_backend_con(&mut self, con: WorkerBackendCon) -> usize {
        self.backend_cons.insert(con)
    }

    pub(crate) fn register_backend_socket(
        &mut self,
        key: usize,
        interest: Interest,
    ) -> std::io::Result<()> {
        let token = Token(self.token_map.insert(TokenTarget::Backend(key)));
        let registry = self.poll.registry();
        let con = &mut self.backend_cons[key];
        con.set_token(token);
        match con.sock.register(registry, token, interest) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.token_map.remove(token.0);
                Err(e)
            }
        }
    }

    pub(crate) fn reregister_backend_socket(
        &mut self,
        key: usize,
        interest: Interest,
    ) -> std::io::Result<()> {
        let registry = self.poll.registry();
        let con = &mut self.backend_cons[key];
        let token = con.token;
        con.sock.reregister(registry, token, interest)
    }

    pub(crate) fn activate_backend_con(&mut self, key: usize) {
        self.backend_cons[key].phase = crate::backend::BConPhase::Active;
        let _ = self.reregister_backend_socket(key, Interest::READABLE | Interest::WRITABLE);
    }

    pub(crate) fn remove_backend_con(&mut self, key: usize) {
        if !self.backend_cons.contains(key) {
            return;
        }
        let mut con = self.backend_cons.remove(key);
        let _ = con.sock.deregister(self.poll.registry());
        self.free_token(con.token);
    }

    pub(crate) fn take_backend_con(&mut self, key: usize) -> WorkerBackendCon {
        let con = self.backend_cons.remove(key);
        self.free_token(con.token);
        con
    }

    // --- the loop ------------------------------------------------------

    fn poll_timeout(&self) -> Option<Duration> {
        if self.jobqueue.has_pending() {
            return Some(Duration::ZERO);
        }
        let deadlines = [
            self.io_timeout_queue.next_deadline(),
            self.keep_alive_queue.next_deadline(),
            self.throttle_queue.next_deadline(),
            self.stat_cache.next_deadline(),
            self.timers.next_deadline(),
        ];
        let next = deadlines.into_iter().flatten().min()?;
        Some(next.saturating_duration_since(Instant::now()))
    }

    /// Runs one loop turn; `cap` bounds the poll timeout (tests use short
    /// caps, [`run`](Self::run) passes `None`).
    pub fn tick(&mut self, cap: Option<Duration>) -> std::io::Result<()> {
        let timeout = match (self.poll_timeout(), cap) {
            (Some(t), Some(c)) => Some(t.min(c)),
            (Some(t), None) => Some(t),
            (None, cap) => cap,
        };

        let mut events = self.events.take().expect("events buffer present");
        match self.poll.poll(&mut events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                self.events = Some(events);
                return Err(e);
            }
        }

        for event in events.iter() {
            enum Hit {
                Nothing,
                Conn(usize),
                Backend(usize),
                Closing(usize),
            }
            let hit = match self.token_map.get(event.token().0) {
                Some(TokenTarget::Connection(id)) => Hit::Conn(*id),
                Some(TokenTarget::Backend(key)) => Hit::Backend(*key),
                Some(TokenTarget::Closing(idx)) => Hit::Closing(*idx),
                Some(TokenTarget::Waker) | None => Hit::Nothing,
            };
            match hit {
                Hit::Nothing => {}
                Hit::Conn(id) => connection::socket_event(
                    self,
                    id,
                    event.is_readable() || event.is_read_closed(),
                    event.is_writable(),
                    event.is_error(),
                ),
                Hit::Backend(key) => {
                    backend::backend_event(self, key, event.is_readable(), event.is_writable())
                }
                Hit::Closing(idx) => self.closing_socket_event(idx),
            }
        }
        self.events = Some(events);

        // cross-thread messages
        let wakeups: Vec<Wakeup> = self.wake_rx.try_iter().collect();
        for wakeup in wakeups {
            match wakeup {
                Wakeup::NewConnection { sock, remote } => {
                    connection::new_connection(self, sock, remote);
                }
                Wakeup::BackendDetach { pool, dest } => {
                    backend::backend_detach_for(self, &pool, dest);
                }
                Wakeup::BackendAttach {
                    pool,
                    sock,
                    requests,
                } => {
                    backend::backend_attach(self, &pool, sock, requests);
                }
                Wakeup::BackendKick { pool } => backend::backend_kick(self, &pool),
                Wakeup::CollectRun(info) => crate::collect::collect_run(self, &info),
                Wakeup::CollectDone(info) => crate::collect::collect_deliver(self, &info),
                Wakeup::Stop => self.stopping = true,
            }
        }

        // finished stats
        let results: Vec<StatResult> = self.stat_rx.try_iter().collect();
        for res in results {
            self.stat_cache.complete(res, &mut self.jobqueue);
        }

        self.jobqueue.drain_async();

        let now = Instant::now();

        // timers
        loop {
            let Some(event) = self.timers.pop_ready(now) else {
                break;
            };
            match event {
                TimerEvent::WakeJob(job) => self.jobqueue.later(job),
                TimerEvent::CloseSocket(idx) => self.finish_closing_socket(idx),
                other => backend::backend_timer(self, other),
            }
        }

        // io timeouts: no progress on the connection within the delay
        while let Some((_, conn)) = self.io_timeout_queue.pop_ready(now) {
            connection::io_timeout(self, conn);
        }
        // keep-alive timeouts: idle between requests
        while let Some((_, conn)) = self.keep_alive_queue.pop_ready(now) {
            connection::keep_alive_timeout(self, conn);
        }
        // throttle ticks
        while let Some((_, conn)) = self.throttle_queue.pop_ready(now) {
            connection::throttle_tick(self, conn, now);
        }

        self.stat_cache.expire(now);

        self.run_jobs();
        Ok(())
    }

    fn run_jobs(&mut self) {
        for _ in 0..3 {
            let todo = self.jobqueue.begin_generation();
            if todo == 0 {
                return;
            }
            for _ in 0..todo {
                let Some((_, target)) = self.jobqueue.pop() else {
                    break;
                };
                match target {
                    JobTarget::Stream(id) => {
                        run_stream_job(&mut self.streams, &mut self.jobqueue, id)
                    }
                    JobTarget::Connection(id) => connection::drive(self, id),
                }
            }
        }
    }

    /// Whether a stop was requested and all connections drained.
    pub fn should_exit(&self) -> bool {
        self.stopping && self.connections.iter().all(|(_, c)| c.is_none())
    }

    /// Runs the event loop until stopped.
    pub fn run(&mut self) {
        loop {
            if let Err(e) = self.tick(Some(Duration::from_millis(500))) {
                log::error!("worker {} poll failed: {}", self.ndx, e);
                return;
            }
            if self.stopping {
                // drop keep-alive connections so the drain finishes
                let idle: Vec<usize> = self
                    .connections
                    .iter()
                    .filter_map(|(id, c)| match c {
                        Some(con) if con.is_idle() => Some(id),
                        _ => None,
                    })
                    .collect();
                for id in idle {
                    connection::close_connection(self, id);
                }
            }
            if self.should_exit() {
                return;
            }
        }
    }
}
