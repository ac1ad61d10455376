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

//! Backend connection pools.
//!
//! A pool shares reusable upstream connections between requests, with
//! per-worker affinity: the sockets live in the worker that polls them; the
//! pool itself only tracks counts, the wait FIFO and reservations. A
//! request that cannot be served immediately queues a wait entry; the
//! connection that later frees up (connect finished, put back, or moved in
//! from another worker) is reserved for the first waiter of its worker, so
//! FIFO order decides who gets which connection. Connect failures disable
//! the pool for a configured interval during which gets fail fast.
//! Cross-worker moves only happen for bounded pools.

use std::fmt;
use std::io::{ErrorKind, Read};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::{Interest, Token};
use parking_lot::Mutex;

use crate::jobqueue::{JobId, JobWaker};
use crate::worker::{TimerEvent, Wakeup, Worker};

/// Upstream address of a pool.
#[derive(Debug, Clone)]
pub enum BackendAddress {
    /// TCP upstream.
    Tcp(SocketAddr),
    /// UNIX domain socket upstream.
    Unix(PathBuf),
}

/// Non-blocking socket to an upstream.
#[derive(Debug)]
pub enum BackendSocket {
    /// TCP stream.
    Tcp(mio::net::TcpStream),
    /// UNIX stream.
    Unix(mio::net::UnixStream),
}

impl BackendSocket {
    fn connect(address: &BackendAddress) -> std::io::Result<BackendSocket> {
        match address {
            BackendAddress::Tcp(addr) => {
                mio::net::TcpStream::connect(*addr).map(BackendSocket::Tcp)
            }
            BackendAddress::Unix(path) => {
                mio::net::UnixStream::connect(path).map(BackendSocket::Unix)
            }
        }
    }

    pub(crate) fn register(
        &mut self,
        registry: &mio::Registry,
        token: Token,
        interest: Interest,
    ) -> std::io::Result<()> {
        use mio::event::Source;
        match self {
            BackendSocket::Tcp(s) => s.register(registry, token, interest),
            BackendSocket::Unix(s) => s.register(registry, token, interest),
        }
    }

    pub(crate) fn reregister(
        &mut self,
        registry: &mio::Registry,
        token: Token,
        interest: Interest,
    ) -> std::io::Result<()> {
        use mio::event::Source;
        match self {
            BackendSocket::Tcp(s) => s.reregister(registry, token, interest),
            BackendSocket::Unix(s) => s.reregister(registry, token, interest),
        }
    }

    pub(crate) fn deregister(&mut self, registry: &mio::Registry) -> std::io::Result<()> {
        use mio::event::Source;
        match self {
            BackendSocket::Tcp(s) => s.deregister(registry),
            BackendSocket::Unix(s) => s.deregister(registry),
        }
    }

    fn take_error(&self) -> std::io::Result<Option<std::io::Error>> {
        match self {
            BackendSocket::Tcp(s) => s.take_error(),
            BackendSocket::Unix(s) => s.take_error(),
        }
    }

    fn probe_read(&mut self) -> ProbeResult {
        let mut buf = [0u8; 16];
        let res = match self {
            BackendSocket::Tcp(s) => s.read(&mut buf),
            BackendSocket::Unix(s) => s.read(&mut buf),
        };
        match res {
            Ok(0) => ProbeResult::Eof,
            Ok(_) => ProbeResult::Data,
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => ProbeResult::Quiet,
            Err(_) => ProbeResult::Eof,
        }
    }
}

enum ProbeResult {
    Quiet,
    Data,
    Eof,
}

/// Lifecycle notifications for protocol clients built on a pool.
pub trait BackendCallbacks: Send + Sync {
    /// A fresh connection finished connecting.
    fn new_connection(&self, _pool: &Arc<BackendPool>) {}
    /// A connection is being closed.
    fn close_connection(&self, _pool: &Arc<BackendPool>) {}
    /// A connection was detached for a cross-worker move.
    fn detach_connection(&self, _pool: &Arc<BackendPool>) {}
    /// A moved connection was attached on its new worker.
    fn attach_connection(&self, _pool: &Arc<BackendPool>) {}
}

/// Callbacks that do nothing; enough for opaque byte pipes.
#[derive(Debug, Default)]
pub struct NoopCallbacks;

impl BackendCallbacks for NoopCallbacks {}

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Upstream address.
    pub address: BackendAddress,
    /// `> 0`: limit on current connections plus pending connects.
    /// `0`: unlimited. `< 0`: unlimited, but the absolute value caps the
    /// pending connects per worker. Connections only move between workers
    /// when the limit is positive.
    pub max_connections: i32,
    /// How long idle keep-alive connections are retained.
    pub idle_timeout: Duration,
    /// How long a connect may take; a failure disables the pool.
    pub connect_timeout: Duration,
    /// How long a request may wait in the FIFO before it gets `Timeout`.
    pub wait_timeout: Duration,
    /// How long the pool stays disabled after a connect failure.
    pub disable_time: Duration,
    /// Requests served per connection before it is closed; `-1` unlimited.
    pub max_requests: i32,
    /// Watch idle connections for input or eof and close them.
    pub watch_for_close: bool,
}

impl BackendConfig {
    /// A configuration with usable defaults for `address`.
    pub fn new(address: BackendAddress) -> Self {
        BackendConfig {
            address,
            max_connections: 0,
            idle_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            wait_timeout: Duration::from_secs(5),
            disable_time: Duration::from_secs(2),
            max_requests: -1,
            watch_for_close: true,
        }
    }
}

/// Result of [`backend_get`].
#[derive(Debug)]
pub enum BackendResult {
    /// A connection is attached; the key addresses the worker's slab.
    Success(usize),
    /// Queued; the request's job wakes on a connection or the timeout.
    Wait,
    /// The wait timed out or the pool is disabled.
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitState {
    Waiting,
    Served(usize),
    TimedOut,
    Cancelled,
}

struct WaitEntry {
    id: u64,
    worker: usize,
    waker: JobWaker,
    deadline: Instant,
    state: Mutex<WaitState>,
}

/// Wait handle held by a suspended request.
pub struct BackendWait {
    entry: Arc<WaitEntry>,
    pool: Arc<BackendPool>,
}

impl fmt::Debug for BackendWait {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendWait")
            .field("id", &self.entry.id)
            .finish()
    }
}

impl BackendWait {
    /// Removes the request from the pool's wait FIFO without consuming a
    /// connection; an already-reserved connection goes back to the pool.
    pub fn cancel(self, wrk: &mut Worker) {
        let state = {
            let mut inner = self.pool.inner.lock();
            inner.waits.retain(|w| w.id != self.entry.id);
            let state = *self.entry.state.lock();
            *self.entry.state.lock() = WaitState::Cancelled;
            state
        };
        if let WaitState::Served(key) = state {
            if wrk.backend_cons.contains(key) {
                backend_put(wrk, key, false);
            }
        }
    }
}

struct PoolInner {
    disabled_until: Option<Instant>,
    idle: Vec<std::collections::VecDeque<usize>>,
    idle_count: Vec<usize>,
    active_count: Vec<usize>,
    pending_count: Vec<usize>,
    waits: std::collections::VecDeque<Arc<WaitEntry>>,
    next_wait_id: u64,
}

/// A bounded (or unbounded) collection of upstream connections.
pub struct BackendPool {
    /// Read-only configuration.
    pub config: BackendConfig,
    callbacks: Box<dyn BackendCallbacks>,
    inner: Mutex<PoolInner>,
}

impl fmt::Debug for BackendPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("BackendPool")
            .field("idle", &inner.idle_count)
            .field("active", &inner.active_count)
            .field("pending", &inner.pending_count)
            .field("waits", &inner.waits.len())
            .finish()
    }
}

impl BackendPool {
    /// Creates a pool serving `worker_count` workers.
    pub fn new(
        config: BackendConfig,
        callbacks: Box<dyn BackendCallbacks>,
        worker_count: usize,
    ) -> Arc<Self> {
        Arc::new(BackendPool {
            config,
            callbacks,
            inner: Mutex::new(PoolInner {
                disabled_until: None,
                idle: (0..worker_count).map(|_| Default::default()).collect(),
                idle_count: vec![0; worker_count],
                active_count: vec![0; worker_count],
                pending_count: vec![0; worker_count],
                waits: std::collections::VecDeque::new(),
                next_wait_id: 1,
            }),
        })
    }

    /// `(idle, active, pending)` counts for `worker`.
    pub fn worker_counts(&self, worker: usize) -> (usize, usize, usize) {
        let inner = self.inner.lock();
        (
            inner.idle_count[worker],
            inner.active_count[worker],
            inner.pending_count[worker],
        )
    }

    /// Number of queued waits.
    pub fn wait_count(&self) -> usize {
        self.inner.lock().waits.len()
    }

    /// Whether the pool is inside a disable interval.
    pub fn is_disabled(&self) -> bool {
        match self.inner.lock().disabled_until {
            Some(until) => Instant::now() < until,
            None => false,
        }
    }
}

fn total_connections(inner: &PoolInner) -> usize {
    inner.idle_count.iter().sum::<usize>()
        + inner.active_count.iter().sum::<usize>()
        + inner.pending_count.iter().sum::<usize>()
}

/// Connection phase inside the owning worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BConPhase {
    /// Connect in progress.
    Pending,
    /// Parked in the pool's idle list.
    Idle,
    /// Reserved for a specific waiting request.
    Reserved,
    /// Attached to a request.
    Active,
}

/// A physical backend connection inside a worker.
#[derive(Debug)]
pub struct WorkerBackendCon {
    /// The socket; protocol clients drive it directly while active.
    pub sock: BackendSocket,
    pub(crate) pool: Arc<BackendPool>,
    pub(crate) phase: BConPhase,
    pub(crate) requests: u32,
    pub(crate) token: Token,
}

impl WorkerBackendCon {
    pub(crate) fn set_token(&mut self, token: Token) {
        self.token = token;
    }
}

fn start_connect(wrk: &mut Worker, pool: &Arc<BackendPool>) -> Result<(), ()> {
    let sock = match BackendSocket::connect(&pool.config.address) {
        Ok(sock) => sock,
        Err(e) => {
            log::error!("backend connect to {:?} failed: {}", pool.config.address, e);
            return Err(());
        }
    };
    let key = wrk.insert_backend_con(WorkerBackendCon {
        sock,
        pool: pool.clone(),
        phase: BConPhase::Pending,
        requests: 0,
        token: Token(0),
    });
    if wrk
        .register_backend_socket(key, Interest::WRITABLE)
        .is_err()
    {
        wrk.remove_backend_con(key);
        return Err(());
    }
    let deadline = Instant::now() + pool.config.connect_timeout;
    wrk.timers.push(deadline, TimerEvent::BackendPending(key));
    pool.inner.lock().pending_count[wrk.ndx] += 1;
    Ok(())
}

fn disable_pool(pool: &Arc<BackendPool>) {
    let waits = {
        let mut inner = pool.inner.lock();
        inner.disabled_until = Some(Instant::now() + pool.config.disable_time);
        std::mem::take(&mut inner.waits)
    };
    for wait in waits {
        *wait.state.lock() = WaitState::TimedOut;
        wait.waker.wake();
    }
}

fn queue_wait(
    wrk: &mut Worker,
    pool: &Arc<BackendPool>,
    con_job: JobId,
    waker: JobWaker,
    wait: &mut Option<BackendWait>,
) {
    let deadline = Instant::now() + pool.config.wait_timeout;
    let entry = {
        let mut inner = pool.inner.lock();
        let id = inner.next_wait_id;
        inner.next_wait_id += 1;
        let entry = Arc::new(WaitEntry {
            id,
            worker: wrk.ndx,
            waker,
            deadline,
            state: Mutex::new(WaitState::Waiting),
        });
        inner.waits.push_back(entry.clone());
        entry
    };
    // arm the waiter's own wakeup for the deadline check
    wrk.timers.push(deadline, TimerEvent::WakeJob(con_job));
    *wait = Some(BackendWait {
        entry,
        pool: pool.clone(),
    });
}

/// Gets a connection from the pool for the request driving `con_job`.
///
/// Call again with the same `wait` handle after its waker fired; a wait
/// resolves to `Success` or `Timeout` exactly once, in FIFO order.
pub fn backend_get(
    wrk: &mut Worker,
    pool: &Arc<BackendPool>,
    con_job: JobId,
    wait: &mut Option<BackendWait>,
) -> BackendResult {
    let now = Instant::now();

    // resolve an existing wait first
    if let Some(current) = wait.take() {
        let state = *current.entry.state.lock();
        match state {
            WaitState::Served(key) => {
                wrk.backend_cons[key].phase = BConPhase::Active;
                return BackendResult::Success(key);
            }
            WaitState::TimedOut => return BackendResult::Timeout,
            WaitState::Cancelled => {}
            WaitState::Waiting => {
                if now >= current.entry.deadline {
                    let mut inner = pool.inner.lock();
                    inner.waits.retain(|w| w.id != current.entry.id);
                    *current.entry.state.lock() = WaitState::TimedOut;
                    return BackendResult::Timeout;
                }
                *wait = Some(current);
                return BackendResult::Wait;
            }
        }
    }

    let waker = match wrk.jobqueue.waker(con_job) {
        Some(waker) => waker,
        None => return BackendResult::Timeout,
    };

    enum Plan {
        Idle(usize),
        Connect,
        Steal(usize),
        Queue,
    }

    let plan = {
        let mut inner = pool.inner.lock();
        match inner.disabled_until {
            Some(until) if now < until => return BackendResult::Timeout,
            Some(_) => inner.disabled_until = None,
            None => {}
        }

        if let Some(key) = inner.idle[wrk.ndx].pop_front() {
            inner.idle_count[wrk.ndx] -= 1;
            inner.active_count[wrk.ndx] += 1;
            Plan::Idle(key)
        } else {
            let max = pool.config.max_connections;
            let can_connect = if max > 0 {
                total_connections(&inner) < max as usize
            } else if max < 0 {
                inner.pending_count[wrk.ndx] < (-max) as usize
            } else {
                true
            };
            if can_connect {
                Plan::Connect
            } else if max > 0 {
                match inner.idle_count.iter().position(|&count| count > 0) {
                    Some(donor) => Plan::Steal(donor),
                    None => Plan::Queue,
                }
            } else {
                Plan::Queue
            }
        }
    };

    match plan {
        Plan::Idle(key) => {
            wrk.activate_backend_con(key);
            BackendResult::Success(key)
        }
        Plan::Connect => {
            if start_connect(wrk, pool).is_err() {
                disable_pool(pool);
                return BackendResult::Timeout;
            }
            queue_wait(wrk, pool, con_job, waker, wait);
            BackendResult::Wait
        }
        Plan::Steal(donor) => {
            queue_wait(wrk, pool, con_job, waker, wait);
            wrk.send_to_worker(
                donor,
                Wakeup::BackendDetach {
                    pool: pool.clone(),
                    dest: wrk.ndx,
                },
            );
            BackendResult::Wait
        }
        Plan::Queue => {
            queue_wait(wrk, pool, con_job, waker, wait);
            BackendResult::Wait
        }
    }
}

/// Reserves `key` for the first waiter of this worker; `false` if none.
fn reserve_for_local_waiter(wrk: &mut Worker, pool: &Arc<BackendPool>, key: usize) -> bool {
    let waiter = {
        let mut inner = pool.inner.lock();
        match inner.waits.iter().position(|w| w.worker == wrk.ndx) {
            Some(pos) => {
                let waiter = inner.waits.remove(pos).expect("position is valid");
                inner.active_count[wrk.ndx] += 1;
                Some(waiter)
            }
            None => None,
        }
    };
    match waiter {
        Some(waiter) => {
            wrk.backend_cons[key].phase = BConPhase::Reserved;
            *waiter.state.lock() = WaitState::Served(key);
            waiter.waker.wake();
            true
        }
        None => false,
    }
}

fn park_idle(wrk: &mut Worker, pool: &Arc<BackendPool>, key: usize) {
    wrk.backend_cons[key].phase = BConPhase::Idle;
    if pool.config.watch_for_close {
        let _ = wrk.reregister_backend_socket(key, Interest::READABLE);
    }
    let deadline = Instant::now() + pool.config.idle_timeout;
    wrk.timers.push(deadline, TimerEvent::BackendIdle(key));
    let mut inner = pool.inner.lock();
    inner.idle[wrk.ndx].push_back(key);
    inner.idle_count[wrk.ndx] += 1;
}

fn drop_from_counts(pool: &Arc<BackendPool>, worker: usize, key: usize, was: BConPhase) {
    let mut inner = pool.inner.lock();
    match was {
        BConPhase::Idle => {
            inner.idle_count[worker] -= 1;
            inner.idle[worker].retain(|&k| k != key);
        }
        BConPhase::Active | BConPhase::Reserved => inner.active_count[worker] -= 1,
        BConPhase::Pending => inner.pending_count[worker] -= 1,
    }
}

fn destroy_con(wrk: &mut Worker, pool: &Arc<BackendPool>, key: usize, was: BConPhase) {
    pool.callbacks.close_connection(pool);
    wrk.remove_backend_con(key);
    drop_from_counts(pool, wrk.ndx, key, was);
}

/// Returns a connection to the pool. With `close` (or once `max_requests`
/// is reached) the connection is destroyed; otherwise it serves the next
/// waiter or parks in the idle list.
pub fn backend_put(wrk: &mut Worker, key: usize, close: bool) {
    let pool = wrk.backend_cons[key].pool.clone();
    let was = wrk.backend_cons[key].phase;
    wrk.backend_cons[key].requests += 1;
    let spent = pool.config.max_requests >= 0
        && wrk.backend_cons[key].requests >= pool.config.max_requests as u32;

    if close || spent {
        destroy_con(wrk, &pool, key, was);
        // a slot freed up; the head waiter's worker may connect now
        let head_worker = pool.inner.lock().waits.front().map(|w| w.worker);
        if let Some(worker) = head_worker {
            wrk.send_to_worker(worker, Wakeup::BackendKick { pool });
        }
        return;
    }

    if reserve_for_local_waiter(wrk, &pool, key) {
        // the reservation took over the active count
        drop_from_counts(&pool, wrk.ndx, key, was);
        return;
    }

    // bounded pool: move towards a waiter on another worker
    if pool.config.max_connections > 0 {
        let dest = pool.inner.lock().waits.front().map(|w| w.worker);
        if let Some(dest) = dest {
            if dest != wrk.ndx {
                detach_and_ship(wrk, &pool, key, dest);
                return;
            }
        }
    }

    drop_from_counts(&pool, wrk.ndx, key, was);
    park_idle(wrk, &pool, key);
}

fn detach_and_ship(wrk: &mut Worker, pool: &Arc<BackendPool>, key: usize, dest: usize) {
    pool.callbacks.detach_connection(pool);
    let was = wrk.backend_cons[key].phase;
    let mut con = wrk.take_backend_con(key);
    let _ = con.sock.deregister(wrk.registry());
    drop_from_counts(pool, wrk.ndx, key, was);
    wrk.send_to_worker(
        dest,
        Wakeup::BackendAttach {
            pool: pool.clone(),
            sock: con.sock,
            requests: con.requests,
        },
    );
}

/// Handles a poll event for a backend connection.
pub(crate) fn backend_event(wrk: &mut Worker, key: usize, readable: bool, writable: bool) {
    let (pool, phase) = match wrk.backend_cons.get(key) {
        Some(con) => (con.pool.clone(), con.phase),
        None => return,
    };
    match phase {
        BConPhase::Pending if writable => {
            let failed = match wrk.backend_cons[key].sock.take_error() {
                Ok(None) => false,
                Ok(Some(_)) | Err(_) => true,
            };
            if failed {
                destroy_con(wrk, &pool, key, BConPhase::Pending);
                disable_pool(&pool);
                return;
            }
            pool.callbacks.new_connection(&pool);
            pool.inner.lock().pending_count[wrk.ndx] -= 1;
            if !reserve_for_local_waiter(wrk, &pool, key) {
                park_idle(wrk, &pool, key);
            }
        }
        BConPhase::Idle if readable => {
            // idle connections must not deliver data
            match wrk.backend_cons[key].sock.probe_read() {
                ProbeResult::Quiet => {}
                ProbeResult::Data => {
                    log::error!("backend sent data on an idle connection, closing it");
                    destroy_con(wrk, &pool, key, BConPhase::Idle);
                }
                ProbeResult::Eof => destroy_con(wrk, &pool, key, BConPhase::Idle),
            }
        }
        _ => {}
    }
}

/// Handles a backend timer firing.
pub(crate) fn backend_timer(wrk: &mut Worker, event: TimerEvent) {
    match event {
        TimerEvent::BackendPending(key) => {
            let pool = match wrk.backend_cons.get(key) {
                Some(con) if con.phase == BConPhase::Pending => con.pool.clone(),
                _ => return,
            };
            log::error!("backend connect to {:?} timed out", pool.config.address);
            destroy_con(wrk, &pool, key, BConPhase::Pending);
            disable_pool(&pool);
        }
        TimerEvent::BackendIdle(key) => {
            let pool = match wrk.backend_cons.get(key) {
                Some(con) if con.phase == BConPhase::Idle => con.pool.clone(),
                _ => return,
            };
            destroy_con(wrk, &pool, key, BConPhase::Idle);
        }
        TimerEvent::WakeJob(_) => {}
        TimerEvent::CloseSocket(_) => {}
    }
}

/// Detaches one idle connection and ships it to `dest`; runs on the donor.
pub(crate) fn backend_detach_for(wrk: &mut Worker, pool: &Arc<BackendPool>, dest: usize) {
    let key = pool.inner.lock().idle[wrk.ndx].front().copied();
    if let Some(key) = key {
        detach_and_ship(wrk, pool, key, dest);
    }
}

/// Handles a shipped connection arriving on this worker.
pub(crate) fn backend_attach(
    wrk: &mut Worker,
    pool: &Arc<BackendPool>,
    sock: BackendSocket,
    requests: u32,
) {
    let key = wrk.insert_backend_con(WorkerBackendCon {
        sock,
        pool: pool.clone(),
        phase: BConPhase::Idle,
        requests,
        token: Token(0),
    });
    if wrk
        .register_backend_socket(key, Interest::READABLE)
        .is_err()
    {
        wrk.remove_backend_con(key);
        return;
    }
    pool.callbacks.attach_connection(pool);
    if !reserve_for_local_waiter(wrk, pool, key) {
        park_idle(wrk, pool, key);
    }
}

/// Handles a kick: capacity may have freed up for a local waiter.
pub(crate) fn backend_kick(wrk: &mut Worker, pool: &Arc<BackendPool>) {
    let has_local_waiter = {
        let inner = pool.inner.lock();
        inner.waits.iter().any(|w| w.worker == wrk.ndx)
    };
    if !has_local_waiter {
        return;
    }
    let can_connect = {
        let inner = pool.inner.lock();
        let max = pool.config.max_connections;
        max <= 0 || total_connections(&inner) < max as usize
    };
    if can_connect && start_connect(wrk, pool).is_err() {
        disable_pool(pool);
    }
}
