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

//! Per-worker stat cache.
//!
//! `stat(2)` may block on disk io for several milliseconds, so each worker
//! keeps its own path cache and hands actual syscalls to a dedicated stat
//! thread. Requests hitting a pending or missing entry register their job
//! and suspend; the stat thread posts results back through the worker's
//! wakeup channel. Entries expire from a delete queue after a TTL, but only
//! once nothing waits on them anymore.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use crossbeam_channel::{Receiver, Sender};
use mio::Waker;
use slab::Slab;

use crate::jobqueue::{JobId, JobQueue};
use crate::waitqueue::WaitQueue;

/// The subset of `struct stat` the core consumes.
#[derive(Debug, Clone, Copy)]
pub struct FileInfo {
    /// File size in bytes.
    pub size: u64,
    /// Last modification time.
    pub mtime: SystemTime,
    /// Inode number, used for etags.
    pub inode: u64,
    /// Whether the path is a directory.
    pub is_dir: bool,
    /// Whether the path is a regular file.
    pub is_file: bool,
}

/// Result of a cache lookup.
#[derive(Debug, Clone, Copy)]
pub enum StatLookup {
    /// Fresh stat data.
    Found(FileInfo),
    /// The stat failed with this errno.
    Failed(i32),
    /// The stat is in flight; the job re-runs once it lands.
    Pending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Pending,
    Finished,
}

#[derive(Debug)]
struct StatCacheEntry {
    path: String,
    state: EntryState,
    result: Option<Result<FileInfo, i32>>,
    ts: Instant,
    waiting: Vec<JobId>,
    wq: crate::waitqueue::WaitHandle,
}

struct StatJob {
    entry: usize,
    path: String,
}

/// A finished stat posted back by the stat thread.
#[derive(Debug)]
pub struct StatResult {
    entry: usize,
    result: Result<FileInfo, i32>,
}

/// The per-worker cache.
pub struct StatCache {
    ttl: Duration,
    entries: HashMap<String, usize>,
    slab: Slab<StatCacheEntry>,
    delete_queue: WaitQueue<usize>,
    job_tx: Option<Sender<StatJob>>,
    thread: Option<std::thread::JoinHandle<()>>,
    hits: u64,
    misses: u64,
    errors: u64,
}

impl std::fmt::Debug for StatCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatCache")
            .field("entries", &self.entries.len())
            .field("hits", &self.hits)
            .field("misses", &self.misses)
            .field("errors", &self.errors)
            .finish()
    }
}

fn stat_path(path: &str) -> Result<FileInfo, i32> {
    match std::fs::metadata(path) {
        Ok(meta) => {
            use std::os::unix::fs::MetadataExt;
            Ok(FileInfo {
                size: meta.len(),
                mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                inode: meta.ino(),
                is_dir: meta.is_dir(),
                is_file: meta.is_file(),
            })
        }
        Err(e) => Err(e.raw_os_error().unwrap_or(libc::EIO)),
    }
}

fn stat_thread(rx: Receiver<StatJob>, tx: Sender<StatResult>, waker: Arc<Waker>) {
    while let Ok(job) = rx.recv() {
        let result = stat_path(&job.path);
        if tx
            .send(StatResult {
                entry: job.entry,
                result,
            })
            .is_err()
        {
            return;
        }
        let _ = waker.wake();
    }
}

impl StatCache {
    /// Creates a cache whose stat thread posts results into `result_tx` and
    /// wakes the worker through `waker`.
    pub fn new(ttl: Duration, result_tx: Sender<StatResult>, waker: Arc<Waker>) -> Self {
        let (job_tx, job_rx) = crossbeam_channel::unbounded();
        let thread = std::thread::Builder::new()
            .name("kvik-stat".to_owned())
            .spawn(move || stat_thread(job_rx, result_tx, waker))
            .expect("spawning the stat thread");
        StatCache {
            ttl,
            entries: HashMap::new(),
            slab: Slab::new(),
            delete_queue: WaitQueue::new(ttl),
            job_tx: Some(job_tx),
            thread: Some(thread),
            hits: 0,
            misses: 0,
            errors: 0,
        }
    }

    /// Cache statistics: `(hits, misses, errors)`.
    pub fn stats(&self) -> (u64, u64, u64) {
        (self.hits, self.misses, self.errors)
    }

    fn schedule(&mut self, idx: usize) {
        if let Some(ref tx) = self.job_tx {
            let path = self.slab[idx].path.clone();
            let _ = tx.send(StatJob { entry: idx, path });
        }
    }

    /// Looks up `path`. On a pending or missing entry, `job` is registered
    /// and `Pending` returned; the job re-runs once the result arrived.
    pub fn get(&mut self, path: &str, job: JobId) -> StatLookup {
        let now = Instant::now();

        if let Some(&idx) = self.entries.get(path) {
            let fresh = now.duration_since(self.slab[idx].ts) < self.ttl;
            match self.slab[idx].state {
                EntryState::Finished if fresh => {
                    self.hits += 1;
                    return match self.slab[idx].result.expect("finished entries have results") {
                        Ok(info) => StatLookup::Found(info),
                        Err(errno) => StatLookup::Failed(errno),
                    };
                }
                EntryState::Finished => {
                    // stale: reuse the entry and stat again
                    let entry = &mut self.slab[idx];
                    entry.state = EntryState::Pending;
                    entry.ts = now;
                    if !entry.waiting.contains(&job) {
                        entry.waiting.push(job);
                    }
                    self.delete_queue.push(entry.wq, now);
                    self.schedule(idx);
                    return StatLookup::Pending;
                }
                EntryState::Pending => {
                    let entry = &mut self.slab[idx];
                    if !entry.waiting.contains(&job) {
                        entry.waiting.push(job);
                    }
                    return StatLookup::Pending;
                }
            }
        }

        self.misses += 1;
        let entry = self.slab.vacant_entry();
        let idx = entry.key();
        let wq = self.delete_queue.insert(idx);
        entry.insert(StatCacheEntry {
            path: path.to_owned(),
            state: EntryState::Pending,
            result: None,
            ts: now,
            waiting: vec![job],
            wq,
        });
        self.delete_queue.push(wq, now);
        self.entries.insert(path.to_owned(), idx);
        self.schedule(idx);
        StatLookup::Pending
    }

    /// Unlinks `job` from the entry for `path`; the entry itself stays.
    pub fn cancel(&mut self, path: &str, job: JobId) {
        if let Some(&idx) = self.entries.get(path) {
            self.slab[idx].waiting.retain(|&j| j != job);
        }
    }

    /// Applies a result from the stat thread and wakes the waiting jobs.
    pub fn complete(&mut self, res: StatResult, jq: &mut JobQueue) {
        let Some(entry) = self.slab.get_mut(res.entry) else {
            return;
        };
        if res.result.is_err() {
            self.errors += 1;
        }
        entry.state = EntryState::Finished;
        entry.result = Some(res.result);
        entry.ts = Instant::now();
        for job in entry.waiting.drain(..) {
            jq.later(job);
        }
    }

    /// Evicts entries whose TTL passed and nothing waits on; entries still
    /// in use are re-queued, like the delete queue in the original design.
    pub fn expire(&mut self, now: Instant) {
        while let Some((wq, idx)) = self.delete_queue.pop_ready(now) {
            let keep = {
                let entry = &self.slab[idx];
                entry.state == EntryState::Pending || !entry.waiting.is_empty()
            };
            if keep {
                self.delete_queue.push(wq, now);
            } else {
                let entry = self.slab.remove(idx);
                self.entries.remove(&entry.path);
                self.delete_queue.dispose(wq);
            }
        }
    }

    /// The next instant [`expire`](Self::expire) has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.delete_queue.next_deadline()
    }
}

impl Drop for StatCache {
    fn drop(&mut self) {
        // closing the job channel stops the stat thread
        self.job_tx = None;
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
