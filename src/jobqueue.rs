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

//! Per-worker cooperative job scheduler.
//!
//! Jobs are registered once and re-armed cheaply. The queue runs a bounded
//! number of generations per event-loop turn: a job that re-enqueues itself
//! while running is deferred to the next generation, so a fast producer
//! cannot starve socket I/O. Other threads wake a job through its
//! [`JobWaker`], the only thread-safe entry point.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use mio::Waker;
use slab::Slab;

/// Identifies a registered job inside one worker's [`JobQueue`].
pub type JobId = usize;

/// What a job drives when it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobTarget {
    /// Deliver pending events to a stream in the worker's stream set.
    Stream(usize),
    /// Drive a connection (and its main virtual request).
    Connection(usize),
}

/// A re-usable reference to a job that survives slot reuse: the epoch must
/// still match for the token to arm anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobToken {
    id: JobId,
    epoch: u64,
}

/// Thread-safe handle that marks a job runnable and wakes the owning
/// worker's poll. Stale tokens (job disposed since) are ignored.
#[derive(Clone)]
pub struct JobWaker {
    tx: Sender<JobToken>,
    waker: Arc<Waker>,
    token: JobToken,
}

impl JobWaker {
    /// Marks the job runnable and wakes the worker. Errors (worker gone)
    /// are ignored; a dead worker has no jobs left to run.
    pub fn wake(&self) {
        if self.tx.send(self.token).is_ok() {
            let _ = self.waker.wake();
        }
    }
}

impl fmt::Debug for JobWaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobWaker").field("token", &self.token).finish()
    }
}

#[derive(Debug)]
struct JobSlot {
    target: JobTarget,
    queued: bool,
    generation: u64,
    epoch: u64,
    seq: u64,
}

/// The per-worker job queue.
#[derive(Debug)]
pub struct JobQueue {
    slots: Slab<JobSlot>,
    queue: VecDeque<(JobId, u64, u64)>,
    generation: u64,
    next_epoch: u64,
    wake_tx: Sender<JobToken>,
    wake_rx: Receiver<JobToken>,
    waker: Arc<Waker>,
}

impl JobQueue {
    /// Creates a job queue waking `waker` on async pushes.
    pub fn new(waker: Arc<Waker>) -> Self {
        let (wake_tx, wake_rx) = crossbeam_channel::unbounded();
        JobQueue {
            slots: Slab::new(),
            queue: VecDeque::new(),
            generation: 0,
            next_epoch: 1,
            wake_tx,
            wake_rx,
            waker,
        }
    }

    /// Registers a job driving `target`. The job starts idle.
    pub fn create(&mut self, target: JobTarget) -> JobId {
        let epoch = self.next_epoch;
        self.next_epoch += 1;
        self.slots.insert(JobSlot {
            target,
            queued: false,
            generation: 0,
            epoch,
            seq: 0,
        })
    }

    /// Unregisters a job; queued entries and outstanding tokens go stale.
    pub fn dispose(&mut self, id: JobId) {
        if self.slots.contains(id) {
            self.slots.remove(id);
        }
    }

    /// Marks the job for execution in a later generation.
    pub fn later(&mut self, id: JobId) {
        let Some(slot) = self.slots.get_mut(id) else {
            return;
        };
        if slot.queued {
            return;
        }
        slot.queued = true;
        slot.seq += 1;
        self.queue.push_back((id, slot.epoch, slot.seq));
    }

    /// If the job did not run in this generation yet, the caller should run
    /// it right away (returns `true`); otherwise it is queued for the next
    /// generation and `false` is returned.
    pub fn now(&mut self, id: JobId) -> bool {
        let generation = self.generation;
        let Some(slot) = self.slots.get_mut(id) else {
            return false;
        };
        if slot.generation != generation {
            slot.generation = generation;
            if slot.queued {
                // drop the queued entry; the caller runs the job instead
                slot.queued = false;
                slot.seq += 1;
            }
            true
        } else {
            drop(slot);
            self.later(id);
            false
        }
    }

    /// A token for async re-arming of `id`.
    pub fn token(&self, id: JobId) -> Option<JobToken> {
        self.slots.get(id).map(|slot| JobToken {
            id,
            epoch: slot.epoch,
        })
    }

    /// A thread-safe waker for `id`.
    pub fn waker(&self, id: JobId) -> Option<JobWaker> {
        self.token(id).map(|token| JobWaker {
            tx: self.wake_tx.clone(),
            waker: self.waker.clone(),
            token,
        })
    }

    /// Queues every job woken from other threads since the last drain.
    pub fn drain_async(&mut self) {
        while let Ok(token) = self.wake_rx.try_recv() {
            if self.slots.get(token.id).map(|s| s.epoch) == Some(token.epoch) {
                self.later(token.id);
            }
        }
    }

    /// Starts a new generation; returns the number of jobs to run in it.
    pub fn begin_generation(&mut self) -> usize {
        self.generation = self.generation.wrapping_add(1);
        if self.generation == 0 {
            self.generation = 1;
        }
        self.queue.len()
    }

    /// Pops the next runnable job of the current generation.
    pub fn pop(&mut self) -> Option<(JobId, JobTarget)> {
        while let Some((id, epoch, seq)) = self.queue.pop_front() {
            let generation = self.generation;
            if let Some(slot) = self.slots.get_mut(id) {
                if slot.epoch == epoch && slot.seq == seq && slot.queued {
                    slot.queued = false;
                    slot.generation = generation;
                    return Some((id, slot.target));
                }
            }
        }
        None
    }

    /// Whether any job is queued.
    pub fn has_pending(&self) -> bool {
        !self.queue.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn queue() -> JobQueue {
        let poll = mio::Poll::new().unwrap();
        let waker = Arc::new(Waker::new(poll.registry(), mio::Token(0)).unwrap());
        // poll dropped; wakes become no-ops, which the queue tolerates
        JobQueue::new(waker)
    }

    #[test]
    fn jobqueue_later_queues_once() {
        let mut jq = queue();
        let id = jq.create(JobTarget::Stream(7));
        jq.later(id);
        jq.later(id);
        assert_eq!(1, jq.begin_generation());
        assert_eq!(Some((id, JobTarget::Stream(7))), jq.pop());
        assert_eq!(None, jq.pop());
    }

    #[test]
    fn jobqueue_self_requeue_defers_to_next_generation() {
        let mut jq = queue();
        let id = jq.create(JobTarget::Stream(0));
        jq.later(id);

        let todo = jq.begin_generation();
        assert_eq!(1, todo);
        let mut ran = 0;
        for _ in 0..todo {
            let Some((popped, _)) = jq.pop() else { break };
            ran += 1;
            // the job re-arms itself while running
            jq.later(popped);
        }
        assert_eq!(1, ran);
        // still pending, but only for the next generation
        assert!(jq.has_pending());
        assert_eq!(1, jq.begin_generation());
        assert!(jq.pop().is_some());
    }

    #[test]
    fn jobqueue_now_runs_once_per_generation() {
        let mut jq = queue();
        let id = jq.create(JobTarget::Connection(1));
        jq.begin_generation();
        assert!(jq.now(id));
        // second `now` within the same generation defers
        assert!(!jq.now(id));
        assert!(jq.has_pending());
    }

    #[test]
    fn jobqueue_disposed_job_entries_go_stale() {
        let mut jq = queue();
        let id = jq.create(JobTarget::Stream(3));
        jq.later(id);
        jq.dispose(id);
        // a different job may reuse the slot
        let reused = jq.create(JobTarget::Stream(4));
        assert_eq!(reused, id);
        jq.begin_generation();
        // the stale entry must not run the reused job
        assert_eq!(None, jq.pop());
    }

    #[test]
    fn jobqueue_stale_tokens_are_ignored() {
        let mut jq = queue();
        let id = jq.create(JobTarget::Stream(3));
        let waker = jq.waker(id).unwrap();
        jq.dispose(id);
        let reused = jq.create(JobTarget::Stream(9));
        assert_eq!(reused, id);
        waker.wake();
        jq.drain_async();
        assert!(!jq.has_pending());
    }
}
