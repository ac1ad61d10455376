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

//! Delay-ordered timer lists.
//!
//! A wait queue implements timeouts with one uniform delay in a lightweight,
//! non-blocking way: pushing an element stamps it with the current time and
//! moves it to the tail, so the list stays sorted by deadline and the head
//! always expires first. Push, pop and remove are O(1).

use std::time::{Duration, Instant};

use slab::Slab;

/// Handle to an element allocated in a [`WaitQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitHandle(usize);

#[derive(Debug)]
struct WqElem<T> {
    data: T,
    ts: Instant,
    queued: bool,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Timer list with a single uniform delay for all elements.
#[derive(Debug)]
pub struct WaitQueue<T> {
    delay: Duration,
    slots: Slab<WqElem<T>>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl<T: Copy> WaitQueue<T> {
    /// Creates a queue whose elements expire `delay` after their last push.
    pub fn new(delay: Duration) -> Self {
        WaitQueue {
            delay,
            slots: Slab::new(),
            head: None,
            tail: None,
        }
    }

    /// The uniform delay of this queue.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Allocates an element carrying `data`. It is not queued yet.
    pub fn insert(&mut self, data: T) -> WaitHandle {
        WaitHandle(self.slots.insert(WqElem {
            data,
            ts: Instant::now(),
            queued: false,
            prev: None,
            next: None,
        }))
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let elem = &mut self.slots[idx];
            elem.queued = false;
            (elem.prev.take(), elem.next.take())
        };
        match prev {
            Some(p) => self.slots[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n].prev = prev,
            None => self.tail = prev,
        }
    }

    fn link_tail(&mut self, idx: usize) {
        let tail = self.tail;
        {
            let elem = &mut self.slots[idx];
            elem.queued = true;
            elem.prev = tail;
            elem.next = None;
        }
        match tail {
            Some(t) => self.slots[t].next = Some(idx),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
    }

    /// Re-stamps the element with `now` and moves it to the tail, appending
    /// it if it was not queued.
    pub fn push(&mut self, handle: WaitHandle, now: Instant) {
        if !self.slots.contains(handle.0) {
            return;
        }
        if self.slots[handle.0].queued {
            self.unlink(handle.0);
        }
        self.slots[handle.0].ts = now;
        self.link_tail(handle.0);
    }

    /// Unlinks the element; its slot stays allocated for a later push.
    pub fn remove(&mut self, handle: WaitHandle) {
        if self.slots.contains(handle.0) && self.slots[handle.0].queued {
            self.unlink(handle.0);
        }
    }

    /// Unlinks the element and frees its slot.
    pub fn dispose(&mut self, handle: WaitHandle) {
        if self.slots.contains(handle.0) {
            if self.slots[handle.0].queued {
                self.unlink(handle.0);
            }
            self.slots.remove(handle.0);
        }
    }

    /// Pops the first element whose deadline passed, or `None` if the head
    /// is not ready yet.
    pub fn pop_ready(&mut self, now: Instant) -> Option<(WaitHandle, T)> {
        let idx = self.head?;
        let elem = &self.slots[idx];
        if elem.ts + self.delay > now {
            return None;
        }
        let data = elem.data;
        self.unlink(idx);
        Some((WaitHandle(idx), data))
    }

    /// The instant the head element expires, or `None` if the queue is empty.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.head.map(|idx| self.slots[idx].ts + self.delay)
    }

    /// Number of queued elements.
    pub fn length(&self) -> usize {
        let mut n = 0;
        let mut cur = self.head;
        while let Some(idx) = cur {
            n += 1;
            cur = self.slots[idx].next;
        }
        n
    }

    /// Whether the element is currently queued.
    pub fn is_queued(&self, handle: WaitHandle) -> bool {
        self.slots.get(handle.0).map(|e| e.queued).unwrap_or(false)
    }
}
