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

//! Token-bucket rate limiting.
//!
//! Implemented with magazines refilled every 200 ms tick. On average the
//! transfer rate never exceeds the configured limit, but short bursts of
//! previously unused bandwidth are allowed (up to four ticks worth). A
//! state may additionally belong to shared pools; each tick a pool
//! distributes its refill equally among the states that queued on it, so
//! cross-worker fairness is approximate by design.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// How frequently magazines are refilled.
pub const THROTTLE_GRANULARITY: Duration = Duration::from_millis(200);

// magazines hold at most this many ticks worth of rate
const BURST_TICKS: i64 = 4;

fn per_tick(rate: u64) -> i64 {
    (rate / 5) as i64
}

/// A rate limit shared by many connections, possibly across workers.
#[derive(Debug)]
pub struct ThrottlePool {
    rate: u64,
    magazine: AtomicI64,
    attached: AtomicI64,
    rearming: AtomicBool,
    last_rearm: Mutex<Instant>,
}

impl ThrottlePool {
    /// Creates a pool limited to `rate` bytes per second.
    pub fn new(rate: u64) -> Arc<Self> {
        Arc::new(ThrottlePool {
            rate,
            magazine: AtomicI64::new(per_tick(rate)),
            attached: AtomicI64::new(0),
            rearming: AtomicBool::new(false),
            last_rearm: Mutex::new(Instant::now()),
        })
    }

    /// The configured rate in bytes per second.
    pub fn rate(&self) -> u64 {
        self.rate
    }

    fn rearm(&self, now: Instant) {
        // only one worker refills per tick
        if self
            .rearming
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        {
            let mut last = self.last_rearm.lock();
            if now.duration_since(*last) >= THROTTLE_GRANULARITY {
                let cap = per_tick(self.rate) * BURST_TICKS;
                if self.magazine.load(Ordering::Acquire) <= cap {
                    self.magazine.fetch_add(per_tick(self.rate), Ordering::AcqRel);
                }
                *last = now;
            }
        }
        self.rearming.store(false, Ordering::Release);
    }

    fn attach_waiter(&self) {
        self.attached.fetch_add(1, Ordering::AcqRel);
    }

    fn take_share(&self) -> i64 {
        let attached = self.attached.load(Ordering::Acquire).max(1);
        loop {
            let magazine = self.magazine.load(Ordering::Acquire);
            let share = (magazine / attached).max(0);
            if self
                .magazine
                .compare_exchange(magazine, magazine - share, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.attached.fetch_sub(1, Ordering::AcqRel);
                return share;
            }
        }
    }
}

/// Per-connection throttle state.
#[derive(Debug, Default)]
pub struct ThrottleState {
    rate: u64,
    burst: i64,
    magazine: i64,
    pools: Vec<Arc<ThrottlePool>>,
    queued: bool,
}

impl ThrottleState {
    /// Creates an unlimited state.
    pub fn new() -> Self {
        ThrottleState::default()
    }

    /// Sets the per-connection rate and burst; the magazine starts full.
    pub fn set(&mut self, rate: u64, burst: u64) {
        self.rate = rate;
        self.burst = burst as i64;
        self.magazine = self.burst;
    }

    /// Adds a shared pool; returns `false` if it was already added.
    pub fn add_pool(&mut self, pool: Arc<ThrottlePool>) -> bool {
        if self.pools.iter().any(|p| Arc::ptr_eq(p, &pool)) {
            return false;
        }
        self.pools.push(pool);
        true
    }

    /// Removes a shared pool.
    pub fn remove_pool(&mut self, pool: &Arc<ThrottlePool>) {
        self.pools.retain(|p| !Arc::ptr_eq(p, pool));
    }

    /// Whether any limit applies to this state.
    pub fn throttled(&self) -> bool {
        self.rate > 0 || !self.pools.is_empty()
    }

    /// Whether the state is waiting for the next refill tick.
    pub fn queued(&self) -> bool {
        self.queued
    }

    /// The current allowance for a transfer of up to `wanted` bytes. A
    /// return of zero means the caller must queue itself on the worker's
    /// throttle wait queue; [`Self::mark_queued`] accounts the pools.
    pub fn query(&self, wanted: usize) -> usize {
        if !self.throttled() {
            return wanted;
        }
        wanted.min(self.magazine.max(0) as usize)
    }

    /// Consumes `used` bytes from the magazine after a transfer.
    pub fn update(&mut self, used: usize) {
        if self.throttled() {
            self.magazine -= used as i64;
        }
    }

    /// Registers this state as waiting; its pools count it for the next
    /// tick's share distribution.
    pub fn mark_queued(&mut self) {
        if self.queued {
            return;
        }
        self.queued = true;
        for pool in &self.pools {
            pool.attach_waiter();
        }
    }

    /// Refills the magazine at a tick. Returns the new allowance.
    pub fn refill(&mut self, now: Instant) -> usize {
        self.queued = false;
        if self.rate > 0 {
            let cap = if self.burst > 0 {
                self.burst
            } else {
                per_tick(self.rate) * BURST_TICKS
            };
            self.magazine = (self.magazine + per_tick(self.rate)).min(cap);
        }
        let mut pool_supply: i64 = 0;
        for pool in &self.pools {
            pool.rearm(now);
            pool_supply += pool.take_share();
        }
        if !self.pools.is_empty() {
            if self.rate > 0 {
                // the connection rate caps how much pool share we may bank
                self.magazine += pool_supply.min(per_tick(self.rate));
            } else {
                self.magazine += pool_supply;
            }
        }
        self.magazine.max(0) as usize
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn throttle_unlimited_state_grants_everything() {
        let state = ThrottleState::new();
        assert_eq!(123456, state.query(123456));
    }

    #[test]
    fn throttle_magazine_bounds_allowance() {
        let mut state = ThrottleState::new();
        state.set(1000, 400);
        assert_eq!(300, state.query(300));
        state.update(300);
        assert_eq!(100, state.query(300));
        state.update(100);
        assert_eq!(0, state.query(300));
    }

    #[test]
    fn throttle_refill_adds_one_tick_of_rate() {
        let mut state = ThrottleState::new();
        state.set(1000, 400);
        state.update(400);
        assert_eq!(0, state.query(100));
        let allowance = state.refill(Instant::now());
        // one tick of 1000 B/s is 200 bytes
        assert_eq!(200, allowance);
    }

    #[test]
    fn throttle_refill_respects_burst_cap() {
        let mut state = ThrottleState::new();
        state.set(1000, 400);
        for _ in 0..10 {
            state.refill(Instant::now());
        }
        assert!(state.query(usize::MAX) <= 800);
    }

    #[test]
    fn throttle_pool_share_splits_between_waiters() {
        let pool = ThrottlePool::new(1000);
        let mut a = ThrottleState::new();
        let mut b = ThrottleState::new();
        a.add_pool(pool.clone());
        b.add_pool(pool.clone());
        a.mark_queued();
        b.mark_queued();
        let now = Instant::now();
        let got_a = a.refill(now);
        let got_b = b.refill(now);
        // initial magazine is one tick (200); split two ways
        assert_eq!(100, got_a);
        assert_eq!(100, got_b);
    }

    #[test]
    fn throttle_pool_add_is_idempotent() {
        let pool = ThrottlePool::new(100);
        let mut state = ThrottleState::new();
        assert!(state.add_pool(pool.clone()));
        assert!(!state.add_pool(pool.clone()));
        state.remove_pool(&pool);
        assert!(!state.throttled());
    }
}
