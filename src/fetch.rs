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

//! Generic async key-value cache with single-flight lookups.
//!
//! Entries are revalidated on every hit; revalidation may trigger a
//! background refresh that builds a shadow entry and atomically swaps it in
//! without invalidating the current one. A failed lookup is stored as a
//! negative entry (`data == None`) and cached in its own LRU, so missing
//! keys do not hammer the backend either.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::jobqueue::JobWaker;

/// Opaque cached value.
pub type FetchData = Arc<dyn Any + Send + Sync>;

/// One cache entry. `data` is written by the backend before
/// [`FetchDatabase::entry_ready`] and read-only afterwards; `None` means
/// "not found".
pub struct FetchEntry {
    key: String,
    data: Mutex<Option<FetchData>>,
    backend_data: Mutex<Option<Box<dyn Any + Send>>>,
    ready: AtomicBool,
}

impl fmt::Debug for FetchEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchEntry")
            .field("key", &self.key)
            .field("ready", &self.ready.load(Ordering::Relaxed))
            .finish()
    }
}

impl FetchEntry {
    fn new(key: &str) -> Arc<Self> {
        Arc::new(FetchEntry {
            key: key.to_owned(),
            data: Mutex::new(None),
            backend_data: Mutex::new(None),
            ready: AtomicBool::new(false),
        })
    }

    /// The entry's key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The cached value; `None` is a negative hit.
    pub fn data(&self) -> Option<FetchData> {
        self.data.lock().clone()
    }

    /// Stores the value; only the backend calls this, before `entry_ready`.
    pub fn set_data(&self, data: Option<FetchData>) {
        *self.data.lock() = data;
    }

    /// Takes the backend's private state.
    pub fn take_backend_data(&self) -> Option<Box<dyn Any + Send>> {
        self.backend_data.lock().take()
    }

    /// Stores backend-private state alongside the entry.
    pub fn set_backend_data(&self, data: Option<Box<dyn Any + Send>>) {
        *self.backend_data.lock() = data;
    }

    /// Whether the backend finished this entry.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}

/// Backend callbacks of a fetch database.
pub trait FetchBackend: Send + Sync {
    /// Starts a lookup for `entry.key()`. The backend fills the entry and
    /// calls [`FetchDatabase::entry_ready`], synchronously or later.
    fn lookup(&self, db: &Arc<FetchDatabase>, entry: &Arc<FetchEntry>);

    /// Cheap freshness check on every hit; `false` forces a new lookup.
    /// A refresh may be triggered before returning `true`.
    fn revalidate(&self, _db: &Arc<FetchDatabase>, _entry: &Arc<FetchEntry>) -> bool {
        true
    }

    /// Builds a replacement in `shadow` and finishes with either
    /// [`FetchDatabase::refresh_ready`] or [`FetchDatabase::refresh_skip`].
    fn refresh(&self, db: &Arc<FetchDatabase>, _cur: &Arc<FetchEntry>, shadow: &Arc<FetchEntry>) {
        db.refresh_skip(shadow);
    }
}

/// Handle for cancelling a registered wait.
#[derive(Debug)]
pub struct FetchWait {
    key: String,
    waker_id: u64,
}

struct EntryState {
    entry: Arc<FetchEntry>,
    wakers: Vec<(u64, JobWaker)>,
    refresh: Option<Arc<FetchEntry>>,
}

struct Inner {
    entries: HashMap<String, EntryState>,
    pos_lru: VecDeque<String>,
    neg_lru: VecDeque<String>,
    cache_size: usize,
    neg_cache_size: usize,
    next_waker_id: u64,
}

/// The cache.
pub struct FetchDatabase {
    backend: Box<dyn FetchBackend>,
    inner: Mutex<Inner>,
}

impl fmt::Debug for FetchDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("FetchDatabase")
            .field("entries", &inner.entries.len())
            .finish()
    }
}

fn lru_touch(lru: &mut VecDeque<String>, key: &str) {
    if let Some(pos) = lru.iter().position(|k| k == key) {
        lru.remove(pos);
    }
    lru.push_back(key.to_owned());
}

fn lru_remove(lru: &mut VecDeque<String>, key: &str) {
    if let Some(pos) = lru.iter().position(|k| k == key) {
        lru.remove(pos);
    }
}

impl FetchDatabase {
    /// Creates a database with separate positive and negative cache sizes.
    pub fn new(
        backend: Box<dyn FetchBackend>,
        cache_size: usize,
        neg_cache_size: usize,
    ) -> Arc<Self> {
        Arc::new(FetchDatabase {
            backend,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                pos_lru: VecDeque::new(),
                neg_lru: VecDeque::new(),
                cache_size,
                neg_cache_size,
                next_waker_id: 1,
            }),
        })
    }

    fn register_waker(inner: &mut Inner, key: &str, waker: JobWaker) -> FetchWait {
        let id = inner.next_waker_id;
        inner.next_waker_id += 1;
        inner
            .entries
            .get_mut(key)
            .expect("entry exists while registering")
            .wakers
            .push((id, waker));
        FetchWait {
            key: key.to_owned(),
            waker_id: id,
        }
    }

    /// Looks up `key`. `None` means the lookup is in flight: the waker
    /// fires when the entry becomes ready and `wait` allows cancellation.
    /// Concurrent gets on the same missing key join one lookup.
    pub fn get(
        self: &Arc<Self>,
        key: &str,
        waker: JobWaker,
        wait: &mut Option<FetchWait>,
    ) -> Option<Arc<FetchEntry>> {
        enum Probe {
            Ready(Arc<FetchEntry>),
            InFlight,
            Miss,
        }

        {
            let mut inner = self.inner.lock();
            let probe = match inner.entries.get(key) {
                Some(state) if state.entry.is_ready() => Probe::Ready(state.entry.clone()),
                Some(_) => Probe::InFlight,
                None => Probe::Miss,
            };
            match probe {
                Probe::InFlight => {
                    // lookup already in flight: join it
                    *wait = Some(Self::register_waker(&mut inner, key, waker));
                    return None;
                }
                Probe::Miss => {}
                Probe::Ready(entry) => {
                    drop(inner);
                    if self.backend.revalidate(self, &entry) {
                        let mut inner = self.inner.lock();
                        let negative = entry.data().is_none();
                        if negative {
                            lru_touch(&mut inner.neg_lru, key);
                            lru_remove(&mut inner.pos_lru, key);
                        } else {
                            lru_touch(&mut inner.pos_lru, key);
                            lru_remove(&mut inner.neg_lru, key);
                        }
                        *wait = None;
                        return Some(entry);
                    }
                    // revalidation failed: fall through to a fresh lookup
                }
            }
        }

        let entry = FetchEntry::new(key);
        {
            let mut inner = self.inner.lock();
            lru_remove(&mut inner.pos_lru, key);
            lru_remove(&mut inner.neg_lru, key);
            inner.entries.insert(
                key.to_owned(),
                EntryState {
                    entry: entry.clone(),
                    wakers: Vec::new(),
                    refresh: None,
                },
            );
            *wait = Some(Self::register_waker(&mut inner, key, waker));
        }
        self.backend.lookup(self, &entry);
        None
    }

    /// Unregisters the waker behind `wait`; the entry itself stays.
    pub fn cancel(&self, wait: &mut Option<FetchWait>) {
        let Some(wait) = wait.take() else {
            return;
        };
        let mut inner = self.inner.lock();
        if let Some(state) = inner.entries.get_mut(&wait.key) {
            state.wakers.retain(|(id, _)| *id != wait.waker_id);
        }
    }

    /// Drops the cached entry for `key`; outstanding holders keep theirs.
    pub fn invalidate(&self, key: &str) {
        let mut inner = self.inner.lock();
        inner.entries.remove(key);
        lru_remove(&mut inner.pos_lru, key);
        lru_remove(&mut inner.neg_lru, key);
    }

    fn evict_overflow(inner: &mut Inner) {
        while inner.pos_lru.len() > inner.cache_size {
            if let Some(key) = inner.pos_lru.pop_front() {
                inner.entries.remove(&key);
            }
        }
        while inner.neg_lru.len() > inner.neg_cache_size {
            if let Some(key) = inner.neg_lru.pop_front() {
                inner.entries.remove(&key);
            }
        }
    }

    /// Marks `entry` ready and fires all waiting wakers. An entry whose
    /// data is `None` becomes a negative hit.
    pub fn entry_ready(&self, entry: &Arc<FetchEntry>) {
        entry.ready.store(true, Ordering::Release);
        let wakers = {
            let mut inner = self.inner.lock();
            let Some(state) = inner.entries.get_mut(&entry.key) else {
                return;
            };
            if !Arc::ptr_eq(&state.entry, entry) {
                return;
            }
            let wakers = std::mem::take(&mut state.wakers);
            if entry.data().is_none() {
                lru_touch(&mut inner.neg_lru, &entry.key);
            } else {
                lru_touch(&mut inner.pos_lru, &entry.key);
            }
            Self::evict_overflow(&mut inner);
            wakers
        };
        for (_, waker) in wakers {
            waker.wake();
        }
    }

    /// Triggers a background refresh of `entry` unless one is running.
    pub fn entry_refresh(self: &Arc<Self>, entry: &Arc<FetchEntry>) {
        let shadow = {
            let mut inner = self.inner.lock();
            let Some(state) = inner.entries.get_mut(&entry.key) else {
                return;
            };
            if !Arc::ptr_eq(&state.entry, entry) || state.refresh.is_some() {
                return;
            }
            let shadow = FetchEntry::new(&entry.key);
            state.refresh = Some(shadow.clone());
            shadow
        };
        self.backend.refresh(self, entry, &shadow);
    }

    /// Discards the refresh shadow; the current entry stays valid.
    pub fn refresh_skip(&self, shadow: &Arc<FetchEntry>) {
        let mut inner = self.inner.lock();
        if let Some(state) = inner.entries.get_mut(&shadow.key) {
            if let Some(ref cur) = state.refresh {
                if Arc::ptr_eq(cur, shadow) {
                    state.refresh = None;
                }
            }
        }
    }

    /// Atomically replaces the current entry with the refreshed shadow;
    /// outstanding holders of the old entry keep it until they release it.
    pub fn refresh_ready(&self, shadow: &Arc<FetchEntry>) {
        shadow.ready.store(true, Ordering::Release);
        let mut inner = self.inner.lock();
        let Some(state) = inner.entries.get_mut(&shadow.key) else {
            return;
        };
        let matches = state
            .refresh
            .as_ref()
            .map(|s| Arc::ptr_eq(s, shadow))
            .unwrap_or(false);
        if !matches {
            return;
        }
        state.refresh = None;
        state.entry = shadow.clone();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jobqueue::{JobQueue, JobTarget};
    use std::sync::atomic::AtomicUsize;

    struct CountingBackend {
        lookups: AtomicUsize,
        answer_inline: bool,
        negative: bool,
    }

    impl FetchBackend for CountingBackend {
        fn lookup(&self, db: &Arc<FetchDatabase>, entry: &Arc<FetchEntry>) {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            if self.answer_inline {
                if !self.negative {
                    entry.set_data(Some(Arc::new(entry.key().to_owned())));
                }
                db.entry_ready(entry);
            }
        }
    }

    fn waker(jq: &mut JobQueue) -> JobWaker {
        let job = jq.create(JobTarget::Connection(0));
        jq.waker(job).unwrap()
    }

    fn jq() -> JobQueue {
        let poll = mio::Poll::new().unwrap();
        let w = Arc::new(mio::Waker::new(poll.registry(), mio::Token(0)).unwrap());
        JobQueue::new(w)
    }

    #[test]
    fn fetch_lookup_and_hit() {
        let mut jq = jq();
        let db = FetchDatabase::new(
            Box::new(CountingBackend {
                lookups: AtomicUsize::new(0),
                answer_inline: true,
                negative: false,
            }),
            16,
            16,
        );
        let mut wait = None;
        // inline-answering backend: the entry is ready on the second call
        assert!(db.get("k", waker(&mut jq), &mut wait).is_none());
        let entry = db.get("k", waker(&mut jq), &mut wait).expect("ready now");
        assert!(entry.data().is_some());
    }

    #[test]
    fn fetch_single_flight_joins_concurrent_gets() {
        let mut jq = jq();
        let backend = Box::new(CountingBackend {
            lookups: AtomicUsize::new(0),
            answer_inline: false,
            negative: false,
        });
        let db = FetchDatabase::new(backend, 16, 16);
        let mut wait_a = None;
        let mut wait_b = None;
        assert!(db.get("k", waker(&mut jq), &mut wait_a).is_none());
        assert!(db.get("k", waker(&mut jq), &mut wait_b).is_none());
        // single-flight: only one backend lookup may be outstanding
        let inner = db.inner.lock();
        let state = inner.entries.get("k").unwrap();
        assert_eq!(2, state.wakers.len());
        drop(inner);
    }

    #[test]
    fn fetch_negative_entries_are_cached() {
        let mut jq = jq();
        let db = FetchDatabase::new(
            Box::new(CountingBackend {
                lookups: AtomicUsize::new(0),
                answer_inline: true,
                negative: true,
            }),
            16,
            16,
        );
        let mut wait = None;
        assert!(db.get("missing", waker(&mut jq), &mut wait).is_none());
        let entry = db.get("missing", waker(&mut jq), &mut wait).expect("negative hit");
        assert!(entry.data().is_none());
        let inner = db.inner.lock();
        assert!(inner.neg_lru.contains(&"missing".to_owned()));
        assert!(!inner.pos_lru.contains(&"missing".to_owned()));
    }

    #[test]
    fn fetch_cancel_unlinks_waker() {
        let mut jq = jq();
        let db = FetchDatabase::new(
            Box::new(CountingBackend {
                lookups: AtomicUsize::new(0),
                answer_inline: false,
                negative: false,
            }),
            16,
            16,
        );
        let mut wait = None;
        db.get("k", waker(&mut jq), &mut wait);
        assert!(wait.is_some());
        db.cancel(&mut wait);
        assert!(wait.is_none());
        let inner = db.inner.lock();
        assert!(inner.entries.get("k").unwrap().wakers.is_empty());
    }

    #[test]
    fn fetch_refresh_ready_swaps_entry() {
        struct RefreshBackend;
        impl FetchBackend for RefreshBackend {
            fn lookup(&self, db: &Arc<FetchDatabase>, entry: &Arc<FetchEntry>) {
                entry.set_data(Some(Arc::new(1u32)));
                db.entry_ready(entry);
            }
            fn refresh(
                &self,
                db: &Arc<FetchDatabase>,
                _cur: &Arc<FetchEntry>,
                shadow: &Arc<FetchEntry>,
            ) {
                shadow.set_data(Some(Arc::new(2u32)));
                db.refresh_ready(shadow);
            }
        }
        let mut jq = jq();
        let db = FetchDatabase::new(Box::new(RefreshBackend), 16, 16);
        let mut wait = None;
        db.get("k", waker(&mut jq), &mut wait);
        let old = db.get("k", waker(&mut jq), &mut wait).unwrap();
        db.entry_refresh(&old);
        let new = db.get("k", waker(&mut jq), &mut wait).unwrap();
        // the swapped-in shadow carries the new value; the old handle is
        // unchanged for its holder
        let val = new.data().unwrap().downcast::<u32>().unwrap();
        assert_eq!(2, *val);
        let old_val = old.data().unwrap().downcast::<u32>().unwrap();
        assert_eq!(1, *old_val);
    }

    #[test]
    fn fetch_lru_evicts_oldest_positive_entries() {
        let mut jq = jq();
        let db = FetchDatabase::new(
            Box::new(CountingBackend {
                lookups: AtomicUsize::new(0),
                answer_inline: true,
                negative: false,
            }),
            2,
            2,
        );
        let mut wait = None;
        for key in ["a", "b", "c"] {
            db.get(key, waker(&mut jq), &mut wait);
        }
        let inner = db.inner.lock();
        assert_eq!(2, inner.pos_lru.len());
        assert!(!inner.entries.contains_key("a"));
        assert!(inner.entries.contains_key("c"));
    }
}
