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

//! Collect framework: run a function on every worker and deliver the
//! aggregated results back to the calling worker.
//!
//! Each worker runs the collect function in its own loop context and
//! decrements a shared counter; whoever finishes last posts the callback
//! job back to the origin worker. A stopped collect still delivers, with
//! `complete == false`.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::worker::{Wakeup, Worker};

/// Value produced per worker.
pub type CollectValue = Box<dyn Any + Send>;

/// The per-worker function.
pub type CollectFunc = Box<dyn Fn(&mut Worker) -> CollectValue + Send + Sync>;

/// The aggregation callback, run on the origin worker.
pub type CollectCallback =
    Box<dyn FnOnce(&mut Worker, Vec<Option<CollectValue>>, bool) + Send>;

/// One in-flight collect run.
pub struct CollectInfo {
    origin: usize,
    counter: AtomicUsize,
    stopped: AtomicBool,
    func: CollectFunc,
    cb: Mutex<Option<CollectCallback>>,
    results: Mutex<Vec<Option<CollectValue>>>,
}

impl fmt::Debug for CollectInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectInfo")
            .field("origin", &self.origin)
            .field("remaining", &self.counter.load(Ordering::Relaxed))
            .finish()
    }
}

impl CollectInfo {
    /// Marks the collect as stopped; the callback still runs, with
    /// `complete == false`.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }
}

/// Starts a collect from `wrk`: `func` runs on every worker, `cb` receives
/// the result vector (indexed by worker) on this worker.
pub fn collect_start(wrk: &mut Worker, func: CollectFunc, cb: CollectCallback) -> Arc<CollectInfo> {
    let worker_count = wrk.shared.config.worker_count;
    let info = Arc::new(CollectInfo {
        origin: wrk.ndx,
        counter: AtomicUsize::new(worker_count),
        stopped: AtomicBool::new(false),
        func,
        cb: Mutex::new(Some(cb)),
        results: Mutex::new((0..worker_count).map(|_| None).collect()),
    });

    for ndx in 0..worker_count {
        if ndx == wrk.ndx {
            collect_run(wrk, &info);
        } else {
            wrk.send_to_worker(ndx, Wakeup::CollectRun(info.clone()));
        }
    }
    info
}

/// Runs the collect function on this worker; called from the worker loop.
pub(crate) fn collect_run(wrk: &mut Worker, info: &Arc<CollectInfo>) {
    let value = (info.func)(wrk);
    info.results.lock()[wrk.ndx] = Some(value);
    if info.counter.fetch_sub(1, Ordering::AcqRel) != 1 {
        return;
    }
    // last worker done delivers to the origin
    if info.origin == wrk.ndx {
        collect_deliver(wrk, info);
    } else {
        wrk.send_to_worker(info.origin, Wakeup::CollectDone(info.clone()));
    }
}

/// Delivers the aggregated results on the origin worker.
pub(crate) fn collect_deliver(wrk: &mut Worker, info: &Arc<CollectInfo>) {
    let Some(cb) = info.cb.lock().take() else {
        return;
    };
    let results = std::mem::take(&mut *info.results.lock());
    let complete = !info.stopped.load(Ordering::Acquire);
    cb(wrk, results, complete);
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::action::Action;
    use crate::options::OptionRegistry;
    use crate::server::{ServerConfig, ServerShared};
    use std::time::Duration;

    #[test]
    fn collect_aggregates_per_worker_values_on_the_origin() {
        let shared = ServerShared::new(
            ServerConfig {
                worker_count: 2,
                ..ServerConfig::default()
            },
            OptionRegistry::new(),
            Action::nothing(),
        );
        let mut wrk0 = Worker::new(shared.clone(), 0).unwrap();
        let mut wrk1 = Worker::new(shared.clone(), 1).unwrap();
        shared.set_worker_handles(vec![wrk0.handle(), wrk1.handle()]);

        let delivered: Arc<Mutex<Option<(Vec<usize>, bool)>>> = Arc::new(Mutex::new(None));
        let sink = delivered.clone();
        collect_start(
            &mut wrk0,
            Box::new(|wrk: &mut Worker| Box::new(wrk.ndx()) as CollectValue),
            Box::new(move |_wrk, results, complete| {
                let values: Vec<usize> = results
                    .into_iter()
                    .map(|r| *r.expect("every worker reported").downcast::<usize>().unwrap())
                    .collect();
                *sink.lock() = Some((values, complete));
            }),
        );

        // drive both workers until the callback landed on the origin
        for _ in 0..100 {
            wrk1.tick(Some(Duration::from_millis(5))).unwrap();
            wrk0.tick(Some(Duration::from_millis(5))).unwrap();
            if delivered.lock().is_some() {
                break;
            }
        }
        let (values, complete) = delivered.lock().take().expect("collect delivered");
        assert_eq!(vec![0, 1], values);
        assert!(complete);
    }

    #[test]
    fn collect_single_worker_delivers_inline() {
        let shared = ServerShared::new(
            ServerConfig::default(),
            OptionRegistry::new(),
            Action::nothing(),
        );
        let mut wrk = Worker::new(shared.clone(), 0).unwrap();
        shared.set_worker_handles(vec![wrk.handle()]);

        let delivered: Arc<Mutex<Option<bool>>> = Arc::new(Mutex::new(None));
        let sink = delivered.clone();
        let info = collect_start(
            &mut wrk,
            Box::new(|_wrk: &mut Worker| Box::new(()) as CollectValue),
            Box::new(move |_wrk, _results, complete| {
                *sink.lock() = Some(complete);
            }),
        );
        let _ = info;
        assert_eq!(Some(true), *delivered.lock());
    }
}
