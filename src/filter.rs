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

//! Body filters.
//!
//! A filter is a stream that transforms bytes on their way between the
//! connection and the virtual request: request-body filters sit between the
//! raw input and `vr.in`, response-body filters between `vr.out` and the
//! response writer. Filters are chained in insertion order behind a plug
//! entry stream the connection feeds.

use crate::chunk::ChunkQueue;
use crate::jobqueue::JobQueue;
use crate::stream::{StreamEvent, StreamId, StreamKind, Streams};

/// Outcome of a filter's data handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterResult {
    /// All currently available input was handled; more may arrive.
    GoOn,
    /// Re-schedule immediately; there is more work than one slice allows.
    Comeback,
    /// Waiting on an external event; the filter arranges its own wakeup.
    WaitForEvent,
    /// Fatal; both queues are closed and the chain is torn down.
    Error,
}

/// Byte transformer plugged into a filter chain.
pub trait FilterHandler: Send {
    /// Moves bytes from `input` to `out`. Closing `out` after `input` is
    /// closed and drained signals completion downstream.
    fn handle_data(&mut self, input: &mut ChunkQueue, out: &mut ChunkQueue) -> FilterResult;

    /// Stream lifecycle events; the default ignores them.
    fn handle_event(&mut self, _event: StreamEvent) {}
}

/// One direction of a virtual request's filter chain.
///
/// The entry stream is always a plug the connection appends into; the tail
/// is the last filter (or the entry itself while no filter is inserted) and
/// its `out` queue is what the connection drains.
#[derive(Debug)]
pub struct FilterChain {
    entry: StreamId,
    tail: StreamId,
    endpoint: Option<StreamId>,
    filters: Vec<StreamId>,
}

impl FilterChain {
    /// Creates an empty chain.
    pub fn new(streams: &mut Streams, jq: &mut JobQueue) -> Self {
        let entry = streams.create(jq, StreamKind::Plug);
        FilterChain {
            entry,
            tail: entry,
            endpoint: None,
            filters: Vec::new(),
        }
    }

    /// Attaches a consumer endpoint behind the tail: whenever the chain
    /// produces output, `job` is re-armed. The endpoint follows the tail
    /// as filters are appended.
    pub fn set_endpoint(
        &mut self,
        streams: &mut Streams,
        jq: &mut JobQueue,
        job: crate::jobqueue::JobId,
    ) {
        if self.endpoint.is_some() {
            return;
        }
        let endpoint = streams.create_endpoint(job);
        streams.connect(jq, self.tail, endpoint);
        self.endpoint = Some(endpoint);
    }

    /// The entry stream the producer side appends into.
    pub fn entry(&self) -> StreamId {
        self.entry
    }

    /// The tail stream whose `out` the consumer side drains.
    pub fn tail(&self) -> StreamId {
        self.tail
    }

    /// Number of filters inserted.
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    /// Whether no filter is inserted.
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Appends a filter at the tail of the chain.
    pub fn append(
        &mut self,
        streams: &mut Streams,
        jq: &mut JobQueue,
        handler: Box<dyn FilterHandler>,
    ) -> StreamId {
        if let Some(endpoint) = self.endpoint {
            streams.disconnect(jq, endpoint);
        }
        let id = streams.create(jq, StreamKind::Filter(handler));
        streams.connect(jq, self.tail, id);
        self.tail = id;
        self.filters.push(id);
        if let Some(endpoint) = self.endpoint {
            streams.connect(jq, self.tail, endpoint);
        }
        id
    }

    /// Whether any filter in the chain failed.
    pub fn has_error(&self, streams: &Streams) -> bool {
        self.filters.iter().any(|&id| streams.has_error(id))
    }

    /// Tears the chain down head to tail, releasing every stream.
    pub fn teardown(self, streams: &mut Streams, jq: &mut JobQueue) {
        streams.reset(jq, self.entry);
        streams.release(jq, self.entry);
        for id in self.filters {
            streams.reset(jq, id);
            streams.release(jq, id);
        }
        if let Some(endpoint) = self.endpoint {
            streams.reset(jq, endpoint);
            streams.release(jq, endpoint);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jobqueue::JobTarget;
    use std::sync::Arc;

    struct UpcaseFilter;

    impl FilterHandler for UpcaseFilter {
        fn handle_data(&mut self, input: &mut ChunkQueue, out: &mut ChunkQueue) -> FilterResult {
            let len = input.length();
            if len > 0 {
                let mut buf = Vec::new();
                if input.extract_to(len, &mut buf).is_err() {
                    return FilterResult::Error;
                }
                input.skip(len);
                buf.make_ascii_uppercase();
                if out.append_mem(&buf).is_err() {
                    return FilterResult::Error;
                }
            }
            if input.is_closed() && !out.is_closed() {
                out.close();
            }
            FilterResult::GoOn
        }
    }

    fn jq() -> JobQueue {
        let poll = mio::Poll::new().unwrap();
        let waker = Arc::new(mio::Waker::new(poll.registry(), mio::Token(0)).unwrap());
        JobQueue::new(waker)
    }

    fn drain(streams: &mut Streams, jq: &mut JobQueue) {
        for _ in 0..32 {
            let todo = jq.begin_generation();
            if todo == 0 {
                return;
            }
            for _ in 0..todo {
                let Some((_, target)) = jq.pop() else { break };
                if let JobTarget::Stream(id) = target {
                    crate::stream::run_stream_job(streams, jq, id);
                }
            }
        }
    }

    #[test]
    fn filter_chain_transforms_through_inserted_filters() {
        let mut streams = Streams::new();
        let mut q = jq();
        let mut chain = FilterChain::new(&mut streams, &mut q);
        chain.append(&mut streams, &mut q, Box::new(UpcaseFilter));

        streams.out(chain.entry()).append_mem(b"hello").unwrap();
        streams.out(chain.entry()).close();
        streams.again(&mut q, chain.entry());
        drain(&mut streams, &mut q);

        let tail_out = streams.out(chain.tail());
        let mut buf = Vec::new();
        tail_out.extract_to(tail_out.length(), &mut buf).unwrap();
        assert_eq!(b"HELLO", &buf[..]);
        assert!(streams.out(chain.tail()).is_closed());
    }

    #[test]
    fn filter_chain_empty_passes_through_entry() {
        let mut streams = Streams::new();
        let mut q = jq();
        let chain = FilterChain::new(&mut streams, &mut q);
        assert_eq!(chain.entry(), chain.tail());
        assert!(chain.is_empty());
    }

    #[test]
    fn filter_chain_teardown_releases_streams() {
        let mut streams = Streams::new();
        let mut q = jq();
        let mut chain = FilterChain::new(&mut streams, &mut q);
        let f = chain.append(&mut streams, &mut q, Box::new(UpcaseFilter));
        let entry = chain.entry();
        chain.teardown(&mut streams, &mut q);
        assert!(!streams.contains(entry));
        assert!(!streams.contains(f));
    }
}
