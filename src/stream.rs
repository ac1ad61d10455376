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

//! Data-flow pipeline nodes.
//!
//! A stream owns an `out` chunk queue and links to at most one upstream and
//! one downstream neighbor, forming a linear chain. Neighbor links are
//! plain ids, never owning references, so chains cannot leak cycles; the
//! explicit refcount belongs to holders only. Events are delivered through
//! the owning worker's job queue, one job per stream, which serializes all
//! callbacks for a stream and keeps delivery on the worker thread.

use std::fmt;

use slab::Slab;

use crate::chunk::{ChunkQueue, CqLimit};
use crate::filter::{FilterHandler, FilterResult};
use crate::jobqueue::{JobId, JobQueue, JobTarget};

/// Identifies a stream inside one worker's [`Streams`] set.
pub type StreamId = usize;

/// Events delivered to a stream's handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    /// More bytes are available in `source.out`.
    NewData,
    /// The downstream raised or lowered a flow-control limit.
    NewCqLimit,
    /// An upstream neighbor was connected.
    ConnectedSource,
    /// A downstream neighbor was connected.
    ConnectedDest,
    /// No more input; flush buffered output, then disconnect the dest.
    DisconnectedSource,
    /// Consumer gone; abort upstream unless `out` is already closed.
    DisconnectedDest,
    /// Refcount hit zero; free private state.
    Destroy,
}

const EV_NEW_DATA: u8 = 1 << 0;
const EV_NEW_CQLIMIT: u8 = 1 << 1;
const EV_CONNECTED_SOURCE: u8 = 1 << 2;
const EV_CONNECTED_DEST: u8 = 1 << 3;
const EV_DISCONNECTED_SOURCE: u8 = 1 << 4;
const EV_DISCONNECTED_DEST: u8 = 1 << 5;

/// What drives a stream when its job runs.
pub enum StreamKind {
    /// Simple forwarder; also used for providing data from memory.
    Plug,
    /// Eats everything, disconnects its source on eof; `out` stays closed.
    Null,
    /// Transforms bytes from `source.out` into its own `out`.
    Filter(Box<dyn FilterHandler>),
    /// Endpoint owned by a connection; events re-arm the connection's job
    /// and are read by the connection drive via [`Streams::take_pending`].
    Connection,
}

impl fmt::Debug for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match *self {
            StreamKind::Plug => "Plug",
            StreamKind::Null => "Null",
            StreamKind::Filter(_) => "Filter",
            StreamKind::Connection => "Connection",
        })
    }
}

#[derive(Debug)]
struct Stream {
    refcount: u32,
    source: Option<StreamId>,
    dest: Option<StreamId>,
    out: ChunkQueue,
    job: JobId,
    pending: u8,
    error: bool,
    kind: StreamKind,
}

/// The per-worker stream set.
#[derive(Debug, Default)]
pub struct Streams {
    slab: Slab<Stream>,
}

impl Streams {
    /// Creates an empty set.
    pub fn new() -> Self {
        Streams::default()
    }

    /// Creates a stream with its own job; refcount starts at one.
    pub fn create(&mut self, jq: &mut JobQueue, kind: StreamKind) -> StreamId {
        let entry = self.slab.vacant_entry();
        let id = entry.key();
        let job = jq.create(JobTarget::Stream(id));
        entry.insert(Stream {
            refcount: 1,
            source: None,
            dest: None,
            out: if matches!(kind, StreamKind::Null) {
                ChunkQueue::closed()
            } else {
                ChunkQueue::new()
            },
            job,
            pending: 0,
            error: false,
            kind,
        });
        id
    }

    /// Creates a connection endpoint whose events re-arm `job` instead of a
    /// stream job of its own.
    pub fn create_endpoint(&mut self, job: JobId) -> StreamId {
        self.slab.insert(Stream {
            refcount: 1,
            source: None,
            dest: None,
            out: ChunkQueue::new(),
            job,
            pending: 0,
            error: false,
            kind: StreamKind::Connection,
        })
    }

    /// Takes another reference on `id`.
    pub fn acquire(&mut self, id: StreamId) {
        self.slab[id].refcount += 1;
    }

    /// Releases one reference; on zero the stream is disconnected, its
    /// handler receives [`StreamEvent::Destroy`] and the entry is freed.
    pub fn release(&mut self, jq: &mut JobQueue, id: StreamId) {
        let Some(stream) = self.slab.get_mut(id) else {
            return;
        };
        stream.refcount -= 1;
        if stream.refcount > 0 {
            return;
        }
        self.disconnect(jq, id);
        self.disconnect_dest(jq, id);
        let mut stream = self.slab.remove(id);
        if let StreamKind::Filter(ref mut handler) = stream.kind {
            handler.handle_event(StreamEvent::Destroy);
        }
        // connection endpoints share the connection's job, which outlives them
        if !matches!(stream.kind, StreamKind::Connection) {
            jq.dispose(stream.job);
        }
    }

    /// Whether `id` is still alive.
    pub fn contains(&self, id: StreamId) -> bool {
        self.slab.contains(id)
    }

    fn pend(&mut self, jq: &mut JobQueue, id: StreamId, bit: u8) {
        if let Some(stream) = self.slab.get_mut(id) {
            stream.pending |= bit;
            jq.later(stream.job);
        }
    }

    /// Drains and returns the pending event bits of `id`.
    pub fn take_pending(&mut self, id: StreamId) -> u8 {
        match self.slab.get_mut(id) {
            Some(stream) => std::mem::take(&mut stream.pending),
            None => 0,
        }
    }

    /// Links `src -> dst` and queues the connect events on both sides.
    pub fn connect(&mut self, jq: &mut JobQueue, src: StreamId, dst: StreamId) {
        debug_assert!(self.slab[src].dest.is_none());
        debug_assert!(self.slab[dst].source.is_none());
        self.slab[src].dest = Some(dst);
        self.slab[dst].source = Some(src);
        self.pend(jq, src, EV_CONNECTED_DEST);
        self.pend(jq, dst, EV_CONNECTED_SOURCE | EV_NEW_DATA);
    }

    /// Disconnects `id` from its source.
    pub fn disconnect(&mut self, jq: &mut JobQueue, id: StreamId) {
        let Some(src) = self.slab.get_mut(id).and_then(|s| s.source.take()) else {
            return;
        };
        if let Some(source) = self.slab.get_mut(src) {
            source.dest = None;
        }
        self.pend(jq, src, EV_DISCONNECTED_DEST);
        self.pend(jq, id, EV_DISCONNECTED_SOURCE);
    }

    /// Disconnects `id` from its dest; only for errors and resets.
    pub fn disconnect_dest(&mut self, jq: &mut JobQueue, id: StreamId) {
        let Some(dst) = self.slab.get_mut(id).and_then(|s| s.dest.take()) else {
            return;
        };
        if let Some(dest) = self.slab.get_mut(dst) {
            dest.source = None;
        }
        self.pend(jq, dst, EV_DISCONNECTED_SOURCE);
        self.pend(jq, id, EV_DISCONNECTED_DEST);
    }

    /// Disconnects both sides.
    pub fn reset(&mut self, jq: &mut JobQueue, id: StreamId) {
        self.disconnect(jq, id);
        self.disconnect_dest(jq, id);
    }

    /// Signals new data in `id.out` to the downstream neighbor.
    pub fn notify(&mut self, jq: &mut JobQueue, id: StreamId) {
        if let Some(dst) = self.slab.get(id).and_then(|s| s.dest) {
            self.pend(jq, dst, EV_NEW_DATA);
        }
    }

    /// Re-arms `id` itself: more data can be generated or read.
    pub fn again(&mut self, jq: &mut JobQueue, id: StreamId) {
        self.pend(jq, id, EV_NEW_DATA);
    }

    /// Walks `first` towards `last` via dest links, installing `limit` on
    /// every `out` queue and queuing [`StreamEvent::NewCqLimit`].
    pub fn set_cqlimit(
        &mut self,
        jq: &mut JobQueue,
        first: StreamId,
        last: Option<StreamId>,
        limit: &std::sync::Arc<CqLimit>,
    ) {
        let mut cur = Some(first);
        while let Some(id) = cur {
            let Some(stream) = self.slab.get_mut(id) else {
                break;
            };
            stream.out.set_limit(Some(limit.clone()));
            let next = stream.dest;
            self.pend(jq, id, EV_NEW_CQLIMIT);
            if Some(id) == last {
                break;
            }
            cur = next;
        }
    }

    /// Whether all `out` queues from `first` through `last` are empty.
    pub fn chain_empty(&self, first: StreamId, last: Option<StreamId>) -> bool {
        let mut cur = Some(first);
        while let Some(id) = cur {
            let Some(stream) = self.slab.get(id) else {
                return true;
            };
            if !stream.out.is_empty() {
                return false;
            }
            if Some(id) == last {
                break;
            }
            cur = stream.dest;
        }
        true
    }

    /// The `out` queue of `id`.
    pub fn out(&mut self, id: StreamId) -> &mut ChunkQueue {
        &mut self.slab[id].out
    }

    /// Read access to the `out` queue of `id`.
    pub fn out_ref(&self, id: StreamId) -> &ChunkQueue {
        &self.slab[id].out
    }

    /// The upstream neighbor of `id`.
    pub fn source(&self, id: StreamId) -> Option<StreamId> {
        self.slab.get(id).and_then(|s| s.source)
    }

    /// The downstream neighbor of `id`.
    pub fn dest(&self, id: StreamId) -> Option<StreamId> {
        self.slab.get(id).and_then(|s| s.dest)
    }

    /// Whether the stream recorded a fatal error.
    pub fn has_error(&self, id: StreamId) -> bool {
        self.slab.get(id).map(|s| s.error).unwrap_or(false)
    }

    /// `source.out` of `id` and `id.out`, for filter-style moves.
    fn in_out(&mut self, id: StreamId) -> Option<(&mut ChunkQueue, &mut ChunkQueue)> {
        let src = self.slab.get(id)?.source?;
        let (a, b) = self.slab.get2_mut(src, id)?;
        Some((&mut a.out, &mut b.out))
    }
}

/// Runs the job of stream `id`: drains its pending events and lets its kind
/// act on them. Must only be called on the owning worker's thread.
pub(crate) fn run_stream_job(streams: &mut Streams, jq: &mut JobQueue, id: StreamId) {
    let pending = streams.take_pending(id);
    if pending == 0 || !streams.contains(id) {
        return;
    }

    // the kind is taken out while running so handlers can borrow the set
    let kind = std::mem::replace(&mut streams.slab[id].kind, StreamKind::Plug);
    match kind {
        StreamKind::Plug => {
            plug_handle(streams, jq, id, pending);
            streams.slab[id].kind = StreamKind::Plug;
        }
        StreamKind::Null => {
            let done = match streams.in_out(id) {
                Some((src, _)) => {
                    src.skip_all();
                    src.is_closed()
                }
                None => false,
            };
            if done {
                streams.disconnect(jq, id);
            }
            streams.slab[id].kind = StreamKind::Null;
        }
        StreamKind::Filter(mut handler) => {
            filter_handle(streams, jq, id, pending, &mut *handler);
            if streams.contains(id) {
                streams.slab[id].kind = StreamKind::Filter(handler);
            }
        }
        StreamKind::Connection => {
            // connection endpoints share the connection's job; their events
            // are consumed by the connection drive, never here
            streams.slab[id].kind = StreamKind::Connection;
            streams.slab[id].pending = pending;
        }
    }
}

fn plug_handle(streams: &mut Streams, jq: &mut JobQueue, id: StreamId, pending: u8) {
    let mut forwarded = 0;
    let mut source_done = false;
    if let Some((src, out)) = streams.in_out(id) {
        if !out.is_closed() {
            forwarded = out.steal_all(src).unwrap_or(0);
            if src.is_closed() {
                out.close();
                source_done = true;
            }
        }
    }
    let out = &streams.slab[id].out;
    if forwarded > 0 || !out.is_empty() || out.is_closed() {
        streams.notify(jq, id);
    }
    if source_done || pending & EV_DISCONNECTED_SOURCE != 0 {
        // flushing is done above; a plug holds nothing back
        if streams.slab[id].out.is_empty() && streams.slab[id].out.is_closed() {
            streams.disconnect_dest(jq, id);
        }
    }
    if pending & EV_DISCONNECTED_DEST != 0 && !streams.slab[id].out.is_closed() {
        // consumer gone while we still produce: abort upstream
        streams.disconnect(jq, id);
    }
}

fn filter_handle(
    streams: &mut Streams,
    jq: &mut JobQueue,
    id: StreamId,
    pending: u8,
    handler: &mut dyn FilterHandler,
) {
    if pending & EV_CONNECTED_SOURCE != 0 {
        handler.handle_event(StreamEvent::ConnectedSource);
    }
    if pending & EV_CONNECTED_DEST != 0 {
        handler.handle_event(StreamEvent::ConnectedDest);
    }
    if pending & EV_NEW_CQLIMIT != 0 {
        handler.handle_event(StreamEvent::NewCqLimit);
    }

    let result = match streams.in_out(id) {
        Some((src, out)) => handler.handle_data(src, out),
        None => FilterResult::GoOn,
    };

    match result {
        FilterResult::GoOn => {}
        FilterResult::Comeback => streams.again(jq, id),
        FilterResult::WaitForEvent => {}
        FilterResult::Error => {
            log::error!("filter stream {} failed, tearing down", id);
            streams.slab[id].error = true;
            if let Some((src, out)) = streams.in_out(id) {
                src.skip_all();
                src.close();
                out.close();
            } else {
                streams.slab[id].out.close();
            }
        }
    }

    streams.notify(jq, id);

    if pending & EV_DISCONNECTED_SOURCE != 0 || streams.source(id).is_none() {
        let out = &mut streams.slab[id].out;
        if out.is_empty() && out.is_closed() {
            streams.disconnect_dest(jq, id);
        }
    }
    if pending & EV_DISCONNECTED_DEST != 0 && !streams.slab[id].out.is_closed() {
        handler.handle_event(StreamEvent::DisconnectedDest);
        streams.disconnect(jq, id);
    }
}
