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

//! Virtual requests.
//!
//! One `VRequest` is one request execution: it owns the request and
//! response objects, the resolved physical path, the environment, its
//! option vector, the action stack and the body filter chains. Its state
//! advances strictly monotonically; a `Comeback` re-enters the action stack
//! but never rewinds state, and regressions are protocol errors instead of
//! panics.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

use crate::action::{self, ActionStack, HandlerResult};
use crate::chunk::ChunkQueue;
use crate::environment::Environment;
use crate::error::{Error, Result};
use crate::filter::{FilterChain, FilterHandler};
use crate::jobqueue::{JobId, JobQueue};
use crate::options::OptionValue;
use crate::request::Request;
use crate::response::Response;
use crate::stream::{StreamId, Streams};
use crate::worker::Worker;

/// Execution phase of a virtual request. The progression is strict:
/// `Clean -> HandleRequestHeaders -> ReadContent -> HandleResponseHeaders
/// -> WriteContent`, with `Error` as the terminal failure state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VrState {
    /// Initialized, nothing ran yet.
    Clean,
    /// The action program runs against the request headers.
    HandleRequestHeaders,
    /// The request body streams in.
    ReadContent,
    /// Response status and headers get committed.
    HandleResponseHeaders,
    /// The response body streams out.
    WriteContent,
    /// Aborted; only reachable, never leavable.
    Error,
}

impl VrState {
    fn rank(self) -> u8 {
        match self {
            VrState::Clean => 0,
            VrState::HandleRequestHeaders => 1,
            VrState::ReadContent => 2,
            VrState::HandleResponseHeaders => 3,
            VrState::WriteContent => 4,
            VrState::Error => 5,
        }
    }
}

/// Produces the response body once a handler committed to handling the
/// request directly. Invoked whenever new request body data arrived in
/// `vr.vr_in`, and again while the response body is streaming.
pub trait ContentHandler: Send {
    /// Advances the handler. Closing `vr.vr_out` marks the body complete.
    fn handle_content(&mut self, vr: &mut VRequest, wrk: &mut Worker) -> HandlerResult;
}

/// Resolved filesystem mapping of the request.
#[derive(Debug, Clone, Default)]
pub struct Physical {
    /// Absolute filesystem path.
    pub path: String,
    /// Document root that produced it.
    pub doc_root: String,
    /// Trailing path info below an existing file.
    pub pathinfo: String,
}

/// One virtual request.
pub struct VRequest {
    state: VrState,
    /// Parsed request.
    pub request: Request,
    /// Response under construction.
    pub response: Response,
    /// Filesystem mapping.
    pub physical: Physical,
    /// CGI-style environment.
    pub env: Environment,
    /// Option vector, captured from the registry defaults.
    pub options: Vec<OptionValue>,
    /// The action stack driving this request.
    pub action_stack: ActionStack,
    /// Request body after the in-filter chain.
    pub vr_in: ChunkQueue,
    /// Response body before the out-filter chain.
    pub vr_out: ChunkQueue,
    /// Condition results cached for the current execution pass.
    pub(crate) cond_cache: HashMap<usize, bool>,
    handler: Option<Box<dyn ContentHandler>>,
    direct: bool,
    response_ready: bool,
    con_job: JobId,
    in_chain: Option<FilterChain>,
    out_chain: Option<FilterChain>,
    /// Pending backend pool wait, if a balancer is holding this request.
    pub backend_wait: Option<crate::backend::BackendWait>,
    /// Attached backend connection (key into the worker's backend slab).
    pub backend_con: Option<usize>,
    /// Path of an outstanding stat lookup, for cancellation.
    pub(crate) stat_wait: Option<String>,
    /// Peer address.
    pub remote_addr: SocketAddr,
    /// Local address.
    pub local_addr: SocketAddr,
}

impl fmt::Debug for VRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VRequest")
            .field("state", &self.state)
            .field("method", &self.request.method)
            .field("path", &self.request.uri.path)
            .field("status", &self.response.status)
            .field("direct", &self.direct)
            .finish()
    }
}

impl VRequest {
    /// Creates a request in `Clean` state.
    pub fn new(
        request: Request,
        options: Vec<OptionValue>,
        con_job: JobId,
        remote_addr: SocketAddr,
        local_addr: SocketAddr,
    ) -> Self {
        VRequest {
            state: VrState::Clean,
            request,
            response: Response::new(),
            physical: Physical::default(),
            env: Environment::new(),
            options,
            action_stack: ActionStack::new(),
            vr_in: ChunkQueue::new(),
            vr_out: ChunkQueue::new(),
            cond_cache: HashMap::new(),
            handler: None,
            direct: false,
            response_ready: false,
            con_job,
            in_chain: None,
            out_chain: None,
            backend_wait: None,
            backend_con: None,
            stat_wait: None,
            remote_addr,
            local_addr,
        }
    }

    /// Current state.
    pub fn state(&self) -> VrState {
        self.state
    }

    /// Advances the state. Staying in place is allowed; regressions fail
    /// with a protocol error.
    pub fn set_state(&mut self, state: VrState) -> Result<()> {
        if state.rank() < self.state.rank() {
            return Err(Error::Protocol("virtual request state regression"));
        }
        self.state = state;
        Ok(())
    }

    /// The job driving this request's connection.
    pub fn con_job(&self) -> JobId {
        self.con_job
    }

    /// Re-arms the connection job; external events use this to resume a
    /// request that yielded.
    pub fn joblist_append(&self, jq: &mut JobQueue) {
        jq.later(self.con_job);
    }

    /// Starts the action program; clears the per-pass condition cache.
    pub fn enter_action(&mut self, act: std::sync::Arc<crate::action::Action>) {
        self.cond_cache.clear();
        self.action_stack.enter(act);
    }

    /// Commits to producing the response directly with `handler`. Returns
    /// `false` if another handler already claimed the request.
    pub fn handle_direct(&mut self, handler: Box<dyn ContentHandler>) -> bool {
        if self.direct {
            return false;
        }
        self.direct = true;
        self.handler = Some(handler);
        true
    }

    /// Whether a handler committed to this request.
    pub fn is_direct(&self) -> bool {
        self.direct
    }

    /// Marks response status and headers as final.
    pub fn set_response_ready(&mut self) {
        self.response_ready = true;
    }

    /// Whether the response headers may be sent.
    pub fn is_response_ready(&self) -> bool {
        self.response_ready
    }

    /// Runs the content handler once, if any.
    pub(crate) fn run_content_handler(&mut self, wrk: &mut Worker) -> HandlerResult {
        let Some(mut handler) = self.handler.take() else {
            return HandlerResult::GoOn;
        };
        let res = handler.handle_content(self, wrk);
        if self.handler.is_none() {
            self.handler = Some(handler);
        }
        res
    }

    /// Appends a filter to the request-body chain.
    pub fn add_filter_in(
        &mut self,
        streams: &mut Streams,
        jq: &mut JobQueue,
        handler: Box<dyn FilterHandler>,
    ) -> StreamId {
        let con_job = self.con_job;
        let chain = self.in_chain.get_or_insert_with(|| {
            let mut chain = FilterChain::new(streams, jq);
            chain.set_endpoint(streams, jq, con_job);
            chain
        });
        chain.append(streams, jq, handler)
    }

    /// Appends a filter to the response-body chain.
    pub fn add_filter_out(
        &mut self,
        streams: &mut Streams,
        jq: &mut JobQueue,
        handler: Box<dyn FilterHandler>,
    ) -> StreamId {
        let con_job = self.con_job;
        let chain = self.out_chain.get_or_insert_with(|| {
            let mut chain = FilterChain::new(streams, jq);
            chain.set_endpoint(streams, jq, con_job);
            chain
        });
        chain.append(streams, jq, handler)
    }

    /// The request-body filter chain, if any filter was added.
    pub fn in_chain(&self) -> Option<&FilterChain> {
        self.in_chain.as_ref()
    }

    /// The response-body filter chain, if any filter was added.
    pub fn out_chain(&self) -> Option<&FilterChain> {
        self.out_chain.as_ref()
    }

    /// Fails the request with `status`. Before headers are committed this
    /// turns into a canonical error response; afterwards the request goes
    /// to `Error` and the connection closes after truncating the body.
    pub fn fail(&mut self, status: u16) {
        if self.response_ready || self.state.rank() >= VrState::WriteContent.rank() {
            let _ = self.set_state(VrState::Error);
            return;
        }
        action::unwind(self);
        self.handler = None;
        self.direct = true;
        self.response.reset();
        self.response.status = status;
        self.vr_out.reset();
        if status >= 400 {
            let _ = self
                .vr_out
                .append_bytes(bytes::Bytes::from(crate::response::error_page(status)));
        }
        self.vr_out.close();
        self.response_ready = true;
        let _ = self.set_state(VrState::HandleResponseHeaders);
    }

    /// Cancels everything outstanding: unwinds the action stack in reverse
    /// order, tears down the filter chains head to tail, returns or cancels
    /// any backend attachment and unlinks any stat waker.
    pub fn abort(&mut self, wrk: &mut Worker) {
        action::unwind(self);
        if let Some(chain) = self.in_chain.take() {
            chain.teardown(&mut wrk.streams, &mut wrk.jobqueue);
        }
        if let Some(chain) = self.out_chain.take() {
            chain.teardown(&mut wrk.streams, &mut wrk.jobqueue);
        }
        if let Some(wait) = self.backend_wait.take() {
            wait.cancel(wrk);
        }
        if let Some(key) = self.backend_con.take() {
            crate::backend::backend_put(wrk, key, true);
        }
        if let Some(path) = self.stat_wait.take() {
            wrk.stat_cache.cancel(&path, self.con_job);
        }
        self.handler = None;
        let _ = self.set_state(VrState::Error);
    }
}
