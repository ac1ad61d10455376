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

//! Core action handlers: physical-path mapping, static files, fixed
//! responses, request echo and a single-pool balancer.

use std::sync::Arc;

use bytes::Bytes;

use crate::action::{ActionCtx, ActionHandler, Balancer, HandlerResult};
use crate::backend::{backend_get, BackendPool, BackendResult};
use crate::chunk::ChunkFile;
use crate::error::BackendError;
use crate::etag;
use crate::options::core_options;
use crate::stat_cache::StatLookup;
use crate::vrequest::{ContentHandler, VRequest};
use crate::worker::Worker;

/// Content handler for responses whose body is already fully queued.
#[derive(Debug)]
struct NoBody;

impl ContentHandler for NoBody {
    fn handle_content(&mut self, _vr: &mut VRequest, _wrk: &mut Worker) -> HandlerResult {
        HandlerResult::GoOn
    }
}

/// Commits `vr` to a bodyless (or pre-filled) direct response.
pub fn respond_direct(vr: &mut VRequest, status: u16) {
    if vr.handle_direct(Box::new(NoBody)) {
        vr.response.status = status;
        vr.vr_out.close();
        vr.set_response_ready();
    }
}

/// Maps the request path under the configured docroot into
/// `vr.physical.path`.
#[derive(Debug, Default)]
pub struct DocrootHandler;

impl ActionHandler for DocrootHandler {
    fn handle(&self, vr: &mut VRequest, _wrk: &mut Worker, _ctx: &mut ActionCtx) -> HandlerResult {
        let docroot = vr.options[core_options::DOC_ROOT].as_str().to_owned();
        if docroot.is_empty() {
            return HandlerResult::GoOn;
        }
        let mut path = docroot;
        while path.ends_with('/') {
            path.pop();
        }
        path.push_str(&vr.request.uri.path);
        vr.physical.doc_root = vr.options[core_options::DOC_ROOT].as_str().to_owned();
        vr.physical.path = path;
        HandlerResult::GoOn
    }
}

/// Serves regular files from `vr.physical.path` with etag and
/// `Last-Modified` conditional handling.
#[derive(Debug, Default)]
pub struct StaticFileHandler;

impl ActionHandler for StaticFileHandler {
    fn handle(&self, vr: &mut VRequest, wrk: &mut Worker, _ctx: &mut ActionCtx) -> HandlerResult {
        if vr.is_direct() {
            return HandlerResult::GoOn;
        }
        if vr.physical.path.is_empty() {
            // nothing mapped; let a later action take the request
            return HandlerResult::GoOn;
        }
        let path = vr.physical.path.clone();
        match wrk.stat_cache.get(&path, vr.con_job()) {
            StatLookup::Pending => {
                vr.stat_wait = Some(path);
                HandlerResult::WaitForEvent
            }
            StatLookup::Failed(errno) => {
                vr.stat_wait = None;
                let status = match errno {
                    libc::ENOENT | libc::ENOTDIR => 404,
                    libc::EACCES => 403,
                    _ => 500,
                };
                respond_direct(vr, status);
                HandlerResult::GoOn
            }
            StatLookup::Found(info) => {
                vr.stat_wait = None;
                if !info.is_file {
                    respond_direct(vr, 403);
                    return HandlerResult::GoOn;
                }
                let flags = vr.options[core_options::ETAG_FLAGS].as_number() as u32;
                let cachable = etag::set_headers(
                    &vr.request.headers,
                    &mut vr.response.headers,
                    &info,
                    flags,
                );
                if cachable {
                    respond_direct(vr, 304);
                    return HandlerResult::GoOn;
                }
                if vr.handle_direct(Box::new(NoBody)) {
                    vr.response.status = 200;
                    let file = ChunkFile::open_lazy(path.into());
                    let _ = vr.vr_out.append_file(file, 0, info.size);
                    vr.vr_out.close();
                    vr.set_response_ready();
                }
                HandlerResult::GoOn
            }
        }
    }
}

/// Responds with a fixed status and body.
#[derive(Debug)]
pub struct FixedResponseHandler {
    status: u16,
    body: Bytes,
}

impl FixedResponseHandler {
    /// A handler answering every request with `status` and `body`.
    pub fn new(status: u16, body: impl Into<Bytes>) -> Arc<Self> {
        Arc::new(FixedResponseHandler {
            status,
            body: body.into(),
        })
    }
}

impl ActionHandler for FixedResponseHandler {
    fn handle(&self, vr: &mut VRequest, _wrk: &mut Worker, _ctx: &mut ActionCtx) -> HandlerResult {
        if vr.handle_direct(Box::new(NoBody)) {
            vr.response.status = self.status;
            let _ = vr.vr_out.append_bytes(self.body.clone());
            vr.vr_out.close();
            vr.set_response_ready();
        }
        HandlerResult::GoOn
    }
}

#[derive(Debug, Default)]
struct EchoBody;

impl ContentHandler for EchoBody {
    fn handle_content(&mut self, vr: &mut VRequest, _wrk: &mut Worker) -> HandlerResult {
        // buffer the whole body so the response can announce its length
        if !vr.vr_in.is_closed() {
            return HandlerResult::GoOn;
        }
        if !vr.vr_in.is_empty() {
            let _ = vr.vr_out.steal_all(&mut vr.vr_in);
        }
        if !vr.vr_out.is_closed() {
            vr.response.status = 200;
            vr.set_response_ready();
            vr.vr_out.close();
        }
        HandlerResult::GoOn
    }
}

/// Echoes the request body back; mainly exercises the body plumbing.
#[derive(Debug, Default)]
pub struct EchoHandler;

impl ActionHandler for EchoHandler {
    fn handle(&self, vr: &mut VRequest, _wrk: &mut Worker, _ctx: &mut ActionCtx) -> HandlerResult {
        vr.handle_direct(Box::new(EchoBody));
        HandlerResult::GoOn
    }
}

/// Balancer over one backend pool; on failure it answers 502/503.
pub struct SingleBalancer {
    pool: Arc<BackendPool>,
}

impl std::fmt::Debug for SingleBalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleBalancer").finish()
    }
}

impl SingleBalancer {
    /// A balancer always selecting `pool`.
    pub fn new(pool: Arc<BackendPool>) -> Arc<Self> {
        Arc::new(SingleBalancer { pool })
    }
}

impl Balancer for SingleBalancer {
    fn select(&self, vr: &mut VRequest, wrk: &mut Worker, _ctx: &mut ActionCtx) -> HandlerResult {
        let con_job = vr.con_job();
        match backend_get(wrk, &self.pool, con_job, &mut vr.backend_wait) {
            BackendResult::Success(key) => {
                vr.backend_con = Some(key);
                HandlerResult::GoOn
            }
            BackendResult::Wait => HandlerResult::WaitForEvent,
            BackendResult::Timeout => {
                vr.action_stack.backend_error = Some(BackendError::Overload);
                HandlerResult::Comeback
            }
        }
    }

    fn fallback(
        &self,
        vr: &mut VRequest,
        _wrk: &mut Worker,
        _ctx: &mut ActionCtx,
        error: BackendError,
    ) -> HandlerResult {
        let status = match error {
            BackendError::Overload => 503,
            BackendError::Dead => 502,
        };
        respond_direct(vr, status);
        HandlerResult::GoOn
    }
}
