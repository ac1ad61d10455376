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

//! Client connections.
//!
//! A connection binds one client socket to one main virtual request at a
//! time and drives the HTTP/1.x request lifecycle:
//! `DEAD -> KEEP_ALIVE -> REQUEST_START -> READ_REQUEST_HEADER ->
//! HANDLE_MAINVR -> WRITE`, looping back to `KEEP_ALIVE` between requests.
//! All of its work happens in the connection job: socket readiness only
//! sets flags and re-arms the job, so everything for one connection is
//! strictly serialized on its worker.

use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::time::Instant;

use bytes::Bytes;
use mio::{Interest, Token};

use crate::action::{self, HandlerResult};
use crate::chunk::ChunkQueue;
use crate::filter_chunked::{chunked_decode, chunked_encode, ChunkedDecodeState};
use crate::iostream::{socket_read, socket_write, ReadStatus, WriteStatus};
use crate::jobqueue::{JobId, JobTarget};
use crate::options::core_options;
use crate::parser::request::{RequestHead, RequestParserCtx};
use crate::parser::{ParseError, Version};
use crate::request::{BodyKind, Request};
use crate::response::{self, HeaderPlan, OutFraming, SendHeaderCtx};
use crate::throttle::ThrottleState;
use crate::vrequest::{VRequest, VrState};
use crate::waitqueue::WaitHandle;
use crate::worker::Worker;

/// Connection states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Response flushed, close pending.
    Dead,
    /// Waiting for new input after a finished request.
    KeepAlive,
    /// Connected, request not started yet.
    RequestStart,
    /// Collecting the request header block.
    ReadRequestHeader,
    /// The main virtual request is executing.
    HandleMainVr,
    /// Writing remaining response bytes.
    Write,
}

#[derive(Debug)]
enum BodyFraming {
    None,
    Length(u64),
    Chunked(ChunkedDecodeState),
    Done,
}

enum Step {
    Continue,
    Stall,
    Close { graceful: bool },
}

/// One client connection.
pub struct Connection {
    id: usize,
    pub(crate) job: JobId,
    state: ConnState,
    sock: mio::net::TcpStream,
    token: Token,
    remote_addr: SocketAddr,
    local_addr: SocketAddr,

    raw_in: ChunkQueue,
    raw_out: ChunkQueue,
    can_read: bool,
    can_write: bool,
    in_closed: bool,
    sock_error: bool,

    parser: RequestParserCtx,
    mainvr: Option<VRequest>,
    body: BodyFraming,
    out_plan: Option<HeaderPlan>,
    out_staging: ChunkQueue,

    keep_alive: bool,
    response_headers_sent: bool,
    expect_100: bool,
    cont_100_sent: bool,
    keep_alive_requests: u32,

    /// Per-connection transfer throttle.
    pub throttle: ThrottleState,

    io_elem: WaitHandle,
    ka_elem: WaitHandle,
    throttle_elem: WaitHandle,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("remote", &self.remote_addr)
            .field("keep_alive", &self.keep_alive)
            .finish()
    }
}

/// Accepts a fresh client socket into this worker.
pub(crate) fn new_connection(wrk: &mut Worker, mut sock: mio::net::TcpStream, remote: SocketAddr) {
    use mio::event::Source;

    let id = wrk.connections.insert(None);
    let job = wrk.jobqueue.create(JobTarget::Connection(id));
    let token = wrk.alloc_conn_token(id);
    if sock
        .register(
            wrk.registry(),
            token,
            Interest::READABLE | Interest::WRITABLE,
        )
        .is_err()
    {
        wrk.free_token(token);
        wrk.jobqueue.dispose(job);
        wrk.connections.remove(id);
        return;
    }

    let local_addr = sock
        .local_addr()
        .unwrap_or_else(|_| "0.0.0.0:0".parse().expect("static addr parses"));
    let now = Instant::now();
    let io_elem = wrk.io_timeout_queue.insert(id);
    wrk.io_timeout_queue.push(io_elem, now);
    let ka_elem = wrk.keep_alive_queue.insert(id);
    let throttle_elem = wrk.throttle_queue.insert(id);

    let con = Connection {
        id,
        job,
        state: ConnState::RequestStart,
        sock,
        token,
        remote_addr: remote,
        local_addr,
        raw_in: ChunkQueue::new(),
        raw_out: ChunkQueue::new(),
        // edge-triggered registration: probe both directions once
        can_read: true,
        can_write: true,
        in_closed: false,
        sock_error: false,
        parser: RequestParserCtx::new(wrk.shared.config.max_header_size),
        mainvr: None,
        body: BodyFraming::None,
        out_plan: None,
        out_staging: ChunkQueue::new(),
        keep_alive: false,
        response_headers_sent: false,
        expect_100: false,
        cont_100_sent: false,
        keep_alive_requests: 0,
        throttle: ThrottleState::new(),
        io_elem,
        ka_elem,
        throttle_elem,
    };
    wrk.connections[id] = Some(Box::new(con));
    wrk.jobqueue.later(job);
}

/// Poll readiness for a connection: set flags and re-arm the job.
pub(crate) fn socket_event(
    wrk: &mut Worker,
    id: usize,
    readable: bool,
    writable: bool,
    error: bool,
) {
    if let Some(Some(con)) = wrk.connections.get_mut(id) {
        if readable {
            con.can_read = true;
        }
        if writable {
            con.can_write = true;
        }
        if error {
            con.sock_error = true;
        }
        let job = con.job;
        wrk.jobqueue.later(job);
    }
}

/// Runs the connection job.
pub(crate) fn drive(wrk: &mut Worker, id: usize) {
    let Some(slot) = wrk.connections.get_mut(id) else {
        return;
    };
    let Some(mut con) = slot.take() else {
        return;
    };
    match con.machine(wrk) {
        Step::Close { graceful } => con.teardown(wrk, graceful),
        _ => {
            if let Some(slot) = wrk.connections.get_mut(id) {
                *slot = Some(con);
            }
        }
    }
}

/// Closes a connection from the outside (timeouts, worker shutdown).
pub(crate) fn close_connection(wrk: &mut Worker, id: usize) {
    let Some(slot) = wrk.connections.get_mut(id) else {
        return;
    };
    let Some(con) = slot.take() else {
        return;
    };
    con.teardown(wrk, false);
}

/// No progress within the io-timeout window.
pub(crate) fn io_timeout(wrk: &mut Worker, id: usize) {
    log::debug!("connection {} hit the io timeout", id);
    close_connection(wrk, id);
}

/// Idle between requests for longer than the keep-alive timeout.
pub(crate) fn keep_alive_timeout(wrk: &mut Worker, id: usize) {
    close_connection(wrk, id);
}

/// A throttle tick: refill the magazine and retry the transfer.
pub(crate) fn throttle_tick(wrk: &mut Worker, id: usize, now: Instant) {
    if let Some(Some(con)) = wrk.connections.get_mut(id) {
        con.throttle.refill(now);
        let job = con.job;
        wrk.jobqueue.later(job);
    }
}

impl Connection {
    /// Whether the connection idles between requests.
    pub(crate) fn is_idle(&self) -> bool {
        matches!(self.state, ConnState::KeepAlive | ConnState::RequestStart)
            && self.raw_in.is_empty()
    }

    fn teardown(mut self, wrk: &mut Worker, graceful: bool) {
        use mio::event::Source;

        if let Some(mut vr) = self.mainvr.take() {
            vr.abort(wrk);
        }
        wrk.io_timeout_queue.dispose(self.io_elem);
        wrk.keep_alive_queue.dispose(self.ka_elem);
        wrk.throttle_queue.dispose(self.throttle_elem);
        wrk.jobqueue.dispose(self.job);
        let _ = self.sock.deregister(wrk.registry());
        wrk.free_token(self.token);
        if wrk.connections.contains(self.id) {
            wrk.connections.remove(self.id);
        }

        if graceful {
            // half-close and wait for the peer's EOF before the final close
            let _ = self.sock.shutdown(std::net::Shutdown::Write);
            wrk.add_closing_socket(self.sock);
        }
    }

    fn io_allowance(&mut self, wrk: &mut Worker) -> usize {
        if !self.throttle.throttled() {
            return usize::MAX;
        }
        let allowance = self.throttle.query(usize::MAX);
        if allowance == 0 {
            self.throttle.mark_queued();
            wrk.throttle_queue.push(self.throttle_elem, Instant::now());
        }
        allowance
    }

    fn machine(&mut self, wrk: &mut Worker) -> Step {
        for _ in 0..64 {
            if self.sock_error {
                return Step::Close { graceful: false };
            }

            let mut progress = false;

            // socket read side
            if self.can_read && !self.in_closed {
                let allowance = self.io_allowance(wrk);
                if allowance > 0 {
                    let (n, status) =
                        socket_read(&mut self.sock, &mut wrk.read_buf, &mut self.raw_in, allowance);
                    if n > 0 {
                        progress = true;
                        wrk.stats.bytes_in += n as u64;
                        self.throttle.update(n);
                        wrk.io_timeout_queue.push(self.io_elem, Instant::now());
                    }
                    match status {
                        ReadStatus::Blocked => self.can_read = false,
                        ReadStatus::Eof => {
                            self.in_closed = true;
                            self.can_read = false;
                        }
                        ReadStatus::Throttled => {
                            self.throttle.mark_queued();
                            wrk.throttle_queue.push(self.throttle_elem, Instant::now());
                        }
                        ReadStatus::Error(e) => {
                            log::debug!("client read failed: {}", e);
                            return Step::Close { graceful: false };
                        }
                    }
                }
            }

            // protocol state machine
            match self.step_state(wrk) {
                Step::Continue => progress = true,
                Step::Stall => {}
                close @ Step::Close { .. } => return close,
            }

            // socket write side
            if self.can_write && !self.raw_out.is_empty() {
                let allowance = self.io_allowance(wrk);
                if allowance > 0 {
                    let (n, status) =
                        socket_write(self.sock.as_raw_fd(), &mut self.raw_out, allowance);
                    if n > 0 {
                        progress = true;
                        wrk.stats.bytes_out += n as u64;
                        self.throttle.update(n);
                        wrk.io_timeout_queue.push(self.io_elem, Instant::now());
                    }
                    match status {
                        WriteStatus::Done => {}
                        WriteStatus::Blocked => self.can_write = false,
                        WriteStatus::Throttled => {
                            self.throttle.mark_queued();
                            wrk.throttle_queue.push(self.throttle_elem, Instant::now());
                        }
                        WriteStatus::Error(e) => {
                            log::debug!("client write failed: {}", e);
                            return Step::Close { graceful: false };
                        }
                    }
                }
            }

            if self.state == ConnState::Dead && self.raw_out.is_empty() {
                return Step::Close { graceful: true };
            }

            if !progress {
                return Step::Stall;
            }
        }
        // yield to the loop; the job was busy long enough
        wrk.jobqueue.later(self.job);
        Step::Stall
    }

    fn step_state(&mut self, wrk: &mut Worker) -> Step {
        match self.state {
            ConnState::Dead => Step::Stall,
            ConnState::KeepAlive | ConnState::RequestStart => {
                self.skip_empty_lines();
                if !self.raw_in.is_empty() {
                    if self.state == ConnState::KeepAlive {
                        wrk.keep_alive_queue.remove(self.ka_elem);
                        wrk.io_timeout_queue.push(self.io_elem, Instant::now());
                    }
                    self.state = ConnState::ReadRequestHeader;
                    Step::Continue
                } else if self.in_closed {
                    Step::Close { graceful: true }
                } else {
                    Step::Stall
                }
            }
            ConnState::ReadRequestHeader => self.step_read_header(wrk),
            ConnState::HandleMainVr | ConnState::Write => self.step_mainvr(wrk),
        }
    }

    fn skip_empty_lines(&mut self) {
        loop {
            let first = self
                .raw_in
                .first_chunk()
                .and_then(|c| c.bytes().map(|b| b[0]));
            match first {
                Some(b'\r') | Some(b'\n') => {
                    self.raw_in.skip(1);
                }
                _ => return,
            }
        }
    }

    fn start_error_request(&mut self, wrk: &mut Worker, status: u16, version: Version) {
        let request = Request::synthetic(version);
        let options = wrk.shared.options.instantiate();
        let mut vr = VRequest::new(
            request,
            options,
            self.job,
            self.remote_addr,
            self.local_addr,
        );
        let _ = vr.set_state(VrState::HandleRequestHeaders);
        vr.fail(status);
        self.keep_alive = false;
        self.body = BodyFraming::Done;
        self.mainvr = Some(vr);
        self.state = ConnState::HandleMainVr;
    }

    fn step_read_header(&mut self, wrk: &mut Worker) -> Step {
        let header_len = match self.parser.find_header_end(&self.raw_in) {
            Ok(Some(len)) => len,
            Ok(None) => {
                if self.in_closed {
                    // eof inside the header block: nothing to answer to
                    return Step::Close { graceful: true };
                }
                return Step::Stall;
            }
            Err(ParseError::TooLarge) => {
                self.start_error_request(wrk, 413, Version::H1_0);
                return Step::Continue;
            }
            Err(_) => {
                self.start_error_request(wrk, 400, Version::H1_0);
                return Step::Continue;
            }
        };

        let mut block = Vec::new();
        if self.raw_in.extract_to(header_len, &mut block).is_err() {
            return Step::Close { graceful: false };
        }
        self.raw_in.skip(header_len);

        let head = match RequestHead::parse(&block) {
            Ok(head) => head,
            Err(ParseError::Version) => {
                self.start_error_request(wrk, 505, Version::H1_0);
                return Step::Continue;
            }
            Err(_) => {
                self.start_error_request(wrk, 400, Version::H1_0);
                return Step::Continue;
            }
        };

        wrk.stats.requests += 1;
        let mut request = Request::from_head(head);
        match request.validate(false) {
            Ok(validation) => {
                self.keep_alive = validation.keep_alive
                    && self.keep_alive_requests + 1 < wrk.shared.config.max_keep_alive_requests;
                self.expect_100 = validation.expect_100;
                self.cont_100_sent = false;
                self.body = match validation.body {
                    BodyKind::None => BodyFraming::None,
                    BodyKind::Length(n) => BodyFraming::Length(n),
                    BodyKind::Chunked => BodyFraming::Chunked(ChunkedDecodeState::new()),
                };
                let options = wrk.shared.options.instantiate();
                let mut vr = VRequest::new(
                    request,
                    options,
                    self.job,
                    self.remote_addr,
                    self.local_addr,
                );
                let _ = vr.set_state(VrState::HandleRequestHeaders);
                vr.enter_action(wrk.shared.action_root.clone());
                self.mainvr = Some(vr);
                self.state = ConnState::HandleMainVr;
                Step::Continue
            }
            Err(status) => {
                let options = wrk.shared.options.instantiate();
                let mut vr = VRequest::new(
                    request,
                    options,
                    self.job,
                    self.remote_addr,
                    self.local_addr,
                );
                let _ = vr.set_state(VrState::HandleRequestHeaders);
                vr.fail(status);
                self.keep_alive = false;
                self.body = BodyFraming::Done;
                self.mainvr = Some(vr);
                self.state = ConnState::HandleMainVr;
                Step::Continue
            }
        }
    }

    fn step_mainvr(&mut self, wrk: &mut Worker) -> Step {
        let mut progress = false;

        // run the action program
        {
            let vr = self.mainvr.as_mut().expect("mainvr in HandleMainVr");
            if vr.state() == VrState::HandleRequestHeaders {
                match action::execute(vr, wrk) {
                    HandlerResult::GoOn => {
                        if !vr.is_direct() {
                            vr.fail(404);
                        } else {
                            let _ = vr.set_state(VrState::ReadContent);
                        }
                        progress = true;
                    }
                    HandlerResult::WaitForEvent => {}
                    HandlerResult::Error | HandlerResult::Comeback => {
                        vr.fail(500);
                        progress = true;
                    }
                }
            }
        }

        // owe a 100 Continue before reading the body
        if self.expect_100 && !self.cont_100_sent {
            let past_headers = self
                .mainvr
                .as_ref()
                .map(|vr| vr.state() != VrState::HandleRequestHeaders)
                .unwrap_or(false);
            if past_headers && !matches!(self.body, BodyFraming::None | BodyFraming::Done) {
                let _ = self.raw_out.append_mem(b"HTTP/1.1 100 Continue\r\n\r\n");
                self.cont_100_sent = true;
                progress = true;
            }
        }

        if self.pump_request_body(wrk) {
            progress = true;
        }

        // let the committed handler consume input / produce output
        {
            let vr = self.mainvr.as_mut().expect("mainvr in HandleMainVr");
            if vr.is_direct() && vr.state() != VrState::HandleRequestHeaders {
                match vr.run_content_handler(wrk) {
                    HandlerResult::Error => {
                        vr.fail(500);
                        progress = true;
                    }
                    _ => {}
                }
            }
        }

        if self.maybe_send_headers(wrk) {
            progress = true;
        }

        if self.response_headers_sent && self.pump_response_body(wrk) {
            progress = true;
        }

        // client went away mid-request-body
        if self.in_closed
            && matches!(self.body, BodyFraming::Length(_) | BodyFraming::Chunked(_))
            && self.raw_in.is_empty()
        {
            return Step::Close { graceful: false };
        }

        if progress {
            Step::Continue
        } else {
            Step::Stall
        }
    }

    /// Moves request body bytes towards `vr.vr_in` honoring the framing.
    fn pump_request_body(&mut self, wrk: &mut Worker) -> bool {
        let Some(vr) = self.mainvr.as_mut() else {
            return false;
        };
        if vr.state() == VrState::HandleRequestHeaders {
            return false;
        }

        let mut moved = 0;

        // framing stage: raw_in -> chain entry (or vr.vr_in directly)
        let chain_ids = vr.in_chain().map(|c| (c.entry(), c.tail()));
        {
            let target: &mut ChunkQueue = match chain_ids {
                Some((entry_id, _)) => wrk.streams.out(entry_id),
                None => &mut vr.vr_in,
            };
            match self.body {
                BodyFraming::None => {
                    if !target.is_closed() {
                        target.close();
                        moved += 1;
                    }
                    self.body = BodyFraming::Done;
                }
                BodyFraming::Length(ref mut remaining) => {
                    if *remaining > 0 && !self.raw_in.is_empty() {
                        let n = target.steal_len(&mut self.raw_in, *remaining).unwrap_or(0);
                        *remaining -= n;
                        moved += n;
                    }
                    if *remaining == 0 {
                        if !target.is_closed() {
                            target.close();
                            moved += 1;
                        }
                        self.body = BodyFraming::Done;
                    }
                }
                BodyFraming::Chunked(ref mut state) => {
                    let before = target.bytes_in();
                    let res = chunked_decode(target, &mut self.raw_in, state);
                    moved += target.bytes_in() - before;
                    if state.is_done() {
                        self.body = BodyFraming::Done;
                    } else if matches!(res, crate::filter::FilterResult::Error) {
                        // invalid framing aborts the request
                        vr.fail(400);
                        self.keep_alive = false;
                        self.body = BodyFraming::Done;
                        return true;
                    }
                }
                BodyFraming::Done => {}
            }
        }
        if let Some((entry_id, tail_id)) = chain_ids {
            // kick the chain and collect its tail into vr.vr_in
            wrk.streams.again(&mut wrk.jobqueue, entry_id);
            let tail_out = wrk.streams.out(tail_id);
            if !tail_out.is_empty() {
                moved += vr.vr_in.steal_all(tail_out).unwrap_or(0);
            }
            if tail_out.is_closed() && !vr.vr_in.is_closed() {
                vr.vr_in.close();
                moved += 1;
            }
        }

        moved > 0
    }

    /// Emits response headers once the request marked them ready.
    fn maybe_send_headers(&mut self, wrk: &mut Worker) -> bool {
        if self.response_headers_sent {
            return false;
        }
        let Some(vr) = self.mainvr.as_mut() else {
            return false;
        };
        if !vr.is_response_ready() {
            return false;
        }

        if vr.response.status < 100 || vr.response.status > 999 {
            log::error!("invalid response status {}", vr.response.status);
            vr.response.status = 500;
        }

        // canonical error page when a 4xx/5xx has no body at all
        if vr.response.status >= 400
            && vr.vr_out.is_closed()
            && vr.vr_out.is_empty()
            && vr.out_chain().is_none()
        {
            let page = response::error_page(vr.response.status);
            let mut replacement = ChunkQueue::new();
            let _ = replacement.append_bytes(Bytes::from(page));
            replacement.close();
            vr.vr_out = replacement;
        }

        let out_chain_empty = vr
            .out_chain()
            .map(|c| wrk.streams.chain_empty(c.entry(), Some(c.tail())))
            .unwrap_or(true);
        let body_len = if vr.vr_out.is_closed() && out_chain_empty && vr.out_chain().is_none() {
            Some(vr.vr_out.length())
        } else {
            None
        };

        let date = wrk.date_str().to_owned();
        let server_tag = vr.options[core_options::SERVER_TAG].as_str().to_owned();
        let mut head = String::new();
        let plan = response::send_headers(
            &mut vr.response,
            SendHeaderCtx {
                version: vr.request.version,
                method: vr.request.method,
                keep_alive: self.keep_alive,
                body_len,
                server_tag: &server_tag,
                date: &date,
            },
            &mut head,
        );
        self.keep_alive = plan.keep_alive;
        self.out_plan = Some(plan);
        let _ = self.raw_out.append_bytes(Bytes::from(head));
        self.response_headers_sent = true;
        let _ = vr.set_state(VrState::HandleResponseHeaders);
        let _ = vr.set_state(VrState::WriteContent);
        self.state = ConnState::Write;
        true
    }

    /// Moves response body bytes from `vr.vr_out` into `raw_out` with the
    /// negotiated framing. Returns whether anything moved or finished.
    fn pump_response_body(&mut self, wrk: &mut Worker) -> bool {
        let Some(vr) = self.mainvr.as_mut() else {
            return false;
        };
        let Some(plan) = self.out_plan else {
            return false;
        };
        let mut moved = 0;

        // vr_out -> out filter chain -> staging
        let chain_ids = vr.out_chain().map(|c| (c.entry(), c.tail()));
        match chain_ids {
            Some((entry_id, tail_id)) => {
                let entry_out = wrk.streams.out(entry_id);
                if !vr.vr_out.is_empty() && !entry_out.is_closed() {
                    moved += entry_out.steal_all(&mut vr.vr_out).unwrap_or(0);
                }
                if vr.vr_out.is_closed() && !entry_out.is_closed() {
                    entry_out.close();
                    moved += 1;
                }
                wrk.streams.again(&mut wrk.jobqueue, entry_id);
                let tail_out = wrk.streams.out(tail_id);
                if !tail_out.is_empty() {
                    moved += self.out_staging.steal_all(tail_out).unwrap_or(0);
                }
                if tail_out.is_closed() && !self.out_staging.is_closed() {
                    self.out_staging.close();
                    moved += 1;
                }
            }
            None => {
                if !vr.vr_out.is_empty() {
                    moved += self.out_staging.steal_all(&mut vr.vr_out).unwrap_or(0);
                }
                if vr.vr_out.is_closed() && !self.out_staging.is_closed() {
                    self.out_staging.close();
                    moved += 1;
                }
            }
        }

        // staging -> raw_out with the wire framing
        if plan.truncate_body {
            moved += self.out_staging.skip_all();
            if self.out_staging.is_closed() && self.out_staging.is_empty() {
                moved += self.finish_request(wrk);
            }
            return moved > 0;
        }
        match plan.framing {
            OutFraming::Identity | OutFraming::UntilClose => {
                if !self.out_staging.is_empty() {
                    moved += self.raw_out.steal_all(&mut self.out_staging).unwrap_or(0);
                }
                if self.out_staging.is_closed() && self.out_staging.is_empty() {
                    moved += self.finish_request(wrk);
                }
            }
            OutFraming::Chunked => {
                let before = self.raw_out.bytes_in();
                let _ = chunked_encode(&mut self.raw_out, &mut self.out_staging);
                moved += self.raw_out.bytes_in() - before;
                if self.out_staging.is_closed() && self.out_staging.is_empty() {
                    moved += self.finish_request(wrk);
                }
            }
        }

        moved > 0
    }

    /// The response is fully staged; recycle or schedule the close.
    fn finish_request(&mut self, wrk: &mut Worker) -> u64 {
        if self.state == ConnState::Dead || self.state == ConnState::KeepAlive {
            return 0;
        }
        if let Some(mut vr) = self.mainvr.take() {
            vr.abort(wrk);
        }

        if self.keep_alive && !self.in_closed {
            self.keep_alive_requests += 1;
            self.parser.reset();
            self.body = BodyFraming::None;
            self.out_plan = None;
            self.out_staging.reset();
            self.response_headers_sent = false;
            self.expect_100 = false;
            self.cont_100_sent = false;
            self.state = ConnState::KeepAlive;
            wrk.io_timeout_queue.remove(self.io_elem);
            wrk.keep_alive_queue.push(self.ka_elem, Instant::now());
        } else {
            // flush remaining bytes, then close
            self.state = ConnState::Dead;
        }
        1
    }
}

/// Synthetic request used when a response must be produced without a
/// parseable request line.
impl Request {
    pub(crate) fn synthetic(version: Version) -> Request {
        Request {
            method: crate::parser::Method::Get,
            method_str: "GET".to_owned(),
            version,
            uri: Default::default(),
            headers: crate::http_headers::HttpHeaders::new(),
            content_length: 0,
        }
    }
}
