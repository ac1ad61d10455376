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

//! Server assembly: shared configuration, worker spawning and the accept
//! loop handing sockets to workers round-robin.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mio::{Events, Interest, Poll, Token};
use parking_lot::Mutex;

use crate::action::Action;
use crate::options::OptionRegistry;
use crate::worker::{Wakeup, Worker, WorkerHandle};

/// Static server configuration handed in by the caller.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Number of workers.
    pub worker_count: usize,
    /// Close connections without progress after this long.
    pub io_timeout: Duration,
    /// Close idle keep-alive connections after this long.
    pub keep_alive_timeout: Duration,
    /// Requests served per connection before keep-alive is refused.
    pub max_keep_alive_requests: u32,
    /// Reject request header blocks larger than this.
    pub max_header_size: u64,
    /// Stat cache entry lifetime.
    pub stat_cache_ttl: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            worker_count: 1,
            io_timeout: Duration::from_secs(60),
            keep_alive_timeout: Duration::from_secs(5),
            max_keep_alive_requests: 100,
            max_header_size: 64 * 1024,
            stat_cache_ttl: Duration::from_secs(10),
        }
    }
}

/// State shared by all workers: configuration, the option registry and the
/// compiled action tree, all immutable after activation.
pub struct ServerShared {
    /// Configuration.
    pub config: ServerConfig,
    /// Registered options with their defaults.
    pub options: OptionRegistry,
    /// Root of the compiled action program.
    pub action_root: Arc<Action>,
    handles: Mutex<Vec<WorkerHandle>>,
    stopping: AtomicBool,
}

impl std::fmt::Debug for ServerShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerShared")
            .field("config", &self.config)
            .finish()
    }
}

impl ServerShared {
    /// Creates the shared state.
    pub fn new(config: ServerConfig, options: OptionRegistry, action_root: Arc<Action>) -> Arc<Self> {
        Arc::new(ServerShared {
            config,
            options,
            action_root,
            handles: Mutex::new(Vec::new()),
            stopping: AtomicBool::new(false),
        })
    }

    /// Registers the worker handles once they all exist.
    pub fn set_worker_handles(&self, handles: Vec<WorkerHandle>) {
        *self.handles.lock() = handles;
    }

    /// The handle of worker `ndx`, once registered.
    pub fn worker_handle(&self, ndx: usize) -> Option<WorkerHandle> {
        self.handles.lock().get(ndx).cloned()
    }

    /// Whether a stop was requested.
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Requests a stop: the accept loop ends and every worker drains.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        for handle in self.handles.lock().iter() {
            handle.send(Wakeup::Stop);
        }
    }
}

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// The server: workers plus the accepting listener.
#[derive(Debug)]
pub struct Server {
    shared: Arc<ServerShared>,
    listener: mio::net::TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Binds `addr` and prepares a server around `shared`.
    pub fn bind(shared: Arc<ServerShared>, addr: SocketAddr) -> std::io::Result<Server> {
        let listener = mio::net::TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        Ok(Server {
            shared,
            listener,
            local_addr,
        })
    }

    /// The bound address, useful with port `0`.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The shared state, for stopping from another thread.
    pub fn shared(&self) -> Arc<ServerShared> {
        self.shared.clone()
    }

    /// Spawns the workers and runs the accept loop until stopped. Returns
    /// after all workers drained.
    pub fn run(mut self) -> std::io::Result<()> {
        let mut workers = Vec::with_capacity(self.shared.config.worker_count);
        let mut handles = Vec::with_capacity(self.shared.config.worker_count);
        for ndx in 0..self.shared.config.worker_count {
            let worker = Worker::new(self.shared.clone(), ndx)?;
            handles.push(worker.handle());
            workers.push(worker);
        }
        self.shared.set_worker_handles(handles.clone());

        let threads: Vec<_> = workers
            .into_iter()
            .map(|mut worker| {
                std::thread::Builder::new()
                    .name(format!("kvik-worker-{}", worker.ndx()))
                    .spawn(move || worker.run())
                    .expect("spawning a worker thread")
            })
            .collect();

        let mut poll = Poll::new()?;
        use mio::event::Source;
        self.listener
            .register(poll.registry(), LISTENER_TOKEN, Interest::READABLE)?;
        let mut events = Events::with_capacity(64);
        let mut next_worker = 0usize;

        while !self.shared.is_stopping() {
            match poll.poll(&mut events, Some(Duration::from_millis(200))) {
                Ok(()) => {}
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
            for event in events.iter() {
                if event.token() != LISTENER_TOKEN {
                    continue;
                }
                loop {
                    match self.listener.accept() {
                        Ok((sock, remote)) => {
                            let handle = &handles[next_worker % handles.len()];
                            next_worker = next_worker.wrapping_add(1);
                            handle.send(Wakeup::NewConnection { sock, remote });
                        }
                        Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                        Err(e) => {
                            log::error!("accept failed: {}", e);
                            break;
                        }
                    }
                }
            }
        }

        for thread in threads {
            let _ = thread.join();
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::sync::Arc;

    use super::*;
    use crate::action::{Action, ActionCtx, ActionHandler, HandlerResult};
    use crate::handlers::{DocrootHandler, EchoHandler, StaticFileHandler};
    use crate::options::{core_options, OptionValue};
    use crate::vrequest::VRequest;
    use crate::worker::Worker;

    struct RunningServer {
        addr: SocketAddr,
        shared: Arc<ServerShared>,
        thread: Option<std::thread::JoinHandle<()>>,
    }

    impl Drop for RunningServer {
        fn drop(&mut self) {
            self.shared.stop();
            if let Some(thread) = self.thread.take() {
                let _ = thread.join();
            }
        }
    }

    fn serve(config: ServerConfig, root: Arc<Action>) -> RunningServer {
        let _ = env_logger::builder().is_test(true).try_init();
        let shared = ServerShared::new(config, OptionRegistry::new(), root);
        let server = Server::bind(shared.clone(), "127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = server.local_addr();
        let thread = std::thread::spawn(move || server.run().unwrap());
        RunningServer {
            addr,
            shared,
            thread: Some(thread),
        }
    }

    /// Reads one response; returns (status line, headers, body).
    fn read_response(stream: &mut TcpStream) -> (String, HashMap<String, String>, Vec<u8>) {
        let mut buf = Vec::new();
        let mut tmp = [0u8; 4096];
        let header_end = loop {
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
            let n = stream.read(&mut tmp).expect("response read");
            assert!(n > 0, "connection closed before the header block ended");
            buf.extend_from_slice(&tmp[..n]);
        };

        let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
        let mut lines = head.split("\r\n");
        let status_line = lines.next().unwrap_or("").to_owned();
        let mut headers = HashMap::new();
        for line in lines {
            if let Some((k, v)) = line.split_once(':') {
                headers.insert(k.trim().to_ascii_lowercase(), v.trim().to_owned());
            }
        }

        let mut body = buf[header_end..].to_vec();
        if let Some(len) = headers.get("content-length") {
            let len: usize = len.parse().expect("content-length parses");
            while body.len() < len {
                let n = stream.read(&mut tmp).expect("body read");
                assert!(n > 0, "connection closed inside the body");
                body.extend_from_slice(&tmp[..n]);
            }
            body.truncate(len);
        } else if headers
            .get("transfer-encoding")
            .map(|v| v.eq_ignore_ascii_case("chunked"))
            .unwrap_or(false)
        {
            // collect until the terminating chunk, then unframe
            while !wire_has_trailer(&body) {
                let n = stream.read(&mut tmp).expect("chunked body read");
                assert!(n > 0, "connection closed inside chunked body");
                body.extend_from_slice(&tmp[..n]);
            }
            body = unchunk(&body);
        }
        (status_line, headers, body)
    }

    fn wire_has_trailer(wire: &[u8]) -> bool {
        wire.windows(5).any(|w| w == b"0\r\n\r\n")
    }

    fn unchunk(mut wire: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let line_end = wire.windows(2).position(|w| w == b"\r\n").expect("length line");
            let len = usize::from_str_radix(
                std::str::from_utf8(&wire[..line_end]).expect("hex length"),
                16,
            )
            .expect("valid chunk length");
            wire = &wire[line_end + 2..];
            if len == 0 {
                return out;
            }
            out.extend_from_slice(&wire[..len]);
            wire = &wire[len + 2..];
        }
    }

    fn static_root(docroot: &str) -> Arc<Action> {
        Action::new_list(vec![
            Action::new_setting(
                core_options::DOC_ROOT,
                OptionValue::String(Arc::from(docroot)),
            ),
            Action::new_function(Arc::new(DocrootHandler)),
            Action::new_function(Arc::new(StaticFileHandler)),
        ])
    }

    #[test]
    fn serves_static_file_and_keeps_connection_open() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), b"Hello, world!").unwrap();
        let server = serve(
            ServerConfig::default(),
            static_root(dir.path().to_str().unwrap()),
        );

        let mut client = TcpStream::connect(server.addr).unwrap();
        client
            .write_all(b"GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .unwrap();
        let (status, headers, body) = read_response(&mut client);
        assert_eq!("HTTP/1.1 200 OK", status);
        assert_eq!(Some("13"), headers.get("content-length").map(String::as_str));
        assert_eq!(b"Hello, world!".to_vec(), body);
        assert!(headers.contains_key("date"));
        assert!(headers.contains_key("etag"));

        // the connection stays open for the next request
        client
            .write_all(b"GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .unwrap();
        let (status, _, body) = read_response(&mut client);
        assert_eq!("HTTP/1.1 200 OK", status);
        assert_eq!(b"Hello, world!".to_vec(), body);
    }

    #[test]
    fn static_handler_answers_conditional_with_304() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"cache me").unwrap();
        let server = serve(
            ServerConfig::default(),
            static_root(dir.path().to_str().unwrap()),
        );

        let mut client = TcpStream::connect(server.addr).unwrap();
        client
            .write_all(b"GET /a.txt HTTP/1.1\r\nHost: h\r\n\r\n")
            .unwrap();
        let (_, headers, _) = read_response(&mut client);
        let etag = headers.get("etag").expect("etag emitted").clone();

        let mut client = TcpStream::connect(server.addr).unwrap();
        client
            .write_all(
                format!("GET /a.txt HTTP/1.1\r\nHost: h\r\nIf-None-Match: {}\r\n\r\n", etag)
                    .as_bytes(),
            )
            .unwrap();
        let (status, _, body) = read_response(&mut client);
        assert!(status.starts_with("HTTP/1.1 304"), "got {}", status);
        assert!(body.is_empty());
    }

    #[test]
    fn missing_host_yields_400_and_close() {
        let server = serve(ServerConfig::default(), Action::nothing());
        let mut client = TcpStream::connect(server.addr).unwrap();
        client.write_all(b"GET / HTTP/1.0\r\n\r\n").unwrap();
        let (status, headers, _) = read_response(&mut client);
        assert_eq!("HTTP/1.0 400 Bad Request", status);
        assert_ne!(
            Some("keep-alive"),
            headers.get("connection").map(String::as_str)
        );
        // the server closes after the response
        let mut tmp = [0u8; 16];
        let n = client.read(&mut tmp).unwrap_or(0);
        assert_eq!(0, n);
    }

    #[test]
    fn chunked_request_body_is_decoded_for_the_echo_handler() {
        let server = serve(
            ServerConfig::default(),
            Action::new_function(Arc::new(EchoHandler)),
        );
        let mut client = TcpStream::connect(server.addr).unwrap();
        client
            .write_all(
                b"POST /x HTTP/1.1\r\nHost: h\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n",
            )
            .unwrap();
        let (status, _, body) = read_response(&mut client);
        assert_eq!("HTTP/1.1 200 OK", status);
        assert_eq!(b"hello".to_vec(), body);
    }

    struct StallHandler;

    impl ActionHandler for StallHandler {
        fn handle(
            &self,
            _vr: &mut VRequest,
            _wrk: &mut Worker,
            _ctx: &mut ActionCtx,
        ) -> HandlerResult {
            // never schedules a wakeup; the io timeout must reap us
            HandlerResult::WaitForEvent
        }
    }

    #[test]
    fn stalled_handler_is_reaped_by_io_timeout_without_response() {
        let server = serve(
            ServerConfig {
                io_timeout: Duration::from_millis(300),
                ..ServerConfig::default()
            },
            Action::new_function(Arc::new(StallHandler)),
        );
        let mut client = TcpStream::connect(server.addr).unwrap();
        client
            .write_all(b"GET /slow HTTP/1.1\r\nHost: h\r\n\r\n")
            .unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut buf = [0u8; 256];
        // either a clean EOF or a reset, but never response bytes
        match client.read(&mut buf) {
            Ok(n) => assert_eq!(0, n, "no response body may be sent"),
            Err(_) => {}
        }
    }

    #[test]
    fn unknown_version_yields_505() {
        let server = serve(ServerConfig::default(), Action::nothing());
        let mut client = TcpStream::connect(server.addr).unwrap();
        client.write_all(b"GET / HTTP/4.2\r\nHost: h\r\n\r\n").unwrap();
        let (status, _, _) = read_response(&mut client);
        assert!(status.contains("505"), "got {}", status);
    }

    #[test]
    fn unmapped_request_yields_404_error_page() {
        let server = serve(ServerConfig::default(), Action::nothing());
        let mut client = TcpStream::connect(server.addr).unwrap();
        client
            .write_all(b"GET /nothing HTTP/1.1\r\nHost: h\r\n\r\n")
            .unwrap();
        let (status, _, body) = read_response(&mut client);
        assert_eq!("HTTP/1.1 404 Not Found", status);
        let page = String::from_utf8_lossy(&body);
        assert!(page.contains("404 - Not Found"));
    }

    #[test]
    fn expect_100_continue_is_answered_before_the_response() {
        let server = serve(
            ServerConfig::default(),
            Action::new_function(Arc::new(EchoHandler)),
        );
        let mut client = TcpStream::connect(server.addr).unwrap();
        client
            .write_all(
                b"POST /u HTTP/1.1\r\nHost: h\r\nContent-Length: 4\r\nExpect: 100-continue\r\n\r\n",
            )
            .unwrap();
        let (status, _, _) = read_response(&mut client);
        assert_eq!("HTTP/1.1 100 Continue", status);
        client.write_all(b"data").unwrap();
        let (status, _, body) = read_response(&mut client);
        assert_eq!("HTTP/1.1 200 OK", status);
        assert_eq!(b"data".to_vec(), body);
    }

    #[test]
    fn head_request_truncates_the_body() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"0123456789").unwrap();
        let server = serve(
            ServerConfig::default(),
            static_root(dir.path().to_str().unwrap()),
        );
        let mut client = TcpStream::connect(server.addr).unwrap();
        client
            .write_all(b"HEAD /f HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n")
            .unwrap();
        let mut raw = Vec::new();
        client.read_to_end(&mut raw).unwrap();
        let text = String::from_utf8_lossy(&raw);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 10\r\n"));
        assert!(text.ends_with("\r\n\r\n"), "no body may follow the headers");
    }
}
