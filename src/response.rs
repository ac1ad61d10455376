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

//! Response data and header emission.

use crate::http_headers::HttpHeaders;
use crate::parser::status::Status;
use crate::parser::{Method, Version};

/// Response state of a virtual request.
#[derive(Debug)]
pub struct Response {
    /// Status code to send; `0` while unset.
    pub status: u16,
    /// Response headers.
    pub headers: HttpHeaders,
}

impl Response {
    /// Creates an empty response.
    pub fn new() -> Self {
        Response {
            status: 0,
            headers: HttpHeaders::new(),
        }
    }

    /// Returns the response to its initial state.
    pub fn reset(&mut self) {
        self.status = 0;
        self.headers.reset();
    }
}

impl Default for Response {
    fn default() -> Self {
        Response::new()
    }
}

/// How the response body goes onto the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutFraming {
    /// Body length was announced via `Content-Length`.
    Identity,
    /// `Transfer-Encoding: chunked`; the chunked encoder frames the body.
    Chunked,
    /// Body is delimited by connection close.
    UntilClose,
}

/// Outcome of header emission.
#[derive(Debug, Clone, Copy)]
pub struct HeaderPlan {
    /// Body framing to apply while streaming.
    pub framing: OutFraming,
    /// Body must be dropped (HEAD or a no-body status).
    pub truncate_body: bool,
    /// Keep-alive after this response.
    pub keep_alive: bool,
}

/// Everything header emission needs to know about the exchange.
#[derive(Debug)]
pub struct SendHeaderCtx<'a> {
    /// Request protocol version.
    pub version: Version,
    /// Request method (for HEAD truncation).
    pub method: Method,
    /// Keep-alive wish going in; the plan may clear it.
    pub keep_alive: bool,
    /// Body length if it is fully produced already.
    pub body_len: Option<u64>,
    /// Configured `Server` value; not emitted when empty.
    pub server_tag: &'a str,
    /// Preformatted IMF-fixdate for the `Date` header.
    pub date: &'a str,
}

/// Statuses that must not carry a body per RFC 7230 Section 3.3.
pub fn status_has_no_body(status: u16) -> bool {
    status < 200 || status == 204 || status == 205 || status == 304
}

/// Serializes status line and headers into `head` and decides body framing.
pub fn send_headers(resp: &mut Response, ctx: SendHeaderCtx<'_>, head: &mut String) -> HeaderPlan {
    let mut keep_alive = ctx.keep_alive;
    let mut truncate_body = false;
    let framing;

    if status_has_no_body(resp.status) {
        truncate_body = true;
        framing = OutFraming::Identity;
    } else if let Some(len) = ctx.body_len {
        resp.headers.overwrite("Content-Length", &len.to_string());
        framing = OutFraming::Identity;
    } else if keep_alive && ctx.version == Version::H1_1 {
        resp.headers.append("Transfer-Encoding", "chunked");
        framing = OutFraming::Chunked;
    } else {
        // unknown content length and no chunked encoding possible
        keep_alive = false;
        framing = OutFraming::UntilClose;
    }

    if ctx.method == Method::Head {
        // content headers stay as computed, the body is dropped
        truncate_body = true;
    }

    match ctx.version {
        Version::H1_1 => {
            head.push_str("HTTP/1.1 ");
            if !keep_alive {
                resp.headers.overwrite("Connection", "close");
            }
        }
        Version::H1_0 => {
            head.push_str("HTTP/1.0 ");
            if keep_alive {
                resp.headers.overwrite("Connection", "keep-alive");
            }
        }
    }

    head.push_str(&resp.status.to_string());
    head.push(' ');
    head.push_str(Status::reason(resp.status));
    head.push_str("\r\n");

    let mut have_date = false;
    let mut have_server = false;
    for header in resp.headers.iter() {
        head.push_str(header.line());
        head.push_str("\r\n");
        if !have_date && header.key_is("date") {
            have_date = true;
        }
        if !have_server && header.key_is("server") {
            have_server = true;
        }
    }

    if !have_date {
        // HTTP/1.1 requires a Date header
        head.push_str("Date: ");
        head.push_str(ctx.date);
        head.push_str("\r\n");
    }

    if !have_server && !ctx.server_tag.is_empty() {
        head.push_str("Server: ");
        head.push_str(ctx.server_tag);
        head.push_str("\r\n");
    }

    head.push_str("\r\n");

    HeaderPlan {
        framing,
        truncate_body,
        keep_alive,
    }
}

/// The minimal error page served when a 4xx/5xx has no handler body.
pub fn error_page(status: u16) -> String {
    let reason = Status::reason(status);
    format!(
        "<?xml version=\"1.0\" encoding=\"iso-8859-1\"?>\n\
         <!DOCTYPE html PUBLIC \"-//W3C//DTD XHTML 1.0 Transitional//EN\"\n\
         \x20        \"http://www.w3.org/TR/xhtml1/DTD/xhtml1-transitional.dtd\">\n\
         <html xmlns=\"http://www.w3.org/1999/xhtml\" xml:lang=\"en\" lang=\"en\">\n\
         \x20<head>\n\
         \x20 <title>{status} - {reason}</title>\n\
         \x20</head>\n\
         \x20<body>\n\
         \x20 <h1>{status} - {reason}</h1>\n\
         \x20</body>\n\
         </html>\n"
    )
}

#[cfg(test)]
mod test {
    use super::*;

    fn ctx<'a>(version: Version, method: Method, keep_alive: bool, body_len: Option<u64>) -> SendHeaderCtx<'a> {
        SendHeaderCtx {
            version,
            method,
            keep_alive,
            body_len,
            server_tag: "kvik",
            date: "Thu, 01 Jan 1970 00:00:00 GMT",
        }
    }

    #[test]
    fn send_headers_emits_content_length_for_complete_body() {
        let mut resp = Response::new();
        resp.status = 200;
        let mut head = String::new();
        let plan = send_headers(&mut resp, ctx(Version::H1_1, Method::Get, true, Some(13)), &mut head);
        assert_eq!(OutFraming::Identity, plan.framing);
        assert!(plan.keep_alive);
        assert!(!plan.truncate_body);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Content-Length: 13\r\n"));
        assert!(head.contains("Date: "));
        assert!(head.contains("Server: kvik\r\n"));
        assert!(head.ends_with("\r\n\r\n"));
    }

    #[test]
    fn send_headers_chunks_streaming_body_on_http11() {
        let mut resp = Response::new();
        resp.status = 200;
        let mut head = String::new();
        let plan = send_headers(&mut resp, ctx(Version::H1_1, Method::Get, true, None), &mut head);
        assert_eq!(OutFraming::Chunked, plan.framing);
        assert!(head.contains("Transfer-Encoding: chunked\r\n"));
    }

    #[test]
    fn send_headers_closes_for_streaming_body_on_http10() {
        let mut resp = Response::new();
        resp.status = 200;
        let mut head = String::new();
        let plan = send_headers(&mut resp, ctx(Version::H1_0, Method::Get, true, None), &mut head);
        assert_eq!(OutFraming::UntilClose, plan.framing);
        assert!(!plan.keep_alive);
        assert!(head.starts_with("HTTP/1.0 200"));
        assert!(!head.contains("Transfer-Encoding"));
    }

    #[test]
    fn send_headers_truncates_no_body_statuses() {
        for status in [100u16, 204, 205, 304] {
            let mut resp = Response::new();
            resp.status = status;
            let mut head = String::new();
            let plan =
                send_headers(&mut resp, ctx(Version::H1_1, Method::Get, true, Some(5)), &mut head);
            assert!(plan.truncate_body, "status {status} must not carry a body");
            assert!(!head.contains("Content-Length"), "status {status}");
        }
    }

    #[test]
    fn send_headers_head_keeps_length_but_drops_body() {
        let mut resp = Response::new();
        resp.status = 200;
        let mut head = String::new();
        let plan =
            send_headers(&mut resp, ctx(Version::H1_1, Method::Head, true, Some(13)), &mut head);
        assert!(plan.truncate_body);
        assert!(head.contains("Content-Length: 13\r\n"));
    }

    #[test]
    fn send_headers_connection_close_on_http11() {
        let mut resp = Response::new();
        resp.status = 200;
        let mut head = String::new();
        send_headers(&mut resp, ctx(Version::H1_1, Method::Get, false, Some(0)), &mut head);
        assert!(head.contains("Connection: close\r\n"));
    }

    #[test]
    fn send_headers_does_not_duplicate_date_or_server() {
        let mut resp = Response::new();
        resp.status = 200;
        resp.headers.insert("Date", "Mon, 01 Jan 2024 00:00:00 GMT");
        resp.headers.insert("Server", "custom");
        let mut head = String::new();
        send_headers(&mut resp, ctx(Version::H1_1, Method::Get, true, Some(0)), &mut head);
        assert_eq!(1, head.matches("Date: ").count());
        assert_eq!(1, head.matches("Server: ").count());
        assert!(head.contains("Server: custom\r\n"));
    }

    #[test]
    fn error_page_names_the_status() {
        let page = error_page(404);
        assert!(page.contains("404 - Not Found"));
        assert!(page.contains("<html"));
    }
}
