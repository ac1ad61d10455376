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

//! HTTP/1.x request-header parsing.
//!
//! Parsing happens in two steps so a request split over many TCP segments
//! costs one scan per segment and one copy total: [`RequestParserCtx`]
//! incrementally looks for the end of the header block in the raw input
//! queue, then [`RequestHead::parse`] parses the extracted block. Both CRLF
//! and bare LF line terminators are accepted, as are obs-fold continuation
//! lines (inbound only).

use core::str::from_utf8_unchecked;

use crate::chunk::ChunkQueue;
use crate::http_headers::HttpHeaders;

use super::raw_request::RawRequest;
use super::tokens::{is_header_value_token, is_request_target_token, is_token};
use super::{Method, ParseError, ParseResult, Version};

/// Incremental search for the blank line ending a request header block.
#[derive(Debug)]
pub struct RequestParserCtx {
    scanned: u64,
    term: u8, // 0: mid-line, 1: after LF, 2: after LF CR
    max_size: u64,
}

impl RequestParserCtx {
    /// Creates a parser context rejecting header blocks above `max_size`.
    pub fn new(max_size: u64) -> Self {
        RequestParserCtx {
            scanned: 0,
            term: 0,
            max_size,
        }
    }

    /// Resets for the next request on the same connection.
    pub fn reset(&mut self) {
        self.scanned = 0;
        self.term = 0;
    }

    /// Scans bytes that arrived since the last call. Returns the length of
    /// the header block (terminator included) once the blank line is found.
    pub fn find_header_end(&mut self, raw_in: &ChunkQueue) -> ParseResult<Option<u64>> {
        let mut pos = self.scanned;
        for slice in raw_in.slices_from(self.scanned) {
            for &b in slice {
                pos += 1;
                match b {
                    b'\n' if self.term != 0 => {
                        self.scanned = 0;
                        self.term = 0;
                        return Ok(Some(pos));
                    }
                    b'\n' => self.term = 1,
                    b'\r' if self.term == 1 => self.term = 2,
                    _ => self.term = 0,
                }
                if pos > self.max_size {
                    return Err(ParseError::TooLarge);
                }
            }
        }
        self.scanned = pos;
        Ok(None)
    }
}

/// Parsed request line and header block.
#[derive(Debug)]
pub struct RequestHead {
    /// Request method.
    pub method: Method,
    /// Method token exactly as received.
    pub method_str: String,
    /// Raw request target, still percent-encoded.
    pub target: String,
    /// Protocol version.
    pub version: Version,
    /// Header block in received order.
    pub headers: HttpHeaders,
}

// header values may carry obs-text (0x80..); map it through latin-1 instead
// of rejecting the request
fn latin1(bytes: &[u8]) -> String {
    if bytes.is_ascii() {
        // SAFETY: all bytes are ASCII, which is valid UTF-8
        unsafe { from_utf8_unchecked(bytes) }.to_owned()
    } else {
        bytes.iter().map(|&b| b as char).collect()
    }
}

impl RequestHead {
    /// Parses a complete header block, terminator included.
    ///
    /// # Example
    /// ```
    /// # use kvik::parser::{Method, Version, ParseError};
    /// # use kvik::parser::request::RequestHead;
    /// # fn main() -> Result<(), ParseError> {
    /// let head = RequestHead::parse(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n")?;
    /// assert_eq!(Method::Get, head.method);
    /// assert_eq!("/", head.target);
    /// assert_eq!(Version::H1_1, head.version);
    /// assert_eq!(Some("example.com"), head.headers.get("host"));
    /// # Ok(())
    /// # }
    /// ```
    pub fn parse(buf: &[u8]) -> ParseResult<RequestHead> {
        let mut req = RawRequest::new(buf);

        // tolerate empty lines before the request line (RFC 9112 Section 2.2)
        while matches!(req.peek(), Some(b'\r') | Some(b'\n')) {
            req.next();
            req.slice();
        }

        let (method, method_str) = Self::parse_method(&mut req)?;
        let target = Self::parse_target(&mut req)?;
        let version = Self::parse_version(&mut req)?;
        Self::parse_newline(&mut req)?;
        let headers = Self::parse_headers(&mut req)?;

        Ok(RequestHead {
            method,
            method_str,
            target,
            version,
            headers,
        })
    }

    fn parse_method(buf: &mut RawRequest<'_>) -> ParseResult<(Method, String)> {
        for &b in &mut *buf {
            if b == b' ' {
                let slice = buf.slice_skip(1).map_err(|_| ParseError::Method)?;
                let method = Method::from_bytes(slice).ok_or(ParseError::Method)?;
                // SAFETY: from_bytes only matches ASCII spellings
                let s = unsafe { from_utf8_unchecked(slice) }.to_owned();
                return Ok((method, s));
            } else if !(b.is_ascii_uppercase() || b == b'-') {
                break;
            }
        }
        Err(ParseError::Method)
    }

    fn parse_target(buf: &mut RawRequest<'_>) -> ParseResult<String> {
        for &b in &mut *buf {
            if b == b' ' {
                let slice = buf.slice_skip(1).map_err(|_| ParseError::Target)?;
                if slice.is_empty() {
                    break;
                }
                // SAFETY: every byte passed is_request_target_token, which
                // only admits ASCII
                return Ok(unsafe { from_utf8_unchecked(slice) }.to_owned());
            } else if !is_request_target_token(b) {
                break;
            }
        }
        Err(ParseError::Target)
    }

    fn parse_version(buf: &mut RawRequest<'_>) -> ParseResult<Version> {
        if !buf.take(5).eq(b"HTTP/".iter()) {
            return Err(ParseError::Version);
        }
        let version = match (buf.next(), buf.next(), buf.next()) {
            (Some(b'1'), Some(b'.'), Some(b'0')) => Version::H1_0,
            (Some(b'1'), Some(b'.'), Some(b'1')) => Version::H1_1,
            _ => return Err(ParseError::Version),
        };
        buf.slice();
        Ok(version)
    }

    fn parse_newline(buf: &mut RawRequest<'_>) -> ParseResult<()> {
        match buf.next() {
            Some(b'\n') => {}
            Some(b'\r') => {
                if buf.next() != Some(&b'\n') {
                    return Err(ParseError::NewLine);
                }
            }
            _ => return Err(ParseError::NewLine),
        }
        buf.slice();
        Ok(())
    }

    fn parse_headers(buf: &mut RawRequest<'_>) -> ParseResult<HttpHeaders> {
        let mut headers = HttpHeaders::new();

        loop {
            match buf.peek() {
                // blank line ends the block
                Some(b'\r') | Some(b'\n') => {
                    Self::parse_newline(buf)?;
                    return Ok(headers);
                }
                // obs-fold: continuation of the previous header value
                Some(b' ') | Some(b'\t') => {
                    buf.take_until(|b| b != b' ' && b != b'\t');
                    let folded = Self::parse_value(buf)?;
                    if !headers.append_to_last(&folded) {
                        return Err(ParseError::HeaderName);
                    }
                }
                Some(_) => {
                    let name = Self::parse_name(buf)?;
                    let value = Self::parse_value(buf)?;
                    headers.insert(&name, &value);
                }
                None => return Err(ParseError::NewLine),
            }
        }
    }

    fn parse_name(buf: &mut RawRequest<'_>) -> ParseResult<String> {
        for &b in &mut *buf {
            if b == b':' {
                let slice = buf.slice_skip(1).map_err(|_| ParseError::HeaderName)?;
                if slice.is_empty() {
                    break;
                }
                // SAFETY: every byte passed is_token, which only admits ASCII
                return Ok(unsafe { from_utf8_unchecked(slice) }.to_owned());
            } else if !is_token(b) {
                break;
            }
        }
        Err(ParseError::HeaderName)
    }

    fn parse_value(buf: &mut RawRequest<'_>) -> ParseResult<String> {
        buf.take_until(|b| b != b' ' && b != b'\t');
        for &b in &mut *buf {
            if b == b'\n' {
                let slice = buf.slice_skip(1).map_err(|_| ParseError::HeaderValue)?;
                let slice = slice.strip_suffix(b"\r").unwrap_or(slice);
                return Ok(latin1(trim_ows(slice)));
            } else if b != b'\r' && !is_header_value_token(b) {
                break;
            }
        }
        Err(ParseError::HeaderValue)
    }
}

fn trim_ows(mut s: &[u8]) -> &[u8] {
    while let Some((&last, rest)) = s.split_last() {
        if last == b' ' || last == b'\t' {
            s = rest;
        } else {
            break;
        }
    }
    s
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn request_parses_simple_get() {
        let head = RequestHead::parse(b"GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .expect("request parses");
        assert_eq!(Method::Get, head.method);
        assert_eq!("GET", head.method_str);
        assert_eq!("/index.html", head.target);
        assert_eq!(Version::H1_1, head.version);
        assert_eq!(Some("example.com"), head.headers.get("Host"));
    }

    #[test]
    fn request_accepts_bare_lf_terminators() {
        let head =
            RequestHead::parse(b"POST /x HTTP/1.0\nHost: h\nContent-Length: 0\n\n").unwrap();
        assert_eq!(Method::Post, head.method);
        assert_eq!(Version::H1_0, head.version);
        assert_eq!(Some("0"), head.headers.get("content-length"));
    }

    #[test]
    fn request_accepts_obs_fold_continuations() {
        let head = RequestHead::parse(
            b"GET / HTTP/1.1\r\nHost: h\r\nX-Long: first\r\n second\r\n\r\n",
        )
        .unwrap();
        assert_eq!(Some("first second"), head.headers.get("x-long"));
    }

    #[test]
    fn request_rejects_unknown_method() {
        assert_eq!(
            Err(ParseError::Method),
            RequestHead::parse(b"BREW /pot HTTP/1.1\r\n\r\n").map(|_| ())
        );
    }

    #[test]
    fn request_rejects_http2_version() {
        assert_eq!(
            Err(ParseError::Version),
            RequestHead::parse(b"GET / HTTP/2\r\n\r\n").map(|_| ())
        );
    }

    #[test]
    fn request_keeps_duplicate_headers_separate() {
        let head = RequestHead::parse(b"GET / HTTP/1.1\r\nHost: a\r\nHost: b\r\n\r\n").unwrap();
        assert_eq!(2, head.headers.count("host"));
    }

    #[test]
    fn request_tolerates_leading_empty_lines() {
        let head = RequestHead::parse(b"\r\n\r\nGET / HTTP/1.1\r\nHost: h\r\n\r\n").unwrap();
        assert_eq!(Method::Get, head.method);
    }

    #[test]
    fn parser_ctx_finds_terminator_across_chunks() {
        let mut ctx = RequestParserCtx::new(8192);
        let mut q = ChunkQueue::new();
        q.append_mem(b"GET / HTTP/1.1\r\nHos").unwrap();
        assert_eq!(Ok(None), ctx.find_header_end(&q));
        q.append_mem(b"t: h\r\n\r").unwrap();
        assert_eq!(Ok(None), ctx.find_header_end(&q));
        q.append_mem(b"\nGET /next HTTP/1.1\r\n").unwrap();
        let end = ctx.find_header_end(&q).unwrap().expect("terminator found");
        assert_eq!(b"GET / HTTP/1.1\r\nHost: h\r\n\r\n".len() as u64, end);
    }

    #[test]
    fn parser_ctx_rejects_oversized_header_block() {
        let mut ctx = RequestParserCtx::new(16);
        let mut q = ChunkQueue::new();
        q.append_mem(b"GET /aaaaaaaaaaaaaaaaaaaaaaa HTTP/1.1\r\n\r\n")
            .unwrap();
        assert_eq!(Err(ParseError::TooLarge), ctx.find_header_end(&q));
    }

    #[test]
    fn parser_ctx_detects_bare_lf_terminator() {
        let mut ctx = RequestParserCtx::new(8192);
        let mut q = ChunkQueue::new();
        q.append_mem(b"GET / HTTP/1.1\nHost: h\n\nrest").unwrap();
        let end = ctx.find_header_end(&q).unwrap().expect("terminator found");
        assert_eq!(b"GET / HTTP/1.1\nHost: h\n\n".len() as u64, end);
    }
}
