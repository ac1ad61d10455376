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

//! Request data and header validation.

use crate::http_headers::HttpHeaders;
use crate::parser::request::RequestHead;
use crate::parser::{Method, Version};

/// The split request target plus derived host information.
#[derive(Debug, Default, Clone)]
pub struct RequestUri {
    /// Target exactly as received.
    pub raw: String,
    /// Path part, still percent-encoded.
    pub raw_path: String,
    /// The first raw path seen, before any rewrites.
    pub raw_orig_path: String,
    /// `http` or `https`.
    pub scheme: String,
    /// Authority from the Host header or an absolute-form target.
    pub authority: String,
    /// Decoded and dot-segment-simplified path.
    pub path: String,
    /// Query string without the `?`.
    pub query: String,
    /// Hostname: lowercased, without port, trailing dots stripped.
    pub host: String,
}

/// One parsed request.
#[derive(Debug)]
pub struct Request {
    /// Request method.
    pub method: Method,
    /// Method token as received.
    pub method_str: String,
    /// Protocol version.
    pub version: Version,
    /// Target and host data.
    pub uri: RequestUri,
    /// Request headers.
    pub headers: HttpHeaders,
    /// Parsed `Content-Length`; `-1` while unknown.
    pub content_length: i64,
}

/// How the request body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    /// No body.
    None,
    /// Exactly this many bytes follow the header block.
    Length(u64),
    /// Chunked transfer coding.
    Chunked,
}

/// Result of request validation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Validation {
    /// Whether the connection may be kept alive after this request.
    pub keep_alive: bool,
    /// Whether a `100 Continue` is owed before reading the body.
    pub expect_100: bool,
    /// Body framing.
    pub body: BodyKind,
}

impl Request {
    /// Builds a request from a parsed head; validation comes separately.
    pub fn from_head(head: RequestHead) -> Self {
        let mut uri = RequestUri::default();
        uri.raw = head.target;
        Request {
            method: head.method,
            method_str: head.method_str,
            version: head.version,
            uri,
            headers: head.headers,
            content_length: -1,
        }
    }

    fn parse_url(&mut self) -> Result<(), ()> {
        let raw = self.uri.raw.clone();

        let rest = if raw.starts_with('/') || raw == "*" {
            raw.as_str()
        } else {
            // absolute-form: scheme "://" authority path-abempty
            let (scheme, rest) = raw.split_once("://").ok_or(())?;
            if !scheme.eq_ignore_ascii_case("http") && !scheme.eq_ignore_ascii_case("https") {
                return Err(());
            }
            let end = rest.find('/').unwrap_or(rest.len());
            let (authority, path) = rest.split_at(end);
            if authority.is_empty() {
                return Err(());
            }
            self.uri.scheme = scheme.to_ascii_lowercase();
            self.uri.authority = authority.to_owned();
            if path.is_empty() {
                self.uri.raw_path = "/".to_owned();
                self.uri.path = "/".to_owned();
                self.uri.query.clear();
                if self.uri.raw_orig_path.is_empty() {
                    self.uri.raw_orig_path = "/".to_owned();
                }
                return Ok(());
            }
            // keep borrowing from `raw` via index arithmetic
            &raw[raw.len() - path.len()..]
        };

        let (path, query) = match rest.split_once('?') {
            Some((p, q)) => (p, q),
            None => (rest, ""),
        };

        // "*" is only allowed for OPTIONS
        if path == "*" && self.method != Method::Options {
            return Err(());
        }

        self.uri.raw_path = path.to_owned();
        self.uri.query = query.to_owned();
        let mut decoded = url_decode(path).ok_or(())?;
        if decoded.as_bytes().contains(&0) {
            return Err(());
        }
        if decoded != "*" {
            decoded = path_simplify(&decoded);
        }
        self.uri.path = decoded;

        if self.uri.raw_orig_path.is_empty() {
            self.uri.raw_orig_path = self.uri.raw_path.clone();
        }
        Ok(())
    }

    fn parse_hostname(&mut self) -> Result<(), ()> {
        let authority = self.uri.authority.to_ascii_lowercase();
        let host = if let Some(rest) = authority.strip_prefix('[') {
            // ipv6 literal with optional port
            let end = rest.find(']').ok_or(())?;
            &authority[..end + 2]
        } else {
            match authority.rsplit_once(':') {
                Some((h, port)) => {
                    if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
                        return Err(());
                    }
                    h
                }
                None => authority.as_str(),
            }
        };
        if host.is_empty() {
            return Err(());
        }
        let valid = host.bytes().all(|b| {
            b.is_ascii_alphanumeric()
                || b == b'-'
                || b == b'.'
                || b == b'['
                || b == b']'
                || b == b':'
        });
        if !valid {
            return Err(());
        }
        self.uri.host = host.to_owned();
        Ok(())
    }

    /// Validates the parsed header block. On failure the response status to
    /// send is returned; the connection must not be kept alive then.
    pub fn validate(&mut self, is_ssl: bool) -> Result<Validation, u16> {
        if self.uri.scheme.is_empty() {
            self.uri.scheme = if is_ssl { "https" } else { "http" }.to_owned();
        }

        let keep_alive = match self.version {
            Version::H1_0 => self.headers.header_is("connection", "keep-alive"),
            Version::H1_1 => !self.headers.header_is("connection", "close"),
        };

        if self.uri.raw.is_empty() {
            return Err(400);
        }

        // exactly one Host header may exist
        match self.headers.count("host") {
            0 => {}
            1 => {
                if self.uri.authority.is_empty() {
                    self.uri.authority = self
                        .headers
                        .get("host")
                        .expect("count was one")
                        .to_owned();
                }
            }
            _ => return Err(400),
        }

        // no Host and no absolute-form target: nothing to route by
        if self.uri.authority.is_empty() && !self.uri.raw.contains("://") {
            return Err(400);
        }

        if self.parse_url().is_err() {
            return Err(400);
        }

        if self.uri.host.is_empty() && !self.uri.authority.is_empty() {
            if self.parse_hostname().is_err() {
                return Err(400);
            }
        }

        // remove trailing dots from the hostname
        while self.uri.host.ends_with('.') {
            self.uri.host.pop();
        }

        if let Some(value) = self.headers.get("content-length") {
            let value = value.trim();
            if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
                // also catches negative values via the sign character
                return Err(400);
            }
            match value.parse::<i64>() {
                Ok(n) => self.content_length = n,
                // a valid decimal that does not fit is too large, not malformed
                Err(_) => return Err(413),
            }
        }

        let chunked = match self.headers.get("transfer-encoding") {
            Some(te) if te.trim().eq_ignore_ascii_case("chunked") => true,
            Some(_) => return Err(400),
            None => false,
        };
        // conflicting body delimiters are rejected outright
        if chunked && self.headers.get("content-length").is_some() {
            return Err(400);
        }

        let mut expect_100 = false;
        if self.headers.count("expect") > 0 {
            for value in self.headers.values("expect") {
                if value.trim().eq_ignore_ascii_case("100-continue") {
                    expect_100 = true;
                } else {
                    // we only support 100-continue
                    return Err(417);
                }
            }
            if expect_100 && self.version == Version::H1_0 {
                // only HTTP/1.1 clients may send this
                return Err(417);
            }
        }

        match self.method {
            Method::Get | Method::Head => {
                if self.content_length > 0 || chunked {
                    log::debug!("{} with a request body -> 400", self.method);
                    return Err(400);
                }
                self.content_length = 0;
            }
            Method::Post => {
                if self.content_length == -1 && !chunked {
                    log::debug!("POST without content-length -> 411");
                    return Err(411);
                }
            }
            _ => {
                if self.content_length == -1 && !chunked {
                    self.content_length = 0;
                }
            }
        }

        let body = if chunked {
            BodyKind::Chunked
        } else if self.content_length > 0 {
            BodyKind::Length(self.content_length as u64)
        } else {
            BodyKind::None
        };
        if body == BodyKind::None && expect_100 {
            expect_100 = false;
        }

        Ok(Validation {
            keep_alive,
            expect_100,
            body,
        })
    }
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Percent-decodes `s`; `None` on truncated or invalid escapes.
pub fn url_decode(s: &str) -> Option<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hi = hex_val(*bytes.get(i + 1)?)?;
                let lo = hex_val(*bytes.get(i + 2)?)?;
                out.push(hi << 4 | lo);
                i += 3;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    // paths are treated as opaque latin-1-ish bytes
    Some(out.iter().map(|&b| b as char).collect())
}

/// Percent-encodes everything outside the RFC 3986 unreserved set.
pub fn url_encode(s: &str) -> String {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        let b = c as u32;
        let unreserved = c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~');
        if unreserved {
            out.push(c);
        } else if b < 256 {
            out.push('%');
            out.push(HEX[(b >> 4) as usize & 0xf] as char);
            out.push(HEX[(b & 0xf) as usize] as char);
        } else {
            for byte in c.to_string().as_bytes() {
                out.push('%');
                out.push(HEX[(byte >> 4) as usize] as char);
                out.push(HEX[(byte & 0xf) as usize] as char);
            }
        }
    }
    out
}

/// Removes `.` and `..` segments; the result always starts with `/`.
pub fn path_simplify(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }
    let mut out = String::with_capacity(path.len());
    for segment in &segments {
        out.push('/');
        out.push_str(segment);
    }
    if out.is_empty() {
        out.push('/');
    }
    if path.ends_with('/') && out != "/" {
        out.push('/');
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::parser::request::RequestHead;

    fn request(raw: &[u8]) -> Request {
        Request::from_head(RequestHead::parse(raw).expect("head parses"))
    }

    #[test]
    fn validate_accepts_simple_get() {
        let mut req = request(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n");
        let v = req.validate(false).expect("valid");
        assert!(v.keep_alive);
        assert_eq!(BodyKind::None, v.body);
        assert_eq!("example.com", req.uri.host);
        assert_eq!("http", req.uri.scheme);
        assert_eq!(0, req.content_length);
    }

    #[test]
    fn validate_missing_host_on_http11_is_400() {
        let mut req = request(b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(Err(400), req.validate(false));
    }

    #[test]
    fn validate_missing_host_on_http10_is_400() {
        let mut req = request(b"GET / HTTP/1.0\r\n\r\n");
        assert_eq!(Err(400), req.validate(false));
    }

    #[test]
    fn validate_http10_with_host_is_ok() {
        let mut req = request(b"GET / HTTP/1.0\r\nHost: h\r\n\r\n");
        let v = req.validate(false).expect("valid");
        assert!(!v.keep_alive);
    }

    #[test]
    fn validate_duplicate_host_is_400() {
        let mut req = request(b"GET / HTTP/1.1\r\nHost: a\r\nHost: b\r\n\r\n");
        assert_eq!(Err(400), req.validate(false));
    }

    #[test]
    fn validate_strips_trailing_host_dots() {
        let mut req = request(b"GET / HTTP/1.1\r\nHost: Example.COM..\r\n\r\n");
        req.validate(false).unwrap();
        assert_eq!("example.com", req.uri.host);
    }

    #[test]
    fn validate_host_port_is_split_off() {
        let mut req = request(b"GET / HTTP/1.1\r\nHost: example.com:8080\r\n\r\n");
        req.validate(false).unwrap();
        assert_eq!("example.com", req.uri.host);
        assert_eq!("example.com:8080", req.uri.authority);
    }

    #[test]
    fn validate_content_length_must_be_decimal() {
        let mut req = request(b"PUT / HTTP/1.1\r\nHost: h\r\nContent-Length: 12x\r\n\r\n");
        assert_eq!(Err(400), req.validate(false));
        let mut req = request(b"PUT / HTTP/1.1\r\nHost: h\r\nContent-Length: -5\r\n\r\n");
        assert_eq!(Err(400), req.validate(false));
    }

    #[test]
    fn validate_content_length_overflow_is_413() {
        let mut req = request(
            b"PUT / HTTP/1.1\r\nHost: h\r\nContent-Length: 99999999999999999999999999\r\n\r\n",
        );
        assert_eq!(Err(413), req.validate(false));
    }

    #[test]
    fn validate_get_with_body_is_400() {
        let mut req = request(b"GET / HTTP/1.1\r\nHost: h\r\nContent-Length: 5\r\n\r\n");
        assert_eq!(Err(400), req.validate(false));
    }

    #[test]
    fn validate_post_without_length_is_411() {
        let mut req = request(b"POST / HTTP/1.1\r\nHost: h\r\n\r\n");
        assert_eq!(Err(411), req.validate(false));
    }

    #[test]
    fn validate_post_with_chunked_is_ok() {
        let mut req =
            request(b"POST / HTTP/1.1\r\nHost: h\r\nTransfer-Encoding: chunked\r\n\r\n");
        let v = req.validate(false).expect("valid");
        assert_eq!(BodyKind::Chunked, v.body);
    }

    #[test]
    fn validate_chunked_with_content_length_is_400() {
        let mut req = request(
            b"POST / HTTP/1.1\r\nHost: h\r\nTransfer-Encoding: chunked\r\nContent-Length: 5\r\n\r\n",
        );
        assert_eq!(Err(400), req.validate(false));
    }

    #[test]
    fn validate_expect_on_http10_is_417() {
        let mut req = request(
            b"POST / HTTP/1.0\r\nHost: h\r\nContent-Length: 1\r\nExpect: 100-continue\r\n\r\n",
        );
        assert_eq!(Err(417), req.validate(false));
    }

    #[test]
    fn validate_unknown_expect_is_417() {
        let mut req = request(
            b"POST / HTTP/1.1\r\nHost: h\r\nContent-Length: 1\r\nExpect: 200-maybe\r\n\r\n",
        );
        assert_eq!(Err(417), req.validate(false));
    }

    #[test]
    fn validate_expect_100_on_http11_is_honored() {
        let mut req = request(
            b"POST / HTTP/1.1\r\nHost: h\r\nContent-Length: 1\r\nExpect: 100-continue\r\n\r\n",
        );
        let v = req.validate(false).expect("valid");
        assert!(v.expect_100);
    }

    #[test]
    fn validate_star_target_requires_options() {
        let mut req = request(b"OPTIONS * HTTP/1.1\r\nHost: h\r\n\r\n");
        assert!(req.validate(false).is_ok());
        let mut req = request(b"GET * HTTP/1.1\r\nHost: h\r\n\r\n");
        assert_eq!(Err(400), req.validate(false));
    }

    #[test]
    fn validate_absolute_form_overrides_host() {
        let mut req =
            request(b"GET http://other.example/x/y HTTP/1.1\r\nHost: ignored.example\r\n\r\n");
        req.validate(false).unwrap();
        assert_eq!("other.example", req.uri.authority);
        assert_eq!("/x/y", req.uri.path);
    }

    #[test]
    fn validate_decodes_and_simplifies_path() {
        let mut req = request(b"GET /a/b/../c/%2e/d%20e?q=1 HTTP/1.1\r\nHost: h\r\n\r\n");
        req.validate(false).unwrap();
        assert_eq!("/a/c/d e", req.uri.path);
        assert_eq!("q=1", req.uri.query);
        assert_eq!("/a/b/../c/%2e/d%20e", req.uri.raw_path);
    }

    #[test]
    fn url_decode_encode_round_trips_unreserved() {
        let s = "AZaz09-._~";
        assert_eq!(s, url_encode(s));
        assert_eq!(Some(s.to_owned()), url_decode(&url_encode(s)));
    }

    #[test]
    fn url_decode_rejects_truncated_escape() {
        assert_eq!(None, url_decode("%2"));
        assert_eq!(None, url_decode("%zz"));
    }

    #[test]
    fn path_simplify_removes_dot_segments() {
        assert_eq!("/a/c", path_simplify("/a/b/../c"));
        assert_eq!("/", path_simplify("/../.."));
        assert_eq!("/a/", path_simplify("/a/b/.././"));
        assert_eq!("/a/b", path_simplify("//a///b"));
    }
}
