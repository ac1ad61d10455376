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

//! Parser implementations for the HTTP/1.x wire format.

use std::fmt::Display;

pub mod date;
pub mod raw_request;
pub mod request;
pub mod status;
mod tokens;

/// Represents possible failures while parsing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// Invalid byte in method, or unknown method.
    Method,
    /// Invalid byte in target.
    Target,
    /// Invalid HTTP version.
    Version,
    /// Invalid byte in header name.
    HeaderName,
    /// Invalid byte in header value.
    HeaderValue,
    /// Invalid or missing new line.
    NewLine,
    /// Header block exceeds the configured size limit.
    TooLarge,
    /// Invalid chunked transfer framing.
    ChunkFraming,
}

impl ParseError {
    fn description_str(&self) -> &'static str {
        match *self {
            ParseError::Method => "Invalid token in method",
            ParseError::Target => "Invalid token in target",
            ParseError::Version => "Invalid version",
            ParseError::HeaderName => "Invalid token in header name",
            ParseError::HeaderValue => "Invalid token in header value",
            ParseError::NewLine => "Invalid or missing new line",
            ParseError::TooLarge => "Header block too large",
            ParseError::ChunkFraming => "Invalid chunked transfer framing",
        }
    }
}

impl Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.description_str())
    }
}

impl std::error::Error for ParseError {}

/// Result whose Err variant is `ParseError`
pub type ParseResult<T> = std::result::Result<T, ParseError>;

/// Representation of the requested HTTP Method
/// [IETF RFC 9110 Section 9](https://www.rfc-editor.org/rfc/rfc9110#section-9),
/// extended with the WebDAV and versioning methods of RFC 4918 and RFC 3253.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Method {
    Get,
    Post,
    Head,
    Options,
    Propfind,
    Mkcol,
    Put,
    Delete,
    Copy,
    Move,
    Proppatch,
    Report,
    Checkout,
    Checkin,
    VersionControl,
    Uncheckout,
    Mkactivity,
    Merge,
    Lock,
    Unlock,
    Label,
    Connect,
}

impl Method {
    /// Parses a method token, matching the exact uppercase spelling.
    pub fn from_bytes(b: &[u8]) -> Option<Method> {
        Some(match b {
            b"GET" => Method::Get,
            b"POST" => Method::Post,
            b"HEAD" => Method::Head,
            b"OPTIONS" => Method::Options,
            b"PROPFIND" => Method::Propfind,
            b"MKCOL" => Method::Mkcol,
            b"PUT" => Method::Put,
            b"DELETE" => Method::Delete,
            b"COPY" => Method::Copy,
            b"MOVE" => Method::Move,
            b"PROPPATCH" => Method::Proppatch,
            b"REPORT" => Method::Report,
            b"CHECKOUT" => Method::Checkout,
            b"CHECKIN" => Method::Checkin,
            b"VERSION-CONTROL" => Method::VersionControl,
            b"UNCHECKOUT" => Method::Uncheckout,
            b"MKACTIVITY" => Method::Mkactivity,
            b"MERGE" => Method::Merge,
            b"LOCK" => Method::Lock,
            b"UNLOCK" => Method::Unlock,
            b"LABEL" => Method::Label,
            b"CONNECT" => Method::Connect,
            _ => return None,
        })
    }

    /// The canonical wire spelling.
    pub fn as_str(&self) -> &'static str {
        match *self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
            Method::Propfind => "PROPFIND",
            Method::Mkcol => "MKCOL",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Copy => "COPY",
            Method::Move => "MOVE",
            Method::Proppatch => "PROPPATCH",
            Method::Report => "REPORT",
            Method::Checkout => "CHECKOUT",
            Method::Checkin => "CHECKIN",
            Method::VersionControl => "VERSION-CONTROL",
            Method::Uncheckout => "UNCHECKOUT",
            Method::Mkactivity => "MKACTIVITY",
            Method::Merge => "MERGE",
            Method::Lock => "LOCK",
            Method::Unlock => "UNLOCK",
            Method::Label => "LABEL",
            Method::Connect => "CONNECT",
        }
    }
}

impl Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Representation of the requested HTTP version. Only 1.0 and 1.1 requests
/// are accepted; anything else is answered with 505.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    /// HTTP/1.0
    H1_0,
    /// HTTP/1.1
    H1_1,
}

impl Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::H1_0 => "HTTP/1.0",
            Self::H1_1 => "HTTP/1.1",
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn method_round_trips_through_wire_spelling() {
        for m in [
            Method::Get,
            Method::Propfind,
            Method::VersionControl,
            Method::Mkactivity,
            Method::Connect,
        ] {
            assert_eq!(Some(m), Method::from_bytes(m.as_str().as_bytes()));
        }
    }

    #[test]
    fn method_rejects_lowercase() {
        assert_eq!(None, Method::from_bytes(b"get"));
        assert_eq!(None, Method::from_bytes(b"Get"));
    }
}
