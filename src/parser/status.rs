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

//! Http Status Codes
//! [RFC 9110 Section 15](https://www.rfc-editor.org/rfc/rfc9110#section-15)

use std::fmt::Display;

/// Http Status Codes
/// [RFC 9110 Section 15](https://www.rfc-editor.org/rfc/rfc9110#section-15)
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// 15.2.1
    Continue = 100,
    /// 15.2.2
    SwitchingProtocols = 101,
    /// 15.3.1
    r#Ok = 200,
    /// 15.3.2
    Created = 201,
    /// 15.3.3
    Accepted = 202,
    /// 15.3.5
    NoContent = 204,
    /// 15.3.6
    ResetContent = 205,
    /// 15.3.7
    PartialContent = 206,
    /// 15.4.2
    MovedPermanently = 301,
    /// 15.4.3
    Found = 302,
    /// 15.4.4
    SeeOther = 303,
    /// 15.4.5
    NotModified = 304,
    /// 15.4.8
    TemporaryRedirect = 307,
    /// 15.4.9
    PermanentRedirect = 308,
    /// 15.5.1
    BadRequest = 400,
    /// 15.5.2
    Unauthorized = 401,
    /// 15.5.4
    Forbidden = 403,
    /// 15.5.5
    NotFound = 404,
    /// 15.5.6
    MethodNotAllowed = 405,
    /// 15.5.7
    NotAcceptable = 406,
    /// 15.5.9
    RequestTimeout = 408,
    /// 15.5.10
    Conflict = 409,
    /// 15.5.11
    Gone = 410,
    /// 15.5.12
    LengthRequired = 411,
    /// 15.5.13
    PreconditionFailed = 412,
    /// 15.5.14
    ContentTooLarge = 413,
    /// 15.5.15
    UriTooLong = 414,
    /// 15.5.16
    UnsupportedMediaType = 415,
    /// 15.5.17
    RangeNotSatisfiable = 416,
    /// 15.5.18
    ExpectationFailed = 417,
    /// 15.6.1
    InternalServerError = 500,
    /// 15.6.2
    NotImplemented = 501,
    /// 15.6.3
    BadGateway = 502,
    /// 15.6.4
    ServiceUnavailable = 503,
    /// 15.6.5
    GatewayTimeout = 504,
    /// 15.6.6
    HTTPVersionNotSupported = 505,
}

impl Status {
    /// The numeric code.
    pub fn code(&self) -> u16 {
        *self as u16
    }

    /// Canonical reason phrase for a numeric code; covers every code the
    /// core emits and falls back per status class.
    pub fn reason(code: u16) -> &'static str {
        match code {
            100 => "Continue",
            101 => "Switching Protocols",
            200 => "OK",
            201 => "Created",
            202 => "Accepted",
            204 => "No Content",
            205 => "Reset Content",
            206 => "Partial Content",
            301 => "Moved Permanently",
            302 => "Found",
            303 => "See Other",
            304 => "Not Modified",
            307 => "Temporary Redirect",
            308 => "Permanent Redirect",
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            406 => "Not Acceptable",
            408 => "Request Timeout",
            409 => "Conflict",
            410 => "Gone",
            411 => "Length Required",
            412 => "Precondition Failed",
            413 => "Content Too Large",
            414 => "URI Too Long",
            415 => "Unsupported Media Type",
            416 => "Range Not Satisfiable",
            417 => "Expectation Failed",
            500 => "Internal Server Error",
            501 => "Not Implemented",
            502 => "Bad Gateway",
            503 => "Service Unavailable",
            504 => "Gateway Timeout",
            505 => "HTTP Version Not Supported",
            100..=199 => "Informational",
            200..=299 => "Success",
            300..=399 => "Redirect",
            400..=499 => "Client Error",
            _ => "Server Error",
        }
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{}", *self as u16))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn status_reason_covers_core_codes() {
        assert_eq!("OK", Status::reason(200));
        assert_eq!("Not Modified", Status::reason(304));
        assert_eq!("Length Required", Status::reason(411));
        assert_eq!("HTTP Version Not Supported", Status::reason(505));
    }

    #[test]
    fn status_reason_falls_back_per_class() {
        assert_eq!("Client Error", Status::reason(418));
        assert_eq!("Server Error", Status::reason(599));
    }
}
