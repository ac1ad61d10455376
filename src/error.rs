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

//! Error kinds surfaced across the core.

use std::fmt::Display;
use std::io;

use crate::parser::ParseError;

/// Failure produced by a balancer or backend pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendError {
    /// All backends are busy or the pool wait timed out.
    Overload,
    /// The backend is unreachable or the pool is disabled.
    Dead,
}

impl Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match *self {
            BackendError::Overload => "backend overloaded",
            BackendError::Dead => "backend dead",
        })
    }
}

/// Represents possible failures in the request-execution pipeline.
#[derive(Debug)]
pub enum Error {
    /// Malformed wire data (request line, headers, chunk framing).
    Parse(ParseError),
    /// Header semantics that must be answered with the contained 4xx status.
    Validation(u16),
    /// Syscall failure; the underlying errno category is preserved.
    Io(io::Error),
    /// Produced by balancers and the backend pool.
    Backend(BackendError),
    /// Memory or descriptor limits hit.
    ResourceExhausted(&'static str),
    /// Internal state violation; always fatal to the current connection.
    Protocol(&'static str),
    /// Append on a chunk queue whose `is_closed` flag is set.
    Closed,
}

impl Error {
    fn description_str(&self) -> &'static str {
        match *self {
            Error::Parse(_) => "parse error",
            Error::Validation(_) => "request validation failed",
            Error::Io(_) => "io error",
            Error::Backend(_) => "backend error",
            Error::ResourceExhausted(_) => "resource exhausted",
            Error::Protocol(_) => "protocol violation",
            Error::Closed => "chunk queue closed",
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Error::Parse(ref e) => write!(f, "parse error: {}", e),
            Error::Validation(status) => write!(f, "request validation failed: {}", status),
            Error::Io(ref e) => write!(f, "io error: {}", e),
            Error::Backend(ref e) => write!(f, "backend error: {}", e),
            Error::ResourceExhausted(what) => write!(f, "resource exhausted: {}", what),
            Error::Protocol(what) => write!(f, "protocol violation: {}", what),
            Error::Closed => f.write_str(self.description_str()),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            Error::Io(ref e) => Some(e),
            Error::Parse(ref e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<ParseError> for Error {
    fn from(e: ParseError) -> Self {
        Error::Parse(e)
    }
}

/// Result whose Err variant is [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
