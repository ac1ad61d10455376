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

#![deny(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unused_imports
)]
// Disallow warnings in examples.
#![doc(test(attr(deny(warnings))))]

//! kvik is a modular, high-throughput HTTP/1.x origin server and
//! reverse-proxy core.
//!
//! The crate is the request-execution pipeline: per-worker event loops
//! accept connections, parse requests, evaluate a configuration-driven
//! action program against each request, and stream bodies through chains
//! of filters and backends while enforcing concurrency, throttling and
//! timeout invariants. Wire parsing lives in [`parser`], the pipeline
//! plumbing in [`chunk`], [`stream`] and [`filter`], scheduling in
//! [`jobqueue`] and [`waitqueue`], and the shared subsystems in
//! [`backend`], [`fetch`], [`stat_cache`] and [`throttle`].
//!
//! A caller supplies a [`server::ServerConfig`], an option registry and a
//! compiled [`action::Action`] tree; [`server::Server`] does the rest.

pub mod action;
pub mod backend;
pub mod chunk;
pub mod collect;
pub mod condition;
pub mod connection;
pub mod environment;
pub mod error;
pub mod etag;
pub mod fetch;
pub mod filter;
pub mod filter_buffer_on_disk;
pub mod filter_chunked;
pub mod handlers;
pub mod http_headers;
pub mod iostream;
pub mod jobqueue;
pub mod options;
pub mod parser;
pub mod request;
pub mod response;
pub mod server;
pub mod stat_cache;
pub mod stream;
pub mod throttle;
pub mod vrequest;
pub mod waitqueue;
pub mod worker;

pub use error::{BackendError, Error, Result};
