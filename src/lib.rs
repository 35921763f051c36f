// Copyright 2024 the vev authors
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

//! vev is a multi-threaded HTTP/1.1 origin server. It serves static files
//! from a configured document root and executes local programs as CGI-like
//! endpoints for POST requests.
//!
//! One supervising thread blocks in an edge-triggered readiness loop,
//! accepting connections and handing client events to a fixed worker pool.
//! Each connection is an incremental state machine re-entered on every
//! readiness notification; one-shot registrations guarantee that at most one
//! worker drives a connection at any instant, without a per-connection lock
//! being contended.

pub mod cgi;
pub mod config;
pub mod connection;
pub mod http;
pub mod listener;
pub mod poll;
pub mod pool;
pub mod timer;
