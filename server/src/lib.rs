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

#![deny(missing_docs, missing_debug_implementations, rust_2018_idioms, unused_imports)]
#![doc(test(attr(deny(warnings))))]

//! Single-host, high-concurrency HTTP/1.1 server built on a readiness-based event loop.
//!
//! ## Layout
//!
//! - [`buffer`] — growable scatter-gather byte buffer used for both socket directions.
//! - [`timer`] — hashed timing wheel driving idle-connection eviction.
//! - [`workerpool`] — fixed-size thread pool for request processing.
//! - [`dbpool`] — fixed-size MySQL connection pool.
//! - [`connection`] — per-client state machine (read, parse, dispatch, write).
//! - [`reactor`] — the event loop tying sockets, timers, and workers together.
//! - [`server`] — top-level bind/run/shutdown lifecycle.
//! - [`config`] — command-line configuration.
//! - [`error`] — fatal startup errors.
//! - [`logging`] — asynchronous tracing sink setup.
//! - [`static_files`] — resource directory resolution and memory-mapped serving.
//! - [`dispatch`] — dynamic `/login` and `/register` form handlers.

pub mod buffer;
pub mod config;
pub mod connection;
pub mod dbpool;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod reactor;
pub mod server;
pub mod static_files;
pub mod timer;
pub mod workerpool;
