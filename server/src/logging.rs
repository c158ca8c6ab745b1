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

//! Asynchronous log sink.
//!
//! Replaces the original's variadic `LOG_DEBUG`/`LOG_INFO`/`LOG_WARN`/`LOG_ERROR` macros with
//! `tracing`'s typed, leveled macros. Log records are handed off to a background writer thread via
//! `tracing-appender`'s non-blocking writer, so callers on the reactor or a worker never block on
//! a synchronous flush (spec.md §5: "Log sink: its own asynchronous queue; callers must not depend
//! on synchronous flush.").

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Initializes the global tracing subscriber. The returned [`WorkerGuard`] must be held for the
/// lifetime of the process; dropping it flushes and stops the background writer thread.
pub fn init() -> WorkerGuard {
    let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(writer)
        .with_target(false)
        .init();

    guard
}
