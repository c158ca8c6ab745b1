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

//! Fatal startup failures.
//!
//! Per spec.md §7, only configuration/bind-time failures are fatal. Everything else (transient
//! I/O, a peer hanging up, resource exhaustion) is handled locally by the reactor and connection
//! layers and never surfaces here.

use crate::dbpool::DbPoolError;

/// Errors that prevent the server from starting at all.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The configured port is outside the 1024-65535 range.
    #[error("port {0} is out of the allowed 1024-65535 range")]
    InvalidPort(u16),
    /// Could not bind the listening socket.
    #[error("failed to bind listening socket: {0}")]
    Bind(#[source] std::io::Error),
    /// Could not create the readiness multiplexer.
    #[error("failed to create multiplexer: {0}")]
    PollCreate(#[source] std::io::Error),
    /// Could not initialize the database pool.
    #[error("failed to initialize database pool: {0}")]
    DbPoolInit(#[from] DbPoolError),
    /// Could not install the signal handler used for graceful shutdown.
    #[error("failed to install signal handler: {0}")]
    SignalHandler(#[source] std::io::Error),
}

impl ServerError {
    /// Process exit code this error should produce. `0` is reserved for clean shutdown and is
    /// never returned from here.
    pub fn exit_code(&self) -> i32 {
        match self {
            ServerError::InvalidPort(_) => 2,
            ServerError::Bind(_) => 3,
            ServerError::PollCreate(_) => 4,
            ServerError::DbPoolInit(_) => 5,
            ServerError::SignalHandler(_) => 6,
        }
    }
}
