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

//! Server configuration, parsed from the command line.

use std::path::PathBuf;

use clap::Parser as ClapParser;

/// Edge- vs level-triggered behavior for the listening socket and client connections.
/// `trigger_mode` values outside `0..=3` are treated as `3` (both edge-triggered), per spec.md
/// §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    /// Level-triggered listener, level-triggered connections.
    LevelLevel,
    /// Level-triggered listener, edge-triggered connections.
    LevelEdge,
    /// Edge-triggered listener, level-triggered connections.
    EdgeLevel,
    /// Edge-triggered listener, edge-triggered connections.
    EdgeEdge,
}

impl TriggerMode {
    /// Whether the listening socket itself should be registered edge-triggered.
    pub fn listener_is_edge_triggered(self) -> bool {
        matches!(self, TriggerMode::EdgeLevel | TriggerMode::EdgeEdge)
    }

    /// Whether client connections should be registered edge-triggered.
    pub fn connection_is_edge_triggered(self) -> bool {
        matches!(self, TriggerMode::LevelEdge | TriggerMode::EdgeEdge)
    }
}

impl From<u8> for TriggerMode {
    fn from(value: u8) -> Self {
        match value {
            0 => TriggerMode::LevelLevel,
            1 => TriggerMode::LevelEdge,
            2 => TriggerMode::EdgeLevel,
            _ => TriggerMode::EdgeEdge,
        }
    }
}

/// Command-line configuration for the server.
#[derive(Debug, Clone, ClapParser)]
#[command(name = "webserver", about = "Single-host HTTP/1.1 reactor server")]
pub struct Config {
    /// TCP port to listen on (1024-65535).
    #[arg(long, default_value_t = 9006)]
    pub port: u16,

    /// Trigger mode: 0 = LT listen + LT conn, 1 = LT listen + ET conn, 2 = ET listen + LT conn,
    /// 3 (or any other value) = ET listen + ET conn.
    #[arg(long, default_value_t = 3)]
    pub trigger_mode: u8,

    /// Idle connection timeout in milliseconds. 0 disables the idle timer.
    #[arg(long, default_value_t = 60_000)]
    pub timeout_ms: u64,

    /// Set SO_LINGER with a 1 second timeout on accepted sockets.
    #[arg(long, default_value_t = false)]
    pub open_linger: bool,

    /// MySQL host.
    #[arg(long, default_value = "localhost")]
    pub sql_host: String,

    /// MySQL port.
    #[arg(long, default_value_t = 3306)]
    pub sql_port: u16,

    /// MySQL user.
    #[arg(long, default_value = "root")]
    pub sql_user: String,

    /// MySQL password.
    #[arg(long, default_value = "")]
    pub sql_pwd: String,

    /// MySQL database name.
    #[arg(long, default_value = "webserver")]
    pub db_name: String,

    /// Number of connections to open in the database pool.
    #[arg(long, default_value_t = 8)]
    pub sql_pool_num: usize,

    /// Number of worker threads servicing parsing/response work.
    #[arg(long, default_value_t = 4)]
    pub thread_num: usize,

    /// Maximum number of readiness events the multiplexer returns per `wait()` call.
    #[arg(long, default_value_t = 1024)]
    pub max_events: usize,

    /// Maximum number of live connections accepted at once.
    #[arg(long, default_value_t = 65536)]
    pub max_fd: usize,

    /// Directory static files are served from.
    #[arg(long, default_value = "resources")]
    pub static_dir: PathBuf,

    /// Capacity of each worker's bounded task queue.
    #[arg(long, default_value_t = 1024)]
    pub queue_capacity: usize,

    /// Tick length for the idle timer wheel, in milliseconds.
    #[arg(long, default_value_t = 500)]
    pub timer_tick_ms: u64,

    /// Number of slots in the idle timer wheel.
    #[arg(long, default_value_t = 512)]
    pub timer_slots: usize,
}

impl Config {
    /// Validates the port range, per spec.md §6.
    pub fn validate(&self) -> Result<(), crate::error::ServerError> {
        if !(1024..=65535).contains(&self.port) {
            return Err(crate::error::ServerError::InvalidPort(self.port));
        }
        Ok(())
    }

    /// Resolved trigger mode.
    pub fn trigger_mode(&self) -> TriggerMode {
        TriggerMode::from(self.trigger_mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_range_trigger_mode_becomes_edge_edge() {
        assert_eq!(TriggerMode::from(7), TriggerMode::EdgeEdge);
    }

    #[test]
    fn known_trigger_modes_map_correctly() {
        assert_eq!(TriggerMode::from(0), TriggerMode::LevelLevel);
        assert_eq!(TriggerMode::from(1), TriggerMode::LevelEdge);
        assert_eq!(TriggerMode::from(2), TriggerMode::EdgeLevel);
        assert_eq!(TriggerMode::from(3), TriggerMode::EdgeEdge);
    }
}
