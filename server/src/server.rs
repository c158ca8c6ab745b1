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

//! Top-level server lifecycle: bind, wire up collaborators, run, tear down.
//!
//! Socket setup follows spec.md §6: IPv4, `SOCK_STREAM`, bound to `INADDR_ANY:port`,
//! `SO_REUSEADDR` set, an optional `SO_LINGER`, a backlog of 6, made non-blocking only after
//! `listen()` succeeds.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use mio::net::TcpListener as MioTcpListener;
use socket2::{Domain, Socket, Type};
use tracing::info;

use crate::{
    config::Config,
    connection::RequestContext,
    dbpool::DbPool,
    error::ServerError,
    reactor::Reactor,
    static_files::StaticFiles,
    timer::TimerWheel,
    workerpool::WorkerPool,
};

/// Owns every long-lived collaborator and runs the reactor to completion.
pub struct Server {
    reactor: Reactor,
    timer: Arc<TimerWheel>,
    db_pool: Arc<DbPool>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server").finish_non_exhaustive()
    }
}

impl Server {
    /// Builds and binds the server per `config`. Fails only on the configuration/bind-time errors
    /// enumerated in [`ServerError`]; everything past this point is handled without aborting the
    /// process.
    pub fn bind(config: &Config) -> Result<Self, ServerError> {
        config.validate()?;

        let listener = bind_listener(config.port, config.open_linger)?;

        let db_pool = Arc::new(DbPool::new(
            &config.sql_host,
            config.sql_port,
            &config.sql_user,
            &config.sql_pwd,
            &config.db_name,
            config.sql_pool_num,
        )?);

        let timer = Arc::new(TimerWheel::new(config.timer_tick_ms, config.timer_slots));
        timer.run();

        let workers = WorkerPool::new(config.thread_num, config.queue_capacity);

        let ctx = RequestContext {
            static_files: Arc::new(StaticFiles::new(&config.static_dir)),
            db_pool: Arc::clone(&db_pool),
        };

        let reactor = Reactor::new(
            listener,
            ctx,
            Arc::clone(&timer),
            workers,
            config.trigger_mode(),
            config.timeout_ms,
            config.max_fd,
            config.max_events,
        )?;

        info!(port = config.port, "server bound, entering event loop");

        Ok(Self {
            reactor,
            timer,
            db_pool,
        })
    }

    /// Runs the event loop until a shutdown signal arrives, then tears down collaborators in
    /// dependency order: stop accepting and processing, stop the timer, close the database pool.
    pub fn run(mut self) {
        self.reactor.run();

        self.timer.close();
        self.db_pool.close();
        info!("server shut down cleanly");
    }
}

fn bind_listener(port: u16, open_linger: bool) -> Result<MioTcpListener, ServerError> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let socket = Socket::new(Domain::IPV4, Type::STREAM, None).map_err(ServerError::Bind)?;
    socket.set_reuse_address(true).map_err(ServerError::Bind)?;

    if open_linger {
        socket
            .set_linger(Some(Duration::from_secs(1)))
            .map_err(ServerError::Bind)?;
    }

    socket.bind(&addr.into()).map_err(ServerError::Bind)?;
    socket.listen(6).map_err(ServerError::Bind)?;
    socket.set_nonblocking(true).map_err(ServerError::Bind)?;

    Ok(MioTcpListener::from_std(socket.into()))
}
