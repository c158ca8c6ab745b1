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

//! Simple form-style dynamic request dispatch against the database pool.
//!
//! Mirrors the original's `/login` and `/register` POST handlers: form-encoded `username` and
//! `password` fields checked against (or inserted into) a `user` table. Every request is
//! transactional in the sense that it acquires one pooled connection, performs one statement, and
//! releases the connection when the request finishes — there is no persisted state beyond the
//! database itself (spec.md §6).

use mysql::prelude::Queryable;
use parser::{request::Request, response::Body, status::Status};
use std::sync::Arc;
use tracing::warn;

use crate::dbpool::DbPool;

/// Result of a dynamic dispatch: a status and a small plain-text body describing the outcome.
#[derive(Debug)]
pub struct DispatchResult {
    /// Status to serve.
    pub status: Status,
    /// Response body.
    pub body: Body,
}

impl DispatchResult {
    fn text(status: Status, text: impl Into<String>) -> Self {
        Self {
            status,
            body: Body::Owned(text.into().into_bytes()),
        }
    }
}

/// Dispatches a dynamic request against the database pool, if its path matches a known form
/// endpoint. Returns `None` for any path this dispatcher doesn't own, letting the caller fall
/// back to static file resolution.
pub fn dispatch(pool: &Arc<DbPool>, request: &Request) -> Option<DispatchResult> {
    match request.path() {
        "/login" => Some(login(pool, request)),
        "/register" => Some(register(pool, request)),
        _ => None,
    }
}

fn login(pool: &Arc<DbPool>, request: &Request) -> DispatchResult {
    let fields = request.form_fields();
    let (Some(username), Some(password)) = (fields.get("username"), fields.get("password"))
    else {
        return DispatchResult::text(Status::BadRequest, "missing username or password\n");
    };

    let mut conn = match pool.acquire() {
        Ok(conn) => conn,
        Err(e) => {
            warn!(error = %e, "db pool exhausted during login");
            return DispatchResult::text(Status::InternalServerError, "server busy\n");
        }
    };

    let found: Option<String> = conn
        .exec_first(
            "SELECT password FROM user WHERE username = ?",
            (username,),
        )
        .unwrap_or(None);

    match found {
        Some(stored) if &stored == password => {
            DispatchResult::text(Status::Ok, "login ok\n")
        }
        _ => DispatchResult::text(Status::Forbidden, "invalid credentials\n"),
    }
}

fn register(pool: &Arc<DbPool>, request: &Request) -> DispatchResult {
    let fields = request.form_fields();
    let (Some(username), Some(password)) = (fields.get("username"), fields.get("password"))
    else {
        return DispatchResult::text(Status::BadRequest, "missing username or password\n");
    };

    let mut conn = match pool.acquire() {
        Ok(conn) => conn,
        Err(e) => {
            warn!(error = %e, "db pool exhausted during register");
            return DispatchResult::text(Status::InternalServerError, "server busy\n");
        }
    };

    let existing: Option<u64> = conn
        .exec_first(
            "SELECT 1 FROM user WHERE username = ?",
            (username,),
        )
        .unwrap_or(None);

    if existing.is_some() {
        return DispatchResult::text(Status::Forbidden, "user already exists\n");
    }

    match conn.exec_drop(
        "INSERT INTO user (username, password) VALUES (?, ?)",
        (username, password),
    ) {
        Ok(()) => DispatchResult::text(Status::Ok, "registered\n"),
        Err(e) => {
            warn!(error = %e, "register insert failed");
            DispatchResult::text(Status::InternalServerError, "registration failed\n")
        }
    }
}
