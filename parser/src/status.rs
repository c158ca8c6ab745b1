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

/// Http Status Codes used by this server. Only the subset spec.md's error taxonomy and static
/// file handling actually produce.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// 15.3.1
    Ok = 200,
    /// 15.3.5
    NoContent = 204,
    /// 15.5.1
    BadRequest = 400,
    /// 15.5.4
    Forbidden = 403,
    /// 15.5.5
    NotFound = 404,
    /// 15.5.9
    RequestTimeout = 408,
    /// server shedding load (spec.md §7, "server busy")
    ServiceUnavailable = 503,
    /// 15.6.1
    InternalServerError = 500,
}

impl Status {
    /// Numeric status code.
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Canonical reason phrase for the status line.
    pub fn reason_phrase(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::NoContent => "No Content",
            Self::BadRequest => "Bad Request",
            Self::Forbidden => "Forbidden",
            Self::NotFound => "Not Found",
            Self::RequestTimeout => "Request Timeout",
            Self::ServiceUnavailable => "Service Unavailable",
            Self::InternalServerError => "Internal Server Error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_has_expected_code_and_phrase() {
        assert_eq!(Status::Ok.code(), 200);
        assert_eq!(Status::Ok.reason_phrase(), "OK");
    }
}
