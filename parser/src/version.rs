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

//! Representation of the requested HTTP version

use std::fmt::Display;

use crate::ParseError;

/// Representation of the requested HTTP version. Only HTTP/1.0 and HTTP/1.1 are recognized; H2
/// and H3 are out of scope for this server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    /// HTTP/1.0
    Http10,
    /// HTTP/1.1
    Http11,
}

impl Version {
    /// Parses a version token, e.g. `HTTP/1.1`.
    pub fn parse(token: &[u8]) -> Result<Self, ParseError> {
        match token {
            b"HTTP/1.0" => Ok(Self::Http10),
            b"HTTP/1.1" => Ok(Self::Http11),
            _ => Err(ParseError::Version),
        }
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_versions() {
        assert_eq!(Version::parse(b"HTTP/1.1").unwrap(), Version::Http11);
        assert_eq!(Version::parse(b"HTTP/1.0").unwrap(), Version::Http10);
    }

    #[test]
    fn rejects_unknown_version() {
        assert!(matches!(Version::parse(b"HTTP/2.0"), Err(ParseError::Version)));
    }
}
