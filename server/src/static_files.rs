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

//! Static filesystem layout collaborator (spec.md §1).
//!
//! Resolves a request target against the configured resource directory and serves the file's
//! contents through a memory map, so large files never need a full in-process copy.

use std::{fs::File, path::{Component, Path, PathBuf}, sync::Arc};

use memmap2::Mmap;
use parser::{response::Body, status::Status};

/// Resolves request targets against `root` and maps files into memory on demand.
#[derive(Debug, Clone)]
pub struct StaticFiles {
    root: PathBuf,
}

/// Outcome of resolving a static file request.
#[derive(Debug)]
pub enum Resolved {
    /// The file was found and mapped; serve it with this content type.
    Found {
        /// The mapped file contents.
        body: Body,
        /// The MIME type to serve the body as.
        content_type: &'static str,
    },
    /// The target escaped the resource directory or otherwise isn't servable.
    Forbidden,
    /// No file exists at the resolved path.
    NotFound,
}

impl StaticFiles {
    /// Creates a resolver rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolves `target` (a request path, e.g. `/index.html`) to a file under the resource root.
    /// `..` components are rejected outright rather than normalized away, since a normalized path
    /// could still land outside `root` on some platforms.
    pub fn resolve(&self, target: &str) -> Resolved {
        let target = target.trim_start_matches('/');
        let target = if target.is_empty() { "index.html" } else { target };
        let relative = Path::new(target);

        if relative
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir))
        {
            return Resolved::Forbidden;
        }

        let path = self.root.join(relative);
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(_) => return Resolved::NotFound,
        };

        // Safety: the file is opened read-only for the lifetime of the mapping; the server does
        // not write to files it serves, so the usual external-mutation caveat of `Mmap::map`
        // applies but is not a correctness risk here.
        let mmap = match unsafe { Mmap::map(&file) } {
            Ok(m) => m,
            Err(_) => return Resolved::NotFound,
        };

        Resolved::Found {
            body: Body::Mapped(Arc::new(mmap)),
            content_type: content_type_for(&path),
        }
    }
}

fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("js") => "application/javascript; charset=utf-8",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("ico") => "image/x-icon",
        Some("txt") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

/// Maps a resolution outcome to the HTTP status it should be served with.
pub fn status_for(resolved: &Resolved) -> Status {
    match resolved {
        Resolved::Found { .. } => Status::Ok,
        Resolved::Forbidden => Status::Forbidden,
        Resolved::NotFound => Status::NotFound,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn serves_existing_file() {
        let dir = std::env::temp_dir().join(format!("rask-static-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let file_path = dir.join("index.html");
        std::fs::File::create(&file_path)
            .unwrap()
            .write_all(b"<html></html>")
            .unwrap();

        let files = StaticFiles::new(&dir);
        match files.resolve("/index.html") {
            Resolved::Found { body, content_type } => {
                assert_eq!(body.as_bytes(), b"<html></html>");
                assert_eq!(content_type, "text/html; charset=utf-8");
            }
            _ => panic!("expected file to resolve"),
        }

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn rejects_path_traversal() {
        let files = StaticFiles::new("/tmp");
        assert!(matches!(files.resolve("/../etc/passwd"), Resolved::Forbidden));
    }

    #[test]
    fn missing_file_is_not_found() {
        let files = StaticFiles::new("/tmp");
        assert!(matches!(
            files.resolve("/definitely-missing-file.html"),
            Resolved::NotFound
        ));
    }
}
