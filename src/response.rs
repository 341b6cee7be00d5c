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

//! HTTP response assembly: status line, headers, and a memory-mapped body.
//!
//! Ported from the original's `HttpResponse`: derive a status from the
//! target's filesystem state, rewrite to a canonical error page when
//! needed, then mmap the final resource and write status line, headers and
//! a `Content-length` header ahead of the mapped bytes. The file descriptor
//! is closed immediately after mapping; the mapping itself is released on
//! `init`, on `unmap`, and on drop.

use std::collections::HashMap;
use std::fs::{self, File};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

use memmap2::Mmap;

use crate::buffer::Buffer;

fn code_status() -> &'static HashMap<i32, &'static str> {
    static MAP: OnceLock<HashMap<i32, &'static str>> = OnceLock::new();
    MAP.get_or_init(|| {
        HashMap::from([(200, "OK"), (400, "Bad Request"), (403, "Forbidden"), (404, "Not Found")])
    })
}

fn error_pages() -> &'static HashMap<i32, &'static str> {
    static MAP: OnceLock<HashMap<i32, &'static str>> = OnceLock::new();
    MAP.get_or_init(|| HashMap::from([(400, "/400.html"), (403, "/403.html"), (404, "/404.html")]))
}

/// Fixed suffix-to-MIME-type table, matching the original's `SUFFIX_TYPE`
/// (the stray trailing spaces on its `.css`/`.js` entries are a non-semantic
/// transcription artifact and are not reproduced here).
const MIME_TABLE: &[(&str, &str)] = &[
    (".html", "text/html"),
    (".xml", "text/xml"),
    (".xhtml", "application/xhtml+xml"),
    (".txt", "text/plain"),
    (".rtf", "application/rtf"),
    (".pdf", "application/pdf"),
    (".word", "application/nsword"),
    (".png", "image/png"),
    (".gif", "image/gif"),
    (".jpg", "image/jpeg"),
    (".jpeg", "image/jpeg"),
    (".au", "audio/basic"),
    (".mpeg", "video/mpeg"),
    (".mpg", "video/mpeg"),
    (".avi", "video/x-msvideo"),
    (".gz", "application/x-gzip"),
    (".tar", "application/x-tar"),
    (".css", "text/css"),
    (".js", "text/javascript"),
];

const DEFAULT_MIME: &str = "text/plain";

/// A response being assembled for one request.
#[derive(Debug)]
pub struct Response {
    code: i32,
    keep_alive: bool,
    path: String,
    src_dir: PathBuf,
    mmap: Option<Mmap>,
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

impl Response {
    /// Builds an unpopulated response.
    pub fn new() -> Self {
        Self { code: -1, keep_alive: false, path: String::new(), src_dir: PathBuf::new(), mmap: None }
    }

    /// Resets the response for a new request, unconditionally releasing any
    /// prior mapping first — unlike the original, which only called
    /// `UnmapFile` when `mmFile_` was already non-null, a path that could
    /// leak a mapping left over from a partially built response (§9).
    pub fn init(&mut self, src_dir: &Path, path: impl Into<String>, keep_alive: bool, code: i32) {
        self.unmap();
        self.src_dir = src_dir.to_path_buf();
        self.path = path.into();
        self.keep_alive = keep_alive;
        self.code = code;
    }

    /// Releases the current mapping, if any. Safe to call when none exists.
    pub fn unmap(&mut self) {
        self.mmap = None;
    }

    /// Length of the mapped file body, zero if there is none.
    pub fn file_len(&self) -> usize {
        self.mmap.as_ref().map_or(0, |m| m.len())
    }

    /// The mapped body starting at `offset`, empty past the end or absent a
    /// mapping.
    pub fn file_bytes(&self, offset: usize) -> &[u8] {
        match &self.mmap {
            Some(m) if offset < m.len() => &m[offset..],
            _ => &[],
        }
    }

    /// Derives the final status, rewrites to an error page and re-derives
    /// if needed, then writes status line, headers, and body into `buf`.
    pub fn make_response(&mut self, buf: &mut Buffer) {
        self.derive_status();
        if let Some(&page) = error_pages().get(&self.code) {
            self.path = page.to_string();
        }

        match self.try_map_body() {
            Ok(mmap) => {
                let len = mmap.len();
                self.mmap = Some(mmap);
                self.write_status_line(buf);
                self.write_headers(buf);
                buf.append(format!("Content-length: {len}\r\n\r\n").as_bytes());
            }
            Err(message) => {
                self.mmap = None;
                self.write_inline_error(buf, &message);
            }
        }
    }

    fn derive_status(&mut self) {
        let resolved = resolve_within_root(&self.src_dir, &self.path);
        let meta = resolved.as_deref().and_then(|p| fs::metadata(p).ok());
        match &meta {
            None => self.code = 404,
            Some(m) if m.is_dir() => self.code = 404,
            Some(m) if m.permissions().mode() & 0o004 == 0 => self.code = 403,
            _ => {
                if self.code == -1 {
                    self.code = 200;
                }
            }
        }
    }

    fn try_map_body(&self) -> Result<Mmap, String> {
        let resolved =
            resolve_within_root(&self.src_dir, &self.path).ok_or_else(|| "File NotFound!".to_string())?;
        let file = File::open(&resolved).map_err(|_| "File NotFound!".to_string())?;
        // SAFETY: the file is not subsequently written to by this process;
        // the mapping is released before the file is touched again.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|_| "File NotFound!".to_string())?;
        Ok(mmap)
    }

    fn write_status_line(&self, buf: &mut Buffer) {
        let (code, reason) = self.status_text();
        buf.append(format!("HTTP/1.1 {code} {reason}\r\n").as_bytes());
    }

    fn write_headers(&self, buf: &mut Buffer) {
        if self.keep_alive {
            buf.append(b"Connection: keep-alive\r\n");
            buf.append(b"keep-alive: max=6, timeout=120\r\n");
        } else {
            buf.append(b"Connection: close\r\n");
        }
        buf.append(format!("Content-type: {}\r\n", mime_for(&self.path)).as_bytes());
    }

    fn write_inline_error(&self, buf: &mut Buffer, message: &str) {
        let (code, reason) = self.status_text();
        let body = format!(
            "<html><title>Error</title><body bgcolor=\"ffffff\">{code} : {message}\
<p>{message}</p><hr><em>WebServer</em></body></html>"
        );
        buf.append(format!("HTTP/1.1 {code} {reason}\r\n").as_bytes());
        buf.append(b"Content-type: text/html\r\n");
        buf.append(b"Connection: close\r\n");
        buf.append(format!("Content-length: {}\r\n\r\n", body.len()).as_bytes());
        buf.append(body.as_bytes());
    }

    /// The status code actually written, downgrading unrecognised codes to
    /// 400.
    fn status_text(&self) -> (i32, &'static str) {
        match code_status().get(&self.code) {
            Some(&reason) => (self.code, reason),
            None => (400, "Bad Request"),
        }
    }
}

/// Joins `req_path` (with its leading slash stripped) onto `src_dir`,
/// rejecting any path whose `..` components would escape the root. Purely
/// lexical — it does not require the target to exist, so the 404 path for a
/// missing file and the 404 path for an escaping traversal share the same
/// resolve-then-stat flow.
fn resolve_within_root(src_dir: &Path, req_path: &str) -> Option<PathBuf> {
    let mut joined = PathBuf::new();
    for component in Path::new(req_path.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => joined.push(part),
            Component::ParentDir => {
                if !joined.pop() {
                    return None;
                }
            }
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(src_dir.join(joined))
}

fn mime_for(path: &str) -> &'static str {
    let Some(dot) = path.rfind('.') else { return DEFAULT_MIME };
    let suffix = &path[dot..];
    MIME_TABLE
        .iter()
        .find(|(ext, _)| ext.eq_ignore_ascii_case(suffix))
        .map(|(_, mime)| *mime)
        .unwrap_or(DEFAULT_MIME)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write as _;
    use tempfile::tempdir;

    fn write_file(dir: &Path, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(contents).unwrap();
        path
    }

    #[test]
    fn serves_an_existing_world_readable_file() {
        let dir = tempdir().unwrap();
        write_file(dir.path(), "index.html", b"hello world");

        let mut resp = Response::new();
        resp.init(dir.path(), "/index.html", true, -1);
        let mut buf = Buffer::new(256);
        resp.make_response(&mut buf);

        let wire = String::from_utf8_lossy(buf.peek()).into_owned();
        assert!(wire.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(wire.contains("Content-type: text/html\r\n"));
        assert!(wire.contains("keep-alive"));
        assert!(wire.ends_with("hello world"));
    }

    #[test]
    fn missing_file_yields_404_from_the_error_page() {
        let dir = tempdir().unwrap();
        write_file(dir.path(), "404.html", b"not found body");

        let mut resp = Response::new();
        resp.init(dir.path(), "/missing.html", false, -1);
        let mut buf = Buffer::new(256);
        resp.make_response(&mut buf);

        let wire = String::from_utf8_lossy(buf.peek()).into_owned();
        assert!(wire.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(wire.ends_with("not found body"));
    }

    #[test]
    fn unreadable_file_yields_403() {
        let dir = tempdir().unwrap();
        let path = write_file(dir.path(), "secret.html", b"shh");
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o600);
        fs::set_permissions(&path, perms).unwrap();
        write_file(dir.path(), "403.html", b"forbidden body");

        let mut resp = Response::new();
        resp.init(dir.path(), "/secret.html", false, -1);
        let mut buf = Buffer::new(256);
        resp.make_response(&mut buf);

        let wire = String::from_utf8_lossy(buf.peek()).into_owned();
        assert!(wire.starts_with("HTTP/1.1 403 Forbidden\r\n"));
        assert!(wire.ends_with("forbidden body"));
    }

    #[test]
    fn missing_error_page_falls_back_to_inline_body() {
        let dir = tempdir().unwrap();
        // No 404.html present at all.
        let mut resp = Response::new();
        resp.init(dir.path(), "/missing.html", false, -1);
        let mut buf = Buffer::new(256);
        resp.make_response(&mut buf);

        let wire = String::from_utf8_lossy(buf.peek()).into_owned();
        assert!(wire.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(wire.contains("Connection: close\r\n"));
        assert!(wire.contains("WebServer"));
    }

    #[test]
    fn path_traversal_is_rejected_as_404() {
        let dir = tempdir().unwrap();
        write_file(dir.path(), "404.html", b"nope");

        let mut resp = Response::new();
        resp.init(dir.path(), "/../../../../etc/passwd", false, -1);
        let mut buf = Buffer::new(256);
        resp.make_response(&mut buf);

        let wire = String::from_utf8_lossy(buf.peek()).into_owned();
        assert!(wire.starts_with("HTTP/1.1 404 Not Found\r\n"));
    }

    #[test]
    fn init_unconditionally_releases_a_prior_mapping() {
        let dir = tempdir().unwrap();
        write_file(dir.path(), "a.html", b"aaa");
        write_file(dir.path(), "b.html", b"bbbb");

        let mut resp = Response::new();
        resp.init(dir.path(), "/a.html", true, -1);
        let mut buf = Buffer::new(256);
        resp.make_response(&mut buf);
        assert_eq!(resp.file_len(), 3);

        resp.init(dir.path(), "/b.html", true, -1);
        assert_eq!(resp.file_len(), 0);
        buf.retrieve_all();
        resp.make_response(&mut buf);
        assert_eq!(resp.file_len(), 4);
    }

    #[test]
    fn mime_lookup_defaults_to_text_plain() {
        assert_eq!(mime_for("/a.css"), "text/css");
        assert_eq!(mime_for("/a.js"), "text/javascript");
        assert_eq!(mime_for("/a.unknown-ext"), DEFAULT_MIME);
        assert_eq!(mime_for("/no-suffix"), DEFAULT_MIME);
    }
}
