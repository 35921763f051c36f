// Copyright 2024 the vev authors
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

//! Incremental HTTP/1.x request parser.
//!
//! Requests arrive split across an arbitrary number of TCP segments, so
//! every step parses from a caller-owned receive buffer at a caller-owned
//! cursor and reports [`ParseStatus::Partial`] when the next production is
//! not complete yet. The cursor only moves past fully consumed input;
//! re-entering a step after more bytes arrived resumes cleanly.

use std::collections::HashMap;

use super::method::Method;
use super::version::Version;
use super::{HttpError, ParseResult, ParseStatus};

/// A request assembled incrementally from the receive buffer.
#[derive(Debug, Default)]
pub struct Request {
    /// Parsed method, once the request line is complete.
    pub method: Option<Method>,
    /// Target prefixed with the document root, forming a filesystem path.
    pub path: String,
    /// Parsed version, once the request line is complete.
    pub version: Option<Version>,
    /// Header mapping; names lowercased, last occurrence wins.
    pub headers: HashMap<String, String>,
    /// Request body (POST only).
    pub body: Vec<u8>,
}

impl Request {
    /// Creates an empty request.
    pub fn new() -> Request {
        Request::default()
    }

    /// Forgets everything parsed so far, readying the value for the next
    /// request on a keep-alive connection.
    pub fn clear(&mut self) {
        self.method = None;
        self.path.clear();
        self.version = None;
        self.headers.clear();
        self.body.clear();
    }

    /// Parses the request line `METHOD SP TARGET SP VERSION CRLF`.
    ///
    /// # Example
    /// ```
    /// # use vev::http::method::Method;
    /// # use vev::http::request::Request;
    /// # use vev::http::ParseStatus;
    /// let mut req = Request::new();
    /// let mut pos = 0;
    /// let buf = b"GET /a.txt HTTP/1.1\r\n";
    /// assert_eq!(Ok(ParseStatus::Complete), req.parse_request_line("/www", buf, &mut pos));
    /// assert_eq!(Some(Method::Get), req.method);
    /// assert_eq!("/www/a.txt", req.path);
    /// assert_eq!(buf.len(), pos);
    /// ```
    pub fn parse_request_line(&mut self, root: &str, buf: &[u8], pos: &mut usize) -> ParseResult {
        let Some(end) = find_crlf(&buf[*pos..]) else {
            return Ok(ParseStatus::Partial);
        };
        let line =
            std::str::from_utf8(&buf[*pos..*pos + end]).map_err(|_| HttpError::BadRequest)?;

        // Exactly three tokens separated by single spaces.
        let mut tokens = line.split(' ');
        let (Some(method), Some(target), Some(version), None) =
            (tokens.next(), tokens.next(), tokens.next(), tokens.next())
        else {
            return Err(HttpError::BadRequest);
        };
        if method.is_empty() || target.is_empty() || version.is_empty() {
            return Err(HttpError::BadRequest);
        }

        self.method = Some(Method::parse(method).ok_or(HttpError::NotImplemented)?);
        self.path = format!("{root}{target}");
        self.version = Some(Version::parse(version).ok_or(HttpError::VersionNotSupported)?);

        *pos += end + 2;
        Ok(ParseStatus::Complete)
    }

    /// Parses header lines up to and including the empty-line terminator.
    ///
    /// Each line must take the canonical form `NAME: VALUE`: the first space
    /// must be immediately preceded by the colon. Names are lowercased;
    /// a repeated name keeps the last value.
    pub fn parse_headers(&mut self, buf: &[u8], pos: &mut usize) -> ParseResult {
        loop {
            let Some(end) = find_crlf(&buf[*pos..]) else {
                return Ok(ParseStatus::Partial);
            };
            let line = &buf[*pos..*pos + end];
            if line.is_empty() {
                *pos += 2;
                return Ok(ParseStatus::Complete);
            }

            let line = std::str::from_utf8(line).map_err(|_| HttpError::BadRequest)?;
            let sp = line.find(' ').ok_or(HttpError::BadRequest)?;
            if sp == 0 || line.as_bytes()[sp - 1] != b':' {
                return Err(HttpError::BadRequest);
            }
            let name = line[..sp - 1].to_ascii_lowercase();
            let value = line[sp + 1..].to_string();
            self.headers.insert(name, value);

            *pos += end + 2;
        }
    }

    /// Parses a body of exactly `content-length` bytes.
    pub fn parse_body(&mut self, buf: &[u8], pos: &mut usize) -> ParseResult {
        let value = self
            .headers
            .get("content-length")
            .ok_or(HttpError::LengthRequired)?;
        if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
            return Err(HttpError::BadRequest);
        }
        let length: usize = value.parse().map_err(|_| HttpError::BadRequest)?;

        if buf.len() - *pos < length {
            return Ok(ParseStatus::Partial);
        }
        self.body = buf[*pos..*pos + length].to_vec();
        *pos += length;
        Ok(ParseStatus::Complete)
    }

    /// Whether the connection should stay open after this request.
    ///
    /// HTTP/1.1 defaults to keep-alive, HTTP/1.0 to close; an explicit
    /// `connection` header value (compared case-insensitively) overrides
    /// the default in either direction.
    pub fn keep_alive(&self) -> bool {
        let mut keep = !matches!(self.version, Some(Version::Http10));
        if let Some(value) = self.headers.get("connection") {
            if value.eq_ignore_ascii_case("keep-alive") {
                keep = true;
            } else if value.eq_ignore_ascii_case("close") {
                keep = false;
            }
        }
        keep
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|window| window == b"\r\n")
}

#[cfg(test)]
mod test {
    use super::Request;
    use crate::http::method::Method;
    use crate::http::version::Version;
    use crate::http::{HttpError, ParseStatus};

    fn parsed_request_line(line: &[u8]) -> (Request, usize) {
        let mut req = Request::new();
        let mut pos = 0;
        assert_eq!(
            Ok(ParseStatus::Complete),
            req.parse_request_line("/www", line, &mut pos)
        );
        (req, pos)
    }

    #[test]
    fn request_line_yields_method_path_and_version() {
        let (req, pos) = parsed_request_line(b"GET /a.txt HTTP/1.1\r\nHost: x\r\n");
        assert_eq!(Some(Method::Get), req.method);
        assert_eq!("/www/a.txt", req.path);
        assert_eq!(Some(Version::Http11), req.version);
        assert_eq!(21, pos);
    }

    #[test]
    fn request_line_without_terminator_is_partial() {
        let mut req = Request::new();
        let mut pos = 0;
        assert_eq!(
            Ok(ParseStatus::Partial),
            req.parse_request_line("/www", b"GET /a.txt HTT", &mut pos)
        );
        assert_eq!(0, pos);

        // The same step succeeds once the terminator arrives.
        assert_eq!(
            Ok(ParseStatus::Complete),
            req.parse_request_line("/www", b"GET /a.txt HTTP/1.1\r\n", &mut pos)
        );
    }

    #[test]
    fn request_line_with_wrong_token_count_is_rejected() {
        let mut req = Request::new();
        let mut pos = 0;
        assert_eq!(
            Err(HttpError::BadRequest),
            req.parse_request_line("/www", b"GET /a.txt\r\n", &mut pos)
        );

        let mut pos = 0;
        assert_eq!(
            Err(HttpError::BadRequest),
            req.parse_request_line("/www", b"GET  /a.txt HTTP/1.1\r\n", &mut pos)
        );
    }

    #[test]
    fn unknown_method_is_not_implemented() {
        let mut req = Request::new();
        let mut pos = 0;
        assert_eq!(
            Err(HttpError::NotImplemented),
            req.parse_request_line("/www", b"PUT /a.txt HTTP/1.1\r\n", &mut pos)
        );
    }

    #[test]
    fn unknown_version_is_not_supported() {
        let mut req = Request::new();
        let mut pos = 0;
        assert_eq!(
            Err(HttpError::VersionNotSupported),
            req.parse_request_line("/www", b"GET /a.txt HTTP/2.0\r\n", &mut pos)
        );
    }

    #[test]
    fn headers_are_lowercased_and_last_occurrence_wins() {
        let buf = b"Host: example\r\nX-Tag: one\r\nX-TAG: two\r\n\r\nrest";
        let mut req = Request::new();
        let mut pos = 0;
        assert_eq!(
            Ok(ParseStatus::Complete),
            req.parse_headers(buf, &mut pos)
        );
        assert_eq!(Some(&"example".to_string()), req.headers.get("host"));
        assert_eq!(Some(&"two".to_string()), req.headers.get("x-tag"));
        assert_eq!(buf.len() - 4, pos);
    }

    #[test]
    fn header_without_colon_before_space_is_rejected() {
        let mut req = Request::new();
        let mut pos = 0;
        assert_eq!(
            Err(HttpError::BadRequest),
            req.parse_headers(b"Host example\r\n\r\n", &mut pos)
        );

        let mut req = Request::new();
        let mut pos = 0;
        assert_eq!(
            Err(HttpError::BadRequest),
            req.parse_headers(b"Host:example\r\n\r\n", &mut pos)
        );
    }

    #[test]
    fn header_block_without_terminator_is_partial() {
        let mut req = Request::new();
        let mut pos = 0;
        assert_eq!(
            Ok(ParseStatus::Partial),
            req.parse_headers(b"Host: example\r\nX-Tag: on", &mut pos)
        );
        // The complete first line was consumed; only the torn line remains.
        assert_eq!(15, pos);
        assert_eq!(Some(&"example".to_string()), req.headers.get("host"));
    }

    #[test]
    fn body_requires_content_length() {
        let mut req = Request::new();
        let mut pos = 0;
        assert_eq!(
            Err(HttpError::LengthRequired),
            req.parse_body(b"abc", &mut pos)
        );
    }

    #[test]
    fn body_with_non_numeric_length_is_rejected() {
        let mut req = Request::new();
        req.headers
            .insert("content-length".to_string(), "3x".to_string());
        let mut pos = 0;
        assert_eq!(Err(HttpError::BadRequest), req.parse_body(b"abc", &mut pos));
    }

    #[test]
    fn body_waits_for_all_announced_bytes() {
        let mut req = Request::new();
        req.headers
            .insert("content-length".to_string(), "5".to_string());
        let mut pos = 0;
        assert_eq!(Ok(ParseStatus::Partial), req.parse_body(b"ab", &mut pos));
        assert_eq!(
            Ok(ParseStatus::Complete),
            req.parse_body(b"abcde", &mut pos)
        );
        assert_eq!(b"abcde".to_vec(), req.body);
        assert_eq!(5, pos);
    }

    #[test]
    fn keep_alive_follows_version_default_and_connection_header() {
        let mut req = Request::new();
        req.version = Some(Version::Http11);
        assert!(req.keep_alive());

        req.headers
            .insert("connection".to_string(), "Close".to_string());
        assert!(!req.keep_alive());

        let mut req = Request::new();
        req.version = Some(Version::Http10);
        assert!(!req.keep_alive());

        req.headers
            .insert("connection".to_string(), "Keep-Alive".to_string());
        assert!(req.keep_alive());
    }

    #[test]
    fn clear_forgets_all_parsed_state() {
        let (mut req, _) = parsed_request_line(b"GET /a.txt HTTP/1.1\r\n");
        req.headers
            .insert("host".to_string(), "example".to_string());
        req.body = b"abc".to_vec();
        req.clear();
        assert_eq!(None, req.method);
        assert_eq!(None, req.version);
        assert!(req.path.is_empty());
        assert!(req.headers.is_empty());
        assert!(req.body.is_empty());
    }
}
