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

//! HTTP/1.x request parsing and response models.

use std::fmt::Display;

use self::status::Status;

pub mod method;
pub mod mime;
pub mod request;
pub mod response;
pub mod status;
pub mod version;

/// Outcome of one incremental parse step.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseStatus {
    /// The step consumed its full grammar production.
    Complete,
    /// The buffer does not yet hold enough bytes; feed more and retry.
    Partial,
}

/// Protocol-level failure while parsing or handling a request.
///
/// Every variant maps to a response status; the connection reports the
/// error to the peer and then applies its keep-alive policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpError {
    /// Malformed request line, header or body framing.
    BadRequest,
    /// The resolved path does not exist (or escapes the document root).
    NotFound,
    /// A POST arrived without a `content-length` header.
    LengthRequired,
    /// Stat, open, map or CGI execution failed on an existing target.
    InternalServerError,
    /// The request method is outside the implemented set.
    NotImplemented,
    /// The request version is neither HTTP/1.0 nor HTTP/1.1.
    VersionNotSupported,
}

impl HttpError {
    /// The response status this error is reported with.
    pub fn status(&self) -> Status {
        match *self {
            HttpError::BadRequest => Status::BadRequest,
            HttpError::NotFound => Status::NotFound,
            HttpError::LengthRequired => Status::LengthRequired,
            HttpError::InternalServerError => Status::InternalServerError,
            HttpError::NotImplemented => Status::NotImplemented,
            HttpError::VersionNotSupported => Status::HttpVersionNotSupported,
        }
    }

    fn description_str(&self) -> &'static str {
        match *self {
            HttpError::BadRequest => "Malformed request",
            HttpError::NotFound => "Target not found",
            HttpError::LengthRequired => "Missing content-length",
            HttpError::InternalServerError => "Request handling failed",
            HttpError::NotImplemented => "Unimplemented method",
            HttpError::VersionNotSupported => "Unsupported HTTP version",
        }
    }
}

impl Display for HttpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.description_str())
    }
}

impl std::error::Error for HttpError {}

/// Result whose Err variant is [`HttpError`].
pub type ParseResult = std::result::Result<ParseStatus, HttpError>;
