//! HTTP primitives shared by the rendering pipeline.
//!
//! This module provides [`Method`], [`StatusCode`], [`Headers`], [`Request`] and
//! [`Response`], plus the header vocabulary a browser client uses to switch a
//! request from a full document render to the programmatic data protocol
//! ([`signal`], [`Navigation`]).

use std::fmt;

pub mod headers;
pub mod request;
pub mod response;

pub use headers::Headers;
pub use request::Request;
pub use response::{Body, Response};

/// Request header names recognised by the rendering pipeline.
pub mod signal {
    /// Present (any value other than `0`/`false`) on client navigations.
    pub const DATA_REQUEST: &str = "X-Data-Request";
    /// Selects the response variant of a data request: `ndjson` (default) or `html`.
    pub const DATA_FORMAT: &str = "X-Data-Format";
    /// Marks a speculative request issued before the user navigates.
    pub const PREFETCH: &str = "X-Prefetch";
    /// Comma-separated virtual paths whose loaders should run.
    pub const MATCH_IDS: &str = "X-Match-Ids";
    /// Signature issued by a prior full-document render.
    pub const DATA_SIGNATURE: &str = "X-Data-Signature";

    /// Media type of the line-delimited protocol.
    pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";
    /// Media type of full documents.
    pub const HTML_CONTENT_TYPE: &str = "text/html; charset=utf-8";
}

/// An HTTP response status code.
///
/// # Examples
///
/// ```
/// use routeweave::http::StatusCode;
///
/// let status = StatusCode::Forbidden;
/// assert_eq!(status.as_u16(), 403);
/// assert!(status.is_client_error());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum StatusCode {
    Ok = 200,
    NoContent = 204,

    Found = 302,
    NotModified = 304,

    BadRequest = 400,
    Unauthorized = 401,
    Forbidden = 403,
    NotFound = 404,
    MethodNotAllowed = 405,
    PayloadTooLarge = 413,

    InternalServerError = 500,
    ServiceUnavailable = 503,
}

impl StatusCode {
    /// Returns the numeric status code as a `u16`.
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Returns the canonical reason phrase for this status code.
    pub fn canonical_reason(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::NoContent => "No Content",
            Self::Found => "Found",
            Self::NotModified => "Not Modified",
            Self::BadRequest => "Bad Request",
            Self::Unauthorized => "Unauthorized",
            Self::Forbidden => "Forbidden",
            Self::NotFound => "Not Found",
            Self::MethodNotAllowed => "Method Not Allowed",
            Self::PayloadTooLarge => "Payload Too Large",
            Self::InternalServerError => "Internal Server Error",
            Self::ServiceUnavailable => "Service Unavailable",
        }
    }

    /// Returns `true` for 2xx codes.
    pub fn is_success(self) -> bool {
        (200..300).contains(&self.as_u16())
    }

    /// Returns `true` for 4xx codes.
    pub fn is_client_error(self) -> bool {
        (400..500).contains(&self.as_u16())
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.as_u16(), self.canonical_reason())
    }
}

impl From<StatusCode> for u16 {
    fn from(code: StatusCode) -> u16 {
        code.as_u16()
    }
}

/// An HTTP request method.
///
/// Only `GET` and `HEAD` are rendered; anything else is answered with
/// `405 Method Not Allowed` by the app.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Patch,
    Options,
    /// A non-standard extension method.
    Custom(String),
}

impl Method {
    /// Returns the method as a string slice.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Patch => "PATCH",
            Self::Options => "OPTIONS",
            Self::Custom(s) => s.as_str(),
        }
    }

    /// Returns `true` for methods the renderer answers (`GET`, `HEAD`).
    pub fn is_renderable(&self) -> bool {
        matches!(self, Self::Get | Self::Head)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Method {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "GET" => Self::Get,
            "HEAD" => Self::Head,
            "POST" => Self::Post,
            "PUT" => Self::Put,
            "DELETE" => Self::Delete,
            "PATCH" => Self::Patch,
            "OPTIONS" => Self::Options,
            other => Self::Custom(other.to_owned()),
        })
    }
}

/// The response variant a data request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFormat {
    /// Line-delimited JSON protocol.
    Ndjson,
    /// Full HTML document rendered for a client navigation.
    Html,
}

/// How the client wants this request answered, decoded from the [`signal`] headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Navigation {
    /// `None` for a plain document request (initial load).
    pub data: Option<DataFormat>,
    pub prefetch: bool,
    /// Virtual paths whose loaders should run; `None` runs the whole chain.
    pub match_ids: Option<Vec<String>>,
}

impl Navigation {
    /// Decode the navigation signals carried by `headers`.
    pub fn from_headers(headers: &Headers) -> Self {
        let data = headers
            .get(signal::DATA_REQUEST)
            .filter(|v| is_truthy(v))
            .map(|_| match headers.get(signal::DATA_FORMAT) {
                Some(f) if f.trim().eq_ignore_ascii_case("html") => DataFormat::Html,
                _ => DataFormat::Ndjson,
            });

        let prefetch = headers.get(signal::PREFETCH).is_some_and(is_truthy);

        let match_ids = headers.get(signal::MATCH_IDS).map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect()
        });

        Self {
            data,
            prefetch,
            match_ids,
        }
    }

    /// `true` when no client-side state exists yet, i.e. the full document is being built.
    pub fn is_initial_load(&self) -> bool {
        self.data.is_none()
    }
}

fn is_truthy(value: &str) -> bool {
    let value = value.trim();
    !(value.is_empty() || value == "0" || value.eq_ignore_ascii_case("false"))
}
