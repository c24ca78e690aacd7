//! HTTP/1.1 response builder.
//!
//! Responses carry either a fully buffered body (documents, static NDJSON) or a
//! channel of chunks produced after the head has been sent (streamed NDJSON,
//! streamed document tails). [`Response::write_to`] serializes both forms; the
//! streamed form uses `Transfer-Encoding: chunked`.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use super::{Headers, StatusCode};

/// A response body.
#[derive(Debug)]
pub enum Body {
    /// The whole body, known up front.
    Full(Vec<u8>),
    /// Chunks delivered as they are produced. The body ends when every sender is dropped.
    Stream(mpsc::Receiver<Bytes>),
}

impl Body {
    /// Drain the body into one buffer, waiting for a streamed body to finish.
    pub async fn collect(self) -> Vec<u8> {
        match self {
            Body::Full(bytes) => bytes,
            Body::Stream(mut rx) => {
                let mut out = Vec::new();
                while let Some(chunk) = rx.recv().await {
                    out.extend_from_slice(&chunk);
                }
                out
            }
        }
    }
}

impl Default for Body {
    fn default() -> Self {
        Body::Full(Vec::new())
    }
}

/// An HTTP/1.1 response, ready to be serialized and sent.
///
/// # Examples
///
/// ```
/// use routeweave::http::{Response, StatusCode};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> std::io::Result<()> {
/// let response = Response::new(StatusCode::Ok)
///     .header("Content-Type", "application/json")
///     .body(r#"{"status":"ok"}"#);
///
/// let bytes = response.into_bytes().await?;
/// let text = std::str::from_utf8(&bytes).unwrap();
/// assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
/// assert!(text.contains("Content-Length: 15\r\n"));
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Body,
}

impl Response {
    /// Creates a new response with the given status and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Body::default(),
        }
    }

    /// Appends a response header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Appends a header in-place. Intended for middleware pipelines that receive
    /// a `Response` from downstream and need to decorate it without consuming it.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name, value);
    }

    /// Sets a header in-place, replacing any existing value with the same name.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.set(name, value);
    }

    /// Applies every header in `headers`, replacing existing values per name.
    pub fn overlay_headers(&mut self, headers: &Headers) {
        self.headers.overlay(headers);
    }

    /// Sets the response body from a string.
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Body::Full(body.into().into_bytes());
        self
    }

    /// Sets the response body from raw bytes.
    #[must_use]
    pub fn body_bytes(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Body::Full(body.into());
        self
    }

    /// Sets a streamed body fed through `chunks`.
    #[must_use]
    pub fn stream(mut self, chunks: mpsc::Receiver<Bytes>) -> Self {
        self.body = Body::Stream(chunks);
        self
    }

    /// Sets a body built elsewhere, full or streamed.
    #[must_use]
    pub fn with_body(mut self, body: Body) -> Self {
        self.body = body;
        self
    }

    /// Returns the status code of this response.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the response headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns `true` if the body is delivered in chunks.
    pub fn is_streaming(&self) -> bool {
        matches!(self.body, Body::Stream(_))
    }

    /// Consumes the response, returning its body.
    pub fn into_body(self) -> Body {
        self.body
    }

    /// Serializes the response to `out` using HTTP/1.1 wire format.
    ///
    /// Automatically adds:
    /// - `Content-Type: text/plain; charset=utf-8` if a full body is non-empty and no
    ///   `Content-Type` header was set.
    /// - `Content-Length: <n>` for full bodies, `Transfer-Encoding: chunked` for streams.
    pub async fn write_to<W>(mut self, out: &mut W) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        if let Body::Full(body) = &self.body {
            if !body.is_empty() && !self.headers.contains("content-type") {
                self.headers
                    .insert("Content-Type", "text/plain; charset=utf-8");
            }
        }

        let mut head = BytesMut::with_capacity(128 + self.headers.len() * 64);
        head.put(
            format!(
                "HTTP/1.1 {} {}\r\n",
                self.status.as_u16(),
                self.status.canonical_reason()
            )
            .as_bytes(),
        );
        for (name, value) in self.headers.iter() {
            head.put(format!("{name}: {value}\r\n").as_bytes());
        }

        match self.body {
            Body::Full(body) => {
                head.put(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
                out.write_all(&head).await?;
                if !body.is_empty() {
                    out.write_all(&body).await?;
                }
            }
            Body::Stream(mut rx) => {
                head.put(&b"Transfer-Encoding: chunked\r\n\r\n"[..]);
                out.write_all(&head).await?;
                out.flush().await?;
                while let Some(chunk) = rx.recv().await {
                    if chunk.is_empty() {
                        continue;
                    }
                    out.write_all(format!("{:x}\r\n", chunk.len()).as_bytes())
                        .await?;
                    out.write_all(&chunk).await?;
                    out.write_all(b"\r\n").await?;
                    out.flush().await?;
                }
                out.write_all(b"0\r\n\r\n").await?;
            }
        }

        out.flush().await
    }

    /// Serializes the whole response into one buffer. Streamed bodies are
    /// drained first, so this waits for the stream to end.
    pub async fn into_bytes(self) -> std::io::Result<BytesMut> {
        let mut out = Vec::new();
        self.write_to(&mut out).await?;
        Ok(BytesMut::from(&out[..]))
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::Ok)
    }
}
