//! NDJSON navigation protocol.
//!
//! A data response is a sequence of newline-terminated JSON objects, each
//! tagged by a one-letter `t` field:
//!
//! | `t` | Payload | Meaning |
//! |-----|---------|---------|
//! | `l` | `m`, `d`, `error?` | loader result of one chain position |
//! | `h` | `d` | merged head, omitted when the chain sets none |
//! | `r` | - | initial batch complete, streamed chunks follow |
//! | `c` | `m`, `k`, `d` | a streamed deferred value resolved |
//! | `e` | `m`, `k`, `error` | a streamed deferred value rejected |
//! | `d` | - | end of response, always last and exactly once |
//!
//! When nothing streams the body is static and `r` is omitted. Otherwise the
//! body is a channel fed by a spawned task that emits chunks in resolution
//! order.
//!
//! The client half is [`NdjsonDecoder`] (bytes → messages) and
//! [`NavigationState`] (messages → route data with placeholders patched).

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::context::AbortSignal;
use crate::defer::{PendingStream, error_marker, patch_placeholders};
use crate::head::HeadConfig;
use crate::http::Body;
use crate::loader::{LoaderOutcome, LoaderResult};

/// Chunks buffered between the stream driver and the writer.
const STREAM_BUFFER: usize = 16;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid protocol line {line}: {source}")]
    Json {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("received `{0}` message after done")]
    AfterDone(&'static str),

    #[error("chunk for unknown match `{0}`")]
    UnknownMatch(String),

    #[error("stream ended without a done message")]
    Truncated,
}

/// One protocol line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t")]
pub enum Message {
    #[serde(rename = "l")]
    Loader {
        #[serde(rename = "m")]
        match_id: String,
        #[serde(rename = "d", default)]
        data: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    #[serde(rename = "h")]
    Head {
        #[serde(rename = "d")]
        head: HeadConfig,
    },

    #[serde(rename = "r")]
    Ready,

    #[serde(rename = "c")]
    Chunk {
        #[serde(rename = "m")]
        match_id: String,
        #[serde(rename = "k")]
        key: String,
        #[serde(rename = "d")]
        data: Value,
    },

    #[serde(rename = "e")]
    Error {
        #[serde(rename = "m")]
        match_id: String,
        #[serde(rename = "k")]
        key: String,
        error: String,
    },

    #[serde(rename = "d")]
    Done,
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Loader { .. } => "l",
            Message::Head { .. } => "h",
            Message::Ready => "r",
            Message::Chunk { .. } => "c",
            Message::Error { .. } => "e",
            Message::Done => "d",
        }
    }

    /// The `l` line for one loader result.
    pub fn from_result(result: &LoaderResult) -> Self {
        let (data, error) = match &result.outcome {
            LoaderOutcome::Success { data } => (data.clone(), None),
            LoaderOutcome::Error { error } => (Value::Null, Some(error.clone())),
        };
        Message::Loader {
            match_id: result.virtual_path.clone(),
            data,
            error,
        }
    }

    /// The `c` or `e` line for a settled streaming registration.
    pub fn from_settled(settled: Settled) -> Self {
        match settled.outcome {
            Ok(data) => Message::Chunk {
                match_id: settled.match_id,
                key: settled.key,
                data,
            },
            Err(error) => Message::Error {
                match_id: settled.match_id,
                key: settled.key,
                error,
            },
        }
    }

    /// Serialized line, newline included.
    pub fn to_line(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }
}

/// A streaming registration that finished.
#[derive(Debug, Clone, PartialEq)]
pub struct Settled {
    pub match_id: String,
    pub key: String,
    pub outcome: Result<Value, String>,
}

/// Resolve `streams` concurrently on a spawned task.
///
/// The returned body yields `opening` first, then `render(settled)` for every
/// registration in the order they finish, then `closing()` once all of them
/// have settled. An abort, or the receiver going away, ends the body early
/// without `closing`.
pub(crate) fn spawn_stream<F, C>(
    opening: Bytes,
    streams: Vec<PendingStream>,
    signal: AbortSignal,
    mut render: F,
    closing: C,
) -> mpsc::Receiver<Bytes>
where
    F: FnMut(Settled) -> Option<Bytes> + Send + 'static,
    C: FnOnce() -> Bytes + Send + 'static,
{
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);

    tokio::spawn(async move {
        if tx.send(opening).await.is_err() {
            return;
        }

        let mut pending: FuturesUnordered<_> = streams
            .into_iter()
            .map(|stream| async move {
                let match_id = stream.handle.virtual_path().to_owned();
                let key = stream.handle.key().to_owned();
                let outcome = stream.resolve().await;
                Settled {
                    match_id,
                    key,
                    outcome,
                }
            })
            .collect();

        loop {
            let next = tokio::select! {
                biased;
                () = signal.aborted() => {
                    debug!(remaining = pending.len(), "stream aborted");
                    return;
                }
                next = pending.next() => next,
            };
            let Some(settled) = next else {
                break;
            };
            let Some(bytes) = render(settled) else {
                continue;
            };
            if tx.send(bytes).await.is_err() {
                debug!("stream receiver dropped");
                return;
            }
        }

        let _ = tx.send(closing()).await;
    });

    rx
}

/// Encodes pipeline results as an NDJSON body.
#[derive(Debug, Clone, Default)]
pub struct NdjsonEncoder {
    head: Option<HeadConfig>,
    signal: AbortSignal,
}

impl NdjsonEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit an `h` line after the loader lines.
    #[must_use]
    pub fn head(mut self, head: HeadConfig) -> Self {
        self.head = Some(head);
        self
    }

    #[must_use]
    pub fn signal(mut self, signal: AbortSignal) -> Self {
        self.signal = signal;
        self
    }

    /// Messages sent before any chunk: one `l` per result, `h` if set, and `r`
    /// when `streaming`.
    pub fn initial_messages(&self, matches: &[LoaderResult], streaming: bool) -> Vec<Message> {
        let mut messages: Vec<Message> = matches.iter().map(Message::from_result).collect();
        if let Some(head) = &self.head {
            messages.push(Message::Head { head: head.clone() });
        }
        if streaming {
            messages.push(Message::Ready);
        }
        messages
    }

    /// Build the body. Static when `streams` is empty, streamed otherwise.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::Encode`] if an initial message fails to serialize.
    pub fn encode(
        self,
        matches: &[LoaderResult],
        streams: Vec<PendingStream>,
    ) -> Result<Body, ProtocolError> {
        let streaming = !streams.is_empty();
        let mut opening = Vec::new();
        for message in self.initial_messages(matches, streaming) {
            opening.extend(message.to_line()?);
        }

        if !streaming {
            opening.extend(Message::Done.to_line()?);
            return Ok(Body::Full(opening));
        }

        debug!(streams = streams.len(), "streaming ndjson response");
        let closing = Bytes::from(Message::Done.to_line()?);
        let rx = spawn_stream(
            Bytes::from(opening),
            streams,
            self.signal,
            |settled| match Message::from_settled(settled).to_line() {
                Ok(line) => Some(Bytes::from(line)),
                Err(e) => {
                    error!(error = %e, "dropping unencodable chunk");
                    None
                }
            },
            move || closing,
        );
        Ok(Body::Stream(rx))
    }
}

/// Splits incoming bytes into messages.
#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    buffer: BytesMut,
    line: usize,
}

impl NdjsonDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes; returns every message completed by them. A trailing partial
    /// line stays buffered.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<Message>, ProtocolError> {
        self.buffer.extend_from_slice(bytes);
        let mut messages = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line = self.buffer.split_to(pos + 1);
            if let Some(message) = self.decode_line(&line[..pos])? {
                messages.push(message);
            }
        }
        Ok(messages)
    }

    /// Decode whatever is left once the body ended.
    pub fn finish(mut self) -> Result<Option<Message>, ProtocolError> {
        let rest = std::mem::take(&mut self.buffer);
        self.decode_line(&rest)
    }

    fn decode_line(&mut self, line: &[u8]) -> Result<Option<Message>, ProtocolError> {
        self.line += 1;
        if line.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        serde_json::from_slice(line)
            .map(Some)
            .map_err(|source| ProtocolError::Json {
                line: self.line,
                source,
            })
    }
}

/// Loader data of one chain position as seen by the client.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteData {
    pub match_id: String,
    pub data: Value,
    pub error: Option<String>,
}

/// Client-side view of one navigation, built by applying messages in order.
#[derive(Debug, Default)]
pub struct NavigationState {
    routes: Vec<RouteData>,
    head: Option<HeadConfig>,
    defer_errors: Vec<(String, String, String)>,
    ready: bool,
    done: bool,
}

impl NavigationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one message.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::AfterDone`] for anything after `d`,
    /// [`ProtocolError::UnknownMatch`] for a chunk naming no received route.
    pub fn apply(&mut self, message: Message) -> Result<(), ProtocolError> {
        if self.done {
            return Err(ProtocolError::AfterDone(message.kind()));
        }

        match message {
            Message::Loader {
                match_id,
                data,
                error,
            } => {
                let route = RouteData {
                    match_id,
                    data,
                    error,
                };
                match self.routes.iter_mut().find(|r| r.match_id == route.match_id) {
                    Some(existing) => *existing = route,
                    None => self.routes.push(route),
                }
            }
            Message::Head { head } => self.head = Some(head),
            Message::Ready => self.ready = true,
            Message::Chunk {
                match_id,
                key,
                data,
            } => {
                let route = self.route_mut(&match_id)?;
                patch_placeholders(&mut route.data, &mut |k| (k == key).then(|| data.clone()));
            }
            Message::Error {
                match_id,
                key,
                error,
            } => {
                let route = self.route_mut(&match_id)?;
                let marker = error_marker(&error);
                patch_placeholders(&mut route.data, &mut |k| (k == key).then(|| marker.clone()));
                self.defer_errors.push((match_id, key, error));
            }
            Message::Done => self.done = true,
        }
        Ok(())
    }

    /// Decode and apply a whole body.
    pub fn from_body(body: &[u8]) -> Result<Self, ProtocolError> {
        let mut decoder = NdjsonDecoder::new();
        let mut state = Self::new();
        for message in decoder.push(body)? {
            state.apply(message)?;
        }
        if let Some(last) = decoder.finish()? {
            state.apply(last)?;
        }
        if !state.done {
            return Err(ProtocolError::Truncated);
        }
        Ok(state)
    }

    fn route_mut(&mut self, match_id: &str) -> Result<&mut RouteData, ProtocolError> {
        self.routes
            .iter_mut()
            .find(|r| r.match_id == match_id)
            .ok_or_else(|| ProtocolError::UnknownMatch(match_id.to_owned()))
    }

    pub fn routes(&self) -> &[RouteData] {
        &self.routes
    }

    pub fn route(&self, match_id: &str) -> Option<&RouteData> {
        self.routes.iter().find(|r| r.match_id == match_id)
    }

    pub fn head(&self) -> Option<&HeadConfig> {
        self.head.as_ref()
    }

    /// Rejection message of a streamed key.
    pub fn defer_error(&self, match_id: &str, key: &str) -> Option<&str> {
        self.defer_errors
            .iter()
            .find(|(m, k, _)| m == match_id && k == key)
            .map(|(_, _, e)| e.as_str())
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn is_done(&self) -> bool {
        self.done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{AbortController, Location, Params};
    use crate::defer::{DeferContext, DeferOptions};
    use crate::component::MatchedComponent;
    use crate::http::Request;
    use crate::loader::{LoaderPipeline, PipelineRequest};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn lines(body: &[u8]) -> Vec<Value> {
        body.split(|b| *b == b'\n')
            .filter(|l| !l.is_empty())
            .map(|l| serde_json::from_slice(l).unwrap())
            .collect()
    }

    fn kinds(lines: &[Value]) -> Vec<&str> {
        lines.iter().map(|l| l["t"].as_str().unwrap()).collect()
    }

    fn success(vp: &str, data: Value) -> LoaderResult {
        LoaderResult {
            virtual_path: vp.into(),
            outcome: LoaderOutcome::Success { data },
        }
    }

    // ── Wire shape ───────────────────────────────────────────────────────────

    #[test]
    fn messages_use_single_letter_tags() {
        let chunk = Message::Chunk {
            match_id: "/p".into(),
            key: "reviews".into(),
            data: json!([1]),
        };
        assert_eq!(
            serde_json::to_value(&chunk).unwrap(),
            json!({ "t": "c", "m": "/p", "k": "reviews", "d": [1] })
        );
        assert_eq!(serde_json::to_value(Message::Ready).unwrap(), json!({ "t": "r" }));
        assert_eq!(serde_json::to_value(Message::Done).unwrap(), json!({ "t": "d" }));

        let failed = Message::from_result(&LoaderResult {
            virtual_path: "/x".into(),
            outcome: LoaderOutcome::Error { error: "boom".into() },
        });
        assert_eq!(
            serde_json::to_value(&failed).unwrap(),
            json!({ "t": "l", "m": "/x", "d": null, "error": "boom" })
        );
    }

    // ── Encoder ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn static_response_omits_ready() {
        let matches = vec![success("/_layout", json!({})), success("/page", json!({ "a": 1 }))];
        let body = NdjsonEncoder::new().encode(&matches, Vec::new()).unwrap();
        assert!(matches!(body, Body::Full(_)));

        let lines = lines(&body.collect().await);
        assert_eq!(kinds(&lines), vec!["l", "l", "d"]);
        assert_eq!(lines[1]["d"], json!({ "a": 1 }));
    }

    #[tokio::test]
    async fn head_line_follows_loader_lines() {
        let body = NdjsonEncoder::new()
            .head(HeadConfig::titled("T"))
            .encode(&[success("/p", Value::Null)], Vec::new())
            .unwrap();
        let lines = lines(&body.collect().await);
        assert_eq!(kinds(&lines), vec!["l", "h", "d"]);
        assert_eq!(lines[1]["d"]["title"], "T");
    }

    #[tokio::test]
    async fn client_navigation_defer_arrives_as_chunk() {
        let chain = vec![
            Arc::new(MatchedComponent::new("/_layout").loader(|_ctx| async { Ok(json!({ "nav": [] })) })),
            Arc::new(MatchedComponent::new("/product").loader(|ctx| async move {
                let reviews = ctx.defer(
                    async {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Ok(json!(["solid"]))
                    },
                    DeferOptions::new().key("reviews"),
                );
                Ok(json!({ "name": "lamp", "reviews": reviews }))
            })),
        ];
        let request = Request::get("/product");
        let location = Location::new(&request, Params::new());
        let req = PipelineRequest::new(Arc::new(request), location).initial_load(false);
        let out = LoaderPipeline::new().run(&chain, req).await.unwrap();

        let body = NdjsonEncoder::new().encode(&out.matches, out.streams).unwrap();
        assert!(matches!(body, Body::Stream(_)));
        let lines = lines(&body.collect().await);

        assert_eq!(kinds(&lines), vec!["l", "l", "r", "c", "d"]);
        assert_eq!(lines[1]["d"]["reviews"], json!({ "$defer": "reviews" }));
        assert_eq!(
            lines[3],
            json!({ "t": "c", "m": "/product", "k": "reviews", "d": ["solid"] })
        );
    }

    #[tokio::test]
    async fn chunks_follow_resolution_order_and_errors_are_scoped() {
        let defer = DeferContext::new("/p", false, false);
        defer.defer(
            async {
                tokio::time::sleep(Duration::from_millis(40)).await;
                Ok(json!("slow"))
            },
            DeferOptions::new().key("slow"),
        );
        defer.defer(async { Err("unavailable".into()) }, DeferOptions::new().key("broken"));
        defer.defer(
            async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(json!("fast"))
            },
            DeferOptions::new().key("fast"),
        );

        let body = NdjsonEncoder::new()
            .encode(&[success("/p", Value::Null)], defer.take_streaming())
            .unwrap();
        let lines = lines(&body.collect().await);

        assert_eq!(kinds(&lines), vec!["l", "r", "e", "c", "c", "d"]);
        assert_eq!(lines[2]["k"], "broken");
        assert_eq!(lines[2]["error"], "unavailable");
        assert_eq!(lines[3]["k"], "fast");
        assert_eq!(lines[4]["k"], "slow");
    }

    #[tokio::test]
    async fn unresolved_registration_holds_done() {
        let defer = DeferContext::new("/p", false, false);
        defer.defer(std::future::pending(), DeferOptions::new().key("never"));

        let body = NdjsonEncoder::new()
            .encode(&[success("/p", Value::Null)], defer.take_streaming())
            .unwrap();
        let Body::Stream(mut rx) = body else {
            panic!("expected a streamed body");
        };

        let opening = rx.recv().await.unwrap();
        assert_eq!(kinds(&lines(&opening)), vec!["l", "r"]);
        let next = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(next.is_err(), "done must not be sent while a chunk is pending");
    }

    #[tokio::test]
    async fn abort_ends_stream_without_done() {
        let controller = AbortController::new();
        let defer = DeferContext::new("/p", false, false);
        defer.defer(std::future::pending(), DeferOptions::new().key("never"));

        let body = NdjsonEncoder::new()
            .signal(controller.signal())
            .encode(&[success("/p", Value::Null)], defer.take_streaming())
            .unwrap();
        controller.abort();

        let collected = tokio::time::timeout(Duration::from_secs(1), body.collect())
            .await
            .unwrap();
        let lines = lines(&collected);
        assert_eq!(kinds(&lines), vec!["l", "r"]);
    }

    // ── Decoder / client state ───────────────────────────────────────────────

    #[test]
    fn decoder_buffers_partial_lines() {
        let mut decoder = NdjsonDecoder::new();
        let first = decoder.push(br#"{"t":"l","m":"/p","d":{"x":1}}"#).unwrap();
        assert!(first.is_empty());

        let second = decoder.push(b"\n{\"t\":\"r\"}\n{\"t\":").unwrap();
        assert_eq!(second.len(), 2);
        assert_eq!(second[1], Message::Ready);

        let third = decoder.push(b"\"d\"}").unwrap();
        assert!(third.is_empty());
        assert_eq!(decoder.finish().unwrap(), Some(Message::Done));
    }

    #[test]
    fn decoder_reports_line_of_bad_json() {
        let mut decoder = NdjsonDecoder::new();
        let err = decoder.push(b"{\"t\":\"r\"}\nnot json\n").unwrap_err();
        assert!(matches!(err, ProtocolError::Json { line: 2, .. }));
    }

    #[test]
    fn navigation_state_patches_placeholders() {
        let body = concat!(
            r#"{"t":"l","m":"/p","d":{"reviews":{"$defer":"reviews"},"stock":{"$defer":"stock"}}}"#, "\n",
            r#"{"t":"r"}"#, "\n",
            r#"{"t":"e","m":"/p","k":"stock","error":"timeout"}"#, "\n",
            r#"{"t":"c","m":"/p","k":"reviews","d":[5]}"#, "\n",
            r#"{"t":"d"}"#, "\n",
        );
        let state = NavigationState::from_body(body.as_bytes()).unwrap();
        assert!(state.is_ready());
        assert!(state.is_done());
        let route = state.route("/p").unwrap();
        assert_eq!(
            route.data,
            json!({ "reviews": [5], "stock": { "$deferError": "timeout" } })
        );
        assert_eq!(state.defer_error("/p", "stock"), Some("timeout"));
    }

    #[test]
    fn navigation_state_rejects_after_done_and_unknown_matches() {
        let mut state = NavigationState::new();
        let err = state
            .apply(Message::Chunk {
                match_id: "/ghost".into(),
                key: "k".into(),
                data: Value::Null,
            })
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownMatch(ref m) if m == "/ghost"));

        state.apply(Message::Done).unwrap();
        let err = state.apply(Message::Ready).unwrap_err();
        assert!(matches!(err, ProtocolError::AfterDone("r")));
    }

    #[test]
    fn truncated_body_is_an_error() {
        let err = NavigationState::from_body(b"{\"t\":\"l\",\"m\":\"/p\",\"d\":1}\n").unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated));
    }
}
