//! Deferred loader values: awaited before the first byte, or streamed after it.
//!
//! A loader calls [`DeferContext::defer`] with an async computation and gets a
//! [`Deferred`] reference back. The reference is placed in the loader's data
//! where the value belongs; it serializes as a placeholder
//! (`{"$defer": "<key>"}`) until the computation settles, then as the value
//! itself (or `{"$deferError": "<message>"}`).
//!
//! Whether a registration is awaited or streamed is decided by
//! [`resolve_mode`]:
//!
//! | initial load | `stream_initial_defers` | `stream` option | mode   |
//! |--------------|-------------------------|-----------------|--------|
//! | yes          | no                      | unset           | await  |
//! | yes          | -                       | `true`          | stream |
//! | yes          | -                       | `false`         | await  |
//! | yes          | yes                     | unset           | stream |
//! | no           | -                       | unset / `true`  | stream |
//! | no           | -                       | `false`         | await  |

use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use parking_lot::Mutex;
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::BoxError;

/// Object key marking a pending deferred value.
pub const DEFER_MARKER: &str = "$defer";
/// Object key marking a deferred value whose computation failed.
pub const DEFER_ERROR_MARKER: &str = "$deferError";

/// How a registration is resolved relative to the initial response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferMode {
    /// Resolved before the initial response is produced.
    Await,
    /// Resolved after the initial response and delivered as a chunk.
    Stream,
}

/// Apply the decision table. An explicit `stream` option always wins; client
/// navigations default to streaming; initial loads default to awaiting unless
/// `stream_initial_defers` is set.
pub fn resolve_mode(initial_load: bool, stream_initial_defers: bool, stream: Option<bool>) -> DeferMode {
    match stream {
        Some(true) => DeferMode::Stream,
        Some(false) => DeferMode::Await,
        None if !initial_load || stream_initial_defers => DeferMode::Stream,
        None => DeferMode::Await,
    }
}

/// Options for one [`DeferContext::defer`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeferOptions {
    key: Option<String>,
    stream: Option<bool>,
}

impl DeferOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Explicit key; without one the key is generated from the call position.
    #[must_use]
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Force streaming (`true`) or awaiting (`false`).
    #[must_use]
    pub fn stream(mut self, stream: bool) -> Self {
        self.stream = Some(stream);
        self
    }
}

#[derive(Debug, Clone)]
enum DeferState {
    Pending,
    Resolved(Value),
    Rejected(String),
}

struct DeferredInner {
    key: String,
    virtual_path: Arc<str>,
    mode: DeferMode,
    state: Mutex<DeferState>,
}

/// Placeholder reference for a deferred value.
///
/// Clones share one slot: once the computation settles every clone (and every
/// later serialization) sees the settled value.
#[derive(Clone)]
pub struct Deferred {
    inner: Arc<DeferredInner>,
}

impl Deferred {
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Virtual path of the route whose loader registered this value.
    pub fn virtual_path(&self) -> &str {
        &self.inner.virtual_path
    }

    pub fn mode(&self) -> DeferMode {
        self.inner.mode
    }

    pub fn is_pending(&self) -> bool {
        matches!(*self.inner.state.lock(), DeferState::Pending)
    }

    /// The resolved value, if the computation succeeded.
    pub fn value(&self) -> Option<Value> {
        match &*self.inner.state.lock() {
            DeferState::Resolved(v) => Some(v.clone()),
            _ => None,
        }
    }

    /// The failure message, if the computation failed.
    pub fn error(&self) -> Option<String> {
        match &*self.inner.state.lock() {
            DeferState::Rejected(e) => Some(e.clone()),
            _ => None,
        }
    }

    /// `{"$defer": key}`
    pub fn placeholder(&self) -> Value {
        placeholder(self.key())
    }

    /// The value this reference stands for right now: the resolved value, an
    /// error marker, or the placeholder.
    pub fn current(&self) -> Value {
        match &*self.inner.state.lock() {
            DeferState::Pending => self.placeholder(),
            DeferState::Resolved(v) => v.clone(),
            DeferState::Rejected(e) => error_marker(e),
        }
    }

    pub(crate) fn settle(&self, outcome: Result<Value, String>) {
        let mut state = self.inner.state.lock();
        *state = match outcome {
            Ok(v) => DeferState::Resolved(v),
            Err(e) => DeferState::Rejected(e),
        };
    }
}

impl Serialize for Deferred {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.current().serialize(serializer)
    }
}

impl From<Deferred> for Value {
    fn from(deferred: Deferred) -> Self {
        deferred.current()
    }
}

impl fmt::Debug for Deferred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("key", &self.inner.key)
            .field("virtual_path", &self.inner.virtual_path)
            .field("mode", &self.inner.mode)
            .field("state", &*self.inner.state.lock())
            .finish()
    }
}

/// `{"$defer": key}`
pub fn placeholder(key: &str) -> Value {
    let mut map = Map::with_capacity(1);
    map.insert(DEFER_MARKER.to_owned(), Value::String(key.to_owned()));
    Value::Object(map)
}

/// `{"$deferError": message}`
pub fn error_marker(message: &str) -> Value {
    let mut map = Map::with_capacity(1);
    map.insert(DEFER_ERROR_MARKER.to_owned(), Value::String(message.to_owned()));
    Value::Object(map)
}

/// The key of a placeholder object, if `value` is one.
pub fn placeholder_key(value: &Value) -> Option<&str> {
    match value {
        Value::Object(map) if map.len() == 1 => map.get(DEFER_MARKER)?.as_str(),
        _ => None,
    }
}

/// Walk `value` and replace every placeholder for which `replacement` returns
/// `Some`. Returns how many placeholders were replaced.
pub fn patch_placeholders<F>(value: &mut Value, replacement: &mut F) -> usize
where
    F: FnMut(&str) -> Option<Value>,
{
    if let Some(new) = placeholder_key(value).and_then(|key| replacement(key)) {
        *value = new;
        return 1;
    }
    match value {
        Value::Array(items) => items
            .iter_mut()
            .map(|v| patch_placeholders(v, replacement))
            .sum(),
        Value::Object(map) => map
            .values_mut()
            .map(|v| patch_placeholders(v, replacement))
            .sum(),
        _ => 0,
    }
}

type Computation = BoxFuture<'static, Result<Value, BoxError>>;

/// The outcome of a computation that is already running.
type Settlement = BoxFuture<'static, Result<Value, String>>;

/// Start `computation` on the current runtime. Dropping the returned future
/// cancels it. Outside a runtime it runs when first polled.
fn start(computation: Computation) -> Settlement {
    let settle = settle_computation(computation);
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            let (work, outcome) = settle.remote_handle();
            runtime.spawn(work);
            outcome.boxed()
        }
        Err(_) => settle.boxed(),
    }
}

/// Run a computation to completion, turning errors and panics into a message.
pub(crate) async fn settle_computation(computation: Computation) -> Result<Value, String> {
    match AssertUnwindSafe(computation).catch_unwind().await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(e.to_string()),
        Err(panic) => Err(panic_message(panic.as_ref())),
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panicked".to_owned()
    }
}

/// A streaming registration handed to the response driver.
pub struct PendingStream {
    pub handle: Deferred,
    pub(crate) settlement: Settlement,
}

impl PendingStream {
    /// Wait for the computation and record its outcome on the handle.
    pub async fn resolve(self) -> Result<Value, String> {
        let outcome = self.settlement.await;
        self.handle.settle(outcome.clone());
        outcome
    }
}

impl fmt::Debug for PendingStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingStream")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

struct Registration {
    handle: Deferred,
    // Taken once the registration is awaited or handed off for streaming.
    settlement: Option<Settlement>,
}

#[derive(Default)]
struct Registrations {
    next_index: usize,
    entries: Vec<Registration>,
}

/// Deferred registrations of one route's loader invocation.
#[derive(Clone)]
pub struct DeferContext {
    virtual_path: Arc<str>,
    initial_load: bool,
    stream_initial_defers: bool,
    registrations: Arc<Mutex<Registrations>>,
}

impl DeferContext {
    pub fn new(virtual_path: impl Into<Arc<str>>, initial_load: bool, stream_initial_defers: bool) -> Self {
        Self {
            virtual_path: virtual_path.into(),
            initial_load,
            stream_initial_defers,
            registrations: Arc::default(),
        }
    }

    /// Register `computation` and return its placeholder reference.
    ///
    /// The computation starts right away, concurrently with the rest of the
    /// loader and its siblings. Re-using an explicit key replaces (and
    /// cancels) the earlier registration.
    pub fn defer<F>(&self, computation: F, options: DeferOptions) -> Deferred
    where
        F: Future<Output = Result<Value, BoxError>> + Send + 'static,
    {
        let mode = resolve_mode(self.initial_load, self.stream_initial_defers, options.stream);
        let mut regs = self.registrations.lock();

        let index = regs.next_index;
        regs.next_index += 1;
        let key = options.key.unwrap_or_else(|| format!("_{index}"));

        if let Some(pos) = regs.entries.iter().position(|r| r.handle.key() == key) {
            warn!(virtual_path = %self.virtual_path, key = %key, "deferred key registered twice, replacing");
            regs.entries.remove(pos);
        }

        let handle = Deferred {
            inner: Arc::new(DeferredInner {
                key,
                virtual_path: Arc::clone(&self.virtual_path),
                mode,
                state: Mutex::new(DeferState::Pending),
            }),
        };
        debug!(virtual_path = %self.virtual_path, key = %handle.key(), ?mode, "deferred value registered");

        regs.entries.push(Registration {
            handle: handle.clone(),
            settlement: Some(start(Box::pin(computation))),
        });
        handle
    }

    pub fn virtual_path(&self) -> &str {
        &self.virtual_path
    }

    /// Every registration, in registration order.
    pub fn registrations(&self) -> Vec<Deferred> {
        self.registrations
            .lock()
            .entries
            .iter()
            .map(|r| r.handle.clone())
            .collect()
    }

    pub fn has_streaming(&self) -> bool {
        self.registrations
            .lock()
            .entries
            .iter()
            .any(|r| r.handle.mode() == DeferMode::Stream)
    }

    /// Resolve the awaited registrations concurrently.
    ///
    /// Returns `key → value` for the ones that succeeded; failed computations
    /// are left out and their failure is readable through [`Deferred::error`].
    /// Streaming registrations are not touched.
    pub async fn await_deferred(&self) -> HashMap<String, Value> {
        let pending: Vec<(Deferred, Settlement)> = {
            let mut regs = self.registrations.lock();
            regs.entries
                .iter_mut()
                .filter(|r| r.handle.mode() == DeferMode::Await)
                .filter_map(|r| r.settlement.take().map(|s| (r.handle.clone(), s)))
                .collect()
        };

        let settled = join_all(
            pending
                .into_iter()
                .map(|(handle, settlement)| settlement.map(move |outcome| (handle, outcome))),
        )
        .await;

        let mut resolved = HashMap::with_capacity(settled.len());
        for (handle, outcome) in settled {
            match &outcome {
                Ok(value) => {
                    resolved.insert(handle.key().to_owned(), value.clone());
                }
                Err(e) => {
                    debug!(virtual_path = %handle.virtual_path(), key = %handle.key(), error = %e, "awaited deferred value failed");
                }
            }
            handle.settle(outcome);
        }
        resolved
    }

    /// Hand the streaming registrations to the response driver.
    pub fn take_streaming(&self) -> Vec<PendingStream> {
        let mut regs = self.registrations.lock();
        regs.entries
            .iter_mut()
            .filter(|r| r.handle.mode() == DeferMode::Stream)
            .filter_map(|r| {
                r.settlement.take().map(|settlement| PendingStream {
                    handle: r.handle.clone(),
                    settlement,
                })
            })
            .collect()
    }

    /// Replace placeholders of settled registrations inside `data`.
    pub fn inline_settled(&self, data: &mut Value) -> usize {
        let settled: HashMap<String, Value> = self
            .registrations()
            .into_iter()
            .filter(|d| !d.is_pending())
            .map(|d| (d.key().to_owned(), d.current()))
            .collect();
        if settled.is_empty() {
            return 0;
        }
        patch_placeholders(data, &mut |key| settled.get(key).cloned())
    }
}

impl fmt::Debug for DeferContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferContext")
            .field("virtual_path", &self.virtual_path)
            .field("initial_load", &self.initial_load)
            .field("registrations", &self.registrations.lock().entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn ok(value: Value) -> impl Future<Output = Result<Value, BoxError>> + Send + 'static {
        async move { Ok(value) }
    }

    fn fail(message: &'static str) -> impl Future<Output = Result<Value, BoxError>> + Send + 'static {
        async move { Err(message.into()) }
    }

    #[test]
    fn decision_table() {
        use DeferMode::{Await, Stream};
        // (initial load, stream initial defers, explicit stream) → mode
        let rows = [
            (true, false, None, Await),
            (true, false, Some(true), Stream),
            (true, false, Some(false), Await),
            (true, true, None, Stream),
            (true, true, Some(false), Await),
            (false, false, None, Stream),
            (false, false, Some(true), Stream),
            (false, true, Some(true), Stream),
            (false, false, Some(false), Await),
            (false, true, Some(false), Await),
        ];
        for (initial, stream_initial, explicit, expected) in rows {
            assert_eq!(
                resolve_mode(initial, stream_initial, explicit),
                expected,
                "initial={initial} stream_initial={stream_initial} explicit={explicit:?}"
            );
        }
    }

    #[test]
    fn keys_are_explicit_or_positional() {
        let ctx = DeferContext::new("/page", true, false);
        let a = ctx.defer(ok(json!(1)), DeferOptions::new());
        let b = ctx.defer(ok(json!(2)), DeferOptions::new().key("reviews"));
        let c = ctx.defer(ok(json!(3)), DeferOptions::new());
        assert_eq!(a.key(), "_0");
        assert_eq!(b.key(), "reviews");
        assert_eq!(c.key(), "_2");
        assert_eq!(a.virtual_path(), "/page");
    }

    #[test]
    fn pending_reference_serializes_as_placeholder() {
        let ctx = DeferContext::new("/page", false, false);
        let reviews = ctx.defer(ok(json!([])), DeferOptions::new().key("reviews"));
        let data = json!({ "title": "Hat", "reviews": reviews });
        assert_eq!(data["reviews"], json!({ "$defer": "reviews" }));
        assert_eq!(placeholder_key(&data["reviews"]), Some("reviews"));
    }

    #[tokio::test]
    async fn await_deferred_resolves_only_awaited_subset() {
        let ctx = DeferContext::new("/page", true, false);
        let price = ctx.defer(ok(json!(10)), DeferOptions::new().key("price"));
        let stock = ctx.defer(ok(json!(3)), DeferOptions::new().key("stock").stream(true));

        let resolved = ctx.await_deferred().await;
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved["price"], json!(10));
        assert_eq!(price.value(), Some(json!(10)));
        assert!(stock.is_pending());
        assert!(ctx.has_streaming());
    }

    #[tokio::test]
    async fn await_deferred_excludes_rejections() {
        let ctx = DeferContext::new("/page", true, false);
        let good = ctx.defer(ok(json!("fine")), DeferOptions::new().key("good"));
        let bad = ctx.defer(fail("backend down"), DeferOptions::new().key("bad"));
        let boom = ctx.defer(
            async { panic!("exploded") },
            DeferOptions::new().key("boom"),
        );

        let resolved = ctx.await_deferred().await;
        assert_eq!(resolved.keys().collect::<Vec<_>>(), vec!["good"]);
        assert_eq!(good.value(), Some(json!("fine")));
        assert_eq!(bad.error().as_deref(), Some("backend down"));
        assert_eq!(boom.error().as_deref(), Some("exploded"));
        assert_eq!(bad.current(), json!({ "$deferError": "backend down" }));
    }

    #[tokio::test]
    async fn awaited_values_resolve_concurrently() {
        let ctx = DeferContext::new("/page", true, false);
        for i in 0..5 {
            ctx.defer(
                async move {
                    tokio::time::sleep(Duration::from_millis(60)).await;
                    Ok(json!(i))
                },
                DeferOptions::new(),
            );
        }
        let start = tokio::time::Instant::now();
        let resolved = ctx.await_deferred().await;
        assert_eq!(resolved.len(), 5);
        assert!(start.elapsed() < Duration::from_millis(250));
    }

    #[tokio::test]
    async fn reference_is_mutated_in_place_and_inlined() {
        let ctx = DeferContext::new("/page", true, false);
        let price = ctx.defer(ok(json!(10)), DeferOptions::new().key("price"));
        let broken = ctx.defer(fail("nope"), DeferOptions::new().key("broken"));
        let later = ctx.defer(ok(json!(1)), DeferOptions::new().key("later").stream(true));
        let mut data = json!({
            "price": price.clone(),
            "nested": [{ "broken": broken }],
            "later": later,
        });

        ctx.await_deferred().await;
        assert_eq!(serde_json::to_value(&price).unwrap(), json!(10));

        assert_eq!(ctx.inline_settled(&mut data), 2);
        assert_eq!(
            data,
            json!({
                "price": 10,
                "nested": [{ "broken": { "$deferError": "nope" } }],
                "later": { "$defer": "later" },
            })
        );
    }

    #[tokio::test]
    async fn take_streaming_hands_off_once() {
        let ctx = DeferContext::new("/page", false, false);
        ctx.defer(ok(json!("a")), DeferOptions::new().key("a"));
        ctx.defer(ok(json!("b")), DeferOptions::new().key("b").stream(false));

        let streams = ctx.take_streaming();
        assert_eq!(streams.len(), 1);
        assert!(ctx.take_streaming().is_empty());

        let stream = streams.into_iter().next().unwrap();
        let handle = stream.handle.clone();
        assert_eq!(stream.resolve().await, Ok(json!("a")));
        assert_eq!(handle.value(), Some(json!("a")));
    }

    #[tokio::test]
    async fn computation_starts_when_deferred() {
        let ctx = DeferContext::new("/page", false, false);
        let start = tokio::time::Instant::now();
        ctx.defer(
            async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(json!("late"))
            },
            DeferOptions::new().key("slow"),
        );

        // The rest of the loader (and its siblings) keeps working meanwhile.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let stream = ctx.take_streaming().into_iter().next().unwrap();
        assert_eq!(stream.resolve().await, Ok(json!("late")));
        assert!(start.elapsed() < Duration::from_millis(300), "{:?}", start.elapsed());
    }

    #[tokio::test]
    async fn dropped_registration_cancels_its_computation() {
        let finished = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ctx = DeferContext::new("/page", false, false);
        let flag = Arc::clone(&finished);
        ctx.defer(
            async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                flag.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(json!(null))
            },
            DeferOptions::new().key("x"),
        );
        drop(ctx.take_streaming());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!finished.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn duplicate_key_replaces_registration() {
        let ctx = DeferContext::new("/page", true, false);
        ctx.defer(ok(json!(1)), DeferOptions::new().key("x"));
        ctx.defer(ok(json!(2)), DeferOptions::new().key("x"));
        assert_eq!(ctx.registrations().len(), 1);
    }

    #[test]
    fn patch_placeholders_ignores_lookalikes() {
        let mut data = json!({
            "a": { "$defer": "k", "other": 1 },
            "b": { "$defer": "k" },
        });
        let n = patch_placeholders(&mut data, &mut |key| (key == "k").then(|| json!("v")));
        assert_eq!(n, 1);
        assert_eq!(data["b"], json!("v"));
        assert_eq!(data["a"]["other"], json!(1));
    }
}
