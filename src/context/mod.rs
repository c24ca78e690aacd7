//! Per-request context: the explicit, request-scoped handle threaded through
//! middleware, the loader pipeline and rendering.
//!
//! Nothing here is global: a [`Context`] is created when a request enters the
//! app and dropped when its response (including any streamed tail) is finished.
//!
//! - [`Extensions`]: type-erased map used for environment bindings and
//!   middleware-injected request state.
//! - [`Params`] / [`ParamValue`]: path parameters captured by the route tree.
//! - [`Location`]: pathname, search, hash and params handed to hooks.
//! - [`AbortController`] / [`AbortSignal`]: one cancellation signal per request.

use std::{
    any::{Any, TypeId},
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use serde::Serialize;
use tokio::sync::watch;

use crate::Request;

/// Type-erased extensions map: used to inject per-request state and
/// environment bindings without the pipeline knowing their types.
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    /// Create a new empty extensions map
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    /// Insert a value, replacing any previous value of the same type.
    pub fn insert<T>(&mut self, value: T)
    where
        T: Send + Sync + 'static,
    {
        self.map.insert(TypeId::of::<T>(), Box::new(value));
    }

    /// Builder-style [`insert`](Self::insert).
    #[must_use]
    pub fn with<T>(mut self, value: T) -> Self
    where
        T: Send + Sync + 'static,
    {
        self.insert(value);
        self
    }

    /// Get a value from the extensions map
    pub fn get<T>(&self) -> Option<&T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    /// Remove a value from the extensions map
    pub fn remove<T>(&mut self) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl std::fmt::Debug for Extensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extensions")
            .field("len", &self.map.len())
            .finish()
    }
}

/// A captured path parameter. Catch-all forms capture every remaining segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    One(String),
    Many(Vec<String>),
}

impl ParamValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::One(s) => Some(s),
            ParamValue::Many(_) => None,
        }
    }

    pub fn as_slice(&self) -> Option<&[String]> {
        match self {
            ParamValue::One(_) => None,
            ParamValue::Many(v) => Some(v),
        }
    }
}

/// Path parameters extracted from the matched route, one flat map for the whole descent.
#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Params {
    map: BTreeMap<String, ParamValue>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: ParamValue) {
        self.map.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.map.get(key)
    }

    /// Value of a single-segment param.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(ParamValue::as_str)
    }

    /// Segments captured by a catch-all param.
    pub fn get_all(&self, key: &str) -> Option<&[String]> {
        self.get(key).and_then(ParamValue::as_slice)
    }

    pub fn remove(&mut self, key: &str) -> Option<ParamValue> {
        self.map.remove(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Where the request points: handed to every preloader, loader and head hook.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Location {
    pub pathname: String,
    /// Raw query string without the leading `?`.
    pub search: Option<String>,
    /// Fragments are never sent to the server; kept for client-built locations.
    pub hash: Option<String>,
    pub params: Params,
}

impl Location {
    pub fn new(request: &Request, params: Params) -> Self {
        Self {
            pathname: request.path().to_owned(),
            search: request.query_string().map(str::to_owned),
            hash: None,
            params,
        }
    }
}

/// Triggers cancellation of one request.
#[derive(Debug)]
pub struct AbortController {
    tx: watch::Sender<bool>,
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortController {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// A signal observing this controller.
    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            rx: Some(self.tx.subscribe()),
        }
    }

    /// Abort the request. Idempotent.
    pub fn abort(&self) {
        self.tx.send_replace(true);
    }
}

/// Observes cancellation of the request it belongs to.
///
/// Cloning is cheap; every loader, preloader and deferred computation of a
/// request shares the same signal.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    // `None` for a signal that can never fire.
    rx: Option<watch::Receiver<bool>>,
}

impl AbortSignal {
    /// A signal that never aborts.
    pub fn never() -> Self {
        Self { rx: None }
    }

    pub fn is_aborted(&self) -> bool {
        self.rx.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Resolves once the request is aborted. Pends forever when the controller is
    /// dropped without aborting.
    pub async fn aborted(&self) {
        let Some(rx) = &self.rx else {
            return std::future::pending().await;
        };
        let mut rx = rx.clone();
        let closed = rx.wait_for(|aborted| *aborted).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }
}

/// Per-request context: the request plus everything scoped to its lifetime.
#[derive(Debug)]
pub struct Context {
    request: Arc<Request>,
    request_id: String,
    nonce: String,
    signal: AbortSignal,
    env: Arc<Extensions>,
    extensions: Extensions,
}

impl Context {
    /// Create a new context from a request, with no environment bindings and a
    /// signal that never fires.
    pub fn new(request: Request) -> Self {
        Self::with_env(request, Arc::new(Extensions::new()), AbortSignal::never())
    }

    pub fn with_env(request: Request, env: Arc<Extensions>, signal: AbortSignal) -> Self {
        Self {
            request: Arc::new(request),
            request_id: uuid::Uuid::new_v4().to_string(),
            nonce: uuid::Uuid::new_v4().simple().to_string(),
            signal,
            env,
            extensions: Extensions::new(),
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Shared handle to the request for hooks that outlive a borrow.
    pub fn request_arc(&self) -> Arc<Request> {
        Arc::clone(&self.request)
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// CSP nonce for inline scripts emitted while rendering this request.
    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    pub fn signal(&self) -> &AbortSignal {
        &self.signal
    }

    /// Environment bindings shared by every request of the app.
    pub fn env(&self) -> &Arc<Extensions> {
        &self.env
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }
}
