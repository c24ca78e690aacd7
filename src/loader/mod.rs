//! Loader pipeline: run the hooks of a matched chain for one request.
//!
//! Stages, in order:
//!
//! 1. **Authentication**: if any position declares an [`AuthMode`], the app's
//!    authenticate hook runs once for the whole chain.
//! 2. **Preloaders**: sequentially, root to leaf. Each sees the flat merge of
//!    everything its ancestors returned; its own return value is merged on top
//!    for its descendants.
//! 3. **Authorization**: `authorize` hooks in chain order, after preloaders and
//!    before any loader. The first `false` ends the request as forbidden.
//! 4. **Loaders**: concurrently across the chain, joined with
//!    [`join_all`]. A failing (or panicking) loader only fails its own
//!    position. Awaited deferred values are resolved inside each position's
//!    task and inlined into its data; streaming ones are handed back in
//!    [`PipelineOutput::streams`].
//!
//! Every stage races the request's [`AbortSignal`]; an abort drops the
//! in-flight futures and yields [`PipelineError::Aborted`].

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::BoxError;
use crate::cache::TrackedQueryClient;
use crate::component::{AuthMode, ContextMap, MatchedComponent};
use crate::context::{AbortSignal, Extensions, Location};
use crate::defer::{
    DeferContext, DeferOptions, Deferred, PendingStream, panic_message, settle_computation,
};
use crate::http::{Request, StatusCode};

/// Request-wide failures. Loader failures are not errors here; they are
/// reported per position in [`LoaderResult`].
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("authentication required")]
    Unauthenticated,

    #[error("authentication failed: {0}")]
    Authentication(#[source] BoxError),

    #[error("access to `{virtual_path}` is forbidden")]
    Forbidden { virtual_path: String },

    #[error("preloader of `{virtual_path}` failed: {message}")]
    Preloader {
        virtual_path: String,
        message: String,
    },

    #[error("request aborted")]
    Aborted,
}

impl PipelineError {
    /// Status code the app answers with.
    pub fn status(&self) -> StatusCode {
        match self {
            PipelineError::Unauthenticated => StatusCode::Unauthorized,
            PipelineError::Forbidden { .. } => StatusCode::Forbidden,
            PipelineError::Aborted => StatusCode::ServiceUnavailable,
            PipelineError::Authentication(_) | PipelineError::Preloader { .. } => {
                StatusCode::InternalServerError
            }
        }
    }
}

/// Outcome of one position's loader.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum LoaderOutcome {
    Success { data: Value },
    Error { error: String },
}

/// A loader outcome keyed by the position's virtual path.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoaderResult {
    pub virtual_path: String,
    #[serde(flatten)]
    pub outcome: LoaderOutcome,
}

impl LoaderResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, LoaderOutcome::Success { .. })
    }

    pub fn data(&self) -> Option<&Value> {
        match &self.outcome {
            LoaderOutcome::Success { data } => Some(data),
            LoaderOutcome::Error { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            LoaderOutcome::Success { .. } => None,
            LoaderOutcome::Error { error } => Some(error),
        }
    }
}

/// What the authenticate hook sees.
#[derive(Debug, Clone)]
pub struct AuthRequest {
    pub request: Arc<Request>,
    pub env: Arc<Extensions>,
}

pub type AuthenticateFn =
    Arc<dyn Fn(AuthRequest) -> BoxFuture<'static, Result<Option<Value>, BoxError>> + Send + Sync>;

/// Passed to a preloader.
#[derive(Debug, Clone)]
pub struct PreloaderContext {
    virtual_path: Arc<str>,
    request: Arc<Request>,
    location: Arc<Location>,
    env: Arc<Extensions>,
    signal: AbortSignal,
    context: Arc<ContextMap>,
    auth: Option<Arc<Value>>,
}

impl PreloaderContext {
    pub fn virtual_path(&self) -> &str {
        &self.virtual_path
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    pub fn env(&self) -> &Extensions {
        &self.env
    }

    pub fn signal(&self) -> &AbortSignal {
        &self.signal
    }

    /// Flat merge of everything the ancestors' preloaders returned.
    pub fn context(&self) -> &ContextMap {
        &self.context
    }

    pub fn auth(&self) -> Option<&Value> {
        self.auth.as_deref()
    }
}

/// Passed to an authorize hook.
#[derive(Debug, Clone)]
pub struct AuthorizeContext {
    pub virtual_path: Arc<str>,
    pub location: Arc<Location>,
    pub auth: Option<Arc<Value>>,
    /// Preloader context up to and including this position.
    pub context: Arc<ContextMap>,
}

/// Passed to a loader.
#[derive(Debug, Clone)]
pub struct LoaderContext {
    virtual_path: Arc<str>,
    request: Arc<Request>,
    location: Arc<Location>,
    env: Arc<Extensions>,
    signal: AbortSignal,
    context: Arc<ContextMap>,
    auth: Option<Arc<Value>>,
    defer: DeferContext,
    query: TrackedQueryClient,
}

impl LoaderContext {
    pub fn virtual_path(&self) -> &str {
        &self.virtual_path
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    pub fn env(&self) -> &Extensions {
        &self.env
    }

    pub fn signal(&self) -> &AbortSignal {
        &self.signal
    }

    /// Preloader context up to and including this position's own preloader.
    pub fn context(&self) -> &ContextMap {
        &self.context
    }

    pub fn auth(&self) -> Option<&Value> {
        self.auth.as_deref()
    }

    /// Request-scoped data cache; calls are recorded for client hydration.
    pub fn query(&self) -> &TrackedQueryClient {
        &self.query
    }

    /// Register a deferred value for this position.
    pub fn defer<F>(&self, computation: F, options: DeferOptions) -> Deferred
    where
        F: Future<Output = Result<Value, BoxError>> + Send + 'static,
    {
        self.defer.defer(computation, options)
    }
}

/// Inputs of one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub request: Arc<Request>,
    pub location: Arc<Location>,
    pub env: Arc<Extensions>,
    pub signal: AbortSignal,
    /// `true` while the full document is being built.
    pub initial_load: bool,
    pub stream_initial_defers: bool,
    /// Restrict loader execution to these virtual paths.
    pub match_ids: Option<Vec<String>>,
    pub query: TrackedQueryClient,
}

impl PipelineRequest {
    pub fn new(request: Arc<Request>, location: Location) -> Self {
        Self {
            request,
            location: Arc::new(location),
            env: Arc::new(Extensions::new()),
            signal: AbortSignal::never(),
            initial_load: true,
            stream_initial_defers: false,
            match_ids: None,
            query: TrackedQueryClient::default(),
        }
    }

    #[must_use]
    pub fn env(mut self, env: Arc<Extensions>) -> Self {
        self.env = env;
        self
    }

    #[must_use]
    pub fn signal(mut self, signal: AbortSignal) -> Self {
        self.signal = signal;
        self
    }

    #[must_use]
    pub fn initial_load(mut self, initial_load: bool) -> Self {
        self.initial_load = initial_load;
        self
    }

    #[must_use]
    pub fn stream_initial_defers(mut self, stream: bool) -> Self {
        self.stream_initial_defers = stream;
        self
    }

    #[must_use]
    pub fn match_ids(mut self, ids: Option<Vec<String>>) -> Self {
        self.match_ids = ids;
        self
    }

    #[must_use]
    pub fn query(mut self, query: TrackedQueryClient) -> Self {
        self.query = query;
        self
    }

    fn selects(&self, virtual_path: &str) -> bool {
        self.match_ids
            .as_ref()
            .is_none_or(|ids| ids.iter().any(|id| id == virtual_path))
    }
}

/// Everything the pipeline produced for one request.
#[derive(Debug, Default)]
pub struct PipelineOutput {
    /// One result per executed position, root first.
    pub matches: Vec<LoaderResult>,
    /// Flat preloader context after the whole chain.
    pub preloader_context: ContextMap,
    pub auth: Option<Value>,
    /// Every deferred registration of every successful loader.
    pub deferred: Vec<Deferred>,
    /// Registrations still to be resolved after the initial response.
    pub streams: Vec<PendingStream>,
}

impl PipelineOutput {
    pub fn has_streaming(&self) -> bool {
        !self.streams.is_empty()
    }

    pub fn result(&self, virtual_path: &str) -> Option<&LoaderResult> {
        self.matches.iter().find(|r| r.virtual_path == virtual_path)
    }
}

/// Runs preloaders and loaders for a matched chain.
#[derive(Clone, Default)]
pub struct LoaderPipeline {
    authenticate: Option<AuthenticateFn>,
}

impl std::fmt::Debug for LoaderPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoaderPipeline")
            .field("authenticate", &self.authenticate.is_some())
            .finish()
    }
}

impl LoaderPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the authenticate hook. It returns the identity, or `None` for
    /// anonymous requests.
    #[must_use]
    pub fn authenticate<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(AuthRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Value>, BoxError>> + Send + 'static,
    {
        self.authenticate = Some(Arc::new(move |req| Box::pin(f(req))));
        self
    }

    /// Run the chain.
    ///
    /// # Errors
    ///
    /// Only request-wide failures: [`PipelineError::Unauthenticated`],
    /// [`PipelineError::Authentication`], [`PipelineError::Forbidden`],
    /// [`PipelineError::Preloader`] and [`PipelineError::Aborted`].
    pub async fn run(
        &self,
        chain: &[Arc<MatchedComponent>],
        req: PipelineRequest,
    ) -> Result<PipelineOutput, PipelineError> {
        if req.signal.is_aborted() {
            return Err(PipelineError::Aborted);
        }

        let auth = self.authenticate_chain(chain, &req).await?;
        let snapshots = run_preloaders(chain, &req, auth.as_ref()).await?;
        authorize_chain(chain, &snapshots, &req, auth.as_ref()).await?;

        let tasks = chain
            .iter()
            .zip(&snapshots)
            .filter(|(component, _)| req.selects(component.virtual_path()))
            .map(|(component, snapshot)| {
                run_loader(component, Arc::clone(snapshot), &req, auth.clone())
            });

        let settled = until_aborted(&req.signal, join_all(tasks)).await?;

        let mut output = PipelineOutput {
            preloader_context: snapshots
                .last()
                .map(|s| (**s).clone())
                .unwrap_or_default(),
            auth: auth.map(|a| (*a).clone()),
            ..PipelineOutput::default()
        };
        for (result, defer) in settled {
            if result.is_success() {
                output.deferred.extend(defer.registrations());
                output.streams.extend(defer.take_streaming());
            }
            output.matches.push(result);
        }

        debug!(
            positions = output.matches.len(),
            streams = output.streams.len(),
            "loader pipeline finished"
        );
        Ok(output)
    }

    async fn authenticate_chain(
        &self,
        chain: &[Arc<MatchedComponent>],
        req: &PipelineRequest,
    ) -> Result<Option<Arc<Value>>, PipelineError> {
        let modes: Vec<AuthMode> = chain.iter().filter_map(|c| c.auth_mode()).collect();
        if modes.is_empty() {
            return Ok(None);
        }
        let required = modes.contains(&AuthMode::Required);

        let identity = match &self.authenticate {
            Some(authenticate) => {
                let request = AuthRequest {
                    request: Arc::clone(&req.request),
                    env: Arc::clone(&req.env),
                };
                until_aborted(&req.signal, authenticate(request))
                    .await?
                    .map_err(PipelineError::Authentication)?
            }
            None => {
                warn!("chain declares authentication but no authenticate hook is installed");
                None
            }
        };

        match identity {
            None if required => Err(PipelineError::Unauthenticated),
            identity => Ok(identity.map(Arc::new)),
        }
    }
}

// Preloader context snapshot per position, accumulated root to leaf.
async fn run_preloaders(
    chain: &[Arc<MatchedComponent>],
    req: &PipelineRequest,
    auth: Option<&Arc<Value>>,
) -> Result<Vec<Arc<ContextMap>>, PipelineError> {
    let mut accumulated = Arc::new(ContextMap::new());
    let mut snapshots = Vec::with_capacity(chain.len());

    for component in chain {
        if let Some(preloader) = &component.preloader {
            let ctx = PreloaderContext {
                virtual_path: component.virtual_path().into(),
                request: Arc::clone(&req.request),
                location: Arc::clone(&req.location),
                env: Arc::clone(&req.env),
                signal: req.signal.clone(),
                context: Arc::clone(&accumulated),
                auth: auth.cloned(),
            };
            let preloader = Arc::clone(preloader);
            let run = AssertUnwindSafe(async move { preloader(ctx).await }).catch_unwind();

            let contributed = match until_aborted(&req.signal, run).await? {
                Ok(Ok(map)) => map,
                Ok(Err(e)) => return Err(preloader_failed(component, e.to_string())),
                Err(panic) => return Err(preloader_failed(component, panic_message(panic.as_ref()))),
            };
            debug!(virtual_path = %component.virtual_path(), keys = contributed.len(), "preloader finished");

            if !contributed.is_empty() {
                let mut next = (*accumulated).clone();
                next.extend(contributed);
                accumulated = Arc::new(next);
            }
        }
        snapshots.push(Arc::clone(&accumulated));
    }

    Ok(snapshots)
}

fn preloader_failed(component: &MatchedComponent, message: String) -> PipelineError {
    warn!(virtual_path = %component.virtual_path(), error = %message, "preloader failed");
    PipelineError::Preloader {
        virtual_path: component.virtual_path().to_owned(),
        message,
    }
}

async fn authorize_chain(
    chain: &[Arc<MatchedComponent>],
    snapshots: &[Arc<ContextMap>],
    req: &PipelineRequest,
    auth: Option<&Arc<Value>>,
) -> Result<(), PipelineError> {
    for (component, snapshot) in chain.iter().zip(snapshots) {
        let Some(authorize) = &component.authorize else {
            continue;
        };
        let ctx = AuthorizeContext {
            virtual_path: component.virtual_path().into(),
            location: Arc::clone(&req.location),
            auth: auth.cloned(),
            context: Arc::clone(snapshot),
        };
        let authorize = Arc::clone(authorize);
        let run = AssertUnwindSafe(async move { authorize(ctx).await }).catch_unwind();

        // A panicking hook denies access.
        let allowed = match until_aborted(&req.signal, run).await? {
            Ok(allowed) => allowed,
            Err(panic) => {
                warn!(virtual_path = %component.virtual_path(), error = %panic_message(panic.as_ref()), "authorize hook panicked");
                false
            }
        };
        if !allowed {
            warn!(virtual_path = %component.virtual_path(), "authorization denied");
            return Err(PipelineError::Forbidden {
                virtual_path: component.virtual_path().to_owned(),
            });
        }
    }
    Ok(())
}

async fn run_loader(
    component: &Arc<MatchedComponent>,
    context: Arc<ContextMap>,
    req: &PipelineRequest,
    auth: Option<Arc<Value>>,
) -> (LoaderResult, DeferContext) {
    let virtual_path: Arc<str> = component.virtual_path().into();
    let defer = DeferContext::new(
        Arc::clone(&virtual_path),
        req.initial_load,
        req.stream_initial_defers,
    );

    let outcome = match &component.loader {
        None => Ok(Value::Null),
        Some(loader) => {
            let ctx = LoaderContext {
                virtual_path: Arc::clone(&virtual_path),
                request: Arc::clone(&req.request),
                location: Arc::clone(&req.location),
                env: Arc::clone(&req.env),
                signal: req.signal.clone(),
                context,
                auth,
                defer: defer.clone(),
                query: req.query.clone(),
            };
            let loader = Arc::clone(loader);
            // Calling the hook inside the future keeps a synchronous panic local.
            settle_computation(Box::pin(async move { loader(ctx).await })).await
        }
    };

    let outcome = match outcome {
        Ok(mut data) => {
            defer.await_deferred().await;
            defer.inline_settled(&mut data);
            LoaderOutcome::Success { data }
        }
        Err(error) => {
            warn!(virtual_path = %virtual_path, error = %error, "loader failed");
            LoaderOutcome::Error { error }
        }
    };

    (
        LoaderResult {
            virtual_path: virtual_path.to_string(),
            outcome,
        },
        defer,
    )
}

async fn until_aborted<T>(
    signal: &AbortSignal,
    fut: impl Future<Output = T>,
) -> Result<T, PipelineError> {
    tokio::select! {
        biased;
        () = signal.aborted() => Err(PipelineError::Aborted),
        out = fut => Ok(out),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{AbortController, Params};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::Instant;

    fn request(path: &str) -> PipelineRequest {
        let request = Request::get(path);
        let location = Location::new(&request, Params::new());
        PipelineRequest::new(Arc::new(request), location)
    }

    fn chain(components: Vec<MatchedComponent>) -> Vec<Arc<MatchedComponent>> {
        components.into_iter().map(Arc::new).collect()
    }

    fn context_of(pairs: &[(&str, Value)]) -> ContextMap {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn sibling_failure_is_isolated() {
        let chain = chain(vec![
            MatchedComponent::new("/_layout").loader(|_ctx| async { Err("layout exploded".into()) }),
            MatchedComponent::new("/page").loader(|_ctx| async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(json!({ "ok": true }))
            }),
        ]);

        let out = LoaderPipeline::new().run(&chain, request("/")).await.unwrap();
        assert_eq!(out.matches.len(), 2);
        assert_eq!(
            out.matches[0].outcome,
            LoaderOutcome::Error { error: "layout exploded".into() }
        );
        assert_eq!(
            out.matches[1].outcome,
            LoaderOutcome::Success { data: json!({ "ok": true }) }
        );
    }

    #[tokio::test]
    async fn synchronous_panic_is_isolated() {
        let chain = chain(vec![
            MatchedComponent::new("/a").loader(|_ctx: LoaderContext| {
                if true {
                    panic!("thrown before any await");
                }
                async { Ok(Value::Null) }
            }),
            MatchedComponent::new("/b").loader(|_ctx| async { Ok(json!("fine")) }),
        ]);

        let out = LoaderPipeline::new().run(&chain, request("/")).await.unwrap();
        assert_eq!(out.matches[0].error(), Some("thrown before any await"));
        assert_eq!(out.matches[1].data(), Some(&json!("fine")));
    }

    #[tokio::test]
    async fn loaders_run_concurrently() {
        let components = (0..5)
            .map(|i| {
                MatchedComponent::new(format!("/level{i}")).loader(move |_ctx| async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(json!(i))
                })
            })
            .collect();
        let chain = chain(components);

        let start = Instant::now();
        let out = LoaderPipeline::new().run(&chain, request("/")).await.unwrap();
        let elapsed = start.elapsed();

        assert!(out.matches.iter().all(LoaderResult::is_success));
        assert!(
            elapsed < Duration::from_millis(300),
            "5 loaders of 100ms took {elapsed:?}"
        );
        let order: Vec<_> = out.matches.iter().map(|r| r.virtual_path.as_str()).collect();
        assert_eq!(order, vec!["/level0", "/level1", "/level2", "/level3", "/level4"]);
    }

    #[tokio::test]
    async fn preloaders_see_only_ancestor_context() {
        let seen: Arc<Mutex<Vec<(String, ContextMap)>>> = Arc::default();
        let record = |name: &'static str, adds: ContextMap, seen: Arc<Mutex<Vec<(String, ContextMap)>>>| {
            MatchedComponent::new(name).preloader(move |ctx| {
                seen.lock().push((name.to_owned(), ctx.context().clone()));
                let adds = adds.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Ok(adds)
                }
            })
        };

        let chain = chain(vec![
            record("/root", context_of(&[("tenant", json!("acme"))]), Arc::clone(&seen)),
            record("/mid", context_of(&[("plan", json!("pro"))]), Arc::clone(&seen)),
            record("/leaf", ContextMap::new(), Arc::clone(&seen)),
        ]);

        let out = LoaderPipeline::new().run(&chain, request("/")).await.unwrap();

        let seen = seen.lock();
        assert_eq!(seen[0], ("/root".to_owned(), ContextMap::new()));
        assert_eq!(
            seen[1],
            ("/mid".to_owned(), context_of(&[("tenant", json!("acme"))]))
        );
        assert_eq!(
            seen[2],
            (
                "/leaf".to_owned(),
                context_of(&[("tenant", json!("acme")), ("plan", json!("pro"))])
            )
        );
        assert_eq!(out.preloader_context.len(), 2);
    }

    #[tokio::test]
    async fn loader_sees_context_through_its_own_preloader() {
        let chain = chain(vec![
            MatchedComponent::new("/root")
                .preloader(|_ctx| async { Ok(context_of(&[("tenant", json!("acme"))])) })
                .loader(|ctx| async move { Ok(Value::Object(ctx.context().clone())) }),
            MatchedComponent::new("/page")
                .preloader(|ctx| {
                    let tenant = ctx.context()["tenant"].clone();
                    async move { Ok(context_of(&[("greeting", json!(format!("hi {tenant}")))])) }
                })
                .loader(|ctx| async move { Ok(Value::Object(ctx.context().clone())) }),
        ]);

        let out = LoaderPipeline::new().run(&chain, request("/")).await.unwrap();
        assert_eq!(out.matches[0].data(), Some(&json!({ "tenant": "acme" })));
        assert_eq!(
            out.matches[1].data(),
            Some(&json!({ "tenant": "acme", "greeting": "hi \"acme\"" }))
        );
    }

    #[tokio::test]
    async fn forbidden_stops_before_any_loader() {
        let loads = Arc::new(AtomicUsize::new(0));
        let authorized = Arc::new(Mutex::new(Vec::new()));
        let counting = |name: &'static str, allow: bool| {
            let loads = Arc::clone(&loads);
            let authorized = Arc::clone(&authorized);
            MatchedComponent::new(name)
                .authorize(move |ctx| {
                    authorized.lock().push(ctx.virtual_path.to_string());
                    async move { allow }
                })
                .loader(move |_ctx| {
                    loads.fetch_add(1, Ordering::SeqCst);
                    async { Ok(Value::Null) }
                })
        };

        let chain = chain(vec![
            counting("/root", true),
            counting("/admin", false),
            counting("/admin/page", true),
        ]);
        let err = LoaderPipeline::new().run(&chain, request("/")).await.unwrap_err();

        assert!(matches!(err, PipelineError::Forbidden { ref virtual_path } if virtual_path == "/admin"));
        assert_eq!(err.status(), StatusCode::Forbidden);
        assert_eq!(loads.load(Ordering::SeqCst), 0);
        assert_eq!(*authorized.lock(), vec!["/root".to_owned(), "/admin".to_owned()]);
    }

    #[tokio::test]
    async fn panicking_authorize_denies_access() {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&loads);
        let sync_panic = chain(vec![
            MatchedComponent::new("/admin").authorize(|_ctx| -> std::future::Ready<bool> {
                panic!("policy table missing")
            }),
            MatchedComponent::new("/admin/page").loader(move |_ctx| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(Value::Null) }
            }),
        ]);
        let err = LoaderPipeline::new().run(&sync_panic, request("/")).await.unwrap_err();
        assert!(matches!(err, PipelineError::Forbidden { ref virtual_path } if virtual_path == "/admin"));
        assert_eq!(loads.load(Ordering::SeqCst), 0);

        let async_panic = chain(vec![MatchedComponent::new("/page").authorize(|_ctx| async {
            tokio::task::yield_now().await;
            panic!("lookup failed")
        })]);
        let err = LoaderPipeline::new().run(&async_panic, request("/")).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::Forbidden);
    }

    #[tokio::test]
    async fn authorize_receives_auth_and_context() {
        let chain = chain(vec![
            MatchedComponent::new("/root")
                .authenticate(AuthMode::Optional)
                .preloader(|_ctx| async { Ok(context_of(&[("org", json!("acme"))])) }),
            MatchedComponent::new("/page").authorize(|ctx| async move {
                ctx.auth.as_deref() == Some(&json!({ "user": "ada" }))
                    && ctx.context.get("org") == Some(&json!("acme"))
            }),
        ]);
        let pipeline =
            LoaderPipeline::new().authenticate(|_req| async { Ok(Some(json!({ "user": "ada" }))) });

        let out = pipeline.run(&chain, request("/")).await.unwrap();
        assert_eq!(out.auth, Some(json!({ "user": "ada" })));
    }

    #[tokio::test]
    async fn authentication_runs_once_per_chain() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let pipeline = LoaderPipeline::new().authenticate(move |_req| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(Some(json!("user-1"))) }
        });
        let chain = chain(vec![
            MatchedComponent::new("/a").authenticate(AuthMode::Optional),
            MatchedComponent::new("/b").authenticate(AuthMode::Required),
            MatchedComponent::new("/c")
                .authenticate(AuthMode::Required)
                .loader(|ctx| async move { Ok(ctx.auth().cloned().unwrap_or_default()) }),
        ]);

        let out = pipeline.run(&chain, request("/")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(out.matches[2].data(), Some(&json!("user-1")));
    }

    #[tokio::test]
    async fn required_auth_without_identity_is_unauthenticated() {
        let pipeline = LoaderPipeline::new().authenticate(|_req| async { Ok(None) });
        let chain = chain(vec![MatchedComponent::new("/a").authenticate(AuthMode::Required)]);
        let err = pipeline.run(&chain, request("/")).await.unwrap_err();
        assert!(matches!(err, PipelineError::Unauthenticated));

        let optional = chain_of_optional();
        let out = pipeline.run(&optional, request("/")).await.unwrap();
        assert_eq!(out.auth, None);
    }

    fn chain_of_optional() -> Vec<Arc<MatchedComponent>> {
        chain(vec![MatchedComponent::new("/a").authenticate(AuthMode::Optional)])
    }

    #[tokio::test]
    async fn preloader_failure_is_terminal() {
        let chain = chain(vec![
            MatchedComponent::new("/root").preloader(|_ctx| async { Err("no tenant".into()) }),
            MatchedComponent::new("/page").loader(|_ctx| async { Ok(Value::Null) }),
        ]);
        let err = LoaderPipeline::new().run(&chain, request("/")).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Preloader { ref virtual_path, ref message }
                if virtual_path == "/root" && message == "no tenant"
        ));
    }

    #[tokio::test]
    async fn match_ids_restrict_loader_execution() {
        let chain = chain(vec![
            MatchedComponent::new("/root")
                .preloader(|_ctx| async { Ok(context_of(&[("k", json!(1))])) })
                .loader(|_ctx| async { Ok(json!("root")) }),
            MatchedComponent::new("/page").loader(|ctx| async move { Ok(ctx.context()["k"].clone()) }),
        ]);
        let req = request("/").match_ids(Some(vec!["/page".to_owned()]));
        let out = LoaderPipeline::new().run(&chain, req).await.unwrap();
        assert_eq!(out.matches.len(), 1);
        assert_eq!(out.matches[0].virtual_path, "/page");
        assert_eq!(out.matches[0].data(), Some(&json!(1)));
    }

    #[tokio::test]
    async fn awaited_defers_are_inlined_and_streams_handed_back() {
        let chain = chain(vec![MatchedComponent::new("/product").loader(|ctx| async move {
            let price = ctx.defer(async { Ok(json!(42)) }, DeferOptions::new().key("price"));
            let reviews = ctx.defer(
                async { Ok(json!(["great"])) },
                DeferOptions::new().key("reviews").stream(true),
            );
            Ok(json!({ "price": price, "reviews": reviews }))
        })]);

        let out = LoaderPipeline::new().run(&chain, request("/")).await.unwrap();
        assert_eq!(
            out.matches[0].data(),
            Some(&json!({ "price": 42, "reviews": { "$defer": "reviews" } }))
        );
        assert!(out.has_streaming());
        assert_eq!(out.streams[0].handle.key(), "reviews");
        assert_eq!(out.deferred.len(), 2);
    }

    #[tokio::test]
    async fn client_navigation_streams_by_default() {
        let chain = chain(vec![MatchedComponent::new("/product").loader(|ctx| async move {
            let reviews = ctx.defer(async { Ok(json!([])) }, DeferOptions::new().key("reviews"));
            Ok(json!({ "reviews": reviews }))
        })]);
        let out = LoaderPipeline::new()
            .run(&chain, request("/").initial_load(false))
            .await
            .unwrap();
        assert_eq!(out.matches[0].data(), Some(&json!({ "reviews": { "$defer": "reviews" } })));
        assert_eq!(out.streams.len(), 1);
    }

    #[tokio::test]
    async fn abort_cancels_in_flight_loaders() {
        let controller = AbortController::new();
        let chain = chain(vec![MatchedComponent::new("/slow").loader(|_ctx| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Value::Null)
        })]);
        let req = request("/").signal(controller.signal());

        let pipeline = LoaderPipeline::new();
        let run = pipeline.run(&chain, req);
        let abort = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            controller.abort();
        };
        let (result, ()) = tokio::join!(run, abort);
        assert!(matches!(result, Err(PipelineError::Aborted)));
    }

    #[tokio::test]
    async fn positions_without_loader_succeed_with_null() {
        let chain = chain(vec![MatchedComponent::new("/_layout")]);
        let out = LoaderPipeline::new().run(&chain, request("/")).await.unwrap();
        assert_eq!(out.matches[0].data(), Some(&Value::Null));
    }

    #[test]
    fn loader_result_serializes_with_status_tag() {
        let ok = LoaderResult {
            virtual_path: "/p".into(),
            outcome: LoaderOutcome::Success { data: json!(1) },
        };
        let err = LoaderResult {
            virtual_path: "/q".into(),
            outcome: LoaderOutcome::Error { error: "x".into() },
        };
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({ "virtualPath": "/p", "status": "success", "data": 1 })
        );
        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            json!({ "virtualPath": "/q", "status": "error", "error": "x" })
        );
    }
}
