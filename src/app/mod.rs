//! The request-to-response handler.
//!
//! [`App::handle`] runs one request through the middleware chain into the SSR
//! endpoint:
//!
//! 1. match the pathname against the [`RouteTree`] (`404` when nothing matches);
//! 2. resolve the matched payload into the component chain;
//! 3. run the [`LoaderPipeline`];
//! 4. resolve head and response headers along the chain;
//! 5. answer with an NDJSON body for data requests, or a full document.
//!
//! The host supplies requests and writes responses; the app owns no sockets.

use std::sync::Arc;

use thiserror::Error;
use tracing::{Instrument, debug, error, info_span};

use crate::BoxError;
use crate::cache::{MemoryQueryClient, QueryClient, TrackedQueryClient};
use crate::component::{ComponentRegistry, MatchedComponent, MissingComponent};
use crate::config::RenderConfig;
use crate::context::{AbortSignal, Context, Extensions, Location};
use crate::document::{DocumentParts, DocumentRenderer};
use crate::head::{ChainInputs, HeadConfig, resolve_head, resolve_headers};
use crate::http::{DataFormat, Navigation, Request, Response, StatusCode, signal};
use crate::loader::{AuthRequest, LoaderPipeline, PipelineError, PipelineRequest};
use crate::middleware::{
    Endpoint, Middleware, MiddlewareHandler, Next, from_middleware,
};
use crate::protocol::{NdjsonEncoder, ProtocolError};
use crate::router::{RouteMatch, RoutePayload, RouteTree, RouteTreeError};
use crate::security::{DataSigner, SignatureError, SignedDataMiddleware};

/// Failures that end a request after a route matched.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    MissingComponent(#[from] MissingComponent),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("failed to serialize hydration state: {0}")]
    State(#[from] serde_json::Error),

    #[error("failed to issue data signature: {0}")]
    Signature(#[from] SignatureError),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Pipeline(e) => e.status(),
            AppError::MissingComponent(_)
            | AppError::Protocol(_)
            | AppError::State(_)
            | AppError::Signature(_) => StatusCode::InternalServerError,
        }
    }
}

/// Builds the per-request query client wrapped by [`TrackedQueryClient`].
pub type QueryClientFactory = Arc<dyn Fn() -> Arc<dyn QueryClient> + Send + Sync>;

struct Inner {
    tree: RouteTree,
    components: ComponentRegistry,
    pipeline: LoaderPipeline,
    config: RenderConfig,
    env: Arc<Extensions>,
    signer: Option<Arc<DataSigner>>,
    query_client: QueryClientFactory,
    renderer: DocumentRenderer,
}

/// An SSR application. Cheap to clone; every clone shares the same routes.
///
/// # Examples
///
/// ```
/// use routeweave::app::App;
/// use routeweave::component::MatchedComponent;
/// use routeweave::router::RoutePayload;
/// use routeweave::{Request, StatusCode};
/// use serde_json::json;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let app = App::builder()
///     .route("/", RoutePayload::new("/index"))?
///     .component(
///         MatchedComponent::new("/index")
///             .loader(|_ctx| async { Ok(json!({ "greeting": "hello" })) })
///             .render(|props| format!("<p>{}</p>", props.data["greeting"].as_str().unwrap_or_default())),
///     )
///     .build();
///
/// let response = app.handle(Request::get("/")).await;
/// assert_eq!(response.status(), StatusCode::Ok);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct App {
    inner: Arc<Inner>,
    middlewares: Arc<[MiddlewareHandler]>,
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("components", &self.inner.components.len())
            .field("middlewares", &self.middlewares.len())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl App {
    pub fn builder() -> AppBuilder {
        AppBuilder::new()
    }

    pub fn config(&self) -> &RenderConfig {
        &self.inner.config
    }

    /// Handle a request that is never cancelled.
    pub async fn handle(&self, request: Request) -> Response {
        self.handle_with_signal(request, AbortSignal::never()).await
    }

    /// Handle a request, observing `signal` for client disconnects.
    pub async fn handle_with_signal(&self, request: Request, signal: AbortSignal) -> Response {
        let ctx = Context::with_env(request, Arc::clone(&self.inner.env), signal);
        let span = info_span!(
            "request",
            request_id = %ctx.request_id(),
            path = %ctx.request().path()
        );

        let inner = Arc::clone(&self.inner);
        let endpoint: Endpoint = Arc::new(move |ctx| {
            let inner = Arc::clone(&inner);
            Box::pin(async move { inner.respond(ctx).await })
        });

        Next::new(Arc::clone(&self.middlewares), endpoint)
            .run(ctx)
            .instrument(span)
            .await
    }
}

impl Inner {
    async fn respond(&self, ctx: Context) -> Response {
        let request = ctx.request();
        if !request.method().is_renderable() {
            return Response::new(StatusCode::MethodNotAllowed).header("Allow", "GET, HEAD");
        }

        let navigation = request.navigation();
        let Some(matched) = self.tree.match_path(request.path()) else {
            debug!("no route matched");
            return error_response(StatusCode::NotFound, &navigation);
        };

        match self.render(&ctx, &navigation, matched).await {
            Ok(response) => response,
            Err(e) => {
                let status = e.status();
                if status == StatusCode::InternalServerError {
                    error!(error = %e, "request failed");
                } else {
                    debug!(error = %e, %status, "request rejected");
                }
                error_response(status, &navigation)
            }
        }
    }

    async fn render(
        &self,
        ctx: &Context,
        navigation: &Navigation,
        matched: RouteMatch<'_>,
    ) -> Result<Response, AppError> {
        let route = matched.route;
        let chain = self.components.resolve_chain(route)?;
        let location = Location::new(ctx.request(), matched.params);
        let query = TrackedQueryClient::new((self.query_client)());

        let data_request = navigation.data.is_some();
        let pipeline_request = PipelineRequest::new(ctx.request_arc(), location.clone())
            .env(Arc::clone(ctx.env()))
            .signal(ctx.signal().clone())
            .initial_load(navigation.is_initial_load())
            .stream_initial_defers(
                route
                    .options
                    .stream_initial_defers
                    .unwrap_or(self.config.stream_initial_defers),
            )
            .match_ids(if data_request {
                navigation.match_ids.clone()
            } else {
                None
            })
            .query(query.clone());

        let output = self.pipeline.run(&chain, pipeline_request).await?;

        let inputs = ChainInputs {
            location: &location,
            preloader_context: &output.preloader_context,
            matches: &output.matches,
        };
        let head = resolve_head(&chain, inputs);
        let headers = resolve_headers(&chain, inputs, &head);

        let mut response = match navigation.data {
            Some(DataFormat::Ndjson) => {
                let mut encoder = NdjsonEncoder::new().signal(ctx.signal().clone());
                if head != HeadConfig::default() {
                    encoder = encoder.head(head);
                }
                let body = encoder.encode(&output.matches, output.streams)?;
                Response::new(StatusCode::Ok)
                    .header("Content-Type", signal::NDJSON_CONTENT_TYPE)
                    .with_body(body)
            }
            None | Some(DataFormat::Html) => {
                let body = self.renderer.render(DocumentParts {
                    chain: &chain,
                    location: &location,
                    matches: &output.matches,
                    head: &head,
                    query: query.dehydrate(),
                    signature: self.signer.as_ref().map(|s| s.sign()).transpose()?,
                    nonce: ctx.nonce(),
                    streams: output.streams,
                    signal: ctx.signal().clone(),
                })?;
                let mut response = Response::new(StatusCode::Ok)
                    .header("Content-Type", signal::HTML_CONTENT_TYPE)
                    .with_body(body);
                if let Some(cache_control) = &route.options.cache_control {
                    response.set_header("Cache-Control", cache_control.as_str());
                }
                response
            }
        };

        response.overlay_headers(&headers);
        if data_request {
            let cache_control = if navigation.prefetch {
                format!("private, max-age={}", self.config.prefetch_max_age_secs)
            } else {
                "no-store".to_owned()
            };
            response.set_header("Cache-Control", cache_control);
        }

        Ok(response)
    }
}

fn error_response(status: StatusCode, navigation: &Navigation) -> Response {
    let response = Response::new(status).header("Cache-Control", "no-store");
    match navigation.data {
        Some(DataFormat::Ndjson) => response
            .header("Content-Type", "application/json")
            .body(format!(
                r#"{{"status":{},"error":"{}"}}"#,
                status.as_u16(),
                status.canonical_reason()
            )),
        _ => response
            .header("Content-Type", signal::HTML_CONTENT_TYPE)
            .body(format!(
                "<!DOCTYPE html><title>{status}</title><h1>{status}</h1>"
            )),
    }
}

/// Builder for [`App`].
pub struct AppBuilder {
    tree: RouteTree,
    components: ComponentRegistry,
    pipeline: LoaderPipeline,
    config: RenderConfig,
    env: Extensions,
    middlewares: Vec<MiddlewareHandler>,
    query_client: Option<QueryClientFactory>,
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AppBuilder {
    pub fn new() -> Self {
        Self {
            tree: RouteTree::new(),
            components: ComponentRegistry::new(),
            pipeline: LoaderPipeline::new(),
            config: RenderConfig::default(),
            env: Extensions::new(),
            middlewares: Vec::new(),
            query_client: None,
        }
    }

    /// Replace the route tree, e.g. with one loaded from a manifest.
    #[must_use]
    pub fn routes(mut self, tree: RouteTree) -> Self {
        self.tree = tree;
        self
    }

    /// Add one route.
    ///
    /// # Errors
    ///
    /// Any [`RouteTreeError`] raised by [`RouteTree::insert`].
    pub fn route(mut self, pattern: &str, payload: RoutePayload) -> Result<Self, RouteTreeError> {
        self.tree.insert(pattern, payload)?;
        Ok(self)
    }

    #[must_use]
    pub fn component(mut self, component: MatchedComponent) -> Self {
        self.components.register(component);
        self
    }

    /// Install the hook resolving the request identity.
    #[must_use]
    pub fn authenticate<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(AuthRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<serde_json::Value>, BoxError>> + Send + 'static,
    {
        self.pipeline = self.pipeline.authenticate(f);
        self
    }

    #[must_use]
    pub fn config(mut self, config: RenderConfig) -> Self {
        self.config = config;
        self
    }

    /// Add an environment binding visible to every hook.
    #[must_use]
    pub fn env<T>(mut self, value: T) -> Self
    where
        T: Send + Sync + 'static,
    {
        self.env.insert(value);
        self
    }

    /// Append a middleware; the first added is the outermost.
    #[must_use]
    pub fn middleware<M>(self, middleware: M) -> Self
    where
        M: Middleware + 'static,
    {
        self.middleware_handler(from_middleware(Arc::new(middleware)))
    }

    #[must_use]
    pub fn middleware_handler(mut self, handler: MiddlewareHandler) -> Self {
        self.middlewares.push(handler);
        self
    }

    /// Per-request query client; defaults to a fresh [`MemoryQueryClient`].
    #[must_use]
    pub fn query_client<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn QueryClient> + Send + Sync + 'static,
    {
        self.query_client = Some(Arc::new(factory));
        self
    }

    /// Finish the app. With `[signing]` configured, signature verification is
    /// installed as the innermost middleware.
    pub fn build(self) -> App {
        let signer = self.config.signer().map(Arc::new);
        let mut middlewares = self.middlewares;
        if let Some(signer) = &signer {
            middlewares.push(from_middleware(Arc::new(SignedDataMiddleware::shared(
                Arc::clone(signer),
            ))));
        }

        let query_client = self
            .query_client
            .unwrap_or_else(|| Arc::new(|| Arc::new(MemoryQueryClient::new()) as Arc<dyn QueryClient>));

        App {
            inner: Arc::new(Inner {
                renderer: DocumentRenderer::new(self.config.document.clone()),
                tree: self.tree,
                components: self.components,
                pipeline: self.pipeline,
                config: self.config,
                env: Arc::new(self.env),
                signer,
                query_client,
            }),
            middlewares: Arc::from(middlewares),
        }
    }
}
