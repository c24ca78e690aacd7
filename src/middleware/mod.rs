//! Middleware pipeline: composable before/after logic around the SSR handler.
//!
//! Each middleware wraps the next layer and may inspect the request,
//! short-circuit with its own response, or decorate the downstream response.
//! The innermost layer is the app's [`Endpoint`], which runs the route match,
//! the loader pipeline and rendering.
//!
//! ## Core types
//!
//! - [`Middleware`]: trait implemented by all middleware.
//! - [`Next`]: cursor into the remaining chain; call [`Next::run`] to advance.
//! - [`MiddlewareHandler`]: type-erased, cheaply-cloneable middleware function.
//! - [`from_middleware`] / [`from_fn`]: build a [`MiddlewareHandler`].
//! - [`LoggerMiddleware`]: built-in request/response logger.

use std::{future::Future, pin::Pin, sync::Arc};
use tokio::time::Instant;

use crate::{Response, context::Context};

/// Boxed response future returned by every layer.
pub type ResponseFuture = Pin<Box<dyn Future<Output = Response> + Send>>;

/// The innermost handler the chain ends in.
pub type Endpoint = Arc<dyn Fn(Context) -> ResponseFuture + Send + Sync + 'static>;

/// A type-erased, reference-counted middleware function.
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use routeweave::{context::Context, middleware::{MiddlewareHandler, Next}};
///
/// let handler: MiddlewareHandler = Arc::new(|ctx: Context, next: Next| {
///     Box::pin(async move { next.run(ctx).await })
/// });
/// ```
pub type MiddlewareHandler = Arc<dyn Fn(Context, Next) -> ResponseFuture + Send + Sync + 'static>;

/// Converts a [`Middleware`] implementation into a [`MiddlewareHandler`].
pub fn from_middleware<M>(middleware: Arc<M>) -> MiddlewareHandler
where
    M: Middleware + 'static,
{
    Arc::new(move |ctx: Context, next: Next| middleware.handle(ctx, next))
}

/// Converts an async closure into a [`MiddlewareHandler`].
///
/// ```rust,no_run
/// use routeweave::middleware::from_fn;
///
/// let stamp = from_fn(|ctx, next| async move {
///     next.run(ctx).await.header("X-Powered-By", "routeweave")
/// });
/// ```
pub fn from_fn<F, Fut>(f: F) -> MiddlewareHandler
where
    F: Fn(Context, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    Arc::new(move |ctx, next| Box::pin(f(ctx, next)))
}

/// A cursor into the remaining middleware chain for a single request.
///
/// `Next` is consumed by [`run`](Self::run), so a middleware can forward the
/// request at most once.
pub struct Next {
    middlewares: Arc<[MiddlewareHandler]>,
    // Which middleware `run` invokes next.
    index: usize,
    endpoint: Endpoint,
}

impl Next {
    /// A cursor at the start of `middlewares`, ending in `endpoint`.
    pub fn new(middlewares: Arc<[MiddlewareHandler]>, endpoint: Endpoint) -> Self {
        Self {
            middlewares,
            index: 0,
            endpoint,
        }
    }

    /// Invoke the next middleware, or the endpoint once the chain is exhausted.
    pub async fn run(mut self, ctx: Context) -> Response {
        match self.middlewares.get(self.index).cloned() {
            Some(handler) => {
                self.index += 1;
                handler(ctx, self).await
            }
            None => (self.endpoint)(ctx).await,
        }
    }
}

/// The core trait for all middleware.
///
/// Implementors may pass through (`next.run(ctx).await`), short-circuit by
/// returning a [`Response`] without calling `next`, or decorate the downstream
/// response. Middleware is shared across tasks, so implementations must be
/// `Send + Sync` and return a `Send` future.
pub trait Middleware: Send + Sync {
    fn handle(&self, ctx: Context, next: Next) -> ResponseFuture;
}

/// Logs one line per request: method, path, status, duration and request id.
///
/// For streamed responses the duration covers the time to the first byte; the
/// stream itself is still open when the line is written.
pub struct LoggerMiddleware;

impl Middleware for LoggerMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> ResponseFuture {
        Box::pin(async move {
            let start = Instant::now();
            let method = ctx.request().method().as_str().to_owned();
            let path = ctx.request().path().to_owned();
            let request_id = ctx.request_id().to_owned();

            let response = next.run(ctx).await;

            tracing::info!(
                %request_id,
                %method,
                %path,
                status = response.status().as_u16(),
                streaming = response.is_streaming(),
                elapsed = ?start.elapsed(),
                "request handled"
            );

            response
        })
    }
}
