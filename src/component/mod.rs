//! Route components: the layouts and pages a matched chain is made of.
//!
//! A [`MatchedComponent`] bundles the optional hooks of one chain position:
//! preloader, loader, authorize, head, headers, render and error boundary.
//! Hooks are stored type-erased behind `Arc<dyn Fn(…)>` so a component can be
//! shared by every request; the builder methods accept plain closures and
//! `async` closures returning the right output.
//!
//! [`ComponentRegistry`] maps virtual paths to components and turns a matched
//! [`RoutePayload`] into the root-first chain the pipeline runs.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::BoxError;
use crate::head::{HeadConfig, HeadContext};
use crate::http::Headers;
use crate::loader::{AuthorizeContext, LoaderContext, PreloaderContext};
use crate::router::RoutePayload;

/// Context values a preloader adds for its descendants.
pub type ContextMap = Map<String, Value>;

pub type PreloaderFn =
    Arc<dyn Fn(PreloaderContext) -> BoxFuture<'static, Result<ContextMap, BoxError>> + Send + Sync>;
pub type LoaderFn =
    Arc<dyn Fn(LoaderContext) -> BoxFuture<'static, Result<Value, BoxError>> + Send + Sync>;
pub type AuthorizeFn = Arc<dyn Fn(AuthorizeContext) -> BoxFuture<'static, bool> + Send + Sync>;
pub type HeadFn = Arc<dyn Fn(&HeadContext<'_>) -> HeadConfig + Send + Sync>;
pub type HeadersFn = Arc<dyn Fn(&HeadContext<'_>) -> Headers + Send + Sync>;
pub type RenderFn = Arc<dyn Fn(&RenderProps<'_>) -> String + Send + Sync>;

/// Whether a chain position needs the request to be authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// Missing identity fails the request with `401`.
    Required,
    /// Identity is resolved if present; anonymous requests proceed.
    Optional,
}

/// What a render function sees.
#[derive(Debug)]
pub struct RenderProps<'a> {
    pub virtual_path: &'a str,
    pub location: &'a crate::context::Location,
    /// Loader data, with awaited deferred values inlined.
    pub data: &'a Value,
    /// Markup of the next chain position (the page has none).
    pub children: Option<&'a str>,
}

/// What an error boundary sees when this position's loader failed.
#[derive(Debug)]
pub struct ErrorProps<'a> {
    pub virtual_path: &'a str,
    pub error: &'a str,
}

pub type ErrorBoundaryFn = Arc<dyn Fn(&ErrorProps<'_>) -> String + Send + Sync>;

/// One position of the layout/page chain.
///
/// # Examples
///
/// ```
/// use routeweave::component::MatchedComponent;
/// use routeweave::head::HeadConfig;
/// use serde_json::json;
///
/// let page = MatchedComponent::new("/blog/[slug]")
///     .loader(|ctx| async move {
///         let slug = ctx.location().params.get_str("slug").unwrap_or_default().to_owned();
///         Ok(json!({ "slug": slug }))
///     })
///     .head(|ctx| HeadConfig::titled(format!("{} - Blog", ctx.parent_head.title.clone().unwrap_or_default())))
///     .render(|props| format!("<article>{}</article>", props.data["slug"]));
///
/// assert_eq!(page.virtual_path(), "/blog/[slug]");
/// assert!(page.has_loader());
/// ```
#[derive(Clone)]
pub struct MatchedComponent {
    virtual_path: String,
    pub(crate) authenticate: Option<AuthMode>,
    pub(crate) preloader: Option<PreloaderFn>,
    pub(crate) loader: Option<LoaderFn>,
    pub(crate) authorize: Option<AuthorizeFn>,
    pub(crate) head: Option<HeadFn>,
    pub(crate) headers: Option<HeadersFn>,
    pub(crate) render: Option<RenderFn>,
    pub(crate) error_boundary: Option<ErrorBoundaryFn>,
}

impl MatchedComponent {
    pub fn new(virtual_path: impl Into<String>) -> Self {
        Self {
            virtual_path: virtual_path.into(),
            authenticate: None,
            preloader: None,
            loader: None,
            authorize: None,
            head: None,
            headers: None,
            render: None,
            error_boundary: None,
        }
    }

    pub fn virtual_path(&self) -> &str {
        &self.virtual_path
    }

    pub fn auth_mode(&self) -> Option<AuthMode> {
        self.authenticate
    }

    pub fn has_loader(&self) -> bool {
        self.loader.is_some()
    }

    #[must_use]
    pub fn authenticate(mut self, mode: AuthMode) -> Self {
        self.authenticate = Some(mode);
        self
    }

    #[must_use]
    pub fn preloader<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(PreloaderContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ContextMap, BoxError>> + Send + 'static,
    {
        self.preloader = Some(Arc::new(move |ctx| Box::pin(f(ctx))));
        self
    }

    #[must_use]
    pub fn loader<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(LoaderContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, BoxError>> + Send + 'static,
    {
        self.loader = Some(Arc::new(move |ctx| Box::pin(f(ctx))));
        self
    }

    #[must_use]
    pub fn authorize<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(AuthorizeContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.authorize = Some(Arc::new(move |ctx| Box::pin(f(ctx))));
        self
    }

    #[must_use]
    pub fn head<F>(mut self, f: F) -> Self
    where
        F: Fn(&HeadContext<'_>) -> HeadConfig + Send + Sync + 'static,
    {
        self.head = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn headers<F>(mut self, f: F) -> Self
    where
        F: Fn(&HeadContext<'_>) -> Headers + Send + Sync + 'static,
    {
        self.headers = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn render<F>(mut self, f: F) -> Self
    where
        F: Fn(&RenderProps<'_>) -> String + Send + Sync + 'static,
    {
        self.render = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn error_boundary<F>(mut self, f: F) -> Self
    where
        F: Fn(&ErrorProps<'_>) -> String + Send + Sync + 'static,
    {
        self.error_boundary = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for MatchedComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MatchedComponent")
            .field("virtual_path", &self.virtual_path)
            .field("authenticate", &self.authenticate)
            .field("preloader", &self.preloader.is_some())
            .field("loader", &self.loader.is_some())
            .field("authorize", &self.authorize.is_some())
            .field("head", &self.head.is_some())
            .field("headers", &self.headers.is_some())
            .finish_non_exhaustive()
    }
}

/// A virtual path named by the route tree has no registered component.
#[derive(Debug, Error)]
#[error("no component registered for virtual path `{virtual_path}`")]
pub struct MissingComponent {
    pub virtual_path: String,
}

/// Components keyed by virtual path.
#[derive(Debug, Clone, Default)]
pub struct ComponentRegistry {
    components: HashMap<String, Arc<MatchedComponent>>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `component`, replacing any previous one with the same virtual path.
    pub fn register(&mut self, component: MatchedComponent) {
        self.components
            .insert(component.virtual_path.clone(), Arc::new(component));
    }

    pub fn get(&self, virtual_path: &str) -> Option<&Arc<MatchedComponent>> {
        self.components.get(virtual_path)
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// The root-first chain for `payload`.
    ///
    /// # Errors
    ///
    /// [`MissingComponent`] names the first virtual path with no registration.
    pub fn resolve_chain(
        &self,
        payload: &RoutePayload,
    ) -> Result<Vec<Arc<MatchedComponent>>, MissingComponent> {
        payload
            .chain()
            .map(|vp| {
                self.get(vp).cloned().ok_or_else(|| MissingComponent {
                    virtual_path: vp.to_owned(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_chain_is_root_first() {
        let mut registry = ComponentRegistry::new();
        registry.register(MatchedComponent::new("/_layout"));
        registry.register(MatchedComponent::new("/blog/_layout"));
        registry.register(MatchedComponent::new("/blog/[slug]"));

        let payload = RoutePayload::new("/blog/[slug]")
            .layout("/_layout")
            .layout("/blog/_layout");
        let chain = registry.resolve_chain(&payload).unwrap();
        let paths: Vec<_> = chain.iter().map(|c| c.virtual_path()).collect();
        assert_eq!(paths, vec!["/_layout", "/blog/_layout", "/blog/[slug]"]);
    }

    #[test]
    fn resolve_chain_reports_missing_component() {
        let mut registry = ComponentRegistry::new();
        registry.register(MatchedComponent::new("/page"));
        let payload = RoutePayload::new("/page").layout("/_layout");
        let err = registry.resolve_chain(&payload).unwrap_err();
        assert_eq!(err.virtual_path, "/_layout");
    }

    #[test]
    fn register_replaces_same_virtual_path() {
        let mut registry = ComponentRegistry::new();
        registry.register(MatchedComponent::new("/page"));
        registry.register(MatchedComponent::new("/page").authenticate(AuthMode::Required));
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.get("/page").and_then(|c| c.auth_mode()),
            Some(AuthMode::Required)
        );
    }

    #[test]
    fn debug_lists_present_hooks() {
        let c = MatchedComponent::new("/p").loader(|_ctx| async { Ok(Value::Null) });
        let dbg = format!("{c:?}");
        assert!(dbg.contains("loader: true"));
        assert!(dbg.contains("preloader: false"));
    }
}
