//! # routeweave
//!
//! A server-side rendering request pipeline: match a URL against a compiled
//! route tree, run the matched layout/page chain's preloaders and loaders,
//! decide per deferred value whether to await it or stream it, and answer with
//! either a full HTML document or an NDJSON data stream for client navigation.
//!
//! ## Quick Start
//!
//! ```rust
//! use routeweave::app::App;
//! use routeweave::component::MatchedComponent;
//! use routeweave::head::HeadConfig;
//! use routeweave::router::RoutePayload;
//! use routeweave::{Request, StatusCode};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let app = App::builder()
//!         .route("/hello/:name", RoutePayload::new("/hello/[name]").layout("/_layout"))?
//!         .component(MatchedComponent::new("/_layout").head(|_ctx| HeadConfig::titled("Demo")))
//!         .component(
//!             MatchedComponent::new("/hello/[name]")
//!                 .loader(|ctx| async move {
//!                     Ok(json!({ "name": ctx.location().params.get_str("name") }))
//!                 })
//!                 .render(|props| format!("<h1>Hello {}</h1>", props.data["name"])),
//!         )
//!         .build();
//!
//!     let response = app.handle(Request::get("/hello/world")).await;
//!     assert_eq!(response.status(), StatusCode::Ok);
//!     Ok(())
//! }
//! ```
//!
//! The host environment owns connections: it turns incoming bytes into a
//! [`Request`] (see [`Request::parse`]), calls [`App::handle`](app::App::handle)
//! and writes the [`Response`] back with [`Response::write_to`].

// ── Request surface ───────────────────────────────────────────────────────────
pub mod app;
pub mod config;
pub mod context;
pub mod http;
pub mod middleware;
pub mod security;

// ── Pipeline ──────────────────────────────────────────────────────────────────
pub mod cache;
pub mod component;
pub mod defer;
pub mod loader;
pub mod router;

// ── Output ────────────────────────────────────────────────────────────────────
pub mod document;
pub mod head;
pub mod protocol;

/// Error type returned by user hooks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use app::{App, AppBuilder, AppError};
pub use http::{Headers, Method, Request, Response, StatusCode};
