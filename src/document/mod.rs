//! Full-document rendering.
//!
//! Markup is composed page-first: each chain position's render function gets
//! the markup of the position below it as `children`. A position whose loader
//! failed renders its error boundary in place of its subtree while the
//! positions above it render normally.
//!
//! The hydration state (loader results, location, head, query seed, data
//! signature) is embedded as a JSON data block. A streamed document sends its
//! markup first, then one `<script type="application/json" data-chunk>` block
//! per streamed value in resolution order, and writes the state block last,
//! with the settled values in place of their placeholders.

use std::fmt::Write as _;
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use tracing::error;

use crate::component::{ErrorProps, MatchedComponent, RenderProps};
use crate::config::DocumentConfig;
use crate::context::{AbortSignal, Location};
use crate::defer::{Deferred, PendingStream, patch_placeholders};
use crate::head::{HeadConfig, escape_html, escape_script_json};
use crate::http::Body;
use crate::loader::{LoaderOutcome, LoaderResult};
use crate::protocol::{Message, spawn_stream};

const CLOSING: &str = "</body></html>";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HydrationState<'a> {
    matches: &'a [LoaderResult],
    location: &'a Location,
    head: &'a HeadConfig,
    query: &'a Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    signature: Option<&'a str>,
}

/// Everything one document render needs.
#[derive(Debug)]
pub struct DocumentParts<'a> {
    pub chain: &'a [Arc<MatchedComponent>],
    pub location: &'a Location,
    pub matches: &'a [LoaderResult],
    pub head: &'a HeadConfig,
    /// Dehydrated query cache.
    pub query: Value,
    pub signature: Option<String>,
    pub nonce: &'a str,
    pub streams: Vec<PendingStream>,
    pub signal: AbortSignal,
}

/// Renders full HTML documents.
#[derive(Debug, Clone, Default)]
pub struct DocumentRenderer {
    config: DocumentConfig,
}

impl DocumentRenderer {
    pub fn new(config: DocumentConfig) -> Self {
        Self { config }
    }

    /// Compose the chain's markup, page innermost.
    pub fn render_markup(
        chain: &[Arc<MatchedComponent>],
        location: &Location,
        matches: &[LoaderResult],
    ) -> String {
        let mut children: Option<String> = None;

        for component in chain.iter().rev() {
            let virtual_path = component.virtual_path();
            let result = matches.iter().find(|r| r.virtual_path == virtual_path);

            let markup = match result.map(|r| &r.outcome) {
                Some(LoaderOutcome::Error { error }) => {
                    let props = ErrorProps {
                        virtual_path,
                        error,
                    };
                    match &component.error_boundary {
                        Some(boundary) => boundary(&props),
                        None => default_error_boundary(&props),
                    }
                }
                outcome => {
                    let data = match outcome {
                        Some(LoaderOutcome::Success { data }) => data,
                        _ => &Value::Null,
                    };
                    match &component.render {
                        Some(render) => render(&RenderProps {
                            virtual_path,
                            location,
                            data,
                            children: children.as_deref(),
                        }),
                        None => children.take().unwrap_or_default(),
                    }
                }
            };
            children = Some(markup);
        }

        children.unwrap_or_default()
    }

    /// Render the document. Returns a streamed body when `parts.streams` is
    /// not empty.
    ///
    /// # Errors
    ///
    /// Fails only if the hydration state of a static document cannot be
    /// serialized.
    pub fn render(&self, parts: DocumentParts<'_>) -> Result<Body, serde_json::Error> {
        let markup = Self::render_markup(parts.chain, parts.location, parts.matches);

        let mut html = String::with_capacity(markup.len() + 512);
        let _ = write!(
            html,
            r#"<!DOCTYPE html><html lang="{}"><head><meta charset="utf-8">"#,
            escape_html(&self.config.lang)
        );
        html.push_str(&parts.head.render(parts.nonce));
        let _ = write!(html, r#"</head><body><div id="app">{markup}</div>"#);

        if parts.streams.is_empty() {
            let state = HydrationState {
                matches: parts.matches,
                location: parts.location,
                head: parts.head,
                query: &parts.query,
                signature: parts.signature.as_deref(),
            };
            html.push_str(&self.tail(&serde_json::to_string(&state)?, parts.nonce));
            return Ok(Body::Full(html.into_bytes()));
        }

        // The state is written once every streamed value has settled, so it
        // carries the values instead of their placeholders.
        let handles: Vec<Deferred> = parts.streams.iter().map(|s| s.handle.clone()).collect();
        let mut matches = parts.matches.to_vec();
        let location = parts.location.clone();
        let head = parts.head.clone();
        let query = parts.query;
        let signature = parts.signature;
        let renderer = self.clone();
        let nonce = parts.nonce.to_owned();
        let chunk_nonce = escape_html(parts.nonce);

        let rx = spawn_stream(
            Bytes::from(html),
            parts.streams,
            parts.signal,
            move |settled| match serde_json::to_string(&Message::from_settled(settled)) {
                Ok(json) => Some(Bytes::from(format!(
                    r#"<script type="application/json" data-chunk nonce="{chunk_nonce}">{}</script>"#,
                    escape_script_json(&json)
                ))),
                Err(e) => {
                    error!(error = %e, "dropping unencodable document chunk");
                    None
                }
            },
            move || {
                inline_streamed(&mut matches, &handles);
                let state = HydrationState {
                    matches: &matches,
                    location: &location,
                    head: &head,
                    query: &query,
                    signature: signature.as_deref(),
                };
                match serde_json::to_string(&state) {
                    Ok(state) => Bytes::from(renderer.tail(&state, &nonce)),
                    Err(e) => {
                        error!(error = %e, "failed to serialize hydration state");
                        Bytes::from_static(CLOSING.as_bytes())
                    }
                }
            },
        );
        Ok(Body::Stream(rx))
    }

    // State block, entry script and closing tags.
    fn tail(&self, state: &str, nonce: &str) -> String {
        let nonce = escape_html(nonce);
        let mut html = String::with_capacity(state.len() + 256);
        let _ = write!(
            html,
            r#"<script type="application/json" id="{}" nonce="{nonce}">{}</script>"#,
            escape_html(&self.config.state_script_id),
            escape_script_json(state)
        );
        if let Some(entry) = &self.config.entry_script {
            let _ = write!(
                html,
                r#"<script type="module" src="{}" nonce="{nonce}"></script>"#,
                escape_html(entry)
            );
        }
        html.push_str(CLOSING);
        html
    }
}

/// Replace streamed placeholders in `matches` with what their handles settled to.
fn inline_streamed(matches: &mut [LoaderResult], handles: &[Deferred]) {
    for result in matches {
        let LoaderResult {
            virtual_path,
            outcome,
        } = result;
        if let LoaderOutcome::Success { data } = outcome {
            patch_placeholders(data, &mut |key| {
                handles
                    .iter()
                    .find(|h| h.virtual_path() == virtual_path.as_str() && h.key() == key)
                    .map(Deferred::current)
            });
        }
    }
}

fn default_error_boundary(props: &ErrorProps<'_>) -> String {
    format!(
        r#"<div data-error-boundary="{}">{}</div>"#,
        escape_html(props.virtual_path),
        escape_html(props.error)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defer::{DeferContext, DeferOptions};
    use serde_json::json;
    use std::time::Duration;

    fn ok(vp: &str, data: Value) -> LoaderResult {
        LoaderResult {
            virtual_path: vp.into(),
            outcome: LoaderOutcome::Success { data },
        }
    }

    fn failed(vp: &str, error: &str) -> LoaderResult {
        LoaderResult {
            virtual_path: vp.into(),
            outcome: LoaderOutcome::Error {
                error: error.into(),
            },
        }
    }

    fn chain() -> Vec<Arc<MatchedComponent>> {
        vec![
            Arc::new(MatchedComponent::new("/_layout").render(|p| {
                format!("<main>{}</main>", p.children.unwrap_or_default())
            })),
            Arc::new(MatchedComponent::new("/blog/_layout")),
            Arc::new(MatchedComponent::new("/blog/[slug]").render(|p| {
                format!("<h1>{}</h1>", p.data["title"].as_str().unwrap_or_default())
            })),
        ]
    }

    fn parts<'a>(
        chain: &'a [Arc<MatchedComponent>],
        location: &'a Location,
        matches: &'a [LoaderResult],
        head: &'a HeadConfig,
        streams: Vec<PendingStream>,
    ) -> DocumentParts<'a> {
        DocumentParts {
            chain,
            location,
            matches,
            head,
            query: json!({ "user:1": { "name": "Ada" } }),
            signature: Some("1.abc".into()),
            nonce: "n1",
            streams,
            signal: AbortSignal::never(),
        }
    }

    fn state_of(html: &str) -> Value {
        let marker = r#"id="__routeweave_state" nonce="n1">"#;
        let start = html.find(marker).unwrap() + marker.len();
        let end = start + html[start..].find("</script>").unwrap();
        serde_json::from_str(&html[start..end]).unwrap()
    }

    #[test]
    fn markup_nests_page_inside_layouts() {
        let matches = vec![ok("/blog/[slug]", json!({ "title": "Hi" }))];
        let markup =
            DocumentRenderer::render_markup(&chain(), &Location::default(), &matches);
        assert_eq!(markup, "<main><h1>Hi</h1></main>");
    }

    #[test]
    fn failed_position_renders_its_boundary() {
        let matches = vec![ok("/_layout", json!({})), failed("/blog/[slug]", "db <down>")];
        let markup =
            DocumentRenderer::render_markup(&chain(), &Location::default(), &matches);
        assert_eq!(
            markup,
            r#"<main><div data-error-boundary="/blog/[slug]">db &lt;down&gt;</div></main>"#
        );

        let custom = vec![
            Arc::new(MatchedComponent::new("/_layout").render(|p| {
                format!("[{}]", p.children.unwrap_or_default())
            })),
            Arc::new(
                MatchedComponent::new("/page")
                    .error_boundary(|p| format!("oops: {}", p.error)),
            ),
        ];
        let matches = vec![failed("/page", "gone")];
        assert_eq!(
            DocumentRenderer::render_markup(&custom, &Location::default(), &matches),
            "[oops: gone]"
        );
    }

    #[tokio::test]
    async fn static_document_embeds_state() {
        let chain = chain();
        let location = Location::default();
        let matches = vec![ok("/blog/[slug]", json!({ "title": "</script>" }))];
        let head = HeadConfig::titled("Post");

        let body = DocumentRenderer::default()
            .render(parts(&chain, &location, &matches, &head, Vec::new()))
            .unwrap();
        assert!(matches!(body, Body::Full(_)));
        let html = String::from_utf8(body.collect().await).unwrap();

        assert!(html.starts_with(r#"<!DOCTYPE html><html lang="en">"#));
        assert!(html.contains("<title>Post</title>"));
        assert!(html.ends_with("</body></html>"));
        assert_eq!(html.matches("</script>").count(), 1);

        let state = state_of(&html);
        assert_eq!(state["matches"][0]["data"]["title"], "</script>");
        assert_eq!(state["query"]["user:1"]["name"], "Ada");
        assert_eq!(state["signature"], "1.abc");
        assert!(state.get("pending").is_none());
    }

    #[tokio::test]
    async fn streamed_values_are_appended_before_closing() {
        let defer = DeferContext::new("/blog/[slug]", true, true);
        let comments = defer.defer(
            async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(json!(["first"]))
            },
            DeferOptions::new().key("comments"),
        );
        let matches = vec![ok(
            "/blog/[slug]",
            json!({ "title": "T", "comments": comments }),
        )];
        let chain = chain();
        let location = Location::default();
        let head = HeadConfig::default();

        let body = DocumentRenderer::default()
            .render(parts(&chain, &location, &matches, &head, defer.take_streaming()))
            .unwrap();
        assert!(matches!(body, Body::Stream(_)));
        let html = String::from_utf8(body.collect().await).unwrap();

        let chunk_at = html.find("data-chunk").unwrap();
        assert!(html[chunk_at..].contains(r#""k":"comments","d":["first"]"#));
        assert!(html.ends_with("</body></html>"));

        let state_at = html.find("__routeweave_state").unwrap();
        assert!(chunk_at < state_at);
        let state = state_of(&html);
        assert_eq!(state["matches"][0]["data"]["comments"], json!(["first"]));
        assert_eq!(state["signature"], "1.abc");
    }

    #[tokio::test]
    async fn streamed_state_carries_settled_values_and_errors() {
        let defer = DeferContext::new("/blog/[slug]", true, true);
        let comments = defer.defer(
            async { Ok(json!(["a", "b"])) },
            DeferOptions::new().key("comments"),
        );
        let related = defer.defer(
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Err("search offline".into())
            },
            DeferOptions::new().key("related"),
        );
        let matches = vec![
            ok("/_layout", json!({ "nav": { "$defer": "comments" } })),
            ok(
                "/blog/[slug]",
                json!({ "title": "T", "comments": comments, "extra": { "related": related } }),
            ),
        ];
        let chain = chain();
        let location = Location::default();
        let head = HeadConfig::default();

        let body = DocumentRenderer::default()
            .render(parts(&chain, &location, &matches, &head, defer.take_streaming()))
            .unwrap();
        let html = String::from_utf8(body.collect().await).unwrap();

        let state = state_of(&html);
        let page = &state["matches"][1]["data"];
        assert_eq!(page["comments"], json!(["a", "b"]));
        assert_eq!(page["extra"]["related"], json!({ "$deferError": "search offline" }));
        // Another position's lookalike key is left alone.
        assert_eq!(state["matches"][0]["data"]["nav"], json!({ "$defer": "comments" }));
        assert!(!page.to_string().contains(r#""$defer":"#), "{page}");
    }
}
