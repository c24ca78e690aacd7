//! Head and response-header resolution along the matched chain.
//!
//! Each chain position may declare a `head` hook returning a partial
//! [`HeadConfig`] and a `headers` hook returning response [`Headers`]. The
//! resolver walks the chain root-first, handing every hook the accumulation so
//! far, and merges its output on top:
//!
//! - head metadata uses [`HeadConfig::merge`]: scalars are overridden by the
//!   child, lists concatenate parent-then-child, keyed maps shallow-merge with
//!   child keys winning;
//! - headers are a flat per-key overwrite.
//!
//! Positions without the hook are skipped.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::component::{ContextMap, MatchedComponent};
use crate::context::Location;
use crate::http::Headers;
use crate::loader::LoaderResult;

/// An extra tag rendered verbatim into `<head>`, e.g. `<link rel="preconnect">`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadTag {
    pub tag: String,
    #[serde(default)]
    pub attrs: BTreeMap<String, String>,
}

impl HeadTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            attrs: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(name.into(), value.into());
        self
    }
}

/// Declarative document metadata.
///
/// # Examples
///
/// ```
/// use routeweave::head::HeadConfig;
///
/// let site = HeadConfig::titled("Site");
/// let page = HeadConfig {
///     description: Some("Welcome".into()),
///     ..HeadConfig::titled("Site - Home")
/// };
/// let merged = site.merge(&page);
/// assert_eq!(merged.title.as_deref(), Some("Site - Home"));
/// assert_eq!(merged.description.as_deref(), Some("Welcome"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HeadConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canonical: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub robots: Option<String>,
    /// `og:type`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub og_type: Option<String>,
    /// `og:site_name`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site_name: Option<String>,
    /// `twitter:card`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub twitter_card: Option<String>,
    /// Social preview image URLs.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    /// JSON-LD entries.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub structured_data: Vec<Value>,
    /// `<meta name=… content=…>` pairs.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, String>,
    /// hreflang → URL alternates.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub languages: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<HeadTag>,
}

impl HeadConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Self::default()
        }
    }

    /// `self` as parent, `child` on top.
    #[must_use]
    pub fn merge(&self, child: &HeadConfig) -> HeadConfig {
        let mut merged = self.clone();
        merged.merge_from(child.clone());
        merged
    }

    /// In-place [`merge`](Self::merge).
    pub fn merge_from(&mut self, child: HeadConfig) {
        fn scalar(parent: &mut Option<String>, child: Option<String>) {
            if child.is_some() {
                *parent = child;
            }
        }

        scalar(&mut self.title, child.title);
        scalar(&mut self.description, child.description);
        scalar(&mut self.canonical, child.canonical);
        scalar(&mut self.robots, child.robots);
        scalar(&mut self.og_type, child.og_type);
        scalar(&mut self.site_name, child.site_name);
        scalar(&mut self.twitter_card, child.twitter_card);

        self.images.extend(child.images);
        self.structured_data.extend(child.structured_data);
        self.tags.extend(child.tags);

        self.meta.extend(child.meta);
        self.languages.extend(child.languages);
    }

    /// Render as `<head>` children. `nonce` is set on JSON-LD scripts.
    pub fn render(&self, nonce: &str) -> String {
        let mut html = String::new();

        if let Some(title) = &self.title {
            let _ = write!(html, "<title>{}</title>", escape_html(title));
            push_meta(&mut html, "property", "og:title", title);
        }
        if let Some(description) = &self.description {
            push_meta(&mut html, "name", "description", description);
            push_meta(&mut html, "property", "og:description", description);
        }
        if let Some(canonical) = &self.canonical {
            let _ = write!(
                html,
                r#"<link rel="canonical" href="{}">"#,
                escape_html(canonical)
            );
        }
        if let Some(robots) = &self.robots {
            push_meta(&mut html, "name", "robots", robots);
        }
        if let Some(og_type) = &self.og_type {
            push_meta(&mut html, "property", "og:type", og_type);
        }
        if let Some(site_name) = &self.site_name {
            push_meta(&mut html, "property", "og:site_name", site_name);
        }
        if let Some(card) = &self.twitter_card {
            push_meta(&mut html, "name", "twitter:card", card);
        }
        for image in &self.images {
            push_meta(&mut html, "property", "og:image", image);
        }
        for (lang, href) in &self.languages {
            let _ = write!(
                html,
                r#"<link rel="alternate" hreflang="{}" href="{}">"#,
                escape_html(lang),
                escape_html(href)
            );
        }
        for (name, content) in &self.meta {
            push_meta(&mut html, "name", name, content);
        }
        for tag in &self.tags {
            let _ = write!(html, "<{}", escape_html(&tag.tag));
            for (name, value) in &tag.attrs {
                let _ = write!(html, r#" {}="{}""#, escape_html(name), escape_html(value));
            }
            html.push('>');
        }
        for entry in &self.structured_data {
            let _ = write!(
                html,
                r#"<script type="application/ld+json" nonce="{}">{}</script>"#,
                escape_html(nonce),
                escape_script_json(&entry.to_string())
            );
        }

        html
    }
}

fn push_meta(html: &mut String, attr: &str, key: &str, content: &str) {
    let _ = write!(
        html,
        r#"<meta {attr}="{}" content="{}">"#,
        escape_html(key),
        escape_html(content)
    );
}

/// Escape text for an HTML attribute or text node.
pub(crate) fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

/// Make serialized JSON safe inside `<script>`: no `</script>` or `<!--`.
pub(crate) fn escape_script_json(json: &str) -> String {
    json.replace('<', "\\u003c")
        .replace('\u{2028}', "\\u2028")
        .replace('\u{2029}', "\\u2029")
}

/// What `head` and `headers` hooks see.
#[derive(Debug)]
pub struct HeadContext<'a> {
    pub virtual_path: &'a str,
    /// Merged head of the ancestors. For `headers` hooks, the fully resolved head.
    pub parent_head: &'a HeadConfig,
    /// Merged headers of the ancestors. Empty for `head` hooks.
    pub parent_headers: &'a Headers,
    pub location: &'a Location,
    /// This position's loader data; `Null` if it failed or did not run.
    pub data: &'a Value,
    /// This position's loader error, if any.
    pub error: Option<&'a str>,
    pub preloader_context: &'a ContextMap,
}

/// Request-wide inputs shared by every head/headers hook.
#[derive(Debug, Clone, Copy)]
pub struct ChainInputs<'a> {
    pub location: &'a Location,
    pub preloader_context: &'a ContextMap,
    pub matches: &'a [LoaderResult],
}

impl<'a> ChainInputs<'a> {
    fn result(&self, virtual_path: &str) -> Option<&'a LoaderResult> {
        self.matches.iter().find(|r| r.virtual_path == virtual_path)
    }
}

/// Fold every `head` hook of `chain` root-first.
pub fn resolve_head(chain: &[Arc<MatchedComponent>], inputs: ChainInputs<'_>) -> HeadConfig {
    let no_headers = Headers::new();
    let mut head = HeadConfig::new();

    for component in chain {
        let Some(hook) = &component.head else {
            continue;
        };
        let result = inputs.result(component.virtual_path());
        let partial = hook(&HeadContext {
            virtual_path: component.virtual_path(),
            parent_head: &head,
            parent_headers: &no_headers,
            location: inputs.location,
            data: result.and_then(LoaderResult::data).unwrap_or(&Value::Null),
            error: result.and_then(LoaderResult::error),
            preloader_context: inputs.preloader_context,
        });
        head.merge_from(partial);
    }

    head
}

/// Fold every `headers` hook of `chain` root-first, child keys overwriting.
pub fn resolve_headers(
    chain: &[Arc<MatchedComponent>],
    inputs: ChainInputs<'_>,
    head: &HeadConfig,
) -> Headers {
    let mut headers = Headers::new();

    for component in chain {
        let Some(hook) = &component.headers else {
            continue;
        };
        let result = inputs.result(component.virtual_path());
        let partial = hook(&HeadContext {
            virtual_path: component.virtual_path(),
            parent_head: head,
            parent_headers: &headers,
            location: inputs.location,
            data: result.and_then(LoaderResult::data).unwrap_or(&Value::Null),
            error: result.and_then(LoaderResult::error),
            preloader_context: inputs.preloader_context,
        });
        headers.overlay(&partial);
    }

    headers
}
