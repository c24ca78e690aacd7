//! Route tree: resolve a URL path to a route payload plus captured params.
//!
//! The tree is a static prefix tree keyed by path segment. Every node may have
//! literal children and up to three wildcard children:
//!
//! | Child                | Builder syntax | Matches                     | Captured as          |
//! |----------------------|----------------|-----------------------------|----------------------|
//! | static               | `blog`         | exactly that segment        | *(nothing)*          |
//! | param                | `:slug`        | exactly one segment         | `slug → "hello"`     |
//! | catch-all            | `*path`        | one or more trailing segments | `path → ["a", "b"]` |
//! | optional catch-all   | `*path?`       | zero or more trailing segments | `path → []`        |
//!
//! At every level the candidates are tried in that order (static, param,
//! catch-all, optional catch-all); a candidate whose subtree fails to reach a
//! route payload gives way to the next one. Nodes without a payload are layout
//! positions only and are never routable by themselves.
//!
//! The tree is built once (from a manifest or with [`RouteTree::insert`]) and is
//! read-only while serving requests.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::context::{ParamValue, Params};

/// Errors raised while building a route tree.
#[derive(Debug, Error)]
pub enum RouteTreeError {
    #[error("route pattern `{pattern}` conflicts with an existing {existing} at the same level")]
    ConflictingWildcard {
        pattern: String,
        existing: &'static str,
    },

    #[error("route pattern `{pattern}` has a catch-all that is not the last segment")]
    CatchAllNotLast { pattern: String },

    #[error("route pattern `{pattern}` has an empty parameter name")]
    EmptyParamName { pattern: String },

    #[error("route `{pattern}` is already registered")]
    DuplicateRoute { pattern: String },

    #[error("invalid route manifest: {0}")]
    Manifest(#[from] serde_json::Error),
}

/// Per-route options carried in the manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RouteOptions {
    /// Overrides the app-wide `stream_initial_defers` for this route.
    pub stream_initial_defers: Option<bool>,
    /// `Cache-Control` applied to document responses of this route.
    pub cache_control: Option<String>,
}

/// What a routable node resolves to: the page and the layouts wrapping it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutePayload {
    /// Virtual path of the page component.
    pub page: String,
    /// Virtual paths of the layouts wrapping the page, root first.
    #[serde(default)]
    pub layouts: Vec<String>,
    #[serde(default)]
    pub options: RouteOptions,
}

impl RoutePayload {
    pub fn new(page: impl Into<String>) -> Self {
        Self {
            page: page.into(),
            layouts: Vec::new(),
            options: RouteOptions::default(),
        }
    }

    #[must_use]
    pub fn layout(mut self, virtual_path: impl Into<String>) -> Self {
        self.layouts.push(virtual_path.into());
        self
    }

    #[must_use]
    pub fn options(mut self, options: RouteOptions) -> Self {
        self.options = options;
        self
    }

    /// Virtual paths of the whole chain, root first, page last.
    pub fn chain(&self) -> impl Iterator<Item = &str> {
        self.layouts
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(self.page.as_str()))
    }
}

/// A named wildcard child.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct WildcardChild {
    pub name: String,
    pub node: Box<RouteNode>,
}

/// One node of the route tree, deserializable from the precompiled manifest.
///
/// Trees produced by [`RouteTree::insert`] hold at most one of `param`,
/// `catch_all` and `optional_catch_all` per node; the matcher still defines a
/// priority among all three for hand-assembled manifests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RouteNode {
    #[serde(rename = "static", skip_serializing_if = "HashMap::is_empty")]
    pub static_children: HashMap<String, RouteNode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub param: Option<WildcardChild>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub catch_all: Option<WildcardChild>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub optional_catch_all: Option<WildcardChild>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route: Option<RoutePayload>,
}

impl RouteNode {
    // Which wildcard form this node already holds, if any.
    fn wildcard_kind(&self) -> Option<&'static str> {
        if self.param.is_some() {
            Some("parameter")
        } else if self.catch_all.is_some() {
            Some("catch-all")
        } else if self.optional_catch_all.is_some() {
            Some("optional catch-all")
        } else {
            None
        }
    }

    // Depth-first search in priority order; `params` is restored on backtrack.
    fn search<'a>(&'a self, segments: &[&str], params: &mut Params) -> Option<&'a RoutePayload> {
        let Some((&segment, rest)) = segments.split_first() else {
            if let Some(route) = &self.route {
                return Some(route);
            }
            // Zero remaining segments: only the optional catch-all can still match.
            let child = self.optional_catch_all.as_ref()?;
            let route = child.node.route.as_ref()?;
            params.insert(child.name.clone(), ParamValue::Many(Vec::new()));
            return Some(route);
        };

        if let Some(child) = self.static_children.get(segment) {
            if let Some(route) = child.search(rest, params) {
                return Some(route);
            }
        }

        if let Some(child) = &self.param {
            let previous = params.remove(&child.name);
            params.insert(child.name.clone(), ParamValue::One(segment.to_owned()));
            if let Some(route) = child.node.search(rest, params) {
                return Some(route);
            }
            params.remove(&child.name);
            if let Some(previous) = previous {
                params.insert(child.name.clone(), previous);
            }
        }

        for child in [&self.catch_all, &self.optional_catch_all]
            .into_iter()
            .flatten()
        {
            if let Some(route) = &child.node.route {
                let captured = segments.iter().map(|s| (*s).to_owned()).collect();
                params.insert(child.name.clone(), ParamValue::Many(captured));
                return Some(route);
            }
        }

        None
    }
}

/// Result of matching a URL path.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteMatch<'a> {
    pub route: &'a RoutePayload,
    pub params: Params,
}

// A parsed pattern segment.
enum PatternSegment<'p> {
    Static(&'p str),
    Param(&'p str),
    CatchAll(&'p str),
    OptionalCatchAll(&'p str),
}

/// The compiled route tree.
///
/// # Examples
///
/// ```
/// use routeweave::router::{RoutePayload, RouteTree};
///
/// let mut tree = RouteTree::new();
/// tree.insert("/", RoutePayload::new("/index")).unwrap();
/// tree.insert("/blog/:slug", RoutePayload::new("/blog/[slug]").layout("/_layout")).unwrap();
/// tree.insert("/docs/*path", RoutePayload::new("/docs/[...path]")).unwrap();
///
/// let m = tree.match_path("/blog/hello").unwrap();
/// assert_eq!(m.route.page, "/blog/[slug]");
/// assert_eq!(m.params.get_str("slug"), Some("hello"));
///
/// assert!(tree.match_path("/docs").is_none());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct RouteTree {
    root: RouteNode,
}

impl RouteTree {
    /// Create an empty tree that matches nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an already-built root node.
    pub fn from_root(root: RouteNode) -> Self {
        Self { root }
    }

    /// Load a precompiled manifest (the JSON form of [`RouteNode`]).
    ///
    /// # Errors
    ///
    /// Returns [`RouteTreeError::Manifest`] when the JSON does not describe a node.
    pub fn from_manifest_json(json: &str) -> Result<Self, RouteTreeError> {
        let root: RouteNode = serde_json::from_str(json)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &RouteNode {
        &self.root
    }

    /// Register `payload` under `pattern`.
    ///
    /// # Errors
    ///
    /// - [`RouteTreeError::ConflictingWildcard`]: a different wildcard form already
    ///   exists at one of the levels `pattern` passes through.
    /// - [`RouteTreeError::CatchAllNotLast`]: segments follow a catch-all.
    /// - [`RouteTreeError::EmptyParamName`]: `:` or `*` without a name.
    /// - [`RouteTreeError::DuplicateRoute`]: the terminal node already has a payload.
    pub fn insert(&mut self, pattern: &str, payload: RoutePayload) -> Result<(), RouteTreeError> {
        let segments = parse_pattern(pattern)?;
        let mut node = &mut self.root;

        for segment in segments {
            node = match segment {
                PatternSegment::Static(s) => node.static_children.entry(s.to_owned()).or_default(),
                PatternSegment::Param(name) => {
                    wildcard_slot(node, pattern, name, |n| &mut n.param, "parameter")?
                }
                PatternSegment::CatchAll(name) => {
                    wildcard_slot(node, pattern, name, |n| &mut n.catch_all, "catch-all")?
                }
                PatternSegment::OptionalCatchAll(name) => wildcard_slot(
                    node,
                    pattern,
                    name,
                    |n| &mut n.optional_catch_all,
                    "optional catch-all",
                )?,
            };
        }

        if node.route.is_some() {
            return Err(RouteTreeError::DuplicateRoute {
                pattern: pattern.to_owned(),
            });
        }
        node.route = Some(payload);
        Ok(())
    }

    /// Match `pathname` against the tree.
    ///
    /// Empty segments are ignored, so `/blog//post/` matches like `/blog/post`.
    /// Returns `None` when no route payload is reachable.
    pub fn match_path(&self, pathname: &str) -> Option<RouteMatch<'_>> {
        let segments: Vec<&str> = pathname.split('/').filter(|s| !s.is_empty()).collect();
        let mut params = Params::new();
        let route = self.root.search(&segments, &mut params)?;
        Some(RouteMatch { route, params })
    }
}

// Descend into (creating if needed) the wildcard child selected by `slot`.
fn wildcard_slot<'n>(
    node: &'n mut RouteNode,
    pattern: &str,
    name: &str,
    slot: fn(&mut RouteNode) -> &mut Option<WildcardChild>,
    kind: &'static str,
) -> Result<&'n mut RouteNode, RouteTreeError> {
    if let Some(existing) = node.wildcard_kind() {
        let same_form = existing == kind;
        let same_name = slot(node).as_ref().is_some_and(|c| c.name == name);
        if !(same_form && same_name) {
            return Err(RouteTreeError::ConflictingWildcard {
                pattern: pattern.to_owned(),
                existing,
            });
        }
    }

    let child = slot(node).get_or_insert_with(|| WildcardChild {
        name: name.to_owned(),
        node: Box::default(),
    });
    Ok(&mut child.node)
}

fn parse_pattern(pattern: &str) -> Result<Vec<PatternSegment<'_>>, RouteTreeError> {
    let raw: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
    let mut segments = Vec::with_capacity(raw.len());

    for (i, s) in raw.iter().enumerate() {
        let is_last = i + 1 == raw.len();
        let segment = if let Some(name) = s.strip_prefix(':') {
            PatternSegment::Param(name)
        } else if let Some(rest) = s.strip_prefix('*') {
            if !is_last {
                return Err(RouteTreeError::CatchAllNotLast {
                    pattern: pattern.to_owned(),
                });
            }
            match rest.strip_suffix('?') {
                Some(name) => PatternSegment::OptionalCatchAll(name),
                None => PatternSegment::CatchAll(rest),
            }
        } else {
            PatternSegment::Static(s)
        };

        if let PatternSegment::Param(name)
        | PatternSegment::CatchAll(name)
        | PatternSegment::OptionalCatchAll(name) = &segment
        {
            if name.is_empty() {
                return Err(RouteTreeError::EmptyParamName {
                    pattern: pattern.to_owned(),
                });
            }
        }
        segments.push(segment);
    }

    Ok(segments)
}
