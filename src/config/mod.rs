//! Render configuration.
//!
//! Every section has defaults, so an empty TOML file is a valid config:
//!
//! ```toml
//! stream_initial_defers = false
//! prefetch_max_age_secs = 10
//!
//! [document]
//! lang = "en"
//! state_script_id = "__routeweave_state"
//! entry_script = "/assets/entry.js"
//!
//! [signing]
//! secret = "change-me"
//! window_secs = 300
//! scope = "blog"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::security::{DEFAULT_SCOPE, DataSigner};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("signing secret must not be empty")]
    EmptySecret,
}

/// App-wide rendering settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Stream deferred values without an explicit `stream` option even while
    /// building the initial document. Routes may override it.
    pub stream_initial_defers: bool,

    /// `max-age` of prefetched data responses.
    pub prefetch_max_age_secs: u64,

    pub document: DocumentConfig,

    /// Enables signed data requests when present.
    pub signing: Option<SigningConfig>,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            stream_initial_defers: false,
            prefetch_max_age_secs: 10,
            document: DocumentConfig::default(),
            signing: None,
        }
    }
}

/// Shape of the full HTML document.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct DocumentConfig {
    pub lang: String,
    /// `id` of the embedded hydration state block.
    pub state_script_id: String,
    /// Client entry module, loaded with the request nonce.
    pub entry_script: Option<String>,
}

impl Default for DocumentConfig {
    fn default() -> Self {
        Self {
            lang: "en".to_owned(),
            state_script_id: "__routeweave_state".to_owned(),
            entry_script: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SigningConfig {
    pub secret: String,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// App or build identifier the tokens are bound to.
    #[serde(default = "default_scope")]
    pub scope: String,
}

fn default_window_secs() -> u64 {
    300
}

fn default_scope() -> String {
    DEFAULT_SCOPE.to_owned()
}

impl RenderConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate TOML.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: RenderConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match &self.signing {
            Some(signing) if signing.secret.is_empty() => Err(ConfigError::EmptySecret),
            _ => Ok(()),
        }
    }

    #[must_use]
    pub fn stream_initial_defers(mut self, stream: bool) -> Self {
        self.stream_initial_defers = stream;
        self
    }

    #[must_use]
    pub fn prefetch_max_age_secs(mut self, secs: u64) -> Self {
        self.prefetch_max_age_secs = secs;
        self
    }

    #[must_use]
    pub fn lang(mut self, lang: impl Into<String>) -> Self {
        self.document.lang = lang.into();
        self
    }

    #[must_use]
    pub fn entry_script(mut self, src: impl Into<String>) -> Self {
        self.document.entry_script = Some(src.into());
        self
    }

    #[must_use]
    pub fn signing(mut self, secret: impl Into<String>, window_secs: u64) -> Self {
        self.signing = Some(SigningConfig {
            secret: secret.into(),
            window_secs,
            scope: default_scope(),
        });
        self
    }

    /// The signer described by `[signing]`, if any.
    pub fn signer(&self) -> Option<DataSigner> {
        self.signing
            .as_ref()
            .map(|s| DataSigner::new(&s.secret, Duration::from_secs(s.window_secs)).scope(&s.scope))
    }
}
