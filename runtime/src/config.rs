//! Runtime configuration.
//!
//! Defaults match what a server-rendered page expects out of the box; every
//! field can be overridden from the environment with [`RuntimeConfig::from_env`].

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors. All of them are fatal at boot.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// No CSRF token in the meta tag, the data attribute, or the script config
    #[error(
        "No CSRF token found (looked for <meta name=\"{meta_name}\">, a [{data_attribute}] attribute, and the script config)"
    )]
    MissingCsrfToken {
        /// Meta tag name searched
        meta_name: String,
        /// Data attribute searched
        data_attribute: String,
    },

    /// The debounce window must be positive
    #[error("Model debounce window must be greater than zero")]
    ZeroDebounce,

    /// `base_url` must be empty or an http(s) URL
    #[error("Invalid base URL {0:?}: expected an http:// or https:// URL")]
    InvalidBaseUrl(String),

    /// An environment variable did not parse
    #[error("Invalid value for {name}: {value:?}")]
    InvalidVariable {
        /// Variable name
        name: &'static str,
        /// Raw value
        value: String,
    },
}

/// Page runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Prefix for the update endpoint; empty means same origin
    pub base_url: String,
    /// Default debounce window for text-input model bindings
    pub model_debounce_ms: u64,
    /// `<meta name=...>` holding the CSRF token
    pub csrf_meta_name: String,
    /// Attribute holding the CSRF token on any element
    pub csrf_data_attribute: String,
    /// Token injected by the host page's script config
    pub script_token: Option<String>,
    /// Default `EnvFilter` directive for [`crate::telemetry::init_tracing`]
    pub log_filter: String,
    /// Per-request timeout for the HTTP transport
    pub request_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            model_debounce_ms: 150,
            csrf_meta_name: "csrf-token".to_string(),
            csrf_data_attribute: "data-csrf".to_string(),
            script_token: None,
            log_filter: "raxm_runtime=info".to_string(),
            request_timeout_ms: 30_000,
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by `RAXM_BASE_URL`, `RAXM_MODEL_DEBOUNCE_MS`,
    /// `RAXM_CSRF_TOKEN` and `RAXM_LOG`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidVariable`] when a numeric variable does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`RuntimeConfig::from_env`] with an injectable variable source.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidVariable`] when a numeric variable does not parse.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(url) = lookup("RAXM_BASE_URL") {
            config.base_url = url;
        }
        if let Some(raw) = lookup("RAXM_MODEL_DEBOUNCE_MS") {
            config.model_debounce_ms = raw.trim().parse().map_err(|_| ConfigError::InvalidVariable {
                name: "RAXM_MODEL_DEBOUNCE_MS",
                value: raw.clone(),
            })?;
        }
        if let Some(token) = lookup("RAXM_CSRF_TOKEN") {
            config.script_token = Some(token);
        }
        if let Some(filter) = lookup("RAXM_LOG") {
            config.log_filter = filter;
        }
        Ok(config)
    }

    /// Set the base URL
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Set the default model debounce window
    #[must_use]
    pub const fn with_model_debounce_ms(mut self, ms: u64) -> Self {
        self.model_debounce_ms = ms;
        self
    }

    /// Set the script-config CSRF token
    #[must_use]
    pub fn with_script_token(mut self, token: impl Into<String>) -> Self {
        self.script_token = Some(token.into());
        self
    }

    /// Check invariants.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ZeroDebounce`] or [`ConfigError::InvalidBaseUrl`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model_debounce_ms == 0 {
            return Err(ConfigError::ZeroDebounce);
        }
        if !self.base_url.is_empty()
            && !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://"))
        {
            return Err(ConfigError::InvalidBaseUrl(self.base_url.clone()));
        }
        Ok(())
    }

    /// Default model debounce window
    #[must_use]
    pub const fn model_debounce(&self) -> Duration {
        Duration::from_millis(self.model_debounce_ms)
    }

    /// Per-request timeout
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.model_debounce(), Duration::from_millis(150));
        assert_eq!(config.csrf_meta_name, "csrf-token");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_lookup_overrides() {
        let vars: HashMap<&str, &str> = [
            ("RAXM_BASE_URL", "https://app.test"),
            ("RAXM_MODEL_DEBOUNCE_MS", "300"),
            ("RAXM_CSRF_TOKEN", "tok"),
        ]
        .into_iter()
        .collect();
        let config = RuntimeConfig::from_lookup(|k| vars.get(k).map(ToString::to_string)).unwrap();
        assert_eq!(config.base_url, "https://app.test");
        assert_eq!(config.model_debounce_ms, 300);
        assert_eq!(config.script_token.as_deref(), Some("tok"));
        assert_eq!(config.log_filter, "raxm_runtime=info");
    }

    #[test]
    fn test_bad_number_is_reported() {
        let err = RuntimeConfig::from_lookup(|k| (k == "RAXM_MODEL_DEBOUNCE_MS").then(|| "soon".to_string()))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidVariable {
                name: "RAXM_MODEL_DEBOUNCE_MS",
                value: "soon".into()
            }
        );
    }

    #[test]
    fn test_validate() {
        assert_eq!(
            RuntimeConfig::default().with_model_debounce_ms(0).validate(),
            Err(ConfigError::ZeroDebounce)
        );
        assert_eq!(
            RuntimeConfig::default().with_base_url("ftp://x").validate(),
            Err(ConfigError::InvalidBaseUrl("ftp://x".into()))
        );
        assert!(RuntimeConfig::default().with_base_url("http://localhost:8000").validate().is_ok());
    }
}
