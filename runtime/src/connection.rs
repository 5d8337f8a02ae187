//! The connection: one POST per message, and response classification.
//!
//! [`Connection`] owns the request contract (endpoint, headers, CSRF token)
//! and turns whatever comes back into a [`ConnectionOutcome`]. The bytes move
//! through a [`Transport`], so tests can script responses without a server.

use crate::config::{ConfigError, RuntimeConfig};
use futures::future::BoxFuture;
use raxm_core::dom::Document;
use raxm_core::message::{RequestPayload, ResponsePayload};
use regex::Regex;
use std::fmt;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use thiserror::Error;

/// Header carrying the CSRF token
pub const CSRF_HEADER: &str = "X-CSRF-TOKEN";

/// Framework marker header
pub const MARKER_HEADER: &str = "X-Raxm";

/// Status the server uses for an expired session/token
pub const SESSION_EXPIRED_STATUS: u16 = 419;

#[allow(clippy::expect_used)] // Hardcoded pattern
static DUMP_SIGNATURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<script[^>]*>\s*Sfdump\s*=\s*window\.Sfdump").expect("valid regex")
});

/// Transport-level failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// The request never produced a response
    #[error("Request failed: {0}")]
    Transport(String),

    /// No response within the configured timeout
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// The payload could not be encoded
    #[error("Could not encode request: {0}")]
    Encode(String),
}

/// An outgoing HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Absolute or origin-relative URL
    pub url: String,
    /// Header name/value pairs in send order
    pub headers: Vec<(String, String)>,
    /// JSON body
    pub body: String,
}

impl HttpRequest {
    /// Header value by case-insensitive name
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

/// A received HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code
    pub status: u16,
    /// Header name/value pairs
    pub headers: Vec<(String, String)>,
    /// Body text
    pub body: String,
}

impl HttpResponse {
    /// Response with no headers
    #[must_use]
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// Add a header
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Header value by case-insensitive name
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Moves a request to the server and the response back.
pub trait Transport: Send + Sync {
    /// Perform the request
    fn send(&self, request: HttpRequest) -> BoxFuture<'static, Result<HttpResponse, ConnectionError>>;
}

/// [`Transport`] over `reqwest`. Redirects are not followed, so they can be
/// reported to the page instead.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    timeout: Duration,
}

impl ReqwestTransport {
    /// Build a client with the given per-request timeout
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Transport`] when the TLS backend fails to initialize.
    pub fn new(timeout: Duration) -> Result<Self, ConnectionError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(timeout)
            .build()
            .map_err(|e| ConnectionError::Transport(e.to_string()))?;
        Ok(Self { client, timeout })
    }
}

impl Transport for ReqwestTransport {
    fn send(&self, request: HttpRequest) -> BoxFuture<'static, Result<HttpResponse, ConnectionError>> {
        let client = self.client.clone();
        let timeout = self.timeout;
        Box::pin(async move {
            let mut builder = client.post(&request.url).body(request.body);
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            let response = builder.send().await.map_err(|e| {
                if e.is_timeout() {
                    ConnectionError::Timeout(timeout)
                } else {
                    ConnectionError::Transport(e.to_string())
                }
            })?;
            let status = response.status().as_u16();
            let headers = response
                .headers()
                .iter()
                .filter_map(|(n, v)| Some((n.as_str().to_string(), v.to_str().ok()?.to_string())))
                .collect();
            let body = response
                .text()
                .await
                .map_err(|e| ConnectionError::Transport(e.to_string()))?;
            Ok(HttpResponse { status, headers, body })
        })
    }
}

/// What a round trip amounted to.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionOutcome {
    /// 2xx JSON: merge memo and patch
    Success(Box<ResponsePayload>),
    /// 3xx: leave the page
    Redirect(String),
    /// 2xx debug dump: show it, don't patch
    Dump(String),
    /// 419: session or token expired
    SessionExpired,
    /// Anything else, including transport errors
    Failed {
        /// HTTP status, `None` when no response arrived
        status: Option<u16>,
        /// Response body or error description
        body: String,
    },
}

impl ConnectionOutcome {
    /// Short label for logs and metrics
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::Redirect(_) => "redirect",
            Self::Dump(_) => "dump",
            Self::SessionExpired => "session_expired",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Request builder and response classifier for one page.
pub struct Connection {
    transport: Arc<dyn Transport>,
    base_url: String,
    csrf_token: String,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// A connection with an explicit token
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, base_url: impl Into<String>, csrf_token: impl Into<String>) -> Self {
        Self {
            transport,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            csrf_token: csrf_token.into(),
        }
    }

    /// A connection whose token is read from the page.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingCsrfToken`] when no token source is present.
    pub fn from_document(
        document: &Document,
        config: &RuntimeConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, ConfigError> {
        let token = resolve_csrf_token(document, config)?;
        Ok(Self::new(transport, config.base_url.clone(), token))
    }

    /// Update endpoint for a component name
    #[must_use]
    pub fn endpoint(&self, component_name: &str) -> String {
        format!("{}/raxm/update/{component_name}", self.base_url)
    }

    /// Build the HTTP request for a payload.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Encode`] if the payload fails to serialize.
    pub fn request(&self, component_name: &str, payload: &RequestPayload) -> Result<HttpRequest, ConnectionError> {
        let body = serde_json::to_string(payload).map_err(|e| ConnectionError::Encode(e.to_string()))?;
        let headers = [
            ("Content-Type", "application/json"),
            ("Accept", "text/html, application/xhtml+xml"),
            ("X-Requested-With", "XMLHttpRequest"),
            (MARKER_HEADER, "true"),
            (CSRF_HEADER, self.csrf_token.as_str()),
        ]
        .into_iter()
        .map(|(n, v)| (n.to_string(), v.to_string()))
        .collect();
        Ok(HttpRequest {
            url: self.endpoint(component_name),
            headers,
            body,
        })
    }

    /// Send a payload and classify the result. Never fails: errors become
    /// [`ConnectionOutcome::Failed`].
    pub async fn send(&self, component_name: &str, payload: &RequestPayload) -> ConnectionOutcome {
        let request = match self.request(component_name, payload) {
            Ok(request) => request,
            Err(error) => {
                return ConnectionOutcome::Failed {
                    status: None,
                    body: error.to_string(),
                };
            },
        };
        tracing::debug!(url = %request.url, "Sending message");
        match self.transport.send(request).await {
            Ok(response) => classify(response),
            Err(error) => {
                tracing::warn!(%error, component = component_name, "Transport error");
                ConnectionOutcome::Failed {
                    status: None,
                    body: error.to_string(),
                }
            },
        }
    }
}

/// Find the CSRF token: meta tag, then data attribute, then script config.
///
/// # Errors
///
/// Returns [`ConfigError::MissingCsrfToken`] when all three are absent or empty.
pub fn resolve_csrf_token(document: &Document, config: &RuntimeConfig) -> Result<String, ConfigError> {
    let nodes = document.descendants(document.root());

    let meta = nodes.iter().find_map(|&n| {
        (document.tag(n) == Some("meta") && document.attribute(n, "name") == Some(config.csrf_meta_name.as_str()))
            .then(|| document.attribute(n, "content"))
            .flatten()
            .filter(|t| !t.is_empty())
    });
    if let Some(token) = meta {
        return Ok(token.to_string());
    }

    let data = nodes
        .iter()
        .find_map(|&n| document.attribute(n, &config.csrf_data_attribute).filter(|t| !t.is_empty()));
    if let Some(token) = data {
        return Ok(token.to_string());
    }

    config
        .script_token
        .clone()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ConfigError::MissingCsrfToken {
            meta_name: config.csrf_meta_name.clone(),
            data_attribute: config.csrf_data_attribute.clone(),
        })
}

/// Whether a body looks like a framework debug dump
#[must_use]
pub fn is_debug_dump(body: &str) -> bool {
    DUMP_SIGNATURE.is_match(body)
}

/// Classify a raw response.
#[must_use]
pub fn classify(response: HttpResponse) -> ConnectionOutcome {
    let status = response.status;
    if (300..400).contains(&status) {
        if let Some(location) = response.header("Location") {
            return ConnectionOutcome::Redirect(location.to_string());
        }
    }
    if status == SESSION_EXPIRED_STATUS {
        return ConnectionOutcome::SessionExpired;
    }
    if !(200..300).contains(&status) {
        return ConnectionOutcome::Failed {
            status: Some(status),
            body: response.body,
        };
    }
    if is_debug_dump(&response.body) {
        return ConnectionOutcome::Dump(response.body);
    }
    match serde_json::from_str::<ResponsePayload>(&response.body) {
        Ok(payload) => ConnectionOutcome::Success(Box::new(payload)),
        Err(error) => {
            tracing::warn!(%error, "Response body is not a valid payload");
            ConnectionOutcome::Failed {
                status: Some(status),
                body: response.body,
            }
        },
    }
}
