//! # Raxm Testing
//!
//! Test doubles and helpers for the Raxm page runtime.
//!
//! This crate provides:
//! - A fixed clock for predictable snapshot keys
//! - [`MockTransport`]: scripted responses, request log, hold/release gating
//! - [`RecordingUi`]: records prompts, navigations, modals and reloads
//! - Fixture builders for component markup and server responses
//! - A Given-When-Then harness for reducers
//!
//! ## Example
//!
//! ```ignore
//! use raxm_testing::{MockTransport, RecordingUi, fixtures};
//!
//! #[tokio::test(start_paused = true)]
//! async fn test_counter() {
//!     let transport = MockTransport::new();
//!     let ui = Arc::new(RecordingUi::new());
//!     let page = Page::boot(
//!         &fixtures::page_html(&fixtures::component_html("c1", "counter", &json!({"n": 0}), "<button raxm:click=\"inc\">+</button>")),
//!         RuntimeConfig::default(),
//!         HostServices::new(Arc::new(transport.clone()), ui.clone()),
//!     )
//!     .await?;
//!     // ...
//! }
//! ```

use chrono::{DateTime, Utc};
use raxm_core::environment::Clock;

pub mod reducer_test;

pub use reducer_test::{ReducerTest, assertions};

/// Mock implementations of the page's host services.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use futures::future::BoxFuture;
    use raxm_runtime::UiHost;
    use raxm_runtime::connection::{ConnectionError, HttpRequest, HttpResponse, Transport};
    use std::collections::{HashMap, VecDeque};
    use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
    use tokio::sync::watch;

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use raxm_testing::mocks::FixedClock;
    /// use raxm_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }

    fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[derive(Debug)]
    struct TransportLog {
        replies: VecDeque<Result<HttpResponse, ConnectionError>>,
        fallback: HttpResponse,
        requests: Vec<HttpRequest>,
        active: HashMap<String, usize>,
        peak: HashMap<String, usize>,
    }

    /// Scripted [`Transport`].
    ///
    /// Replies are handed out in request order; when the script runs out,
    /// the fallback (an empty successful payload) is used. While held,
    /// requests are logged but don't complete until [`MockTransport::release`].
    #[derive(Debug, Clone)]
    pub struct MockTransport {
        log: Arc<Mutex<TransportLog>>,
        gate: Arc<watch::Sender<bool>>,
        sent: Arc<watch::Sender<usize>>,
    }

    impl Default for MockTransport {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MockTransport {
        /// A transport that answers every request with an empty payload
        #[must_use]
        pub fn new() -> Self {
            let (gate, _) = watch::channel(true);
            let (sent, _) = watch::channel(0);
            Self {
                log: Arc::new(Mutex::new(TransportLog {
                    replies: VecDeque::new(),
                    fallback: HttpResponse::new(200, r#"{"effects":{},"serverMemo":{}}"#),
                    requests: Vec::new(),
                    active: HashMap::new(),
                    peak: HashMap::new(),
                })),
                gate: Arc::new(gate),
                sent: Arc::new(sent),
            }
        }

        /// Script the next reply
        pub fn reply(&self, response: HttpResponse) -> &Self {
            lock(&self.log).replies.push_back(Ok(response));
            self
        }

        /// Script a transport failure
        pub fn reply_error(&self, error: ConnectionError) -> &Self {
            lock(&self.log).replies.push_back(Err(error));
            self
        }

        /// Reply used once the script runs out
        pub fn set_fallback(&self, response: HttpResponse) {
            lock(&self.log).fallback = response;
        }

        /// Keep requests open until [`MockTransport::release`]
        pub fn hold(&self) {
            self.gate.send_replace(false);
        }

        /// Let held and future requests complete
        pub fn release(&self) {
            self.gate.send_replace(true);
        }

        /// Every request received, in order
        #[must_use]
        pub fn requests(&self) -> Vec<HttpRequest> {
            lock(&self.log).requests.clone()
        }

        /// Number of requests received
        #[must_use]
        pub fn request_count(&self) -> usize {
            lock(&self.log).requests.len()
        }

        /// Request bodies parsed as JSON
        #[must_use]
        pub fn bodies(&self) -> Vec<serde_json::Value> {
            lock(&self.log)
                .requests
                .iter()
                .filter_map(|r| serde_json::from_str(&r.body).ok())
                .collect()
        }

        /// Highest number of simultaneously open requests to `url`
        #[must_use]
        pub fn max_concurrency(&self, url: &str) -> usize {
            lock(&self.log).peak.get(url).copied().unwrap_or(0)
        }

        /// Wait until at least `count` requests arrived
        pub async fn wait_for_requests(&self, count: usize) {
            let mut rx = self.sent.subscribe();
            let _ = rx.wait_for(|n| *n >= count).await;
        }
    }

    impl Transport for MockTransport {
        fn send(&self, request: HttpRequest) -> BoxFuture<'static, Result<HttpResponse, ConnectionError>> {
            let log = Arc::clone(&self.log);
            let sent = Arc::clone(&self.sent);
            let mut gate = self.gate.subscribe();
            Box::pin(async move {
                let url = request.url.clone();
                let reply = {
                    let mut log = lock(&log);
                    log.requests.push(request);
                    let active = log.active.entry(url.clone()).or_insert(0);
                    *active += 1;
                    let now = *active;
                    let peak = log.peak.entry(url.clone()).or_insert(0);
                    *peak = (*peak).max(now);
                    let fallback = log.fallback.clone();
                    log.replies.pop_front().unwrap_or(Ok(fallback))
                };
                sent.send_modify(|n| *n += 1);

                let _ = gate.wait_for(|open| *open).await;

                if let Some(active) = lock(&log).active.get_mut(&url) {
                    *active = active.saturating_sub(1);
                }
                reply
            })
        }
    }

    #[derive(Debug, Default)]
    struct UiLog {
        confirms: Vec<String>,
        navigations: Vec<String>,
        modals: Vec<String>,
        reloads: usize,
    }

    /// [`UiHost`] that records every call.
    #[derive(Debug)]
    pub struct RecordingUi {
        answer: Mutex<bool>,
        log: Mutex<UiLog>,
    }

    impl Default for RecordingUi {
        fn default() -> Self {
            Self::new()
        }
    }

    impl RecordingUi {
        /// A UI that confirms every prompt
        #[must_use]
        pub fn new() -> Self {
            Self::answering(true)
        }

        /// A UI that answers every prompt with `answer`
        #[must_use]
        pub fn answering(answer: bool) -> Self {
            Self {
                answer: Mutex::new(answer),
                log: Mutex::new(UiLog::default()),
            }
        }

        /// Change the answer to future prompts
        pub fn set_answer(&self, answer: bool) {
            *lock(&self.answer) = answer;
        }

        /// Prompts shown, in order
        #[must_use]
        pub fn confirms(&self) -> Vec<String> {
            lock(&self.log).confirms.clone()
        }

        /// Navigation targets, in order
        #[must_use]
        pub fn navigations(&self) -> Vec<String> {
            lock(&self.log).navigations.clone()
        }

        /// Modal bodies, in order
        #[must_use]
        pub fn modals(&self) -> Vec<String> {
            lock(&self.log).modals.clone()
        }

        /// Number of reloads
        #[must_use]
        pub fn reloads(&self) -> usize {
            lock(&self.log).reloads
        }
    }

    impl UiHost for RecordingUi {
        fn confirm(&self, message: &str) -> bool {
            lock(&self.log).confirms.push(message.to_string());
            *lock(&self.answer)
        }

        fn navigate(&self, url: &str) {
            lock(&self.log).navigations.push(url.to_string());
        }

        fn show_error_modal(&self, body: &str) {
            lock(&self.log).modals.push(body.to_string());
        }

        fn reload(&self) {
            lock(&self.log).reloads += 1;
        }
    }
}

/// Markup and response builders.
pub mod fixtures {
    use raxm_runtime::connection::HttpResponse;
    use serde_json::{Value, json};

    /// CSRF token embedded by [`page_html`]
    pub const CSRF_TOKEN: &str = "test-token";

    /// `raxm:initial-data` payload
    #[must_use]
    pub fn initial_data(id: &str, name: &str, data: &Value, listeners: &[&str]) -> Value {
        json!({
            "fingerprint": {"id": id, "name": name, "locale": "en", "path": "/", "method": "GET", "params": []},
            "serverMemo": {"checksum": format!("{id}-checksum"), "data": data},
            "effects": {"listeners": listeners}
        })
    }

    fn attribute_json(value: &Value) -> String {
        value.to_string().replace('&', "&amp;").replace('\'', "&#39;")
    }

    /// A component root as the first page render emits it
    #[must_use]
    pub fn component_html(id: &str, name: &str, data: &Value, body: &str) -> String {
        listening_component_html(id, name, data, &[], body)
    }

    /// [`component_html`] for a component listening to `listeners`
    #[must_use]
    pub fn listening_component_html(id: &str, name: &str, data: &Value, listeners: &[&str], body: &str) -> String {
        format!(
            "<div raxm:id=\"{id}\" raxm:initial-data='{}'>{body}</div>",
            attribute_json(&initial_data(id, name, data, listeners))
        )
    }

    /// A component root as a re-render returns it
    #[must_use]
    pub fn rendered(id: &str, body: &str) -> String {
        format!("<div raxm:id=\"{id}\">{body}</div>")
    }

    /// A full page with a CSRF meta tag around `body`
    #[must_use]
    pub fn page_html(body: &str) -> String {
        format!(
            "<!DOCTYPE html><html><head><meta name=\"csrf-token\" content=\"{CSRF_TOKEN}\"></head><body>{body}</body></html>"
        )
    }

    /// 200 with a JSON body
    #[must_use]
    pub fn json_response(body: &Value) -> HttpResponse {
        HttpResponse::new(200, body.to_string()).with_header("Content-Type", "application/json")
    }

    /// 200 with rendered html (if any) and new data
    #[must_use]
    pub fn success_response(html: Option<&str>, data: &Value) -> HttpResponse {
        let mut effects = json!({});
        if let Some(html) = html {
            effects["html"] = json!(html);
        }
        json_response(&json!({"effects": effects, "serverMemo": {"data": data}}))
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use proptest::prelude::*;

    /// What a user types into a text field, one keystroke at a time: every
    /// prefix of a non-empty word
    pub fn keystrokes() -> impl Strategy<Value = Vec<String>> {
        "[a-z0-9 ]{1,24}".prop_map(|word| {
            word.char_indices()
                .map(|(i, c)| word[..i + c.len_utf8()].to_string())
                .collect()
        })
    }

    /// Plausible component property names (`title`, `form.email`)
    pub fn property_name() -> impl Strategy<Value = String> {
        "[a-z][a-z_]{0,8}(\\.[a-z][a-z_]{0,8})?"
    }
}

/// Install a test-friendly tracing subscriber once; later calls do nothing.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use mocks::{FixedClock, MockTransport, RecordingUi, test_clock};
