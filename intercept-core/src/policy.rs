//! Interception rule definitions
//!
//! Mock rules and breakpoint rules share the same [`RequestMatcher`]; they
//! differ in what happens once a request matches. Both are plain data so the
//! control surface can edit them and the persistence layer can store them.

use chrono::{DateTime, Utc};
use intercept_common::{http::header_value, Headers, HttpRequest, HttpResponse};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::error::NetworkErrorKind;

fn default_true() -> bool {
    true
}

/// Request predicate. Every populated field must hold (AND logic); an empty
/// matcher matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMatcher {
    /// Substring of the URL, or a `*` wildcard pattern over the whole URL
    #[serde(default)]
    pub url_pattern: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    /// Exact host, case-insensitive
    #[serde(default)]
    pub host: Option<String>,
    /// Headers that must be present with exactly these values
    #[serde(default)]
    pub headers: Headers,
    /// Substring of the UTF-8 decoded body
    #[serde(default)]
    pub body_contains: Option<String>,
}

impl RequestMatcher {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn url(pattern: &str) -> Self {
        Self {
            url_pattern: Some(pattern.to_string()),
            ..Self::default()
        }
    }

    pub fn with_method(mut self, method: &str) -> Self {
        self.method = Some(method.to_string());
        self
    }

    pub fn with_host(mut self, host: &str) -> Self {
        self.host = Some(host.to_string());
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_body_contains(mut self, needle: &str) -> Self {
        self.body_contains = Some(needle.to_string());
        self
    }

    pub fn matches(&self, req: &HttpRequest) -> bool {
        if let Some(pattern) = &self.url_pattern {
            if !url_pattern_matches(pattern, &req.url) {
                return false;
            }
        }

        if let Some(method) = &self.method {
            if !req.method.eq_ignore_ascii_case(method) {
                return false;
            }
        }

        if let Some(host) = &self.host {
            match req.host() {
                Some(req_host) if req_host.eq_ignore_ascii_case(host.trim()) => {}
                _ => return false,
            }
        }

        let headers_hold = self
            .headers
            .iter()
            .all(|(name, value)| header_value(&req.headers, name) == Some(value.as_str()));
        if !headers_hold {
            return false;
        }

        if let Some(needle) = &self.body_contains {
            match req.body_text() {
                Some(body) if body.contains(needle.as_str()) => {}
                _ => return false,
            }
        }

        true
    }
}

/// Literal patterns match as substrings. Patterns containing `*` are turned
/// into an anchored regex with every literal segment escaped. A pattern that
/// fails to compile never matches.
pub fn url_pattern_matches(pattern: &str, url: &str) -> bool {
    if !pattern.contains('*') {
        return url.contains(pattern);
    }

    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    match regex::Regex::new(&format!("^{}$", body)) {
        Ok(re) => re.is_match(url),
        Err(e) => {
            debug!("URL pattern {:?} does not compile: {}", pattern, e);
            false
        }
    }
}

/// Activation limits for a mock rule
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleLimits {
    #[serde(default)]
    pub max_activations: Option<u64>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl RuleLimits {
    pub fn is_exhausted(&self, activation_count: u64, now: DateTime<Utc>) -> bool {
        if let Some(max) = self.max_activations {
            if activation_count >= max {
                return true;
            }
        }
        matches!(self.expires_at, Some(expiry) if now >= expiry)
    }
}

/// Field overrides applied to a live response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseModification {
    #[serde(default)]
    pub status_code: Option<u16>,
    /// Merged over the live headers
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub body: Option<String>,
}

impl ResponseModification {
    pub fn apply(&self, response: &mut HttpResponse) {
        if let Some(status) = self.status_code {
            response.status_code = status;
        }
        for (name, value) in &self.headers {
            intercept_common::http::set_header(&mut response.headers, name, value);
        }
        if let Some(body) = &self.body {
            response.body = Some(body.clone().into_bytes());
        }
    }
}

/// What a matched mock rule does
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MockAction {
    /// Answer with a canned response, no network call
    Respond(HttpResponse),
    /// Fail as if the network call had failed
    Error {
        kind: NetworkErrorKind,
        message: String,
    },
    /// Hold the request, then let it go to the network
    Delay { delay_ms: u64 },
    /// Stop rule evaluation and let the request through untouched
    Passthrough,
    /// Perform the real call and overwrite parts of its response
    ModifyResponse(ResponseModification),
}

impl MockAction {
    /// Respond, error and delay consume an activation
    pub fn counts_activation(&self) -> bool {
        matches!(
            self,
            MockAction::Respond(_) | MockAction::Error { .. } | MockAction::Delay { .. }
        )
    }

    /// Whether the action answers without a network call
    pub fn short_circuits(&self) -> bool {
        matches!(self, MockAction::Respond(_) | MockAction::Error { .. })
    }
}

/// Priority-ordered predicate to action binding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MockRule {
    pub id: Uuid,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Higher evaluates first
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub matcher: RequestMatcher,
    pub action: MockAction,
    #[serde(default)]
    pub limits: RuleLimits,
    #[serde(default)]
    pub activation_count: u64,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl MockRule {
    pub fn new(name: impl Into<String>, matcher: RequestMatcher, action: MockAction) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            enabled: true,
            priority: 0,
            matcher,
            action,
            limits: RuleLimits::default(),
            activation_count: 0,
            created_at: Utc::now(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_limits(mut self, limits: RuleLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn is_exhausted(&self, now: DateTime<Utc>) -> bool {
        self.limits.is_exhausted(self.activation_count, now)
    }

    /// Enabled, not exhausted, and the matcher holds
    pub fn applies_to(&self, req: &HttpRequest, now: DateTime<Utc>) -> bool {
        self.enabled && !self.is_exhausted(now) && self.matcher.matches(req)
    }
}

/// Which side of the exchange a breakpoint stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakpointDirection {
    #[default]
    Request,
    Response,
    Both,
}

impl BreakpointDirection {
    pub fn includes_request(&self) -> bool {
        matches!(self, BreakpointDirection::Request | BreakpointDirection::Both)
    }

    pub fn includes_response(&self) -> bool {
        matches!(self, BreakpointDirection::Response | BreakpointDirection::Both)
    }
}

/// Rule that suspends matching traffic until an operator acts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakpointRule {
    pub id: Uuid,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub matcher: RequestMatcher,
    #[serde(default)]
    pub direction: BreakpointDirection,
    /// Release automatically after this many milliseconds
    #[serde(default)]
    pub auto_resume_ms: Option<u64>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl BreakpointRule {
    pub fn new(
        name: impl Into<String>,
        matcher: RequestMatcher,
        direction: BreakpointDirection,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            enabled: true,
            matcher,
            direction,
            auto_resume_ms: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_auto_resume(mut self, after: Duration) -> Self {
        self.auto_resume_ms = Some(after.as_millis() as u64);
        self
    }

    pub fn auto_resume(&self) -> Option<Duration> {
        self.auto_resume_ms.map(Duration::from_millis)
    }
}
