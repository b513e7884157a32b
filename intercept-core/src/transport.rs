//! Network transport used by the pipeline
//!
//! The pipeline never opens sockets itself. A [`Transport`] performs the
//! (possibly rewritten) request and reports the response, the redirects it
//! followed and what the TLS stack observed.

use async_trait::async_trait;
use chrono::Utc;
use intercept_common::{http::header_value, HttpRequest, HttpResponse, RedirectHop};
use reqwest::{redirect::Policy, tls::TlsInfo, Client, Method};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::error::{CoreError, InterceptError, NetworkErrorKind};
use crate::trust::{PeerCertificate, TlsConnectionInfo, TrustIssue, TrustMode};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_REDIRECTS: usize = 10;

/// Per-call knobs chosen by the pipeline
#[derive(Debug, Clone, Default)]
pub struct TransportOptions {
    /// Effective trust mode for the exchange. Consulted per hop so a
    /// redirect never inherits another host's relaxation.
    pub trust_mode: TrustMode,
}

impl TransportOptions {
    pub fn new(trust_mode: TrustMode) -> Self {
        Self { trust_mode }
    }

    /// Whether a handshake the platform rejects for `url` should still be
    /// completed so the trust evaluator can judge the chain
    pub fn accepts_untrusted(&self, url: &str) -> bool {
        let Ok(parsed) = Url::parse(url) else {
            return false;
        };
        match parsed.host_str() {
            Some(host) if parsed.scheme() == "https" => self.trust_mode.relaxes_for(host),
            _ => false,
        }
    }
}

/// TLS seen on a redirect response that was followed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HopTls {
    pub url: String,
    pub tls: TlsConnectionInfo,
}

/// What came back from the network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub response: HttpResponse,
    /// Connection that produced `response`. `None` for plain HTTP.
    pub tls: Option<TlsConnectionInfo>,
    /// Oldest first
    pub redirects: Vec<RedirectHop>,
    /// Secure redirect responses, oldest first
    pub hop_tls: Vec<HopTls>,
}

impl TransportResponse {
    pub fn plain(response: HttpResponse) -> Self {
        Self {
            response,
            tls: None,
            redirects: Vec::new(),
            hop_tls: Vec::new(),
        }
    }

    /// URL that produced `response`
    pub fn final_url<'a>(&'a self, requested: &'a str) -> &'a str {
        self.redirects
            .last()
            .map(|hop| hop.to_url.as_str())
            .unwrap_or(requested)
    }
}

/// Classified network failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} error: {message}")]
pub struct TransportError {
    pub kind: NetworkErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: NetworkErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<TransportError> for InterceptError {
    fn from(err: TransportError) -> Self {
        InterceptError::network(err.kind, err.message)
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        let message = error_chain(&err);
        let kind = classify_failure(err.is_timeout(), err.is_connect(), &message);
        TransportError::new(kind, message)
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn perform(
        &self,
        request: &HttpRequest,
        options: TransportOptions,
    ) -> Result<TransportResponse, TransportError>;
}

/// Flatten an error and its sources into one line
fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}

/// Map a failure onto the error kinds shown to operators
pub fn classify_failure(is_timeout: bool, is_connect: bool, message: &str) -> NetworkErrorKind {
    if is_timeout {
        return NetworkErrorKind::Timeout;
    }
    let lower = message.to_ascii_lowercase();
    if lower.contains("dns error")
        || lower.contains("failed to lookup address")
        || lower.contains("name or service not known")
        || lower.contains("no such host")
    {
        NetworkErrorKind::Dns
    } else if lower.contains("certificate")
        || lower.contains("handshake")
        || lower.contains("tls")
        || lower.contains("ssl")
    {
        NetworkErrorKind::Tls
    } else if is_connect || lower.contains("connection refused") || lower.contains("connection reset") {
        NetworkErrorKind::Connection
    } else if lower.contains("timed out") {
        NetworkErrorKind::Timeout
    } else {
        NetworkErrorKind::Other
    }
}

/// Issues named in a rejected handshake's error text
pub fn platform_issues(message: &str) -> Vec<TrustIssue> {
    let compact: String = message
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '_')
        .collect::<String>()
        .to_ascii_lowercase();

    let mut issues = Vec::new();
    if compact.contains("notvalidyet") {
        issues.push(TrustIssue::NotYetValid);
    } else if compact.contains("expired") {
        issues.push(TrustIssue::Expired);
    }
    if compact.contains("notvalidforname") || compact.contains("hostnamemismatch") {
        issues.push(TrustIssue::HostnameMismatch);
    }
    if compact.contains("selfsigned") {
        issues.push(TrustIssue::SelfSigned);
    } else if compact.contains("unknownissuer") || compact.contains("untrusted") {
        issues.push(TrustIssue::UntrustedRoot);
    }
    if compact.contains("revoked") {
        issues.push(TrustIssue::Revoked);
    }
    if issues.is_empty() {
        issues.push(TrustIssue::Other(message.to_string()));
    }
    issues
}

/// An unknown issuer on a certificate that signed itself is reported as
/// self-signed
fn refine_issues(mut issues: Vec<TrustIssue>, leaf: Option<&[u8]>) -> Vec<TrustIssue> {
    let self_signed = leaf
        .and_then(|der| x509_parser::parse_x509_certificate(der).ok())
        .map(|(_, cert)| cert.issuer().as_raw() == cert.subject().as_raw())
        .unwrap_or(false);

    if self_signed {
        for issue in issues.iter_mut() {
            if *issue == TrustIssue::UntrustedRoot {
                *issue = TrustIssue::SelfSigned;
            }
        }
    }
    issues
}

/// Next URL when `response` is a followable redirect
fn redirect_target(current: &str, response: &HttpResponse) -> Option<String> {
    if !matches!(response.status_code, 301 | 302 | 303 | 307 | 308) {
        return None;
    }
    let location = header_value(&response.headers, "location")?;
    let base = Url::parse(current).ok()?;
    base.join(location).ok().map(String::from)
}

/// Request to issue for the next hop
fn follow(previous: &HttpRequest, target: String, status_code: u16) -> HttpRequest {
    let mut next = previous.clone();
    let same_origin = Url::parse(&previous.url)
        .ok()
        .zip(Url::parse(&target).ok())
        .map(|(a, b)| a.origin() == b.origin())
        .unwrap_or(false);

    let method = previous.method.to_ascii_uppercase();
    let rewrite_to_get = status_code == 303
        || (matches!(status_code, 301 | 302) && method != "GET" && method != "HEAD");
    if rewrite_to_get {
        next.method = "GET".to_string();
        next.body = None;
        next.headers
            .retain(|name, _| !name.eq_ignore_ascii_case("content-type"));
    }
    if !same_origin {
        next.headers.retain(|name, _| {
            !name.eq_ignore_ascii_case("authorization") && !name.eq_ignore_ascii_case("cookie")
        });
    }
    next.url = target;
    next
}

/// Default transport backed by reqwest with rustls
///
/// reqwest only exposes the peer's leaf certificate, so the reported chain
/// holds the leaf alone and protocol version and cipher suite stay `None`.
/// Pins must therefore name the leaf key; a pin on an intermediate or root
/// can only match through a transport that surfaces the full chain.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    verified: Client,
    /// Completes handshakes regardless of chain validity
    lenient: Client,
    max_redirects: usize,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, CoreError> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, CoreError> {
        let build = |accept_invalid: bool| {
            Client::builder()
                .redirect(Policy::none())
                .timeout(timeout)
                .tls_info(true)
                .danger_accept_invalid_certs(accept_invalid)
                .build()
                .map_err(|e| CoreError::Network(format!("Failed to build HTTP client: {}", e)))
        };

        Ok(Self {
            verified: build(false)?,
            lenient: build(true)?,
            max_redirects: DEFAULT_MAX_REDIRECTS,
        })
    }

    /// `0` disables redirect following
    pub fn with_max_redirects(mut self, max_redirects: usize) -> Self {
        self.max_redirects = max_redirects;
        self
    }

    async fn dispatch(
        client: &Client,
        request: &HttpRequest,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let method = Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
            .unwrap_or(Method::GET);
        let mut builder = client.request(method, &request.url);

        for (name, value) in &request.headers {
            // reqwest derives these from the URL and body
            if name.eq_ignore_ascii_case("host") || name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        builder.send().await
    }

    async fn collect(
        response: reqwest::Response,
        secure: bool,
        issues: Vec<TrustIssue>,
    ) -> Result<(HttpResponse, Option<TlsConnectionInfo>), TransportError> {
        let status_code = response.status().as_u16();

        let mut headers = HashMap::new();
        for (name, value) in response.headers() {
            headers.insert(name.to_string(), value.to_str().unwrap_or("").to_string());
        }

        let tls = if secure {
            let leaf = response
                .extensions()
                .get::<TlsInfo>()
                .and_then(|info| info.peer_certificate())
                .map(|der| der.to_vec());
            let platform_issues = refine_issues(issues, leaf.as_deref());
            Some(TlsConnectionInfo {
                protocol_version: None,
                cipher_suite: None,
                chain: leaf.map(PeerCertificate::from_der).into_iter().collect(),
                platform_issues,
            })
        } else {
            None
        };

        let body = response.bytes().await?;
        let body = if body.is_empty() { None } else { Some(body.to_vec()) };

        Ok((
            HttpResponse {
                status_code,
                headers,
                body,
            },
            tls,
        ))
    }

    async fn send_once(
        &self,
        request: &HttpRequest,
        options: &TransportOptions,
    ) -> Result<(HttpResponse, Option<TlsConnectionInfo>), TransportError> {
        let secure = request.is_secure();

        match Self::dispatch(&self.verified, request).await {
            Ok(response) => Self::collect(response, secure, Vec::new()).await,
            Err(err) => {
                let failure = TransportError::from(err);
                if !(failure.kind == NetworkErrorKind::Tls && options.accepts_untrusted(&request.url)) {
                    return Err(failure);
                }

                let issues = platform_issues(&failure.message);
                debug!(
                    url = %request.url,
                    issues = ?issues,
                    "Platform rejected the chain, retrying for trust evaluation"
                );
                let response = Self::dispatch(&self.lenient, request).await?;
                Self::collect(response, secure, issues).await
            }
        }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn perform(
        &self,
        request: &HttpRequest,
        options: TransportOptions,
    ) -> Result<TransportResponse, TransportError> {
        let mut current = request.clone();
        let mut redirects = Vec::new();
        let mut hop_tls = Vec::new();

        loop {
            let (response, tls) = self.send_once(&current, &options).await?;

            let target = match redirect_target(&current.url, &response) {
                Some(target) if redirects.len() < self.max_redirects => target,
                over_limit => {
                    if over_limit.is_some() && self.max_redirects > 0 {
                        warn!("Redirect limit reached at {}", current.url);
                    }
                    return Ok(TransportResponse {
                        response,
                        tls,
                        redirects,
                        hop_tls,
                    });
                }
            };

            debug!("Following {} redirect {} -> {}", response.status_code, current.url, target);
            if let Some(tls) = tls {
                hop_tls.push(HopTls {
                    url: current.url.clone(),
                    tls,
                });
            }
            redirects.push(RedirectHop {
                from_url: current.url.clone(),
                to_url: target.clone(),
                status_code: response.status_code,
                at: Utc::now(),
            });
            current = follow(&current, target, response.status_code);
        }
    }
}
