//! TLS trust evaluation
//!
//! The engine never negotiates TLS. The transport hands over what the
//! underlying TLS stack saw (chain, negotiated parameters and the issues its
//! own validation raised) and this module decides whether the connection is
//! acceptable under the configured [`TrustMode`].

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Problem reported by the platform's standard chain validation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustIssue {
    SelfSigned,
    UntrustedRoot,
    Expired,
    NotYetValid,
    HostnameMismatch,
    Revoked,
    Other(String),
}

/// DER-encoded certificate as presented by the peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerCertificate {
    #[serde(with = "der_base64")]
    pub der: Vec<u8>,
}

impl PeerCertificate {
    pub fn from_der(der: impl Into<Vec<u8>>) -> Self {
        Self { der: der.into() }
    }
}

/// What the TLS stack surfaced for one completed connection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConnectionInfo {
    pub protocol_version: Option<String>,
    pub cipher_suite: Option<String>,
    /// Leaf first
    #[serde(default)]
    pub chain: Vec<PeerCertificate>,
    /// Empty when the platform accepted the chain for the host
    #[serde(default)]
    pub platform_issues: Vec<TrustIssue>,
}

impl TlsConnectionInfo {
    pub fn platform_trusted(&self) -> bool {
        self.platform_issues.is_empty()
    }
}

/// Caller-supplied trust decision over chain and host
pub type TrustPredicate = Arc<dyn Fn(&TlsConnectionInfo, &str) -> bool + Send + Sync>;

/// Policy deciding how strictly chain validation is enforced
#[derive(Clone)]
pub enum TrustMode {
    /// Platform validation only
    Strict,
    AllowSelfSigned(BTreeSet<String>),
    AllowExpired(BTreeSet<String>),
    AllowInvalidHostname(BTreeSet<String>),
    /// Accept everything. Without the acknowledgement this behaves as `Strict`.
    AllowAll { acknowledged: bool },
    /// Accept interception proxy certificates for the listed hosts
    AllowProxy(BTreeSet<String>),
    Custom(TrustPredicate),
}

fn host_set<I, S>(hosts: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    hosts
        .into_iter()
        .map(|h| h.as_ref().trim().to_ascii_lowercase())
        .filter(|h| !h.is_empty())
        .collect()
}

impl TrustMode {
    pub fn allow_self_signed<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        TrustMode::AllowSelfSigned(host_set(hosts))
    }

    pub fn allow_expired<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        TrustMode::AllowExpired(host_set(hosts))
    }

    pub fn allow_invalid_hostname<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        TrustMode::AllowInvalidHostname(host_set(hosts))
    }

    pub fn allow_proxy<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        TrustMode::AllowProxy(host_set(hosts))
    }

    /// `acknowledge_insecure` must be true for the mode to relax anything
    pub fn allow_all(acknowledge_insecure: bool) -> Self {
        TrustMode::AllowAll {
            acknowledged: acknowledge_insecure,
        }
    }

    pub fn custom<F>(predicate: F) -> Self
    where
        F: Fn(&TlsConnectionInfo, &str) -> bool + Send + Sync + 'static,
    {
        TrustMode::Custom(Arc::new(predicate))
    }

    /// Every relaxing mode is unsafe; strict and custom are not
    pub fn is_unsafe(&self) -> bool {
        !matches!(self, TrustMode::Strict | TrustMode::Custom(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            TrustMode::Strict => "strict",
            TrustMode::AllowSelfSigned(_) => "allow_self_signed",
            TrustMode::AllowExpired(_) => "allow_expired",
            TrustMode::AllowInvalidHostname(_) => "allow_invalid_hostname",
            TrustMode::AllowAll { .. } => "allow_all",
            TrustMode::AllowProxy(_) => "allow_proxy",
            TrustMode::Custom(_) => "custom",
        }
    }

    /// Whether a chain the platform rejects could still be accepted for
    /// `host`. The transport only completes such handshakes when this holds.
    pub fn relaxes_for(&self, host: &str) -> bool {
        if let TrustMode::Custom(_) = self {
            return true;
        }
        let host = host.trim().to_ascii_lowercase();
        self.tolerated(&host).map_or(true, |issues| !issues.is_empty())
    }

    /// Issues this mode tolerates for `host`. `None` means everything.
    fn tolerated(&self, host: &str) -> Option<&'static [TrustIssue]> {
        const NOTHING: &[TrustIssue] = &[];
        const SELF_SIGNED: &[TrustIssue] = &[TrustIssue::SelfSigned, TrustIssue::UntrustedRoot];
        const EXPIRED: &[TrustIssue] = &[TrustIssue::Expired, TrustIssue::NotYetValid];
        const HOSTNAME: &[TrustIssue] = &[TrustIssue::HostnameMismatch];

        let scoped = |hosts: &BTreeSet<String>, issues: &'static [TrustIssue]| {
            if hosts.contains(host) {
                Some(issues)
            } else {
                Some(NOTHING)
            }
        };

        match self {
            TrustMode::Strict | TrustMode::Custom(_) => Some(NOTHING),
            TrustMode::AllowAll { acknowledged: true } => None,
            TrustMode::AllowAll { acknowledged: false } => Some(NOTHING),
            TrustMode::AllowSelfSigned(hosts) => scoped(hosts, SELF_SIGNED),
            TrustMode::AllowExpired(hosts) => scoped(hosts, EXPIRED),
            TrustMode::AllowInvalidHostname(hosts) => scoped(hosts, HOSTNAME),
            TrustMode::AllowProxy(hosts) => scoped(hosts, SELF_SIGNED),
        }
    }
}

impl Default for TrustMode {
    fn default() -> Self {
        TrustMode::Strict
    }
}

impl fmt::Debug for TrustMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrustMode::Strict => write!(f, "Strict"),
            TrustMode::AllowSelfSigned(h) => f.debug_tuple("AllowSelfSigned").field(h).finish(),
            TrustMode::AllowExpired(h) => f.debug_tuple("AllowExpired").field(h).finish(),
            TrustMode::AllowInvalidHostname(h) => {
                f.debug_tuple("AllowInvalidHostname").field(h).finish()
            }
            TrustMode::AllowAll { acknowledged } => f
                .debug_struct("AllowAll")
                .field("acknowledged", acknowledged)
                .finish(),
            TrustMode::AllowProxy(h) => f.debug_tuple("AllowProxy").field(h).finish(),
            TrustMode::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Persistable selector for a trust mode; the host scope is supplied when
/// it is turned into a [`TrustMode`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustModeSelector {
    #[default]
    Strict,
    AllowSelfSigned,
    AllowExpired,
    AllowInvalidHostname,
    AllowAll,
    AllowProxy,
}

impl TrustModeSelector {
    pub fn into_mode<I, S>(self, hosts: I, acknowledge_insecure: bool) -> TrustMode
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        match self {
            TrustModeSelector::Strict => TrustMode::Strict,
            TrustModeSelector::AllowSelfSigned => TrustMode::allow_self_signed(hosts),
            TrustModeSelector::AllowExpired => TrustMode::allow_expired(hosts),
            TrustModeSelector::AllowInvalidHostname => TrustMode::allow_invalid_hostname(hosts),
            TrustModeSelector::AllowAll => TrustMode::allow_all(acknowledge_insecure),
            TrustModeSelector::AllowProxy => TrustMode::allow_proxy(hosts),
        }
    }

    pub fn is_strict(&self) -> bool {
        matches!(self, TrustModeSelector::Strict)
    }
}

/// Trust evaluator holding the process-wide mode
#[derive(Debug, Default)]
pub struct TrustEvaluator {
    mode: RwLock<TrustMode>,
}

impl TrustEvaluator {
    pub fn new(mode: TrustMode) -> Self {
        if mode.is_unsafe() {
            warn!("Trust evaluator created with unsafe mode {}", mode.label());
        }
        Self {
            mode: RwLock::new(mode),
        }
    }

    pub fn mode(&self) -> TrustMode {
        self.mode.read().clone()
    }

    pub fn set_mode(&self, mode: TrustMode) {
        if mode.is_unsafe() {
            warn!("Switching TLS trust mode to unsafe mode {}", mode.label());
        } else {
            info!("Switching TLS trust mode to {}", mode.label());
        }
        *self.mode.write() = mode;
    }

    pub fn is_unsafe(&self) -> bool {
        self.mode.read().is_unsafe()
    }

    /// Evaluate under the configured mode
    pub fn evaluate(&self, tls: &TlsConnectionInfo, host: &str) -> bool {
        let mode = self.mode();
        Self::evaluate_with(&mode, tls, host)
    }

    /// Evaluate under an explicit mode, e.g. one chosen by an environment
    pub fn evaluate_with(mode: &TrustMode, tls: &TlsConnectionInfo, host: &str) -> bool {
        let host = host.trim().to_ascii_lowercase();

        if let TrustMode::Custom(predicate) = mode {
            return predicate(tls, &host);
        }
        if let TrustMode::AllowAll {
            acknowledged: false,
        } = mode
        {
            warn!("allow_all trust mode used without acknowledgement, enforcing strict validation");
        }

        let accepted = match mode.tolerated(&host) {
            None => true,
            Some(_) if tls.platform_trusted() => true,
            Some(tolerated) => tls
                .platform_issues
                .iter()
                .all(|issue| tolerated.contains(issue)),
        };

        debug!(
            host = %host,
            mode = mode.label(),
            issues = ?tls.platform_issues,
            accepted,
            "Evaluated TLS trust"
        );
        accepted
    }
}

mod der_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(der: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(der))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}
