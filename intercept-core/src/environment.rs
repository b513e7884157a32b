//! Environment-based URL and header rewriting
//!
//! Environment groups redirect traffic for a host pattern to whichever
//! environment is active (staging, local, prod...). Quick overrides are
//! one-off host redirects that bypass groups entirely.

use chrono::{DateTime, Utc};
use intercept_common::{http::set_header, Headers, HttpRequest};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::filter::HostPattern;
use crate::trust::{TrustMode, TrustModeSelector};

/// Scheme, host and optional port of a rewrite target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authority {
    pub scheme: String,
    pub host: String,
    pub port: Option<u16>,
}

impl Authority {
    /// Accepts `scheme://host[:port]` or a bare `host[:port]`, which is
    /// assumed to use `default_scheme`.
    pub fn parse(target: &str, default_scheme: &str) -> Option<Self> {
        let target = target.trim();
        if target.is_empty() {
            return None;
        }
        let candidate = if target.contains("://") {
            target.to_string()
        } else {
            format!("{}://{}", default_scheme, target)
        };
        let parsed = url::Url::parse(&candidate).ok()?;
        let host = parsed.host_str()?.to_ascii_lowercase();
        Some(Self {
            scheme: parsed.scheme().to_string(),
            host,
            port: parsed.port(),
        })
    }

    /// Replace scheme, host and port of `url`, keeping path, query and fragment
    pub fn apply_to(&self, url: &str) -> Option<String> {
        let mut parsed = url::Url::parse(url).ok()?;
        parsed.set_scheme(&self.scheme).ok()?;
        parsed.set_host(Some(&self.host)).ok()?;
        parsed.set_port(self.port).ok()?;
        Some(parsed.to_string())
    }
}

/// A named target server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub id: Uuid,
    pub name: String,
    /// `scheme://host[:port]`
    pub base_url: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    #[serde(default)]
    pub trust_mode: TrustModeSelector,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Environment {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            base_url: base_url.into(),
            headers: Headers::new(),
            variables: HashMap::new(),
            trust_mode: TrustModeSelector::Strict,
            is_default: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_variable(mut self, key: &str, value: &str) -> Self {
        self.variables.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_trust_mode(mut self, selector: TrustModeSelector) -> Self {
        self.trust_mode = selector;
        self
    }

    pub fn as_default(mut self) -> Self {
        self.is_default = true;
        self
    }

    pub fn authority(&self) -> Option<Authority> {
        Authority::parse(&self.base_url, "https")
    }

    /// Headers with `{{variable}}` placeholders expanded
    pub fn resolved_headers(&self) -> Headers {
        self.headers
            .iter()
            .map(|(name, value)| (name.clone(), expand_variables(value, &self.variables)))
            .collect()
    }
}

fn placeholder_regex() -> &'static regex::Regex {
    static PLACEHOLDER: OnceLock<regex::Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        regex::Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").expect("static placeholder pattern")
    })
}

/// Unknown placeholders are left untouched
pub fn expand_variables(template: &str, variables: &HashMap<String, String>) -> String {
    placeholder_regex()
        .replace_all(template, |caps: &regex::Captures| {
            variables
                .get(&caps[1])
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Host-pattern-scoped collection of environments with one active selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentGroup {
    pub id: Uuid,
    pub name: String,
    pub host_pattern: String,
    #[serde(default)]
    pub environments: Vec<Environment>,
    #[serde(default)]
    pub active_environment_id: Option<Uuid>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl EnvironmentGroup {
    pub fn new(name: impl Into<String>, host_pattern: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            host_pattern: host_pattern.into(),
            environments: Vec::new(),
            active_environment_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environments.push(environment);
        self
    }

    pub fn matches_host(&self, host: &str) -> bool {
        HostPattern::new(&self.host_pattern).matches(host)
    }

    /// Explicitly active environment, else the default one, else the first
    pub fn authoritative_environment(&self) -> Option<&Environment> {
        self.active_environment_id
            .and_then(|id| self.environments.iter().find(|e| e.id == id))
            .or_else(|| self.environments.iter().find(|e| e.is_default))
            .or_else(|| self.environments.first())
    }

    pub fn activate(&mut self, environment_id: Uuid) -> bool {
        if self.environments.iter().any(|e| e.id == environment_id) {
            self.active_environment_id = Some(environment_id);
            true
        } else {
            false
        }
    }

    /// Removing the active environment falls back to the first remaining one
    pub fn remove_environment(&mut self, environment_id: Uuid) -> Option<Environment> {
        let index = self.environments.iter().position(|e| e.id == environment_id)?;
        let removed = self.environments.remove(index);
        if self.active_environment_id == Some(environment_id) {
            self.active_environment_id = self.environments.first().map(|e| e.id);
        }
        Some(removed)
    }

    /// Drop a dangling active id left behind by hand-edited documents
    fn repair_active(&mut self) {
        if let Some(active) = self.active_environment_id {
            if !self.environments.iter().any(|e| e.id == active) {
                warn!(
                    "Group {} referenced missing environment {}, falling back",
                    self.name, active
                );
                self.active_environment_id = self.environments.first().map(|e| e.id);
            }
        }
    }
}

/// Temporary host redirect that takes precedence over groups
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuickOverride {
    /// Lowercase
    pub source_host: String,
    pub target: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl QuickOverride {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expiry) if now >= expiry)
    }
}

/// Where a rewrite came from, kept on the traffic record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RewriteSource {
    QuickOverride {
        source_host: String,
        target: String,
    },
    Environment {
        group_id: Uuid,
        group_name: String,
        environment_id: Uuid,
        environment_name: String,
    },
}

/// Result of resolving one outbound URL
#[derive(Debug, Clone, Default)]
pub struct RewriteResult {
    /// New URL, `None` when the URL is unchanged
    pub url: Option<String>,
    /// Headers to merge over the request's own
    pub headers: Headers,
    /// Per-request trust mode, `None` to use the evaluator's configured mode
    pub trust_mode: Option<TrustMode>,
    pub source: Option<RewriteSource>,
}

impl RewriteResult {
    pub fn is_noop(&self) -> bool {
        self.url.is_none() && self.headers.is_empty() && self.trust_mode.is_none()
    }

    /// Apply this result to a request
    pub fn apply(&self, request: &HttpRequest) -> HttpRequest {
        let mut rewritten = request.clone();
        if let Some(url) = &self.url {
            rewritten.url = url.clone();
        }
        for (name, value) in &self.headers {
            set_header(&mut rewritten.headers, name, value);
        }
        rewritten
    }
}

/// Resolves environment groups and quick overrides for outbound requests
#[derive(Debug, Default)]
pub struct EnvironmentEngine {
    groups: RwLock<Vec<EnvironmentGroup>>,
    overrides: RwLock<HashMap<String, QuickOverride>>,
}

impl EnvironmentEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_groups(groups: Vec<EnvironmentGroup>) -> Self {
        let engine = Self::new();
        engine.replace_groups(groups);
        engine
    }

    /// Resolve the rewrite for `url`. Unparseable URLs, unmatched hosts and
    /// bad targets all yield a no-op.
    pub fn rewrite(&self, url: &str) -> RewriteResult {
        let host = match url::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
        {
            Some(host) => host,
            None => {
                debug!("Not rewriting unparseable URL {:?}", url);
                return RewriteResult::default();
            }
        };

        if let Some(result) = self.rewrite_with_override(url, &host) {
            return result;
        }

        self.rewrite_with_groups(url, &host)
    }

    fn rewrite_with_override(&self, url: &str, host: &str) -> Option<RewriteResult> {
        let now = Utc::now();
        let found = self.overrides.read().get(host).cloned()?;

        if found.is_expired(now) {
            let mut overrides = self.overrides.write();
            if overrides.get(host).map_or(false, |o| o.is_expired(now)) {
                overrides.remove(host);
                info!("Purged expired quick override for {}", host);
            }
            return None;
        }

        let rewritten = match Authority::parse(&found.target, "https")
            .and_then(|authority| authority.apply_to(url))
        {
            Some(rewritten) => rewritten,
            None => {
                warn!(
                    "Quick override target {:?} for {} is not a valid authority",
                    found.target, host
                );
                return Some(RewriteResult::default());
            }
        };

        debug!("Quick override rewrote {} -> {}", url, rewritten);
        Some(RewriteResult {
            url: Some(rewritten),
            headers: Headers::new(),
            trust_mode: Some(TrustMode::allow_all(true)),
            source: Some(RewriteSource::QuickOverride {
                source_host: found.source_host,
                target: found.target,
            }),
        })
    }

    fn rewrite_with_groups(&self, url: &str, host: &str) -> RewriteResult {
        let groups = self.groups.read();
        let group = match groups.iter().find(|g| g.matches_host(host)) {
            Some(group) => group,
            None => return RewriteResult::default(),
        };
        let environment = match group.authoritative_environment() {
            Some(environment) => environment,
            None => return RewriteResult::default(),
        };
        let authority = match environment.authority() {
            Some(authority) => authority,
            None => {
                warn!(
                    "Environment {} has an invalid base URL {:?}",
                    environment.name, environment.base_url
                );
                return RewriteResult::default();
            }
        };

        let rewritten = if authority.host != host {
            authority.apply_to(url)
        } else {
            None
        };

        let trust_mode = if environment.trust_mode.is_strict() {
            None
        } else {
            Some(
                environment
                    .trust_mode
                    .into_mode([authority.host.as_str()], true),
            )
        };

        debug!(
            group = %group.name,
            environment = %environment.name,
            rewritten = ?rewritten,
            "Environment rewrite"
        );

        RewriteResult {
            url: rewritten,
            headers: environment.resolved_headers(),
            trust_mode,
            source: Some(RewriteSource::Environment {
                group_id: group.id,
                group_name: group.name.clone(),
                environment_id: environment.id,
                environment_name: environment.name.clone(),
            }),
        }
    }

    // Groups

    pub fn groups(&self) -> Vec<EnvironmentGroup> {
        self.groups.read().clone()
    }

    pub fn group(&self, group_id: Uuid) -> Option<EnvironmentGroup> {
        self.groups.read().iter().find(|g| g.id == group_id).cloned()
    }

    pub fn replace_groups(&self, mut groups: Vec<EnvironmentGroup>) {
        for group in &mut groups {
            group.repair_active();
        }
        info!("Loaded {} environment group(s)", groups.len());
        *self.groups.write() = groups;
    }

    pub fn add_group(&self, mut group: EnvironmentGroup) -> Uuid {
        group.repair_active();
        let id = group.id;
        info!("Adding environment group {} ({})", group.name, group.host_pattern);
        self.groups.write().push(group);
        id
    }

    pub fn update_group(&self, mut group: EnvironmentGroup) -> bool {
        group.repair_active();
        let mut groups = self.groups.write();
        match groups.iter_mut().find(|g| g.id == group.id) {
            Some(existing) => {
                *existing = group;
                true
            }
            None => false,
        }
    }

    pub fn remove_group(&self, group_id: Uuid) -> bool {
        let mut groups = self.groups.write();
        let before = groups.len();
        groups.retain(|g| g.id != group_id);
        groups.len() != before
    }

    // Environments

    pub fn add_environment(&self, group_id: Uuid, environment: Environment) -> bool {
        self.with_group(group_id, |group| group.environments.push(environment))
            .is_some()
    }

    pub fn update_environment(&self, group_id: Uuid, mut environment: Environment) -> bool {
        environment.updated_at = Utc::now();
        self.with_group(group_id, |group| {
            match group.environments.iter_mut().find(|e| e.id == environment.id) {
                Some(existing) => {
                    *existing = environment;
                    true
                }
                None => false,
            }
        })
        .unwrap_or(false)
    }

    pub fn remove_environment(&self, group_id: Uuid, environment_id: Uuid) -> bool {
        self.with_group(group_id, |group| group.remove_environment(environment_id).is_some())
            .unwrap_or(false)
    }

    pub fn activate(&self, group_id: Uuid, environment_id: Uuid) -> bool {
        let activated = self
            .with_group(group_id, |group| group.activate(environment_id))
            .unwrap_or(false);
        if activated {
            info!("Activated environment {} in group {}", environment_id, group_id);
        }
        activated
    }

    fn with_group<T>(&self, group_id: Uuid, f: impl FnOnce(&mut EnvironmentGroup) -> T) -> Option<T> {
        let mut groups = self.groups.write();
        groups.iter_mut().find(|g| g.id == group_id).map(f)
    }

    // Variables

    /// First authoritative environment (in group order) defining `key`
    pub fn variable(&self, key: &str) -> Option<String> {
        self.groups
            .read()
            .iter()
            .filter_map(|g| g.authoritative_environment())
            .find_map(|e| e.variables.get(key).cloned())
    }

    /// Variable from the authoritative environment of the group serving `host`
    pub fn variable_for_host(&self, host: &str, key: &str) -> Option<String> {
        let host = host.trim().to_ascii_lowercase();
        self.groups
            .read()
            .iter()
            .find(|g| g.matches_host(&host))
            .and_then(|g| g.authoritative_environment())
            .and_then(|e| e.variables.get(key).cloned())
    }

    // Quick overrides

    pub fn set_quick_override(
        &self,
        source_host: &str,
        target: &str,
        ttl: Option<Duration>,
    ) -> QuickOverride {
        let now = Utc::now();
        let source_host = source_host.trim().to_ascii_lowercase();
        if Authority::parse(target, "https").is_none() {
            warn!("Quick override target {:?} is not a valid authority", target);
        }
        let expires_at = ttl
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .map(|ttl| now + ttl);
        let quick_override = QuickOverride {
            source_host: source_host.clone(),
            target: target.trim().to_string(),
            created_at: now,
            expires_at,
        };
        info!("Quick override {} -> {}", source_host, quick_override.target);
        self.overrides
            .write()
            .insert(source_host, quick_override.clone());
        quick_override
    }

    pub fn remove_quick_override(&self, source_host: &str) -> bool {
        self.overrides
            .write()
            .remove(&source_host.trim().to_ascii_lowercase())
            .is_some()
    }

    /// Live overrides; expired ones are purged on the way
    pub fn quick_overrides(&self) -> Vec<QuickOverride> {
        let now = Utc::now();
        let mut overrides = self.overrides.write();
        overrides.retain(|_, o| !o.is_expired(now));
        let mut live: Vec<QuickOverride> = overrides.values().cloned().collect();
        live.sort_by(|a, b| a.source_host.cmp(&b.source_host));
        live
    }

    pub fn clear_quick_overrides(&self) {
        self.overrides.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn staging_group() -> (EnvironmentGroup, Uuid, Uuid) {
        let prod = Environment::new("prod", "https://api.example.com").as_default();
        let staging = Environment::new("staging", "https://staging.example.com:8443")
            .with_header("X-Env", "staging")
            .with_header("Authorization", "Bearer {{token}}")
            .with_variable("token", "s3cr3t");
        let (prod_id, staging_id) = (prod.id, staging.id);
        let group = EnvironmentGroup::new("API", "api.example.com")
            .with_environment(prod)
            .with_environment(staging);
        (group, prod_id, staging_id)
    }

    #[test]
    fn test_quick_override_rewrites_authority_only() {
        let engine = EnvironmentEngine::new();
        engine.set_quick_override("API.example.com", "http://localhost:8080", None);

        let result = engine.rewrite("https://api.example.com/users?page=1");
        assert_eq!(
            result.url.as_deref(),
            Some("http://localhost:8080/users?page=1")
        );
        assert!(matches!(
            result.trust_mode,
            Some(TrustMode::AllowAll { acknowledged: true })
        ));
        assert!(matches!(
            result.source,
            Some(RewriteSource::QuickOverride { .. })
        ));
    }

    #[test]
    fn test_quick_override_beats_groups() {
        let (group, _, staging_id) = staging_group();
        let group_id = group.id;
        let engine = EnvironmentEngine::with_groups(vec![group]);
        engine.activate(group_id, staging_id);
        engine.set_quick_override("api.example.com", "localhost:9000", None);

        let result = engine.rewrite("https://api.example.com/users");
        assert_eq!(result.url.as_deref(), Some("https://localhost:9000/users"));
        assert!(result.headers.is_empty());
    }

    #[test]
    fn test_expired_override_is_purged() {
        let engine = EnvironmentEngine::new();
        engine.set_quick_override("api.example.com", "localhost:9000", None);
        engine
            .overrides
            .write()
            .get_mut("api.example.com")
            .unwrap()
            .expires_at = Some(Utc::now() - chrono::Duration::seconds(5));

        let result = engine.rewrite("https://api.example.com/users");
        assert!(result.is_noop());
        assert!(engine.overrides.read().is_empty());
    }

    #[test]
    fn test_active_environment_rewrites_and_merges_headers() {
        let (group, _, staging_id) = staging_group();
        let group_id = group.id;
        let engine = EnvironmentEngine::with_groups(vec![group]);
        assert!(engine.activate(group_id, staging_id));

        let result = engine.rewrite("https://api.example.com/v1/users");
        assert_eq!(
            result.url.as_deref(),
            Some("https://staging.example.com:8443/v1/users")
        );
        assert_eq!(result.headers.get("X-Env"), Some(&"staging".to_string()));
        assert_eq!(
            result.headers.get("Authorization"),
            Some(&"Bearer s3cr3t".to_string())
        );
    }

    #[test]
    fn test_same_host_environment_leaves_url_alone() {
        let (group, _, _) = staging_group();
        let engine = EnvironmentEngine::with_groups(vec![group]);

        // Default environment (prod) targets the request host itself
        let result = engine.rewrite("https://api.example.com/v1/users");
        assert!(result.url.is_none());
        assert!(matches!(
            result.source,
            Some(RewriteSource::Environment { .. })
        ));
    }

    #[test]
    fn test_unmatched_host_is_noop() {
        let (group, _, _) = staging_group();
        let engine = EnvironmentEngine::with_groups(vec![group]);
        assert!(engine.rewrite("https://other.test/").is_noop());
        assert!(engine.rewrite("not a url").is_noop());
    }

    #[test]
    fn test_first_matching_group_wins() {
        let first = EnvironmentGroup::new("wildcard", "*.example.com")
            .with_environment(Environment::new("local", "http://127.0.0.1:3000"));
        let second = EnvironmentGroup::new("exact", "api.example.com")
            .with_environment(Environment::new("mock", "http://127.0.0.1:4000"));
        let engine = EnvironmentEngine::with_groups(vec![first, second]);

        let result = engine.rewrite("https://api.example.com/");
        assert_eq!(result.url.as_deref(), Some("http://127.0.0.1:3000/"));
    }

    #[test]
    fn test_environment_trust_mode_is_scoped_to_target() {
        let env = Environment::new("dev", "https://dev.internal")
            .with_trust_mode(TrustModeSelector::AllowSelfSigned);
        let engine = EnvironmentEngine::with_groups(vec![
            EnvironmentGroup::new("API", "api.example.com").with_environment(env)
        ]);

        match engine.rewrite("https://api.example.com/").trust_mode {
            Some(TrustMode::AllowSelfSigned(hosts)) => {
                assert_eq!(hosts.into_iter().collect::<Vec<_>>(), vec!["dev.internal"]);
            }
            other => panic!("unexpected trust mode {:?}", other),
        }
    }

    #[test]
    fn test_removing_active_environment_selects_fallback() {
        let (mut group, prod_id, staging_id) = staging_group();
        assert!(group.activate(staging_id));
        group.remove_environment(staging_id);
        assert_eq!(group.active_environment_id, Some(prod_id));

        group.remove_environment(prod_id);
        assert_eq!(group.active_environment_id, None);
        assert!(group.authoritative_environment().is_none());
    }

    #[test]
    fn test_authoritative_falls_back_to_default_then_first() {
        let a = Environment::new("a", "https://a.test");
        let b = Environment::new("b", "https://b.test").as_default();
        let group = EnvironmentGroup::new("g", "*.test")
            .with_environment(a.clone())
            .with_environment(b.clone());
        assert_eq!(group.authoritative_environment().unwrap().id, b.id);

        let group = EnvironmentGroup::new("g", "*.test").with_environment(a.clone());
        assert_eq!(group.authoritative_environment().unwrap().id, a.id);
    }

    #[test]
    fn test_activate_rejects_foreign_environment() {
        let (group, _, _) = staging_group();
        let group_id = group.id;
        let engine = EnvironmentEngine::with_groups(vec![group]);
        assert!(!engine.activate(group_id, Uuid::new_v4()));
        assert!(!engine.activate(Uuid::new_v4(), Uuid::new_v4()));
    }

    #[test]
    fn test_dangling_active_id_is_repaired_on_load() {
        let (mut group, prod_id, _) = staging_group();
        group.active_environment_id = Some(Uuid::new_v4());
        let engine = EnvironmentEngine::with_groups(vec![group]);
        assert_eq!(engine.groups()[0].active_environment_id, Some(prod_id));
    }

    #[test]
    fn test_variable_accessors() {
        let (group, _, staging_id) = staging_group();
        let group_id = group.id;
        let engine = EnvironmentEngine::with_groups(vec![group]);
        assert_eq!(engine.variable("token"), None);

        engine.activate(group_id, staging_id);
        assert_eq!(engine.variable("token"), Some("s3cr3t".to_string()));
        assert_eq!(
            engine.variable_for_host("API.example.com", "token"),
            Some("s3cr3t".to_string())
        );
        assert_eq!(engine.variable_for_host("other.test", "token"), None);
    }

    #[test]
    fn test_expand_variables_leaves_unknown_placeholders() {
        let vars = HashMap::from([("a".to_string(), "1".to_string())]);
        assert_eq!(expand_variables("{{a}}-{{ b }}", &vars), "1-{{ b }}");
    }

    #[test]
    fn test_quick_override_listing_and_removal() {
        let engine = EnvironmentEngine::new();
        engine.set_quick_override("b.test", "localhost:1", None);
        engine.set_quick_override("a.test", "localhost:2", Some(Duration::from_secs(60)));
        engine.set_quick_override("a.test", "localhost:3", None);

        let live = engine.quick_overrides();
        assert_eq!(live.len(), 2);
        assert_eq!(live[0].source_host, "a.test");
        assert_eq!(live[0].target, "localhost:3");

        assert!(engine.remove_quick_override("A.TEST"));
        assert_eq!(engine.quick_overrides().len(), 1);
    }

    #[test]
    fn test_invalid_override_target_degrades_to_noop() {
        let engine = EnvironmentEngine::new();
        engine.set_quick_override("a.test", "http://", None);
        assert!(engine.rewrite("https://a.test/x").is_noop());
    }
}
