//! Saved rules and environments
//!
//! Documents are plain serde types so any format can back a
//! [`RuleRepository`]. [`JsonFileRepository`] keeps one JSON file per
//! document in a directory.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::environment::EnvironmentGroup;
use crate::error::{CoreError, Result};
use crate::policy::{BreakpointRule, MockRule};

pub const DOCUMENT_VERSION: u32 = 1;

fn current_version() -> u32 {
    DOCUMENT_VERSION
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentDocument {
    #[serde(default = "current_version")]
    pub version: u32,
    #[serde(default)]
    pub groups: Vec<EnvironmentGroup>,
}

impl EnvironmentDocument {
    pub fn new(groups: Vec<EnvironmentGroup>) -> Self {
        Self {
            version: DOCUMENT_VERSION,
            groups,
        }
    }
}

impl Default for EnvironmentDocument {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleDocument {
    #[serde(default = "current_version")]
    pub version: u32,
    #[serde(default)]
    pub mock_rules: Vec<MockRule>,
    #[serde(default)]
    pub breakpoint_rules: Vec<BreakpointRule>,
    /// Host to SPKI pins
    #[serde(default)]
    pub pins: BTreeMap<String, BTreeSet<String>>,
}

impl RuleDocument {
    pub fn new(
        mock_rules: Vec<MockRule>,
        breakpoint_rules: Vec<BreakpointRule>,
        pins: BTreeMap<String, BTreeSet<String>>,
    ) -> Self {
        Self {
            version: DOCUMENT_VERSION,
            mock_rules,
            breakpoint_rules,
            pins,
        }
    }
}

impl Default for RuleDocument {
    fn default() -> Self {
        Self::new(Vec::new(), Vec::new(), BTreeMap::new())
    }
}

/// Storage for rule and environment documents. A repository with nothing
/// saved yet returns empty documents.
pub trait RuleRepository: Send + Sync {
    fn load_environments(&self) -> Result<EnvironmentDocument>;
    fn save_environments(&self, document: &EnvironmentDocument) -> Result<()>;
    fn load_rules(&self) -> Result<RuleDocument>;
    fn save_rules(&self, document: &RuleDocument) -> Result<()>;
}

const ENVIRONMENTS_FILE: &str = "environments.json";
const RULES_FILE: &str = "rules.json";

#[derive(Debug, Clone)]
pub struct JsonFileRepository {
    dir: PathBuf,
}

impl JsonFileRepository {
    /// Creates the directory if needed
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| {
            CoreError::Persistence(format!("Failed to create {}: {}", dir.display(), e))
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn read<T>(&self, name: &str) -> Result<T>
    where
        T: for<'de> Deserialize<'de> + Default + HasVersion,
    {
        let path = self.dir.join(name);
        if !path.exists() {
            debug!("{} not found, starting empty", path.display());
            return Ok(T::default());
        }

        let content = std::fs::read_to_string(&path)?;
        let document: T = serde_json::from_str(&content).map_err(|e| {
            CoreError::Persistence(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        if document.version() > DOCUMENT_VERSION {
            warn!(
                "{} has version {}, newer than supported {}",
                path.display(),
                document.version(),
                DOCUMENT_VERSION
            );
        }
        Ok(document)
    }

    /// Write to a sibling temp file, then rename over the target
    fn write<T: Serialize>(&self, name: &str, document: &T) -> Result<()> {
        let path = self.dir.join(name);
        let staging = self.dir.join(format!("{}.tmp", name));
        let content = serde_json::to_string_pretty(document)?;
        std::fs::write(&staging, content)?;
        std::fs::rename(&staging, &path)?;
        info!("Saved {}", path.display());
        Ok(())
    }
}

trait HasVersion {
    fn version(&self) -> u32;
}

impl HasVersion for EnvironmentDocument {
    fn version(&self) -> u32 {
        self.version
    }
}

impl HasVersion for RuleDocument {
    fn version(&self) -> u32 {
        self.version
    }
}

impl RuleRepository for JsonFileRepository {
    fn load_environments(&self) -> Result<EnvironmentDocument> {
        self.read(ENVIRONMENTS_FILE)
    }

    fn save_environments(&self, document: &EnvironmentDocument) -> Result<()> {
        self.write(ENVIRONMENTS_FILE, document)
    }

    fn load_rules(&self) -> Result<RuleDocument> {
        self.read(RULES_FILE)
    }

    fn save_rules(&self, document: &RuleDocument) -> Result<()> {
        self.write(RULES_FILE, document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::Environment;
    use crate::policy::{BreakpointDirection, MockAction, RequestMatcher};
    use crate::trust::TrustModeSelector;
    use intercept_common::HttpResponse;
    use std::time::Duration;

    #[test]
    fn test_empty_directory_loads_empty_documents() {
        let dir = tempfile::tempdir().unwrap();
        let repo = JsonFileRepository::open(dir.path().join("state")).unwrap();

        assert!(repo.load_environments().unwrap().groups.is_empty());
        let rules = repo.load_rules().unwrap();
        assert_eq!(rules.version, DOCUMENT_VERSION);
        assert!(rules.mock_rules.is_empty());
    }

    #[test]
    fn test_documents_survive_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let repo = JsonFileRepository::open(dir.path()).unwrap();

        let group = EnvironmentGroup::new("api", "*.example.com").with_environment(
            Environment::new("staging", "https://staging.example.com")
                .with_header("X-Env", "{{name}}")
                .with_variable("name", "staging")
                .with_trust_mode(TrustModeSelector::AllowSelfSigned),
        );
        repo.save_environments(&EnvironmentDocument::new(vec![group.clone()]))
            .unwrap();

        let mut pins = BTreeMap::new();
        pins.insert(
            "a.test".to_string(),
            BTreeSet::from(["pin-one".to_string()]),
        );
        let rules = RuleDocument::new(
            vec![MockRule::new(
                "users",
                RequestMatcher::url("/users").with_method("GET"),
                MockAction::Respond(HttpResponse::new(200).with_body(b"[]".to_vec())),
            )
            .with_priority(10)],
            vec![BreakpointRule::new(
                "hold",
                RequestMatcher::any(),
                BreakpointDirection::Both,
            )
            .with_auto_resume(Duration::from_secs(5))],
            pins,
        );
        repo.save_rules(&rules).unwrap();

        assert_eq!(repo.load_environments().unwrap().groups, vec![group]);
        assert_eq!(repo.load_rules().unwrap(), rules);
        assert!(!dir.path().join("rules.json.tmp").exists());
    }

    #[test]
    fn test_missing_fields_default_safely() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(RULES_FILE),
            r#"{
                "mock_rules": [{
                    "id": "6f1c1c1e-3d7a-4d3e-9a57-0a6f7b1e2c3d",
                    "name": "legacy",
                    "matcher": {"url_pattern": "/legacy"},
                    "action": {"type": "passthrough"},
                    "some_future_field": true
                }]
            }"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join(ENVIRONMENTS_FILE),
            r#"{
                "groups": [{
                    "id": "0b0c5a8e-7f43-4a53-8d1b-2f2d0e1b5c77",
                    "name": "api",
                    "host_pattern": "api.example.com",
                    "environments": [{
                        "id": "9d3f6a1b-1c2e-4b5a-8f7d-6e5c4b3a2f10",
                        "name": "local",
                        "base_url": "http://localhost:8080"
                    }]
                }]
            }"#,
        )
        .unwrap();

        let repo = JsonFileRepository::open(dir.path()).unwrap();
        let rules = repo.load_rules().unwrap();
        assert_eq!(rules.version, DOCUMENT_VERSION);
        let rule = &rules.mock_rules[0];
        assert!(rule.enabled);
        assert_eq!(rule.activation_count, 0);
        assert_eq!(rule.priority, 0);

        let groups = repo.load_environments().unwrap().groups;
        let environment = &groups[0].environments[0];
        assert!(environment.trust_mode.is_strict());
        assert!(environment.headers.is_empty());
    }

    #[test]
    fn test_corrupt_file_is_a_persistence_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(RULES_FILE), "{ not json").unwrap();
        let repo = JsonFileRepository::open(dir.path()).unwrap();
        assert!(matches!(repo.load_rules(), Err(CoreError::Persistence(_))));
    }
}
