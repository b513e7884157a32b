//! Mock rule resolution

use chrono::Utc;
use intercept_common::HttpRequest;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};
use uuid::Uuid;

use crate::policy::{MockAction, MockRule};

/// Rule that won an evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockMatch {
    pub rule_id: Uuid,
    pub rule_name: String,
    pub action: MockAction,
    /// Activation count after this evaluation
    pub activation_count: u64,
}

/// Priority-ordered mock rules
#[derive(Debug)]
pub struct MockEngine {
    /// Always sorted by descending priority
    rules: RwLock<Vec<MockRule>>,
    enabled: AtomicBool,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new(true)
    }
}

impl MockEngine {
    pub fn new(enabled: bool) -> Self {
        Self {
            rules: RwLock::new(Vec::new()),
            enabled: AtomicBool::new(enabled),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        info!("Mock engine {}", if enabled { "enabled" } else { "disabled" });
        self.enabled.store(enabled, Ordering::Release);
    }

    /// First applicable rule in priority order. Respond, error and delay
    /// matches consume an activation here, whether or not the caller ends up
    /// delivering the result.
    pub fn evaluate(&self, req: &HttpRequest) -> Option<MockMatch> {
        if !self.is_enabled() {
            return None;
        }

        let now = Utc::now();
        // Write lock: limit check and counter increment must be one step
        let mut rules = self.rules.write();
        let rule = rules.iter_mut().find(|rule| rule.applies_to(req, now))?;

        if rule.action.counts_activation() {
            rule.activation_count += 1;
        }
        debug!(
            rule = %rule.name,
            priority = rule.priority,
            activations = rule.activation_count,
            "Mock rule matched {} {}",
            req.method,
            req.url
        );

        Some(MockMatch {
            rule_id: rule.id,
            rule_name: rule.name.clone(),
            action: rule.action.clone(),
            activation_count: rule.activation_count,
        })
    }

    fn sort(rules: &mut [MockRule]) {
        // Stable: equal priorities keep insertion order
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    pub fn rules(&self) -> Vec<MockRule> {
        self.rules.read().clone()
    }

    pub fn rule(&self, id: Uuid) -> Option<MockRule> {
        self.rules.read().iter().find(|r| r.id == id).cloned()
    }

    pub fn add_rule(&self, rule: MockRule) -> Uuid {
        let id = rule.id;
        info!("Adding mock rule {} (priority {})", rule.name, rule.priority);
        let mut rules = self.rules.write();
        rules.push(rule);
        Self::sort(&mut rules);
        id
    }

    pub fn update_rule(&self, rule: MockRule) -> bool {
        let mut rules = self.rules.write();
        let Some(existing) = rules.iter_mut().find(|r| r.id == rule.id) else {
            return false;
        };
        *existing = rule;
        Self::sort(&mut rules);
        true
    }

    pub fn remove_rule(&self, id: Uuid) -> bool {
        let mut rules = self.rules.write();
        let before = rules.len();
        rules.retain(|r| r.id != id);
        rules.len() != before
    }

    pub fn set_rule_enabled(&self, id: Uuid, enabled: bool) -> bool {
        let mut rules = self.rules.write();
        match rules.iter_mut().find(|r| r.id == id) {
            Some(rule) => {
                rule.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn replace_rules(&self, mut rules: Vec<MockRule>) {
        Self::sort(&mut rules);
        info!("Loaded {} mock rule(s)", rules.len());
        *self.rules.write() = rules;
    }

    /// Reset one rule's counter, or every rule's when `id` is `None`
    pub fn reset_activations(&self, id: Option<Uuid>) {
        let mut rules = self.rules.write();
        rules
            .iter_mut()
            .filter(|r| id.map_or(true, |id| r.id == id))
            .for_each(|r| r.activation_count = 0);
    }

    pub fn clear(&self) {
        self.rules.write().clear();
    }
}
