use wildmatch::WildMatch;

/// Host pattern used to scope an environment group
///
/// Supported forms, tried in this order:
/// 1. exact host (`api.example.com`)
/// 2. leading wildcard (`*.example.com`)
/// 3. trailing wildcard (`api.example.*`)
/// 4. fragmented wildcard (`api*.example.*`): every non-empty fragment must
///    appear somewhere in the host, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPattern {
    pattern: String,
}

impl HostPattern {
    pub fn new(pattern: &str) -> Self {
        Self {
            pattern: pattern.trim().to_ascii_lowercase(),
        }
    }

    /// `host` is expected to be lowercase already
    pub fn matches(&self, host: &str) -> bool {
        let pattern = self.pattern.as_str();
        if pattern.is_empty() {
            return false;
        }

        if pattern == host {
            return true;
        }

        let stars = pattern.matches('*').count();
        if stars == 0 {
            return false;
        }

        if stars == 1 {
            if let Some(suffix) = pattern.strip_prefix('*') {
                return host.ends_with(suffix);
            }
            if let Some(prefix) = pattern.strip_suffix('*') {
                return host.starts_with(prefix);
            }
        }

        // Fragments in order anywhere in the host, neither end anchored
        WildMatch::new(&format!("*{}*", pattern)).matches(host)
    }
}
