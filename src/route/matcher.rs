//! Rule matching: cgroup path to forwarding decision
//!
//! Rules are evaluated in configuration order against the normalized
//! cgroup path; the first match wins. A path matching no rule gets no
//! decision at all, so its traffic follows the host's normal routing.

use regex::Regex;

use crate::config::{DecisionConfig, RuleConfig};
use crate::error::ConfigError;
use crate::monitor::CgroupPath;
use crate::nft::Target;

struct CompiledRule {
    pattern: Regex,
    target: Target,
}

/// Ordered, pre-compiled routing rules
pub struct RouteMatcher {
    rules: Vec<CompiledRule>,
}

impl RouteMatcher {
    /// Compile the configured rules.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` for an invalid pattern.
    /// Already caught by config validation; duplicated here because the
    /// matcher can be built from rules that never went through it.
    pub fn from_rules(rules: &[RuleConfig]) -> Result<Self, ConfigError> {
        let compiled = rules
            .iter()
            .map(|rule| {
                let pattern = Regex::new(&rule.pattern).map_err(|e| {
                    ConfigError::ValidationError(format!(
                        "invalid pattern '{}': {e}",
                        rule.pattern
                    ))
                })?;
                let target = match &rule.decision {
                    DecisionConfig::Tproxy(name) => Target::tproxy(name.clone()),
                    DecisionConfig::Drop => Target::drop(),
                    DecisionConfig::Direct => Target::direct(),
                };
                Ok(CompiledRule { pattern, target })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;
        Ok(Self { rules: compiled })
    }

    /// Resolve a cgroup path to its forwarding decision, first match wins
    #[must_use]
    pub fn resolve(&self, path: &CgroupPath) -> Target {
        self.rules
            .iter()
            .find(|rule| rule.pattern.is_match(path.as_str()))
            .map_or_else(Target::noop, |rule| rule.target.clone())
    }

    /// Number of compiled rules
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether no rules are configured
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher(rules: &[(&str, DecisionConfig)]) -> RouteMatcher {
        let rules: Vec<RuleConfig> = rules
            .iter()
            .map(|(pattern, decision)| RuleConfig {
                pattern: (*pattern).to_string(),
                decision: decision.clone(),
            })
            .collect();
        RouteMatcher::from_rules(&rules).unwrap()
    }

    #[test]
    fn test_first_match_wins() {
        let matcher = matcher(&[
            ("^/app1", DecisionConfig::Tproxy("t1".into())),
            (".*", DecisionConfig::Direct),
        ]);

        assert_eq!(
            matcher.resolve(&CgroupPath::new("/app1/worker")),
            Target::tproxy("t1")
        );
        assert_eq!(
            matcher.resolve(&CgroupPath::new("/system.slice")),
            Target::direct()
        );
    }

    #[test]
    fn test_no_match_is_noop() {
        let matcher = matcher(&[("^/blocked", DecisionConfig::Drop)]);
        assert_eq!(
            matcher.resolve(&CgroupPath::new("/user.slice")),
            Target::noop()
        );
    }

    #[test]
    fn test_pattern_is_unanchored_by_default() {
        let matcher = matcher(&[("worker", DecisionConfig::Drop)]);
        assert_eq!(
            matcher.resolve(&CgroupPath::new("/a/worker/b")),
            Target::drop()
        );
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let rules = vec![RuleConfig {
            pattern: "(".into(),
            decision: DecisionConfig::Direct,
        }];
        assert!(RouteMatcher::from_rules(&rules).is_err());
    }
}
