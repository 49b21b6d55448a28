//! Rate limit policies per operation.
//!
//! Policies are loaded from YAML. Each protected operation names its burst
//! capacity and sustained refill rate; operations without an entry fall back
//! to the default policy.
//!
//! Operation names are case-insensitive: they are trimmed and lowercased on
//! insert and on lookup, and the lowercased name is what keys a bucket.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{FloodgateError, Result};

/// Token bucket parameters for one operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// The protected operation name
    #[serde(default)]
    pub operation: String,
    /// Maximum tokens the bucket can hold (burst size)
    pub capacity: u32,
    /// Tokens regenerated per minute (sustained rate)
    pub refill_per_minute: f64,
}

impl RateLimitPolicy {
    /// Create a policy for an operation.
    pub fn new(operation: impl Into<String>, capacity: u32, refill_per_minute: f64) -> Self {
        Self {
            operation: operation.into(),
            capacity,
            refill_per_minute,
        }
    }

    /// Tokens regenerated per second.
    pub fn refill_rate(&self) -> f64 {
        self.refill_per_minute / 60.0
    }

    /// Time for an empty bucket to fill back to capacity.
    ///
    /// Saturates at `Duration::MAX` for rates too slow to represent.
    pub fn full_refill_window(&self) -> Duration {
        let rate = self.refill_rate();
        if rate <= 0.0 || !rate.is_finite() {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(self.capacity as f64 / rate).unwrap_or(Duration::MAX)
    }

    /// Reject policies that cannot admit or regenerate tokens.
    pub fn validate(&self) -> Result<()> {
        if self.capacity < 1 {
            return Err(FloodgateError::Policy(format!(
                "operation '{}': capacity must be at least 1",
                self.operation
            )));
        }
        if !(self.refill_per_minute.is_finite() && self.refill_per_minute > 0.0) {
            return Err(FloodgateError::Policy(format!(
                "operation '{}': refill_per_minute must be a positive number",
                self.operation
            )));
        }
        Ok(())
    }
}

/// Bucket parameters as written in a policy file (the map key is the operation).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    pub capacity: u32,
    pub refill_per_minute: f64,
}

/// The full policy table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySet {
    /// Policy applied to operations with no explicit entry
    #[serde(default = "default_rule")]
    pub default: PolicyRule,
    /// Per-operation policies, keyed by normalized operation name
    #[serde(default, deserialize_with = "normalized_operations")]
    pub operations: HashMap<String, PolicyRule>,
}

/// Canonical form of an operation name.
pub fn normalize_operation(operation: &str) -> String {
    operation.trim().to_ascii_lowercase()
}

fn normalized_operations<'de, D>(
    deserializer: D,
) -> std::result::Result<HashMap<String, PolicyRule>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = HashMap::<String, PolicyRule>::deserialize(deserializer)?;
    let mut operations = HashMap::with_capacity(raw.len());
    for (name, rule) in raw {
        let key = normalize_operation(&name);
        if operations.insert(key.clone(), rule).is_some() {
            return Err(serde::de::Error::custom(format!(
                "operation '{}' is defined more than once",
                key
            )));
        }
    }
    Ok(operations)
}

fn default_rule() -> PolicyRule {
    PolicyRule {
        capacity: 10,
        refill_per_minute: 10.0,
    }
}

impl Default for PolicySet {
    fn default() -> Self {
        Self {
            default: default_rule(),
            operations: HashMap::new(),
        }
    }
}

impl PolicySet {
    /// Create an empty policy set with the built-in default.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load policies from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit policies");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load policies from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let set: PolicySet = serde_yaml::from_str(yaml).map_err(|e| {
            FloodgateError::Config(format!("Failed to parse rate limit policies: {}", e))
        })?;
        set.validate()?;
        Ok(set)
    }

    /// Add or replace the policy for one operation.
    pub fn insert(&mut self, policy: RateLimitPolicy) {
        self.operations.insert(
            normalize_operation(&policy.operation),
            PolicyRule {
                capacity: policy.capacity,
                refill_per_minute: policy.refill_per_minute,
            },
        );
    }

    /// Validate every policy in the set.
    pub fn validate(&self) -> Result<()> {
        self.policy_for("default").validate()?;
        for operation in self.operations.keys() {
            self.policy_for(operation).validate()?;
        }
        Ok(())
    }

    /// Whether an explicit policy exists for an operation.
    pub fn contains(&self, operation: &str) -> bool {
        self.operations.contains_key(&normalize_operation(operation))
    }

    /// Resolve the policy for an operation, falling back to the default.
    ///
    /// The returned policy carries the normalized operation name.
    pub fn policy_for(&self, operation: &str) -> RateLimitPolicy {
        let operation = normalize_operation(operation);
        let rule = self.operations.get(&operation).unwrap_or(&self.default);
        RateLimitPolicy::new(operation, rule.capacity, rule.refill_per_minute)
    }

    /// The longest full-refill window across all configured policies.
    ///
    /// A bucket swept before this much idle time could still be below
    /// capacity, so sweeps never use a shorter age.
    pub fn longest_refill_window(&self) -> Duration {
        std::iter::once("default")
            .chain(self.operations.keys().map(String::as_str))
            .map(|op| self.policy_for(op).full_refill_window())
            .max()
            .unwrap_or(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_policies() {
        let yaml = r#"
default:
  capacity: 20
  refill_per_minute: 30
operations:
  submit_form:
    capacity: 5
    refill_per_minute: 2
  login:
    capacity: 3
    refill_per_minute: 1.5
"#;
        let set = PolicySet::from_yaml(yaml).unwrap();
        assert_eq!(set.operations.len(), 2);

        let form = set.policy_for("submit_form");
        assert_eq!(form.operation, "submit_form");
        assert_eq!(form.capacity, 5);
        assert_eq!(form.refill_per_minute, 2.0);

        let login = set.policy_for("login");
        assert_eq!(login.refill_per_minute, 1.5);
        assert!((login.refill_rate() - 0.025).abs() < 1e-12);
    }

    #[test]
    fn test_unknown_operation_uses_default() {
        let yaml = r#"
default:
  capacity: 7
  refill_per_minute: 14
"#;
        let set = PolicySet::from_yaml(yaml).unwrap();
        let policy = set.policy_for("create_post");
        assert!(!set.contains("create_post"));
        assert_eq!(policy.operation, "create_post");
        assert_eq!(policy.capacity, 7);
    }

    #[test]
    fn test_builtin_default_when_omitted() {
        let set = PolicySet::from_yaml("operations: {}").unwrap();
        assert_eq!(set.policy_for("anything").capacity, 10);
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let yaml = r#"
operations:
  broken:
    capacity: 0
    refill_per_minute: 10
"#;
        let err = PolicySet::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, FloodgateError::Policy(_)));
    }

    #[test]
    fn test_rejects_non_positive_refill() {
        let policy = RateLimitPolicy::new("frozen", 5, 0.0);
        assert!(policy.validate().is_err());

        let policy = RateLimitPolicy::new("negative", 5, -1.0);
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_longest_refill_window() {
        let mut set = PolicySet::new();
        set.insert(RateLimitPolicy::new("slow", 10, 1.0));
        set.insert(RateLimitPolicy::new("fast", 10, 600.0));

        // 10 tokens at 1 per minute
        assert_eq!(set.longest_refill_window(), Duration::from_secs(600));
    }

    #[test]
    fn test_operation_names_ignore_case() {
        let yaml = r#"
operations:
  SubmitForm:
    capacity: 3
    refill_per_minute: 6
"#;
        let set = PolicySet::from_yaml(yaml).unwrap();
        assert!(set.contains("submitform"));
        assert!(set.contains(" SUBMITFORM "));

        let policy = set.policy_for("SubmitForm");
        assert_eq!(policy.capacity, 3);
        assert_eq!(policy.operation, "submitform");

        let mut set = PolicySet::new();
        set.insert(RateLimitPolicy::new("Login", 2, 1.0));
        assert_eq!(set.policy_for("login").capacity, 2);
    }

    #[test]
    fn test_rejects_operations_differing_only_in_case() {
        let yaml = r#"
operations:
  login:
    capacity: 3
    refill_per_minute: 6
  LOGIN:
    capacity: 30
    refill_per_minute: 60
"#;
        assert!(matches!(
            PolicySet::from_yaml(yaml),
            Err(FloodgateError::Config(_))
        ));
    }

    #[test]
    fn test_tiny_refill_rate_saturates_window() {
        let mut set = PolicySet::new();
        set.insert(RateLimitPolicy::new("slow", 10, 1e-18));
        assert!(set.validate().is_ok());
        assert_eq!(set.longest_refill_window(), Duration::MAX);
    }

    #[test]
    fn test_malformed_yaml() {
        assert!(matches!(
            PolicySet::from_yaml("operations: [1, 2"),
            Err(FloodgateError::Config(_))
        ));
    }
}
