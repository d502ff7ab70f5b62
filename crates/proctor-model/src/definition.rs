//! Persisted test definition model
//!
//! A [`TestDefinition`] is only ever replaced as a whole inside a commit.
//! Field names serialize in camelCase to match the on-disk `definition.json`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

/// Kind of identifier a test randomizes on.
///
/// The set is open: unknown names round-trip untouched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TestType(Cow<'static, str>);

impl TestType {
    /// Logged-in user
    pub const USER: Self = Self(Cow::Borrowed("USER"));
    /// Single page view
    pub const PAGE: Self = Self(Cow::Borrowed("PAGE"));
    /// Anonymous visitor
    pub const ANONYMOUS_USER: Self = Self(Cow::Borrowed("ANONYMOUS_USER"));
    /// Email address
    pub const EMAIL_ADDRESS: Self = Self(Cow::Borrowed("EMAIL_ADDRESS"));
    /// Random per evaluation
    pub const RANDOM: Self = Self(Cow::Borrowed("RANDOM"));

    /// Create a test type from an arbitrary name
    #[inline]
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    /// Type name
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque bucket payload (scalar, array or map of primitives)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(pub Value);

impl Payload {
    /// Wrap a JSON value
    #[inline]
    #[must_use]
    pub fn new(value: Value) -> Self {
        Self(value)
    }
}

/// A named variant of a test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestBucket {
    /// Bucket name
    #[serde(default)]
    pub name: String,
    /// Bucket identity, `-1` conventionally means inactive
    pub value: i32,
    /// Free-text description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Optional payload delivered with the bucket
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
}

impl TestBucket {
    /// Create bucket
    #[inline]
    #[must_use]
    pub fn new(name: impl Into<String>, value: i32) -> Self {
        Self {
            name: name.into(),
            value,
            description: None,
            payload: None,
        }
    }

    /// With description
    #[inline]
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// With payload
    #[inline]
    #[must_use]
    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Equality used when deciding whether a change is safe to promote.
    ///
    /// Compares value, payload and description. Renaming a bucket does not
    /// change what clients receive.
    #[must_use]
    pub fn promotion_eq(&self, other: &Self) -> bool {
        self.value == other.value
            && self.payload == other.payload
            && self.description == other.description
    }
}

/// Probability mass assigned to one bucket
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Range {
    /// Bucket value this range points at
    pub bucket_value: i32,
    /// Length in `0.0..=1.0`
    pub length: f64,
}

impl Range {
    /// Create range
    #[inline]
    #[must_use]
    pub fn new(bucket_value: i32, length: f64) -> Self {
        Self {
            bucket_value,
            length,
        }
    }
}

/// Ordered set of ranges, optionally scoped by a rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Allocation {
    /// Rule scoping when this allocation applies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    /// Ranges in order
    #[serde(default)]
    pub ranges: Vec<Range>,
    /// Stable id such as `#A1`; empty for a newly added allocation
    #[serde(default)]
    pub id: String,
    /// Display name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
}

impl Allocation {
    /// Create allocation without id or rule
    #[inline]
    #[must_use]
    pub fn new(ranges: Vec<Range>) -> Self {
        Self {
            rule: None,
            ranges,
            id: String::new(),
            name: String::new(),
        }
    }

    /// With rule
    #[inline]
    #[must_use]
    pub fn with_rule(mut self, rule: impl Into<String>) -> Self {
        self.rule = Some(rule.into());
        self
    }

    /// With id
    #[inline]
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Sum of all range lengths
    #[must_use]
    pub fn total_length(&self) -> f64 {
        self.ranges.iter().map(|r| r.length).sum()
    }
}

/// Complete definition of one test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestDefinition {
    /// Version tag, the trunk revision this definition was promoted from
    #[serde(default)]
    pub version: String,
    /// Constants available to rules
    #[serde(default)]
    pub constants: BTreeMap<String, Value>,
    /// Special constants expanded into the rule at build time
    #[serde(default)]
    pub special_constants: BTreeMap<String, Value>,
    /// Randomization salt
    #[serde(default)]
    pub salt: String,
    /// Targeting rule for the whole test
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    /// Buckets in order
    #[serde(default)]
    pub buckets: Vec<TestBucket>,
    /// Allocations in order
    #[serde(default)]
    pub allocations: Vec<Allocation>,
    /// Suppress logging of assignments
    #[serde(default)]
    pub silent: bool,
    /// Free-form tags
    #[serde(default)]
    pub meta_tags: Vec<String>,
    /// Identifier kind; may be omitted by an edit and filled from the existing definition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_type: Option<TestType>,
    /// Free-text description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl TestDefinition {
    /// Create an empty definition
    #[must_use]
    pub fn new(test_type: TestType, salt: impl Into<String>) -> Self {
        Self {
            version: String::new(),
            constants: BTreeMap::new(),
            special_constants: BTreeMap::new(),
            salt: salt.into(),
            rule: None,
            buckets: Vec::new(),
            allocations: Vec::new(),
            silent: false,
            meta_tags: Vec::new(),
            test_type: Some(test_type),
            description: None,
        }
    }

    /// With bucket appended
    #[inline]
    #[must_use]
    pub fn with_bucket(mut self, bucket: TestBucket) -> Self {
        self.buckets.push(bucket);
        self
    }

    /// With allocation appended
    #[inline]
    #[must_use]
    pub fn with_allocation(mut self, allocation: Allocation) -> Self {
        self.allocations.push(allocation);
        self
    }

    /// With rule
    #[inline]
    #[must_use]
    pub fn with_rule(mut self, rule: impl Into<String>) -> Self {
        self.rule = Some(rule.into());
        self
    }

    /// With description
    #[inline]
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// With version tag
    #[inline]
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// With constant
    #[inline]
    #[must_use]
    pub fn with_constant(mut self, key: impl Into<String>, value: Value) -> Self {
        self.constants.insert(key.into(), value);
        self
    }

    /// Bucket with the given value
    #[must_use]
    pub fn bucket(&self, value: i32) -> Option<&TestBucket> {
        self.buckets.iter().find(|b| b.value == value)
    }

    /// Replace whitespace-only rules with `None`
    pub fn normalize_rules(&mut self) {
        fn blank_to_none(rule: &mut Option<String>) {
            if rule.as_deref().is_some_and(|r| r.trim().is_empty()) {
                *rule = None;
            }
        }
        blank_to_none(&mut self.rule);
        for allocation in &mut self.allocations {
            blank_to_none(&mut allocation.rule);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn definition_serializes_camel_case() {
        let definition = TestDefinition::new(TestType::USER, "salt")
            .with_bucket(TestBucket::new("control", 0))
            .with_allocation(Allocation::new(vec![Range::new(0, 1.0)]).with_id("#A1"));

        let value = serde_json::to_value(&definition).unwrap();
        assert_eq!(value["testType"], json!("USER"));
        assert_eq!(value["allocations"][0]["ranges"][0]["bucketValue"], json!(0));
        assert_eq!(value["specialConstants"], json!({}));
    }

    #[test]
    fn definition_parses_with_missing_fields() {
        let raw = r#"{"salt":"s","buckets":[{"name":"a","value":1}],"allocations":[]}"#;
        let definition: TestDefinition = serde_json::from_str(raw).unwrap();

        assert_eq!(definition.test_type, None);
        assert_eq!(definition.buckets[0].description, None);
        assert!(definition.version.is_empty());
    }

    #[test]
    fn unknown_test_type_is_preserved() {
        let parsed: TestType = serde_json::from_str("\"ACCOUNT\"").unwrap();
        assert_eq!(parsed.name(), "ACCOUNT");
        assert_ne!(parsed, TestType::USER);
        assert_eq!(TestType::new("PAGE"), TestType::PAGE);
    }

    #[test]
    fn promotion_eq_ignores_name() {
        let a = TestBucket::new("control", 0).with_description("baseline");
        let b = TestBucket::new("renamed", 0).with_description("baseline");
        let c = TestBucket::new("control", 0).with_payload(Payload::new(json!(3)));

        assert!(a.promotion_eq(&b));
        assert!(!a.promotion_eq(&c));
    }

    #[test]
    fn normalize_rules_clears_blank_rules() {
        let mut definition = TestDefinition::new(TestType::USER, "salt")
            .with_rule("   ")
            .with_allocation(Allocation::new(vec![]).with_rule("\t"))
            .with_allocation(Allocation::new(vec![]).with_rule("${lang == 'en'}"));

        definition.normalize_rules();

        assert_eq!(definition.rule, None);
        assert_eq!(definition.allocations[0].rule, None);
        assert_eq!(definition.allocations[1].rule.as_deref(), Some("${lang == 'en'}"));
    }
}
