//! Change analysis and definition validation
//!
//! - `is_allocation_only_change` gates automatic promotion of edits
//! - `is_all_inactive_test` gates automatic promotion of new tests
//! - `validate_definition` and `verify_internally_consistent` run before any commit

use crate::definition::{Range, TestBucket, TestDefinition, TestType};
use crate::error::{ModelError, ModelResult};
use crate::TOLERANCE;
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use std::collections::{BTreeMap, HashSet};

static VALID_TEST_NAME: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r"^([a-z_][a-z0-9_]+)?[a-z_]+$")
        .case_insensitive(true)
        .build()
        .expect("test name pattern is valid")
});

static VALID_BUCKET_NAME: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r"^[a-z_][a-z0-9_]*$")
        .case_insensitive(true)
        .build()
        .expect("bucket name pattern is valid")
});

const CONTROL_BUCKET_VALUE: i32 = 0;

/// Alphanumeric/underscore, not starting or ending with a digit
#[inline]
#[must_use]
pub fn is_valid_test_name(name: &str) -> bool {
    VALID_TEST_NAME.is_match(name)
}

/// Alphanumeric/underscore, not starting with a digit
#[inline]
#[must_use]
pub fn is_valid_bucket_name(name: &str) -> bool {
    VALID_BUCKET_NAME.is_match(name)
}

/// Total length per bucket value across `ranges`
#[must_use]
pub fn allocation_range_map(ranges: &[Range]) -> BTreeMap<i32, f64> {
    let mut totals = BTreeMap::new();
    for range in ranges {
        *totals.entry(range.bucket_value).or_insert(0.0) += range.length;
    }
    totals
}

/// Whether `updated` differs from `existing` only in range lengths.
///
/// Also false when a bucket (other than `-1`) that had no mass in an
/// allocation of `existing` receives mass in `updated`.
#[must_use]
pub fn is_allocation_only_change(existing: &TestDefinition, updated: &TestDefinition) -> bool {
    if existing.rule != updated.rule
        || existing.constants != updated.constants
        || existing.special_constants != updated.special_constants
        || existing.test_type != updated.test_type
        || existing.salt != updated.salt
        || existing.buckets.len() != updated.buckets.len()
        || existing.allocations.len() != updated.allocations.len()
    {
        return false;
    }

    let buckets_match = existing
        .buckets
        .iter()
        .zip(&updated.buckets)
        .all(|(before, after)| before.promotion_eq(after));
    if !buckets_match {
        return false;
    }

    existing
        .allocations
        .iter()
        .zip(&updated.allocations)
        .all(|(before, after)| {
            before.rule == after.rule && !is_new_bucket_added(&before.ranges, &after.ranges)
        })
}

/// Whether a bucket other than `-1` goes from ~0 to positive mass
#[must_use]
pub fn is_new_bucket_added(existing: &[Range], updated: &[Range]) -> bool {
    let before = allocation_range_map(existing);
    let after = allocation_range_map(updated);
    after
        .iter()
        .filter(|(&bucket, &length)| length > TOLERANCE && bucket != -1)
        .any(|(bucket, _)| before.get(bucket).copied().unwrap_or(0.0) < TOLERANCE)
}

/// Bucket is value `-1` named "inactive" or "disabled" (any case)
#[must_use]
pub fn is_inactive_bucket(bucket: &TestBucket) -> bool {
    bucket.value == -1
        && (bucket.name.eq_ignore_ascii_case("inactive")
            || bucket.name.eq_ignore_ascii_case("disabled"))
}

/// Every range with positive length points at an inactive bucket
#[must_use]
pub fn is_all_inactive_test(definition: &TestDefinition) -> bool {
    definition
        .allocations
        .iter()
        .flat_map(|a| a.ranges.iter())
        .filter(|range| range.length > 0.0)
        .all(|range| definition.bucket(range.bucket_value).is_some_and(is_inactive_bucket))
}

/// Required fields plus bucket rules.
///
/// Returns non-fatal warnings about the first allocation's bucket balance.
pub fn validate_definition(definition: &TestDefinition) -> ModelResult<Vec<String>> {
    fn blank(value: Option<&str>) -> bool {
        value.map_or(true, |v| v.trim().is_empty())
    }

    if blank(definition.description.as_deref()) {
        return Err(invalid("Description is required."));
    }
    if blank(Some(&definition.salt)) {
        return Err(invalid("Salt is required."));
    }
    let Some(test_type) = &definition.test_type else {
        return Err(invalid("TestType is required."));
    };
    if definition.buckets.is_empty() {
        return Err(invalid("Buckets cannot be empty."));
    }
    let Some(first) = definition.allocations.first() else {
        return Err(invalid("Allocations cannot be empty."));
    };

    let mut warnings = Vec::new();
    let totals = allocation_range_map(&first.ranges);
    let control = totals.get(&CONTROL_BUCKET_VALUE).copied();
    let active_buckets = totals.values().filter(|&&total| total > 0.0).count();

    if active_buckets > 1 {
        match control {
            Some(control_total) => {
                for (&bucket, &total) in &totals {
                    if bucket > 0 && total > 0.0 && (total - control_total).abs() >= TOLERANCE {
                        warnings.push(format!(
                            "WARNING: Positive bucket total allocation size not same as control bucket total allocation size. \nBucket #{bucket}={total}, Zero Bucket={control_total}"
                        ));
                    }
                }
            }
            None => warnings.push("WARNING: You should have a zero bucket (control).".to_string()),
        }
    }

    if *test_type == TestType::PAGE && definition.buckets.iter().any(|b| b.value < 0) {
        return Err(invalid("PAGE tests cannot contain negative buckets."));
    }

    if let Some(bucket) = definition.buckets.iter().find(|b| !is_valid_bucket_name(&b.name)) {
        return Err(invalid(format!(
            "Bucket name must be alpha-numeric underscore and not start with a number, found: '{}'",
            bucket.name
        )));
    }

    Ok(warnings)
}

/// Structural consistency of a definition on its own
pub fn verify_internally_consistent(test_name: &str, definition: &TestDefinition) -> ModelResult<()> {
    if definition.allocations.is_empty() {
        return Err(invalid(format!("No allocations specified in test {test_name}")));
    }
    let defined: HashSet<i32> = definition.buckets.iter().map(|b| b.value).collect();
    let last = definition.allocations.len() - 1;

    for (i, allocation) in definition.allocations.iter().enumerate() {
        if let Some(range) = allocation.ranges.iter().find(|r| !defined.contains(&r.bucket_value)) {
            return Err(invalid(format!(
                "Allocation range in {test_name} refers to unknown bucket value {}",
                range.bucket_value
            )));
        }
        let total = allocation.total_length();
        if !(0.9999..=1.0001).contains(&total) {
            let lengths: Vec<String> = allocation.ranges.iter().map(|r| r.length.to_string()).collect();
            return Err(invalid(format!(
                "{test_name} range with rule {} does not add up to 1 : {} = {total}",
                allocation.rule.as_deref().unwrap_or("null"),
                lengths.join(" + ")
            )));
        }
        let bare_rule = allocation
            .rule
            .as_deref()
            .map(|r| r.trim().trim_start_matches("${").trim_end_matches('}').trim())
            .unwrap_or_default();
        if i != last && bare_rule.is_empty() {
            return Err(invalid(format!(
                "Allocation[{i}] for test {test_name} has empty rule: {}",
                allocation.rule.as_deref().unwrap_or("null")
            )));
        }
    }
    Ok(())
}

fn invalid(message: impl Into<String>) -> ModelError {
    ModelError::InvalidDefinition(message.into())
}
