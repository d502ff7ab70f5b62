//! Allocation-id bookkeeping
//!
//! Ids look like `#A1`, `#BA3`: an upper-case base-26 index (`A` is 0) and a
//! version. The index identifies the allocation for the test's whole life;
//! the version is bumped whenever the population an allocation covers changes.
//!
//! - New tests: allocation `i` gets `#<base26(i)>1`
//! - Edited allocations whose segmentation or bucket ratios changed get the next version
//! - Allocations added by an edit get indices above the largest ever used

use crate::definition::{Allocation, Range, TestDefinition};
use crate::error::{ModelError, ModelResult};
use crate::TOLERANCE;
use once_cell::sync::Lazy;
use regex::Regex;
use std::cmp::Ordering;
use std::collections::BTreeMap;

static ALLOCATION_ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^#([A-Z]+)(\d+)$").expect("allocation id pattern is valid"));

/// Letter portion of an allocation id, `"#BA3"` -> `"BA"`
pub fn allocation_name(id: &str) -> ModelResult<&str> {
    ALLOCATION_ID_PATTERN
        .captures(id)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .ok_or_else(|| ModelError::InvalidAllocationId(id.to_string()))
}

/// Decode upper-case base-26 letters
pub fn base26_to_decimal(letters: &str) -> ModelResult<u32> {
    letters.chars().try_fold(0u32, |sum, c| {
        if c.is_ascii_uppercase() {
            Ok(sum * 26 + (c as u32 - 'A' as u32))
        } else {
            Err(ModelError::InvalidAllocationLetter(c))
        }
    })
}

/// Encode as upper-case base-26 letters, `0` -> `"A"`, `26` -> `"BA"`
#[must_use]
pub fn decimal_to_base26(n: u32) -> String {
    let mut letters = Vec::new();
    let mut number = n;
    while number >= 26 {
        letters.push(digit_to_letter(number % 26));
        number /= 26;
    }
    letters.push(digit_to_letter(number));
    letters.iter().rev().collect()
}

fn digit_to_letter(digit: u32) -> char {
    char::from(b'A' + u8::try_from(digit % 26).unwrap_or(0))
}

/// Full id for `index` at `version`, `(26, 2)` -> `"#BA2"`
#[must_use]
pub fn generate_allocation_id(index: u32, version: u32) -> String {
    format!("#{}{}", decimal_to_base26(index), version)
}

/// Next version of an id, `"#A1"` -> `"#A2"`
pub fn next_version(id: &str) -> ModelResult<String> {
    let captures = ALLOCATION_ID_PATTERN
        .captures(id)
        .ok_or_else(|| ModelError::InvalidAllocationId(id.to_string()))?;
    let version: u64 = captures[2]
        .parse()
        .map_err(|_| ModelError::InvalidAllocationId(id.to_string()))?;
    Ok(format!("#{}{}", &captures[1], version + 1))
}

/// Order ids by their decoded letter portion, ignoring version
pub fn compare_allocation_ids(a: &str, b: &str) -> ModelResult<Ordering> {
    let left = base26_to_decimal(allocation_name(a)?)?;
    let right = base26_to_decimal(allocation_name(b)?)?;
    Ok(left.cmp(&right))
}

/// Largest id ever used across `definitions`, typically the full history of a test
pub fn max_allocation_id<'a>(
    definitions: impl IntoIterator<Item = &'a TestDefinition>,
) -> ModelResult<Option<String>> {
    let mut max: Option<&str> = None;
    for id in definitions
        .into_iter()
        .flat_map(|d| d.allocations.iter())
        .map(|a| a.id.as_str())
        .filter(|id| !id.is_empty())
    {
        let replace = match max {
            Some(current) => compare_allocation_ids(id, current)? == Ordering::Greater,
            None => true,
        };
        if replace {
            max = Some(id);
        }
    }
    Ok(max.map(str::to_string))
}

/// Assign `#A1`, `#B1`, ... by position
pub fn assign_new_test_ids(definition: &mut TestDefinition) {
    for (index, allocation) in (0u32..).zip(definition.allocations.iter_mut()) {
        allocation.id = generate_allocation_id(index, 1);
    }
}

/// Whether any allocation still needs an id
#[must_use]
pub fn has_unassigned(definition: &TestDefinition) -> bool {
    definition.allocations.iter().any(|a| a.id.is_empty())
}

/// Bump the version of every outdated allocation in `current`
pub fn bump_outdated(previous: &TestDefinition, current: &mut TestDefinition) -> ModelResult<()> {
    for index in outdated_allocations(previous, current) {
        let allocation = &mut current.allocations[index];
        allocation.id = next_version(&allocation.id)?;
    }
    Ok(())
}

/// Give every allocation without an id a fresh index above `max_used`
pub fn assign_unassigned(current: &mut TestDefinition, max_used: Option<&str>) -> ModelResult<()> {
    let mut next = match max_used {
        Some(id) => base26_to_decimal(allocation_name(id)?)? + 1,
        None => 0,
    };
    for allocation in current.allocations.iter_mut().filter(|a| a.id.is_empty()) {
        allocation.id = generate_allocation_id(next, 1);
        next += 1;
    }
    Ok(())
}

/// Indices of allocations in `current` whose id must move to a new version
#[must_use]
pub fn outdated_allocations(previous: &TestDefinition, current: &TestDefinition) -> Vec<usize> {
    let mut outdated = Vec::new();
    if !current.allocations.iter().any(|a| !a.id.is_empty()) {
        return outdated;
    }

    let update_from = segmentation_change_start(previous, current);
    if let Some(start) = update_from {
        outdated.extend(
            (start..current.allocations.len()).filter(|&i| !current.allocations[i].id.is_empty()),
        );
    }

    let ratio_check_to = update_from
        .unwrap_or_else(|| previous.allocations.len().min(current.allocations.len()));
    for i in 0..ratio_check_to {
        if is_unbalanced_ratio_change(&previous.allocations[i], &current.allocations[i]) {
            outdated.push(i);
        }
    }

    outdated.sort_unstable();
    outdated.dedup();
    outdated
}

// Allocations can be added, removed or edited but never reordered.
fn segmentation_change_start(previous: &TestDefinition, current: &TestDefinition) -> Option<usize> {
    if previous.rule != current.rule || previous.salt != current.salt {
        return Some(0);
    }
    previous
        .allocations
        .iter()
        .zip(&current.allocations)
        .position(|(before, after)| before.id != after.id || before.rule != after.rule)
}

fn is_unbalanced_ratio_change(previous: &Allocation, current: &Allocation) -> bool {
    let before = bucket_ratios(&previous.ranges);
    let after = bucket_ratios(&current.ranges);
    if !before.keys().eq(after.keys()) {
        return true;
    }
    let Some((first_bucket, first_before)) = before.iter().next() else {
        return false;
    };
    let first_ratio = after[first_bucket] / first_before;
    before
        .iter()
        .any(|(bucket, length)| ((after[bucket] / length) - first_ratio).abs() > TOLERANCE)
}

fn bucket_ratios(ranges: &[Range]) -> BTreeMap<i32, f64> {
    let mut ratios = BTreeMap::new();
    for range in ranges {
        if range.bucket_value != -1 && range.length.abs() > TOLERANCE {
            *ratios.entry(range.bucket_value).or_insert(0.0) += range.length;
        }
    }
    ratios.retain(|_, total| *total > 0.0);
    ratios
}
