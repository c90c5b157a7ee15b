// Basic validation of draft filtering rules shared by the shipped adapters

use crate::models::{FilteringRule, FilteringValidation, FilteringValidationError};
use regex::Regex;
use std::collections::HashSet;

const POLICIES: [&str; 2] = ["include", "exclude"];
const RULES: [&str; 7] = [
    "equals",
    "contains",
    "starts_with",
    "ends_with",
    "regex",
    ">",
    "<",
];

/// Validate rule syntax: known policy and rule kinds, compilable regexes,
/// numeric comparison values and unique ids.
pub fn validate_basic_rules(rules: &[FilteringRule]) -> FilteringValidation {
    let mut errors = Vec::new();
    let mut seen_ids = HashSet::new();

    for rule in rules {
        let mut messages = Vec::new();

        if !seen_ids.insert(rule.id.as_str()) {
            messages.push(format!("Rule id '{}' is used more than once", rule.id));
        }
        if rule.field.trim().is_empty() {
            messages.push("Rule field must not be empty".to_string());
        }
        if !POLICIES.contains(&rule.policy.as_str()) {
            messages.push(format!("Unknown policy '{}'", rule.policy));
        }
        if !RULES.contains(&rule.rule.as_str()) {
            messages.push(format!("Unknown rule '{}'", rule.rule));
        }

        match rule.rule.as_str() {
            "regex" => {
                if let Err(e) = Regex::new(&rule.value) {
                    messages.push(format!("Invalid regular expression: {}", e));
                }
            }
            ">" | "<" => {
                if rule.value.trim().parse::<f64>().is_err() {
                    messages.push(format!("Value '{}' is not a number", rule.value));
                }
            }
            _ => {}
        }

        if !messages.is_empty() {
            errors.push(FilteringValidationError {
                ids: vec![rule.id.clone()],
                messages,
            });
        }
    }

    if errors.is_empty() {
        FilteringValidation::valid()
    } else {
        FilteringValidation::invalid(errors)
    }
}
