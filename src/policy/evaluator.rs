use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::state::models::PolicyStatus;

/// A single finding reported by a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub details: Value,
}

impl Violation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            resource: None,
            details: Value::Null,
        }
    }
}

/// Evaluates one rule's source against a parsed infrastructure document.
#[async_trait]
pub trait RuleEvaluator: Send + Sync {
    /// Findings of `rule` over `input`. An error means the rule could not be run.
    async fn evaluate(&self, rule: &str, input: &Value) -> Result<Vec<Violation>>;
}

/// Per-rule outcome ready to be persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleOutcome {
    pub status: PolicyStatus,
    pub message: String,
}

/// Error ⇒ failed, no findings ⇒ passed, anything else ⇒ violated.
pub fn classify(result: Result<Vec<Violation>>) -> RuleOutcome {
    match result {
        Err(e) => RuleOutcome {
            status: PolicyStatus::Failed,
            message: format!("{:#}", e),
        },
        Ok(violations) if violations.is_empty() => RuleOutcome {
            status: PolicyStatus::Passed,
            message: String::new(),
        },
        Ok(violations) => RuleOutcome {
            status: PolicyStatus::Violated,
            message: serde_json::to_string(&violations).unwrap_or_else(|_| {
                violations
                    .iter()
                    .map(|v| v.message.as_str())
                    .collect::<Vec<_>>()
                    .join("; ")
            }),
        },
    }
}

/// Result of trying a rule against a hand-written input document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleTest {
    /// Absent when the input could not be decoded.
    pub status: Option<PolicyStatus>,
    pub data: Vec<Violation>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// Evaluate `rule` against the JSON text `input` without touching any scan.
///
/// Bad input and rule errors are reported in the result, never returned as errors.
pub async fn try_rule(evaluator: &dyn RuleEvaluator, rule: &str, input: &str) -> RuleTest {
    let value: Value = match serde_json::from_str(input) {
        Ok(value) => value,
        Err(e) => {
            return RuleTest {
                status: None,
                data: Vec::new(),
                error: format!("invalid input: {}", e),
            }
        }
    };

    match evaluator.evaluate(rule, &value).await {
        Ok(violations) => RuleTest {
            status: Some(if violations.is_empty() {
                PolicyStatus::Passed
            } else {
                PolicyStatus::Violated
            }),
            data: violations,
            error: String::new(),
        },
        Err(e) => RuleTest {
            status: Some(PolicyStatus::Failed),
            data: Vec::new(),
            error: format!("{:#}", e),
        },
    }
}

/// Scan-level status from raw rule outcomes: any failure wins, then any violation.
pub fn scan_status<'a>(statuses: impl IntoIterator<Item = &'a PolicyStatus>) -> PolicyStatus {
    let mut status = PolicyStatus::Passed;
    for s in statuses {
        match s {
            PolicyStatus::Failed => return PolicyStatus::Failed,
            PolicyStatus::Violated => status = PolicyStatus::Violated,
            _ => {}
        }
    }
    status
}
