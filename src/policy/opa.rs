use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;

use super::evaluator::{RuleEvaluator, Violation};

/// Rule keys whose values are collected as findings.
const FINDING_KEYS: &[&str] = &["violations", "deny"];

/// Evaluates Rego rules with the `opa` command line tool.
///
/// A rule reports findings by defining `violations` (or `deny`) in any
/// package; each entry is either a string or an object with `msg`/`message`
/// and an optional `resource`.
pub struct OpaEvaluator {
    binary: String,
    timeout: Duration,
}

impl OpaEvaluator {
    pub fn new(binary: &str, timeout: Duration) -> Self {
        Self {
            binary: binary.to_string(),
            timeout,
        }
    }

    async fn run(&self, dir: &Path) -> Result<(i32, String, String)> {
        let mut cmd = Command::new(&self.binary);
        cmd.args([
            "eval",
            "--format",
            "json",
            "--data",
            "policy.rego",
            "--input",
            "input.json",
            "data",
        ])
        .current_dir(dir)
        .kill_on_drop(true);

        tracing::debug!(binary = %self.binary, dir = %dir.display(), "Running opa eval");
        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .with_context(|| format!("opa eval timed out after {:?}", self.timeout))?
            .with_context(|| format!("Failed to spawn {}", self.binary))?;

        Ok((
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stdout).into_owned(),
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ))
    }
}

#[async_trait]
impl RuleEvaluator for OpaEvaluator {
    async fn evaluate(&self, rule: &str, input: &Value) -> Result<Vec<Violation>> {
        let dir = tempfile::tempdir().context("Failed to create evaluation directory")?;
        tokio::fs::write(dir.path().join("policy.rego"), rule).await?;
        tokio::fs::write(dir.path().join("input.json"), serde_json::to_vec(input)?).await?;

        let (code, stdout, stderr) = self.run(dir.path()).await?;
        if code != 0 {
            bail!("{}", error_message(&stdout, &stderr, code));
        }
        violations_from_eval_output(&stdout)
    }
}

fn error_message(stdout: &str, stderr: &str, code: i32) -> String {
    let reported: Vec<String> = serde_json::from_str::<Value>(stdout)
        .ok()
        .and_then(|v| v.get("errors").and_then(Value::as_array).cloned())
        .unwrap_or_default()
        .iter()
        .filter_map(|e| e.get("message").and_then(Value::as_str).map(str::to_string))
        .collect();
    if !reported.is_empty() {
        return reported.join("; ");
    }
    let stderr = stderr.trim();
    if !stderr.is_empty() {
        return stderr.to_string();
    }
    format!("opa exited with code {}", code)
}

/// Collect findings from `opa eval --format json` output.
///
/// An undefined result (no `result` entries) has no findings.
pub fn violations_from_eval_output(stdout: &str) -> Result<Vec<Violation>> {
    let doc: Value = serde_json::from_str(stdout).context("Invalid opa eval output")?;
    let mut violations = Vec::new();
    let results = doc
        .get("result")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for result in &results {
        let expressions = result
            .get("expressions")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for expr in &expressions {
            if let Some(value) = expr.get("value") {
                collect_findings(value, &mut violations);
            }
        }
    }
    Ok(violations)
}

fn collect_findings(value: &Value, out: &mut Vec<Violation>) {
    let Value::Object(map) = value else {
        return;
    };
    for (key, child) in map {
        match (FINDING_KEYS.contains(&key.as_str()), child) {
            (true, Value::Array(items)) => out.extend(items.iter().map(finding)),
            (_, Value::Object(_)) => collect_findings(child, out),
            _ => {}
        }
    }
}

fn finding(item: &Value) -> Violation {
    match item {
        Value::String(s) => Violation::new(s.clone()),
        Value::Object(map) => {
            let message = map
                .get("msg")
                .or_else(|| map.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("rule violated")
                .to_string();
            Violation {
                message,
                resource: map
                    .get("resource")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                details: item.clone(),
            }
        }
        other => Violation::new(other.to_string()),
    }
}
