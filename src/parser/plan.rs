use serde::Deserialize;
use serde_json::Value;

use crate::error::{CoreError, CoreResult};
use crate::state::models::{action, TaskChange};

/// Plan document (`terraform show -json <planfile>`), reduced to what is recorded.
#[derive(Debug, Default, Deserialize)]
pub struct PlanDocument {
    #[serde(default)]
    pub format_version: Option<String>,
    #[serde(default)]
    pub resource_changes: Vec<ResourceChange>,
}

#[derive(Debug, Deserialize)]
pub struct ResourceChange {
    pub address: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    pub change: ChangeBody,
}

#[derive(Debug, Deserialize)]
pub struct ChangeBody {
    #[serde(default)]
    pub actions: Vec<String>,
    #[serde(default)]
    pub before: Value,
    #[serde(default)]
    pub after: Value,
}

/// Decode a plan artifact. Empty input means there is nothing to ingest.
pub fn parse_plan(bytes: &[u8]) -> CoreResult<Option<PlanDocument>> {
    if bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(None);
    }
    let doc: PlanDocument =
        serde_json::from_slice(bytes).map_err(|e| CoreError::MalformedArtifact {
            artifact: "plan",
            reason: e.to_string(),
        })?;
    Ok(Some(doc))
}

/// Collapse a plan's action list into a single action name.
pub fn action_of(actions: &[String]) -> &'static str {
    let has = |a: &str| actions.iter().any(|x| x == a);
    if has(action::CREATE) && has(action::DELETE) {
        action::REPLACE
    } else if has(action::CREATE) {
        action::CREATE
    } else if has(action::DELETE) {
        action::DELETE
    } else if has(action::UPDATE) {
        action::UPDATE
    } else if has(action::READ) {
        action::READ
    } else {
        action::NOOP
    }
}

/// Rows for every change that does something. No-op entries are dropped.
pub fn changes_of(task_id: &str, doc: &PlanDocument) -> Vec<TaskChange> {
    doc.resource_changes
        .iter()
        .filter_map(|rc| {
            let action = action_of(&rc.change.actions);
            if action == action::NOOP {
                return None;
            }
            Some(TaskChange {
                task_id: task_id.to_string(),
                address: rc.address.clone(),
                resource_type: rc.resource_type.clone(),
                action: action.to_string(),
                before_json: json_or_none(&rc.change.before),
                after_json: json_or_none(&rc.change.after),
            })
        })
        .collect()
}

fn json_or_none(value: &Value) -> Option<String> {
    if value.is_null() {
        None
    } else {
        Some(value.to_string())
    }
}
