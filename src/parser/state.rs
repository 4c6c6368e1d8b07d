use std::collections::{BTreeMap, HashMap};

use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{CoreError, CoreResult};
use crate::state::models::{TaskOutput, TaskResource};

/// Replacement text for values that must not be persisted.
pub const SENSITIVE_PLACEHOLDER: &str = "(sensitive value)";

/// provider name -> resource type -> sensitive attribute names.
pub type SensitiveAttrMap = HashMap<String, HashMap<String, Vec<String>>>;

// ─── State document (`terraform show -json`) ────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct StateDocument {
    #[serde(default)]
    pub format_version: Option<String>,
    #[serde(default)]
    pub values: Option<StateValues>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StateValues {
    #[serde(default)]
    pub outputs: BTreeMap<String, StateOutput>,
    #[serde(default)]
    pub root_module: StateModule,
}

#[derive(Debug, Default, Deserialize)]
pub struct StateModule {
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub resources: Vec<StateResource>,
    #[serde(default)]
    pub child_modules: Vec<StateModule>,
}

#[derive(Debug, Deserialize)]
pub struct StateResource {
    pub address: String,
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    pub name: String,
    #[serde(default)]
    pub index: Option<Value>,
    #[serde(default)]
    pub provider_name: String,
    #[serde(default)]
    pub values: Value,
    #[serde(default)]
    pub sensitive_values: Value,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

fn default_mode() -> String {
    "managed".to_string()
}

#[derive(Debug, Deserialize)]
pub struct StateOutput {
    pub value: Value,
    #[serde(default)]
    pub sensitive: bool,
}

/// Decode a state artifact. Empty input means there is nothing to ingest.
pub fn parse_state(bytes: &[u8]) -> CoreResult<Option<StateDocument>> {
    if bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(None);
    }
    let doc: StateDocument =
        serde_json::from_slice(bytes).map_err(|e| CoreError::MalformedArtifact {
            artifact: "state",
            reason: e.to_string(),
        })?;
    Ok(Some(doc))
}

/// Decode a provider schema artifact. Empty input yields an empty map.
pub fn parse_sensitive_attrs(bytes: &[u8]) -> CoreResult<SensitiveAttrMap> {
    if bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(SensitiveAttrMap::new());
    }
    serde_json::from_slice(bytes).map_err(|e| CoreError::MalformedArtifact {
        artifact: "provider schema",
        reason: e.to_string(),
    })
}

/// Stable id for a resource row, so re-ingestion rewrites identical rows.
pub fn resource_id(task_id: &str, address: &str) -> String {
    let digest = Sha256::digest(format!("{}\n{}", task_id, address).as_bytes());
    hex::encode(digest)[..32].to_string()
}

/// Flatten every module's resources into rows for `task_id`.
pub fn resources_of(
    task_id: &str,
    doc: &StateDocument,
    sensitive: &SensitiveAttrMap,
) -> Vec<TaskResource> {
    let mut out = Vec::new();
    if let Some(values) = &doc.values {
        collect_module(task_id, &values.root_module, sensitive, &mut out);
    }
    out
}

fn collect_module(
    task_id: &str,
    module: &StateModule,
    sensitive: &SensitiveAttrMap,
    out: &mut Vec<TaskResource>,
) {
    for res in &module.resources {
        let mut attrs = res.values.clone();
        mask_attributes(&mut attrs, &res.sensitive_values);
        if let Some(names) = sensitive
            .get(&res.provider_name)
            .and_then(|types| types.get(&res.resource_type))
        {
            if let Value::Object(map) = &mut attrs {
                for name in names {
                    if let Some(v) = map.get_mut(name) {
                        *v = Value::String(SENSITIVE_PLACEHOLDER.to_string());
                    }
                }
            }
        }

        out.push(TaskResource {
            id: resource_id(task_id, &res.address),
            task_id: task_id.to_string(),
            address: res.address.clone(),
            module_path: module.address.clone(),
            resource_mode: res.mode.clone(),
            resource_type: res.resource_type.clone(),
            resource_name: res.name.clone(),
            provider: res.provider_name.clone(),
            index_key: res.index.as_ref().map(index_text),
            attributes_json: serde_json::to_string(&attrs).unwrap_or_else(|_| "{}".to_string()),
            dependencies: res.depends_on.clone(),
        });
    }
    for child in &module.child_modules {
        collect_module(task_id, child, sensitive, out);
    }
}

/// Replace every value flagged `true` in the state's own sensitivity tree.
fn mask_attributes(values: &mut Value, flags: &Value) {
    match (values, flags) {
        (v, Value::Bool(true)) => *v = Value::String(SENSITIVE_PLACEHOLDER.to_string()),
        (Value::Object(map), Value::Object(flag_map)) => {
            for (key, flag) in flag_map {
                if let Some(v) = map.get_mut(key) {
                    mask_attributes(v, flag);
                }
            }
        }
        (Value::Array(items), Value::Array(flag_items)) => {
            for (v, flag) in items.iter_mut().zip(flag_items) {
                mask_attributes(v, flag);
            }
        }
        _ => {}
    }
}

fn index_text(index: &Value) -> String {
    match index {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn outputs_of(task_id: &str, doc: &StateDocument) -> Vec<TaskOutput> {
    let Some(values) = &doc.values else {
        return Vec::new();
    };
    values
        .outputs
        .iter()
        .map(|(name, output)| {
            let value = if output.sensitive {
                Value::String(SENSITIVE_PLACEHOLDER.to_string())
            } else {
                output.value.clone()
            };
            TaskOutput {
                task_id: task_id.to_string(),
                name: name.clone(),
                value_json: value.to_string(),
                sensitive: output.sensitive,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whitespace_is_absent() {
        assert!(parse_state(b"  \n").unwrap().is_none());
        assert!(parse_sensitive_attrs(b"").unwrap().is_empty());
    }

    #[test]
    fn test_garbage_is_malformed() {
        let err = parse_state(b"{not json").unwrap_err();
        assert_eq!(err.kind(), "malformed_artifact");
    }

    #[test]
    fn test_nested_sensitive_values_are_masked() {
        let mut values = serde_json::json!({"a": 1, "b": {"c": "secret", "d": "ok"}, "e": ["x", "y"]});
        let flags = serde_json::json!({"b": {"c": true}, "e": [false, true]});
        mask_attributes(&mut values, &flags);
        assert_eq!(values["a"], 1);
        assert_eq!(values["b"]["c"], SENSITIVE_PLACEHOLDER);
        assert_eq!(values["b"]["d"], "ok");
        assert_eq!(values["e"][0], "x");
        assert_eq!(values["e"][1], SENSITIVE_PLACEHOLDER);
    }

    #[test]
    fn test_resource_id_is_stable() {
        assert_eq!(resource_id("t1", "a.b"), resource_id("t1", "a.b"));
        assert_ne!(resource_id("t1", "a.b"), resource_id("t2", "a.b"));
        assert_eq!(resource_id("t1", "a.b").len(), 32);
    }
}
