use std::collections::{BTreeMap, BTreeSet};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// One attribute's value before and after the out-of-band change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttrDrift {
    pub before: Option<String>,
    pub after: Option<String>,
}

/// Attribute path -> change, for a single resource.
pub type ResourceDriftInfo = BTreeMap<String, AttrDrift>;

/// Resource address -> drifted attributes.
pub type DriftMap = BTreeMap<String, ResourceDriftInfo>;

/// Rows to delete and addresses to upsert for one detection pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriftReconciliation {
    pub remove: Vec<String>,
    pub upsert: Vec<String>,
}

struct Patterns {
    ansi: Regex,
    header: Regex,
    resource_open: Regex,
    block_open: Regex,
    block_close: Regex,
    attr: Regex,
}

impl Patterns {
    fn new() -> Self {
        Self {
            ansi: Regex::new(r"\x1b\[[0-9;]*m").expect("valid regex"),
            header: Regex::new(r"^\s*# (\S+) has (?:changed|been deleted)\s*$")
                .expect("valid regex"),
            resource_open: Regex::new(
                r#"^\s*(?:[~+-]\s+)?(?:resource|data)\s+"[^"]+"\s+"[^"]+"\s*\{\s*$"#,
            )
            .expect("valid regex"),
            block_open: Regex::new(r#"^\s*(?:[~+-]\s+)?("[^"]*"|[\w\-.]+)\s*(?:=\s*)?[\{\[]\s*$"#)
                .expect("valid regex"),
            block_close: Regex::new(r"^\s*[\}\]],?\s*$").expect("valid regex"),
            attr: Regex::new(r#"^\s*([~+-])\s+("[^"]*"|[\w\-.]+)\s*=\s*(.*?)\s*$"#)
                .expect("valid regex"),
        }
    }
}

static PATTERNS: Lazy<Patterns> = Lazy::new(Patterns::new);

struct Cursor {
    address: String,
    in_body: bool,
    path: Vec<String>,
}

/// Extract per-resource attribute drift from the text output of a plan step.
///
/// Only the "Objects have changed outside of Terraform" section contributes:
/// each `# <address> has changed` marker opens a resource body whose
/// `~`, `+` and `-` lines become attribute changes. Nested blocks are
/// flattened into dotted paths.
pub fn parse_drift_log(log: &[u8]) -> DriftMap {
    let patterns = &*PATTERNS;
    let text = String::from_utf8_lossy(log);
    let mut drift = DriftMap::new();
    let mut cursor: Option<Cursor> = None;

    for raw in text.lines() {
        let line = patterns.ansi.replace_all(raw, "");

        if let Some(caps) = patterns.header.captures(&line) {
            let address = caps[1].to_string();
            drift.entry(address.clone()).or_default();
            cursor = Some(Cursor {
                address,
                in_body: false,
                path: Vec::new(),
            });
            continue;
        }

        let Some(cur) = cursor.as_mut() else {
            continue;
        };

        // Unindented text ends the section.
        if !line.is_empty() && !line.starts_with(char::is_whitespace) {
            cursor = None;
            continue;
        }

        if !cur.in_body {
            if patterns.resource_open.is_match(&line) {
                cur.in_body = true;
            }
            continue;
        }

        if patterns.block_close.is_match(&line) {
            if cur.path.pop().is_none() {
                cursor = None;
            }
            continue;
        }

        if let Some(caps) = patterns.block_open.captures(&line) {
            cur.path.push(unquote(&caps[1]));
            continue;
        }

        if let Some(caps) = patterns.attr.captures(&line) {
            let key = unquote(&caps[2]);
            let value = caps[3].to_string();
            let change = match &caps[1] {
                "~" => match value.split_once(" -> ") {
                    Some((before, after)) => AttrDrift {
                        before: Some(before.to_string()),
                        after: Some(after.to_string()),
                    },
                    None => AttrDrift {
                        before: Some(value.clone()),
                        after: None,
                    },
                },
                "+" => AttrDrift {
                    before: None,
                    after: Some(value),
                },
                _ => AttrDrift {
                    before: Some(
                        value
                            .strip_suffix(" -> null")
                            .unwrap_or(&value)
                            .to_string(),
                    ),
                    after: None,
                },
            };
            let mut full = cur.path.clone();
            full.push(key);
            drift
                .entry(cur.address.clone())
                .or_default()
                .insert(full.join("."), change);
        }
    }

    drift
}

fn unquote(s: &str) -> String {
    s.trim_matches('"').to_string()
}

/// Which stored rows go away and which addresses get written.
///
/// An empty detection removes every previously stored row.
pub fn reconcile(previous: &BTreeSet<String>, current: &DriftMap) -> DriftReconciliation {
    DriftReconciliation {
        remove: previous
            .iter()
            .filter(|addr| !current.contains_key(*addr))
            .cloned()
            .collect(),
        upsert: current.keys().cloned().collect(),
    }
}
