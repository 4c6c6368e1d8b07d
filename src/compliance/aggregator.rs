use std::collections::HashSet;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Serialize, Serializer};

use crate::state::models::{PolicyResultRow, PolicyStatus};

// ─── Tallies ────────────────────────────────────────────────────────────────

/// Outcome counts for a set of policy results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub passed: u64,
    pub violated: u64,
    pub suppressed: u64,
    pub failed: u64,
}

impl Summary {
    pub fn add(&mut self, status: PolicyStatus) {
        match status {
            PolicyStatus::Passed => self.passed += 1,
            PolicyStatus::Violated => self.violated += 1,
            PolicyStatus::Suppressed => self.suppressed += 1,
            PolicyStatus::Failed => self.failed += 1,
            PolicyStatus::Pending => {}
        }
    }

    pub fn total(&self) -> u64 {
        self.passed + self.violated + self.suppressed + self.failed
    }

    /// Pie sectors in the order passed, violated, suppressed, failed.
    pub fn sectors(&self) -> Vec<PieSector> {
        vec![
            PieSector::new(PolicyStatus::Passed.as_str(), self.passed),
            PieSector::new(PolicyStatus::Violated.as_str(), self.violated),
            PieSector::new(PolicyStatus::Suppressed.as_str(), self.suppressed),
            PieSector::new(PolicyStatus::Failed.as_str(), self.failed),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PieSector {
    pub name: String,
    pub value: u64,
}

impl PieSector {
    pub fn new(name: &str, value: u64) -> Self {
        Self {
            name: name.to_string(),
            value,
        }
    }
}

/// Results of one policy group with its tallies.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolicyResultGroup {
    pub id: String,
    pub name: String,
    pub summary: Summary,
    pub list: Vec<PolicyResultRow>,
}

/// Group results by policy group, groups in first-seen order.
pub fn group_by_group(rows: Vec<PolicyResultRow>) -> Vec<PolicyResultGroup> {
    let mut groups: Vec<PolicyResultGroup> = Vec::new();
    for row in rows {
        let idx = match groups
            .iter()
            .position(|g| g.id == row.result.policy_group_id)
        {
            Some(idx) => idx,
            None => {
                groups.push(PolicyResultGroup {
                    id: row.result.policy_group_id.clone(),
                    name: row.policy_group_name.clone(),
                    summary: Summary::default(),
                    list: Vec::new(),
                });
                groups.len() - 1
            }
        };
        let group = &mut groups[idx];
        group.summary.add(row.result.status);
        group.list.push(row);
    }
    groups
}

/// Mark results whose (policy, target) pair is muted as suppressed.
pub fn apply_suppression(rows: &mut [PolicyResultRow], muted: &HashSet<(String, String)>) {
    for row in rows.iter_mut() {
        let key = (row.result.policy_id.clone(), row.target_id().to_string());
        if muted.contains(&key) {
            row.result.status = PolicyStatus::Suppressed;
        }
    }
}

// ─── Time Series ────────────────────────────────────────────────────────────

/// A ratio serialized with three decimals, e.g. `0.951`.
#[derive(Debug, Clone, Copy, Default, PartialEq, PartialOrd)]
pub struct Percent(pub f64);

impl Serialize for Percent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64((self.0 * 1000.0).round() / 1000.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Polyline {
    pub column: Vec<String>,
    pub value: Vec<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PolylinePercent {
    pub column: Vec<String>,
    pub value: Vec<Percent>,
}

/// Daily result counts and pass rates over an inclusive date range.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DailySeries {
    pub dates: Vec<NaiveDate>,
    pub totals: Vec<u64>,
    pub passed: Vec<u64>,
    pub skipped: usize,
}

impl DailySeries {
    /// One zeroed bucket per day from `from` to `to`, both included.
    pub fn new(from: NaiveDate, to: NaiveDate) -> Self {
        let mut dates = Vec::new();
        let mut day = from;
        while day <= to {
            dates.push(day);
            day += Duration::days(1);
        }
        let n = dates.len();
        Self {
            dates,
            totals: vec![0; n],
            passed: vec![0; n],
            skipped: 0,
        }
    }

    /// Fold one result into its day. Pending results are not counted.
    pub fn add(&mut self, at: DateTime<Utc>, status: PolicyStatus) {
        let day = at.date_naive();
        let Some(idx) = self.dates.iter().position(|d| *d == day) else {
            tracing::warn!(date = %day, "Result date outside report range, skipped");
            self.skipped += 1;
            return;
        };
        if status != PolicyStatus::Pending {
            self.totals[idx] += 1;
        }
        if status == PolicyStatus::Passed {
            self.passed[idx] += 1;
        }
    }

    /// Passed over the final bucket total, 0 for an empty bucket.
    pub fn pass_rates(&self) -> Vec<Percent> {
        self.totals
            .iter()
            .zip(&self.passed)
            .map(|(&total, &passed)| {
                if total == 0 {
                    Percent(0.0)
                } else {
                    Percent(passed as f64 / total as f64)
                }
            })
            .collect()
    }

    pub fn columns(&self) -> Vec<String> {
        self.dates
            .iter()
            .map(|d| d.format("%m-%d").to_string())
            .collect()
    }

    pub fn count_line(&self) -> Polyline {
        Polyline {
            column: self.columns(),
            value: self.totals.clone(),
        }
    }

    pub fn rate_line(&self) -> PolylinePercent {
        PolylinePercent {
            column: self.columns(),
            value: self.pass_rates(),
        }
    }
}

/// Relative change from `last` to `total`; 1.0 when there is no previous value.
pub fn relative_change(total: usize, last: usize) -> f64 {
    if last == 0 {
        1.0
    } else {
        (total as f64 - last as f64) / last as f64
    }
}

/// Entries sorted by count descending then name, at most `limit` of them.
pub fn top_n(counts: impl IntoIterator<Item = (String, u64)>, limit: usize) -> Vec<PieSector> {
    let mut entries: Vec<(String, u64)> = counts.into_iter().collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    entries
        .into_iter()
        .take(limit)
        .map(|(name, value)| PieSector { name, value })
        .collect()
}
