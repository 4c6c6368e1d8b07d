use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use serde::Serialize;

use super::aggregator::{
    apply_suppression, group_by_group, relative_change, top_n, DailySeries, Percent, PieSector,
    PolicyResultGroup, Polyline, PolylinePercent, Summary,
};
use crate::error::{CoreError, CoreResult};
use crate::state::models::{severity, PolicyResultRow, PolicyStatus, ScanTask, Target};
use crate::state::StateBackend;

pub const DEFAULT_REPORT_DAYS: i64 = 5;
pub const DEFAULT_SHOW_COUNT: usize = 5;
const SUMMARY_WINDOW_DAYS: i64 = 15;
const SUMMARY_TOP: usize = 5;

/// Midnight UTC at the start of a window of `days` calendar days ending on `to`'s day.
pub fn last_days_midnight(days: i64, to: DateTime<Utc>) -> DateTime<Utc> {
    let day = to.date_naive() - Duration::days(days.max(1) - 1);
    Utc.from_utc_datetime(&day.and_time(NaiveTime::MIN))
}

// ─── Scan Result View ───────────────────────────────────────────────────────

/// Compliance status of a target as shown to users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MergedStatus {
    Disabled,
    None,
    Pending,
    Passed,
    Violated,
    Failed,
}

impl MergedStatus {
    pub fn merge(enabled: bool, scan: Option<&ScanTask>) -> Self {
        if !enabled {
            return MergedStatus::Disabled;
        }
        match scan.map(|s| s.policy_status) {
            None => MergedStatus::None,
            Some(PolicyStatus::Pending) => MergedStatus::Pending,
            Some(PolicyStatus::Violated) => MergedStatus::Violated,
            Some(PolicyStatus::Failed) => MergedStatus::Failed,
            Some(PolicyStatus::Passed | PolicyStatus::Suppressed) => MergedStatus::Passed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MergedStatus::Disabled => "disabled",
            MergedStatus::None => "none",
            MergedStatus::Pending => "pending",
            MergedStatus::Passed => "passed",
            MergedStatus::Violated => "violated",
            MergedStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanResultView {
    pub policy_status: MergedStatus,
    pub task: Option<ScanTask>,
    pub total: usize,
    pub groups: Vec<PolicyResultGroup>,
}

/// The latest scan of a target with suppression applied and results grouped.
pub async fn scan_result(state: &dyn StateBackend, target: &Target) -> CoreResult<ScanResultView> {
    let (enabled, last_scan) = match target {
        Target::Environment(id) => {
            let env = state
                .get_environment(id)
                .await?
                .ok_or_else(|| CoreError::not_found("environment", id))?;
            (env.compliance_enabled, env.last_scan_task_id)
        }
        Target::Template(id) => {
            let tpl = state
                .get_template(id)
                .await?
                .ok_or_else(|| CoreError::not_found("template", id))?;
            (tpl.compliance_enabled, tpl.last_scan_task_id)
        }
    };

    let scan = match last_scan.as_deref() {
        Some(scan_id) => state.get_scan_task(scan_id).await?,
        None => None,
    };
    let policy_status = MergedStatus::merge(enabled, scan.as_ref());

    let Some(scan) = scan else {
        return Ok(ScanResultView {
            policy_status,
            task: None,
            total: 0,
            groups: Vec::new(),
        });
    };
    if scan.policy_status == PolicyStatus::Pending {
        return Ok(ScanResultView {
            policy_status,
            task: Some(scan),
            total: 0,
            groups: Vec::new(),
        });
    }

    let mut rows = state.list_policy_results(scan.id()).await?;
    let target_id = match target {
        Target::Environment(id) | Target::Template(id) => id.clone(),
    };
    let muted: HashSet<(String, String)> = state
        .suppressed_policy_ids(&target_id)
        .await?
        .into_iter()
        .map(|policy_id| (policy_id, target_id.clone()))
        .collect();
    apply_suppression(&mut rows, &muted);

    Ok(ScanResultView {
        policy_status,
        task: Some(scan),
        total: rows.len(),
        groups: group_by_group(rows),
    })
}

// ─── Scan Report ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    /// Status pie: passed, violated, suppressed, failed.
    pub total: Vec<PieSector>,
    /// Scans per target, busiest first.
    pub scan_count: Polyline,
    pub policy_scan_count: Polyline,
    pub policy_passed_rate: PolylinePercent,
}

/// Results created in `[from, to)` folded into daily buckets.
pub async fn scan_report(
    state: &dyn StateBackend,
    policy_id: Option<&str>,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    show_count: usize,
) -> CoreResult<ScanReport> {
    if from >= to {
        return Err(CoreError::InvalidRequest(format!(
            "report range is empty: {} to {}",
            from, to
        )));
    }
    let rows = load_results(state, from, to, policy_id).await?;

    let mut total = Summary::default();
    // `to` is exclusive, so a midnight end does not open another day.
    let last_day = (to - Duration::microseconds(1)).date_naive();
    let mut series = DailySeries::new(from.date_naive(), last_day);
    let mut scans: HashMap<String, (String, HashSet<String>)> = HashMap::new();
    for row in &rows {
        total.add(row.result.status);
        series.add(row.result.created_at, row.result.status);
        scans
            .entry(row.target_id().to_string())
            .or_insert_with(|| (row.target_name.clone(), HashSet::new()))
            .1
            .insert(row.result.scan_task_id.clone());
    }

    let busiest = top_n(
        scans
            .into_values()
            .map(|(name, ids)| (name, ids.len() as u64)),
        show_count,
    );
    let scan_count = Polyline {
        column: busiest.iter().map(|s| s.name.clone()).collect(),
        value: busiest.iter().map(|s| s.value).collect(),
    };

    tracing::debug!(
        results = rows.len(),
        skipped = series.skipped,
        "Built scan report"
    );
    Ok(ScanReport {
        from,
        to,
        total: total.sectors(),
        scan_count,
        policy_scan_count: series.count_line(),
        policy_passed_rate: series.rate_line(),
    })
}

// ─── Policy Summary ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct PolicyTrend {
    pub total: usize,
    pub last: usize,
    pub changes: Percent,
    pub summary: Vec<PieSector>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PolicySummary {
    pub active_policy: PolicyTrend,
    pub unresolved_policy: PolicyTrend,
    pub policy_violated: Vec<PieSector>,
    pub policy_group_violated: Vec<PieSector>,
}

/// Activity over the last fifteen days compared with the fifteen before.
pub async fn policy_summary(state: &dyn StateBackend, now: DateTime<Utc>) -> CoreResult<PolicySummary> {
    let end = last_days_midnight(1, now) + Duration::days(1);
    let from = last_days_midnight(SUMMARY_WINDOW_DAYS, now);
    let prev_from = from - Duration::days(SUMMARY_WINDOW_DAYS);

    let current = load_results(state, from, end, None).await?;
    let previous = load_results(state, prev_from, from, None).await?;

    let mut status = Summary::default();
    for row in &current {
        status.add(row.result.status);
    }
    let active_now = distinct_policies(&current);
    let active_before = distinct_policies(&previous);
    let active_policy = PolicyTrend {
        total: active_now,
        last: active_before,
        changes: Percent(relative_change(active_now, active_before)),
        summary: vec![
            PieSector::new(PolicyStatus::Passed.as_str(), status.passed),
            PieSector::new(PolicyStatus::Violated.as_str(), status.violated),
            PieSector::new(PolicyStatus::Failed.as_str(), status.failed),
            PieSector::new(PolicyStatus::Suppressed.as_str(), status.suppressed),
        ],
    };

    let unresolved_now = unresolved_policies(&current);
    let unresolved_before = unresolved_policies(&previous);
    let count_severity =
        |level: &str| unresolved_now.values().filter(|s| s.as_str() == level).count() as u64;
    let unresolved_policy = PolicyTrend {
        total: unresolved_now.len(),
        last: unresolved_before.len(),
        changes: Percent(relative_change(unresolved_now.len(), unresolved_before.len())),
        summary: vec![
            PieSector::new(severity::HIGH, count_severity(severity::HIGH)),
            PieSector::new(severity::MEDIUM, count_severity(severity::MEDIUM)),
            PieSector::new(severity::LOW, count_severity(severity::LOW)),
        ],
    };

    let mut by_policy: HashMap<String, u64> = HashMap::new();
    let mut by_group: HashMap<String, u64> = HashMap::new();
    for row in current
        .iter()
        .filter(|r| r.result.status == PolicyStatus::Violated)
    {
        *by_policy.entry(row.policy_name.clone()).or_default() += 1;
        *by_group.entry(row.policy_group_name.clone()).or_default() += 1;
    }

    Ok(PolicySummary {
        active_policy,
        unresolved_policy,
        policy_violated: top_n(by_policy, SUMMARY_TOP),
        policy_group_violated: top_n(by_group, SUMMARY_TOP),
    })
}

async fn load_results(
    state: &dyn StateBackend,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    policy_id: Option<&str>,
) -> CoreResult<Vec<PolicyResultRow>> {
    let mut rows = state.policy_results_between(from, to, policy_id).await?;
    let muted = state.all_suppressions().await?;
    apply_suppression(&mut rows, &muted);
    Ok(rows)
}

fn distinct_policies(rows: &[PolicyResultRow]) -> usize {
    rows.iter()
        .map(|r| r.result.policy_id.as_str())
        .collect::<HashSet<_>>()
        .len()
}

/// Policies whose latest result on at least one target is violated or failed,
/// mapped to their severity. Rows must be ordered by creation time.
fn unresolved_policies(rows: &[PolicyResultRow]) -> BTreeMap<String, String> {
    let mut latest: HashMap<(&str, &str), &PolicyResultRow> = HashMap::new();
    for row in rows {
        latest.insert((row.result.policy_id.as_str(), row.target_id()), row);
    }
    latest
        .into_values()
        .filter(|r| {
            matches!(
                r.result.status,
                PolicyStatus::Violated | PolicyStatus::Failed
            )
        })
        .map(|r| (r.result.policy_id.clone(), r.result.severity.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::models::{PolicyResult, Task, TaskType, Template};

    #[test]
    fn test_last_days_midnight_includes_today() {
        let now = Utc.with_ymd_and_hms(2024, 8, 25, 17, 30, 0).unwrap();
        assert_eq!(
            last_days_midnight(5, now),
            Utc.with_ymd_and_hms(2024, 8, 21, 0, 0, 0).unwrap()
        );
        assert_eq!(
            last_days_midnight(1, now),
            Utc.with_ymd_and_hms(2024, 8, 25, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_merged_status() {
        let tpl = Template::new("org", "network");
        let mut scan = ScanTask::new(Task::new(&tpl, None, TaskType::TplScan, "r1", 60));
        assert_eq!(MergedStatus::merge(false, Some(&scan)), MergedStatus::Disabled);
        assert_eq!(MergedStatus::merge(true, None), MergedStatus::None);
        assert_eq!(MergedStatus::merge(true, Some(&scan)), MergedStatus::Pending);
        scan.policy_status = PolicyStatus::Violated;
        assert_eq!(MergedStatus::merge(true, Some(&scan)), MergedStatus::Violated);
    }

    fn result(policy: &str, target: &str, status: PolicyStatus, minute: u32) -> PolicyResultRow {
        PolicyResultRow {
            result: PolicyResult {
                id: format!("{}-{}-{}", policy, target, minute),
                scan_task_id: format!("scan-{}", minute),
                policy_id: policy.into(),
                policy_group_id: "g".into(),
                status,
                message: String::new(),
                severity: severity::HIGH.into(),
                created_at: Utc.with_ymd_and_hms(2024, 8, 1, 0, minute, 0).unwrap(),
            },
            policy_name: policy.into(),
            policy_group_name: "G".into(),
            template_id: "tpl".into(),
            env_id: Some(target.into()),
            target_name: target.into(),
        }
    }

    #[test]
    fn test_unresolved_uses_latest_result_per_target() {
        let rows = vec![
            result("p1", "e1", PolicyStatus::Violated, 1),
            result("p1", "e1", PolicyStatus::Passed, 2),
            result("p2", "e1", PolicyStatus::Passed, 1),
            result("p2", "e2", PolicyStatus::Failed, 3),
        ];
        let unresolved = unresolved_policies(&rows);
        assert_eq!(unresolved.len(), 1);
        assert!(unresolved.contains_key("p2"));
    }
}
