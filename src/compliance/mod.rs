pub mod aggregator;
pub mod report;

pub use aggregator::{
    apply_suppression, group_by_group, DailySeries, Percent, PieSector, PolicyResultGroup,
    Summary,
};
pub use report::{
    policy_summary, scan_report, scan_result, MergedStatus, PolicySummary, ScanReport,
    ScanResultView,
};
