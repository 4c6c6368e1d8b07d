pub mod detector;

pub use detector::{parse_drift_log, reconcile, AttrDrift, DriftMap, DriftReconciliation};
