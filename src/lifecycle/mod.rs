pub mod ingest;
pub mod manager;
pub mod scheduler;
pub mod wait;

pub use ingest::{IngestReport, StepOutcome};
pub use manager::{resolve_scan_type, AnyTask, ExecutionOptions, Finalized, TaskManager};
