pub mod dispatch;
pub mod registry;

pub use dispatch::{DispatchClient, RunnerControl};
pub use registry::{RunnerRegistry, StaticRunnerRegistry};
