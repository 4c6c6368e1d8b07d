pub mod loader;
pub mod types;

pub use loader::load_settings;
pub use types::{RunnerEntry, Settings};
