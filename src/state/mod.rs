pub mod backend;
pub mod migration;
pub mod models;
pub mod schema;
pub mod sqlite;

pub use backend::StateBackend;
pub use sqlite::SqliteBackend;
