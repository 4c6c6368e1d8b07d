pub mod artifact;
pub mod compliance;
pub mod config;
pub mod drift;
pub mod error;
pub mod lifecycle;
pub mod notify;
pub mod output;
pub mod parser;
pub mod policy;
pub mod runner;
pub mod state;
