pub mod agent;
pub mod config;
pub mod consensus;
pub mod db;
pub mod git;
pub mod merge;
pub mod orchestrator;
pub mod pool;
pub mod ratelimit;
pub mod types;

pub use types::*;
