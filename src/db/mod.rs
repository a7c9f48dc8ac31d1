//! Database module for CanaryWatch.
//!
//! SQLite storage for metric history and alarm records.

mod models;
mod processor;
mod store;

pub use models::*;
pub use processor::*;
pub use store::*;
