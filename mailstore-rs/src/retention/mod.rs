/// Retention engine
///
/// Periodic background sweep:
/// - expires messages older than their mailbox's maximum age
/// - deletes accounts that never logged in once they reach a configured age
/// - reclaims orphaned blobs left behind by interrupted deliveries

pub mod manager;
pub mod types;

pub use manager::{RetentionEngine, RetentionHandle};
pub use types::{RetentionConfig, SweepReport};
