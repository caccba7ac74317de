//! Data models for the portfolio.
//!
//! These models represent the records stored in the local cache and in the
//! remote dataset. Field names serialize in camelCase to match the JSON the
//! dashboard frontend already reads.

pub mod app;
pub mod idea;
pub mod queued_operation;
pub mod review;
pub mod source;
pub mod task;

// Re-exports for convenient access
pub use app::{app_id_from_name, AppRecord, AppStatus};
pub use idea::{merge_comments, CommentRecord, IdeaRecord, IdeaStatus};
pub use queued_operation::{OperationType, QueueStatus, QueuedOperation};
pub use review::ReviewRecord;
pub use source::SourceRepository;
pub use task::{TaskPriority, TaskRecord, TaskStatus};

/// A record that can be matched against its counterpart in another copy of
/// the same collection.
pub trait Keyed {
    /// Merge identity of the record.
    fn identity_key(&self) -> String;
}
