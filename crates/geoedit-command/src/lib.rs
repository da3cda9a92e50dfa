pub mod command;
pub mod history;
pub mod resolver;
pub mod merge;
pub mod upload;
pub mod error;

// Re-export commonly used types
pub use command::{CommandRecord, CommandState, DeleteMode, EditCommand};
pub use history::{CommandHistory, HistoryEntry, HistoryEvent, HistoryListener};
pub use resolver::{classify, resolution_command, Classification, Resolution};
pub use merge::{merge_remote, MergePlan, MergeReport};
pub use upload::{
    apply_upload_result, apply_upload_result_with, Changeset, ChangesetOp, UploadResult, UploadSet,
};
pub use error::{EditError, UploadError};
