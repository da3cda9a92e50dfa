//! Pre-upload hooks.
//!
//! Hooks are registered per session and run newest first. Any hook may veto
//! the upload; all of them get to amend the changeset tags.

use geoedit_command::UploadSet;
use geoedit_core::Tags;

pub trait UploadHook: Send + Sync {
    /// Returns `Err(reason)` to reject the upload.
    fn check_upload(&self, set: &UploadSet) -> Result<(), String>;

    fn modify_changeset_tags(&self, tags: &mut Tags) {
        let _ = tags;
    }
}

/// Adds a fixed `created_by` tag unless one is already present.
#[derive(Debug, Clone)]
pub struct CreatedBy(pub String);

impl UploadHook for CreatedBy {
    fn check_upload(&self, _set: &UploadSet) -> Result<(), String> {
        Ok(())
    }

    fn modify_changeset_tags(&self, tags: &mut Tags) {
        if !tags.contains_key("created_by") {
            tags.insert("created_by", self.0.clone());
        }
    }
}

/// Rejects uploads larger than a fixed number of operations.
#[derive(Debug, Clone, Copy)]
pub struct MaxChanges(pub usize);

impl UploadHook for MaxChanges {
    fn check_upload(&self, set: &UploadSet) -> Result<(), String> {
        if set.len() > self.0 {
            return Err(format!("{} changes exceed the limit of {}", set.len(), self.0));
        }
        Ok(())
    }
}
