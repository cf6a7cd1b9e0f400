//! Change events and native-event classification.

use std::path::PathBuf;

use notify::event::{EventKind, ModifyKind};

/// One or more tracked paths observed to have changed.
///
/// Delivered once per detection. Changes discovered by the same
/// reconciliation sweep are merged into a single event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub paths: Vec<PathBuf>,
}

impl ChangeEvent {
    pub(crate) fn single(path: PathBuf) -> Self {
        Self { paths: vec![path] }
    }
}

// Create, remove, write (data modify) and rename (name modify) are the only
// kinds that can affect a tracked file's content or identity. Everything
// else (metadata, access) is ignored.

pub(crate) fn is_actionable(kind: &EventKind) -> bool {
    is_create(kind) || is_remove(kind) || is_write(kind) || is_rename(kind)
}

pub(crate) fn is_create(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Create(_))
}

pub(crate) fn is_remove(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Remove(_))
}

pub(crate) fn is_write(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any)
    )
}

pub(crate) fn is_rename(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Modify(ModifyKind::Name(_)))
}
