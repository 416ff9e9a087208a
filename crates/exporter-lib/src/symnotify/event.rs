//! Normalized watcher events

use notify::event::{EventKind, ModifyKind, RenameMode};
use std::fmt;
use std::path::{Path, PathBuf};

/// Operation carried by a normalized [`Event`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Create,
    Write,
    Remove,
    Rename,
    Chmod,
}

impl Op {
    pub fn as_str(&self) -> &'static str {
        match self {
            Op::Create => "create",
            Op::Write => "write",
            Op::Remove => "remove",
            Op::Rename => "rename",
            Op::Chmod => "chmod",
        }
    }

    /// Map a raw notification kind to an operation.
    ///
    /// Returns `None` for kinds that are not forwarded: access events, the
    /// paired rename event (already delivered as its two halves) and
    /// backend-specific notices.
    pub(crate) fn from_kind(kind: &EventKind, path: &Path) -> Option<Op> {
        match kind {
            EventKind::Create(_) => Some(Op::Create),
            EventKind::Remove(_) => Some(Op::Remove),
            EventKind::Modify(ModifyKind::Metadata(_)) => Some(Op::Chmod),
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => Some(Op::Rename),
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => Some(Op::Create),
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => None,
            // Backends that cannot tell the two halves apart
            EventKind::Modify(ModifyKind::Name(_)) => {
                if path.symlink_metadata().is_ok() {
                    Some(Op::Create)
                } else {
                    Some(Op::Rename)
                }
            }
            EventKind::Modify(_) => Some(Op::Write),
            EventKind::Access(_) | EventKind::Any | EventKind::Other => None,
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A filesystem event keyed by the externally visible path.
///
/// For a watched symlink `name` is the link path, never the resolved target.
/// For [`Op::Rename`] `name` is the old path; the new path arrives as a
/// separate [`Op::Create`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub name: PathBuf,
    pub op: Op,
}

impl Event {
    pub fn new(name: impl Into<PathBuf>, op: Op) -> Self {
        Self {
            name: name.into(),
            op,
        }
    }
}
