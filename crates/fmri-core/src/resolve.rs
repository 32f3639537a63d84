//! Log-and-skip handling for units of work whose upstream artifact is absent.

use std::fmt;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipKind {
    /// A required upstream artifact does not exist.
    MissingDependency,
    /// A name did not follow the expected convention.
    MalformedInput,
    /// The target artifact is already present.
    AlreadyExists,
    /// The job's output directory already looks complete.
    AlreadyComplete,
    /// The requested combination does not apply to this unit.
    NotApplicable,
}

impl SkipKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SkipKind::MissingDependency => "missing_dependency",
            SkipKind::MalformedInput => "malformed_input",
            SkipKind::AlreadyExists => "already_exists",
            SkipKind::AlreadyComplete => "already_complete",
            SkipKind::NotApplicable => "not_applicable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkipReason {
    pub kind: SkipKind,
    pub detail: String,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.detail)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved<T> {
    Found(T),
    Skipped(SkipReason),
}

impl<T> Resolved<T> {
    pub fn skipped(kind: SkipKind, detail: impl Into<String>) -> Self {
        Resolved::Skipped(SkipReason {
            kind,
            detail: detail.into(),
        })
    }

    pub fn is_found(&self) -> bool {
        matches!(self, Resolved::Found(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Resolved<U> {
        match self {
            Resolved::Found(v) => Resolved::Found(f(v)),
            Resolved::Skipped(r) => Resolved::Skipped(r),
        }
    }

    pub fn and_then<U>(self, f: impl FnOnce(T) -> Resolved<U>) -> Resolved<U> {
        match self {
            Resolved::Found(v) => f(v),
            Resolved::Skipped(r) => Resolved::Skipped(r),
        }
    }

    /// Unwrap a found value, or log why `unit` was skipped.
    ///
    /// Missing dependencies and malformed inputs log at warn; idempotent
    /// skips log at info.
    pub fn or_log(self, unit: &str) -> Option<T> {
        match self {
            Resolved::Found(v) => Some(v),
            Resolved::Skipped(reason) => {
                match reason.kind {
                    SkipKind::MissingDependency | SkipKind::MalformedInput => {
                        warn!(unit, reason = reason.kind.as_str(), "skipping: {}", reason.detail)
                    }
                    SkipKind::AlreadyExists
                    | SkipKind::AlreadyComplete
                    | SkipKind::NotApplicable => {
                        info!(unit, reason = reason.kind.as_str(), "skipping: {}", reason.detail)
                    }
                }
                None
            }
        }
    }
}

/// `Found(path)` when `path` exists, otherwise a missing-dependency skip.
pub fn require_path(path: impl AsRef<Path>, what: &str) -> Resolved<PathBuf> {
    let path = path.as_ref();
    if path.exists() {
        Resolved::Found(path.to_path_buf())
    } else {
        Resolved::skipped(
            SkipKind::MissingDependency,
            format!("{} not found: {}", what, path.display()),
        )
    }
}

/// `Found(path)` when `path` is still free, otherwise an already-exists skip.
pub fn require_absent(path: impl AsRef<Path>, what: &str) -> Resolved<PathBuf> {
    let path = path.as_ref();
    if path.exists() {
        Resolved::skipped(
            SkipKind::AlreadyExists,
            format!("{} already exists: {}", what, path.display()),
        )
    } else {
        Resolved::Found(path.to_path_buf())
    }
}
