pub mod entities;
pub mod layout;
pub mod resolve;
pub mod subjects;
pub mod template;

pub use entities::{match_filters, parse_entities, run_label, EntityFilter, EntitySet, BOLD_SUFFIX};
pub use layout::{Layout, STANDARD_BLOCK};
pub use resolve::{require_absent, require_path, Resolved, SkipKind, SkipReason};
pub use subjects::resolve_subjects;
pub use template::{load_template, PlaceholderEngine, TemplateEngine, TemplateError, TemplateVars};

use anyhow::{Context, Result};
use std::fs;
use std::io::Write;
use std::path::Path;

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("creating directory {}", path.display()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    AlreadyExists,
}

/// Write `bytes` to `path` only if nothing is there yet.
///
/// The content is staged in a sibling temp file and linked into place
/// without clobbering, so readers never observe a partial file and two
/// concurrent writers cannot overwrite each other: the loser gets
/// [`WriteOutcome::AlreadyExists`].
pub fn write_new_atomic(path: &Path, bytes: &[u8]) -> Result<WriteOutcome> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    ensure_dir(parent)?;
    let mut tmp = tempfile::Builder::new()
        .prefix(".staged.")
        .tempfile_in(parent)
        .with_context(|| format!("staging {}", path.display()))?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    match tmp.persist_noclobber(path) {
        Ok(_) => Ok(WriteOutcome::Written),
        Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => {
            Ok(WriteOutcome::AlreadyExists)
        }
        Err(e) => Err(e.error).with_context(|| format!("writing {}", path.display())),
    }
}

/// Append `line` (newline-terminated) to `path`, creating parents as needed.
pub fn append_line(path: &Path, line: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        ensure_dir(parent)?;
    }
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening {} for append", path.display()))?;
    let mut buf = line.trim_end_matches('\n').to_string();
    buf.push('\n');
    file.write_all(buf.as_bytes())?;
    Ok(())
}

pub fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}
