//! Walks the `sub-*/ses-*/<modality>/` input tree.

use anyhow::{anyhow, Context, Result};
use fmri_core::layout::with_prefix;
use fmri_core::{parse_entities, EntityFilter, EntitySet, Resolved, SkipKind, BOLD_SUFFIX};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct ScanFile {
    pub path: PathBuf,
    /// Filename minus `_bold.nii.gz`, verbatim. Derived artifacts are named
    /// from this, never from `entities`.
    pub stem: String,
    pub entities: EntitySet,
}

fn sorted_dirs_with_prefix(root: &Path, prefix: &str) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(root).with_context(|| format!("listing {}", root.display()))? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with(prefix) && entry.path().is_dir() {
            out.push(entry.path());
        }
    }
    out.sort();
    Ok(out)
}

/// Subject directories under `input_root`, restricted to `selection` when
/// given. Selected subjects without a directory are logged and dropped.
pub fn subject_dirs(input_root: &Path, selection: Option<&[String]>) -> Result<Vec<PathBuf>> {
    if !input_root.is_dir() {
        return Err(anyhow!("input directory not found: {}", input_root.display()));
    }
    match selection {
        None => sorted_dirs_with_prefix(input_root, "sub-"),
        Some(subjects) => {
            let mut out = Vec::new();
            for s in subjects {
                let dir = input_root.join(with_prefix(s, "sub-"));
                if dir.is_dir() {
                    out.push(dir);
                } else {
                    warn!(subject = %s, path = %dir.display(), "subject directory does not exist, skipping");
                }
            }
            Ok(out)
        }
    }
}

pub fn session_dirs(subject_dir: &Path) -> Result<Vec<PathBuf>> {
    sorted_dirs_with_prefix(subject_dir, "ses-")
}

/// Subject, session and task must all be present to derive a scan's paths.
pub fn classify_scan(path: &Path) -> Resolved<ScanFile> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let entities = parse_entities(&name);
    if entities.subject.is_none() || entities.session.is_none() || entities.task.is_none() {
        return Resolved::skipped(
            SkipKind::MalformedInput,
            format!(
                "scan name lacks subject, session or task: {}",
                path.display()
            ),
        );
    }
    let stem = name.strip_suffix(BOLD_SUFFIX).unwrap_or(&name).to_string();
    Resolved::Found(ScanFile {
        path: path.to_path_buf(),
        stem,
        entities,
    })
}

/// Functional scans (`*_bold.nii.gz` under `func/`) accepted by `filter`,
/// ordered by subject, session and filename.
pub fn functional_scans(
    input_root: &Path,
    subjects: Option<&[String]>,
    filter: &EntityFilter,
) -> Result<Vec<ScanFile>> {
    let mut scans = Vec::new();
    for subject in subject_dirs(input_root, subjects)? {
        for session in session_dirs(&subject)? {
            scans.extend(session_functional_scans(&session, filter)?);
        }
    }
    Ok(scans)
}

pub fn session_functional_scans(session_dir: &Path, filter: &EntityFilter) -> Result<Vec<ScanFile>> {
    let func = session_dir.join("func");
    if !func.is_dir() {
        debug!(path = %func.display(), "no func directory");
        return Ok(Vec::new());
    }
    let mut names: Vec<PathBuf> = fs::read_dir(&func)
        .with_context(|| format!("listing {}", func.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    names.sort();

    let mut out = Vec::new();
    for path in names {
        let name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
        if !name.ends_with(BOLD_SUFFIX) {
            continue;
        }
        let unit = name.trim_end_matches(BOLD_SUFFIX).to_string();
        if let Some(scan) = classify_scan(&path).or_log(&unit) {
            if filter.matches(&scan.entities) {
                out.push(scan);
            }
        }
    }
    Ok(out)
}
