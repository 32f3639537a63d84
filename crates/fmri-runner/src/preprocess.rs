//! Preprocessing stages that feed the design synthesizer: motion-outlier
//! confounds for functional scans and skull-stripped structural images.

use anyhow::{anyhow, Context, Result};
use fmri_core::layout::{with_prefix, NIFTI_GZ_SUFFIX, SYNTHSTRIP_SUFFIX, SYNTHSTRIP_TOOL_DIR};
use fmri_core::{ensure_dir, require_absent, EntityFilter, Layout};
use serde::Serialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::discover::{functional_scans, session_dirs, subject_dirs};
use crate::dispatch::{
    aggregate, invoke, run_on_pool, CommandLog, CommandRunner, DispatchError, Invocation, JobOutcome,
};
use crate::header::HeaderReader;

#[derive(Debug, Clone, Default)]
pub struct StageOptions {
    pub dry_run: bool,
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StageReport {
    pub existing: Vec<PathBuf>,
    pub outcomes: Vec<JobOutcome>,
}

/// Locate `program` the way a shell would. Names containing a separator
/// are checked as given.
pub fn find_on_path(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let path = env::var_os("PATH")?;
    env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|p| p.is_file())
}

fn run_stage(
    jobs: Vec<Invocation>,
    existing: Vec<PathBuf>,
    max_workers: usize,
    runner: &dyn CommandRunner,
    opts: &StageOptions,
) -> Result<StageReport, DispatchError> {
    let log = opts.log_file.as_ref().map(CommandLog::new);
    let outcomes = run_on_pool(&jobs, max_workers, |inv| {
        invoke(inv, runner, log.as_ref(), opts.dry_run)
    })?;
    Ok(StageReport {
        existing,
        outcomes: aggregate(outcomes)?,
    })
}

#[derive(Debug, Clone, Default)]
pub struct MotionOutlierRequest {
    pub input_root: PathBuf,
    pub output_root: PathBuf,
    pub subjects: Option<Vec<String>>,
    pub tasks: Option<Vec<String>>,
    pub runs: Option<Vec<Option<u32>>>,
}

/// Produce `<stem>_confounds.txt` for every selected functional scan that
/// lacks one. An unreadable header falls back to the default discard count.
pub fn run_motion_outliers(
    req: &MotionOutlierRequest,
    config: &PipelineConfig,
    reader: &dyn HeaderReader,
    runner: &dyn CommandRunner,
    opts: &StageOptions,
) -> Result<StageReport> {
    let layout = Layout::new(&req.input_root, &req.output_root);
    let filter = EntityFilter {
        tasks: req.tasks.clone(),
        runs: req.runs.clone(),
        ..Default::default()
    };

    let mut jobs = Vec::new();
    let mut existing = Vec::new();
    for scan in functional_scans(&req.input_root, req.subjects.as_deref(), &filter)? {
        let target = layout.confounds_for_stem(&scan.entities, &scan.stem);
        if require_absent(&target, "confounds").or_log(&scan.stem).is_none() {
            existing.push(target);
            continue;
        }
        let frames = match reader.read_header(&scan.path) {
            Ok(header) => header.frame_count(),
            Err(e) => {
                warn!(scan = %scan.path.display(), error = %e, "cannot determine frame count, using default discard count");
                None
            }
        };
        let dummy = config.discard_rules.discard_for(frames);
        if let Some(parent) = target.parent() {
            ensure_dir(parent)?;
        }
        jobs.push(Invocation::new(
            &scan.path,
            &config.binaries.motion_outliers,
            vec![
                "-i".to_string(),
                scan.path.to_string_lossy().to_string(),
                "-o".to_string(),
                target.to_string_lossy().to_string(),
                format!("--dummy={}", dummy),
                "-v".to_string(),
                "--dvars".to_string(),
            ],
        ));
    }

    info!(jobs = jobs.len(), existing = existing.len(), "motion outlier detection");
    Ok(run_stage(jobs, existing, config.max_workers, runner, opts)?)
}

#[derive(Debug, Clone, Default)]
pub struct SkullStripRequest {
    pub input_root: PathBuf,
    pub output_root: PathBuf,
    pub subjects: Option<Vec<String>>,
}

/// `<output>/freesurfer_synthstrip_v8.1.0/<sub>/<ses>/anat/<base>_synthstrip.nii.gz`
pub fn skull_strip_target(output_root: &Path, subject: &str, session: &str, image: &Path) -> Option<PathBuf> {
    let name = image.file_name()?.to_str()?;
    let base = name.strip_suffix(NIFTI_GZ_SUFFIX)?;
    Some(
        output_root
            .join(SYNTHSTRIP_TOOL_DIR)
            .join(with_prefix(subject, "sub-"))
            .join(with_prefix(session, "ses-"))
            .join("anat")
            .join(format!("{}{}", base, SYNTHSTRIP_SUFFIX)),
    )
}

fn structural_images(anat: &Path) -> Result<Vec<PathBuf>> {
    if !anat.is_dir() {
        return Ok(Vec::new());
    }
    let mut images: Vec<PathBuf> = fs::read_dir(anat)
        .with_context(|| format!("listing {}", anat.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(NIFTI_GZ_SUFFIX))
        })
        .collect();
    images.sort();
    Ok(images)
}

/// Skull-strip every structural image that has no stripped counterpart.
/// Fails before touching anything when the binary is not on `PATH`.
pub fn run_skull_strip(
    req: &SkullStripRequest,
    config: &PipelineConfig,
    runner: &dyn CommandRunner,
    opts: &StageOptions,
) -> Result<StageReport> {
    let binary = &config.binaries.synthstrip;
    if !opts.dry_run && find_on_path(binary).is_none() {
        return Err(anyhow!("{} is not installed or not found in PATH", binary));
    }

    let mut jobs = Vec::new();
    let mut existing = Vec::new();
    for subject in subject_dirs(&req.input_root, req.subjects.as_deref())? {
        let sub = dir_name(&subject);
        for session in session_dirs(&subject)? {
            let ses = dir_name(&session);
            for image in structural_images(&session.join("anat"))? {
                let Some(target) = skull_strip_target(&req.output_root, &sub, &ses, &image) else {
                    continue;
                };
                let unit = image.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
                if require_absent(&target, "skull-stripped image").or_log(&unit).is_none() {
                    existing.push(target);
                    continue;
                }
                if let Some(parent) = target.parent() {
                    ensure_dir(parent)?;
                }
                jobs.push(Invocation::new(
                    &image,
                    binary,
                    vec![
                        "-i".to_string(),
                        image.to_string_lossy().to_string(),
                        "-o".to_string(),
                        target.to_string_lossy().to_string(),
                    ],
                ));
            }
        }
    }

    info!(jobs = jobs.len(), existing = existing.len(), "skull stripping");
    Ok(run_stage(jobs, existing, config.max_workers, runner, opts)?)
}

fn dir_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}
