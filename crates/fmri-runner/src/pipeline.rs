//! End-to-end run: preprocessing, configuration records, first-level
//! designs and analyses, then higher-level designs and analyses.

use anyhow::{anyhow, Result};
use fmri_core::entities::strip_entity_prefix;
use fmri_core::{parse_entities, EntityFilter, Layout, TemplateEngine};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, info_span};
use walkdir::WalkDir;

use crate::config::PipelineConfig;
use crate::design::{generate_design_files, DesignRequest};
use crate::dispatch::{dispatch_designs, CommandLog, CommandRunner, DispatchMode, DispatchOptions, DispatchReport};
use crate::header::HeaderReader;
use crate::pairs::{generate_higher_level_designs, HigherLevelRequest};
use crate::params::{extract_parameters, ExtractReport, ExtractRequest};
use crate::preprocess::{
    run_motion_outliers, run_skull_strip, MotionOutlierRequest, SkullStripRequest, StageOptions,
    StageReport,
};

#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    pub input_root: PathBuf,
    pub output_root: PathBuf,
    pub subjects: Option<Vec<String>>,
    pub tasks: Vec<String>,
    /// Empty means every run present; the first two numeric runs are paired
    /// for the higher-level stage.
    pub runs: Vec<Option<u32>>,
    pub template: PathBuf,
    pub higher_level_template: Option<PathBuf>,
    pub custom_blocks: Vec<String>,
    pub custom_block_dir: Option<PathBuf>,
    pub motion_outliers: bool,
    pub skull_strip: bool,
    pub dry_run: bool,
    pub force: bool,
    pub emit_commands: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineReport {
    pub log_file: Option<PathBuf>,
    pub motion_outliers: Option<StageReport>,
    pub skull_strip: Option<StageReport>,
    pub extraction: ExtractReport,
    pub designs: Vec<PathBuf>,
    pub first_level: DispatchReport,
    pub higher_level_designs: Vec<PathBuf>,
    pub higher_level: Option<DispatchReport>,
}

/// The first two distinct numeric runs, in the order given.
pub fn leading_run_pair(runs: &[Option<u32>]) -> Option<(u32, u32)> {
    let mut numeric = Vec::new();
    for run in runs.iter().flatten() {
        if !numeric.contains(run) {
            numeric.push(*run);
        }
        if numeric.len() == 2 {
            return Some((numeric[0], numeric[1]));
        }
    }
    None
}

fn subject_selected(subjects: Option<&[String]>, subject: Option<&str>) -> bool {
    match (subjects, subject) {
        (None, _) => true,
        (Some(list), Some(s)) => list.iter().any(|want| strip_entity_prefix(want, "sub-") == s),
        (Some(_), None) => false,
    }
}

/// Design documents under `root` whose names match the selection, sorted.
pub fn collect_designs(root: &Path, subjects: Option<&[String]>, filter: &EntityFilter) -> Vec<PathBuf> {
    if !root.is_dir() {
        return Vec::new();
    }
    let mut designs: Vec<PathBuf> = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "fsf"))
        .filter(|p| {
            let entities = parse_entities(p.file_stem().map(Path::new).unwrap_or(p));
            subject_selected(subjects, entities.subject.as_deref()) && filter.matches(&entities)
        })
        .collect();
    designs.sort();
    designs
}

/// Chain every stage over one input tree. Stage failures that are not
/// per-unit skips stop the run.
pub fn run_pipeline(
    opts: &PipelineOptions,
    config: &PipelineConfig,
    reader: &dyn HeaderReader,
    engine: &dyn TemplateEngine,
    runner: &dyn CommandRunner,
) -> Result<PipelineReport> {
    if opts.tasks.is_empty() {
        return Err(anyhow!("at least one task is required"));
    }
    let layout = Layout::new(&opts.input_root, &opts.output_root);
    let log_file = CommandLog::create_instance(&layout.logs_dir(), "pipeline")?;
    info!(log = %log_file.display(), "pipeline started");

    let stage_opts = StageOptions {
        dry_run: opts.dry_run,
        log_file: Some(log_file.clone()),
    };
    let runs_filter = (!opts.runs.is_empty()).then(|| opts.runs.clone());
    let mut report = PipelineReport {
        log_file: Some(log_file.clone()),
        ..Default::default()
    };

    if opts.motion_outliers {
        let _span = info_span!("motion_outliers").entered();
        let req = MotionOutlierRequest {
            input_root: opts.input_root.clone(),
            output_root: opts.output_root.clone(),
            subjects: opts.subjects.clone(),
            tasks: Some(opts.tasks.clone()),
            runs: runs_filter.clone(),
        };
        report.motion_outliers = Some(run_motion_outliers(&req, config, reader, runner, &stage_opts)?);
    }
    if opts.skull_strip {
        let _span = info_span!("skull_strip").entered();
        let req = SkullStripRequest {
            input_root: opts.input_root.clone(),
            output_root: opts.output_root.clone(),
            subjects: opts.subjects.clone(),
        };
        report.skull_strip = Some(run_skull_strip(&req, config, runner, &stage_opts)?);
    }

    {
        let _span = info_span!("extract_parameters").entered();
        let req = ExtractRequest {
            input_root: opts.input_root.clone(),
            output_root: opts.output_root.clone(),
            subjects: opts.subjects.clone(),
            tasks: Some(opts.tasks.clone()),
            runs: runs_filter.clone(),
        };
        report.extraction = extract_parameters(&req, config, reader)?;
    }

    for task in &opts.tasks {
        let _span = info_span!("generate_designs", task = %task).entered();
        let req = DesignRequest {
            template: opts.template.clone(),
            output_root: opts.output_root.clone(),
            input_root: opts.input_root.clone(),
            task: task.clone(),
            custom_blocks: opts.custom_blocks.clone(),
            custom_block_dir: opts.custom_block_dir.clone(),
            subjects: opts.subjects.clone(),
            runs: opts.runs.clone(),
        };
        report.designs.extend(generate_design_files(&req, engine)?);
    }

    let mode = match &opts.emit_commands {
        Some(path) => DispatchMode::EmitCommands(path.clone()),
        None => DispatchMode::Execute,
    };
    let dispatch_opts = DispatchOptions {
        binary: config.binaries.feat.clone(),
        max_workers: config.max_workers,
        mode,
        dry_run: opts.dry_run,
        force: opts.force,
        log_file: Some(log_file.clone()),
    };

    let design_filter = EntityFilter {
        tasks: Some(opts.tasks.clone()),
        runs: runs_filter.clone(),
        ..Default::default()
    };
    let first_level = collect_designs(&layout.subject_designs_root(), opts.subjects.as_deref(), &design_filter);
    {
        let _span = info_span!("first_level").entered();
        report.first_level = dispatch_designs(&first_level, &dispatch_opts, runner)?;
    }

    let (Some(template), Some(pair)) = (&opts.higher_level_template, leading_run_pair(&opts.runs)) else {
        info!("no higher-level stage requested");
        return Ok(report);
    };

    let _span = info_span!("higher_level", runs = ?pair).entered();
    let blocks = DesignRequest {
        custom_blocks: opts.custom_blocks.clone(),
        ..Default::default()
    }
    .blocks();
    let task_filter = EntityFilter {
        tasks: Some(opts.tasks.clone()),
        ..Default::default()
    };
    for block in &blocks {
        let req = HigherLevelRequest {
            layout: layout.clone(),
            block: block.clone(),
            template: template.clone(),
            run_pair: pair,
            subjects: opts.subjects.clone(),
            tasks: Some(opts.tasks.clone()),
        };
        report.higher_level_designs.extend(generate_higher_level_designs(&req, engine)?);
    }
    let higher = collect_designs(&layout.higher_level_designs_root(), opts.subjects.as_deref(), &task_filter);
    report.higher_level = Some(dispatch_designs(&higher, &dispatch_opts, runner)?);
    info!(
        first_level = report.first_level.outcomes.len(),
        higher_level = higher.len(),
        "pipeline finished"
    );
    Ok(report)
}
