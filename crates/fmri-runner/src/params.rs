//! Per-scan configuration records derived from scan headers.

use anyhow::{Context, Result};
use fmri_core::{write_new_atomic, EntityFilter, Layout, WriteOutcome};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info};

use crate::config::{AnalysisConstants, DiscardRules, PipelineConfig};
use crate::discover::functional_scans;
use crate::header::{HeaderReader, ScanHeader};

pub const NOT_AVAILABLE: &str = "N/A";

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigurationRecord {
    pub stem: String,
    pub repetition_time: Option<f32>,
    pub total_frames: Option<usize>,
    pub discard_frames: u32,
    pub analysis: AnalysisConstants,
}

impl ConfigurationRecord {
    pub fn from_header(
        stem: &str,
        header: &ScanHeader,
        rules: &DiscardRules,
        analysis: &AnalysisConstants,
    ) -> Self {
        let total_frames = header.frame_count();
        Self {
            stem: stem.to_string(),
            repetition_time: header.repetition_time(),
            total_frames,
            discard_frames: rules.discard_for(total_frames),
            analysis: analysis.clone(),
        }
    }

    pub fn render(&self) -> String {
        let tr = self
            .repetition_time
            .map(|t| format!("{:?}", t))
            .unwrap_or_else(|| NOT_AVAILABLE.to_string());
        let frames = self
            .total_frames
            .map(|f| f.to_string())
            .unwrap_or_else(|| NOT_AVAILABLE.to_string());
        let a = &self.analysis;
        format!(
            "# {stem}_configuration.md\n\n\
             TOTAL_REPETITION_TIME = {tr}\n\
             TOTAL_FRAMES = {frames}\n\
             DISCARD_FRAMES = {discard}\n\
             CRITICAL_Z = {cz}\n\
             SMOOTHING_KERNEL = {sk}\n\
             PROB_THRESHOLD = {pt}\n\
             Z_THRESHOLD = {zt}\n\
             Z_MINIMUM = {zm}\n",
            stem = self.stem,
            discard = self.discard_frames,
            cz = a.critical_z,
            sk = a.smoothing_kernel,
            pt = a.prob_threshold,
            zt = a.z_threshold,
            zm = a.z_minimum,
        )
    }
}

/// Parse a `KEY = value` record. Blank lines, `#` comments and lines without
/// `=` are ignored; later duplicates win.
pub fn parse_record(text: &str) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            params.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    params
}

pub fn read_record(path: &Path) -> Result<BTreeMap<String, String>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading configuration record {}", path.display()))?;
    Ok(parse_record(&text))
}

#[derive(Debug, Clone, Default)]
pub struct ExtractRequest {
    pub input_root: PathBuf,
    pub output_root: PathBuf,
    pub subjects: Option<Vec<String>>,
    pub tasks: Option<Vec<String>>,
    pub runs: Option<Vec<Option<u32>>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractFailure {
    pub scan: PathBuf,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExtractReport {
    pub written: Vec<PathBuf>,
    pub existing: Vec<PathBuf>,
    pub failed: Vec<ExtractFailure>,
}

/// Write one configuration record per accepted functional scan.
///
/// Existing records are never touched so hand edits survive re-runs. A scan
/// whose header cannot be read is logged and reported without stopping the
/// remaining scans.
pub fn extract_parameters(
    req: &ExtractRequest,
    config: &PipelineConfig,
    reader: &dyn HeaderReader,
) -> Result<ExtractReport> {
    let layout = Layout::new(&req.input_root, &req.output_root);
    let filter = EntityFilter {
        tasks: req.tasks.clone(),
        runs: req.runs.clone(),
        ..Default::default()
    };
    let mut report = ExtractReport::default();

    for scan in functional_scans(&req.input_root, req.subjects.as_deref(), &filter)? {
        let target = layout.configuration_record_for_stem(&scan.entities, &scan.stem);
        if target.exists() {
            info!(path = %target.display(), "configuration already exists, skipping");
            report.existing.push(target);
            continue;
        }

        let header = match reader.read_header(&scan.path) {
            Ok(h) => h,
            Err(e) => {
                error!(scan = %scan.path.display(), error = %e, "could not read scan header");
                report.failed.push(ExtractFailure {
                    scan: scan.path.clone(),
                    error: e.to_string(),
                });
                continue;
            }
        };
        let record = ConfigurationRecord::from_header(
            &scan.stem,
            &header,
            &config.discard_rules,
            &config.analysis,
        );
        match write_new_atomic(&target, record.render().as_bytes()) {
            Ok(WriteOutcome::Written) => {
                info!(path = %target.display(), "configuration written");
                report.written.push(target);
            }
            Ok(WriteOutcome::AlreadyExists) => {
                info!(path = %target.display(), "configuration appeared concurrently, skipping");
                report.existing.push(target);
            }
            Err(e) => {
                error!(scan = %scan.path.display(), error = %e, "could not write configuration");
                report.failed.push(ExtractFailure {
                    scan: scan.path.clone(),
                    error: format!("{:#}", e),
                });
            }
        }
    }
    Ok(report)
}
