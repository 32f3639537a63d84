//! Runs design documents through the analysis binary on a bounded pool.
//!
//! Completion is always re-derived from the output directory a document
//! declares, so an interrupted batch can simply be dispatched again.

use chrono::Local;
use fmri_core::{append_line, shell_join, Resolved, SkipKind};
use rayon::prelude::*;
use regex::Regex;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Mutex, OnceLock};
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// The artifact this job is about; used in logs and failure reports.
    pub subject_path: PathBuf,
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn new(subject_path: impl Into<PathBuf>, program: &str, args: Vec<String>) -> Self {
        Self {
            subject_path: subject_path.into(),
            program: program.to_string(),
            args,
        }
    }

    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 1);
        argv.push(self.program.clone());
        argv.extend(self.args.iter().cloned());
        argv
    }

    pub fn command_line(&self) -> String {
        shell_join(&self.argv())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Launches one external process and waits for it.
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[String]) -> std::io::Result<ProcessOutput>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[String]) -> std::io::Result<ProcessOutput> {
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()?;
        Ok(ProcessOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Timestamped append-only record of every command run or rehearsed.
#[derive(Debug)]
pub struct CommandLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl CommandLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// `<dir>/<prefix>_<YYYYmmdd_HHMMSS>_<pid>.log`, created empty.
    pub fn create_instance(dir: &Path, prefix: &str) -> anyhow::Result<PathBuf> {
        let name = format!(
            "{}_{}_{}.log",
            prefix,
            Local::now().format("%Y%m%d_%H%M%S"),
            std::process::id()
        );
        let path = dir.join(name);
        fmri_core::ensure_dir(dir)?;
        fs::OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(path)
    }

    pub fn record(&self, line: &str) {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        let stamped = format!(
            "[{}] {}",
            Local::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, false),
            line.trim_end()
        );
        if let Err(e) = append_line(&self.path, &stamped) {
            warn!(path = %self.path.display(), error = %e, "could not append to command log");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Completed,
    AlreadyComplete,
    Rehearsed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobOutcome {
    pub subject_path: PathBuf,
    pub status: JobStatus,
    pub exit_code: Option<i32>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobFailure {
    pub subject_path: PathBuf,
    pub exit_code: Option<i32>,
    pub detail: String,
}

fn summarize(failures: &[JobFailure]) -> String {
    failures
        .iter()
        .map(|f| match f.exit_code {
            Some(code) => format!("{} (exit {}): {}", f.subject_path.display(), code, f.detail),
            None => format!("{}: {}", f.subject_path.display(), f.detail),
        })
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Raised after every sibling job has finished.
    #[error("{} job(s) failed: {}", .failures.len(), summarize(.failures))]
    JobsFailed {
        failures: Vec<JobFailure>,
        outcomes: Vec<JobOutcome>,
    },
    #[error("cannot build worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Execute `inv` once, or only log it when rehearsing.
pub fn invoke(
    inv: &Invocation,
    runner: &dyn CommandRunner,
    log: Option<&CommandLog>,
    dry_run: bool,
) -> JobOutcome {
    let line = inv.command_line();
    if let Some(log) = log {
        log.record(&format!("$ {}", line));
    }
    if dry_run {
        info!(command = %line, "dry run, not executing");
        return JobOutcome {
            subject_path: inv.subject_path.clone(),
            status: JobStatus::Rehearsed,
            exit_code: None,
            message: None,
        };
    }

    info!(command = %line, "running");
    match runner.run(&inv.program, &inv.args) {
        Ok(out) if out.success() => JobOutcome {
            subject_path: inv.subject_path.clone(),
            status: JobStatus::Completed,
            exit_code: out.code,
            message: None,
        },
        Ok(out) => {
            if let Some(log) = log {
                if !out.stdout.trim().is_empty() {
                    log.record(&format!("stdout: {}", out.stdout.trim()));
                }
                if !out.stderr.trim().is_empty() {
                    log.record(&format!("stderr: {}", out.stderr.trim()));
                }
            }
            let tail = out
                .stderr
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("process exited without output")
                .trim()
                .to_string();
            error!(
                path = %inv.subject_path.display(),
                exit_code = ?out.code,
                "command failed: {}",
                tail
            );
            JobOutcome {
                subject_path: inv.subject_path.clone(),
                status: JobStatus::Failed,
                exit_code: out.code,
                message: Some(tail),
            }
        }
        Err(e) => {
            if let Some(log) = log {
                log.record(&format!("error: {}", e));
            }
            error!(path = %inv.subject_path.display(), error = %e, "could not launch command");
            JobOutcome {
                subject_path: inv.subject_path.clone(),
                status: JobStatus::Failed,
                exit_code: None,
                message: Some(format!("could not launch {}: {}", inv.program, e)),
            }
        }
    }
}

/// Map `work` over `jobs` on `max_workers` threads. Every job runs to
/// completion; nothing is cancelled when a sibling fails.
pub fn run_on_pool<J, F>(jobs: &[J], max_workers: usize, work: F) -> Result<Vec<JobOutcome>, DispatchError>
where
    J: Sync,
    F: Fn(&J) -> JobOutcome + Sync + Send,
{
    if jobs.is_empty() {
        return Ok(Vec::new());
    }
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(max_workers.clamp(1, jobs.len()))
        .thread_name(|i| format!("fmri-worker-{}", i))
        .build()?;
    Ok(pool.install(|| jobs.par_iter().map(&work).collect()))
}

/// Turn collected outcomes into a report, or one error naming every failure.
pub fn aggregate(outcomes: Vec<JobOutcome>) -> Result<Vec<JobOutcome>, DispatchError> {
    let failures: Vec<JobFailure> = outcomes
        .iter()
        .filter(|o| o.status == JobStatus::Failed)
        .map(|o| JobFailure {
            subject_path: o.subject_path.clone(),
            exit_code: o.exit_code,
            detail: o.message.clone().unwrap_or_default(),
        })
        .collect();
    if failures.is_empty() {
        Ok(outcomes)
    } else {
        Err(DispatchError::JobsFailed { failures, outcomes })
    }
}

fn outputdir_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"^\s*set\s+fmri\(outputdir\)\s+"?([^"\n]+)"?\s*$"#)
            .unwrap_or_else(|e| panic!("outputdir pattern must compile: {}", e))
    })
}

/// The first `set fmri(outputdir) ...` line in a design document.
pub fn declared_output_dir(design_text: &str) -> Option<PathBuf> {
    design_text.lines().find_map(|line| {
        outputdir_pattern()
            .captures(line)
            .map(|c| PathBuf::from(c[1].trim()))
            .filter(|p| !p.as_os_str().is_empty())
    })
}

pub fn read_declared_output_dir(design: &Path) -> Option<PathBuf> {
    let bytes = fs::read(design).ok()?;
    declared_output_dir(&String::from_utf8_lossy(&bytes))
}

/// A finished analysis leaves a design copy, a stats directory and either
/// the filtered data volume or the HTML report.
pub fn output_is_complete(dir: &Path) -> bool {
    dir.is_dir()
        && dir.join("design.fsf").exists()
        && dir.join("stats").exists()
        && (dir.join("filtered_func_data.nii.gz").exists() || dir.join("report.html").exists())
}

pub fn completion_check(design: &Path) -> Resolved<()> {
    match read_declared_output_dir(design) {
        Some(dir) if output_is_complete(&dir) => Resolved::skipped(
            SkipKind::AlreadyComplete,
            format!("output already complete: {}", dir.display()),
        ),
        _ => Resolved::Found(()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchMode {
    Execute,
    /// Append one command per document to this file instead of running.
    EmitCommands(PathBuf),
}

#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub binary: String,
    pub max_workers: usize,
    pub mode: DispatchMode,
    pub dry_run: bool,
    pub force: bool,
    pub log_file: Option<PathBuf>,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            binary: "feat".to_string(),
            max_workers: 10,
            mode: DispatchMode::Execute,
            dry_run: false,
            force: false,
            log_file: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchReport {
    pub emitted_to: Option<PathBuf>,
    pub outcomes: Vec<JobOutcome>,
}

impl DispatchReport {
    pub fn count(&self, status: JobStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }
}

pub fn write_commands(designs: &[PathBuf], binary: &str, target: &Path) -> Result<usize, DispatchError> {
    let mut written = 0;
    for design in designs.iter().filter(|d| !d.as_os_str().is_empty()) {
        let line = Invocation::new(design, binary, vec![design.to_string_lossy().to_string()])
            .command_line();
        append_line(target, &line).map_err(|e| DispatchError::Io {
            context: format!("appending to {}", target.display()),
            source: std::io::Error::other(format!("{:#}", e)),
        })?;
        written += 1;
    }
    info!(path = %target.display(), count = written, "wrote commands");
    Ok(written)
}

/// Run (or emit) the analysis binary for every design document.
pub fn dispatch_designs(
    designs: &[PathBuf],
    opts: &DispatchOptions,
    runner: &dyn CommandRunner,
) -> Result<DispatchReport, DispatchError> {
    let designs: Vec<PathBuf> = designs
        .iter()
        .filter(|d| !d.as_os_str().is_empty())
        .cloned()
        .collect();

    if let DispatchMode::EmitCommands(target) = &opts.mode {
        write_commands(&designs, &opts.binary, target)?;
        return Ok(DispatchReport {
            emitted_to: Some(target.clone()),
            outcomes: Vec::new(),
        });
    }
    if designs.is_empty() {
        return Ok(DispatchReport::default());
    }

    let log = opts.log_file.as_ref().map(CommandLog::new);
    let outcomes = run_on_pool(&designs, opts.max_workers, |design| {
        if !opts.force {
            let unit = design.to_string_lossy();
            if completion_check(design).or_log(&unit).is_none() {
                return JobOutcome {
                    subject_path: design.clone(),
                    status: JobStatus::AlreadyComplete,
                    exit_code: None,
                    message: None,
                };
            }
        }
        let inv = Invocation::new(design, &opts.binary, vec![design.to_string_lossy().to_string()]);
        invoke(&inv, runner, log.as_ref(), opts.dry_run)
    })?;

    Ok(DispatchReport {
        emitted_to: None,
        outcomes: aggregate(outcomes)?,
    })
}
