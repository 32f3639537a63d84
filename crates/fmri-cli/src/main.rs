use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use fmri_core::{resolve_subjects, Layout, PlaceholderEngine, STANDARD_BLOCK};
use fmri_runner::pipeline::collect_designs;
use fmri_runner::{
    DispatchMode, DispatchOptions, DispatchReport, JobStatus, NiftiHeaderReader, PipelineConfig,
    StageOptions, StageReport, SystemRunner,
};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fmri", version = "0.3.0", about = "Task-fMRI first- and higher-level analysis pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct Common {
    /// Pipeline config (.json, .yaml or .yml).
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    max_workers: Option<usize>,
    #[arg(long, short)]
    verbose: bool,
    #[arg(long)]
    json: bool,
}

#[derive(Args, Clone, Default)]
struct Selection {
    /// Subject labels (space or comma separated) or one file listing them.
    #[arg(long, num_args = 1..)]
    subjects: Vec<String>,
    #[arg(long = "task", num_args = 1..)]
    tasks: Vec<String>,
    /// Run numbers, or `none` for scans without a run label.
    #[arg(long = "run", num_args = 1.., value_parser = parse_run)]
    runs: Vec<Option<u32>>,
}

impl Selection {
    fn subjects(&self) -> Option<Vec<String>> {
        resolve_subjects(&self.subjects)
    }

    fn tasks(&self) -> Option<Vec<String>> {
        (!self.tasks.is_empty()).then(|| self.tasks.clone())
    }

    fn runs(&self) -> Option<Vec<Option<u32>>> {
        (!self.runs.is_empty()).then(|| self.runs.clone())
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Write one configuration record per functional scan.
    ExtractParameters {
        #[arg(long)]
        input_dir: PathBuf,
        #[arg(long)]
        output_dir: PathBuf,
        #[command(flatten)]
        selection: Selection,
        /// Directory holding dummy_scan_settings.json.
        #[arg(long)]
        settings_dir: Option<PathBuf>,
        #[command(flatten)]
        common: Common,
    },
    /// Render first-level design documents from a template.
    GenerateDesigns {
        #[arg(long)]
        input_dir: PathBuf,
        #[arg(long)]
        output_dir: PathBuf,
        #[arg(long)]
        template: PathBuf,
        #[arg(long)]
        task: String,
        #[arg(long = "custom-block", num_args = 1..)]
        custom_blocks: Vec<String>,
        #[arg(long)]
        custom_block_dir: Option<PathBuf>,
        #[arg(long, num_args = 1..)]
        subjects: Vec<String>,
        #[arg(long = "run", num_args = 1.., value_parser = parse_run)]
        runs: Vec<Option<u32>>,
        #[command(flatten)]
        common: Common,
    },
    /// Render higher-level designs combining two first-level runs.
    GenerateHigherLevel {
        #[arg(long)]
        output_dir: PathBuf,
        #[arg(long)]
        template: PathBuf,
        #[arg(long, default_value = STANDARD_BLOCK)]
        block: String,
        #[arg(long, num_args = 2, default_values_t = [1, 2])]
        run_pair: Vec<u32>,
        #[arg(long, num_args = 1..)]
        subjects: Vec<String>,
        #[arg(long = "task", num_args = 1..)]
        tasks: Vec<String>,
        #[command(flatten)]
        common: Common,
    },
    /// Run the analysis binary on design documents.
    Feat {
        designs: Vec<PathBuf>,
        /// Also dispatch every .fsf found below this directory.
        #[arg(long)]
        design_dir: Option<PathBuf>,
        #[arg(long)]
        emit_commands: Option<PathBuf>,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        log_file: Option<PathBuf>,
        #[command(flatten)]
        common: Common,
    },
    /// Generate motion-outlier confound files.
    MotionOutliers {
        #[arg(long)]
        input_dir: PathBuf,
        #[arg(long)]
        output_dir: PathBuf,
        #[command(flatten)]
        selection: Selection,
        #[arg(long)]
        settings_dir: Option<PathBuf>,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        log_file: Option<PathBuf>,
        #[command(flatten)]
        common: Common,
    },
    /// Skull-strip structural images.
    Skullstrip {
        #[arg(long)]
        input_dir: PathBuf,
        #[arg(long)]
        output_dir: PathBuf,
        #[arg(long, num_args = 1..)]
        subjects: Vec<String>,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        log_file: Option<PathBuf>,
        #[command(flatten)]
        common: Common,
    },
    /// Run every stage in order.
    Run {
        #[arg(long)]
        input_dir: PathBuf,
        #[arg(long)]
        output_dir: PathBuf,
        #[arg(long)]
        template: PathBuf,
        #[arg(long)]
        higher_level_template: Option<PathBuf>,
        #[command(flatten)]
        selection: Selection,
        #[arg(long = "custom-block", num_args = 1..)]
        custom_blocks: Vec<String>,
        #[arg(long)]
        custom_block_dir: Option<PathBuf>,
        #[arg(long)]
        settings_dir: Option<PathBuf>,
        #[arg(long)]
        skip_motion_outliers: bool,
        #[arg(long)]
        skip_skullstrip: bool,
        #[arg(long)]
        emit_commands: Option<PathBuf>,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        force: bool,
        #[command(flatten)]
        common: Common,
    },
}

impl Commands {
    fn common(&self) -> &Common {
        match self {
            Commands::ExtractParameters { common, .. }
            | Commands::GenerateDesigns { common, .. }
            | Commands::GenerateHigherLevel { common, .. }
            | Commands::Feat { common, .. }
            | Commands::MotionOutliers { common, .. }
            | Commands::Skullstrip { common, .. }
            | Commands::Run { common, .. } => common,
        }
    }
}

fn parse_run(raw: &str) -> Result<Option<u32>, String> {
    let value = raw.trim();
    if value.eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    value
        .parse::<u32>()
        .map(Some)
        .map_err(|_| format!("expected a run number or `none`, got `{}`", raw))
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let common = cli.command.common().clone();
    init_tracing(common.verbose);
    let result = run_command(cli.command, &common);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if common.json {
                emit_json(&json_error("command_failed", format!("{:#}", err), error_details(&err)));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn load_config(common: &Common, settings_dir: Option<&Path>) -> Result<PipelineConfig> {
    let mut config = match &common.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(dir) = settings_dir {
        config = config.with_settings_dir(dir)?;
    }
    if let Some(n) = common.max_workers {
        config.max_workers = n;
    }
    config.validate()?;
    Ok(config)
}

fn run_command(command: Commands, common: &Common) -> Result<Option<Value>> {
    let json = common.json;
    match command {
        Commands::ExtractParameters {
            input_dir,
            output_dir,
            selection,
            settings_dir,
            ..
        } => {
            let config = load_config(common, settings_dir.as_deref())?;
            let req = fmri_runner::ExtractRequest {
                input_root: input_dir,
                output_root: output_dir,
                subjects: selection.subjects(),
                tasks: selection.tasks(),
                runs: selection.runs(),
            };
            let report = fmri_runner::extract_parameters(&req, &config, &NiftiHeaderReader)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "extract-parameters",
                    "result": report,
                })));
            }
            println!("written: {}", report.written.len());
            println!("existing: {}", report.existing.len());
            println!("failed: {}", report.failed.len());
            for failure in &report.failed {
                println!("failed_scan: {} ({})", failure.scan.display(), failure.error);
            }
        }
        Commands::GenerateDesigns {
            input_dir,
            output_dir,
            template,
            task,
            custom_blocks,
            custom_block_dir,
            subjects,
            runs,
            ..
        } => {
            let req = fmri_runner::DesignRequest {
                template,
                output_root: output_dir,
                input_root: input_dir,
                task,
                custom_blocks,
                custom_block_dir,
                subjects: resolve_subjects(&subjects),
                runs,
            };
            let generated = fmri_runner::generate_design_files(&req, &PlaceholderEngine)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "generate-designs",
                    "result": generated,
                })));
            }
            print_paths("generated", &generated);
        }
        Commands::GenerateHigherLevel {
            output_dir,
            template,
            block,
            run_pair,
            subjects,
            tasks,
            ..
        } => {
            let &[a, b] = run_pair.as_slice() else {
                return Err(anyhow!("--run-pair takes exactly two run numbers"));
            };
            let layout = Layout::new(PathBuf::new(), &output_dir);
            let req = fmri_runner::HigherLevelRequest {
                layout,
                block,
                template,
                run_pair: (a, b),
                subjects: resolve_subjects(&subjects),
                tasks: (!tasks.is_empty()).then_some(tasks),
            };
            let generated = fmri_runner::generate_higher_level_designs(&req, &PlaceholderEngine)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "generate-higher-level",
                    "result": generated,
                })));
            }
            print_paths("generated", &generated);
        }
        Commands::Feat {
            mut designs,
            design_dir,
            emit_commands,
            dry_run,
            force,
            log_file,
            ..
        } => {
            let config = load_config(common, None)?;
            if let Some(dir) = &design_dir {
                designs.extend(collect_designs(dir, None, &Default::default()));
            }
            if designs.is_empty() {
                return Err(anyhow!("no design documents given"));
            }
            let opts = DispatchOptions {
                binary: config.binaries.feat.clone(),
                max_workers: config.max_workers,
                mode: match emit_commands {
                    Some(path) => DispatchMode::EmitCommands(path),
                    None => DispatchMode::Execute,
                },
                dry_run,
                force,
                log_file,
            };
            let report = fmri_runner::dispatch_designs(&designs, &opts, &SystemRunner)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "feat",
                    "result": report,
                })));
            }
            print_dispatch(&report);
        }
        Commands::MotionOutliers {
            input_dir,
            output_dir,
            selection,
            settings_dir,
            dry_run,
            log_file,
            ..
        } => {
            let config = load_config(common, settings_dir.as_deref())?;
            let req = fmri_runner::MotionOutlierRequest {
                input_root: input_dir,
                output_root: output_dir,
                subjects: selection.subjects(),
                tasks: selection.tasks(),
                runs: selection.runs(),
            };
            let opts = StageOptions { dry_run, log_file };
            let report = fmri_runner::run_motion_outliers(&req, &config, &NiftiHeaderReader, &SystemRunner, &opts)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "motion-outliers",
                    "result": report,
                })));
            }
            print_stage(&report);
        }
        Commands::Skullstrip {
            input_dir,
            output_dir,
            subjects,
            dry_run,
            log_file,
            ..
        } => {
            let config = load_config(common, None)?;
            let req = fmri_runner::SkullStripRequest {
                input_root: input_dir,
                output_root: output_dir,
                subjects: resolve_subjects(&subjects),
            };
            let opts = StageOptions { dry_run, log_file };
            let report = fmri_runner::run_skull_strip(&req, &config, &SystemRunner, &opts)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "skullstrip",
                    "result": report,
                })));
            }
            print_stage(&report);
        }
        Commands::Run {
            input_dir,
            output_dir,
            template,
            higher_level_template,
            selection,
            custom_blocks,
            custom_block_dir,
            settings_dir,
            skip_motion_outliers,
            skip_skullstrip,
            emit_commands,
            dry_run,
            force,
            ..
        } => {
            let config = load_config(common, settings_dir.as_deref())?;
            let opts = fmri_runner::PipelineOptions {
                input_root: input_dir,
                output_root: output_dir,
                subjects: selection.subjects(),
                tasks: selection.tasks.clone(),
                runs: selection.runs.clone(),
                template,
                higher_level_template,
                custom_blocks,
                custom_block_dir,
                motion_outliers: !skip_motion_outliers,
                skull_strip: !skip_skullstrip,
                dry_run,
                force,
                emit_commands,
            };
            let report = fmri_runner::run_pipeline(
                &opts,
                &config,
                &NiftiHeaderReader,
                &PlaceholderEngine,
                &SystemRunner,
            )?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "result": report,
                })));
            }
            if let Some(log) = &report.log_file {
                println!("log_file: {}", log.display());
            }
            if let Some(stage) = &report.motion_outliers {
                println!("motion_outliers:");
                print_stage(stage);
            }
            if let Some(stage) = &report.skull_strip {
                println!("skullstrip:");
                print_stage(stage);
            }
            println!("configurations_written: {}", report.extraction.written.len());
            println!("designs_generated: {}", report.designs.len());
            println!("first_level:");
            print_dispatch(&report.first_level);
            println!("higher_level_designs_generated: {}", report.higher_level_designs.len());
            if let Some(higher) = &report.higher_level {
                println!("higher_level:");
                print_dispatch(higher);
            }
        }
    }
    Ok(None)
}

fn print_paths(label: &str, paths: &[PathBuf]) {
    println!("{}: {}", label, paths.len());
    for path in paths {
        println!("  {}", path.display());
    }
}

fn print_stage(report: &StageReport) {
    println!("existing: {}", report.existing.len());
    println!("jobs: {}", report.outcomes.len());
}

fn print_dispatch(report: &DispatchReport) {
    if let Some(path) = &report.emitted_to {
        println!("commands_written_to: {}", path.display());
        return;
    }
    println!("completed: {}", report.count(JobStatus::Completed));
    println!("already_complete: {}", report.count(JobStatus::AlreadyComplete));
    println!("rehearsed: {}", report.count(JobStatus::Rehearsed));
}

fn error_details(err: &anyhow::Error) -> Value {
    match err.downcast_ref::<fmri_runner::DispatchError>() {
        Some(fmri_runner::DispatchError::JobsFailed { failures, .. }) => json!({ "failures": failures }),
        _ => json!({}),
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}
