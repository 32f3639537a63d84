//! First-level design synthesis: one rendered document per scan and block.

use anyhow::Result;
use fmri_core::layout::{block_stem, STANDARD_BLOCK};
use fmri_core::template::unbound_variables;
use fmri_core::{
    load_template, require_absent, require_path, write_new_atomic, EntityFilter, EntitySet, Layout,
    Resolved, SkipKind, TemplateEngine, TemplateVars, WriteOutcome,
};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use crate::discover::{session_dirs, session_functional_scans, subject_dirs};
use crate::params::read_record;

pub const CUSTOM_BLOCK_SUFFIX: &str = "_config.txt";
pub const REST_TASK: &str = "rest";

#[derive(Debug, Clone, Default)]
pub struct DesignRequest {
    pub template: PathBuf,
    pub output_root: PathBuf,
    pub input_root: PathBuf,
    pub task: String,
    /// Empty means `["standard"]`.
    pub custom_blocks: Vec<String>,
    /// Where `<block>_config.txt` files live; defaults to the template's directory.
    pub custom_block_dir: Option<PathBuf>,
    pub subjects: Option<Vec<String>>,
    /// Empty means every run found among the session's scans for the task.
    pub runs: Vec<Option<u32>>,
}

impl DesignRequest {
    pub fn blocks(&self) -> Vec<String> {
        if self.custom_blocks.is_empty() {
            vec![STANDARD_BLOCK.to_string()]
        } else {
            self.custom_blocks.clone()
        }
    }

    fn block_dir(&self) -> PathBuf {
        self.custom_block_dir.clone().unwrap_or_else(|| {
            self.template
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."))
        })
    }
}

/// `CUSTOM_DESIGN_FILE` for `block`: empty for the standard block.
fn resolve_block_file(req: &DesignRequest, block: &str) -> Resolved<String> {
    if block == STANDARD_BLOCK {
        return Resolved::Found(String::new());
    }
    if req.task.eq_ignore_ascii_case(REST_TASK) {
        return Resolved::skipped(
            SkipKind::NotApplicable,
            format!("custom block '{}' has no task regressors for resting state", block),
        );
    }
    let file = req.block_dir().join(format!("{}{}", block, CUSTOM_BLOCK_SUFFIX));
    require_path(&file, "custom block file").map(|p| p.to_string_lossy().to_string())
}

fn runs_for_session(req: &DesignRequest, session: &Path) -> Result<Vec<Option<u32>>> {
    if !req.runs.is_empty() {
        return Ok(req.runs.clone());
    }
    let filter = EntityFilter {
        tasks: Some(vec![req.task.clone()]),
        ..Default::default()
    };
    let found: BTreeSet<Option<u32>> = session_functional_scans(session, &filter)?
        .into_iter()
        .map(|s| s.entities.run)
        .collect();
    Ok(found.into_iter().collect())
}

fn dir_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Render first-level designs for every subject, session, run and block.
///
/// Scans without a configuration record are skipped with a warning. Existing
/// design files are left alone and are not part of the returned list, which
/// holds only documents written by this call.
pub fn generate_design_files(
    req: &DesignRequest,
    engine: &dyn TemplateEngine,
) -> Result<Vec<PathBuf>> {
    let template = load_template(&req.template)?;
    let layout = Layout::new(&req.input_root, &req.output_root);
    let blocks = req.blocks();
    let mut generated = Vec::new();

    for subject in subject_dirs(&req.input_root, req.subjects.as_deref())? {
        for session in session_dirs(&subject)? {
            for run in runs_for_session(req, &session)? {
                let entities = EntitySet::new(&dir_name(&subject), &dir_name(&session), &req.task, run);
                let unit = entities.stem();
                let Some(record_path) =
                    require_path(layout.configuration_record(&entities), "configuration record")
                        .or_log(&unit)
                else {
                    continue;
                };
                let params = match read_record(&record_path) {
                    Ok(p) => p,
                    Err(e) => {
                        error!(unit = %unit, error = %format!("{:#}", e), "unreadable configuration record, skipping");
                        continue;
                    }
                };

                let confounds = layout.confounds(&entities);
                let use_confounds = confounds.exists();

                for block in &blocks {
                    let block_unit = block_stem(&entities, block);
                    let design = layout.first_level_design(&entities, block);
                    let resolved = resolve_block_file(req, block)
                        .and_then(|custom| require_absent(&design, "design file").map(|_| custom));
                    let Some(custom_file) = resolved.or_log(&block_unit) else {
                        continue;
                    };

                    let mut vars: TemplateVars = params.clone();
                    let mut set = |k: &str, v: String| {
                        vars.insert(k.to_string(), v);
                    };
                    set("OUTPUT_DIRECTORY", path_str(&layout.first_level_output(&entities, block)));
                    set("FULL_STRUCTURAL_PATH", path_str(&layout.structural_image(&entities)));
                    set("FULL_FUNCTIONAL_PATH", path_str(&layout.functional_image(&entities)));
                    set("CUSTOM_DESIGN_FILE", custom_file);
                    set("fmri_confoundevs", if use_confounds { "1" } else { "0" }.to_string());
                    set(
                        "FULL_CONFOUND_PATH",
                        if use_confounds { path_str(&confounds) } else { String::new() },
                    );
                    set("FUNCTIONAL_TASK_NAME", req.task.clone());

                    let unbound = unbound_variables(&template, &vars);
                    if !unbound.is_empty() {
                        warn!(unit = %block_unit, variables = ?unbound, "template variables left unbound");
                    }
                    let rendered = engine.render(&template, &vars);
                    match write_new_atomic(&design, rendered.as_bytes())? {
                        WriteOutcome::Written => {
                            info!(path = %design.display(), confounds = use_confounds, "generated design file");
                            generated.push(design);
                        }
                        WriteOutcome::AlreadyExists => {
                            info!(path = %design.display(), "design file appeared concurrently, skipping");
                        }
                    }
                }
            }
        }
    }
    Ok(generated)
}

fn path_str(p: &Path) -> String {
    p.to_string_lossy().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use fmri_core::PlaceholderEngine;
    use std::fs;
    use tracing_test::traced_test;

    const RECORD: &str = "TOTAL_REPETITION_TIME = 2.0\nTOTAL_FRAMES = 150\nDISCARD_FRAMES = 2\nCRITICAL_Z = 2.3\nSMOOTHING_KERNEL = 4\nPROB_THRESHOLD = 0.05\nZ_THRESHOLD = 3.1\nZ_MINIMUM = 3.1\n";
    const TEMPLATE: &str = "set fmri(outputdir) {{ OUTPUT_DIRECTORY }}\nset fmri(tr) {{ TOTAL_REPETITION_TIME }}\nset fmri(npts) {{ TOTAL_FRAMES }}\nset fmri(ndelete) {{ DISCARD_FRAMES }}\nset fmri(custom) {{ CUSTOM_DESIGN_FILE }}\nset fmri(confoundevs) {{ fmri_confoundevs }}\nset confoundev_files(1) \"{{ FULL_CONFOUND_PATH }}\"\nset feat_files(1) \"{{ FULL_FUNCTIONAL_PATH }}\"\nset highres_files(1) \"{{ FULL_STRUCTURAL_PATH }}\"\n# task {{ FUNCTIONAL_TASK_NAME }}\n";

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, content).expect("write");
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        req: DesignRequest,
    }

    fn fixture(task: &str, runs: Vec<Option<u32>>) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("input");
        let output = dir.path().join("output");
        let template = dir.path().join("templates/standard_design_template.fsf");
        write(&template, TEMPLATE);
        for run in [1u32, 2] {
            let stem = format!("sub-001_ses-001_task-{}_run-{:02}", task, run);
            write(&input.join(format!("sub-001/ses-001/func/{}_bold.nii.gz", stem)), "dummy");
            write(
                &output.join(format!(
                    "fsl_feat_v6.0.7.4/configurations/sub-001/ses-001/{}_configuration.md",
                    stem
                )),
                RECORD,
            );
        }
        Fixture {
            _dir: dir,
            req: DesignRequest {
                template,
                output_root: output,
                input_root: input,
                task: task.to_string(),
                runs,
                ..Default::default()
            },
        }
    }

    fn designs_dir(req: &DesignRequest) -> PathBuf {
        req.output_root.join("fsl_feat_v6.0.7.4/subject_designs")
    }

    #[test]
    fn generates_standard_design() {
        let f = fixture("hand", vec![Some(1)]);
        let generated = generate_design_files(&f.req, &PlaceholderEngine).expect("generate");
        let expected = designs_dir(&f.req).join("sub-001_ses-001_task-hand_run-01.fsf");
        assert_eq!(generated, vec![expected.clone()]);

        let content = fs::read_to_string(&expected).expect("read");
        let outdir = f
            .req
            .output_root
            .join("fsl_feat_v6.0.7.4/standard/sub-001/ses-001/sub-001_ses-001_task-hand_run-01.feat");
        assert!(content.contains(&format!("set fmri(outputdir) {}\n", outdir.display())));
        assert!(content.contains("set fmri(tr) 2.0\n"));
        assert!(content.contains("set fmri(npts) 150\n"));
        assert!(content.contains("set fmri(custom) \n"));
        assert!(content.contains("set fmri(confoundevs) 0\n"));
        assert!(content.contains("set confoundev_files(1) \"\"\n"));
        assert!(content.contains("# task hand"));
        assert!(content.contains("sub-001_ses-001_T1w_synthstrip.nii.gz"));
    }

    #[traced_test]
    #[test]
    fn missing_record_skips_with_warning() {
        let f = fixture("hand", vec![Some(3)]);
        let generated = generate_design_files(&f.req, &PlaceholderEngine).expect("generate");
        assert!(generated.is_empty());
        assert!(!designs_dir(&f.req).exists());
        assert!(logs_contain("configuration record not found"));
    }

    #[traced_test]
    #[test]
    fn unbound_template_variables_warn_but_still_render() {
        let f = fixture("hand", vec![Some(1)]);
        let generated = generate_design_files(&f.req, &PlaceholderEngine).expect("generate");
        assert_eq!(generated.len(), 1);
        assert!(!logs_contain("template variables left unbound"));

        write(&f.req.template, &format!("{}set fmri(regstandard) {{{{ STANDARD_BRAIN }}}}\n", TEMPLATE));
        let mut req = f.req.clone();
        req.runs = vec![Some(2)];
        let generated = generate_design_files(&req, &PlaceholderEngine).expect("generate");
        assert_eq!(generated.len(), 1);
        assert!(logs_contain("template variables left unbound"));
        assert!(logs_contain("STANDARD_BRAIN"));
        let content = fs::read_to_string(&generated[0]).expect("read");
        assert!(content.contains("set fmri(regstandard) \n"));
    }

    #[test]
    fn confounds_toggle_regressor() {
        let f = fixture("hand", vec![Some(1)]);
        let confounds = f.req.output_root.join(
            "fsl_motion-outliers_v6.0.7.4/sub-001/ses-001/func/sub-001_ses-001_task-hand_run-01_confounds.txt",
        );
        write(&confounds, "0 0 1\n");
        let generated = generate_design_files(&f.req, &PlaceholderEngine).expect("generate");
        let content = fs::read_to_string(&generated[0]).expect("read");
        assert!(content.contains("set fmri(confoundevs) 1\n"));
        assert!(content.contains(&format!("set confoundev_files(1) \"{}\"", confounds.display())));
    }

    #[test]
    fn two_custom_blocks_yield_two_documents() {
        let mut f = fixture("hand", vec![Some(1)]);
        let block_dir = f.req.template.parent().expect("parent").to_path_buf();
        write(&block_dir.join("inverted_config.txt"), "1 0\n");
        write(&block_dir.join("split_config.txt"), "0 1\n");
        f.req.custom_blocks = vec!["inverted".to_string(), "split".to_string()];

        let generated = generate_design_files(&f.req, &PlaceholderEngine).expect("generate");
        let dir = designs_dir(&f.req);
        assert_eq!(
            generated,
            vec![
                dir.join("sub-001_ses-001_task-hand_run-01_inverted.fsf"),
                dir.join("sub-001_ses-001_task-hand_run-01_split.fsf"),
            ]
        );
        let inverted = fs::read_to_string(&generated[0]).expect("read");
        let split = fs::read_to_string(&generated[1]).expect("read");
        assert!(inverted.contains(&format!(
            "set fmri(custom) {}",
            block_dir.join("inverted_config.txt").display()
        )));
        assert!(inverted.contains("/inverted/sub-001/ses-001/sub-001_ses-001_task-hand_run-01_inverted.feat"));
        assert!(split.contains("/split/sub-001/ses-001/sub-001_ses-001_task-hand_run-01_split.feat"));
        assert!(!dir.join("sub-001_ses-001_task-hand_run-01.fsf").exists());
    }

    #[test]
    fn missing_custom_block_file_skips_only_that_block() {
        let mut f = fixture("hand", vec![Some(1)]);
        let block_dir = f.req.template.parent().expect("parent").to_path_buf();
        write(&block_dir.join("inverted_config.txt"), "1 0\n");
        f.req.custom_blocks = vec!["inverted".to_string(), "staggered".to_string()];
        let generated = generate_design_files(&f.req, &PlaceholderEngine).expect("generate");
        assert_eq!(generated.len(), 1);
        assert!(generated[0].ends_with("sub-001_ses-001_task-hand_run-01_inverted.fsf"));
    }

    #[test]
    fn rest_task_gets_no_custom_blocks() {
        let mut f = fixture("rest", vec![Some(1)]);
        let block_dir = f.req.template.parent().expect("parent").to_path_buf();
        write(&block_dir.join("inverted_config.txt"), "1 0\n");
        f.req.custom_blocks = vec!["standard".to_string(), "inverted".to_string()];
        let generated = generate_design_files(&f.req, &PlaceholderEngine).expect("generate");
        assert_eq!(generated.len(), 1);
        assert!(generated[0].ends_with("sub-001_ses-001_task-rest_run-01.fsf"));
    }

    #[test]
    fn second_pass_is_a_no_op() {
        let f = fixture("hand", vec![Some(1), Some(2)]);
        let first = generate_design_files(&f.req, &PlaceholderEngine).expect("first");
        assert_eq!(first.len(), 2);
        let before: Vec<String> = first
            .iter()
            .map(|p| fs::read_to_string(p).expect("read"))
            .collect();
        let second = generate_design_files(&f.req, &PlaceholderEngine).expect("second");
        assert!(second.is_empty());
        let after: Vec<String> = first
            .iter()
            .map(|p| fs::read_to_string(p).expect("read"))
            .collect();
        assert_eq!(before, after);
    }

    #[test]
    fn empty_run_list_discovers_runs() {
        let f = fixture("hand", Vec::new());
        let generated = generate_design_files(&f.req, &PlaceholderEngine).expect("generate");
        let names: Vec<String> = generated
            .iter()
            .map(|p| p.file_name().expect("name").to_string_lossy().to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                "sub-001_ses-001_task-hand_run-01.fsf",
                "sub-001_ses-001_task-hand_run-02.fsf"
            ]
        );
    }

    #[test]
    fn unreadable_template_is_fatal() {
        let mut f = fixture("hand", vec![Some(1)]);
        f.req.template = f.req.template.with_file_name("missing.fsf");
        assert!(generate_design_files(&f.req, &PlaceholderEngine).is_err());
    }
}
