//! Higher-level designs combining two completed first-level runs.

use anyhow::Result;
use fmri_core::layout::{run_pair_stem, with_prefix};
use fmri_core::template::unbound_variables;
use fmri_core::{
    load_template, require_absent, write_new_atomic, Layout, Resolved, SkipKind, TemplateEngine,
    TemplateVars, WriteOutcome,
};
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{info, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FirstLevelDir {
    pub path: PathBuf,
    pub subject: String,
    pub session: String,
    pub task: String,
    pub run: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunPairing {
    pub subject: String,
    pub session: String,
    pub task: String,
    pub pair: (u32, u32),
    pub path_a: PathBuf,
    pub path_b: PathBuf,
}

fn first_level_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?P<subject>sub-[^_]+)_(?P<session>ses-[^_]+)_task-(?P<task>[^_]+)_run-(?P<run>\d+)")
            .unwrap_or_else(|e| panic!("first-level directory pattern must compile: {}", e))
    })
}

/// Parse a first-level output directory name such as
/// `sub-001_ses-01_task-hand_run-02.feat`. Subject and session keep their
/// prefixes, matching the directory tree they came from.
pub fn parse_first_level_dir_name(name: &str) -> Option<(String, String, String, u32)> {
    let caps = first_level_pattern().captures(name)?;
    let run = caps["run"].parse::<u32>().ok()?;
    Some((
        caps["subject"].to_string(),
        caps["session"].to_string(),
        caps["task"].to_string(),
        run,
    ))
}

/// Every first-level output directory below `root` passing the filters.
/// Matched directories are not descended into.
pub fn collect_first_level_dirs(
    root: &Path,
    subjects: Option<&[String]>,
    tasks: Option<&[String]>,
) -> Vec<FirstLevelDir> {
    let mut entries = Vec::new();
    if !root.is_dir() {
        warn!(path = %root.display(), "first-level output directory not found");
        return entries;
    }
    let subjects: Option<Vec<String>> =
        subjects.map(|s| s.iter().map(|x| with_prefix(x, "sub-")).collect());

    let mut walker = WalkDir::new(root).min_depth(1).sort_by_file_name().into_iter();
    while let Some(entry) = walker.next() {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "unreadable entry under first-level outputs");
                continue;
            }
        };
        if !entry.file_type().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        let Some((subject, session, task, run)) = parse_first_level_dir_name(&name) else {
            continue;
        };
        walker.skip_current_dir();
        if subjects.as_ref().is_some_and(|s| !s.contains(&subject)) {
            continue;
        }
        if tasks.is_some_and(|t| !t.is_empty() && !t.iter().any(|x| *x == task)) {
            continue;
        }
        entries.push(FirstLevelDir {
            path: entry.path().to_path_buf(),
            subject,
            session,
            task,
            run,
        });
    }
    entries
}

/// Group by (subject, session, task) and pair runs `a` and `b`. Groups
/// missing either run are reported as skips naming the absent run(s).
pub fn pair_runs(entries: &[FirstLevelDir], pair: (u32, u32)) -> Vec<Resolved<RunPairing>> {
    let mut grouped: BTreeMap<(String, String, String), BTreeMap<u32, PathBuf>> = BTreeMap::new();
    for e in entries {
        grouped
            .entry((e.subject.clone(), e.session.clone(), e.task.clone()))
            .or_default()
            .insert(e.run, e.path.clone());
    }

    let (a, b) = pair;
    grouped
        .into_iter()
        .map(|((subject, session, task), runs)| match (runs.get(&a), runs.get(&b)) {
            (Some(path_a), Some(path_b)) => Resolved::Found(RunPairing {
                path_a: path_a.clone(),
                path_b: path_b.clone(),
                subject,
                session,
                task,
                pair,
            }),
            _ => {
                let missing: Vec<String> = [a, b]
                    .iter()
                    .filter(|r| !runs.contains_key(*r))
                    .map(|r| r.to_string())
                    .collect();
                Resolved::skipped(
                    SkipKind::MissingDependency,
                    format!(
                        "no pair for {} {} task-{}, missing runs: {}",
                        subject,
                        session,
                        task,
                        missing.join(", ")
                    ),
                )
            }
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct HigherLevelRequest {
    pub layout: Layout,
    /// First-level outputs are read from this block's tree; non-standard
    /// blocks suffix the higher-level names.
    pub block: String,
    pub template: PathBuf,
    pub run_pair: (u32, u32),
    pub subjects: Option<Vec<String>>,
    pub tasks: Option<Vec<String>>,
}

/// Render one higher-level design per complete run pair. Only documents
/// written by this call are returned.
pub fn generate_higher_level_designs(
    req: &HigherLevelRequest,
    engine: &dyn TemplateEngine,
) -> Result<Vec<PathBuf>> {
    let template = load_template(&req.template)?;
    let mut generated = Vec::new();

    let first_level_root = req.layout.first_level_root(&req.block);
    let entries = collect_first_level_dirs(&first_level_root, req.subjects.as_deref(), req.tasks.as_deref());
    if entries.is_empty() {
        info!(path = %first_level_root.display(), "no first-level output directories found");
        return Ok(generated);
    }

    for resolved in pair_runs(&entries, req.run_pair) {
        let Some(pairing) = resolved.or_log("run pair") else {
            continue;
        };
        let base = run_pair_stem(&pairing.subject, &pairing.session, &pairing.task, pairing.pair);
        let output_dir = req
            .layout
            .higher_level_output(&pairing.subject, &pairing.session, &base, &req.block);
        let design = req
            .layout
            .higher_level_design(&pairing.subject, &pairing.session, &base, &req.block);
        let Some(design) = require_absent(&design, "higher-level design").or_log(&base) else {
            continue;
        };

        let mut vars = TemplateVars::new();
        vars.insert("OUTPUT_DIRECTORY".to_string(), output_dir.to_string_lossy().to_string());
        vars.insert("FEAT_DIRECTORY_RUN_1".to_string(), pairing.path_a.to_string_lossy().to_string());
        vars.insert("FEAT_DIRECTORY_RUN_2".to_string(), pairing.path_b.to_string_lossy().to_string());
        let unbound = unbound_variables(&template, &vars);
        if !unbound.is_empty() {
            warn!(design = %design.display(), variables = ?unbound, "template variables left unbound");
        }

        match write_new_atomic(&design, engine.render(&template, &vars).as_bytes())? {
            WriteOutcome::Written => {
                info!(path = %design.display(), "generated higher-level design");
                generated.push(design);
            }
            WriteOutcome::AlreadyExists => {
                info!(path = %design.display(), "higher-level design appeared concurrently, skipping");
            }
        }
    }
    Ok(generated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fmri_core::PlaceholderEngine;
    use std::fs;
    use tracing_test::traced_test;

    const TEMPLATE: &str = "set fmri(outputdir) {{ OUTPUT_DIRECTORY }}\nset feat_files(1) {{ FEAT_DIRECTORY_RUN_1 }}\nset feat_files(2) {{ FEAT_DIRECTORY_RUN_2 }}\n";

    struct Fixture {
        dir: tempfile::TempDir,
        req: HigherLevelRequest,
    }

    fn fixture(runs: &[u32]) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = Layout::new(dir.path().join("in"), dir.path().join("out"));
        let first = layout.first_level_root("standard");
        for run in runs {
            fs::create_dir_all(first.join(format!(
                "sub-001/ses-001/sub-001_ses-001_task-hand_run-{:02}.feat/stats",
                run
            )))
            .expect("mkdir");
        }
        let template = dir.path().join("templates/higher_level.fsf");
        fs::create_dir_all(template.parent().expect("parent")).expect("mkdir");
        fs::write(&template, TEMPLATE).expect("template");
        let req = HigherLevelRequest {
            layout,
            block: "standard".to_string(),
            template,
            run_pair: (1, 2),
            subjects: None,
            tasks: None,
        };
        Fixture { dir, req }
    }

    fn expected_design(f: &Fixture) -> PathBuf {
        f.dir.path().join(
            "out/fsl_feat_v6.0.7.4/higher_level_designs/sub-001/ses-001/sub-001_ses-001_task-hand_runs-01-02.fsf",
        )
    }

    #[test]
    fn parses_first_level_dir_names() {
        assert_eq!(
            parse_first_level_dir_name("sub-001_ses-01_task-hand_run-02.feat"),
            Some(("sub-001".to_string(), "ses-01".to_string(), "hand".to_string(), 2))
        );
        assert_eq!(parse_first_level_dir_name("sub-001_task-hand_run-02"), None);
        assert_eq!(parse_first_level_dir_name("logs"), None);
    }

    #[test]
    fn complete_pair_produces_one_design() {
        let f = fixture(&[1, 2]);
        let generated = generate_higher_level_designs(&f.req, &PlaceholderEngine).expect("generate");
        assert_eq!(generated, vec![expected_design(&f)]);
        let content = fs::read_to_string(&generated[0]).expect("read");
        let first = f.req.layout.first_level_root("standard");
        let run_01 = first.join("sub-001/ses-001/sub-001_ses-001_task-hand_run-01.feat");
        let run_02 = first.join("sub-001/ses-001/sub-001_ses-001_task-hand_run-02.feat");
        assert!(content.contains(&format!("feat_files(1) {}\n", run_01.display())));
        assert!(content.contains(&format!("feat_files(2) {}\n", run_02.display())));
        assert!(content.contains(
            "higher_level_outputs/sub-001/ses-001/sub-001_ses-001_task-hand_runs-01-02.gfeat\n"
        ));
    }

    #[test]
    fn custom_block_reads_its_tree_and_suffixes_names() {
        let f = fixture(&[]);
        let first = f.req.layout.first_level_root("inverted");
        for run in [1, 2] {
            fs::create_dir_all(first.join(format!(
                "sub-001/ses-001/sub-001_ses-001_task-hand_run-{:02}_inverted.feat/stats",
                run
            )))
            .expect("mkdir");
        }
        let mut req = f.req.clone();
        req.block = "inverted".to_string();
        let generated = generate_higher_level_designs(&req, &PlaceholderEngine).expect("generate");
        assert_eq!(
            generated,
            vec![f.dir.path().join(
                "out/fsl_feat_v6.0.7.4/higher_level_designs/sub-001/ses-001/sub-001_ses-001_task-hand_runs-01-02_inverted.fsf"
            )]
        );
        let content = fs::read_to_string(&generated[0]).expect("read");
        assert!(content.contains("higher_level_outputs/sub-001/ses-001/sub-001_ses-001_task-hand_runs-01-02_inverted.gfeat\n"));
        assert!(content.contains("run-01_inverted.feat\n"));
    }

    #[traced_test]
    #[test]
    fn unbound_template_variables_are_reported() {
        let f = fixture(&[1, 2]);
        let mut text = fs::read_to_string(&f.req.template).expect("read");
        text.push_str("set fmri(regstandard) {{ STANDARD_BRAIN }}\n");
        fs::write(&f.req.template, text).expect("write");
        let generated = generate_higher_level_designs(&f.req, &PlaceholderEngine).expect("generate");
        assert_eq!(generated.len(), 1);
        assert!(logs_contain("template variables left unbound"));
        assert!(logs_contain("STANDARD_BRAIN"));
    }

    #[traced_test]
    #[test]
    fn partial_pair_is_skipped_with_missing_run_named() {
        let f = fixture(&[1]);
        let generated = generate_higher_level_designs(&f.req, &PlaceholderEngine).expect("generate");
        assert!(generated.is_empty());
        assert!(!expected_design(&f).exists());
        assert!(logs_contain("missing runs: 2"));
    }

    #[test]
    fn pair_order_is_preserved_in_names() {
        let mut f = fixture(&[1, 2]);
        f.req.run_pair = (2, 1);
        let generated = generate_higher_level_designs(&f.req, &PlaceholderEngine).expect("generate");
        assert_eq!(generated.len(), 1);
        assert!(generated[0].ends_with("sub-001_ses-001_task-hand_runs-02-01.fsf"));
        let content = fs::read_to_string(&generated[0]).expect("read");
        assert!(content.contains("feat_files(1) ") && content.contains("run-02.feat\nset feat_files(2)"));
    }

    #[test]
    fn existing_design_is_not_regenerated() {
        let f = fixture(&[1, 2]);
        fs::create_dir_all(expected_design(&f).parent().expect("parent")).expect("mkdir");
        fs::write(expected_design(&f), "hand edited").expect("write");
        let generated = generate_higher_level_designs(&f.req, &PlaceholderEngine).expect("generate");
        assert!(generated.is_empty());
        assert_eq!(fs::read_to_string(expected_design(&f)).expect("read"), "hand edited");
    }

    #[test]
    fn subject_and_task_filters_apply() {
        let mut f = fixture(&[1, 2]);
        f.req.subjects = Some(vec!["002".to_string()]);
        assert!(generate_higher_level_designs(&f.req, &PlaceholderEngine)
            .expect("generate")
            .is_empty());
        f.req.subjects = Some(vec!["001".to_string()]);
        f.req.tasks = Some(vec!["language".to_string()]);
        assert!(generate_higher_level_designs(&f.req, &PlaceholderEngine)
            .expect("generate")
            .is_empty());
        f.req.tasks = Some(vec!["hand".to_string()]);
        assert_eq!(
            generate_higher_level_designs(&f.req, &PlaceholderEngine)
                .expect("generate")
                .len(),
            1
        );
    }

    #[test]
    fn pair_runs_groups_by_subject_session_task() {
        let mk = |sub: &str, task: &str, run: u32| FirstLevelDir {
            path: PathBuf::from(format!("/o/{}_{}_{}", sub, task, run)),
            subject: sub.to_string(),
            session: "ses-01".to_string(),
            task: task.to_string(),
            run,
        };
        let entries = vec![
            mk("sub-001", "hand", 1),
            mk("sub-001", "hand", 2),
            mk("sub-001", "lang", 1),
            mk("sub-002", "hand", 2),
        ];
        let results = pair_runs(&entries, (1, 2));
        let found = results.iter().filter(|r| r.is_found()).count();
        assert_eq!(results.len(), 3);
        assert_eq!(found, 1);
    }
}
