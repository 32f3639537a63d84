//! Subject/session/task/run identifiers embedded in scan paths.
//!
//! Entities are never stored on their own; they are recomputed from a path
//! each time a stage needs them.

use regex::Regex;
use std::fmt;
use std::path::Path;
use std::sync::OnceLock;

/// Suffix shared by every functional scan the pipeline consumes.
pub const BOLD_SUFFIX: &str = "_bold.nii.gz";

/// Labels are stored without their `sub-`/`ses-`/`task-` prefix.
///
/// `run == None` means the file carries no run label at all, which is a
/// legitimate value for studies that never number their runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntitySet {
    pub subject: Option<String>,
    pub session: Option<String>,
    pub task: Option<String>,
    pub run: Option<u32>,
}

struct EntityPatterns {
    subject: Regex,
    session: Regex,
    task: Regex,
    run: Regex,
}

// Each pattern consumes its trailing separator.
fn patterns() -> &'static EntityPatterns {
    static PATTERNS: OnceLock<EntityPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let build = |key: &str, body: &str| {
            Regex::new(&format!(r"(?:^|[/_]){}-({})(?:$|[/_])", key, body))
                .unwrap_or_else(|e| panic!("entity pattern for {} must compile: {}", key, e))
        };
        EntityPatterns {
            subject: build("sub", "[A-Za-z0-9]+"),
            session: build("ses", "[A-Za-z0-9]+"),
            task: build("task", "[A-Za-z0-9]+"),
            run: build("run", "[0-9]+"),
        }
    })
}

fn capture(re: &Regex, haystack: &str) -> Option<String> {
    re.captures(haystack)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Extract entities from a path or bare filename. Pure; never fails.
pub fn parse_entities(path: impl AsRef<Path>) -> EntitySet {
    let s = path.as_ref().to_string_lossy();
    let p = patterns();
    EntitySet {
        subject: capture(&p.subject, &s),
        session: capture(&p.session, &s),
        task: capture(&p.task, &s),
        // A run token that overflows is treated as absent, not as an error.
        run: capture(&p.run, &s).and_then(|r| r.parse::<u32>().ok()),
    }
}

/// Zero-padded run label as it appears in filenames (`run-01`).
pub fn run_label(run: u32) -> String {
    format!("run-{:02}", run)
}

impl EntitySet {
    pub fn new(subject: &str, session: &str, task: &str, run: Option<u32>) -> Self {
        Self {
            subject: Some(strip_entity_prefix(subject, "sub-").to_string()),
            session: Some(strip_entity_prefix(session, "ses-").to_string()),
            task: Some(strip_entity_prefix(task, "task-").to_string()),
            run,
        }
    }

    /// `sub-X_ses-Y_task-Z[_run-NN]`, skipping entities that are absent.
    pub fn stem(&self) -> String {
        let mut parts = Vec::new();
        if let Some(s) = &self.subject {
            parts.push(format!("sub-{}", s));
        }
        if let Some(s) = &self.session {
            parts.push(format!("ses-{}", s));
        }
        if let Some(t) = &self.task {
            parts.push(format!("task-{}", t));
        }
        if let Some(r) = self.run {
            parts.push(run_label(r));
        }
        parts.join("_")
    }

    pub fn scan_filename(&self) -> String {
        format!("{}{}", self.stem(), BOLD_SUFFIX)
    }
}

impl fmt::Display for EntitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.stem())
    }
}

pub fn strip_entity_prefix<'a>(value: &'a str, prefix: &str) -> &'a str {
    value.strip_prefix(prefix).unwrap_or(value)
}

/// Selection criteria applied to an [`EntitySet`].
///
/// Dimensions combine with AND; the task and run lists match with OR. An
/// absent or empty dimension accepts anything, including missing values. A
/// `None` inside `runs` selects scans that carry no run label.
#[derive(Debug, Clone, Default)]
pub struct EntityFilter {
    pub subject: Option<String>,
    pub session: Option<String>,
    pub tasks: Option<Vec<String>>,
    pub runs: Option<Vec<Option<u32>>>,
}

impl EntityFilter {
    pub fn matches(&self, entities: &EntitySet) -> bool {
        match_filters(
            entities,
            self.subject.as_deref(),
            self.session.as_deref(),
            self.tasks.as_deref(),
            self.runs.as_deref(),
        )
    }
}

pub fn match_filters(
    entities: &EntitySet,
    subject: Option<&str>,
    session: Option<&str>,
    task_filters: Option<&[String]>,
    run_filters: Option<&[Option<u32>]>,
) -> bool {
    if let Some(want) = subject.filter(|s| !s.is_empty()) {
        if entities.subject.as_deref() != Some(strip_entity_prefix(want, "sub-")) {
            return false;
        }
    }
    if let Some(want) = session.filter(|s| !s.is_empty()) {
        if entities.session.as_deref() != Some(strip_entity_prefix(want, "ses-")) {
            return false;
        }
    }
    if let Some(tasks) = task_filters.filter(|t| !t.is_empty()) {
        match &entities.task {
            Some(t) => {
                if !tasks.iter().any(|f| strip_entity_prefix(f, "task-") == t) {
                    return false;
                }
            }
            None => return false,
        }
    }
    if let Some(runs) = run_filters.filter(|r| !r.is_empty()) {
        return match entities.run {
            None => runs.iter().any(|r| r.is_none()),
            Some(actual) => runs.iter().any(|r| *r == Some(actual)),
        };
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_scan_path() {
        let e = parse_entities(
            "/data/sub-001/ses-01/func/sub-001_ses-01_task-hand_run-02_bold.nii.gz",
        );
        assert_eq!(e.subject.as_deref(), Some("001"));
        assert_eq!(e.session.as_deref(), Some("01"));
        assert_eq!(e.task.as_deref(), Some("hand"));
        assert_eq!(e.run, Some(2));
    }

    #[test]
    fn missing_entities_are_none() {
        let e = parse_entities("sub-001_task-rest_bold.nii.gz");
        assert_eq!(e.subject.as_deref(), Some("001"));
        assert_eq!(e.session, None);
        assert_eq!(e.task.as_deref(), Some("rest"));
        assert_eq!(e.run, None);
        assert_eq!(parse_entities("random_file.txt"), EntitySet::default());
    }

    #[test]
    fn tokens_must_be_whole_segments() {
        assert_eq!(parse_entities("xsub-001_task-a").subject, None);
        assert_eq!(parse_entities("sub-001_prerun-3_bold").run, None);
        assert_eq!(parse_entities("sub-001_run-1x_bold").run, None);
        assert_eq!(parse_entities("sub-001_run-10_bold").run, Some(10));
    }

    #[test]
    fn later_valid_token_is_found_after_invalid_one() {
        assert_eq!(parse_entities("run-1x_run-3_bold").run, Some(3));
    }

    #[test]
    fn overflowing_run_yields_none() {
        assert_eq!(parse_entities("sub-1_run-99999999999999999999_bold").run, None);
    }

    #[test]
    fn scan_filename_round_trips() {
        for run in [None, Some(1), Some(7), Some(12), Some(150)] {
            let e = EntitySet::new("sub-001", "ses-02", "hand", run);
            assert_eq!(parse_entities(e.scan_filename()), e, "run {:?}", run);
        }
    }

    #[test]
    fn stem_zero_pads_runs() {
        let e = EntitySet::new("001", "01", "task-hand", Some(3));
        assert_eq!(e.stem(), "sub-001_ses-01_task-hand_run-03");
        assert_eq!(EntitySet::new("001", "01", "hand", None).stem(), "sub-001_ses-01_task-hand");
    }

    #[test]
    fn null_run_matches_only_when_requested() {
        let e = EntitySet::new("001", "01", "rest", None);
        assert!(match_filters(&e, None, None, None, Some(&[None])));
        assert!(match_filters(&e, None, None, None, Some(&[Some(1), None])));
        assert!(!match_filters(&e, None, None, None, Some(&[Some(1)])));
        assert!(match_filters(&e, None, None, None, None));
    }

    #[test]
    fn numeric_run_matches_listed_values() {
        let e = EntitySet::new("001", "01", "hand", Some(2));
        assert!(match_filters(&e, None, None, None, Some(&[Some(1), Some(2)])));
        assert!(!match_filters(&e, None, None, None, Some(&[Some(1)])));
        assert!(!match_filters(&e, None, None, None, Some(&[None])));
        assert!(match_filters(&e, None, None, None, Some(&[])));
    }

    #[test]
    fn dimensions_combine_with_and() {
        let e = EntitySet::new("001", "01", "hand", Some(1));
        let tasks = vec!["language".to_string(), "hand".to_string()];
        assert!(match_filters(&e, Some("sub-001"), Some("ses-01"), Some(&tasks), Some(&[Some(1)])));
        assert!(!match_filters(&e, Some("sub-002"), None, Some(&tasks), None));
        assert!(!match_filters(&e, None, Some("02"), None, None));
        let other = vec!["rest".to_string()];
        assert!(!match_filters(&e, None, None, Some(&other), None));
    }

    #[test]
    fn task_filter_rejects_missing_task() {
        let e = parse_entities("sub-001_bold.nii.gz");
        let filter = EntityFilter {
            tasks: Some(vec!["hand".to_string()]),
            ..Default::default()
        };
        assert!(!filter.matches(&e));
        assert!(EntityFilter::default().matches(&e));
    }
}
