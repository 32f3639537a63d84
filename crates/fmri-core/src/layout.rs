//! Bit-exact directory and filename conventions shared by every stage.

use std::path::PathBuf;

use crate::entities::{EntitySet, BOLD_SUFFIX};

pub const FEAT_TOOL_DIR: &str = "fsl_feat_v6.0.7.4";
pub const MOTION_OUTLIERS_TOOL_DIR: &str = "fsl_motion-outliers_v6.0.7.4";
pub const SYNTHSTRIP_TOOL_DIR: &str = "freesurfer_synthstrip_v8.1.0";

pub const STANDARD_BLOCK: &str = "standard";
pub const CONFIGURATION_SUFFIX: &str = "_configuration.md";
pub const CONFOUNDS_SUFFIX: &str = "_confounds.txt";
pub const SYNTHSTRIP_SUFFIX: &str = "_synthstrip.nii.gz";
pub const NIFTI_GZ_SUFFIX: &str = ".nii.gz";

/// Paths derived from a scan's entities. Subject, session and task must be
/// present; callers only build these for entities parsed from scan names.
#[derive(Debug, Clone)]
pub struct Layout {
    input_root: PathBuf,
    output_root: PathBuf,
}

impl Layout {
    pub fn new(input_root: impl Into<PathBuf>, output_root: impl Into<PathBuf>) -> Self {
        Self {
            input_root: input_root.into(),
            output_root: output_root.into(),
        }
    }

    pub fn feat_root(&self) -> PathBuf {
        self.output_root.join(FEAT_TOOL_DIR)
    }

    pub fn configurations_root(&self) -> PathBuf {
        self.feat_root().join("configurations")
    }

    pub fn subject_designs_root(&self) -> PathBuf {
        self.feat_root().join("subject_designs")
    }

    /// First-level outputs for `block`; the run pairer walks this tree.
    pub fn first_level_root(&self, block: &str) -> PathBuf {
        self.feat_root().join(block)
    }

    pub fn higher_level_designs_root(&self) -> PathBuf {
        self.feat_root().join("higher_level_designs")
    }

    pub fn higher_level_outputs_root(&self) -> PathBuf {
        self.feat_root().join("higher_level_outputs")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.output_root.join("logs")
    }

    pub fn configuration_record(&self, e: &EntitySet) -> PathBuf {
        self.configuration_record_for_stem(e, &e.stem())
    }

    /// Record for a scan whose filename stem is `stem`, kept verbatim so
    /// extra entities and unpadded runs stay distinct.
    pub fn configuration_record_for_stem(&self, e: &EntitySet, stem: &str) -> PathBuf {
        self.configurations_root()
            .join(subject_dir(e))
            .join(session_dir(e))
            .join(format!("{}{}", stem, CONFIGURATION_SUFFIX))
    }

    pub fn first_level_design(&self, e: &EntitySet, block: &str) -> PathBuf {
        self.subject_designs_root()
            .join(format!("{}.fsf", block_stem(e, block)))
    }

    pub fn first_level_output(&self, e: &EntitySet, block: &str) -> PathBuf {
        self.first_level_root(block)
            .join(subject_dir(e))
            .join(session_dir(e))
            .join(format!("{}.feat", block_stem(e, block)))
    }

    pub fn functional_image(&self, e: &EntitySet) -> PathBuf {
        self.input_root
            .join(subject_dir(e))
            .join(session_dir(e))
            .join("func")
            .join(format!("{}{}", e.stem(), BOLD_SUFFIX))
    }

    pub fn structural_image(&self, e: &EntitySet) -> PathBuf {
        let base = format!("{}_{}_T1w", subject_dir(e), session_dir(e));
        self.output_root
            .join(SYNTHSTRIP_TOOL_DIR)
            .join(subject_dir(e))
            .join(session_dir(e))
            .join("anat")
            .join(format!("{}{}", base, SYNTHSTRIP_SUFFIX))
    }

    pub fn confounds(&self, e: &EntitySet) -> PathBuf {
        self.confounds_for_stem(e, &e.stem())
    }

    pub fn confounds_for_stem(&self, e: &EntitySet, stem: &str) -> PathBuf {
        self.output_root
            .join(MOTION_OUTLIERS_TOOL_DIR)
            .join(subject_dir(e))
            .join(session_dir(e))
            .join("func")
            .join(format!("{}{}", stem, CONFOUNDS_SUFFIX))
    }

    /// `<designs>/<sub>/<ses>/<base>[_<block>].fsf`
    pub fn higher_level_design(&self, subject: &str, session: &str, base: &str, block: &str) -> PathBuf {
        self.higher_level_designs_root()
            .join(with_prefix(subject, "sub-"))
            .join(with_prefix(session, "ses-"))
            .join(format!("{}.fsf", with_block(base, block)))
    }

    /// `<outputs>/<sub>/<ses>/<base>[_<block>].gfeat`
    pub fn higher_level_output(&self, subject: &str, session: &str, base: &str, block: &str) -> PathBuf {
        self.higher_level_outputs_root()
            .join(with_prefix(subject, "sub-"))
            .join(with_prefix(session, "ses-"))
            .join(format!("{}.gfeat", with_block(base, block)))
    }
}

/// `sub-S_ses-E_task-T_runs-AA-BB`, the base name of higher-level artifacts.
pub fn run_pair_stem(subject: &str, session: &str, task: &str, pair: (u32, u32)) -> String {
    format!(
        "{}_{}_task-{}_runs-{:02}-{:02}",
        with_prefix(subject, "sub-"),
        with_prefix(session, "ses-"),
        task,
        pair.0,
        pair.1
    )
}

pub fn block_stem(e: &EntitySet, block: &str) -> String {
    with_block(&e.stem(), block)
}

/// Appends `_<block>` for every block except the standard one.
pub fn with_block(base: &str, block: &str) -> String {
    if block == STANDARD_BLOCK {
        base.to_string()
    } else {
        format!("{}_{}", base, block)
    }
}

pub fn subject_dir(e: &EntitySet) -> String {
    format!("sub-{}", e.subject.as_deref().unwrap_or_default())
}

pub fn session_dir(e: &EntitySet) -> String {
    format!("ses-{}", e.session.as_deref().unwrap_or_default())
}

pub fn with_prefix(value: &str, prefix: &str) -> String {
    if value.starts_with(prefix) {
        value.to_string()
    } else {
        format!("{}{}", prefix, value)
    }
}
