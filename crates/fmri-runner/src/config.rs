use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const DISCARD_SETTINGS_FILE: &str = "dummy_scan_settings.json";
pub const LEGACY_SETTINGS_FILE: &str = "motion_outlier_settings.json";
pub const DEFAULT_DISCARD_FRAMES: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscardRule {
    pub frames: usize,
    pub dummy: u32,
}

/// Frame-count keyed lookup for the number of leading volumes to drop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscardRules {
    #[serde(default, rename = "dummy_scan_rules")]
    pub rules: Vec<DiscardRule>,
    #[serde(default = "default_dummy", rename = "default_dummy")]
    pub default: u32,
}

fn default_dummy() -> u32 {
    DEFAULT_DISCARD_FRAMES
}

impl Default for DiscardRules {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            default: DEFAULT_DISCARD_FRAMES,
        }
    }
}

#[derive(Deserialize)]
struct LegacySettings {
    dummy_scan_rules: Option<Vec<DiscardRule>>,
    default_dummy: Option<u32>,
}

impl DiscardRules {
    /// First rule whose frame count matches exactly, else the default.
    pub fn discard_for(&self, frames: Option<usize>) -> u32 {
        match frames {
            Some(n) => self
                .rules
                .iter()
                .find(|r| r.frames == n)
                .map(|r| r.dummy)
                .unwrap_or(self.default),
            None => self.default,
        }
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading discard rules {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("parsing discard rules {}", path.display()))
    }

    /// Look in a settings directory for the preferred file, then the legacy
    /// one (used only when it carries discard keys), else fall back to
    /// built-in defaults. Files that exist but do not parse are errors.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let preferred = dir.join(DISCARD_SETTINGS_FILE);
        if preferred.exists() {
            debug!(path = %preferred.display(), "loading discard rules");
            return Self::from_json_file(&preferred);
        }
        let legacy = dir.join(LEGACY_SETTINGS_FILE);
        if legacy.exists() {
            let raw = fs::read_to_string(&legacy)
                .with_context(|| format!("reading {}", legacy.display()))?;
            let parsed: LegacySettings = serde_json::from_str(&raw)
                .with_context(|| format!("parsing {}", legacy.display()))?;
            if parsed.dummy_scan_rules.is_some() || parsed.default_dummy.is_some() {
                debug!(path = %legacy.display(), "loading discard rules from legacy settings");
                return Ok(Self {
                    rules: parsed.dummy_scan_rules.unwrap_or_default(),
                    default: parsed.default_dummy.unwrap_or(DEFAULT_DISCARD_FRAMES),
                });
            }
        }
        info!(
            preferred = %preferred.display(),
            legacy = %legacy.display(),
            "discard rule settings not found, using defaults"
        );
        Ok(Self::default())
    }
}

/// Fixed analysis constants written into every configuration record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConstants {
    pub critical_z: f64,
    pub smoothing_kernel: u32,
    pub prob_threshold: f64,
    pub z_threshold: f64,
    pub z_minimum: f64,
}

impl Default for AnalysisConstants {
    fn default() -> Self {
        Self {
            critical_z: 2.3,
            smoothing_kernel: 4,
            prob_threshold: 0.05,
            z_threshold: 3.1,
            z_minimum: 3.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Binaries {
    pub feat: String,
    pub motion_outliers: String,
    pub synthstrip: String,
}

impl Default for Binaries {
    fn default() -> Self {
        Self {
            feat: "feat".to_string(),
            motion_outliers: "fsl_motion_outliers".to_string(),
            synthstrip: "mri_synthstrip".to_string(),
        }
    }
}

/// Process-wide settings, built once and handed to each stage by reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub binaries: Binaries,
    pub max_workers: usize,
    /// Directory holding `dummy_scan_settings.json`.
    pub settings_dir: Option<PathBuf>,
    pub analysis: AnalysisConstants,
    #[serde(skip)]
    pub discard_rules: DiscardRules,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            binaries: Binaries::default(),
            max_workers: 10,
            settings_dir: None,
            analysis: AnalysisConstants::default(),
            discard_rules: DiscardRules::default(),
        }
    }
}

impl PipelineConfig {
    /// Parse a YAML or JSON config (by extension) and resolve its discard rules.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading pipeline config {}", path.display()))?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let mut cfg: PipelineConfig = match ext.as_str() {
            "json" => serde_json::from_str(&raw)
                .with_context(|| format!("parsing {}", path.display()))?,
            "yaml" | "yml" => serde_yaml::from_str(&raw)
                .with_context(|| format!("parsing {}", path.display()))?,
            other => {
                return Err(anyhow!(
                    "unsupported config extension '{}' for {} (expected .json, .yaml or .yml)",
                    other,
                    path.display()
                ))
            }
        };
        if let Some(dir) = cfg.settings_dir.as_ref() {
            let dir = if dir.is_relative() {
                path.parent().unwrap_or(Path::new(".")).join(dir)
            } else {
                dir.clone()
            };
            cfg.discard_rules = DiscardRules::load_from_dir(&dir)?;
            cfg.settings_dir = Some(dir);
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn with_settings_dir(mut self, dir: &Path) -> Result<Self> {
        self.discard_rules = DiscardRules::load_from_dir(dir)?;
        self.settings_dir = Some(dir.to_path_buf());
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(anyhow!("max_workers must be at least 1"));
        }
        for (name, bin) in [
            ("feat", &self.binaries.feat),
            ("motion_outliers", &self.binaries.motion_outliers),
            ("synthstrip", &self.binaries.synthstrip),
        ] {
            if bin.trim().is_empty() {
                return Err(anyhow!("binaries.{} must not be empty", name));
            }
        }
        Ok(())
    }
}
