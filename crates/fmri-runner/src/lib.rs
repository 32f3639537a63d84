pub mod config;
pub mod design;
pub mod discover;
pub mod dispatch;
pub mod header;
pub mod pairs;
pub mod params;
pub mod pipeline;
pub mod preprocess;

pub use config::{AnalysisConstants, Binaries, DiscardRule, DiscardRules, PipelineConfig};
pub use design::{generate_design_files, DesignRequest};
pub use dispatch::{
    dispatch_designs, CommandLog, CommandRunner, DispatchError, DispatchMode, DispatchOptions,
    DispatchReport, JobOutcome, JobStatus, SystemRunner,
};
pub use header::{HeaderError, HeaderReader, NiftiHeaderReader, ScanHeader};
pub use pairs::{generate_higher_level_designs, HigherLevelRequest};
pub use params::{extract_parameters, ExtractReport, ExtractRequest};
pub use pipeline::{run_pipeline, PipelineOptions, PipelineReport};
pub use preprocess::{
    run_motion_outliers, run_skull_strip, MotionOutlierRequest, SkullStripRequest, StageOptions,
    StageReport,
};
