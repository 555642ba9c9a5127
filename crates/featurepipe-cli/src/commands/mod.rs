pub mod check;
pub mod plan;
pub mod run;

use std::path::Path;

use anyhow::{Context, Result};
use featurepipe_engine::config::parser;
use featurepipe_engine::config::PipelineSpec;
use featurepipe_engine::RunRequest;

pub fn load_pipeline(path: &Path) -> Result<PipelineSpec> {
    parser::parse_pipeline(path)
        .with_context(|| format!("Failed to parse pipeline: {}", path.display()))
}

pub fn insert_feature_request(path: &Path) -> Result<RunRequest> {
    let feature = parser::parse_feature(path)
        .with_context(|| format!("Failed to parse feature: {}", path.display()))?;
    Ok(RunRequest::InsertFeature { feature })
}
