use std::path::Path;

use anyhow::Result;
use featurepipe_engine::{plan, RunRequest, SystemClock};

use super::{insert_feature_request, load_pipeline};

/// Execute the `plan` command: print the order features would be computed in.
pub fn execute(pipeline_path: &Path, feature_path: Option<&Path>) -> Result<()> {
    let spec = load_pipeline(pipeline_path)?;
    let request = match feature_path {
        Some(path) => insert_feature_request(path)?,
        None => RunRequest::Backfill,
    };
    let planned = plan(&spec, &request, &SystemClock)?;

    println!(
        "Execution plan for '{}' (entity {}, key {}):",
        spec.pipeline,
        planned.plan.entity.name,
        planned.plan.key_column()
    );
    let width = planned
        .plan
        .steps
        .iter()
        .map(|s| s.feature.name.len())
        .max()
        .unwrap_or(0);
    for (i, step) in planned.plan.steps.iter().enumerate() {
        let after = if step.depends_on.is_empty() {
            String::new()
        } else {
            format!("  after {}", step.depends_on.join(", "))
        };
        println!(
            "  {:>2}. {:width$}  {:24} {}{}",
            i + 1,
            step.feature.name,
            step.feature.transformation.kind_name(),
            step.feature.feature_type,
            after,
        );
    }
    if let Some(columns) = &planned.output_columns {
        println!("Writes only: {}", columns.join(", "));
    }
    println!(
        "Target: {} ({}, output format {})",
        planned.target,
        planned.materialize_mode,
        spec.effective_output_format()
    );
    Ok(())
}
