use std::path::PathBuf;

use anyhow::Result;
use featurepipe_engine::{plan, RunRequest, SystemClock};

use super::load_pipeline;

/// Execute the `check` command: parse, validate and resolve each pipeline.
/// No warehouse connection is made.
pub fn execute(pipelines: &[PathBuf]) -> Result<()> {
    let mut failed = 0usize;
    for path in pipelines {
        let outcome = load_pipeline(path).and_then(|spec| {
            let planned = plan(&spec, &RunRequest::Backfill, &SystemClock)?;
            Ok((spec, planned))
        });
        match outcome {
            Ok((spec, planned)) => {
                println!("{}: OK", path.display());
                println!("  Pipeline:        {}", spec.pipeline);
                println!(
                    "  Entity:          {} (key {})",
                    planned.plan.entity.name,
                    planned.plan.key_column()
                );
                println!("  Sources:         {}", spec.source_tables.len());
                println!("  Features:        {}", planned.plan.len());
                println!("  Target:          {} ({})", planned.target, spec.write_mode);
            }
            Err(err) => {
                failed += 1;
                println!("{}: FAILED", path.display());
                println!("  {err:#}");
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{failed} pipeline(s) failed checks");
    }
    println!("\nAll checks passed.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(name: &str) -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("../../tests/fixtures/pipelines")
            .join(name)
    }

    #[test]
    fn test_valid_pipelines_pass() {
        execute(&[fixture("customer_features.yaml"), fixture("sales_features.yaml")]).unwrap();
    }

    #[test]
    fn test_cyclic_pipeline_fails() {
        let err = execute(&[fixture("invalid_cycle.yaml")]).unwrap_err();
        assert!(err.to_string().contains("1 pipeline(s)"));
    }
}
