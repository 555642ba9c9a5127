use std::path::PathBuf;

use anyhow::{Context, Result};
use featurepipe_engine::arrow::pretty_format;
use featurepipe_engine::result::StepStatus;
use featurepipe_engine::config::{PipelineSpec, WarehouseConfig};
use featurepipe_engine::{
    open_warehouse, ConnectionManager, Orchestrator, RunOptions, RunRequest, RunResult,
};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::load_pipeline;

/// How `run`-style commands print each result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Execute a run-style command over one or more pipeline files.
///
/// Files run concurrently; pipelines with the same warehouse settings share
/// one connection pool, so `max_connections` bounds them together. Ctrl-C
/// cancels every in-flight run at its next state transition. Fails if any
/// pipeline does not succeed.
pub async fn execute(
    pipelines: &[PathBuf],
    request: RunRequest,
    dry_run: bool,
    output: OutputFormat,
) -> Result<()> {
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling runs");
            on_interrupt.cancel();
        }
    });

    let mut outcomes = Vec::with_capacity(pipelines.len());
    let mut pools = WarehousePools::default();
    let mut runs = JoinSet::new();
    for (index, path) in pipelines.iter().enumerate() {
        let spec = match load_pipeline(path) {
            Ok(spec) => spec,
            Err(err) => {
                outcomes.push((index, path.clone(), Err(err)));
                continue;
            }
        };
        let connections = pools.pool_for(&spec.warehouse);
        let path = path.clone();
        let request = request.clone();
        let options = RunOptions {
            dry_run,
            cancel: cancel.clone(),
        };
        runs.spawn(async move {
            let outcome = run_one(spec, connections, request, &options).await;
            (index, path, outcome)
        });
    }

    while let Some(joined) = runs.join_next().await {
        outcomes.push(joined.context("Pipeline task panicked")?);
    }
    outcomes.sort_by_key(|(index, _, _)| *index);

    let mut failed = 0usize;
    for (_, path, outcome) in outcomes {
        match outcome {
            Ok(result) => {
                if !result.succeeded() {
                    failed += 1;
                }
                match output {
                    OutputFormat::Text => print_result(&result)?,
                    OutputFormat::Json => println!("{}", serde_json::to_string(&result)?),
                }
            }
            Err(err) => {
                failed += 1;
                eprintln!("{}: {err:#}", path.display());
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{failed} of {} pipeline run(s) did not succeed", pipelines.len());
    }
    Ok(())
}

/// One connection pool per distinct warehouse configuration.
#[derive(Default)]
struct WarehousePools {
    pools: Vec<(WarehouseConfig, ConnectionManager)>,
}

impl WarehousePools {
    fn pool_for(&mut self, config: &WarehouseConfig) -> ConnectionManager {
        if let Some((_, pool)) = self.pools.iter().find(|(c, _)| c == config) {
            return pool.clone();
        }
        let pool = ConnectionManager::from_config(open_warehouse(config), config);
        self.pools.push((config.clone(), pool.clone()));
        pool
    }
}

async fn run_one(
    spec: PipelineSpec,
    connections: ConnectionManager,
    request: RunRequest,
    options: &RunOptions,
) -> Result<RunResult> {
    tracing::info!(
        pipeline = spec.pipeline,
        entity = spec.entity,
        sources = spec.source_tables.len(),
        features = spec.features.len(),
        backend = ?spec.warehouse.backend,
        "Pipeline loaded"
    );

    Orchestrator::with_connections(connections)
        .execute(&spec, request, options)
        .await
        .with_context(|| format!("Pipeline '{}' cannot run", spec.pipeline))
}

fn print_result(result: &RunResult) -> Result<()> {
    if result.succeeded() {
        println!(
            "Pipeline '{}' completed successfully ({}, as of {}).",
            result.pipeline, result.mode, result.as_of
        );
    } else {
        println!(
            "Pipeline '{}' did not succeed: {} ({}, as of {}).",
            result.pipeline, result.status, result.mode, result.as_of
        );
    }
    if let Some(error) = &result.error {
        println!("  Error [{}]: {}", error.kind, error.message);
    }
    println!("  Rows written:    {}", result.rows_written);
    println!("  Duration:        {:.2}s", result.duration_secs);
    for step in &result.steps {
        let status = match step.status {
            StepStatus::Ok => "ok",
            StepStatus::Failed => "FAILED",
            StepStatus::Skipped => "skipped",
        };
        let rows = step.rows.map(|r| format!(" ({r} rows)")).unwrap_or_default();
        println!("    {:16} {:8} {}ms{}", step.state.as_str(), status, step.duration_ms, rows);
    }
    for finding in &result.findings {
        println!("  {finding}");
    }
    if let Some(rows) = &result.output {
        println!("{}", pretty_format(rows)?);
    }
    Ok(())
}
