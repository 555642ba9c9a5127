//! Pipeline orchestrator: plans a run, then drives it through the
//! connect / load / validate / execute / validate / materialize / disconnect
//! state machine.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use chrono::{NaiveDate, Utc};
use futures::FutureExt;
use featurepipe_types::{
    ErrorKind, Finding, MaterializeMode, RowSet, RunMode, RunState, RunStatus, TableRef,
};
use featurepipe_warehouse::{Warehouse, WarehouseConnection};
use tracing::Instrument;

use crate::config::validator::validate_pipeline;
use crate::config::{FeatureDefinition, PipelineSpec, WarehouseConfig};
use crate::connection::{ConnectionGuard, ConnectionManager};
use crate::error::{ConfigError, PipelineError};
use crate::execution::{Clock, RunOptions, RunRequest, SourceRange, SystemClock};
use crate::executor::{self, ExecutionOutput};
use crate::materialize::materialize;
use crate::resolve::{resolve, resolve_features, ExecutionPlan};
use crate::result::{RunError, RunResult, StepRecord, StepStatus};
use crate::validate::{self, has_blocking};

/// Everything decided about a run before any warehouse I/O.
#[derive(Debug, Clone, PartialEq)]
pub struct RunPlan {
    pub mode: RunMode,
    pub plan: ExecutionPlan,
    pub as_of: NaiveDate,
    pub range: SourceRange,
    pub materialize_mode: MaterializeMode,
    pub target: TableRef,
    /// Feature columns written to the target; `None` writes all of them.
    pub output_columns: Option<Vec<String>>,
    /// Feature columns that must already exist in the target.
    pub required_target_columns: Vec<String>,
}

/// Validate and resolve `spec` for `request` without touching the warehouse.
///
/// # Errors
///
/// Returns a [`ConfigError`] for invalid configuration, unresolvable
/// features, or an `insert_feature` request naming an existing feature.
pub fn plan(
    spec: &PipelineSpec,
    request: &RunRequest,
    clock: &dyn Clock,
) -> Result<RunPlan, ConfigError> {
    validate_pipeline(spec)?;

    let (plan, output_columns, required_target_columns) = match request {
        RunRequest::InsertFeature { feature } => {
            if spec.find_feature(&feature.name).is_some() {
                return Err(ConfigError::DuplicateFeature(feature.name.clone()));
            }
            let mut features = spec.features.clone();
            features.push(feature.clone());
            let full = resolve_features(spec, &features)?;
            let dependencies: Vec<String> = full
                .transitive_dependencies(&feature.name)
                .into_iter()
                .map(str::to_string)
                .collect();
            let restricted = full.restricted_to(&feature.name).ok_or_else(|| {
                ConfigError::UnresolvedReference {
                    feature: feature.name.clone(),
                    identifier: feature.name.clone(),
                }
            })?;
            (restricted, Some(vec![feature.name.clone()]), dependencies)
        }
        _ => (resolve(spec)?, None, Vec::new()),
    };

    let as_of = request.as_of().unwrap_or_else(|| clock.today());
    Ok(RunPlan {
        mode: request.mode(),
        plan,
        as_of,
        range: request.source_range(as_of),
        materialize_mode: request.materialize_mode(spec.write_mode),
        target: spec.target_table(),
        output_columns,
        required_target_columns,
    })
}

/// Runs pipelines against one warehouse. Clones share the connection pool,
/// so concurrent runs are bounded together.
#[derive(Clone)]
pub struct Orchestrator {
    connections: ConnectionManager,
    clock: Arc<dyn Clock>,
}

impl Orchestrator {
    #[must_use]
    pub fn new(warehouse: Arc<dyn Warehouse>, config: &WarehouseConfig) -> Self {
        Self::with_connections(ConnectionManager::from_config(warehouse, config))
    }

    #[must_use]
    pub fn with_connections(connections: ConnectionManager) -> Self {
        Self {
            connections,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock used by modes without a caller-supplied date.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    /// Compute every feature as of `as_of` and materialize with the
    /// pipeline's configured write mode.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] before any I/O; all other failures are
    /// reported in the returned [`RunResult`].
    pub async fn run_full(
        &self,
        spec: &PipelineSpec,
        as_of: NaiveDate,
    ) -> Result<RunResult, ConfigError> {
        self.execute(spec, RunRequest::Full { as_of }, &RunOptions::default())
            .await
    }

    /// Recompute every feature over the full source history and overwrite.
    ///
    /// # Errors
    ///
    /// See [`run_full`](Self::run_full).
    pub async fn run_backfill(&self, spec: &PipelineSpec) -> Result<RunResult, ConfigError> {
        self.execute(spec, RunRequest::Backfill, &RunOptions::default())
            .await
    }

    /// Compute every feature as of `as_of` and upsert into the target.
    ///
    /// # Errors
    ///
    /// See [`run_full`](Self::run_full).
    pub async fn run_update(
        &self,
        spec: &PipelineSpec,
        as_of: NaiveDate,
    ) -> Result<RunResult, ConfigError> {
        self.execute(spec, RunRequest::Update { as_of }, &RunOptions::default())
            .await
    }

    /// Compute one new feature (plus what it depends on) and upsert only
    /// its column into the target.
    ///
    /// # Errors
    ///
    /// See [`run_full`](Self::run_full). Also fails if `new_feature` is
    /// already declared.
    pub async fn run_insert_feature(
        &self,
        spec: &PipelineSpec,
        new_feature: FeatureDefinition,
    ) -> Result<RunResult, ConfigError> {
        self.execute(
            spec,
            RunRequest::InsertFeature {
                feature: new_feature,
            },
            &RunOptions::default(),
        )
        .await
    }

    /// Plan and run `request`.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] before any I/O; all other failures are
    /// reported in the returned [`RunResult`].
    pub async fn execute(
        &self,
        spec: &PipelineSpec,
        request: RunRequest,
        options: &RunOptions,
    ) -> Result<RunResult, ConfigError> {
        let prepared = plan(spec, &request, self.clock.as_ref())?;
        let run_id = format!("{}-{}", spec.pipeline, Utc::now().format("%Y%m%dT%H%M%S%.3f"));
        let span = tracing::info_span!(
            "pipeline_run",
            pipeline = %spec.pipeline,
            mode = %prepared.mode,
            run_id = %run_id
        );
        Ok(self
            .run_planned(spec, prepared, options, run_id)
            .instrument(span)
            .await)
    }

    async fn run_planned(
        &self,
        spec: &PipelineSpec,
        prepared: RunPlan,
        options: &RunOptions,
        run_id: String,
    ) -> RunResult {
        let start = Instant::now();
        let mut run = RunLedger::new(spec, &prepared, run_id);
        tracing::info!(
            as_of = %prepared.as_of,
            features = prepared.plan.len(),
            materialize = %prepared.materialize_mode,
            dry_run = options.dry_run,
            "Starting pipeline run"
        );

        // Connecting: a failure here ends the run without a disconnect.
        let mut guard = match self.connect(spec, options, &mut run).await {
            Ok(guard) => guard,
            Err(err) => return run.finish(Some(err), start),
        };

        let work = AssertUnwindSafe(self.run_connected(spec, &prepared, options, &mut guard, &mut run))
            .catch_unwind()
            .await;
        let error = match work {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err),
            Err(payload) => Some(PipelineError::Internal(panic_message(payload.as_ref()))),
        };
        if error.is_some() {
            run.steps.fail_open();
        }

        run.steps.enter(RunState::Disconnecting);
        guard.release().await;
        run.steps.complete(None);

        run.finish(error, start)
    }

    async fn connect(
        &self,
        spec: &PipelineSpec,
        options: &RunOptions,
        run: &mut RunLedger,
    ) -> Result<ConnectionGuard, PipelineError> {
        checkpoint(options, RunState::Connecting)?;
        run.steps.enter(RunState::Connecting);
        let acquired = tokio::select! {
            biased;
            () = options.cancel.cancelled() => Err(PipelineError::Cancelled(RunState::Connecting)),
            result = self.connections.acquire(&spec.pipeline) => result.map_err(PipelineError::from),
        };
        match acquired {
            Ok(guard) => {
                run.steps.complete(None);
                Ok(guard)
            }
            Err(err) => {
                run.steps.fail_open();
                Err(err)
            }
        }
    }

    async fn run_connected(
        &self,
        spec: &PipelineSpec,
        prepared: &RunPlan,
        options: &RunOptions,
        guard: &mut ConnectionGuard,
        run: &mut RunLedger,
    ) -> Result<(), PipelineError> {
        let conn = guard
            .connection()
            .map_err(|error| PipelineError::Warehouse {
                operation: "connect",
                error,
            })?;

        checkpoint(options, RunState::LoadingSources)?;
        run.steps.enter(RunState::LoadingSources);
        check_target_dependencies(conn, prepared).await?;
        let sources = load_sources(conn, spec, prepared).await?;
        let loaded: usize = sources.values().map(RowSet::len).sum();
        run.steps.complete(Some(loaded as u64));

        checkpoint(options, RunState::PreValidating)?;
        run.steps.enter(RunState::PreValidating);
        let mut findings = Vec::new();
        for source in &spec.source_tables {
            if let Some(rows) = sources.get(&source.source) {
                let rules = validate::source_rules(source, &spec.validation);
                findings.extend(validate::check(&source.source, rows, &rules));
            }
        }
        run.record_findings("pre", findings)?;
        run.steps.complete(None);

        checkpoint(options, RunState::Executing)?;
        run.steps.enter(RunState::Executing);
        let output: ExecutionOutput = executor::execute(&prepared.plan, &sources, prepared.as_of)?;
        run.steps.complete(Some(output.row_count() as u64));

        checkpoint(options, RunState::PostValidating)?;
        run.steps.enter(RunState::PostValidating);
        let rows = output.to_row_set(prepared.output_columns.as_deref());
        let rules = validate::output_rules(prepared.plan.key_column(), &spec.validation);
        let findings = validate::check(&prepared.target.to_string(), &rows, &rules);
        run.record_findings("post", findings)?;
        run.steps.complete(Some(rows.len() as u64));

        checkpoint(options, RunState::Materializing)?;
        run.steps.enter(RunState::Materializing);
        if options.dry_run {
            tracing::info!(rows = rows.len(), "Dry run, skipping materialization");
            run.steps.skip();
            run.output = Some(rows);
            return Ok(());
        }
        let summary = materialize(
            conn,
            &rows,
            &prepared.target,
            prepared.plan.key_column(),
            prepared.materialize_mode,
        )
        .await?;
        run.rows_written = summary.rows_written;
        run.steps.complete(Some(summary.rows_written));
        Ok(())
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("connections", &self.connections)
            .finish_non_exhaustive()
    }
}

fn checkpoint(options: &RunOptions, next: RunState) -> Result<(), PipelineError> {
    if options.cancel.is_cancelled() {
        tracing::warn!(next = %next, "Run cancelled");
        return Err(PipelineError::Cancelled(next));
    }
    Ok(())
}

/// For `insert_feature`: every dependency must already be a target column.
async fn check_target_dependencies(
    conn: &mut dyn WarehouseConnection,
    prepared: &RunPlan,
) -> Result<(), PipelineError> {
    if prepared.required_target_columns.is_empty() {
        return Ok(());
    }
    let existing = conn
        .table_columns(&prepared.target)
        .await
        .map_err(|error| PipelineError::Warehouse {
            operation: "describe",
            error,
        })?
        .unwrap_or_default();
    let feature = prepared
        .output_columns
        .as_ref()
        .and_then(|c| c.first())
        .cloned()
        .unwrap_or_default();
    for dependency in &prepared.required_target_columns {
        if !existing.contains(dependency) {
            return Err(ConfigError::DependencyNotMaterialized {
                feature,
                dependency: dependency.clone(),
                table: prepared.target.to_string(),
            }
            .into());
        }
    }
    Ok(())
}

/// Read `[key] + required_columns` of every source feeding the target
/// entity, dropping rows after `as_of` when the source carries the
/// partition column.
async fn load_sources(
    conn: &mut dyn WarehouseConnection,
    spec: &PipelineSpec,
    prepared: &RunPlan,
) -> Result<BTreeMap<String, RowSet>, PipelineError> {
    let partition_column = spec.effective_partition_column();
    let mut sources = BTreeMap::new();
    for source in spec.entity_sources() {
        let table = spec.source_table_ref(source);
        let mut columns = vec![source.key_column.clone()];
        columns.extend(source.required_columns.iter().cloned());

        let mut rows = conn
            .read(&table, &columns)
            .await
            .map_err(|error| PipelineError::SourceLoad {
                source_name: source.source.clone(),
                error,
            })?;

        if let SourceRange::AsOf(as_of) = prepared.range {
            if source.required_columns.iter().any(|c| c == partition_column) {
                let before = rows.len();
                rows.retain(|row| {
                    row.get(partition_column)
                        .and_then(featurepipe_types::Value::as_date)
                        .map_or(true, |date| date <= as_of)
                });
                tracing::debug!(
                    source = source.source,
                    dropped = before - rows.len(),
                    "Applied as-of partition filter"
                );
            }
        }

        tracing::debug!(
            source = source.source,
            table = %table,
            rows = rows.len(),
            "Source loaded"
        );
        sources.insert(source.source.clone(), rows);
    }
    Ok(sources)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

/// Records each state the run enters, with timing, and emits a structured
/// event when it closes.
#[derive(Debug, Default)]
struct StepTracker {
    records: Vec<StepRecord>,
    open: Option<(RunState, Instant)>,
}

impl StepTracker {
    fn enter(&mut self, state: RunState) {
        self.open = Some((state, Instant::now()));
    }

    fn close(&mut self, status: StepStatus, rows: Option<u64>) {
        let Some((state, started)) = self.open.take() else {
            return;
        };
        #[allow(clippy::cast_possible_truncation)]
        let duration_ms = started.elapsed().as_millis() as u64;
        match status {
            StepStatus::Failed => tracing::error!(
                step = %state,
                status = "failed",
                duration_ms,
                "Step failed"
            ),
            StepStatus::Ok | StepStatus::Skipped => tracing::info!(
                step = %state,
                status = if status == StepStatus::Ok { "ok" } else { "skipped" },
                duration_ms,
                rows,
                "Step finished"
            ),
        }
        self.records.push(StepRecord {
            state,
            status,
            duration_ms,
            rows,
        });
    }

    fn complete(&mut self, rows: Option<u64>) {
        self.close(StepStatus::Ok, rows);
    }

    fn skip(&mut self) {
        self.close(StepStatus::Skipped, None);
    }

    fn fail_open(&mut self) {
        self.close(StepStatus::Failed, None);
    }
}

/// Mutable bookkeeping for one run.
struct RunLedger {
    pipeline: String,
    run_id: String,
    mode: RunMode,
    as_of: NaiveDate,
    steps: StepTracker,
    findings: Vec<Finding>,
    rows_written: u64,
    output: Option<RowSet>,
}

impl RunLedger {
    fn new(spec: &PipelineSpec, prepared: &RunPlan, run_id: String) -> Self {
        Self {
            pipeline: spec.pipeline.clone(),
            run_id,
            mode: prepared.mode,
            as_of: prepared.as_of,
            steps: StepTracker::default(),
            findings: Vec::new(),
            rows_written: 0,
            output: None,
        }
    }

    /// Keep `findings`; fail the stage if any of them is blocking.
    fn record_findings(&mut self, stage: &'static str, findings: Vec<Finding>) -> Result<(), PipelineError> {
        for finding in &findings {
            tracing::warn!(stage, finding = %finding, "Validation finding");
        }
        let blocking: Vec<&Finding> = findings.iter().filter(|f| f.is_blocking()).collect();
        let result = if has_blocking(&findings) {
            Err(PipelineError::Validation {
                stage,
                blocking: blocking.len(),
                first: blocking
                    .first()
                    .map(ToString::to_string)
                    .unwrap_or_default(),
            })
        } else {
            Ok(())
        };
        self.findings.extend(findings);
        result
    }

    fn finish(self, error: Option<PipelineError>, start: Instant) -> RunResult {
        let duration_secs = start.elapsed().as_secs_f64();
        let (status, final_state) = match &error {
            None => (RunStatus::Succeeded, RunState::Succeeded),
            Some(err) => (
                match err.kind() {
                    ErrorKind::Validation => RunStatus::ValidationFailed,
                    ErrorKind::Cancelled => RunStatus::Cancelled,
                    _ => RunStatus::ExecutionFailed,
                },
                RunState::Failed,
            ),
        };

        match &error {
            None => tracing::info!(
                rows_written = self.rows_written,
                warnings = self.findings.len(),
                duration_secs,
                "Pipeline run succeeded"
            ),
            Some(err) => tracing::error!(
                status = %status,
                kind = %err.kind(),
                error = %err,
                duration_secs,
                "Pipeline run failed"
            ),
        }

        RunResult {
            pipeline: self.pipeline,
            run_id: self.run_id,
            mode: self.mode,
            status,
            final_state,
            as_of: self.as_of,
            rows_written: self.rows_written,
            findings: self.findings,
            steps: self.steps.records,
            error: error.map(|err| RunError {
                kind: err.kind(),
                message: err.to_string(),
            }),
            duration_secs,
            output: self.output,
        }
    }
}
