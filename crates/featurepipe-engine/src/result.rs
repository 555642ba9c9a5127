//! Pipeline run result types.

use chrono::NaiveDate;
use featurepipe_types::{ErrorKind, Finding, RowSet, RunMode, RunState, RunStatus};
use serde::Serialize;

/// Outcome of one state-machine step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Ok,
    Failed,
    Skipped,
}

/// Timing and row count of one state the run passed through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepRecord {
    pub state: RunState,
    pub status: StepStatus,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<u64>,
}

/// Error carried by a failed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunError {
    pub kind: ErrorKind,
    pub message: String,
}

/// The only artifact that outlives a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunResult {
    pub pipeline: String,
    pub run_id: String,
    pub mode: RunMode,
    pub status: RunStatus,
    pub final_state: RunState,
    pub as_of: NaiveDate,
    pub rows_written: u64,
    /// Validation findings from both checks, warnings included.
    pub findings: Vec<Finding>,
    pub steps: Vec<StepRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
    pub duration_secs: f64,
    /// Computed rows of a dry run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<RowSet>,
}

impl RunResult {
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    #[must_use]
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    /// Whether the run passed through `state`.
    #[must_use]
    pub fn entered(&self, state: RunState) -> bool {
        self.steps.iter().any(|s| s.state == state)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| !f.is_blocking())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(status: RunStatus) -> RunResult {
        RunResult {
            pipeline: "p".into(),
            run_id: "p-1".into(),
            mode: RunMode::Full,
            status,
            final_state: RunState::Succeeded,
            as_of: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            rows_written: 3,
            findings: vec![
                Finding::warning("null_inputs", "s", "1 null value(s) in 'a'"),
            ],
            steps: vec![StepRecord {
                state: RunState::Connecting,
                status: StepStatus::Ok,
                duration_ms: 1,
                rows: None,
            }],
            error: None,
            duration_secs: 0.1,
            output: None,
        }
    }

    #[test]
    fn test_run_result_helpers() {
        let r = result(RunStatus::Succeeded);
        assert!(r.succeeded());
        assert!(r.entered(RunState::Connecting));
        assert!(!r.entered(RunState::LoadingSources));
        assert_eq!(r.warnings().count(), 1);
        assert!(r.error_kind().is_none());
    }

    #[test]
    fn test_run_result_serializes_snake_case() {
        let json = serde_json::to_value(result(RunStatus::ValidationFailed)).unwrap();
        assert_eq!(json["status"], "validation_failed");
        assert_eq!(json["mode"], "full");
        assert_eq!(json["steps"][0]["state"], "connecting");
        assert_eq!(json["as_of"], "2024-01-01");
        assert!(json.get("error").is_none());
    }
}
