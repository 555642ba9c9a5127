//! Run identity, modes, state-machine states and terminal statuses.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque pipeline identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineId(String);

impl PipelineId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PipelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How materialized output is committed to the target table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaterializeMode {
    /// Replace the whole table via staging + swap.
    #[default]
    Overwrite,
    /// Upsert by key; untouched target rows are kept.
    Incremental,
}

impl MaterializeMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Overwrite => "overwrite",
            Self::Incremental => "incremental",
        }
    }
}

impl fmt::Display for MaterializeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operational mode of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Full,
    Backfill,
    Update,
    InsertFeature,
}

impl RunMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Backfill => "backfill",
            Self::Update => "update",
            Self::InsertFeature => "insert_feature",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Orchestrator state-machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Connecting,
    LoadingSources,
    PreValidating,
    Executing,
    PostValidating,
    Materializing,
    Disconnecting,
    Succeeded,
    Failed,
}

impl RunState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::LoadingSources => "loading_sources",
            Self::PreValidating => "pre_validating",
            Self::Executing => "executing",
            Self::PostValidating => "post_validating",
            Self::Materializing => "materializing",
            Self::Disconnecting => "disconnecting",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal status reported in a run result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    ValidationFailed,
    ExecutionFailed,
    Cancelled,
}

impl RunStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::ValidationFailed => "validation_failed",
            Self::ExecutionFailed => "execution_failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// `true` for validation or execution failures.
    #[must_use]
    pub fn is_failed(self) -> bool {
        matches!(self, Self::ValidationFailed | Self::ExecutionFailed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_id_display_and_as_str() {
        let pid = PipelineId::new("customer_features");
        assert_eq!(pid.as_str(), "customer_features");
        assert_eq!(pid.to_string(), "customer_features");
    }

    #[test]
    fn test_materialize_mode_defaults_to_overwrite() {
        assert_eq!(MaterializeMode::default(), MaterializeMode::Overwrite);
    }

    #[test]
    fn test_run_status_failure_classes() {
        assert!(RunStatus::ValidationFailed.is_failed());
        assert!(RunStatus::ExecutionFailed.is_failed());
        assert!(!RunStatus::Succeeded.is_failed());
        assert!(!RunStatus::Cancelled.is_failed());
    }

    #[test]
    fn test_run_status_serializes_snake_case() {
        let json = serde_json::to_string(&RunStatus::ValidationFailed).unwrap();
        assert_eq!(json, "\"validation_failed\"");
    }

    #[test]
    fn test_terminal_states() {
        assert!(RunState::Succeeded.is_terminal());
        assert!(RunState::Failed.is_terminal());
        assert!(!RunState::Disconnecting.is_terminal());
    }
}
