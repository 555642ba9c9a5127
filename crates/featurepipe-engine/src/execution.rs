//! Run parameters: operational mode, reference date and runtime options.

use chrono::{NaiveDate, Utc};
use featurepipe_types::{MaterializeMode, RunMode};
use tokio_util::sync::CancellationToken;

use crate::config::FeatureDefinition;

/// Source of the processing date for modes without a caller-supplied one.
pub trait Clock: Send + Sync {
    fn today(&self) -> NaiveDate;
}

/// Current UTC date.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> NaiveDate {
        Utc::now().date_naive()
    }
}

/// Always returns the same date.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub NaiveDate);

impl Clock for FixedClock {
    fn today(&self) -> NaiveDate {
        self.0
    }
}

/// Which source rows a run reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceRange {
    /// Rows whose partition column is on or before the date.
    AsOf(NaiveDate),
    /// Every row, regardless of partition column.
    FullHistory,
}

/// What to run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunRequest {
    Full { as_of: NaiveDate },
    Backfill,
    Update { as_of: NaiveDate },
    InsertFeature { feature: FeatureDefinition },
}

impl RunRequest {
    #[must_use]
    pub fn mode(&self) -> RunMode {
        match self {
            Self::Full { .. } => RunMode::Full,
            Self::Backfill => RunMode::Backfill,
            Self::Update { .. } => RunMode::Update,
            Self::InsertFeature { .. } => RunMode::InsertFeature,
        }
    }

    /// Caller-supplied reference date, if this mode takes one.
    #[must_use]
    pub fn as_of(&self) -> Option<NaiveDate> {
        match self {
            Self::Full { as_of } | Self::Update { as_of } => Some(*as_of),
            Self::Backfill | Self::InsertFeature { .. } => None,
        }
    }

    /// Materialization mode for this request; `configured` is the pipeline's
    /// `write_mode`, honoured by full runs only.
    #[must_use]
    pub fn materialize_mode(&self, configured: MaterializeMode) -> MaterializeMode {
        match self {
            Self::Full { .. } => configured,
            Self::Backfill => MaterializeMode::Overwrite,
            Self::Update { .. } | Self::InsertFeature { .. } => MaterializeMode::Incremental,
        }
    }

    #[must_use]
    pub fn source_range(&self, as_of: NaiveDate) -> SourceRange {
        match self {
            Self::Backfill => SourceRange::FullHistory,
            _ => SourceRange::AsOf(as_of),
        }
    }
}

/// Runtime execution options (not part of pipeline YAML config).
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Execute and validate but skip materialization; the computed rows are
    /// returned in the run result instead.
    pub dry_run: bool,
    /// Cooperative cancellation, checked at every state transition.
    pub cancel: CancellationToken,
}
