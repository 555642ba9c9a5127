//! Error-kind taxonomy and validation findings.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Broad classification of a run failure, carried in run results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad references, cycles or schema mismatch.
    Configuration,
    /// Warehouse connection could not be established.
    Connection,
    /// A row lacked an input a transformation requires.
    MissingInput,
    /// A blocking validation finding.
    Validation,
    /// Write or swap failure; the target is unchanged.
    Materialization,
    /// Any other execution-time failure (warehouse read, type coercion).
    Execution,
    /// The run was cancelled cooperatively.
    Cancelled,
    /// Unexpected fault inside the engine.
    Internal,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::Connection => "connection",
            Self::MissingInput => "missing_input",
            Self::Validation => "validation",
            Self::Materialization => "materialization",
            Self::Execution => "execution",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Finding severity. Blocking findings abort the run before materialization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    #[default]
    Blocking,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Warning => "warning",
            Self::Blocking => "blocking",
        })
    }
}

/// A data-quality observation produced by a validation rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub severity: Severity,
    /// Rule identifier, e.g. `key_not_null`.
    pub rule: String,
    /// Table or relation the rule ran against.
    pub subject: String,
    pub message: String,
}

impl Finding {
    #[must_use]
    pub fn blocking(rule: &str, subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Blocking,
            rule: rule.to_string(),
            subject: subject.into(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn warning(rule: &str, subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            rule: rule.to_string(),
            subject: subject.into(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn is_blocking(&self) -> bool {
        self.severity == Severity::Blocking
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}({}): {}", self.severity, self.rule, self.subject, self.message)
    }
}
