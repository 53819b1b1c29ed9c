use crate::types::Stage;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Scope error: {0}")]
    Scope(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// A stage failure as the caller and the audit trail see it. `detail` is
/// user-facing; raw downstream text only ever goes into `metadata`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageFailure {
    pub stage: Stage,
    pub code: String,
    pub detail: String,
    pub status: u16,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

impl StageFailure {
    pub fn new(stage: Stage, code: impl Into<String>, detail: impl Into<String>, status: u16) -> Self {
        Self {
            stage,
            code: code.into(),
            detail: detail.into(),
            status,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// The overall request deadline ran out while `stage` was in flight.
    pub fn timed_out(stage: Stage) -> Self {
        Self::new(
            stage,
            "stage_timeout",
            format!("The request ran out of time during {}. Please retry.", stage),
            504,
        )
    }
}

impl std::fmt::Display for StageFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} failed ({}): {}", self.stage, self.code, self.detail)
    }
}
