//! Execution Stage
//!
//! Runs validated SQL through a [`RelationalStore`] with a hard timeout. The
//! text is executed exactly as the guardrail returned it. Driver errors are
//! reduced to a fixed user-facing message; the raw text is kept for the
//! audit trail only.

use crate::error::StageFailure;
use crate::types::{SecurityContext, Stage};
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

lazy_static! {
    static ref CONNECTION_URL: Regex = Regex::new(r"(?i)\b(postgres(?:ql)?://)[^\s@/]+@").unwrap();
    static ref PASSWORD_PAIR: Regex = Regex::new(r"(?i)\bpassword\s*=\s*\S+").unwrap();
}

/// Rows as returned by a store, values already converted to JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryOutput {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    /// More rows were available than `max_rows`.
    pub truncated: bool,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("statement timed out")]
    Timeout,

    #[error("database error: {0}")]
    Driver(String),
}

/// Read-only relational store. Implementations must scope the session to
/// `scope` and must not leak session state between calls.
#[async_trait]
pub trait RelationalStore: Send + Sync {
    async fn query(
        &self,
        sql: &str,
        scope: &SecurityContext,
        timeout: Duration,
        max_rows: usize,
    ) -> Result<QueryOutput, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub row_count: usize,
    pub duration_ms: u64,
    pub truncated: bool,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionFailure {
    #[error("query timed out")]
    Timeout,

    #[error("database execution failed")]
    Database { raw: String },
}

impl ExecutionFailure {
    pub fn code(&self) -> &'static str {
        match self {
            ExecutionFailure::Timeout => "db_timeout",
            ExecutionFailure::Database { .. } => "db_error",
        }
    }

    pub fn to_failure(&self) -> StageFailure {
        match self {
            ExecutionFailure::Timeout => StageFailure::new(
                Stage::Execution,
                self.code(),
                "Database query timed out.",
                504,
            ),
            ExecutionFailure::Database { raw } => StageFailure::new(
                Stage::Execution,
                self.code(),
                "Database execution failed.",
                500,
            )
            .with_metadata(serde_json::json!({ "db_error": raw })),
        }
    }
}

pub struct ExecutionStage {
    store: Arc<dyn RelationalStore>,
    max_rows: usize,
}

impl ExecutionStage {
    pub fn new(store: Arc<dyn RelationalStore>, max_rows: usize) -> Self {
        Self { store, max_rows }
    }

    pub async fn execute(
        &self,
        final_sql: &str,
        scope: &SecurityContext,
        timeout: Duration,
    ) -> Result<ExecutionResult, ExecutionFailure> {
        let start = Instant::now();
        let output = match tokio::time::timeout(
            timeout,
            self.store.query(final_sql, scope, timeout, self.max_rows),
        )
        .await
        {
            Ok(Ok(output)) => output,
            Ok(Err(StoreError::Timeout)) | Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "query timed out");
                return Err(ExecutionFailure::Timeout);
            }
            Ok(Err(StoreError::Driver(raw))) => {
                let raw = redact(&raw);
                warn!(error = %raw, "query failed");
                return Err(ExecutionFailure::Database { raw });
            }
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        info!(rows = output.rows.len(), duration_ms, truncated = output.truncated, "query executed");
        Ok(ExecutionResult {
            row_count: output.rows.len(),
            columns: output.columns,
            rows: output.rows,
            duration_ms,
            truncated: output.truncated,
        })
    }
}

/// Removes credentials that drivers sometimes echo in error text.
pub fn redact(raw: &str) -> String {
    let masked = CONNECTION_URL.replace_all(raw, "${1}***@");
    PASSWORD_PAIR.replace_all(&masked, "password=***").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::scope::ScopePolicy;
    use crate::types::ViewCatalog;

    struct FixedStore(Result<QueryOutput, StoreError>, Duration);

    #[async_trait]
    impl RelationalStore for FixedStore {
        async fn query(&self, _: &str, _: &SecurityContext, _: Duration, _: usize) -> Result<QueryOutput, StoreError> {
            tokio::time::sleep(self.1).await;
            self.0.clone()
        }
    }

    fn scope() -> SecurityContext {
        ScopePolicy::new(ViewCatalog::new(["v_a"]), vec![])
            .resolve("store_manager", 1, &["v_a".to_string()])
            .unwrap()
    }

    #[tokio::test]
    async fn test_driver_error_is_sanitized() {
        let store = FixedStore(
            Err(StoreError::Driver("relation \"payment\" does not exist".into())),
            Duration::ZERO,
        );
        let stage = ExecutionStage::new(Arc::new(store), 200);
        let err = stage
            .execute("SELECT 1 LIMIT 200", &scope(), Duration::from_secs(1))
            .await
            .unwrap_err();
        let failure = err.to_failure();
        assert_eq!(failure.code, "db_error");
        assert_eq!(failure.detail, "Database execution failed.");
        assert!(!failure.detail.contains("payment"));
        assert!(failure.metadata["db_error"].as_str().unwrap().contains("payment"));
    }

    #[tokio::test]
    async fn test_hard_timeout() {
        let store = FixedStore(Ok(QueryOutput::default()), Duration::from_secs(5));
        let stage = ExecutionStage::new(Arc::new(store), 200);
        let err = stage
            .execute("SELECT 1 LIMIT 200", &scope(), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err, ExecutionFailure::Timeout);
        assert_eq!(err.to_failure().status, 504);
    }

    #[test]
    fn test_redact() {
        let raw = "connect postgres://app:s3cret@db:5432/x failed; password=hunter2";
        let cleaned = redact(raw);
        assert!(!cleaned.contains("s3cret"));
        assert!(!cleaned.contains("hunter2"));
        assert!(cleaned.contains("postgres://***@db"));
    }
}
