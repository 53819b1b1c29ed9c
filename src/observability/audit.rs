//! Audit Trail
//!
//! One parent record per request and one append-only child event per stage
//! transition. The recorder never fails a request after the parent record
//! exists; write errors past that point are logged and swallowed.

use crate::llm::TokenUsage;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error};
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuditError {
    #[error("audit store unavailable: {0}")]
    Unavailable(String),

    #[error("audit record {0} not found")]
    NotFound(Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Received,
    Running,
    Success,
    Failed,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditStatus::Received => "received",
            AuditStatus::Running => "running",
            AuditStatus::Success => "success",
            AuditStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Ok,
    Failed,
    /// The stage failed softly and the pipeline continued.
    Degraded,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Ok => "ok",
            EventStatus::Failed => "failed",
            EventStatus::Degraded => "degraded",
        }
    }
}

/// Columns written when the parent record is created.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewAuditRecord {
    pub conversation_id: String,
    pub org_id: String,
    pub user_id: String,
    pub correlation_id: Option<String>,
    pub question: String,
    pub role: String,
    pub store_id: i64,
    pub allowed_views: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEvent {
    pub log_id: Uuid,
    pub stage: String,
    pub status: EventStatus,
    pub message: String,
    pub duration_ms: u64,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageTimings {
    pub rag_ms: u64,
    pub llm_ms: u64,
    pub validation_ms: u64,
    pub exec_ms: u64,
    pub packing_ms: u64,
    pub total_ms: u64,
}

/// Terminal state written once by [`AuditRecorder::finalize`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditOutcome {
    pub status: AuditStatus,
    pub error_stage: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub llm_model: Option<String>,
    pub model_attempts: serde_json::Value,
    pub token_usage: TokenUsage,
    pub rag_sources: Vec<String>,
    pub generated_sql: Option<String>,
    pub rows_count: Option<u64>,
    pub timings: StageTimings,
    pub final_response: Option<serde_json::Value>,
    pub completed_at: DateTime<Utc>,
}

impl AuditOutcome {
    pub fn new(status: AuditStatus) -> Self {
        Self {
            status,
            error_stage: None,
            error_code: None,
            error_message: None,
            llm_model: None,
            model_attempts: serde_json::Value::Array(Vec::new()),
            token_usage: TokenUsage::default(),
            rag_sources: Vec::new(),
            generated_sql: None,
            rows_count: None,
            timings: StageTimings::default(),
            final_response: None,
            completed_at: Utc::now(),
        }
    }
}

/// Append-only parent/child audit storage.
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn create_record(&self, record: &NewAuditRecord) -> Result<Uuid, AuditError>;

    async fn mark_running(&self, log_id: Uuid) -> Result<(), AuditError>;

    async fn append_event(&self, event: &AuditEvent) -> Result<(), AuditError>;

    async fn finalize(&self, log_id: Uuid, outcome: &AuditOutcome) -> Result<(), AuditError>;
}

#[derive(Clone)]
pub struct AuditRecorder {
    store: Arc<dyn AuditStore>,
}

impl AuditRecorder {
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self { store }
    }

    /// Creates the parent record (status `received`) and moves it to
    /// `running`. Only the create is allowed to fail the request.
    pub async fn begin(&self, record: &NewAuditRecord) -> Result<Uuid, AuditError> {
        let log_id = self.store.create_record(record).await?;
        if let Err(e) = self.store.mark_running(log_id).await {
            error!(%log_id, error = %e, "failed to mark audit record running");
        }
        Ok(log_id)
    }

    pub async fn record_event(
        &self,
        log_id: Uuid,
        stage: &str,
        status: EventStatus,
        duration_ms: u64,
        message: impl Into<String>,
        metadata: serde_json::Value,
    ) {
        let event = AuditEvent {
            log_id,
            stage: stage.to_string(),
            status,
            message: message.into(),
            duration_ms,
            metadata,
            created_at: Utc::now(),
        };
        debug!(%log_id, stage, status = status.as_str(), duration_ms, "audit event");
        if let Err(e) = self.store.append_event(&event).await {
            error!(%log_id, stage, error = %e, "failed to append audit event");
        }
    }

    pub async fn finalize(&self, log_id: Uuid, outcome: &AuditOutcome) {
        if let Err(e) = self.store.finalize(log_id, outcome).await {
            error!(%log_id, status = outcome.status.as_str(), error = %e, "failed to finalize audit record");
        }
    }
}

/// Snapshot of one parent record held by [`InMemoryAuditStore`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditRecord {
    pub log_id: Uuid,
    pub request: NewAuditRecord,
    pub status: AuditStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub outcome: Option<AuditOutcome>,
    pub created_at: DateTime<Utc>,
}

/// Process-local audit store for the CLI and tests.
#[derive(Default)]
pub struct InMemoryAuditStore {
    records: DashMap<Uuid, AuditRecord>,
    events: DashMap<Uuid, Vec<AuditEvent>>,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, log_id: Uuid) -> Option<AuditRecord> {
        self.records.get(&log_id).map(|r| r.value().clone())
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.iter().map(|r| r.value().clone()).collect()
    }

    /// Events of one record in append order.
    pub fn events(&self, log_id: Uuid) -> Vec<AuditEvent> {
        self.events.get(&log_id).map(|e| e.value().clone()).unwrap_or_default()
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn create_record(&self, record: &NewAuditRecord) -> Result<Uuid, AuditError> {
        let log_id = Uuid::new_v4();
        self.records.insert(
            log_id,
            AuditRecord {
                log_id,
                request: record.clone(),
                status: AuditStatus::Received,
                started_at: None,
                outcome: None,
                created_at: Utc::now(),
            },
        );
        Ok(log_id)
    }

    async fn mark_running(&self, log_id: Uuid) -> Result<(), AuditError> {
        let mut record = self.records.get_mut(&log_id).ok_or(AuditError::NotFound(log_id))?;
        record.status = AuditStatus::Running;
        record.started_at = Some(Utc::now());
        Ok(())
    }

    async fn append_event(&self, event: &AuditEvent) -> Result<(), AuditError> {
        if !self.records.contains_key(&event.log_id) {
            return Err(AuditError::NotFound(event.log_id));
        }
        self.events.entry(event.log_id).or_default().push(event.clone());
        Ok(())
    }

    async fn finalize(&self, log_id: Uuid, outcome: &AuditOutcome) -> Result<(), AuditError> {
        let mut record = self.records.get_mut(&log_id).ok_or(AuditError::NotFound(log_id))?;
        record.status = outcome.status;
        record.outcome = Some(outcome.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_record() -> NewAuditRecord {
        NewAuditRecord {
            conversation_id: "c-1".into(),
            org_id: "org".into(),
            user_id: "u".into(),
            correlation_id: None,
            question: "total revenue".into(),
            role: "store_manager".into(),
            store_id: 1,
            allowed_views: vec!["v_payment_scoped".into()],
        }
    }

    #[tokio::test]
    async fn test_recorder_lifecycle() {
        let store = Arc::new(InMemoryAuditStore::new());
        let recorder = AuditRecorder::new(store.clone());

        let log_id = recorder.begin(&new_record()).await.unwrap();
        assert_eq!(store.record(log_id).unwrap().status, AuditStatus::Running);

        recorder
            .record_event(log_id, "retrieval", EventStatus::Degraded, 4, "index down", serde_json::json!({}))
            .await;
        recorder.finalize(log_id, &AuditOutcome::new(AuditStatus::Failed)).await;

        let record = store.record(log_id).unwrap();
        assert_eq!(record.status, AuditStatus::Failed);
        let events = store.events(log_id);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, EventStatus::Degraded);
    }

    #[tokio::test]
    async fn test_events_for_unknown_record_are_swallowed() {
        let store = Arc::new(InMemoryAuditStore::new());
        let recorder = AuditRecorder::new(store.clone());
        let ghost = Uuid::new_v4();
        recorder
            .record_event(ghost, "generation", EventStatus::Ok, 1, "", serde_json::Value::Null)
            .await;
        assert!(store.events(ghost).is_empty());
    }
}
