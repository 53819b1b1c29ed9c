//! Durable audit store over `query_audit_logs` / `query_audit_events`.

use crate::observability::audit::{AuditError, AuditEvent, AuditOutcome, AuditStatus, AuditStore, NewAuditRecord};
use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

/// Longest error message persisted on the parent record.
const MAX_ERROR_MESSAGE: usize = 4000;

const FINALIZE_SQL: &str = r#"
UPDATE query_audit_logs
SET status = $1,
    error_stage = $2,
    error_code = $3,
    error_message = $4,
    llm_model = $5,
    model_attempts = $6,
    llm_input_tokens = $7,
    llm_output_tokens = $8,
    llm_total_tokens = $9,
    rag_sources = $10,
    generated_sql = $11,
    rows_count = $12,
    rag_ms = $13,
    llm_ms = $14,
    validation_ms = $15,
    exec_ms = $16,
    packing_ms = $17,
    total_ms = $18,
    final_response = $19,
    completed_at = $20,
    updated_at = NOW()
WHERE id = $21
"#;

pub struct PgAuditStore {
    pool: PgPool,
}

impl PgAuditStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn unavailable(err: sqlx::Error) -> AuditError {
    AuditError::Unavailable(err.to_string())
}

#[async_trait]
impl AuditStore for PgAuditStore {
    async fn create_record(&self, record: &NewAuditRecord) -> Result<Uuid, AuditError> {
        let id = Uuid::new_v4();

        sqlx::query(
            r#"
            INSERT INTO query_audit_logs
                (id, conversation_id, org_id, user_id, correlation_id, question,
                 role, store_id, allowed_views, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(id)
        .bind(&record.conversation_id)
        .bind(&record.org_id)
        .bind(&record.user_id)
        .bind(&record.correlation_id)
        .bind(&record.question)
        .bind(&record.role)
        .bind(record.store_id)
        .bind(Json(&record.allowed_views))
        .bind(AuditStatus::Received.as_str())
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;

        Ok(id)
    }

    async fn mark_running(&self, log_id: Uuid) -> Result<(), AuditError> {
        let result = sqlx::query(
            r#"
            UPDATE query_audit_logs
            SET status = $1, started_at = NOW(), updated_at = NOW()
            WHERE id = $2
            "#,
        )
        .bind(AuditStatus::Running.as_str())
        .bind(log_id)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;

        if result.rows_affected() == 0 {
            return Err(AuditError::NotFound(log_id));
        }
        Ok(())
    }

    async fn append_event(&self, event: &AuditEvent) -> Result<(), AuditError> {
        sqlx::query(
            r#"
            INSERT INTO query_audit_events
                (log_id, stage, status, message, duration_ms, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(event.log_id)
        .bind(&event.stage)
        .bind(event.status.as_str())
        .bind(&event.message)
        .bind(event.duration_ms as i64)
        .bind(Json(&event.metadata))
        .bind(event.created_at)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;

        Ok(())
    }

    async fn finalize(&self, log_id: Uuid, outcome: &AuditOutcome) -> Result<(), AuditError> {
        let error_message = outcome
            .error_message
            .as_ref()
            .map(|m| m.chars().take(MAX_ERROR_MESSAGE).collect::<String>());
        let t = &outcome.timings;

        let result = sqlx::query(FINALIZE_SQL)
            .bind(outcome.status.as_str())
            .bind(&outcome.error_stage)
            .bind(&outcome.error_code)
            .bind(error_message)
            .bind(&outcome.llm_model)
            .bind(Json(&outcome.model_attempts))
            .bind(outcome.token_usage.prompt_tokens as i64)
            .bind(outcome.token_usage.completion_tokens as i64)
            .bind(outcome.token_usage.total_tokens as i64)
            .bind(Json(&outcome.rag_sources))
            .bind(&outcome.generated_sql)
            .bind(outcome.rows_count.map(|r| r as i64))
            .bind(t.rag_ms as i64)
            .bind(t.llm_ms as i64)
            .bind(t.validation_ms as i64)
            .bind(t.exec_ms as i64)
            .bind(t.packing_ms as i64)
            .bind(t.total_ms as i64)
            .bind(outcome.final_response.as_ref().map(Json))
            .bind(outcome.completed_at)
            .bind(log_id)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;

        if result.rows_affected() == 0 {
            return Err(AuditError::NotFound(log_id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIGRATION: &str = include_str!("../../migrations/0001_query_audit.sql");

    #[test]
    fn test_every_stage_timing_is_persisted() {
        for column in ["rag_ms", "llm_ms", "validation_ms", "exec_ms", "packing_ms", "total_ms"] {
            assert!(FINALIZE_SQL.contains(&format!("{} = $", column)), "{}", column);
            assert!(MIGRATION.contains(&format!("{} ", column)), "{}", column);
        }
    }

    #[test]
    fn test_finalize_placeholders_are_contiguous() {
        let highest = (1..=30).rev().find(|n| FINALIZE_SQL.contains(&format!("${}\n", n))).unwrap_or(0);
        assert_eq!(highest, 21);
        for n in 1..=highest {
            assert!(FINALIZE_SQL.contains(&format!("${}", n)), "missing ${}", n);
        }
    }
}
