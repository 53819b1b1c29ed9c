//! Query service: wires the pipeline from configuration and applies the
//! `POST /run` contract (shared-secret check, scope resolution, recent-turn
//! memory) around [`Orchestrator::run`].

use crate::api::{ErrorBody, RunRequest, RunResponse};
use crate::config::PipelineConfig;
use crate::db::{init_pool, PgAuditStore};
use crate::error::{PipelineError, Result};
use crate::execution::{ExecutionStage, PgStore};
use crate::generation::{GenerationStage, ModelCandidate};
use crate::llm::{LanguageModelProvider, OpenAiCompatibleProvider};
use crate::memory::{ConversationStore, MokaConversationStore};
use crate::observability::audit::AuditRecorder;
use crate::orchestrator::{Orchestrator, ResponseEnvelope};
use crate::schema_rag::{PgVectorStore, RetrievalStage};
use crate::security::guardrail::SqlGuardrail;
use crate::security::scope::ScopePolicy;
use crate::types::Request;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

pub struct QueryService {
    internal_token: Option<String>,
    scope: ScopePolicy,
    orchestrator: Orchestrator,
    conversations: Arc<dyn ConversationStore>,
}

impl QueryService {
    pub fn new(
        internal_token: Option<String>,
        scope: ScopePolicy,
        orchestrator: Orchestrator,
        conversations: Arc<dyn ConversationStore>,
    ) -> Self {
        Self {
            internal_token,
            scope,
            orchestrator,
            conversations,
        }
    }

    /// Builds the Postgres-backed pipeline described by `config`.
    pub async fn from_config(config: &PipelineConfig) -> Result<Self> {
        let pool = init_pool(config.require_database_url()?).await?;

        let mut candidates = Vec::with_capacity(config.candidate_count());
        for endpoint in &config.endpoints {
            if endpoint.api_key.is_empty() {
                warn!(endpoint = %endpoint.name, "endpoint has no API key; its models will fail");
            }
            let provider: Arc<dyn LanguageModelProvider> = Arc::new(OpenAiCompatibleProvider::new(
                endpoint.name.clone(),
                &endpoint.base_url,
                endpoint.api_key.clone(),
            ));
            for model in &endpoint.models {
                candidates.push(ModelCandidate {
                    provider: provider.clone(),
                    model: model.clone(),
                });
            }
        }
        if candidates.is_empty() {
            return Err(PipelineError::Config("no model candidates configured".to_string()));
        }
        info!(candidates = candidates.len(), "model fallback chain configured");

        let max_rows = config.max_result_rows;
        let orchestrator = Orchestrator::new(
            RetrievalStage::new(
                Arc::new(PgVectorStore::new(pool.clone())),
                config.view_catalog.clone(),
                config.rag_top_k,
            ),
            GenerationStage::new(candidates, config.attempt_timeout, config.conversation_max_turns),
            SqlGuardrail::new(max_rows),
            ExecutionStage::new(Arc::new(PgStore::new(pool.clone())), max_rows as usize),
            AuditRecorder::new(Arc::new(PgAuditStore::new(pool))),
            config.budgets,
        );

        Ok(Self::new(
            config.internal_token.clone(),
            ScopePolicy::new(config.view_catalog.clone(), config.unscoped_roles.clone()),
            orchestrator,
            Arc::new(MokaConversationStore::new(
                config.conversation_max_turns,
                config.conversation_ttl,
                config.conversation_capacity,
            )),
        ))
    }

    /// Handles one `POST /run` call. Returns the HTTP status and JSON body.
    pub async fn handle_run(&self, token: Option<&str>, correlation_id: Option<&str>, body: &str) -> (u16, Value) {
        let expected = match self.internal_token.as_deref() {
            Some(expected) => expected,
            None => return error_reply(500, "INTERNAL_TOKEN is not configured."),
        };
        if !token.map(|t| constant_time_eq(t.as_bytes(), expected.as_bytes())).unwrap_or(false) {
            warn!("rejected request with a missing or invalid internal token");
            return error_reply(401, "Invalid internal token.");
        }

        let request: RunRequest = match serde_json::from_str(body) {
            Ok(request) => request,
            Err(e) => return error_reply(422, &format!("Invalid request body: {}", e)),
        };

        match self.ask(request, correlation_id.map(str::to_string)).await {
            Ok(ResponseEnvelope::Success(response)) => (200, serde_json::to_value(&response).unwrap_or(Value::Null)),
            Ok(ResponseEnvelope::Failure(failure)) => (failure.status, error_value(failure.body())),
            Err(e) => error_reply(400, &e.to_string()),
        }
    }

    /// Resolves scope, loads recent turns, runs the pipeline and remembers
    /// the exchange on success. Only a scope error is returned as `Err`.
    pub async fn ask(&self, request: RunRequest, correlation_id: Option<String>) -> Result<ResponseEnvelope> {
        let ctx = &request.user_context;
        let security = self
            .scope
            .resolve(&ctx.role, ctx.store_id, &ctx.allowed_views)
            .map_err(|e| PipelineError::Scope(e.to_string()))?;

        let recent_turns = self.conversations.recent(&request.conversation_id).await;
        let envelope = self
            .orchestrator
            .run(Request {
                conversation_id: request.conversation_id.clone(),
                question: request.question.clone(),
                org_id: request.org_id,
                user_id: request.user_id,
                correlation_id: correlation_id.filter(|c| !c.trim().is_empty()),
                security,
                recent_turns,
            })
            .await;

        if let ResponseEnvelope::Success(response) = &envelope {
            self.conversations
                .append_exchange(&request.conversation_id, &request.question, &assistant_turn(response))
                .await;
        }
        Ok(envelope)
    }
}

fn assistant_turn(response: &RunResponse) -> String {
    format!("{}\nSQL: {}", response.answer, response.sql.query)
}

fn error_value(body: ErrorBody) -> Value {
    serde_json::to_value(body).unwrap_or(Value::Null)
}

fn error_reply(status: u16, detail: &str) -> (u16, Value) {
    (
        status,
        error_value(ErrorBody {
            detail: detail.to_string(),
        }),
    )
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secret2"));
    }
}
