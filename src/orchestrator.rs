//! Orchestrator
//!
//! Runs Retrieval → Generation → Validation → Execution → Packing in order
//! for one request. The parent audit record is created before any stage
//! runs, each stage writes exactly one audit event, and the record is
//! finalized exactly once on every path.
//!
//! Time: the request deadline is the sum of all stage budgets. A stage may
//! use whatever is left of the deadline minus the budgets reserved for the
//! stages after it.

use crate::api::{ErrorBody, RunResponse};
use crate::config::StageBudgets;
use crate::error::StageFailure;
use crate::execution::ExecutionStage;
use crate::generation::{total_usage, GenerationStage, ModelAttempt};
use crate::observability::audit::{AuditOutcome, AuditRecorder, AuditStatus, EventStatus, NewAuditRecord, StageTimings};
use crate::response_packer::{PackInput, ResponsePacker};
use crate::schema_rag::{RetrievalStage, RetrievedContext};
use crate::security::guardrail::{SqlGuardrail, ValidationVerdict};
use crate::types::{Request, Stage};
use serde::Serialize;
use serde_json::json;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Status and duration of one stage, returned with failures.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageTrace {
    pub stage: Stage,
    pub status: EventStatus,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureEnvelope {
    pub log_id: Option<Uuid>,
    pub stage: Option<Stage>,
    pub code: String,
    pub detail: String,
    pub status: u16,
    pub trace: Vec<StageTrace>,
}

impl FailureEnvelope {
    /// The `{detail}` wire body. Never carries downstream error text.
    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            detail: self.detail.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ResponseEnvelope {
    Success(RunResponse),
    Failure(FailureEnvelope),
}

impl ResponseEnvelope {
    pub fn status(&self) -> u16 {
        match self {
            ResponseEnvelope::Success(_) => 200,
            ResponseEnvelope::Failure(f) => f.status,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ResponseEnvelope::Success(_))
    }
}

pub struct Orchestrator {
    retrieval: RetrievalStage,
    generation: GenerationStage,
    guardrail: SqlGuardrail,
    execution: ExecutionStage,
    packer: ResponsePacker,
    audit: AuditRecorder,
    budgets: StageBudgets,
}

/// Per-request bookkeeping that ends up in the audit record.
struct RunState {
    log_id: Uuid,
    started: Instant,
    deadline: Instant,
    trace: Vec<StageTrace>,
    timings: StageTimings,
    rag_sources: Vec<String>,
    model: Option<String>,
    model_attempts: Vec<ModelAttempt>,
    generated_sql: Option<String>,
    rows_count: Option<u64>,
}

impl Orchestrator {
    pub fn new(
        retrieval: RetrievalStage,
        generation: GenerationStage,
        guardrail: SqlGuardrail,
        execution: ExecutionStage,
        audit: AuditRecorder,
        budgets: StageBudgets,
    ) -> Self {
        Self {
            retrieval,
            generation,
            guardrail,
            execution,
            packer: ResponsePacker::new(),
            audit,
            budgets,
        }
    }

    /// Runs one request end to end. Never returns an error: every failure
    /// becomes a [`FailureEnvelope`] after the audit record is finalized.
    pub async fn run(&self, request: Request) -> ResponseEnvelope {
        let span = info_span!("run", conversation_id = %request.conversation_id, role = %request.security.role());
        self.run_inner(request).instrument(span).await
    }

    async fn run_inner(&self, request: Request) -> ResponseEnvelope {
        let started = Instant::now();
        let log_id = match self.audit.begin(&new_record(&request)).await {
            Ok(id) => id,
            Err(e) => {
                error!(error = %e, "audit record could not be created; refusing request");
                return ResponseEnvelope::Failure(FailureEnvelope {
                    log_id: None,
                    stage: None,
                    code: "audit_unavailable".to_string(),
                    detail: "Audit trail unavailable. Please retry.".to_string(),
                    status: 503,
                    trace: Vec::new(),
                });
            }
        };
        info!(%log_id, "request accepted");

        let mut state = RunState {
            log_id,
            started,
            deadline: started + self.budgets.total(),
            trace: Vec::with_capacity(Stage::ORDER.len()),
            timings: StageTimings::default(),
            rag_sources: Vec::new(),
            model: None,
            model_attempts: Vec::new(),
            generated_sql: None,
            rows_count: None,
        };

        match self.run_stages(&request, &mut state).await {
            Ok(response) => {
                state.timings.total_ms = elapsed_ms(state.started);
                let mut outcome = self.outcome(&state, AuditStatus::Success);
                outcome.final_response = serde_json::to_value(&response).ok();
                self.audit.finalize(log_id, &outcome).await;
                info!(%log_id, rows = response.meta.rows, total_ms = state.timings.total_ms, "request completed");
                ResponseEnvelope::Success(response)
            }
            Err(failure) => {
                state.timings.total_ms = elapsed_ms(state.started);
                let mut outcome = self.outcome(&state, AuditStatus::Failed);
                outcome.error_stage = Some(failure.stage.as_str().to_string());
                outcome.error_code = Some(failure.code.clone());
                outcome.error_message = Some(failure.detail.clone());
                self.audit.finalize(log_id, &outcome).await;
                warn!(%log_id, stage = %failure.stage, code = %failure.code, status = failure.status, "request failed");
                ResponseEnvelope::Failure(FailureEnvelope {
                    log_id: Some(log_id),
                    stage: Some(failure.stage),
                    code: failure.code,
                    detail: failure.detail,
                    status: failure.status,
                    trace: state.trace,
                })
            }
        }
    }

    async fn run_stages(&self, request: &Request, state: &mut RunState) -> Result<RunResponse, StageFailure> {
        let security = &request.security;

        // Retrieval: soft failure, the pipeline proceeds with empty context.
        let budget = self.remaining_for(Stage::Retrieval, state.deadline);
        let clock = Instant::now();
        let context = match tokio::time::timeout(budget, self.retrieval.retrieve(&request.question, security)).await {
            Ok(Ok(context)) => {
                state.rag_sources = context.sources();
                let metadata = json!({
                    "documents": context.documents.len(),
                    "filtered_out": context.filtered_out,
                    "sources": state.rag_sources,
                });
                state.timings.rag_ms = self.record(state, Stage::Retrieval, EventStatus::Ok, clock, "context retrieved", metadata).await;
                context
            }
            Ok(Err(e)) => {
                warn!(error = %e, "retrieval failed; continuing without context");
                state.timings.rag_ms = self
                    .record(state, Stage::Retrieval, EventStatus::Degraded, clock, "retrieval failed", json!({ "error": e.to_string() }))
                    .await;
                RetrievedContext::default()
            }
            Err(_) => {
                warn!(budget_ms = budget.as_millis() as u64, "retrieval timed out; continuing without context");
                state.timings.rag_ms = self
                    .record(state, Stage::Retrieval, EventStatus::Degraded, clock, "retrieval timed out", json!({ "budget_ms": budget.as_millis() as u64 }))
                    .await;
                RetrievedContext::default()
            }
        };

        // Generation
        let budget = self.remaining_for(Stage::Generation, state.deadline);
        let clock = Instant::now();
        let generation = self
            .generation
            .generate(&request.question, &context, &request.recent_turns, security.allowed_views(), clock + budget)
            .await;
        let generation = match generation {
            Ok(generation) => {
                state.model_attempts = generation.attempts.clone();
                state.model = Some(generation.model.clone());
                let metadata = json!({ "model": generation.model, "attempts": generation.attempts });
                state.timings.llm_ms = self.record(state, Stage::Generation, EventStatus::Ok, clock, "SQL generated", metadata).await;
                state.generated_sql = Some(generation.sql.raw_text.clone());
                generation
            }
            Err(e) => {
                state.model_attempts = e.attempts().to_vec();
                let failure = e.to_failure();
                state.timings.llm_ms = self.record_failure(state, clock, &failure).await;
                return Err(failure);
            }
        };

        // Validation
        let clock = Instant::now();
        if self.remaining_for(Stage::Validation, state.deadline).is_zero() {
            let failure = StageFailure::timed_out(Stage::Validation);
            state.timings.validation_ms = self.record_failure(state, clock, &failure).await;
            return Err(failure);
        }
        let verdict = self.guardrail.validate(&generation.sql.raw_text, security.allowed_views());
        let (final_sql, rewritten, views_used) = match verdict {
            ValidationVerdict::Accepted {
                final_sql,
                rewritten,
                views_used,
            } => {
                let metadata = json!({ "rewritten": rewritten, "views_used": views_used });
                state.timings.validation_ms = self.record(state, Stage::Validation, EventStatus::Ok, clock, "SQL accepted", metadata).await;
                state.generated_sql = Some(final_sql.clone());
                (final_sql, rewritten, views_used)
            }
            ValidationVerdict::Rejected(rejection) => {
                let failure = StageFailure::new(
                    Stage::Validation,
                    rejection.code.as_str(),
                    format!("Generated SQL was rejected ({}). {}", rejection.code, rejection.code.user_message()),
                    400,
                )
                .with_metadata(json!({
                    "reason_code": rejection.code,
                    "detail": rejection.detail,
                    "ambiguous": rejection.ambiguous,
                }));
                state.timings.validation_ms = self.record_failure(state, clock, &failure).await;
                return Err(failure);
            }
        };

        // Execution
        let budget = self.remaining_for(Stage::Execution, state.deadline);
        let clock = Instant::now();
        if budget.is_zero() {
            let failure = StageFailure::timed_out(Stage::Execution);
            state.timings.exec_ms = self.record_failure(state, clock, &failure).await;
            return Err(failure);
        }
        let result = match self.execution.execute(&final_sql, security, budget).await {
            Ok(result) => {
                state.rows_count = Some(result.row_count as u64);
                let metadata = json!({ "rows": result.row_count, "truncated": result.truncated });
                state.timings.exec_ms = self.record(state, Stage::Execution, EventStatus::Ok, clock, "SQL executed", metadata).await;
                result
            }
            Err(e) => {
                let failure = e.to_failure();
                state.timings.exec_ms = self.record_failure(state, clock, &failure).await;
                return Err(failure);
            }
        };

        // Packing
        let clock = Instant::now();
        if self.remaining_for(Stage::Packing, state.deadline).is_zero() {
            let failure = StageFailure::timed_out(Stage::Packing);
            state.timings.packing_ms = self.record_failure(state, clock, &failure).await;
            return Err(failure);
        }
        let response = self.packer.pack(&PackInput {
            conversation_id: &request.conversation_id,
            question: &request.question,
            intent: generation.sql.intent,
            narration: &generation.sql.narration,
            columns: &result.columns,
            rows: &result.rows,
            security,
            final_sql: &final_sql,
            rewritten,
            views_used: &views_used,
            rag_sources: &state.rag_sources,
            model: &generation.model,
            exec_ms: result.duration_ms,
            confidence: Some(generation.sql.risk.confidence()),
        });
        let metadata = json!({ "widgets": response.widgets.len(), "intent": response.intent });
        state.timings.packing_ms = self.record(state, Stage::Packing, EventStatus::Ok, clock, "response packed", metadata).await;

        Ok(response)
    }

    /// Time `stage` may use: what is left of the deadline minus the budgets
    /// of every later stage.
    fn remaining_for(&self, stage: Stage, deadline: Instant) -> Duration {
        let reserved: Duration = Stage::ORDER
            .iter()
            .skip_while(|s| **s != stage)
            .skip(1)
            .map(|s| self.budgets.for_stage(*s))
            .sum();
        deadline
            .saturating_duration_since(Instant::now())
            .saturating_sub(reserved)
    }

    /// Writes the stage's audit event and returns its duration.
    async fn record(
        &self,
        state: &mut RunState,
        stage: Stage,
        status: EventStatus,
        clock: Instant,
        message: &str,
        metadata: serde_json::Value,
    ) -> u64 {
        let duration_ms = elapsed_ms(clock);
        self.audit
            .record_event(state.log_id, stage.as_str(), status, duration_ms, message, metadata)
            .await;
        state.trace.push(StageTrace {
            stage,
            status,
            duration_ms,
        });
        duration_ms
    }

    async fn record_failure(&self, state: &mut RunState, clock: Instant, failure: &StageFailure) -> u64 {
        let mut metadata = json!({ "code": failure.code, "status": failure.status });
        if let (Some(target), serde_json::Value::Object(extra)) = (metadata.as_object_mut(), &failure.metadata) {
            target.extend(extra.clone());
        }
        self.record(state, failure.stage, EventStatus::Failed, clock, &failure.detail, metadata)
            .await
    }

    fn outcome(&self, state: &RunState, status: AuditStatus) -> AuditOutcome {
        let mut outcome = AuditOutcome::new(status);
        outcome.llm_model = state.model.clone();
        outcome.model_attempts = json!(state.model_attempts);
        outcome.token_usage = total_usage(&state.model_attempts);
        outcome.rag_sources = state.rag_sources.clone();
        outcome.generated_sql = state.generated_sql.clone();
        outcome.rows_count = state.rows_count;
        outcome.timings = state.timings;
        outcome
    }
}

fn new_record(request: &Request) -> NewAuditRecord {
    NewAuditRecord {
        conversation_id: request.conversation_id.clone(),
        org_id: request.org_id.clone(),
        user_id: request.user_id.clone(),
        correlation_id: request.correlation_id.clone(),
        question: request.question.clone(),
        role: request.security.role().to_string(),
        store_id: request.security.store_id(),
        allowed_views: request.security.allowed_views().to_vec(),
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}
