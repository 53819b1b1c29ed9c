//! SQL Generation
//!
//! Asks an ordered chain of model candidates for one SQL statement plus an
//! intent and a narration. A failed attempt moves straight to the next
//! candidate; the same candidate is never retried.

use crate::error::StageFailure;
use crate::llm::{ChatMessage, Completion, LanguageModelProvider, Prompt, ProviderError, TokenUsage};
use crate::schema_rag::RetrievedContext;
use crate::security::lexer;
use crate::types::{Intent, Stage, Turn, TurnRole};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

const SYSTEM_INSTRUCTIONS: &str = "You are a SQL generation agent for Postgres analytics. \
Return JSON only with keys: query, explain, risk, intent. \
The query must be one single SELECT or WITH...SELECT statement. \
Use only explicitly allowed views and include LIMIT <= 200.";

/// Longest provider error text kept in an attempt record.
const MAX_ERROR_CHARS: usize = 500;
/// Longest snippet content rendered into the prompt.
const MAX_SNIPPET_CHARS: usize = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    RateLimited,
    Timeout,
    Malformed,
    Error,
}

/// One entry of the fallback trace.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelAttempt {
    pub model_name: String,
    pub provider: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub outcome: AttemptOutcome,
    pub token_usage: TokenUsage,
    /// Rate limit caused by a spend/billing cap rather than throughput.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub billing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Risk {
    Low,
    Med,
    High,
}

impl Risk {
    fn parse(raw: Option<&str>) -> Self {
        match raw.map(|r| r.trim().to_lowercase()).as_deref() {
            Some("low") => Risk::Low,
            Some("high") => Risk::High,
            _ => Risk::Med,
        }
    }

    /// Confidence reported to the caller is the inverse of the declared risk.
    pub fn confidence(&self) -> &'static str {
        match self {
            Risk::Low => "high",
            Risk::Med => "medium",
            Risk::High => "low",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedSql {
    pub raw_text: String,
    pub intent: Intent,
    pub narration: String,
    pub risk: Risk,
}

#[derive(Debug, Clone)]
pub struct Generation {
    pub sql: GeneratedSql,
    pub model: String,
    pub attempts: Vec<ModelAttempt>,
}

impl Generation {
    pub fn total_usage(&self) -> TokenUsage {
        total_usage(&self.attempts)
    }
}

#[derive(Error, Debug, Clone)]
pub enum GenerationError {
    #[error("generation_exhausted: {} attempt(s) failed", attempts.len())]
    Exhausted { attempts: Vec<ModelAttempt> },

    #[error("generation deadline exceeded after {} attempt(s)", attempts.len())]
    DeadlineExceeded { attempts: Vec<ModelAttempt> },
}

impl GenerationError {
    pub fn attempts(&self) -> &[ModelAttempt] {
        match self {
            GenerationError::Exhausted { attempts } | GenerationError::DeadlineExceeded { attempts } => attempts,
        }
    }

    pub fn to_failure(&self) -> StageFailure {
        let attempts = self.attempts();
        let metadata = serde_json::json!({ "model_attempts": attempts });
        if let GenerationError::DeadlineExceeded { .. } = self {
            return StageFailure::timed_out(Stage::Generation).with_metadata(metadata);
        }

        let all = |pred: fn(&ModelAttempt) -> bool| !attempts.is_empty() && attempts.iter().all(pred);
        let (status, detail) = if all(|a| a.billing) {
            (402, "All configured models hit billing/spend limits.")
        } else if all(|a| a.outcome == AttemptOutcome::RateLimited) {
            (429, "All configured models are rate-limited. Retry shortly.")
        } else {
            (503, "LLM provider temporary error. Please retry.")
        };
        StageFailure::new(Stage::Generation, "generation_exhausted", detail, status).with_metadata(metadata)
    }
}

/// A provider plus one model name to ask it for.
#[derive(Clone)]
pub struct ModelCandidate {
    pub provider: Arc<dyn LanguageModelProvider>,
    pub model: String,
}

pub struct GenerationStage {
    candidates: Vec<ModelCandidate>,
    attempt_timeout: Duration,
    max_history: usize,
}

impl GenerationStage {
    pub fn new(candidates: Vec<ModelCandidate>, attempt_timeout: Duration, max_history: usize) -> Self {
        Self {
            candidates,
            attempt_timeout,
            max_history,
        }
    }

    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }

    /// Runs the fallback chain until one candidate produces a usable
    /// statement or every candidate has failed. No attempt starts after
    /// `deadline`, and each attempt is capped at the time remaining.
    pub async fn generate(
        &self,
        question: &str,
        context: &RetrievedContext,
        recent_turns: &[Turn],
        allowed_views: &[String],
        deadline: Instant,
    ) -> Result<Generation, GenerationError> {
        let prompt = self.build_prompt(question, context, recent_turns, allowed_views);
        let mut attempts: Vec<ModelAttempt> = Vec::with_capacity(self.candidates.len());

        for candidate in &self.candidates {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(GenerationError::DeadlineExceeded { attempts });
            }
            let timeout = remaining.min(self.attempt_timeout);

            let started_at = Utc::now();
            let clock = Instant::now();
            let result = match tokio::time::timeout(
                timeout,
                candidate.provider.complete(&prompt, &candidate.model, timeout),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout),
            };
            let duration_ms = clock.elapsed().as_millis() as u64;

            let mut attempt = ModelAttempt {
                model_name: candidate.model.clone(),
                provider: candidate.provider.name().to_string(),
                started_at,
                duration_ms,
                outcome: AttemptOutcome::Success,
                token_usage: TokenUsage::default(),
                billing: false,
                error: None,
            };

            match result.and_then(|completion| parse_completion(question, completion)) {
                Ok((sql, completion)) => {
                    attempt.token_usage = completion.usage;
                    attempts.push(attempt);
                    info!(model = %completion.model, attempts = attempts.len(), "SQL generated");
                    return Ok(Generation {
                        sql,
                        model: completion.model,
                        attempts,
                    });
                }
                Err(err) => {
                    warn!(model = %candidate.model, provider = %candidate.provider.name(), error = %err, "model attempt failed");
                    let (outcome, billing) = classify(&err);
                    attempt.outcome = outcome;
                    attempt.billing = billing;
                    attempt.error = Some(err.to_string().chars().take(MAX_ERROR_CHARS).collect());
                    attempts.push(attempt);
                }
            }
        }

        Err(GenerationError::Exhausted { attempts })
    }

    pub fn build_prompt(
        &self,
        question: &str,
        context: &RetrievedContext,
        recent_turns: &[Turn],
        allowed_views: &[String],
    ) -> Prompt {
        let mut messages = vec![ChatMessage::new("system", SYSTEM_INSTRUCTIONS)];

        let skip = recent_turns.len().saturating_sub(self.max_history);
        for turn in &recent_turns[skip..] {
            let role = match turn.role {
                TurnRole::User => "user",
                TurnRole::Assistant => "assistant",
            };
            messages.push(ChatMessage::new(role, turn.content.clone()));
        }

        let rag = if context.is_empty() {
            "No RAG context documents available.".to_string()
        } else {
            context
                .documents
                .iter()
                .map(|d| {
                    let snippet: String = d.content.chars().take(MAX_SNIPPET_CHARS).collect();
                    format!("- [{}] {}: {}", d.doc_type, d.source, snippet)
                })
                .collect::<Vec<_>>()
                .join("\n")
        };
        let views = if allowed_views.is_empty() {
            "none".to_string()
        } else {
            allowed_views.join(", ")
        };

        messages.push(ChatMessage::new(
            "user",
            format!(
                "Question: {question}\n\
                 Allowed views: {views}\n\
                 RAG context:\n{rag}\n\
                 Hard rules:\n\
                 - one statement only\n\
                 - SELECT or WITH...SELECT only\n\
                 - no INSERT/UPDATE/DELETE/DDL\n\
                 - use only allowed views\n\
                 - LIMIT <= 200\n\
                 Return JSON only: {{\"query\":\"...\",\"explain\":\"...\",\"risk\":\"low|med|high\",\
                 \"intent\":\"kpi|trend|ranking|distribution|comparison\"}}."
            ),
        ));

        Prompt { messages }
    }
}

pub fn total_usage(attempts: &[ModelAttempt]) -> TokenUsage {
    let mut total = TokenUsage::default();
    for attempt in attempts {
        total.add(&attempt.token_usage);
    }
    total
}

fn classify(err: &ProviderError) -> (AttemptOutcome, bool) {
    match err {
        ProviderError::RateLimited(_) => (AttemptOutcome::RateLimited, false),
        ProviderError::PaymentRequired(_) => (AttemptOutcome::RateLimited, true),
        ProviderError::Timeout => (AttemptOutcome::Timeout, false),
        ProviderError::Malformed(_) => (AttemptOutcome::Malformed, false),
        ProviderError::Network(_) | ProviderError::Http { .. } | ProviderError::NotConfigured(_) => {
            (AttemptOutcome::Error, false)
        }
    }
}

#[derive(Deserialize)]
struct SqlPayload {
    #[serde(default)]
    query: Option<String>,
    #[serde(default, alias = "narration")]
    explain: Option<String>,
    #[serde(default)]
    risk: Option<String>,
    #[serde(default)]
    intent: Option<String>,
}

/// Strict decode of the model's JSON answer plus the structural checks.
fn parse_completion(question: &str, completion: Completion) -> Result<(GeneratedSql, Completion), ProviderError> {
    let payload = json_objects(&completion.text)
        .into_iter()
        .filter_map(|raw| serde_json::from_str::<SqlPayload>(raw).ok())
        .find(|p| p.query.is_some())
        .ok_or_else(|| ProviderError::Malformed("response carries no SQL payload".to_string()))?;

    let query = payload.query.unwrap_or_default().trim().to_string();
    if query.is_empty() {
        return Err(ProviderError::Malformed("SQL text is empty".to_string()));
    }
    if lexer::statement_count(&query) > 1 {
        return Err(ProviderError::Malformed("response contains multiple statements".to_string()));
    }

    let intent = payload
        .intent
        .as_deref()
        .and_then(Intent::parse)
        .unwrap_or_else(|| Intent::from_question(question));

    let sql = GeneratedSql {
        raw_text: query,
        intent,
        narration: payload.explain.unwrap_or_default(),
        risk: Risk::parse(payload.risk.as_deref()),
    };
    Ok((sql, completion))
}

/// Balanced top-level `{...}` spans of `text`, braces inside JSON strings
/// ignored. Handles bare JSON as well as JSON wrapped in prose or fences.
fn json_objects(text: &str) -> Vec<&str> {
    let mut spans = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' if depth > 0 => in_string = true,
            '{' => {
                if depth == 0 {
                    start = i;
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    spans.push(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    spans
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Replays a fixed answer per model name and records call order.
    struct ScriptedProvider {
        answers: HashMap<String, Result<String, ProviderError>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedProvider {
        fn new(answers: Vec<(&str, Result<&str, ProviderError>)>) -> Arc<Self> {
            Arc::new(Self {
                answers: answers
                    .into_iter()
                    .map(|(m, r)| (m.to_string(), r.map(str::to_string)))
                    .collect(),
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LanguageModelProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, _prompt: &Prompt, model: &str, _timeout: Duration) -> Result<Completion, ProviderError> {
            self.calls.lock().unwrap().push(model.to_string());
            let text = self.answers.get(model).cloned().unwrap_or(Err(ProviderError::Timeout))?;
            Ok(Completion {
                text,
                usage: TokenUsage {
                    prompt_tokens: 10,
                    completion_tokens: 5,
                    total_tokens: 15,
                },
                model: model.to_string(),
            })
        }
    }

    fn stage(provider: Arc<ScriptedProvider>, models: &[&str]) -> GenerationStage {
        let candidates = models
            .iter()
            .map(|m| ModelCandidate {
                provider: provider.clone(),
                model: m.to_string(),
            })
            .collect();
        GenerationStage::new(candidates, Duration::from_secs(5), 8)
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(30)
    }

    #[tokio::test]
    async fn test_falls_back_and_stops_after_success() {
        let provider = ScriptedProvider::new(vec![
            ("primary", Err(ProviderError::RateLimited("429".into()))),
            ("second", Ok("not json at all")),
            ("third", Ok(r#"{"query":"SELECT 1","explain":"one","risk":"low","intent":"kpi"}"#)),
            ("fourth", Ok(r#"{"query":"SELECT 2"}"#)),
        ]);
        let stage = stage(provider.clone(), &["primary", "second", "third", "fourth"]);

        let generation = stage
            .generate("total?", &RetrievedContext::default(), &[], &[], deadline())
            .await
            .unwrap();

        let outcomes: Vec<_> = generation.attempts.iter().map(|a| a.outcome).collect();
        assert_eq!(
            outcomes,
            vec![AttemptOutcome::RateLimited, AttemptOutcome::Malformed, AttemptOutcome::Success]
        );
        assert_eq!(generation.model, "third");
        assert_eq!(generation.sql.raw_text, "SELECT 1");
        assert_eq!(generation.sql.risk.confidence(), "high");
        assert_eq!(*provider.calls.lock().unwrap(), vec!["primary", "second", "third"]);
    }

    #[tokio::test]
    async fn test_multiple_statements_are_malformed() {
        let provider = ScriptedProvider::new(vec![("m", Ok(r#"{"query":"SELECT 1; DROP TABLE x"}"#))]);
        let err = stage(provider, &["m"])
            .generate("q", &RetrievedContext::default(), &[], &[], deadline())
            .await
            .unwrap_err();
        assert_eq!(err.attempts()[0].outcome, AttemptOutcome::Malformed);
    }

    #[tokio::test]
    async fn test_all_timeouts_exhaust_chain() {
        let provider = ScriptedProvider::new(vec![]);
        let err = stage(provider, &["a", "b"])
            .generate("q", &RetrievedContext::default(), &[], &[], deadline())
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::Exhausted { .. }));
        assert_eq!(err.attempts().len(), 2);
        let failure = err.to_failure();
        assert_eq!(failure.code, "generation_exhausted");
        assert_eq!(failure.status, 503);
    }

    #[test]
    fn test_failure_status_by_outcome() {
        let attempt = |outcome, billing| ModelAttempt {
            model_name: "m".into(),
            provider: "p".into(),
            started_at: Utc::now(),
            duration_ms: 1,
            outcome,
            token_usage: TokenUsage::default(),
            billing,
            error: None,
        };
        let rate_limited = GenerationError::Exhausted {
            attempts: vec![attempt(AttemptOutcome::RateLimited, false), attempt(AttemptOutcome::RateLimited, true)],
        };
        assert_eq!(rate_limited.to_failure().status, 429);
        let billing = GenerationError::Exhausted {
            attempts: vec![attempt(AttemptOutcome::RateLimited, true)],
        };
        assert_eq!(billing.to_failure().status, 402);
    }

    #[test]
    fn test_intent_falls_back_to_heuristic() {
        let completion = Completion {
            text: "Here you go:\n```json\n{\"query\": \"SELECT day, sum(amount) FROM v\", \"intent\": \"bogus\"}\n```".into(),
            usage: TokenUsage::default(),
            model: "m".into(),
        };
        let (sql, _) = parse_completion("daily revenue", completion).unwrap();
        assert_eq!(sql.intent, Intent::Trend);
        assert_eq!(sql.risk, Risk::Med);
    }

    #[test]
    fn test_json_objects_ignores_braces_in_strings() {
        let spans = json_objects(r#"x {"a":"}{"} y {"b":1}"#);
        assert_eq!(spans, vec![r#"{"a":"}{"}"#, r#"{"b":1}"#]);
    }

    #[test]
    fn test_prompt_keeps_last_turns() {
        let stage = GenerationStage::new(Vec::new(), Duration::from_secs(1), 2);
        let turns: Vec<Turn> = (0..5)
            .map(|i| Turn {
                role: TurnRole::User,
                content: format!("turn {}", i),
            })
            .collect();
        let prompt = stage.build_prompt("q", &RetrievedContext::default(), &turns, &["v_a".to_string()]);
        assert_eq!(prompt.messages.len(), 4);
        assert_eq!(prompt.messages[1].content, "turn 3");
        assert!(prompt.messages[3].content.contains("Allowed views: v_a"));
    }
}
