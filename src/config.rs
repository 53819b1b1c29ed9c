//! Pipeline configuration loaded from the environment.

use crate::error::{PipelineError, Result};
use crate::types::{Stage, ViewCatalog};
use itertools::Itertools;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_MODEL: &str = "meta-llama/llama-3.2-3b-instruct:free";
pub const DEFAULT_VIEW_CATALOG: &str = "v_payment_scoped,v_rental_scoped,v_customer_masked";

/// One OpenAI-compatible endpoint and the models to try on it.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub name: String,
    pub base_url: String,
    pub api_key: String,
    pub models: Vec<String>,
}

/// Time budget per stage. The request deadline is the sum of all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageBudgets {
    pub retrieval: Duration,
    pub generation: Duration,
    pub validation: Duration,
    pub execution: Duration,
    pub packing: Duration,
}

impl StageBudgets {
    pub fn for_stage(&self, stage: Stage) -> Duration {
        match stage {
            Stage::Retrieval => self.retrieval,
            Stage::Generation => self.generation,
            Stage::Validation => self.validation,
            Stage::Execution => self.execution,
            Stage::Packing => self.packing,
        }
    }

    pub fn total(&self) -> Duration {
        Stage::ORDER.iter().map(|s| self.for_stage(*s)).sum()
    }
}

impl Default for StageBudgets {
    fn default() -> Self {
        Self {
            retrieval: Duration::from_millis(3_000),
            generation: Duration::from_millis(60_000),
            validation: Duration::from_millis(1_000),
            execution: Duration::from_millis(15_000),
            packing: Duration::from_millis(1_000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub internal_token: Option<String>,
    pub database_url: Option<String>,
    pub endpoints: Vec<EndpointConfig>,
    pub attempt_timeout: Duration,
    pub budgets: StageBudgets,
    pub rag_top_k: usize,
    pub max_result_rows: u64,
    pub view_catalog: ViewCatalog,
    pub unscoped_roles: Vec<String>,
    pub conversation_max_turns: usize,
    pub conversation_ttl: Duration,
    pub conversation_capacity: u64,
    pub bind_addr: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            internal_token: None,
            database_url: None,
            endpoints: Vec::new(),
            attempt_timeout: Duration::from_millis(30_000),
            budgets: StageBudgets::default(),
            rag_top_k: 5,
            max_result_rows: 200,
            view_catalog: ViewCatalog::new(split_list(DEFAULT_VIEW_CATALOG)),
            unscoped_roles: vec!["admin".to_string()],
            conversation_max_turns: 8,
            conversation_ttl: Duration::from_secs(3_600),
            conversation_capacity: 10_000,
            bind_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Reads the configuration from process environment variables.
    /// Call `dotenv::dotenv().ok()` first to pick up a `.env` file.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let mut endpoints = Vec::new();
        let primary_model = env_string("OPENROUTER_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let fallbacks = env_string("OPENROUTER_FALLBACK_MODELS").unwrap_or_default();
        endpoints.push(EndpointConfig {
            name: "openrouter".to_string(),
            base_url: env_string("OPENROUTER_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key: env_string("OPENROUTER_API_KEY").unwrap_or_default(),
            models: unique_models(std::iter::once(primary_model).chain(split_list(&fallbacks))),
        });
        if let Some(base_url) = env_string("SECONDARY_LLM_BASE_URL") {
            let models = unique_models(split_list(&env_string("SECONDARY_LLM_MODELS").unwrap_or_default()));
            if models.is_empty() {
                warn!("SECONDARY_LLM_BASE_URL is set but SECONDARY_LLM_MODELS is empty; ignoring secondary endpoint");
            } else {
                endpoints.push(EndpointConfig {
                    name: "secondary".to_string(),
                    base_url,
                    api_key: env_string("SECONDARY_LLM_API_KEY").unwrap_or_default(),
                    models,
                });
            }
        }

        let budgets = StageBudgets {
            retrieval: env_millis("RETRIEVAL_BUDGET_MS", defaults.budgets.retrieval),
            generation: env_millis("GENERATION_BUDGET_MS", defaults.budgets.generation),
            validation: env_millis("VALIDATION_BUDGET_MS", defaults.budgets.validation),
            execution: env_millis("EXECUTION_BUDGET_MS", defaults.budgets.execution),
            packing: env_millis("PACKING_BUDGET_MS", defaults.budgets.packing),
        };

        Self {
            internal_token: env_string("INTERNAL_TOKEN"),
            database_url: env_string("DATABASE_URL"),
            endpoints,
            attempt_timeout: env_millis("LLM_ATTEMPT_TIMEOUT_MS", defaults.attempt_timeout),
            budgets,
            rag_top_k: get_env_var("RAG_TOP_K", defaults.rag_top_k),
            max_result_rows: get_env_var("MAX_RESULT_ROWS", defaults.max_result_rows),
            view_catalog: ViewCatalog::new(split_list(
                &env_string("VIEW_CATALOG").unwrap_or_else(|| DEFAULT_VIEW_CATALOG.to_string()),
            )),
            unscoped_roles: env_string("UNSCOPED_ROLES")
                .map(|raw| split_list(&raw).map(|r| r.to_lowercase()).collect())
                .unwrap_or(defaults.unscoped_roles),
            conversation_max_turns: get_env_var("CONVERSATION_MAX_TURNS", defaults.conversation_max_turns),
            conversation_ttl: Duration::from_secs(get_env_var(
                "CONVERSATION_TTL_SECS",
                defaults.conversation_ttl.as_secs(),
            )),
            conversation_capacity: get_env_var("CONVERSATION_CAPACITY", defaults.conversation_capacity),
            bind_addr: env_string("BIND_ADDR").unwrap_or(defaults.bind_addr),
        }
    }

    pub fn require_database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .ok_or_else(|| PipelineError::Config("DATABASE_URL is not configured".to_string()))
    }

    /// Total number of model candidates across all endpoints.
    pub fn candidate_count(&self) -> usize {
        self.endpoints.iter().map(|e| e.models.len()).sum()
    }
}

fn env_string(name: &str) -> Option<String> {
    env::var(name).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn get_env_var<T: FromStr>(name: &str, default: T) -> T {
    match env_string(name) {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("Invalid value for {}: {:?}, using default", name, raw);
            default
        }),
        None => default,
    }
}

fn env_millis(name: &str, default: Duration) -> Duration {
    Duration::from_millis(get_env_var(name, default.as_millis() as u64))
}

fn split_list(raw: &str) -> impl Iterator<Item = String> + '_ {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}

/// Keeps the first occurrence of every model name, preserving order.
fn unique_models(models: impl Iterator<Item = String>) -> Vec<String> {
    models.unique().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_models_keeps_order() {
        let models = unique_models(split_list("a, b ,a,,c,b"));
        assert_eq!(models, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_deadline_is_sum_of_budgets() {
        let budgets = StageBudgets::default();
        assert_eq!(budgets.total(), Duration::from_millis(80_000));
    }

    #[test]
    fn test_default_catalog() {
        let config = PipelineConfig::default();
        assert!(config.view_catalog.contains("v_customer_masked"));
        assert_eq!(config.max_result_rows, 200);
    }
}
