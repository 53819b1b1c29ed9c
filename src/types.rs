//! Core pipeline types shared by every stage.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Caller-resolved security scope. Built only through
/// [`crate::security::scope::ScopePolicy::resolve`], so an instance always
/// satisfies the catalog and store-scoping invariants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecurityContext {
    pub(crate) role: String,
    pub(crate) store_id: i64,
    pub(crate) allowed_views: Vec<String>,
}

impl SecurityContext {
    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn store_id(&self) -> i64 {
        self.store_id
    }

    /// Allowed views in the order the caller supplied them.
    pub fn allowed_views(&self) -> &[String] {
        &self.allowed_views
    }

    pub fn allows_view(&self, view: &str) -> bool {
        self.allowed_views.iter().any(|v| v.eq_ignore_ascii_case(view))
    }
}

/// The fixed global catalog of queryable views.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewCatalog {
    views: BTreeSet<String>,
}

impl ViewCatalog {
    pub fn new<I, S>(views: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            views: views
                .into_iter()
                .map(|v| v.as_ref().trim().to_lowercase())
                .filter(|v| !v.is_empty())
                .collect(),
        }
    }

    pub fn contains(&self, view: &str) -> bool {
        self.views.contains(&view.to_lowercase())
    }

    pub fn views(&self) -> impl Iterator<Item = &str> {
        self.views.iter().map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

/// One message of the bounded recent-turn window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub content: String,
}

/// An accepted request, created once the gateway token and the security
/// context have been checked.
#[derive(Debug, Clone)]
pub struct Request {
    pub conversation_id: String,
    pub question: String,
    pub org_id: String,
    pub user_id: String,
    pub correlation_id: Option<String>,
    pub security: SecurityContext,
    pub recent_turns: Vec<Turn>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Kpi,
    Trend,
    Ranking,
    Distribution,
    Comparison,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Kpi => "kpi",
            Intent::Trend => "trend",
            Intent::Ranking => "ranking",
            Intent::Distribution => "distribution",
            Intent::Comparison => "comparison",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "kpi" => Some(Intent::Kpi),
            "trend" => Some(Intent::Trend),
            "ranking" => Some(Intent::Ranking),
            "distribution" => Some(Intent::Distribution),
            "comparison" => Some(Intent::Comparison),
            _ => None,
        }
    }

    /// Keyword classification used when the model gives no usable intent.
    pub fn from_question(question: &str) -> Self {
        let q = question.to_lowercase();
        let has_word = |w: &str| q.split(|c: char| !c.is_alphanumeric()).any(|t| t == w);
        if q.contains("trend") || q.contains("daily") || q.contains("over time") {
            Intent::Trend
        } else if has_word("top") || q.contains("rank") {
            Intent::Ranking
        } else if q.contains("distribution") || q.contains("share") {
            Intent::Distribution
        } else if q.contains("compare") || has_word("vs") {
            Intent::Comparison
        } else {
            Intent::Kpi
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A reference snippet returned by the knowledge index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedDocument {
    pub id: Option<i64>,
    pub doc_type: String,
    pub source: String,
    pub content: String,
    pub relevance_score: f32,
}

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Retrieval,
    Generation,
    Validation,
    Execution,
    Packing,
}

impl Stage {
    pub const ORDER: [Stage; 5] = [
        Stage::Retrieval,
        Stage::Generation,
        Stage::Validation,
        Stage::Execution,
        Stage::Packing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Retrieval => "retrieval",
            Stage::Generation => "generation",
            Stage::Validation => "validation",
            Stage::Execution => "execution",
            Stage::Packing => "packing",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intent_heuristics() {
        assert_eq!(Intent::from_question("Daily revenue trend"), Intent::Trend);
        assert_eq!(Intent::from_question("Top 10 customers by spend"), Intent::Ranking);
        assert_eq!(Intent::from_question("Share of rentals per category"), Intent::Distribution);
        assert_eq!(Intent::from_question("store 1 vs store 2"), Intent::Comparison);
        assert_eq!(Intent::from_question("Total revenue this month"), Intent::Kpi);
        // "stop" must not count as "top"
        assert_eq!(Intent::from_question("rentals at the bus stop store"), Intent::Kpi);
    }

    #[test]
    fn test_catalog_is_case_insensitive() {
        let catalog = ViewCatalog::new(["V_Payment_Scoped", " "]);
        assert!(catalog.contains("v_payment_scoped"));
        assert_eq!(catalog.views().count(), 1);
    }
}
