//! Inbound and outbound wire payloads of `POST /run`.

use crate::types::{Intent, SecurityContext};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct UserContextPayload {
    pub role: String,
    pub store_id: i64,
    #[serde(default)]
    pub allowed_views: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunRequest {
    pub conversation_id: String,
    pub question: String,
    pub org_id: String,
    pub user_id: String,
    pub user_context: UserContextPayload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WidgetKind {
    MetricCard,
    Line,
    Bar,
    Pie,
    Table,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WidgetDataset {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WidgetConfig {
    pub x: String,
    pub y: Vec<String>,
    pub series: Vec<String>,
    pub stack: bool,
    pub unit: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Widget {
    #[serde(rename = "type")]
    pub kind: WidgetKind,
    pub title: String,
    pub description: String,
    pub dataset: WidgetDataset,
    pub config: WidgetConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SqlPayload {
    pub query: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExplainPayload {
    pub views_used: Vec<String>,
    pub notes: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rag_sources: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SecurityPayload {
    pub role: String,
    pub store_id: i64,
    pub allowed_views: Vec<String>,
    pub rls: bool,
}

impl From<&SecurityContext> for SecurityPayload {
    fn from(ctx: &SecurityContext) -> Self {
        Self {
            role: ctx.role().to_string(),
            store_id: ctx.store_id(),
            allowed_views: ctx.allowed_views().to_vec(),
            rls: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Lineage {
    pub views: Vec<String>,
    pub filters: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetaPayload {
    pub rows: u64,
    pub exec_ms: u64,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunResponse {
    pub conversation_id: String,
    pub answer: String,
    pub insights: Vec<String>,
    pub followups: Vec<String>,
    pub intent: Intent,
    pub sql: SqlPayload,
    pub widgets: Vec<Widget>,
    pub explain: ExplainPayload,
    pub security: SecurityPayload,
    pub lineage: Lineage,
    pub meta: MetaPayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub detail: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_decodes_gateway_payload() {
        let raw = r#"{"conversation_id":"c","question":"q","org_id":"o","user_id":"u",
                      "user_context":{"role":"store_manager","store_id":1,"allowed_views":["v_payment_scoped"]}}"#;
        let request: RunRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(request.user_context.store_id, 1);
        assert_eq!(request.user_context.allowed_views, vec!["v_payment_scoped"]);
    }

    #[test]
    fn test_widget_kind_wire_name() {
        assert_eq!(serde_json::to_value(WidgetKind::MetricCard).unwrap(), "metric_card");
    }
}
