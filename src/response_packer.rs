//! Response Packer
//!
//! Builds the user-facing answer from an execution result. Widget choice is
//! a pure function of the intent and the result shape.

use crate::api::{
    ExplainPayload, Lineage, MetaPayload, RunResponse, SecurityPayload, SqlPayload, Widget, WidgetConfig,
    WidgetDataset, WidgetKind,
};
use crate::types::{Intent, SecurityContext};
use itertools::Itertools;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

lazy_static! {
    static ref ISO_DATE: Regex = Regex::new(r"^\d{4}-\d{2}(-\d{2})?([T ]\d{2}:\d{2})?").unwrap();
}

/// Largest number of distinct x values still drawn as a bar chart.
const MAX_BAR_CATEGORIES: usize = 20;
/// Largest number of points copied into a chart dataset.
const MAX_CHART_POINTS: usize = 30;

const EXPLAIN_NOTES: &str = "SQL built with RAG context + LLM, then validated by strict safety rules.";

/// Everything the packer needs from the earlier stages.
pub struct PackInput<'a> {
    pub conversation_id: &'a str,
    pub question: &'a str,
    pub intent: Intent,
    pub narration: &'a str,
    pub columns: &'a [String],
    pub rows: &'a [Vec<Value>],
    pub security: &'a SecurityContext,
    pub final_sql: &'a str,
    pub rewritten: bool,
    pub views_used: &'a [String],
    pub rag_sources: &'a [String],
    pub model: &'a str,
    pub exec_ms: u64,
    pub confidence: Option<&'a str>,
}

#[derive(Debug, Clone, Default)]
pub struct ResponsePacker;

impl ResponsePacker {
    pub fn new() -> Self {
        Self
    }

    pub fn pack(&self, input: &PackInput<'_>) -> RunResponse {
        let mut notes = EXPLAIN_NOTES.to_string();
        if input.rewritten {
            notes.push_str(" A row limit was appended.");
        }

        RunResponse {
            conversation_id: input.conversation_id.to_string(),
            answer: answer(input.question, input.columns, input.rows, input.narration),
            insights: insights(input.columns, input.rows),
            followups: followups(input.intent),
            intent: input.intent,
            sql: SqlPayload {
                query: input.final_sql.to_string(),
            },
            widgets: widgets(input.intent, input.columns, input.rows),
            explain: ExplainPayload {
                views_used: input.views_used.to_vec(),
                notes,
                rag_sources: input.rag_sources.to_vec(),
            },
            security: SecurityPayload::from(input.security),
            lineage: Lineage {
                views: input.views_used.to_vec(),
                filters: vec!["role_scope".to_string(), "store_scope".to_string()],
            },
            meta: MetaPayload {
                rows: input.rows.len() as u64,
                exec_ms: input.exec_ms,
                model: input.model.to_string(),
                confidence: input.confidence.map(str::to_string),
            },
        }
    }
}

fn answer(question: &str, columns: &[String], rows: &[Vec<Value>], narration: &str) -> String {
    let summary = if rows.is_empty() {
        "No rows returned.".to_string()
    } else if let Some(value) = single_cell(rows) {
        let label = columns.first().map(String::as_str).unwrap_or("value");
        format!("{}: {}", label, display(value))
    } else {
        format!("For '{}', returned {} rows.", question, rows.len())
    };

    let narration = narration.trim();
    if narration.is_empty() {
        summary
    } else {
        format!("{} {}", summary, narration)
    }
}

fn insights(columns: &[String], rows: &[Vec<Value>]) -> Vec<String> {
    if rows.is_empty() {
        return vec!["No data matched the current scope.".to_string()];
    }
    if let Some(value) = single_cell(rows) {
        let label = columns.first().map(String::as_str).unwrap_or("value");
        return vec![
            format!("Primary metric `{}` is {}.", label, display(value)),
            "Result is role-scoped and RLS-safe.".to_string(),
        ];
    }
    vec![
        format!("Returned {} rows.", rows.len()),
        format!("Columns used: {}", columns.join(", ")),
    ]
}

fn followups(intent: Intent) -> Vec<String> {
    let items: [&str; 2] = match intent {
        Intent::Trend => ["Compare last 30 days vs previous 30 days", "Break trend by store"],
        Intent::Ranking => ["Show top 10 only", "Add store-wise ranking"],
        Intent::Distribution => ["Show percentage split", "Filter by store_id"],
        Intent::Comparison => ["Show the difference as a percentage", "Break comparison down by month"],
        Intent::Kpi => ["Show by category", "Compare store 1 vs store 2"],
    };
    items.iter().map(|s| s.to_string()).collect()
}

/// Chart (if any) chosen from intent and shape, then the table fallback.
pub fn widgets(intent: Intent, columns: &[String], rows: &[Vec<Value>]) -> Vec<Widget> {
    let mut widgets = Vec::new();
    if columns.is_empty() {
        return widgets;
    }

    if let Some(value) = single_cell(rows).filter(|v| v.is_number()) {
        let metric = columns[0].clone();
        widgets.push(widget(
            WidgetKind::MetricCard,
            metric.clone(),
            "Primary KPI",
            columns.to_vec(),
            vec![vec![value.clone()]],
            metric,
            columns.to_vec(),
        ));
    } else if let Some(kind) = chart_kind(intent, columns, rows) {
        let (x, y) = (columns[0].clone(), columns[1].clone());
        let points: Vec<Vec<Value>> = rows
            .iter()
            .filter(|r| r.len() >= 2 && r[1].is_number())
            .take(MAX_CHART_POINTS)
            .map(|r| vec![r[0].clone(), r[1].clone()])
            .collect();
        let (title, description) = match kind {
            WidgetKind::Pie => (format!("{} share by {}", y, x), "Distribution view"),
            WidgetKind::Line => (format!("{} over {}", y, x), "Time series"),
            _ => (format!("{} by {}", y, x), "Auto-generated chart"),
        };
        widgets.push(widget(kind, title, description, vec![x.clone(), y.clone()], points, x, vec![y]));
    }

    widgets.push(widget(
        WidgetKind::Table,
        "Query Results".to_string(),
        "Tabular output",
        columns.to_vec(),
        rows.to_vec(),
        columns[0].clone(),
        columns.iter().skip(1).take(1).cloned().collect(),
    ));
    widgets
}

fn chart_kind(intent: Intent, columns: &[String], rows: &[Vec<Value>]) -> Option<WidgetKind> {
    if columns.len() != 2 || rows.is_empty() || !rows.iter().all(|r| r.len() == 2 && r[1].is_number()) {
        return None;
    }
    if is_time_like(&columns[0], rows) {
        return Some(WidgetKind::Line);
    }
    if intent == Intent::Distribution {
        return Some(WidgetKind::Pie);
    }
    let distinct = rows.iter().map(|r| r[0].to_string()).unique().count();
    if distinct <= MAX_BAR_CATEGORIES {
        return Some(WidgetKind::Bar);
    }
    None
}

fn is_time_like(column: &str, rows: &[Vec<Value>]) -> bool {
    let name = column.to_lowercase();
    let by_name = name.contains("date")
        || name.contains("time")
        || name.ends_with("_at")
        || matches!(name.as_str(), "day" | "week" | "month" | "year" | "period");
    let by_value = !rows.is_empty()
        && rows
            .iter()
            .filter_map(|r| r.first())
            .all(|v| v.as_str().map(|s| ISO_DATE.is_match(s)).unwrap_or(false));
    by_name || by_value
}

fn single_cell(rows: &[Vec<Value>]) -> Option<&Value> {
    match rows {
        [row] if row.len() == 1 => row.first(),
        _ => None,
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn widget(
    kind: WidgetKind,
    title: String,
    description: &str,
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
    x: String,
    y: Vec<String>,
) -> Widget {
    Widget {
        kind,
        title,
        description: description.to_string(),
        dataset: WidgetDataset { columns, rows },
        config: WidgetConfig {
            x,
            y,
            series: Vec::new(),
            stack: false,
            unit: String::new(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::scope::ScopePolicy;
    use crate::types::ViewCatalog;
    use serde_json::json;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn kinds(widgets: &[Widget]) -> Vec<WidgetKind> {
        widgets.iter().map(|w| w.kind).collect()
    }

    #[test]
    fn test_single_number_is_metric_card() {
        let w = widgets(Intent::Kpi, &cols(&["total"]), &[vec![json!(42.5)]]);
        assert_eq!(kinds(&w), vec![WidgetKind::MetricCard, WidgetKind::Table]);
    }

    #[test]
    fn test_time_series_is_line() {
        let rows = vec![vec![json!("2024-05-01"), json!(10)], vec![json!("2024-05-02"), json!(12)]];
        let w = widgets(Intent::Kpi, &cols(&["day", "revenue"]), &rows);
        assert_eq!(kinds(&w), vec![WidgetKind::Line, WidgetKind::Table]);
    }

    #[test]
    fn test_distribution_is_pie_and_categories_are_bar() {
        let rows = vec![vec![json!("Action"), json!(5)], vec![json!("Drama"), json!(7)]];
        let columns = cols(&["category", "rentals"]);
        assert_eq!(widgets(Intent::Distribution, &columns, &rows)[0].kind, WidgetKind::Pie);
        assert_eq!(widgets(Intent::Ranking, &columns, &rows)[0].kind, WidgetKind::Bar);
    }

    #[test]
    fn test_high_cardinality_falls_back_to_table() {
        let rows: Vec<Vec<Value>> = (0..25).map(|i| vec![json!(format!("c{}", i)), json!(i)]).collect();
        let w = widgets(Intent::Ranking, &cols(&["customer", "spend"]), &rows);
        assert_eq!(kinds(&w), vec![WidgetKind::Table]);
    }

    #[test]
    fn test_pack_echoes_security_context() {
        let security = ScopePolicy::new(ViewCatalog::new(["v_payment_scoped"]), vec![])
            .resolve("store_manager", 2, &["v_payment_scoped".to_string()])
            .unwrap();
        let columns = cols(&["total"]);
        let rows = vec![vec![json!(99)]];
        let views = cols(&["v_payment_scoped"]);
        let response = ResponsePacker::new().pack(&PackInput {
            conversation_id: "c-1",
            question: "total revenue",
            intent: Intent::Kpi,
            narration: "",
            columns: &columns,
            rows: &rows,
            security: &security,
            final_sql: "SELECT sum(amount) AS total FROM v_payment_scoped LIMIT 200",
            rewritten: true,
            views_used: &views,
            rag_sources: &[],
            model: "m",
            exec_ms: 3,
            confidence: Some("high"),
        });

        assert_eq!(response.answer, "total: 99");
        assert_eq!(response.security.store_id, 2);
        assert!(response.security.rls);
        assert_eq!(response.security.allowed_views, views);
        assert_eq!(response.meta.rows, 1);
        let wire = serde_json::to_value(&response).unwrap();
        assert!(wire["explain"].get("rag_sources").is_none());
        assert_eq!(wire["widgets"][0]["type"], "metric_card");
    }
}
