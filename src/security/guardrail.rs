//! SQL Guardrail
//!
//! Deterministic safety gate between generated SQL and the database.
//! Rules run in a fixed order and the first violation rejects:
//!
//! 1. normalize, strip one trailing `;`, reject remaining statements
//! 2. forbidden keyword scan (whole word, case-insensitive)
//! 3. read-only shape (`SELECT`, or `WITH ... SELECT`)
//! 4. relation allow-list for everything read via `FROM`/`JOIN`/`TABLE`
//! 5. result-size guard on the top-level `LIMIT`
//!
//! An accepted statement is finally confirmed by `sqlparser` to be exactly
//! one query. The confirmation can only reject, never accept on its own.

use crate::security::lexer::{normalize, tokenize, LexError, Token};
use serde::{Deserialize, Serialize};
use sqlparser::ast::Statement;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use std::collections::BTreeSet;
use std::fmt;
use std::ops::Range;
use tracing::debug;

pub const DEFAULT_MAX_ROWS: u64 = 200;

/// Mutation, DDL and session-control words that may never appear.
const FORBIDDEN_KEYWORDS: &[&str] = &[
    "insert", "update", "delete", "drop", "alter", "create", "grant", "revoke", "truncate",
    "copy", "merge", "into", "call", "execute", "vacuum", "reindex", "refresh", "lock",
];

/// Server functions that read files, reach other databases, run dynamic SQL
/// or touch session state.
const FORBIDDEN_FUNCTIONS: &[&str] = &[
    "pg_read_file",
    "pg_read_binary_file",
    "pg_ls_dir",
    "pg_stat_file",
    "pg_sleep",
    "pg_terminate_backend",
    "pg_cancel_backend",
    "set_config",
    "dblink",
    "dblink_exec",
    "query_to_xml",
    "query_to_xml_and_xmlschema",
    "lo_import",
    "lo_export",
];

/// Functions whose argument syntax uses a bare `FROM`.
/// Words that open a subquery right after `(`.
const SUBQUERY_STARTS: &[&str] = &["select", "with", "values", "table"];

const FROM_TAKING_FUNCTIONS: &[&str] = &["extract", "substring", "trim", "overlay", "position"];

/// Words that end a FROM list at the current nesting level.
const FROM_LIST_TERMINATORS: &[&str] = &[
    "where", "group", "having", "order", "limit", "offset", "window", "union", "intersect",
    "except", "fetch", "for", "select", "returning",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionCode {
    UnsupportedSyntax,
    MultiStatement,
    ForbiddenKeyword,
    NotReadOnly,
    ViewNotAllowed,
    LimitExceeded,
}

impl RejectionCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionCode::UnsupportedSyntax => "unsupported_syntax",
            RejectionCode::MultiStatement => "multi_statement",
            RejectionCode::ForbiddenKeyword => "forbidden_keyword",
            RejectionCode::NotReadOnly => "not_read_only",
            RejectionCode::ViewNotAllowed => "view_not_allowed",
            RejectionCode::LimitExceeded => "limit_exceeded",
        }
    }

    /// Fixed caller-facing sentence. The statement-specific detail stays in the audit trail.
    pub fn user_message(&self) -> &'static str {
        match self {
            RejectionCode::UnsupportedSyntax => "The query could not be parsed as a supported SELECT statement.",
            RejectionCode::MultiStatement => "Only a single SQL statement is allowed.",
            RejectionCode::ForbiddenKeyword => "The query uses a keyword that is not permitted.",
            RejectionCode::NotReadOnly => "Only read-only SELECT queries are allowed.",
            RejectionCode::ViewNotAllowed => "The query reads from a relation outside your allowed views.",
            RejectionCode::LimitExceeded => "The query asks for more rows than the configured limit.",
        }
    }
}

impl fmt::Display for RejectionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub code: RejectionCode,
    /// Statement-specific explanation. Audit-only; callers see `RejectionCode::user_message`.
    pub detail: String,
    /// Set when the hit may be an identifier or literal that merely
    /// collides with a forbidden word.
    #[serde(default)]
    pub ambiguous: bool,
}

impl Rejection {
    fn new(code: RejectionCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
            ambiguous: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum ValidationVerdict {
    Accepted {
        final_sql: String,
        rewritten: bool,
        views_used: Vec<String>,
    },
    Rejected(Rejection),
}

impl ValidationVerdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ValidationVerdict::Accepted { .. })
    }

    pub fn final_sql(&self) -> Option<&str> {
        match self {
            ValidationVerdict::Accepted { final_sql, .. } => Some(final_sql),
            ValidationVerdict::Rejected(_) => None,
        }
    }

    pub fn rewritten(&self) -> bool {
        matches!(self, ValidationVerdict::Accepted { rewritten: true, .. })
    }

    pub fn reason_code(&self) -> Option<RejectionCode> {
        match self {
            ValidationVerdict::Accepted { .. } => None,
            ValidationVerdict::Rejected(rejection) => Some(rejection.code),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SqlGuardrail {
    max_rows: u64,
}

impl Default for SqlGuardrail {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ROWS)
    }
}

impl SqlGuardrail {
    pub fn new(max_rows: u64) -> Self {
        Self { max_rows }
    }

    pub fn max_rows(&self) -> u64 {
        self.max_rows
    }

    /// Validates `raw_sql` against `allowed_views`. Total: every input yields
    /// exactly one verdict.
    pub fn validate(&self, raw_sql: &str, allowed_views: &[String]) -> ValidationVerdict {
        match self.check(raw_sql, allowed_views) {
            Ok(verdict) => verdict,
            Err(rejection) => {
                debug!(code = %rejection.code, detail = %rejection.detail, "SQL rejected by guardrail");
                ValidationVerdict::Rejected(rejection)
            }
        }
    }

    fn check(&self, raw_sql: &str, allowed_views: &[String]) -> Result<ValidationVerdict, Rejection> {
        // Rule 1: normalize and isolate a single statement
        let normalized = normalize(raw_sql).map_err(unsupported)?;
        let statement = strip_terminator(&normalized);
        let tokens = tokenize(&statement);
        if tokens.iter().any(|t| t.is_symbol(';')) {
            return Err(Rejection::new(
                RejectionCode::MultiStatement,
                "Only a single SQL statement is allowed.",
            ));
        }

        // Rule 2
        check_forbidden_words(&tokens)?;

        // Rule 3
        check_read_only_shape(&tokens)?;

        // Rule 4
        let with = with_clause(&tokens);
        let relations = referenced_relations(&tokens);
        let allowed: BTreeSet<String> = allowed_views.iter().map(|v| v.trim().to_lowercase()).collect();
        let mut views_used: Vec<String> = Vec::new();
        for (position, relation) in &relations {
            let bare = relation.strip_prefix("public.").unwrap_or(relation.as_str());
            if !relation.contains('.') && with.as_ref().map_or(false, |w| w.resolves(relation, *position)) {
                continue;
            }
            if !allowed.contains(bare) {
                return Err(view_not_allowed(relation, &allowed));
            }
            if !views_used.iter().any(|v| v == bare) {
                views_used.push(bare.to_string());
            }
        }

        // Rule 5
        let rewritten = match top_level_limit(&tokens) {
            LimitClause::Missing => true,
            LimitClause::Literal(n) if n <= self.max_rows => false,
            LimitClause::Literal(n) => {
                return Err(Rejection::new(
                    RejectionCode::LimitExceeded,
                    format!("LIMIT {} exceeds the maximum of {} rows.", n, self.max_rows),
                ))
            }
            LimitClause::NonLiteral => {
                return Err(Rejection::new(
                    RejectionCode::LimitExceeded,
                    format!("LIMIT must be a literal row count of at most {}.", self.max_rows),
                ))
            }
        };
        let final_sql = if rewritten {
            format!("{} LIMIT {}", statement, self.max_rows)
        } else {
            statement
        };

        confirm_single_query(&final_sql)?;

        Ok(ValidationVerdict::Accepted {
            final_sql,
            rewritten,
            views_used,
        })
    }
}

fn unsupported(err: LexError) -> Rejection {
    Rejection::new(
        RejectionCode::UnsupportedSyntax,
        format!("SQL could not be checked safely: {}.", err),
    )
}

fn strip_terminator(normalized: &str) -> String {
    normalized
        .strip_suffix(';')
        .unwrap_or(normalized)
        .trim_end()
        .to_string()
}

fn is_forbidden(word: &str) -> bool {
    FORBIDDEN_KEYWORDS.contains(&word) || FORBIDDEN_FUNCTIONS.contains(&word)
}

fn check_forbidden_words(tokens: &[Token]) -> Result<(), Rejection> {
    for token in tokens {
        let (hit, ambiguous) = match token {
            Token::Word(w) => (is_forbidden(w).then(|| w.clone()), false),
            Token::Quoted(q) => {
                let lowered = q.to_lowercase();
                (is_forbidden(&lowered).then_some(lowered), true)
            }
            Token::Literal(text) => (
                text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
                    .map(str::to_lowercase)
                    .find(|w| is_forbidden(w)),
                true,
            ),
            _ => (None, false),
        };
        if let Some(word) = hit {
            let detail = if ambiguous {
                format!(
                    "Forbidden SQL keyword: {} (found inside a quoted identifier or string literal; rephrase to avoid it)",
                    word
                )
            } else {
                format!("Forbidden SQL keyword: {}", word)
            };
            return Err(Rejection {
                code: RejectionCode::ForbiddenKeyword,
                detail,
                ambiguous,
            });
        }
    }
    Ok(())
}

fn check_read_only_shape(tokens: &[Token]) -> Result<(), Rejection> {
    let read_only = match tokens.first() {
        Some(first) if first.is_word("select") => true,
        Some(first) if first.is_word("with") => tokens[1..].iter().any(|t| t.is_word("select")),
        _ => false,
    };
    if read_only {
        Ok(())
    } else {
        Err(Rejection::new(
            RejectionCode::NotReadOnly,
            "Only SELECT/CTE queries are allowed.",
        ))
    }
}

fn identifier(token: &Token) -> Option<String> {
    match token {
        Token::Word(w) => Some(w.clone()),
        Token::Quoted(q) => Some(q.to_lowercase()),
        _ => None,
    }
}

/// Index just past the parenthesised group opening at `open`.
fn skip_group(tokens: &[Token], open: usize) -> usize {
    let mut depth = 0usize;
    for (offset, token) in tokens[open..].iter().enumerate() {
        if token.is_symbol('(') {
            depth += 1;
        } else if token.is_symbol(')') {
            depth = depth.saturating_sub(1);
            if depth == 0 {
                return open + offset + 1;
            }
        }
    }
    tokens.len()
}

struct Cte {
    name: String,
    /// Token range of the parenthesised body.
    body: Range<usize>,
}

/// The leading `WITH` list of a statement.
struct WithClause {
    recursive: bool,
    ctes: Vec<Cte>,
    /// First token of the main query.
    end: usize,
}

impl WithClause {
    /// Whether `name` read at token `position` refers to a CTE. The main
    /// query sees every CTE; a CTE body sees only earlier siblings, unless
    /// the list is `RECURSIVE`. Anything else is a base relation.
    fn resolves(&self, name: &str, position: usize) -> bool {
        let visible = if position >= self.end || self.recursive {
            self.ctes.len()
        } else {
            self.ctes
                .iter()
                .position(|c| c.body.contains(&position))
                .unwrap_or(0)
        };
        self.ctes[..visible].iter().any(|c| c.name == name)
    }
}

fn with_clause(tokens: &[Token]) -> Option<WithClause> {
    if !tokens.first().map_or(false, |t| t.is_word("with")) {
        return None;
    }
    let mut i = 1;
    let recursive = tokens.get(i).map_or(false, |t| t.is_word("recursive"));
    if recursive {
        i += 1;
    }
    let mut ctes = Vec::new();
    while let Some(name) = tokens.get(i).and_then(identifier) {
        i += 1;
        if tokens.get(i).map_or(false, |t| t.is_symbol('(')) {
            i = skip_group(tokens, i);
        }
        if !tokens.get(i).map_or(false, |t| t.is_word("as")) {
            break;
        }
        i += 1;
        while tokens.get(i).map_or(false, |t| t.is_word("not") || t.is_word("materialized")) {
            i += 1;
        }
        if !tokens.get(i).map_or(false, |t| t.is_symbol('(')) {
            break;
        }
        let start = i;
        i = skip_group(tokens, i);
        ctes.push(Cte { name, body: start..i });
        if !tokens.get(i).map_or(false, |t| t.is_symbol(',')) {
            break;
        }
        i += 1;
    }
    Some(WithClause { recursive, ctes, end: i })
}

#[derive(Debug, Default)]
struct Level {
    /// Word right before the `(` that opened this level.
    opener: Option<String>,
    in_from_list: bool,
    expect_relation: bool,
}

/// Every relation read through `FROM`, `JOIN` or `TABLE`, at any nesting
/// depth, lowercased and dotted (`schema.name`), with the index of its first
/// token. Set-returning functions in FROM position are reported under their
/// function name.
fn referenced_relations(tokens: &[Token]) -> Vec<(usize, String)> {
    let mut relations = Vec::new();
    let mut levels = vec![Level::default()];
    let mut i = 0;

    while i < tokens.len() {
        let token = &tokens[i];
        let prev = if i > 0 { tokens.get(i - 1) } else { None };
        let Some(level) = levels.last_mut() else { break };
        let expecting = level.expect_relation;

        if level.expect_relation {
            if token.is_word("only") || token.is_word("lateral") {
                i += 1;
                continue;
            }
            if let Some(first) = identifier(token) {
                let start = i;
                let mut name = first;
                i += 1;
                while tokens.get(i).map_or(false, |t| t.is_symbol('.')) {
                    match tokens.get(i + 1).and_then(identifier) {
                        Some(part) => {
                            name.push('.');
                            name.push_str(&part);
                            i += 2;
                        }
                        None => break,
                    }
                }
                level.expect_relation = false;
                relations.push((start, name));
                continue;
            }
            level.expect_relation = false;
        }

        match token {
            Token::Symbol('(') => {
                let opener = match prev {
                    Some(Token::Word(w)) => Some(w.clone()),
                    _ => None,
                };
                // `FROM (a JOIN b)`: a join tree rather than a subquery
                let join_tree = expecting
                    && !tokens
                        .get(i + 1)
                        .map_or(false, |t| SUBQUERY_STARTS.iter().any(|w| t.is_word(w)));
                levels.push(Level {
                    opener,
                    in_from_list: join_tree,
                    expect_relation: join_tree,
                });
            }
            Token::Symbol(')') => {
                if levels.len() > 1 {
                    levels.pop();
                }
            }
            Token::Symbol(',') if level.in_from_list => level.expect_relation = true,
            Token::Word(w) if w == "from" => {
                let in_function = level
                    .opener
                    .as_deref()
                    .map_or(false, |o| FROM_TAKING_FUNCTIONS.contains(&o));
                let distinct_from = prev.map_or(false, |p| p.is_word("distinct"));
                if !in_function && !distinct_from {
                    level.in_from_list = true;
                    level.expect_relation = true;
                }
            }
            Token::Word(w) if w == "join" => {
                level.in_from_list = true;
                level.expect_relation = true;
            }
            Token::Word(w) if w == "table" => {
                let starts_query = match prev {
                    None => true,
                    Some(Token::Symbol('(')) => true,
                    Some(p) => p.is_word("union") || p.is_word("intersect") || p.is_word("except") || p.is_word("all"),
                };
                if starts_query {
                    level.expect_relation = true;
                }
            }
            Token::Word(w) if FROM_LIST_TERMINATORS.contains(&w.as_str()) => {
                level.in_from_list = false;
            }
            _ => {}
        }
        i += 1;
    }

    relations
}

enum LimitClause {
    Missing,
    Literal(u64),
    NonLiteral,
}

/// Inspects `LIMIT` clauses at parenthesis depth 0. Limits inside
/// subqueries do not bound the outer result.
fn top_level_limit(tokens: &[Token]) -> LimitClause {
    let mut depth = 0usize;
    let mut found = None;
    for (i, token) in tokens.iter().enumerate() {
        if token.is_symbol('(') {
            depth += 1;
        } else if token.is_symbol(')') {
            depth = depth.saturating_sub(1);
        } else if depth == 0 && token.is_word("limit") {
            let value = match tokens.get(i + 1) {
                Some(Token::Number(n)) => n.parse::<u64>().ok(),
                _ => None,
            };
            match (value, found) {
                (None, _) => return LimitClause::NonLiteral,
                (Some(n), Some(prev)) if prev >= n => {}
                (Some(n), _) => found = Some(n),
            }
        }
    }
    match found {
        Some(n) => LimitClause::Literal(n),
        None => LimitClause::Missing,
    }
}

fn view_not_allowed(relation: &str, allowed: &BTreeSet<String>) -> Rejection {
    let suggestion = allowed
        .iter()
        .map(|view| (strsim::normalized_levenshtein(relation, view), view))
        .filter(|(score, _)| *score >= 0.5)
        .max_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, view)| view.clone());
    let detail = match suggestion {
        Some(view) => format!("View not allowed: {} (did you mean {}?)", relation, view),
        None => format!("View not allowed: {}", relation),
    };
    Rejection::new(RejectionCode::ViewNotAllowed, detail)
}

fn confirm_single_query(sql: &str) -> Result<(), Rejection> {
    match Parser::parse_sql(&PostgreSqlDialect {}, sql) {
        Ok(statements) => match statements.as_slice() {
            [Statement::Query(_)] => Ok(()),
            [_] => Err(Rejection::new(
                RejectionCode::NotReadOnly,
                "Only SELECT/CTE queries are allowed.",
            )),
            _ => Err(Rejection::new(
                RejectionCode::MultiStatement,
                "Only a single SQL statement is allowed.",
            )),
        },
        Err(err) => Err(Rejection::new(
            RejectionCode::UnsupportedSyntax,
            format!("SQL could not be parsed: {}", err),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn views(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn reject_code(sql: &str, allowed: &[&str]) -> Option<RejectionCode> {
        SqlGuardrail::default().validate(sql, &views(allowed)).reason_code()
    }

    #[test]
    fn test_appends_limit_when_missing() {
        let verdict = SqlGuardrail::default().validate(
            "SELECT amount FROM v_payment_scoped",
            &views(&["v_payment_scoped"]),
        );
        assert_eq!(
            verdict.final_sql(),
            Some("SELECT amount FROM v_payment_scoped LIMIT 200")
        );
        assert!(verdict.rewritten());
    }

    #[test]
    fn test_accepts_trailing_terminator() {
        let verdict = SqlGuardrail::default()
            .validate("SELECT amount FROM v_payment_scoped LIMIT 10 ;", &views(&["v_payment_scoped"]));
        assert_eq!(verdict.final_sql(), Some("SELECT amount FROM v_payment_scoped LIMIT 10"));
        assert!(!verdict.rewritten());
    }

    #[test]
    fn test_rule_order() {
        // Multi-statement is checked before the keyword scan
        assert_eq!(
            reject_code("SELECT 1; DROP TABLE payment", &[]),
            Some(RejectionCode::MultiStatement)
        );
        // Keyword scan is checked before the shape check
        assert_eq!(reject_code("DELETE FROM payment", &[]), Some(RejectionCode::ForbiddenKeyword));
        assert_eq!(reject_code("VALUES (1)", &[]), Some(RejectionCode::NotReadOnly));
        assert_eq!(reject_code("EXPLAIN SELECT 1", &[]), Some(RejectionCode::NotReadOnly));
    }

    #[test]
    fn test_double_terminator_is_multi_statement() {
        assert_eq!(
            reject_code("SELECT 1 FROM v;;", &["v"]),
            Some(RejectionCode::MultiStatement)
        );
    }

    #[test]
    fn test_keyword_match_is_whole_word() {
        let allowed = ["v_rental_scoped"];
        assert_eq!(reject_code("SELECT last_update, created_at FROM v_rental_scoped", &allowed), None);
        assert_eq!(
            reject_code("SELECT * INTO backup FROM v_rental_scoped", &allowed),
            Some(RejectionCode::ForbiddenKeyword)
        );
        assert_eq!(
            reject_code("SELECT pg_sleep(10) FROM v_rental_scoped", &allowed),
            Some(RejectionCode::ForbiddenKeyword)
        );
    }

    #[test]
    fn test_keyword_in_literal_is_flagged_ambiguous() {
        let verdict = SqlGuardrail::default().validate(
            "SELECT count(*) FROM v_rental_scoped WHERE note = 'please update'",
            &views(&["v_rental_scoped"]),
        );
        match verdict {
            ValidationVerdict::Rejected(rejection) => {
                assert_eq!(rejection.code, RejectionCode::ForbiddenKeyword);
                assert!(rejection.ambiguous);
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_with_requires_select() {
        let allowed = ["v_payment_scoped"];
        assert_eq!(
            reject_code(
                "WITH totals AS (SELECT customer_id, sum(amount) AS s FROM v_payment_scoped GROUP BY customer_id) SELECT * FROM totals",
                &allowed
            ),
            None
        );
        assert_eq!(reject_code("WITH x", &allowed), Some(RejectionCode::NotReadOnly));
    }

    #[test]
    fn test_relations_in_every_position_are_checked() {
        let allowed = ["v_payment_scoped", "v_customer_masked"];
        for sql in [
            "SELECT * FROM v_payment_scoped, customer",
            "SELECT * FROM v_payment_scoped p JOIN customer c ON c.id = p.customer_id",
            "SELECT * FROM v_payment_scoped WHERE customer_id IN (SELECT id FROM customer)",
            "SELECT * FROM v_payment_scoped WHERE EXISTS (TABLE customer)",
            "SELECT * FROM ONLY customer",
            "SELECT * FROM pg_catalog.pg_user",
            "SELECT * FROM generate_series(1, 10)",
            "SELECT * FROM \"customer\"",
            "SELECT * FROM (customer CROSS JOIN v_payment_scoped) LIMIT 5",
            "SELECT * FROM (v_payment_scoped p JOIN (customer c JOIN v_customer_masked m ON m.id = c.id) ON p.customer_id = c.id)",
        ] {
            assert_eq!(reject_code(sql, &allowed), Some(RejectionCode::ViewNotAllowed), "{}", sql);
        }
    }

    #[test]
    fn test_parenthesised_join_of_allowed_views() {
        let verdict = SqlGuardrail::default().validate(
            "SELECT * FROM (v_payment_scoped p JOIN v_customer_masked c ON c.customer_id = p.customer_id) LIMIT 5",
            &views(&["v_payment_scoped", "v_customer_masked"]),
        );
        match verdict {
            ValidationVerdict::Accepted { views_used, .. } => {
                assert_eq!(views_used, vec!["v_payment_scoped", "v_customer_masked"])
            }
            other => panic!("expected acceptance, got {:?}", other),
        }
        assert_eq!(
            reject_code("SELECT * FROM (SELECT * FROM customer) s", &["v_payment_scoped"]),
            Some(RejectionCode::ViewNotAllowed)
        );
    }

    #[test]
    fn test_cte_name_cannot_shadow_a_base_table() {
        let allowed = ["v_payment_scoped"];
        for sql in [
            "WITH customer AS (SELECT * FROM customer) SELECT * FROM customer",
            "WITH a AS (SELECT * FROM customer), customer AS (SELECT 1) SELECT * FROM a",
        ] {
            assert_eq!(reject_code(sql, &allowed), Some(RejectionCode::ViewNotAllowed), "{}", sql);
        }
    }

    #[test]
    fn test_cte_scope() {
        let allowed = ["v_payment_scoped"];
        // Earlier siblings and the main query see a CTE
        assert_eq!(
            reject_code(
                "WITH a AS (SELECT amount FROM v_payment_scoped), b AS (SELECT * FROM a) SELECT * FROM b JOIN a ON true",
                &allowed
            ),
            None
        );
        // A recursive CTE may read itself
        assert_eq!(
            reject_code(
                "WITH RECURSIVE n AS (SELECT 1 AS x UNION ALL SELECT x + 1 FROM n WHERE x < 5) SELECT * FROM n",
                &allowed
            ),
            None
        );
    }

    #[test]
    fn test_non_relation_from_is_ignored() {
        let allowed = ["v_rental_scoped"];
        assert_eq!(
            reject_code(
                "SELECT extract(month FROM rental_date) AS m, count(*) FROM v_rental_scoped GROUP BY 1",
                &allowed
            ),
            None
        );
        assert_eq!(
            reject_code(
                "SELECT count(*) FROM v_rental_scoped WHERE return_date IS DISTINCT FROM rental_date",
                &allowed
            ),
            None
        );
    }

    #[test]
    fn test_schema_qualified_public_view_is_allowed() {
        let verdict = SqlGuardrail::default()
            .validate("SELECT * FROM public.v_payment_scoped LIMIT 5", &views(&["v_payment_scoped"]));
        assert!(verdict.is_accepted());
        match verdict {
            ValidationVerdict::Accepted { views_used, .. } => assert_eq!(views_used, vec!["v_payment_scoped"]),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_suggests_closest_view() {
        let verdict = SqlGuardrail::default()
            .validate("SELECT * FROM v_payment", &views(&["v_payment_scoped", "v_rental_scoped"]));
        match verdict {
            ValidationVerdict::Rejected(rejection) => {
                assert!(rejection.detail.contains("did you mean v_payment_scoped"), "{}", rejection.detail)
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_only_top_level_limit_counts() {
        let verdict = SqlGuardrail::default().validate(
            "SELECT * FROM v_payment_scoped WHERE customer_id IN (SELECT customer_id FROM v_payment_scoped LIMIT 5)",
            &views(&["v_payment_scoped"]),
        );
        assert!(verdict.rewritten());
        assert!(verdict.final_sql().unwrap().ends_with("LIMIT 200"));
    }

    #[test]
    fn test_limit_bounds() {
        let allowed = ["v_rental_scoped"];
        assert_eq!(reject_code("SELECT * FROM v_rental_scoped LIMIT 200", &allowed), None);
        assert_eq!(
            reject_code("SELECT * FROM v_rental_scoped LIMIT 201", &allowed),
            Some(RejectionCode::LimitExceeded)
        );
        assert_eq!(
            reject_code("SELECT * FROM v_rental_scoped LIMIT ALL", &allowed),
            Some(RejectionCode::LimitExceeded)
        );
    }

    #[test]
    fn test_comment_cannot_fake_a_limit() {
        let verdict = SqlGuardrail::default()
            .validate("SELECT * FROM v_rental_scoped -- LIMIT 5", &views(&["v_rental_scoped"]));
        assert_eq!(verdict.final_sql(), Some("SELECT * FROM v_rental_scoped LIMIT 200"));
    }

    #[test]
    fn test_dollar_quote_is_unsupported() {
        assert_eq!(
            reject_code("SELECT * FROM v WHERE x = $$ LIMIT 5 $$", &["v"]),
            Some(RejectionCode::UnsupportedSyntax)
        );
    }

    #[test]
    fn test_revalidation_is_idempotent() {
        let guardrail = SqlGuardrail::default();
        let allowed = views(&["v_payment_scoped"]);
        let first = guardrail.validate("select  customer_id, sum(amount)\nfrom v_payment_scoped group by 1;", &allowed);
        let sql = first.final_sql().unwrap().to_string();
        let second = guardrail.validate(&sql, &allowed);
        assert_eq!(second.final_sql(), Some(sql.as_str()));
        assert!(!second.rewritten());
    }

    #[test]
    fn test_scenario_select_gets_default_limit() {
        let verdict = SqlGuardrail::default().validate("SELECT amount FROM v_payment_scoped", &views(&["v_payment_scoped"]));
        assert!(verdict.is_accepted());
        assert_eq!(verdict.final_sql(), Some("SELECT amount FROM v_payment_scoped LIMIT 200"));
        assert!(verdict.rewritten());
    }

    #[test]
    fn test_scenario_delete_is_forbidden() {
        assert_eq!(reject_code("DELETE FROM payment", &[]), Some(RejectionCode::ForbiddenKeyword));
    }

    #[test]
    fn test_scenario_base_table_outside_allowed_views() {
        assert_eq!(
            reject_code("SELECT * FROM customer", &["v_customer_masked"]),
            Some(RejectionCode::ViewNotAllowed)
        );
    }

    #[test]
    fn test_scenario_two_statements() {
        assert_eq!(
            reject_code("SELECT a FROM t; SELECT b FROM t2", &[]),
            Some(RejectionCode::MultiStatement)
        );
    }

    #[test]
    fn test_scenario_limit_above_ceiling() {
        assert_eq!(
            reject_code("SELECT count(*) FROM v_rental_scoped LIMIT 5000", &["v_rental_scoped"]),
            Some(RejectionCode::LimitExceeded)
        );
    }

    #[test]
    fn test_user_message_is_fixed_per_code() {
        let verdict = SqlGuardrail::default().validate("SELECT * FROM v_payment", &views(&["v_payment_scoped"]));
        match verdict {
            ValidationVerdict::Rejected(rejection) => {
                assert_eq!(rejection.code.user_message(), RejectionCode::ViewNotAllowed.user_message());
                assert!(!rejection.code.user_message().contains("v_payment"));
                assert!(rejection.detail.contains("did you mean"));
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }
}
