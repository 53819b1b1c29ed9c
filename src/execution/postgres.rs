//! Postgres-backed [`RelationalStore`].
//!
//! Every query runs in its own read-only transaction that is rolled back
//! afterwards. The transaction carries a server-side statement timeout and
//! the caller's scope (`app.role`, `app.store_id`) for the RLS-backed views.

use crate::execution::engine::{QueryOutput, RelationalStore, StoreError};
use crate::types::SecurityContext;
use async_trait::async_trait;
use futures::TryStreamExt;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Column, Executor, Row, TypeInfo};
use std::time::Duration;

/// SQLSTATE for `query_canceled`, raised when `statement_timeout` fires.
const QUERY_CANCELED: &str = "57014";

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RelationalStore for PgStore {
    async fn query(
        &self,
        sql: &str,
        scope: &SecurityContext,
        timeout: Duration,
        max_rows: usize,
    ) -> Result<QueryOutput, StoreError> {
        let mut tx = self.pool.begin().await.map_err(store_error)?;

        sqlx::query("SET TRANSACTION READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(store_error)?;
        sqlx::query(
            "SELECT set_config('statement_timeout', $1, true), \
                    set_config('app.role', $2, true), \
                    set_config('app.store_id', $3, true)",
        )
        .bind(format!("{}ms", timeout.as_millis().max(1)))
        .bind(scope.role())
        .bind(scope.store_id().to_string())
        .execute(&mut *tx)
        .await
        .map_err(store_error)?;

        let mut output = QueryOutput::default();
        {
            let mut stream = sqlx::query(sql).fetch(&mut *tx);
            while let Some(row) = stream.try_next().await.map_err(store_error)? {
                if output.rows.len() >= max_rows {
                    output.truncated = true;
                    break;
                }
                if output.columns.is_empty() {
                    output.columns = row.columns().iter().map(|c| c.name().to_string()).collect();
                }
                output.rows.push(row_to_json(&row));
            }
        }

        if output.columns.is_empty() {
            let described = (&mut *tx).describe(sql).await.map_err(store_error)?;
            output.columns = described.columns().iter().map(|c| c.name().to_string()).collect();
        }

        tx.rollback().await.map_err(store_error)?;
        Ok(output)
    }
}

fn store_error(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.code().as_deref() == Some(QUERY_CANCELED) => StoreError::Timeout,
        sqlx::Error::PoolTimedOut => StoreError::Timeout,
        _ => StoreError::Driver(err.to_string()),
    }
}

fn row_to_json(row: &PgRow) -> Vec<serde_json::Value> {
    (0..row.columns().len()).map(|i| cell_to_json(row, i)).collect()
}

/// Converts one cell by its Postgres type name. Unknown types fall back to
/// their text form, or null when that is not decodable either.
fn cell_to_json(row: &PgRow, index: usize) -> serde_json::Value {
    use serde_json::{json, Value};

    let type_name = row.columns()[index].type_info().name().to_string();
    let value = match type_name.as_str() {
        "BOOL" => row.try_get::<Option<bool>, _>(index).map(|v| json!(v)),
        "INT2" => row.try_get::<Option<i16>, _>(index).map(|v| json!(v)),
        "INT4" => row.try_get::<Option<i32>, _>(index).map(|v| json!(v)),
        "INT8" => row.try_get::<Option<i64>, _>(index).map(|v| json!(v)),
        "FLOAT4" => row.try_get::<Option<f32>, _>(index).map(|v| json!(v)),
        "FLOAT8" => row.try_get::<Option<f64>, _>(index).map(|v| json!(v)),
        "NUMERIC" => row
            .try_get::<Option<sqlx::types::Decimal>, _>(index)
            .map(|v| v.map(|d| decimal_to_json(&d.to_string())).unwrap_or(Value::Null)),
        "DATE" => row
            .try_get::<Option<chrono::NaiveDate>, _>(index)
            .map(|v| json!(v.map(|d| d.to_string()))),
        "TIMESTAMP" => row
            .try_get::<Option<chrono::NaiveDateTime>, _>(index)
            .map(|v| json!(v.map(|d| d.to_string()))),
        "TIMESTAMPTZ" => row
            .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(index)
            .map(|v| json!(v.map(|d| d.to_rfc3339()))),
        "UUID" => row
            .try_get::<Option<uuid::Uuid>, _>(index)
            .map(|v| json!(v.map(|u| u.to_string()))),
        "JSON" | "JSONB" => row
            .try_get::<Option<Value>, _>(index)
            .map(|v| v.unwrap_or(Value::Null)),
        _ => row.try_get::<Option<String>, _>(index).map(|v| json!(v)),
    };
    value.unwrap_or(Value::Null)
}

fn decimal_to_json(text: &str) -> serde_json::Value {
    text.parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(serde_json::Value::Number)
        .unwrap_or_else(|| serde_json::Value::String(text.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decimal_to_json() {
        assert_eq!(decimal_to_json("12.50"), serde_json::json!(12.5));
        assert_eq!(decimal_to_json("NaN"), serde_json::json!("NaN"));
    }
}
