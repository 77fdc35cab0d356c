//! Query Executor
//!
//! Runs a sanitized SELECT against a user's connection on a fresh
//! connection, decodes rows to JSON dynamically, normalizes nulls, and
//! attaches timing plus a chart hint. Database failures come back as a
//! structured result, never as a panic that could skip connection teardown.

use crate::chart::{infer_chart, ChartHint};
use crate::error::{AskdbError, Result};
use crate::introspect::open_connection;
use crate::safety;
use crate::schema::ConnectionParams;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{Column, Connection, Row, TypeInfo};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Column names suggesting a metric where NULL means "no data" and must be
/// preserved, rather than a count/sum where NULL means zero.
const NULL_PRESERVING_HINTS: [&str; 3] = ["avg", "average", "ratio"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    #[serde(rename = "table_data")]
    pub rows: Vec<serde_json::Map<String, Value>>,
    #[serde(rename = "chart_data")]
    pub chart: ChartHint,
    pub columns: Vec<String>,
    pub row_count: usize,
    /// Wall-clock seconds, rounded to milliseconds.
    pub execution_time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueryResult {
    fn failed(message: String, elapsed: f64) -> Self {
        Self {
            rows: Vec::new(),
            chart: ChartHint::empty(),
            columns: Vec::new(),
            row_count: 0,
            execution_time: elapsed,
            error: Some(message),
        }
    }
}

pub struct QueryExecutor {
    connect_timeout: Duration,
}

impl QueryExecutor {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    /// Execute `sql_text` against `params`. The safety gate runs here again
    /// regardless of what the caller claims to have validated.
    pub async fn execute(&self, sql_text: &str, params: &ConnectionParams) -> Result<QueryResult> {
        let sql = safety::sanitize(sql_text)
            .ok_or_else(|| AskdbError::UnsafeSql(sql_text.to_string()))?;

        let start = Instant::now();
        let mut conn = open_connection(params, self.connect_timeout).await?;
        let fetched = sqlx::query(&sql).fetch_all(&mut conn).await;
        // Fresh connection per operation; close before returning anything.
        if let Err(e) = conn.close().await {
            warn!("error closing query connection: {}", e);
        }

        let elapsed = round_ms(start.elapsed().as_secs_f64());
        let pg_rows = match fetched {
            Ok(rows) => rows,
            Err(e) => {
                error!("query execution failed: {}", e);
                return Ok(QueryResult::failed(e.to_string(), elapsed));
            }
        };

        let columns: Vec<String> = pg_rows
            .first()
            .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
            .unwrap_or_default();

        let raw_rows: Vec<serde_json::Map<String, Value>> = pg_rows
            .iter()
            .map(|row| {
                let mut map = serde_json::Map::new();
                for (i, col) in row.columns().iter().enumerate() {
                    map.insert(col.name().to_string(), decode_value(row, i));
                }
                map
            })
            .collect();

        let rows = normalize_nulls(raw_rows);
        let chart = infer_chart(&rows, &columns);
        info!("executed query returning {} rows in {}s", rows.len(), elapsed);

        Ok(QueryResult {
            row_count: rows.len(),
            rows,
            chart,
            columns,
            execution_time: elapsed,
            error: None,
        })
    }
}

fn round_ms(secs: f64) -> f64 {
    (secs * 1000.0).round() / 1000.0
}

/// Coerce NULLs: preserved for average/ratio-style metric columns where
/// NULL genuinely means "no data", zeroed everywhere else.
pub fn normalize_nulls(
    rows: Vec<serde_json::Map<String, Value>>,
) -> Vec<serde_json::Map<String, Value>> {
    rows.into_iter()
        .map(|row| {
            row.into_iter()
                .map(|(key, value)| {
                    let value = if value.is_null() && !preserves_null(&key) {
                        Value::Number(0.into())
                    } else {
                        value
                    };
                    (key, value)
                })
                .collect()
        })
        .collect()
}

fn preserves_null(column: &str) -> bool {
    let lower = column.to_lowercase();
    NULL_PRESERVING_HINTS.iter().any(|h| lower.contains(h))
}

/// Decode one column of one row into a JSON value based on its Postgres
/// type, falling back to text for anything unrecognized.
fn decode_value(row: &PgRow, index: usize) -> Value {
    use sqlx::ValueRef;
    let value_ref = match row.try_get_raw(index) {
        Ok(v) => v,
        Err(_) => return Value::Null,
    };
    if value_ref.is_null() {
        return Value::Null;
    }

    let type_name = value_ref.type_info().name().to_string();
    match type_name.as_str() {
        "BOOL" => {
            let v: Option<bool> = row.try_get(index).ok();
            serde_json::json!(v)
        }
        "INT2" => {
            let v: Option<i16> = row.try_get(index).ok();
            serde_json::json!(v)
        }
        "INT4" => {
            let v: Option<i32> = row.try_get(index).ok();
            serde_json::json!(v)
        }
        "INT8" => {
            let v: Option<i64> = row.try_get(index).ok();
            serde_json::json!(v)
        }
        "FLOAT4" => {
            let v: Option<f32> = row.try_get(index).ok();
            serde_json::json!(v)
        }
        "FLOAT8" => {
            let v: Option<f64> = row.try_get(index).ok();
            serde_json::json!(v)
        }
        "NUMERIC" => {
            // Kept as a string so precision survives; chart inference
            // treats number-parseable strings as numeric.
            let v: Option<sqlx::types::BigDecimal> = row.try_get(index).ok();
            match v {
                Some(d) => Value::String(d.to_string()),
                None => Value::Null,
            }
        }
        "TEXT" | "VARCHAR" | "CHAR" | "NAME" | "BPCHAR" => {
            let v: Option<String> = row.try_get(index).ok();
            serde_json::json!(v)
        }
        "UUID" => {
            let v: Option<uuid::Uuid> = row.try_get(index).ok();
            serde_json::json!(v.map(|u| u.to_string()))
        }
        "TIMESTAMPTZ" => {
            let v: Option<DateTime<Utc>> = row.try_get(index).ok();
            serde_json::json!(v.map(|t| t.to_rfc3339()))
        }
        "TIMESTAMP" => {
            let v: Option<NaiveDateTime> = row.try_get(index).ok();
            serde_json::json!(v.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string()))
        }
        "DATE" => {
            let v: Option<NaiveDate> = row.try_get(index).ok();
            serde_json::json!(v.map(|d| d.to_string()))
        }
        "JSON" | "JSONB" => {
            let v: Option<Value> = row.try_get(index).ok();
            v.unwrap_or(Value::Null)
        }
        _ => {
            let v: Option<String> = row.try_get(index).ok();
            match v {
                Some(s) => Value::String(s),
                None => Value::String(format!("<{}>", type_name)),
            }
        }
    }
}
