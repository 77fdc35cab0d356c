//! Chart-shape inference
//!
//! Pure advisory classification of a result set into a chart hint. Never
//! affects the correctness of the underlying data.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartKind {
    Bar,
    Line,
    Pie,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChartHint {
    #[serde(rename = "type")]
    pub kind: ChartKind,
    pub data: Vec<serde_json::Map<String, Value>>,
    #[serde(rename = "xAxis")]
    pub x_axis: String,
    #[serde(rename = "yAxis")]
    pub y_axis: String,
}

impl ChartHint {
    pub fn empty() -> Self {
        Self {
            kind: ChartKind::Bar,
            data: Vec::new(),
            x_axis: String::new(),
            y_axis: String::new(),
        }
    }
}

fn year_month_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{4}-\d{2}$").unwrap())
}

fn is_numeric_like(value: &Value) -> bool {
    match value {
        Value::Number(_) => true,
        Value::String(s) => s.trim().parse::<f64>().is_ok(),
        _ => false,
    }
}

fn is_date_like(value: &Value) -> bool {
    let Value::String(s) = value else {
        return false;
    };
    let s = s.trim();
    chrono::DateTime::parse_from_rfc3339(s).is_ok()
        || chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").is_ok()
        || chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
        || chrono::NaiveDate::parse_from_str(s, "%Y/%m/%d").is_ok()
        || year_month_re().is_match(s)
}

/// Infer a chart hint from the first row's value shapes.
///
/// Date + numeric -> line; text + numeric -> bar, or pie when the result is
/// small (<= 10 rows); otherwise bar over the first two column positions.
pub fn infer_chart(rows: &[serde_json::Map<String, Value>], columns: &[String]) -> ChartHint {
    if rows.is_empty() || columns.is_empty() {
        return ChartHint::empty();
    }

    let first = &rows[0];
    let mut numeric_cols = Vec::new();
    let mut date_cols = Vec::new();
    let mut text_cols = Vec::new();

    for col in columns {
        let value = first.get(col).unwrap_or(&Value::Null);
        if is_date_like(value) {
            date_cols.push(col.clone());
        } else if is_numeric_like(value) {
            numeric_cols.push(col.clone());
        } else if value.is_string() {
            text_cols.push(col.clone());
        }
    }

    let (kind, x_axis, y_axis) = match (date_cols.first(), text_cols.first(), numeric_cols.first())
    {
        (Some(date), _, Some(num)) => (ChartKind::Line, date.clone(), num.clone()),
        (None, Some(text), Some(num)) => {
            let kind = if rows.len() <= 10 { ChartKind::Pie } else { ChartKind::Bar };
            (kind, text.clone(), num.clone())
        }
        _ => (
            ChartKind::Bar,
            columns[0].clone(),
            columns.get(1).unwrap_or(&columns[0]).clone(),
        ),
    };

    // Chart libraries want real numbers; coerce numeric strings per column.
    let data = rows
        .iter()
        .map(|row| {
            let mut processed = serde_json::Map::new();
            for (key, value) in row {
                if numeric_cols.contains(key) {
                    if let Value::String(s) = value {
                        if let Ok(n) = s.trim().parse::<f64>() {
                            if let Some(num) = serde_json::Number::from_f64(n) {
                                processed.insert(key.clone(), Value::Number(num));
                                continue;
                            }
                        }
                    }
                }
                processed.insert(key.clone(), value.clone());
            }
            processed
        })
        .collect();

    ChartHint { kind, data, x_axis, y_axis }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows_from(values: Vec<Value>) -> Vec<serde_json::Map<String, Value>> {
        values
            .into_iter()
            .map(|v| v.as_object().unwrap().clone())
            .collect()
    }

    #[test]
    fn test_date_and_numeric_gives_line() {
        let rows = rows_from(vec![
            json!({"month": "2024-01", "total": 100}),
            json!({"month": "2024-02", "total": 150}),
        ]);
        let hint = infer_chart(&rows, &["month".to_string(), "total".to_string()]);
        assert_eq!(hint.kind, ChartKind::Line);
        assert_eq!(hint.x_axis, "month");
        assert_eq!(hint.y_axis, "total");
    }

    #[test]
    fn test_small_text_numeric_gives_pie() {
        let rows = rows_from(vec![
            json!({"dept": "Eng", "count": 5}),
            json!({"dept": "Sales", "count": 3}),
        ]);
        let hint = infer_chart(&rows, &["dept".to_string(), "count".to_string()]);
        assert_eq!(hint.kind, ChartKind::Pie);
        assert_eq!(hint.x_axis, "dept");
        assert_eq!(hint.y_axis, "count");
    }

    #[test]
    fn test_large_text_numeric_gives_bar() {
        let rows: Vec<_> = (0..12)
            .map(|i| {
                json!({"dept": format!("d{}", i), "count": i})
                    .as_object()
                    .unwrap()
                    .clone()
            })
            .collect();
        let hint = infer_chart(&rows, &["dept".to_string(), "count".to_string()]);
        assert_eq!(hint.kind, ChartKind::Bar);
    }

    #[test]
    fn test_empty_result_gives_empty_hint() {
        let hint = infer_chart(&[], &["a".to_string()]);
        assert_eq!(hint.kind, ChartKind::Bar);
        assert!(hint.x_axis.is_empty());
        assert!(hint.y_axis.is_empty());
        assert!(hint.data.is_empty());
    }

    #[test]
    fn test_all_numeric_falls_back_to_positions() {
        let rows = rows_from(vec![json!({"a": 1, "b": 2})]);
        let hint = infer_chart(&rows, &["a".to_string(), "b".to_string()]);
        assert_eq!(hint.kind, ChartKind::Bar);
        assert_eq!(hint.x_axis, "a");
        assert_eq!(hint.y_axis, "b");
    }

    #[test]
    fn test_numeric_strings_coerced_in_chart_data() {
        let rows = rows_from(vec![json!({"dept": "Eng", "count": "5"})]);
        let hint = infer_chart(&rows, &["dept".to_string(), "count".to_string()]);
        assert_eq!(hint.data[0]["count"], json!(5.0));
    }

    #[test]
    fn test_single_column_uses_same_axis_twice() {
        let rows = rows_from(vec![json!({"n": 1})]);
        let hint = infer_chart(&rows, &["n".to_string()]);
        assert_eq!(hint.x_axis, "n");
        assert_eq!(hint.y_axis, "n");
    }
}
