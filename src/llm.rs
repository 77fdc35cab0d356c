//! NL->SQL generator
//!
//! The external text-generation collaborator behind an explicit contract:
//! generation either yields text or is `Unavailable` with a reason. The
//! output is never trusted; callers run it through the safety gate and fall
//! back to a deterministic schema-derived query when anything goes wrong.

use crate::config::ServiceConfig;
use crate::error::{AskdbError, Result};
use crate::schema::DatabaseSchema;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KpiSuggestion {
    pub id: String,
    pub name: String,
    pub description: String,
    pub query_template: String,
    pub category: String,
}

/// Result variant of one generation attempt. "AI unavailable" is an
/// expected condition, not an error path.
#[derive(Debug, Clone)]
pub enum SqlGeneration {
    Generated(String),
    Unavailable(String),
}

#[async_trait]
pub trait SqlGenerator: Send + Sync {
    /// Translate a natural-language question into candidate SQL text.
    /// May be slow, may return malformed text; never trusted downstream.
    async fn generate_sql(
        &self,
        query: &str,
        schema: &DatabaseSchema,
        sector: &str,
    ) -> SqlGeneration;

    /// Suggest 5 KPI questions a user of this schema might ask.
    async fn suggest_kpis(&self, schema: &DatabaseSchema, sector: &str) -> Vec<KpiSuggestion>;
}

#[derive(Clone)]
pub struct LlmClient {
    api_key: String,
    base_url: String,
    model: String,
}

impl LlmClient {
    pub fn new(api_key: String, model: String, base_url: String) -> Self {
        Self {
            api_key,
            base_url,
            model,
        }
    }

    pub fn from_config(config: &ServiceConfig) -> Self {
        Self::new(
            config.llm_api_key.clone(),
            config.llm_model.clone(),
            config.llm_base_url.clone(),
        )
    }

    async fn call_llm(&self, system_prompt: &str, user_prompt: &str) -> Result<String> {
        if self.api_key.is_empty() {
            return Err(AskdbError::Llm("no API key configured".to_string()));
        }

        let client = reqwest::Client::new();
        let body = serde_json::json!({
            "contents": [{
                "role": "user",
                "parts": [{"text": format!("{}\n\n{}", system_prompt, user_prompt)}]
            }],
            "generationConfig": {"temperature": 0.1}
        });

        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );
        let response = client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| AskdbError::Llm(format!("LLM API call failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AskdbError::Llm(format!(
                "LLM API error ({}): {}",
                status, error_text
            )));
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AskdbError::Llm(format!("Failed to parse LLM response: {}", e)))?;

        let content = response_json["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .ok_or_else(|| {
                AskdbError::Llm(format!(
                    "No text in LLM response. Response structure: {}",
                    response_json
                ))
            })?;

        if content.trim().is_empty() {
            return Err(AskdbError::Llm("Empty content in LLM response".to_string()));
        }

        Ok(content.to_string())
    }
}

#[async_trait]
impl SqlGenerator for LlmClient {
    async fn generate_sql(
        &self,
        query: &str,
        schema: &DatabaseSchema,
        sector: &str,
    ) -> SqlGeneration {
        let system_prompt = format!(
            "You are an expert SQL generator for {} business data analysis.\n\
             Rules:\n\
             1. Generate safe, read-only SELECT queries only\n\
             2. Use proper PostgreSQL syntax\n\
             3. Include appropriate WHERE clauses for filtering\n\
             4. Use aggregate functions when appropriate (COUNT, SUM, AVG, etc.)\n\
             5. Add ORDER BY and LIMIT when helpful\n\
             6. Use COALESCE for null handling and NULLIF to prevent division by zero\n\
             7. Return ONLY the SQL query with no markdown, no code blocks, start directly with SELECT",
            sector
        );
        let user_prompt = format!(
            "Schema:\n{}\n\nGenerate SQL for: {}\nReturn ONLY the SQL query starting with SELECT.",
            format_schema(schema),
            query
        );

        match self.call_llm(&system_prompt, &user_prompt).await {
            Ok(raw) => {
                let sql = clean_sql_response(&raw);
                if sql.is_empty() {
                    warn!("LLM returned no usable SQL text");
                    SqlGeneration::Unavailable("empty SQL response".to_string())
                } else {
                    info!("generated SQL: {}", sql);
                    SqlGeneration::Generated(sql)
                }
            }
            Err(e) => {
                warn!("SQL generation unavailable: {}", e);
                SqlGeneration::Unavailable(e.to_string())
            }
        }
    }

    async fn suggest_kpis(&self, schema: &DatabaseSchema, sector: &str) -> Vec<KpiSuggestion> {
        let system_prompt = "You are an expert data analyst who generates KPI (Key Performance Indicator) suggestions based on database schemas.\n\
             Rules:\n\
             1. Generate exactly 5 practical KPI suggestions\n\
             2. Focus on measurable business metrics relevant to the sector\n\
             3. Consider totals, counts, averages, trends, ratios\n\
             4. Include natural language query templates users can ask\n\
             5. Categorize KPIs (Financial, Operational, Customer, Performance)\n\
             Respond with a JSON array of objects with id, name, description, query_template, category.";
        let user_prompt = format!(
            "Business Sector: {}\n\nDatabase Schema:\n{}\n\nGenerate the 5 KPI suggestions now.",
            sector,
            format_schema(schema)
        );

        match self.call_llm(system_prompt, &user_prompt).await {
            Ok(raw) => match parse_suggestions(&raw) {
                Some(suggestions) if !suggestions.is_empty() => suggestions,
                _ => {
                    warn!("could not parse KPI suggestions, using fallback");
                    fallback_suggestions(sector)
                }
            },
            Err(e) => {
                warn!("KPI suggestion generation unavailable: {}", e);
                fallback_suggestions(sector)
            }
        }
    }
}

fn select_re() -> &'static regex::Regex {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"(?i)\bselect\b").unwrap())
}

fn fence_re() -> &'static regex::Regex {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"(?i)```(?:sql)?").unwrap())
}

fn format_schema(schema: &DatabaseSchema) -> String {
    serde_json::to_string_pretty(schema).unwrap_or_else(|_| "{}".to_string())
}

/// Clean raw generator output: strip code fences, discard any prose before
/// the first SELECT, collapse whitespace. Returns "" when no SELECT exists.
pub fn clean_sql_response(raw: &str) -> String {
    let mut text = raw.trim().to_string();
    if text.contains("```") {
        text = fence_re().replace_all(&text, "").trim().to_string();
    }

    let Some(m) = select_re().find(&text) else {
        return String::new();
    };
    text[m.start()..]
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Deterministic schema-derived default: a bounded sample of the first
/// known table's leading columns, or a trivial constant when the database
/// has no tables at all.
pub fn fallback_sql(schema: &DatabaseSchema) -> String {
    let Some((table, table_schema)) = schema.tables.iter().next() else {
        return "SELECT 1".to_string();
    };
    let columns = table_schema.ordered_columns();
    let column_list = if columns.is_empty() {
        "*".to_string()
    } else {
        columns
            .iter()
            .take(5)
            .cloned()
            .collect::<Vec<_>>()
            .join(", ")
    };
    format!("SELECT {} FROM {} LIMIT 10", column_list, table)
}

fn parse_suggestions(raw: &str) -> Option<Vec<KpiSuggestion>> {
    let cleaned = raw
        .trim()
        .replace("```json", "")
        .replace("```", "")
        .trim()
        .to_string();
    let items: Vec<serde_json::Value> = serde_json::from_str(&cleaned).ok()?;
    let suggestions: Vec<KpiSuggestion> = items
        .into_iter()
        .filter_map(|v| serde_json::from_value(v).ok())
        .take(5)
        .collect();
    Some(suggestions)
}

/// Hardcoded per-sector suggestions used whenever the generator is
/// unavailable or returns something unparseable.
pub fn fallback_suggestions(sector: &str) -> Vec<KpiSuggestion> {
    let make = |id: &str, name: &str, description: &str, template: &str, category: &str| {
        KpiSuggestion {
            id: id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            query_template: template.to_string(),
            category: category.to_string(),
        }
    };

    match sector {
        "bank" => vec![
            make(
                "total_loan_portfolio",
                "Total Loan Portfolio Value",
                "Sum of all loan amounts currently in the system",
                "What is the total value of all loans in our portfolio?",
                "Financial",
            ),
            make(
                "loan_by_type_breakdown",
                "Loan Portfolio by Type",
                "Distribution of loan amounts by loan type",
                "Show me the breakdown of loans by type",
                "Portfolio",
            ),
            make(
                "monthly_payment_collections",
                "Monthly Payment Collections",
                "Total payments received each month over the last year",
                "Show me the monthly payment collection trends",
                "Financial",
            ),
            make(
                "customer_loan_analysis",
                "Customer Loan Statistics",
                "Number of customers with active loans",
                "How many customers have loans with us?",
                "Customer",
            ),
            make(
                "loan_status_distribution",
                "Loan Status Overview",
                "Distribution of loans by their current status",
                "What is the status breakdown of all loans?",
                "Operations",
            ),
        ],
        "ithr" => vec![
            make(
                "employee_headcount",
                "Employee Headcount",
                "Total number of employees by department",
                "How many employees do we have in each department?",
                "Workforce",
            ),
            make(
                "average_salary",
                "Average Salary Analysis",
                "Average salary by department and position",
                "What is the average salary by department?",
                "Compensation",
            ),
            make(
                "employee_turnover",
                "Employee Turnover Rate",
                "Employee turnover rate by department",
                "What is the employee turnover rate by department?",
                "HR Metrics",
            ),
            make(
                "hiring_metrics",
                "Hiring Efficiency",
                "Time to hire and hiring success rates",
                "Show me average time to hire by position level",
                "HR Metrics",
            ),
            make(
                "performance_ratings",
                "Performance Ratings",
                "Employee performance rating distributions",
                "What are the performance rating trends?",
                "Performance",
            ),
        ],
        _ => vec![
            make(
                "total_by_category",
                "Totals by Category",
                "Total counts grouped by the main category column",
                "What is the total count by category?",
                "Operational",
            ),
            make(
                "average_by_group",
                "Averages by Group",
                "Average of the main numeric metric per group",
                "What is the average value by group?",
                "Performance",
            ),
            make(
                "trend_over_time",
                "Trend Over Time",
                "How the main metric changes over time",
                "How has the trend changed over time?",
                "Performance",
            ),
            make(
                "top_performers",
                "Top Performers",
                "Categories with the highest metric values",
                "Which categories have the highest performance?",
                "Operational",
            ),
            make(
                "metric_distribution",
                "Metric Distribution",
                "Distribution of key metrics across records",
                "What is the distribution of key metrics?",
                "Operational",
            ),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnSchema, TableSchema};
    use std::collections::BTreeMap;

    fn schema_with_orders() -> DatabaseSchema {
        let mut columns = BTreeMap::new();
        for (i, (name, ty)) in [("id", "integer"), ("amount", "numeric")].iter().enumerate() {
            columns.insert(
                name.to_string(),
                ColumnSchema {
                    data_type: ty.to_string(),
                    nullable: true,
                    default: None,
                    position: i as i32 + 1,
                    max_length: None,
                    precision: None,
                    scale: None,
                },
            );
        }
        let mut tables = BTreeMap::new();
        tables.insert(
            "orders".to_string(),
            TableSchema {
                columns,
                primary_keys: vec!["id".to_string()],
                foreign_keys: Vec::new(),
            },
        );
        DatabaseSchema {
            tables,
            extracted_at: chrono::Utc::now(),
            total_tables: 1,
        }
    }

    #[test]
    fn test_clean_sql_strips_fences_and_prose() {
        assert_eq!(
            clean_sql_response("```sql\nSELECT 1\n```"),
            "SELECT 1".to_string()
        );
        assert_eq!(
            clean_sql_response("Here is your query:\nSELECT id\nFROM t"),
            "SELECT id FROM t".to_string()
        );
        assert_eq!(clean_sql_response("I cannot answer that."), "");
    }

    #[test]
    fn test_clean_sql_strips_fences_any_case() {
        assert_eq!(clean_sql_response("```Sql\nSELECT 1\n```"), "SELECT 1");
        assert_eq!(clean_sql_response("```SQL\nSELECT 1\n```"), "SELECT 1");
    }

    #[test]
    fn test_clean_sql_preserves_casing_after_select() {
        assert_eq!(
            clean_sql_response("select Amount FROM Orders"),
            "select Amount FROM Orders".to_string()
        );
    }

    #[test]
    fn test_fallback_sql_uses_first_table_columns() {
        let sql = fallback_sql(&schema_with_orders());
        assert_eq!(sql, "SELECT id, amount FROM orders LIMIT 10");
    }

    #[test]
    fn test_fallback_sql_without_tables() {
        let empty = DatabaseSchema {
            tables: BTreeMap::new(),
            extracted_at: chrono::Utc::now(),
            total_tables: 0,
        };
        assert_eq!(fallback_sql(&empty), "SELECT 1");
    }

    #[test]
    fn test_fallback_suggestions_have_five_entries() {
        for sector in ["bank", "ithr", "retail"] {
            assert_eq!(fallback_suggestions(sector).len(), 5, "{}", sector);
        }
    }

    #[test]
    fn test_parse_suggestions_with_fences() {
        let raw = r#"```json
        [{"id":"a","name":"A","description":"d","query_template":"q","category":"c"}]
        ```"#;
        let parsed = parse_suggestions(raw).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].id, "a");
    }

    #[test]
    fn test_parse_suggestions_rejects_non_array() {
        assert!(parse_suggestions("not json").is_none());
    }
}
