//! Service facade
//!
//! Ties the store, session cache, generator and executor together into
//! the operations a frontend calls: connect, ask a KPI question, inspect
//! and switch connections, log out. All state flows through the injected
//! [`ConnectionStore`] and [`SessionCache`]; this layer holds none of its
//! own beyond those handles.

use crate::error::{AskdbError, Result};
use crate::executor::{QueryExecutor, QueryResult};
use crate::llm::{self, KpiSuggestion, SqlGeneration, SqlGenerator};
use crate::safety;
use crate::schema::{ConnectionParams, DatabaseSchema};
use crate::session::SessionCache;
use crate::store::ConnectionStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const MASKED_PASSWORD: &str = "***";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectResponse {
    pub connection_id: String,
    #[serde(rename = "connectionName")]
    pub connection_name: String,
    pub message: String,
    pub schema: DatabaseSchema,
    pub suggested_kpis: Vec<KpiSuggestion>,
    pub is_existing: bool,
}

/// One row of the connection list. The password never leaves the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSummary {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    #[serde(rename = "type")]
    pub engine: String,
    #[serde(rename = "isActive")]
    pub is_active: bool,
    #[serde(rename = "lastConnected")]
    pub last_connected: DateTime<Utc>,
    pub tables: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaResponse {
    pub schema: DatabaseSchema,
    #[serde(rename = "lastUpdated")]
    pub last_updated: DateTime<Utc>,
    #[serde(rename = "connectionName")]
    pub connection_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KpiResponse {
    pub query: String,
    pub sql: String,
    /// True when generation was unavailable or produced unsafe SQL and a
    /// schema-derived preview query ran instead.
    pub used_fallback: bool,
    #[serde(flatten)]
    pub result: QueryResult,
}

pub struct KpiService {
    store: Arc<ConnectionStore>,
    sessions: SessionCache,
    generator: Arc<dyn SqlGenerator>,
    executor: QueryExecutor,
}

impl KpiService {
    pub fn new(
        store: Arc<ConnectionStore>,
        generator: Arc<dyn SqlGenerator>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            store,
            sessions: SessionCache::new(),
            generator,
            executor: QueryExecutor::new(connect_timeout),
        }
    }

    /// Register (or refresh) a connection for `user_id`, cache its session
    /// and return the schema plus suggested KPI questions.
    pub async fn connect(
        &self,
        user_id: &str,
        params: ConnectionParams,
        sector: &str,
    ) -> Result<ConnectResponse> {
        let proposed_id = format!("{}_{}", user_id, Utc::now().timestamp_millis());
        let outcome = self.store.add_connection(user_id, &proposed_id, &params).await?;

        let connection_name = format!("{}@{}", params.database, params.host);
        self.sessions
            .insert(user_id, params, outcome.schema.clone(), connection_name.clone());

        let mut suggested_kpis = self.generator.suggest_kpis(&outcome.schema, sector).await;
        if suggested_kpis.is_empty() {
            suggested_kpis = llm::fallback_suggestions(sector);
        }

        let message = if outcome.is_existing {
            "Reconnected to existing database connection".to_string()
        } else {
            "Database connected successfully".to_string()
        };
        info!(
            "user {} connected ({}, {} tables)",
            user_id, outcome.connection_id, outcome.schema.total_tables
        );

        Ok(ConnectResponse {
            connection_id: outcome.connection_id,
            connection_name,
            message,
            schema: outcome.schema,
            suggested_kpis,
            is_existing: outcome.is_existing,
        })
    }

    /// Answer a natural-language KPI question against the user's active
    /// connection. Unsafe or unavailable generation falls back to a
    /// schema-derived preview query rather than failing the request.
    pub async fn query_kpi(&self, user_id: &str, query: &str, sector: &str) -> Result<KpiResponse> {
        let session = self.active_session(user_id).await?;

        let generation = self
            .generator
            .generate_sql(query, &session.schema, sector)
            .await;
        let (sql, used_fallback) = choose_sql(generation, &session.schema);
        if used_fallback {
            warn!("falling back to schema preview for user {} query", user_id);
        }

        let result = self.executor.execute(&sql, &session.params).await?;
        Ok(KpiResponse {
            query: query.to_string(),
            sql,
            used_fallback,
            result,
        })
    }

    /// Schema of the active connection, from the session cache when warm.
    pub async fn get_schema(&self, user_id: &str) -> Result<SchemaResponse> {
        let session = self.active_session(user_id).await?;
        Ok(SchemaResponse {
            schema: session.schema,
            last_updated: session.last_updated,
            connection_name: session.connection_name,
        })
    }

    /// Suggested KPI questions for the active connection.
    pub async fn suggest_kpis(&self, user_id: &str, sector: &str) -> Result<Vec<KpiSuggestion>> {
        let session = self.active_session(user_id).await?;
        let mut suggestions = self.generator.suggest_kpis(&session.schema, sector).await;
        if suggestions.is_empty() {
            suggestions = llm::fallback_suggestions(sector);
        }
        Ok(suggestions)
    }

    /// All saved connections for the user, passwords masked.
    pub async fn list_connections(&self, user_id: &str) -> Result<Vec<ConnectionSummary>> {
        let all = self.store.get_all(user_id).await?;
        let mut summaries: Vec<ConnectionSummary> = all
            .into_iter()
            .map(|(id, conn)| ConnectionSummary {
                id,
                host: conn.host,
                port: conn.port,
                database: conn.database,
                username: conn.username,
                password: MASKED_PASSWORD.to_string(),
                engine: conn.engine,
                is_active: conn.is_active,
                last_connected: conn.last_connected,
                tables: conn
                    .schema
                    .as_ref()
                    .map(DatabaseSchema::table_names)
                    .unwrap_or_default(),
            })
            .collect();
        summaries.sort_by(|a, b| b.last_connected.cmp(&a.last_connected));
        Ok(summaries)
    }

    /// Make `connection_id` the user's active connection and refresh the
    /// session from its stored credentials and schema. Returns the id now
    /// current for the user.
    pub async fn switch_connection(&self, user_id: &str, connection_id: &str) -> Result<String> {
        if !self.store.set_active(user_id, connection_id).await? {
            return Err(AskdbError::UnknownConnection(connection_id.to_string()));
        }
        self.refresh_session(user_id).await;
        info!("user {} switched to connection {}", user_id, connection_id);
        Ok(connection_id.to_string())
    }

    /// Delete a saved connection. Removing the active one promotes another
    /// saved connection in the store; the session follows suit.
    pub async fn remove_connection(&self, user_id: &str, connection_id: &str) -> Result<()> {
        if !self.store.remove(user_id, connection_id).await? {
            return Err(AskdbError::UnknownConnection(connection_id.to_string()));
        }
        self.refresh_session(user_id).await;
        Ok(())
    }

    /// Drop the in-memory session. Saved connections stay on disk.
    pub fn logout(&self, user_id: &str) -> bool {
        self.sessions.remove(user_id)
    }

    /// The cached session, rebuilt from the store's active connection on a
    /// cold cache (for example after a restart).
    async fn active_session(&self, user_id: &str) -> Result<crate::session::UserSession> {
        if let Some(session) = self.sessions.get(user_id) {
            return Ok(session);
        }
        self.refresh_session(user_id).await;
        self.sessions
            .get(user_id)
            .ok_or_else(|| AskdbError::NoActiveConnection(user_id.to_string()))
    }

    async fn refresh_session(&self, user_id: &str) {
        match self.store.get_active(user_id).await {
            Some((_, conn)) => {
                let schema = conn.schema.clone().unwrap_or_else(DatabaseSchema::empty);
                let name = format!("{}@{}", conn.database, conn.host);
                self.sessions.insert(user_id, conn.params(), schema, name);
            }
            None => {
                self.sessions.remove(user_id);
            }
        }
    }
}

/// Decide which SQL actually runs: the generated statement when it passes
/// the safety gate, otherwise a schema-derived preview.
pub fn choose_sql(generation: SqlGeneration, schema: &DatabaseSchema) -> (String, bool) {
    match generation {
        SqlGeneration::Generated(candidate) => match safety::sanitize(&candidate) {
            Some(sql) => (sql, false),
            None => {
                warn!("generated SQL rejected by safety gate");
                (llm::fallback_sql(schema), true)
            }
        },
        SqlGeneration::Unavailable(reason) => {
            warn!("SQL generation unavailable: {}", reason);
            (llm::fallback_sql(schema), true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnSchema, TableSchema};
    use std::collections::BTreeMap;

    fn column(position: i32) -> ColumnSchema {
        ColumnSchema {
            data_type: "integer".to_string(),
            nullable: true,
            default: None,
            position,
            max_length: None,
            precision: None,
            scale: None,
        }
    }

    fn schema_with_orders() -> DatabaseSchema {
        let mut columns = BTreeMap::new();
        columns.insert("id".to_string(), column(1));
        columns.insert("amount".to_string(), column(2));
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
            total_tables: tables.len(),
            tables,
            extracted_at: Utc::now(),
        }
    }

    #[test]
    fn test_choose_sql_accepts_safe_generation() {
        let generation = SqlGeneration::Generated("SELECT id FROM orders".to_string());
        let (sql, used_fallback) = choose_sql(generation, &schema_with_orders());
        assert_eq!(sql, "SELECT id FROM orders");
        assert!(!used_fallback);
    }

    #[test]
    fn test_choose_sql_rejects_mutation_and_falls_back() {
        let generation = SqlGeneration::Generated("DROP TABLE orders".to_string());
        let (sql, used_fallback) = choose_sql(generation, &schema_with_orders());
        assert!(used_fallback);
        assert!(sql.starts_with("SELECT"));
        assert!(sql.contains("FROM orders"));
    }

    #[test]
    fn test_choose_sql_unavailable_generation_falls_back() {
        let generation = SqlGeneration::Unavailable("no API key".to_string());
        let (sql, used_fallback) = choose_sql(generation, &schema_with_orders());
        assert!(used_fallback);
        assert!(sql.contains("LIMIT 10"));
    }

    #[test]
    fn test_choose_sql_empty_schema_selects_constant() {
        let generation = SqlGeneration::Unavailable("no API key".to_string());
        let (sql, used_fallback) = choose_sql(generation, &DatabaseSchema::empty());
        assert!(used_fallback);
        assert_eq!(sql, "SELECT 1");
    }
}
