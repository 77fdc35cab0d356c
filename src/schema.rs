//! Data model shared across the introspector, store, executor and service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One set of Postgres credentials as supplied by the caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
}

impl ConnectionParams {
    /// Identity key deciding whether two credential sets are the same
    /// logical connection. The password is deliberately excluded.
    pub fn dedup_key(&self) -> (String, u16, String, String) {
        (
            self.host.clone(),
            self.port,
            self.database.clone(),
            self.username.clone(),
        )
    }
}

/// Cached structural snapshot of one database.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatabaseSchema {
    /// Table name -> table description, ordered by name.
    pub tables: BTreeMap<String, TableSchema>,
    #[serde(rename = "extractedAt")]
    pub extracted_at: DateTime<Utc>,
    #[serde(rename = "totalTables")]
    pub total_tables: usize,
}

impl DatabaseSchema {
    pub fn empty() -> Self {
        Self {
            tables: BTreeMap::new(),
            extracted_at: Utc::now(),
            total_tables: 0,
        }
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TableSchema {
    pub columns: BTreeMap<String, ColumnSchema>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub primary_keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub foreign_keys: Vec<ForeignKeyRef>,
}

impl TableSchema {
    /// Column names in declaration order.
    pub fn ordered_columns(&self) -> Vec<&str> {
        let mut cols: Vec<(&str, i32)> = self
            .columns
            .iter()
            .map(|(name, c)| (name.as_str(), c.position))
            .collect();
        cols.sort_by_key(|(_, pos)| *pos);
        cols.into_iter().map(|(name, _)| name).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColumnSchema {
    #[serde(rename = "type")]
    pub data_type: String,
    pub nullable: bool,
    #[serde(default)]
    pub default: Option<String>,
    /// 1-based ordinal position within the table.
    pub position: i32,
    #[serde(default, rename = "maxLength", skip_serializing_if = "Option::is_none")]
    pub max_length: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precision: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyRef {
    pub column: String,
    pub references_table: String,
    pub references_column: String,
}

/// Sector label supplied by the caller, used only to bias generation and
/// fallback defaults. Not a security boundary.
pub type Sector = String;
