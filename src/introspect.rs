//! Schema Introspector
//!
//! Opens a fresh, non-pooled connection per operation, reads the catalog
//! views, and assembles a [`DatabaseSchema`]. Connections are never reused
//! across requests.

use crate::error::{AskdbError, Result};
use crate::schema::{ColumnSchema, ConnectionParams, DatabaseSchema, ForeignKeyRef, TableSchema};
use chrono::Utc;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgSslMode};
use sqlx::{Connection, Row};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, warn};

/// Managed-cloud hosts that refuse plaintext connections.
const TLS_REQUIRED_HOSTS: [&str; 5] = [
    "neon.tech",
    "supabase.",
    "amazonaws.com",
    "planetscale.",
    "railway.",
];

pub(crate) fn ssl_mode_for_host(host: &str) -> PgSslMode {
    if TLS_REQUIRED_HOSTS.iter().any(|h| host.contains(h)) {
        PgSslMode::Require
    } else {
        PgSslMode::Prefer
    }
}

/// Open a single connection with the TLS rule and a bounded connect timeout.
pub(crate) async fn open_connection(
    params: &ConnectionParams,
    timeout: Duration,
) -> Result<PgConnection> {
    let options = PgConnectOptions::new()
        .host(&params.host)
        .port(params.port)
        .database(&params.database)
        .username(&params.username)
        .password(&params.password)
        .ssl_mode(ssl_mode_for_host(&params.host));

    match tokio::time::timeout(timeout, PgConnection::connect_with(&options)).await {
        Ok(Ok(conn)) => Ok(conn),
        Ok(Err(e)) => Err(AskdbError::Credential(format!(
            "failed to connect to {}:{}/{}: {}",
            params.host, params.port, params.database, e
        ))),
        Err(_) => Err(AskdbError::Credential(format!(
            "connection to {}:{} timed out after {}s",
            params.host,
            params.port,
            timeout.as_secs()
        ))),
    }
}

/// Open and immediately close a connection, running a trivial round trip.
/// Never errors; any failure is reported as `false`.
pub async fn test_connection(params: &ConnectionParams, timeout: Duration) -> bool {
    match open_connection(params, timeout).await {
        Ok(mut conn) => {
            let ok = sqlx::query("SELECT 1").fetch_one(&mut conn).await.is_ok();
            if let Err(e) = conn.close().await {
                warn!("error closing test connection: {}", e);
            }
            ok
        }
        Err(e) => {
            warn!("connection test failed: {}", e);
            false
        }
    }
}

/// Extract the full schema: base tables outside the system schemas, their
/// columns in declaration order, and primary/foreign key constraints.
pub async fn extract_schema(
    params: &ConnectionParams,
    timeout: Duration,
) -> Result<DatabaseSchema> {
    let mut conn = open_connection(params, timeout).await?;
    let result = extract_with_conn(&mut conn).await;
    if let Err(e) = conn.close().await {
        warn!("error closing introspection connection: {}", e);
    }
    let schema = result?;
    info!(
        "extracted schema with {} tables from database {}",
        schema.total_tables, params.database
    );
    Ok(schema)
}

async fn extract_with_conn(conn: &mut PgConnection) -> Result<DatabaseSchema> {
    let table_rows = sqlx::query(
        r#"
        SELECT table_name::text, table_schema::text
        FROM information_schema.tables
        WHERE table_schema NOT IN ('information_schema', 'pg_catalog')
          AND table_type = 'BASE TABLE'
        ORDER BY table_name
        "#,
    )
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| AskdbError::SchemaExtraction(format!("failed to list tables: {}", e)))?;

    let mut tables: BTreeMap<String, TableSchema> = BTreeMap::new();

    for row in &table_rows {
        let table_name: String = row
            .try_get("table_name")
            .map_err(|e| AskdbError::SchemaExtraction(e.to_string()))?;
        let table_schema: String = row
            .try_get("table_schema")
            .map_err(|e| AskdbError::SchemaExtraction(e.to_string()))?;

        let column_rows = sqlx::query(
            r#"
            SELECT column_name::text,
                   data_type::text,
                   is_nullable::text,
                   column_default::text,
                   ordinal_position::int,
                   character_maximum_length::int,
                   numeric_precision::int,
                   numeric_scale::int
            FROM information_schema.columns
            WHERE table_name = $1 AND table_schema = $2
            ORDER BY ordinal_position
            "#,
        )
        .bind(&table_name)
        .bind(&table_schema)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| {
            AskdbError::SchemaExtraction(format!("failed to read columns of {}: {}", table_name, e))
        })?;

        let mut columns = BTreeMap::new();
        for col in &column_rows {
            let name: String = col
                .try_get("column_name")
                .map_err(|e| AskdbError::SchemaExtraction(e.to_string()))?;
            let nullable: String = col.try_get("is_nullable").unwrap_or_default();
            columns.insert(
                name,
                ColumnSchema {
                    data_type: col.try_get("data_type").unwrap_or_default(),
                    nullable: nullable == "YES",
                    default: col.try_get("column_default").unwrap_or(None),
                    position: col.try_get("ordinal_position").unwrap_or(0),
                    max_length: col.try_get("character_maximum_length").unwrap_or(None),
                    precision: col.try_get("numeric_precision").unwrap_or(None),
                    scale: col.try_get("numeric_scale").unwrap_or(None),
                },
            );
        }

        tables.insert(
            table_name,
            TableSchema {
                columns,
                primary_keys: Vec::new(),
                foreign_keys: Vec::new(),
            },
        );
    }

    let pk_rows = sqlx::query(
        r#"
        SELECT tc.table_name::text, kcu.column_name::text
        FROM information_schema.table_constraints tc
        JOIN information_schema.key_column_usage kcu
          ON tc.constraint_name = kcu.constraint_name
         AND tc.table_schema = kcu.table_schema
        WHERE tc.constraint_type = 'PRIMARY KEY'
          AND tc.table_schema NOT IN ('information_schema', 'pg_catalog')
        ORDER BY kcu.ordinal_position
        "#,
    )
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| AskdbError::SchemaExtraction(format!("failed to read primary keys: {}", e)))?;

    for row in &pk_rows {
        let table: String = row.try_get("table_name").unwrap_or_default();
        let column: String = row.try_get("column_name").unwrap_or_default();
        if let Some(t) = tables.get_mut(&table) {
            t.primary_keys.push(column);
        }
    }

    let fk_rows = sqlx::query(
        r#"
        SELECT tc.table_name::text,
               kcu.column_name::text,
               ccu.table_name::text AS foreign_table_name,
               ccu.column_name::text AS foreign_column_name
        FROM information_schema.table_constraints tc
        JOIN information_schema.key_column_usage kcu
          ON tc.constraint_name = kcu.constraint_name
        JOIN information_schema.constraint_column_usage ccu
          ON ccu.constraint_name = tc.constraint_name
        WHERE tc.constraint_type = 'FOREIGN KEY'
          AND tc.table_schema NOT IN ('information_schema', 'pg_catalog')
        "#,
    )
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| AskdbError::SchemaExtraction(format!("failed to read foreign keys: {}", e)))?;

    for row in &fk_rows {
        let table: String = row.try_get("table_name").unwrap_or_default();
        if let Some(t) = tables.get_mut(&table) {
            t.foreign_keys.push(ForeignKeyRef {
                column: row.try_get("column_name").unwrap_or_default(),
                references_table: row.try_get("foreign_table_name").unwrap_or_default(),
                references_column: row.try_get("foreign_column_name").unwrap_or_default(),
            });
        }
    }

    let total_tables = tables.len();
    Ok(DatabaseSchema {
        tables,
        extracted_at: Utc::now(),
        total_tables,
    })
}
