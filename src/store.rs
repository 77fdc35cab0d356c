//! Connection Store
//!
//! Durable, per-user registry of database connections. The in-memory
//! document and the on-disk JSON share one serde shape; every mutation is
//! serialized through a single lock and mirrored to disk before returning.
//!
//! Passwords are stored in cleartext. That is a known weakness of this
//! service, isolated here so encryption-at-rest can later be added without
//! touching callers.

use crate::error::{AskdbError, Result};
use crate::introspect;
use crate::schema::{ConnectionParams, DatabaseSchema};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Current on-disk document version. Version 1 was a single-user layout
/// without the `users` wrapper.
pub const STORE_VERSION: u32 = 2;

fn default_version() -> u32 {
    STORE_VERSION
}

fn default_engine() -> String {
    "postgresql".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredConnection {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    #[serde(rename = "type", default = "default_engine")]
    pub engine: String,
    #[serde(rename = "isActive")]
    pub is_active: bool,
    #[serde(default)]
    pub schema: Option<DatabaseSchema>,
    #[serde(rename = "lastConnected")]
    pub last_connected: DateTime<Utc>,
}

impl StoredConnection {
    pub fn params(&self) -> ConnectionParams {
        ConnectionParams {
            host: self.host.clone(),
            port: self.port,
            database: self.database.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }

    fn dedup_key(&self) -> (String, u16, String, String) {
        self.params().dedup_key()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct UserEntry {
    #[serde(rename = "currentConnection")]
    pub current_connection: Option<String>,
    pub connections: HashMap<String, StoredConnection>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct StoreDocument {
    #[serde(default = "default_version")]
    pub version: u32,
    pub users: HashMap<String, UserEntry>,
}

/// Outcome of a successful `add_connection`.
#[derive(Debug, Clone)]
pub struct AddOutcome {
    pub connection_id: String,
    pub schema: DatabaseSchema,
    pub is_existing: bool,
}

pub struct ConnectionStore {
    path: PathBuf,
    connect_timeout: Duration,
    state: Mutex<StoreDocument>,
}

impl ConnectionStore {
    /// Load the store from `path`, migrating a legacy single-user document
    /// in place. A missing file is treated as an empty store.
    pub fn load(path: impl Into<PathBuf>, connect_timeout: Duration) -> Result<Self> {
        let path = path.into();
        let doc = match std::fs::read_to_string(&path) {
            Ok(raw) => {
                let value: serde_json::Value = serde_json::from_str(&raw)
                    .map_err(|e| AskdbError::Store(format!("corrupt store document: {}", e)))?;
                migrate_document(value)?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreDocument::default(),
            Err(e) => return Err(e.into()),
        };

        let store = Self {
            path,
            connect_timeout,
            state: Mutex::new(doc),
        };
        Ok(store)
    }

    /// Open and immediately close a connection with a trivial round trip.
    pub async fn test(&self, params: &ConnectionParams) -> bool {
        introspect::test_connection(params, self.connect_timeout).await
    }

    /// Validate credentials, introspect the schema, then register the
    /// connection for `user_id`. Re-adding credentials with a matching
    /// dedup key refreshes the existing record instead of duplicating it.
    pub async fn add_connection(
        &self,
        user_id: &str,
        proposed_id: &str,
        params: &ConnectionParams,
    ) -> Result<AddOutcome> {
        if !self.test(params).await {
            return Err(AskdbError::Credential(
                "Failed to connect to database with provided credentials".to_string(),
            ));
        }

        // Nothing is persisted if introspection fails after the test.
        let schema = introspect::extract_schema(params, self.connect_timeout).await?;
        self.upsert_connection(user_id, proposed_id, params, schema)
            .await
    }

    /// Persistence half of [`Self::add_connection`]: dedup, activate,
    /// deactivate siblings, save. Takes an already-extracted schema.
    pub async fn upsert_connection(
        &self,
        user_id: &str,
        proposed_id: &str,
        params: &ConnectionParams,
        schema: DatabaseSchema,
    ) -> Result<AddOutcome> {
        let mut doc = self.state.lock().await;
        let entry = doc.users.entry(user_id.to_string()).or_default();

        let key = params.dedup_key();
        let existing_id = entry
            .connections
            .iter()
            .find(|(_, conn)| conn.dedup_key() == key)
            .map(|(id, _)| id.clone());

        for conn in entry.connections.values_mut() {
            conn.is_active = false;
        }

        let (connection_id, is_existing) = match existing_id {
            Some(id) => {
                info!("refreshing existing connection {} for user {}", id, user_id);
                (id, true)
            }
            None => (proposed_id.to_string(), false),
        };

        entry.connections.insert(
            connection_id.clone(),
            StoredConnection {
                host: params.host.clone(),
                port: params.port,
                database: params.database.clone(),
                username: params.username.clone(),
                password: params.password.clone(),
                engine: default_engine(),
                is_active: true,
                schema: Some(schema.clone()),
                last_connected: Utc::now(),
            },
        );
        entry.current_connection = Some(connection_id.clone());

        save_document(&self.path, &doc)?;
        Ok(AddOutcome {
            connection_id,
            schema,
            is_existing,
        })
    }

    /// The user's active connection, if any.
    pub async fn get_active(&self, user_id: &str) -> Option<(String, StoredConnection)> {
        let doc = self.state.lock().await;
        let user = doc.users.get(user_id)?;
        let id = user.current_connection.clone()?;
        let conn = user.connections.get(&id)?.clone();
        Some((id, conn))
    }

    /// All connections for a user, pruning any records whose dedup key
    /// collides with an earlier one (first wins, active pointer repaired).
    pub async fn get_all(&self, user_id: &str) -> Result<HashMap<String, StoredConnection>> {
        let mut doc = self.state.lock().await;
        let changed = cleanup_duplicates(&mut doc, user_id);
        if changed {
            save_document(&self.path, &doc)?;
        }
        Ok(doc
            .users
            .get(user_id)
            .map(|u| u.connections.clone())
            .unwrap_or_default())
    }

    /// Flip the active flag to `connection_id`. Returns false when the id
    /// is unknown for that user.
    pub async fn set_active(&self, user_id: &str, connection_id: &str) -> Result<bool> {
        let mut doc = self.state.lock().await;
        let Some(user) = doc.users.get_mut(user_id) else {
            return Ok(false);
        };
        if !user.connections.contains_key(connection_id) {
            return Ok(false);
        }
        for (id, conn) in user.connections.iter_mut() {
            conn.is_active = id == connection_id;
        }
        user.current_connection = Some(connection_id.to_string());
        save_document(&self.path, &doc)?;
        Ok(true)
    }

    /// Delete a connection. If it was active, the remaining connection
    /// with the lowest sorted id (if any) is promoted.
    pub async fn remove(&self, user_id: &str, connection_id: &str) -> Result<bool> {
        let mut doc = self.state.lock().await;
        let Some(user) = doc.users.get_mut(user_id) else {
            return Ok(false);
        };
        if user.connections.remove(connection_id).is_none() {
            return Ok(false);
        }
        if user.current_connection.as_deref() == Some(connection_id) {
            let promoted = user.connections.keys().min().cloned();
            if let Some(ref id) = promoted {
                if let Some(conn) = user.connections.get_mut(id) {
                    conn.is_active = true;
                }
                info!("promoted connection {} for user {}", id, user_id);
            }
            user.current_connection = promoted;
        }
        save_document(&self.path, &doc)?;
        Ok(true)
    }

    #[cfg(test)]
    async fn snapshot(&self) -> StoreDocument {
        self.state.lock().await.clone()
    }
}

fn cleanup_duplicates(doc: &mut StoreDocument, user_id: &str) -> bool {
    let Some(user) = doc.users.get_mut(user_id) else {
        return false;
    };
    let mut seen = HashSet::new();
    let mut to_remove = Vec::new();
    let mut ids: Vec<String> = user.connections.keys().cloned().collect();
    ids.sort();
    for id in ids {
        let key = user.connections[&id].dedup_key();
        if !seen.insert(key) {
            to_remove.push(id);
        }
    }

    let changed = !to_remove.is_empty();
    for id in to_remove {
        warn!("removing duplicate connection {} for user {}", id, user_id);
        user.connections.remove(&id);
        if user.current_connection.as_deref() == Some(id.as_str()) {
            let promoted = user.connections.keys().min().cloned();
            if let Some(ref next) = promoted {
                if let Some(conn) = user.connections.get_mut(next) {
                    conn.is_active = true;
                }
            }
            user.current_connection = promoted;
        }
    }
    changed
}

/// Fold whatever is on disk into the current document shape. A legacy
/// document (no `users` wrapper) is nested under a synthetic "migration"
/// user, matching what it held before multi-tenancy.
fn migrate_document(value: serde_json::Value) -> Result<StoreDocument> {
    if value.get("users").is_some() {
        return Ok(serde_json::from_value(value)?);
    }

    if value.get("connections").is_some() {
        info!("migrating legacy single-user store document");
        let entry: UserEntry = serde_json::from_value(value)?;
        let mut users = HashMap::new();
        users.insert("migration".to_string(), entry);
        return Ok(StoreDocument {
            version: STORE_VERSION,
            users,
        });
    }

    // Empty or unrecognized: start fresh rather than refuse to boot.
    Ok(StoreDocument::default())
}

fn save_document(path: &Path, doc: &StoreDocument) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let json = serde_json::to_string_pretty(doc)?;
    std::fs::write(path, json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::TableSchema;
    use std::collections::BTreeMap;

    fn params(host: &str, database: &str) -> ConnectionParams {
        ConnectionParams {
            host: host.to_string(),
            port: 5432,
            database: database.to_string(),
            username: "app".to_string(),
            password: "secret".to_string(),
        }
    }

    fn schema_with(tables: &[&str]) -> DatabaseSchema {
        let tables: BTreeMap<String, TableSchema> = tables
            .iter()
            .map(|t| (t.to_string(), TableSchema::default()))
            .collect();
        let total_tables = tables.len();
        DatabaseSchema {
            tables,
            extracted_at: Utc::now(),
            total_tables,
        }
    }

    fn temp_store() -> (tempfile::TempDir, ConnectionStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("database.json");
        let store = ConnectionStore::load(&path, Duration::from_secs(10)).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_upsert_creates_and_activates() {
        let (_dir, store) = temp_store();
        let outcome = store
            .upsert_connection("u1", "u1_1", &params("db1", "sales"), schema_with(&["orders"]))
            .await
            .unwrap();
        assert!(!outcome.is_existing);
        assert_eq!(outcome.connection_id, "u1_1");

        let (id, active) = store.get_active("u1").await.unwrap();
        assert_eq!(id, "u1_1");
        assert!(active.is_active);
        assert_eq!(active.schema.unwrap().table_names(), vec!["orders"]);
    }

    #[tokio::test]
    async fn test_dedup_reuses_existing_record() {
        let (_dir, store) = temp_store();
        store
            .upsert_connection("u1", "u1_1", &params("db1", "sales"), schema_with(&["orders"]))
            .await
            .unwrap();
        let second = store
            .upsert_connection("u1", "u1_2", &params("db1", "sales"), schema_with(&["orders", "items"]))
            .await
            .unwrap();

        assert!(second.is_existing);
        assert_eq!(second.connection_id, "u1_1");
        let all = store.get_all("u1").await.unwrap();
        assert_eq!(all.len(), 1);
        // Schema was refreshed in place.
        assert_eq!(all["u1_1"].schema.as_ref().unwrap().total_tables, 2);
    }

    #[tokio::test]
    async fn test_at_most_one_active_connection() {
        let (_dir, store) = temp_store();
        store
            .upsert_connection("u1", "a", &params("db1", "sales"), schema_with(&[]))
            .await
            .unwrap();
        store
            .upsert_connection("u1", "b", &params("db2", "hr"), schema_with(&[]))
            .await
            .unwrap();

        let all = store.get_all("u1").await.unwrap();
        let active: Vec<_> = all.values().filter(|c| c.is_active).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(store.get_active("u1").await.unwrap().0, "b");

        assert!(store.set_active("u1", "a").await.unwrap());
        let all = store.get_all("u1").await.unwrap();
        assert!(all["a"].is_active);
        assert!(!all["b"].is_active);
    }

    #[tokio::test]
    async fn test_set_active_unknown_id() {
        let (_dir, store) = temp_store();
        assert!(!store.set_active("u1", "nope").await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_promotes_remaining() {
        let (_dir, store) = temp_store();
        store
            .upsert_connection("u1", "a", &params("db1", "sales"), schema_with(&[]))
            .await
            .unwrap();
        store
            .upsert_connection("u1", "b", &params("db2", "hr"), schema_with(&[]))
            .await
            .unwrap();

        assert!(store.remove("u1", "b").await.unwrap());
        let (id, conn) = store.get_active("u1").await.unwrap();
        assert_eq!(id, "a");
        assert!(conn.is_active);

        assert!(store.remove("u1", "a").await.unwrap());
        assert!(store.get_active("u1").await.is_none());
        assert!(!store.remove("u1", "a").await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_promotes_lowest_sorted_id() {
        let (_dir, store) = temp_store();
        store
            .upsert_connection("u1", "c", &params("db3", "crm"), schema_with(&[]))
            .await
            .unwrap();
        store
            .upsert_connection("u1", "a", &params("db1", "sales"), schema_with(&[]))
            .await
            .unwrap();
        store
            .upsert_connection("u1", "b", &params("db2", "hr"), schema_with(&[]))
            .await
            .unwrap();

        assert!(store.remove("u1", "b").await.unwrap());
        let (id, conn) = store.get_active("u1").await.unwrap();
        assert_eq!(id, "a");
        assert!(conn.is_active);
    }

    #[tokio::test]
    async fn test_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("database.json");

        let store = ConnectionStore::load(&path, Duration::from_secs(10)).unwrap();
        store
            .upsert_connection("u1", "a", &params("db1", "sales"), schema_with(&["orders"]))
            .await
            .unwrap();
        store
            .upsert_connection("u2", "b", &params("db2", "hr"), schema_with(&["employees"]))
            .await
            .unwrap();
        let before = store.snapshot().await;

        let reloaded = ConnectionStore::load(&path, Duration::from_secs(10)).unwrap();
        let after = reloaded.snapshot().await;
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_legacy_document_migration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("database.json");
        let legacy = serde_json::json!({
            "currentConnection": "old",
            "connections": {
                "old": {
                    "host": "db1",
                    "port": 5432,
                    "database": "sales",
                    "username": "app",
                    "password": "secret",
                    "isActive": true,
                    "schema": null,
                    "lastConnected": "2024-01-01T00:00:00Z"
                }
            }
        });
        std::fs::write(&path, serde_json::to_string_pretty(&legacy).unwrap()).unwrap();

        let store = ConnectionStore::load(&path, Duration::from_secs(10)).unwrap();
        let (id, conn) = store.get_active("migration").await.unwrap();
        assert_eq!(id, "old");
        assert_eq!(conn.database, "sales");
    }

    #[tokio::test]
    async fn test_missing_file_is_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            ConnectionStore::load(dir.path().join("absent.json"), Duration::from_secs(10)).unwrap();
        assert!(store.get_active("anyone").await.is_none());
        assert!(store.get_all("anyone").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_cleanup_on_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("database.json");
        let store = ConnectionStore::load(&path, Duration::from_secs(10)).unwrap();

        // Forge a duplicate pair directly in the document, as older builds
        // could produce before dedup-on-add existed.
        {
            let mut doc = store.state.lock().await;
            let entry = doc.users.entry("u1".to_string()).or_default();
            for id in ["a", "b"] {
                entry.connections.insert(
                    id.to_string(),
                    StoredConnection {
                        host: "db1".to_string(),
                        port: 5432,
                        database: "sales".to_string(),
                        username: "app".to_string(),
                        password: "secret".to_string(),
                        engine: "postgresql".to_string(),
                        is_active: id == "b",
                        schema: None,
                        last_connected: Utc::now(),
                    },
                );
            }
            entry.current_connection = Some("b".to_string());
        }

        let all = store.get_all("u1").await.unwrap();
        assert_eq!(all.len(), 1);
        let (id, conn) = store.get_active("u1").await.unwrap();
        assert_eq!(id, "a");
        assert!(conn.is_active);
    }
}
