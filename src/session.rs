//! Per-user session cache
//!
//! Keeps the active connection's parameters and schema in memory so a
//! query does not re-read the store or re-introspect the database. The
//! store on disk stays authoritative; this is a refreshable copy.

use crate::schema::{ConnectionParams, DatabaseSchema};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub struct UserSession {
    pub params: ConnectionParams,
    pub schema: DatabaseSchema,
    pub connection_name: String,
    pub last_updated: DateTime<Utc>,
}

#[derive(Default)]
pub struct SessionCache {
    sessions: Mutex<HashMap<String, UserSession>>,
}

impl SessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, user_id: &str, params: ConnectionParams, schema: DatabaseSchema, connection_name: String) {
        let session = UserSession {
            params,
            schema,
            connection_name,
            last_updated: Utc::now(),
        };
        self.sessions
            .lock()
            .expect("session lock poisoned")
            .insert(user_id.to_string(), session);
    }

    pub fn get(&self, user_id: &str) -> Option<UserSession> {
        self.sessions
            .lock()
            .expect("session lock poisoned")
            .get(user_id)
            .cloned()
    }

    pub fn remove(&self, user_id: &str) -> bool {
        self.sessions
            .lock()
            .expect("session lock poisoned")
            .remove(user_id)
            .is_some()
    }
}
