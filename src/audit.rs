//! Append-only audit trail for gate decisions and key-management actions.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::Row;

use crate::database::{DbError, DbPool};

/// A single structured audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Who performed the action, if known.
    pub actor_id: Option<String>,
    /// The API key used, if any.
    pub key_id: Option<String>,
    /// The action performed, e.g. `"request.submit"`, `"key.rotate"`.
    pub action: String,
    /// The kind of resource acted upon, e.g. `"request"`, `"api_key"`.
    pub resource_type: String,
    /// The identifier of the resource acted upon.
    pub resource_id: String,
    /// When the event occurred.
    pub timestamp: DateTime<Utc>,
    /// The caller's IP address, if known.
    pub ip: Option<String>,
    /// The caller's user-agent string, if known.
    pub user_agent: Option<String>,
    /// The logical endpoint invoked.
    pub endpoint: Option<String>,
    /// The logical method invoked.
    pub method: Option<String>,
    /// A snapshot of relevant state before the action.
    pub before: Option<Value>,
    /// A snapshot of relevant state after the action.
    pub after: Option<Value>,
    /// Free-form additional metadata.
    pub metadata: Option<Value>,
    /// Whether the action succeeded.
    pub success: bool,
    /// Error detail, if it did not.
    pub error: Option<String>,
}

impl AuditEvent {
    /// Builds a minimal successful event for `action` against `resource`.
    pub fn success(action: impl Into<String>, resource_type: impl Into<String>, resource_id: impl Into<String>) -> Self {
        Self {
            actor_id: None,
            key_id: None,
            action: action.into(),
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            timestamp: Utc::now(),
            ip: None,
            user_agent: None,
            endpoint: None,
            method: None,
            before: None,
            after: None,
            metadata: None,
            success: true,
            error: None,
        }
    }

    /// Builds a minimal failure event for `action` against `resource`.
    pub fn failure(
        action: impl Into<String>,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        let mut event = Self::success(action, resource_type, resource_id);
        event.success = false;
        event.error = Some(error.into());
        event
    }

    /// Attaches the API key that performed this action.
    #[must_use]
    pub fn with_key_id(mut self, key_id: impl Into<String>) -> Self {
        self.key_id = Some(key_id.into());
        self
    }
}

/// Append-only persisted audit trail.
#[derive(Clone)]
pub struct AuditStore {
    pool: Arc<DbPool>,
}

impl std::fmt::Debug for AuditStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditStore").finish()
    }
}

impl AuditStore {
    /// Builds a store over `pool`.
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self { pool }
    }

    /// Appends `event`. A write failure is logged as a warning and does
    /// not propagate: audit logging must never fail the request it is
    /// describing.
    pub async fn record(&self, event: AuditEvent) {
        let result = sqlx::query(
            r"INSERT INTO audit_log
                (actor_id, key_id, action, resource_type, resource_id, timestamp, ip, user_agent,
                 endpoint, method, before, after, metadata, success, error)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&event.actor_id)
        .bind(&event.key_id)
        .bind(&event.action)
        .bind(&event.resource_type)
        .bind(&event.resource_id)
        .bind(event.timestamp.to_rfc3339())
        .bind(&event.ip)
        .bind(&event.user_agent)
        .bind(&event.endpoint)
        .bind(&event.method)
        .bind(event.before.as_ref().map(Value::to_string))
        .bind(event.after.as_ref().map(Value::to_string))
        .bind(event.metadata.as_ref().map(Value::to_string))
        .bind(event.success)
        .bind(&event.error)
        .execute(&*self.pool)
        .await;

        if let Err(err) = result {
            tracing::warn!(action = %event.action, resource_id = %event.resource_id, error = %err, "failed to persist audit event");
        }
    }

    /// Fetches the most recent `limit` events for `key_id`, newest first.
    /// Intended for operator inspection, not the hot path.
    pub async fn recent_for_key(&self, key_id: &str, limit: i64) -> Result<Vec<AuditEvent>, DbError> {
        let rows = sqlx::query(
            r"SELECT actor_id, key_id, action, resource_type, resource_id, timestamp, ip, user_agent,
                     endpoint, method, before, after, metadata, success, error
               FROM audit_log WHERE key_id = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(key_id)
        .bind(limit)
        .fetch_all(&*self.pool)
        .await
        .map_err(DbError::QueryFailed)?;

        Ok(rows
            .into_iter()
            .map(|row| AuditEvent {
                actor_id: row.get(0),
                key_id: row.get(1),
                action: row.get(2),
                resource_type: row.get(3),
                resource_id: row.get(4),
                timestamp: DateTime::parse_from_rfc3339(&row.get::<String, _>(5))
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
                ip: row.get(6),
                user_agent: row.get(7),
                endpoint: row.get(8),
                method: row.get(9),
                before: row.get::<Option<String>, _>(10).and_then(|s| serde_json::from_str(&s).ok()),
                after: row.get::<Option<String>, _>(11).and_then(|s| serde_json::from_str(&s).ok()),
                metadata: row.get::<Option<String>, _>(12).and_then(|s| serde_json::from_str(&s).ok()),
                success: row.get(13),
                error: row.get(14),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{ensure_schema, init_db};

    #[tokio::test]
    async fn record_then_read_back_round_trips() {
        let pool = Arc::new(init_db("sqlite::memory:").await.unwrap());
        ensure_schema(&pool).await.unwrap();
        let store = AuditStore::new(pool);

        store
            .record(AuditEvent::success("request.submit", "request", "req-1").with_key_id("key-1"))
            .await;

        let events = store.recent_for_key("key-1", 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, "request.submit");
        assert!(events[0].success);
    }
}
