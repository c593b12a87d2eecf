//! Key & Quota Gate (C7): credential validation, admission control, and
//! usage accounting sitting in front of the routing pipeline.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::{Mutex, RwLock};
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditEvent, AuditStore};
use crate::database::{DbError, DbPool};
use crate::error::AppError;
use crate::selector::CallerConstraints;

/// Lifecycle status of an `APIKey`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    /// Usable.
    Enabled,
    /// Administratively disabled.
    Disabled,
    /// Past its `expires_at`.
    Expired,
}

/// Per-minute/hour/day request-rate caps.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RateLimit {
    /// Requests per minute.
    pub rpm: Option<u32>,
    /// Requests per hour.
    pub rph: Option<u32>,
    /// Requests per day.
    pub rpd: Option<u32>,
}

/// A credential record controlling what a caller may do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct APIKey {
    /// Unique identifier.
    pub id: String,
    /// The owning caller/account.
    pub owner: String,
    /// A one-way digest of the caller's secret; never the secret itself.
    pub hashed_secret: String,
    /// Current lifecycle status.
    pub status: KeyStatus,
    /// Free-form classification tags.
    pub tags: Vec<String>,
    /// If non-empty, only these models may be used.
    pub allowed_models: Vec<String>,
    /// These models may never be used.
    pub blocked_models: Vec<String>,
    /// If non-empty, only these endpoints may be used.
    pub allowed_endpoints: Vec<String>,
    /// Cumulative spend ceiling, if any.
    pub cost_limit: Option<f64>,
    /// Cumulative spend recorded so far.
    pub cost_used: f64,
    /// Request-rate caps.
    pub rate_limit: RateLimit,
    /// Daily request quota, if any.
    pub quota_daily: Option<u32>,
    /// Monthly request quota, if any.
    pub quota_monthly: Option<u32>,
    /// Requests used in the current day.
    pub requests_used_daily: u32,
    /// Requests used in the current month.
    pub requests_used_monthly: u32,
    /// When this key stops being valid, if ever.
    pub expires_at: Option<DateTime<Utc>>,
    /// When this key was last used successfully.
    pub last_used: Option<DateTime<Utc>>,
    /// When this key's secret was last rotated.
    pub last_rotated: Option<DateTime<Utc>>,
    /// How often the secret should be auto-rotated, in days.
    pub rotation_interval_days: Option<i64>,
}

impl APIKey {
    fn new(id: String, owner: String, hashed_secret: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            owner,
            hashed_secret,
            status: KeyStatus::Enabled,
            tags: Vec::new(),
            allowed_models: Vec::new(),
            blocked_models: Vec::new(),
            allowed_endpoints: Vec::new(),
            cost_limit: None,
            cost_used: 0.0,
            rate_limit: RateLimit::default(),
            quota_daily: None,
            quota_monthly: None,
            requests_used_daily: 0,
            requests_used_monthly: 0,
            expires_at: None,
            last_used: None,
            last_rotated: Some(now),
            rotation_interval_days: None,
        }
    }

    /// The `CallerConstraints` view the selector's hard-constraint step needs.
    pub fn constraints(&self) -> CallerConstraints {
        CallerConstraints {
            allowed_models: self.allowed_models.clone(),
            blocked_models: self.blocked_models.clone(),
            allowed_endpoints: self.allowed_endpoints.clone(),
        }
    }
}

/// A caller-safe view of an `APIKey` for the key-CRUD read operation,
/// omitting `hashed_secret`.
#[derive(Debug, Clone, Serialize)]
pub struct KeyDescriptor {
    /// Unique identifier.
    pub id: String,
    /// The owning caller/account.
    pub owner: String,
    /// Current lifecycle status.
    pub status: KeyStatus,
    /// Free-form classification tags.
    pub tags: Vec<String>,
    /// Cumulative spend ceiling, if any.
    pub cost_limit: Option<f64>,
    /// Cumulative spend recorded so far.
    pub cost_used: f64,
    /// Request-rate caps.
    pub rate_limit: RateLimit,
    /// Daily request quota, if any.
    pub quota_daily: Option<u32>,
    /// Monthly request quota, if any.
    pub quota_monthly: Option<u32>,
    /// When this key stops being valid, if ever.
    pub expires_at: Option<DateTime<Utc>>,
    /// When this key was last used successfully.
    pub last_used: Option<DateTime<Utc>>,
}

impl From<&APIKey> for KeyDescriptor {
    fn from(key: &APIKey) -> Self {
        Self {
            id: key.id.clone(),
            owner: key.owner.clone(),
            status: key.status,
            tags: key.tags.clone(),
            cost_limit: key.cost_limit,
            cost_used: key.cost_used,
            rate_limit: key.rate_limit,
            quota_daily: key.quota_daily,
            quota_monthly: key.quota_monthly,
            expires_at: key.expires_at,
            last_used: key.last_used,
        }
    }
}

/// Opaque verdict returned by the standalone key-validate operation (§6).
/// Unlike the gate's admission check, this never reveals *why* a secret was
/// rejected beyond the caller-facing categories below — in particular a
/// disabled key and an unknown secret both come back as `invalid_credential`.
#[derive(Debug, Clone, Serialize)]
pub struct KeyValidation {
    /// Whether the secret currently identifies a usable key.
    pub valid: bool,
    /// Coarse rejection category; `None` when `valid` is `true`.
    pub error: Option<String>,
    /// Whether the key is currently over one of its rate-limit windows.
    pub rate_limit_status: bool,
    /// Whether the key has met or exceeded its cost limit.
    pub cost_limit_status: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum WindowKind {
    Minute,
    Hour,
    Day,
}

impl WindowKind {
    fn duration(self) -> ChronoDuration {
        match self {
            WindowKind::Minute => ChronoDuration::minutes(1),
            WindowKind::Hour => ChronoDuration::hours(1),
            WindowKind::Day => ChronoDuration::days(1),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            WindowKind::Minute => "minute",
            WindowKind::Hour => "hour",
            WindowKind::Day => "day",
        }
    }
}

struct WindowCounter {
    window_start: DateTime<Utc>,
    count: u32,
}

fn hash_secret(secret: &str) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    secret.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

fn generate_secret() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(40)
        .map(char::from)
        .collect()
}

/// Live key records plus the sliding rate-limit counters that gate
/// admission, backed by `api_keys` / `key_rate_windows`.
pub struct KeyStore {
    pool: Arc<DbPool>,
    keys: RwLock<HashMap<String, APIKey>>,
    by_hash: RwLock<HashMap<String, String>>,
    windows: RwLock<HashMap<(String, WindowKind), Arc<Mutex<WindowCounter>>>>,
}

impl std::fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStore").field("keys", &self.keys.read().len()).finish()
    }
}

impl KeyStore {
    /// Builds an empty store; call `load` to hydrate from the database.
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self {
            pool,
            keys: RwLock::new(HashMap::new()),
            by_hash: RwLock::new(HashMap::new()),
            windows: RwLock::new(HashMap::new()),
        }
    }

    /// Loads every key record from the database into memory.
    pub async fn load(&self) -> Result<(), AppError> {
        let rows = sqlx::query("SELECT id, owner, hashed_secret, status, cost_limit, cost_used, \
                                 rpm_limit, rph_limit, rpd_limit, quota_daily, quota_monthly, \
                                 requests_used_daily, requests_used_monthly, expires_at, last_used, \
                                 last_rotated, rotation_interval_days, tags, allowed_models, \
                                 blocked_models, allowed_endpoints FROM api_keys")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(DbError::QueryFailed(e)))?;

        let mut keys = self.keys.write();
        let mut by_hash = self.by_hash.write();
        for row in rows {
            let id: String = row.get(0);
            let owner: String = row.get(1);
            let hashed_secret: String = row.get(2);
            let status = match row.get::<String, _>(3).as_str() {
                "disabled" => KeyStatus::Disabled,
                "expired" => KeyStatus::Expired,
                _ => KeyStatus::Enabled,
            };
            let key = APIKey {
                id: id.clone(),
                owner,
                hashed_secret: hashed_secret.clone(),
                status,
                tags: parse_json_list(&row.get::<String, _>(17)),
                allowed_models: parse_json_list(&row.get::<String, _>(18)),
                blocked_models: parse_json_list(&row.get::<String, _>(19)),
                allowed_endpoints: parse_json_list(&row.get::<String, _>(20)),
                cost_limit: row.get(4),
                cost_used: row.get(5),
                rate_limit: RateLimit {
                    rpm: row.get::<Option<i64>, _>(6).map(|v| v as u32),
                    rph: row.get::<Option<i64>, _>(7).map(|v| v as u32),
                    rpd: row.get::<Option<i64>, _>(8).map(|v| v as u32),
                },
                quota_daily: row.get::<Option<i64>, _>(9).map(|v| v as u32),
                quota_monthly: row.get::<Option<i64>, _>(10).map(|v| v as u32),
                requests_used_daily: row.get::<i64, _>(11) as u32,
                requests_used_monthly: row.get::<i64, _>(12) as u32,
                expires_at: parse_timestamp(row.get(13)),
                last_used: parse_timestamp(row.get(14)),
                last_rotated: parse_timestamp(row.get(15)),
                rotation_interval_days: row.get(16),
            };
            by_hash.insert(key.hashed_secret.clone(), id.clone());
            keys.insert(id, key);
        }
        Ok(())
    }

    /// Creates a new key, persists it, and returns the plaintext secret
    /// (shown to the caller exactly once).
    pub async fn create_key(&self, owner: &str) -> Result<(String, APIKey), AppError> {
        let secret = generate_secret();
        let hashed = hash_secret(&secret);
        let id = uuid::Uuid::new_v4().to_string();
        let key = APIKey::new(id.clone(), owner.to_string(), hashed.clone());

        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r"INSERT INTO api_keys (id, owner, hashed_secret, status, cost_used,
                                     requests_used_daily, requests_used_monthly, created_at, updated_at)
               VALUES (?, ?, ?, 'enabled', 0, 0, 0, ?, ?)",
        )
        .bind(&key.id)
        .bind(&key.owner)
        .bind(&hashed)
        .bind(&now)
        .bind(&now)
        .execute(&*self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(DbError::QueryFailed(e)))?;

        self.by_hash.write().insert(key.hashed_secret.clone(), id.clone());
        self.keys.write().insert(id, key.clone());
        Ok((secret, key))
    }

    /// Runs the full 7-step gate check against `secret`, stamping
    /// `last_used` and recording an audit event on success.
    pub async fn validate(
        &self,
        secret: &str,
        model: Option<&str>,
        endpoint: Option<&str>,
        audit: &AuditStore,
    ) -> Result<APIKey, AppError> {
        let hashed = hash_secret(secret);
        let id = self.by_hash.read().get(&hashed).cloned();
        let Some(id) = id else {
            return Err(AppError::Unauthorized);
        };

        // Steps 2-3: status and expiry.
        {
            let mut keys = self.keys.write();
            let key = keys.get_mut(&id).ok_or(AppError::Unauthorized)?;
            if let Some(expires_at) = key.expires_at {
                if expires_at <= Utc::now() {
                    key.status = KeyStatus::Expired;
                }
            }
            match key.status {
                KeyStatus::Disabled => return Err(AppError::KeyDisabled),
                KeyStatus::Expired => return Err(AppError::KeyExpired),
                KeyStatus::Enabled => {}
            }

            // Step 4: cost limit.
            if let Some(limit) = key.cost_limit {
                if key.cost_used >= limit {
                    return Err(AppError::CostLimitExceeded);
                }
            }
        }

        // Step 5: rate limits.
        let snapshot = self.keys.read().get(&id).cloned().ok_or(AppError::Unauthorized)?;
        if let Some(rpm) = snapshot.rate_limit.rpm {
            if !self.check_and_increment(&id, WindowKind::Minute, rpm) {
                return Err(AppError::RateLimited);
            }
        }
        if let Some(rph) = snapshot.rate_limit.rph {
            if !self.check_and_increment(&id, WindowKind::Hour, rph) {
                return Err(AppError::RateLimited);
            }
        }
        if let Some(rpd) = snapshot.rate_limit.rpd {
            if !self.check_and_increment(&id, WindowKind::Day, rpd) {
                return Err(AppError::RateLimited);
            }
        }

        // Step 6: model/endpoint allow/deny.
        if let Some(model) = model {
            if !snapshot.allowed_models.is_empty() && !snapshot.allowed_models.iter().any(|m| m == model) {
                return Err(AppError::ModelForbidden);
            }
            if snapshot.blocked_models.iter().any(|m| m == model) {
                return Err(AppError::ModelForbidden);
            }
        }
        if let Some(endpoint) = endpoint {
            if !snapshot.allowed_endpoints.is_empty()
                && !snapshot.allowed_endpoints.iter().any(|e| e == endpoint)
            {
                return Err(AppError::EndpointForbidden);
            }
        }

        // Step 7: stamp and audit.
        {
            let mut keys = self.keys.write();
            if let Some(key) = keys.get_mut(&id) {
                key.last_used = Some(Utc::now());
            }
        }
        audit
            .record(AuditEvent::success("gate.validate", "api_key", id.clone()).with_key_id(id.clone()))
            .await;

        self.keys.read().get(&id).cloned().ok_or(AppError::Unauthorized)
    }

    /// Records additional spend against a key after a successful dispatch.
    pub fn record_cost(&self, key_id: &str, cost: f64) {
        if let Some(key) = self.keys.write().get_mut(key_id) {
            key.cost_used += cost;
        }
    }

    /// Disables a key in memory, e.g. for an operator-initiated revoke.
    /// Does not persist; the in-memory map is the source of truth until
    /// the next restart reloads from `api_keys`. Returns whether a
    /// matching key was found.
    pub fn disable(&self, key_id: &str) -> bool {
        if let Some(key) = self.keys.write().get_mut(key_id) {
            key.status = KeyStatus::Disabled;
            true
        } else {
            false
        }
    }

    /// A caller-safe snapshot of one key, by id.
    pub fn get(&self, id: &str) -> Option<KeyDescriptor> {
        self.keys.read().get(id).map(KeyDescriptor::from)
    }

    /// Standalone, read-only credential check (§6): reports whether
    /// `secret` currently identifies a usable key, without mutating any
    /// counters and without ever revealing *why* a rejection occurred
    /// beyond the single `invalid_credential` category — an unknown
    /// secret and a disabled or expired key are indistinguishable to the
    /// caller. Calling this repeatedly with the same secret always
    /// yields the same verdict.
    pub fn validate_opaque(&self, secret: &str) -> KeyValidation {
        let hashed = hash_secret(secret);
        let Some(id) = self.by_hash.read().get(&hashed).cloned() else {
            return KeyValidation {
                valid: false,
                error: Some("invalid_credential".to_string()),
                rate_limit_status: false,
                cost_limit_status: false,
            };
        };
        let Some(key) = self.keys.read().get(&id).cloned() else {
            return KeyValidation {
                valid: false,
                error: Some("invalid_credential".to_string()),
                rate_limit_status: false,
                cost_limit_status: false,
            };
        };

        let expired = key
            .expires_at
            .is_some_and(|expires_at| expires_at <= Utc::now());
        let cost_limit_status = key.cost_limit.is_some_and(|limit| key.cost_used >= limit);
        let rate_limit_status = self.peek_rate_limited(&id, &key.rate_limit);

        if key.status == KeyStatus::Disabled || key.status == KeyStatus::Expired || expired {
            return KeyValidation {
                valid: false,
                error: Some("invalid_credential".to_string()),
                rate_limit_status,
                cost_limit_status,
            };
        }
        if cost_limit_status {
            return KeyValidation {
                valid: false,
                error: Some("cost_limit_exceeded".to_string()),
                rate_limit_status,
                cost_limit_status,
            };
        }
        if rate_limit_status {
            return KeyValidation {
                valid: false,
                error: Some("rate_limited".to_string()),
                rate_limit_status,
                cost_limit_status,
            };
        }

        KeyValidation {
            valid: true,
            error: None,
            rate_limit_status,
            cost_limit_status,
        }
    }

    /// Whether any configured rate window for `key_id` is already at or
    /// past its cap, without incrementing any counter — used by
    /// `validate_opaque`, which must stay side-effect free.
    fn peek_rate_limited(&self, key_id: &str, rate_limit: &RateLimit) -> bool {
        let windows = [
            (rate_limit.rpm, WindowKind::Minute),
            (rate_limit.rph, WindowKind::Hour),
            (rate_limit.rpd, WindowKind::Day),
        ];
        for (limit, kind) in windows {
            let Some(limit) = limit else { continue };
            let map_key = (key_id.to_string(), kind);
            if let Some(entry) = self.windows.read().get(&map_key) {
                let counter = entry.lock();
                let now = Utc::now();
                let count = if now - counter.window_start >= kind.duration() { 0 } else { counter.count };
                if count >= limit {
                    return true;
                }
            }
        }
        false
    }

    fn check_and_increment(&self, key_id: &str, kind: WindowKind, limit: u32) -> bool {
        let entry = self.window_entry(key_id, kind);
        let mut counter = entry.lock();
        let now = Utc::now();
        if now - counter.window_start >= kind.duration() {
            counter.window_start = now;
            counter.count = 0;
        }
        if counter.count >= limit {
            return false;
        }
        counter.count += 1;
        true
    }

    fn window_entry(&self, key_id: &str, kind: WindowKind) -> Arc<Mutex<WindowCounter>> {
        let map_key = (key_id.to_string(), kind);
        if let Some(existing) = self.windows.read().get(&map_key) {
            return Arc::clone(existing);
        }
        Arc::clone(
            self.windows
                .write()
                .entry(map_key)
                .or_insert_with(|| {
                    Arc::new(Mutex::new(WindowCounter {
                        window_start: Utc::now(),
                        count: 0,
                    }))
                }),
        )
    }

    /// Spawns the background maintenance loops: hourly counter/expiry
    /// sweeps, 6-hourly nothing-yet reserved slot, and daily rotation.
    pub fn spawn_maintenance(self: Arc<Self>, cancellation: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut hourly = tokio::time::interval(std::time::Duration::from_secs(3600));
            let mut daily = tokio::time::interval(std::time::Duration::from_secs(86400));
            loop {
                tokio::select! {
                    () = cancellation.cancelled() => break,
                    _ = hourly.tick() => self.expire_stale_keys(),
                    _ = daily.tick() => self.rotate_due_keys().await,
                }
            }
        })
    }

    fn expire_stale_keys(&self) {
        let now = Utc::now();
        let mut keys = self.keys.write();
        for key in keys.values_mut() {
            if key.status == KeyStatus::Enabled {
                if let Some(expires_at) = key.expires_at {
                    if expires_at <= now {
                        key.status = KeyStatus::Expired;
                    }
                }
            }
        }
    }

    async fn rotate_due_keys(&self) {
        let due: Vec<String> = {
            let keys = self.keys.read();
            let now = Utc::now();
            keys.values()
                .filter(|k| {
                    k.rotation_interval_days
                        .zip(k.last_rotated)
                        .is_some_and(|(days, last)| now - last >= ChronoDuration::days(days))
                })
                .map(|k| k.id.clone())
                .collect()
        };
        for id in due {
            let new_secret = generate_secret();
            let new_hash = hash_secret(&new_secret);
            let old_hash = self.keys.read().get(&id).map(|k| k.hashed_secret.clone());
            if let Some(key) = self.keys.write().get_mut(&id) {
                key.hashed_secret = new_hash.clone();
                key.last_rotated = Some(Utc::now());
            }
            if let Some(old_hash) = old_hash {
                self.by_hash.write().remove(&old_hash);
            }
            self.by_hash.write().insert(new_hash, id);
        }
    }
}

fn parse_json_list(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

fn parse_timestamp(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{ensure_schema, init_db};

    async fn store() -> (KeyStore, AuditStore) {
        let pool = Arc::new(init_db("sqlite::memory:").await.unwrap());
        ensure_schema(&pool).await.unwrap();
        let keys = KeyStore::new(Arc::clone(&pool));
        let audit = AuditStore::new(pool);
        (keys, audit)
    }

    #[tokio::test]
    async fn unknown_secret_is_unauthorized() {
        let (keys, audit) = store().await;
        let err = keys.validate("no-such-secret", None, None, &audit).await.unwrap_err();
        assert!(matches!(err, AppError::Unauthorized));
    }

    #[tokio::test]
    async fn freshly_created_key_validates_and_stamps_last_used() {
        let (keys, audit) = store().await;
        let (secret, key) = keys.create_key("alice").await.unwrap();
        let validated = keys.validate(&secret, None, None, &audit).await.unwrap();
        assert_eq!(validated.id, key.id);
        assert!(validated.last_used.is_some());
    }

    #[tokio::test]
    async fn cost_limit_rejects_before_dispatch() {
        let (keys, audit) = store().await;
        let (secret, key) = keys.create_key("bob").await.unwrap();
        {
            let mut map = keys.keys.write();
            let k = map.get_mut(&key.id).unwrap();
            k.cost_limit = Some(1.0);
            k.cost_used = 1.0;
        }
        let err = keys.validate(&secret, None, None, &audit).await.unwrap_err();
        assert!(matches!(err, AppError::CostLimitExceeded));
    }

    #[tokio::test]
    async fn rate_limit_rejects_once_cap_is_hit() {
        let (keys, audit) = store().await;
        let (secret, key) = keys.create_key("carol").await.unwrap();
        {
            let mut map = keys.keys.write();
            map.get_mut(&key.id).unwrap().rate_limit.rpm = Some(1);
        }
        assert!(keys.validate(&secret, None, None, &audit).await.is_ok());
        let err = keys.validate(&secret, None, None, &audit).await.unwrap_err();
        assert!(matches!(err, AppError::RateLimited));
    }

    #[tokio::test]
    async fn key_validate_is_idempotent_and_does_not_leak_disabled_vs_unknown() {
        let (keys, _audit) = store().await;
        let (secret, key) = keys.create_key("erin").await.unwrap();
        assert!(keys.disable(&key.id));

        let first = keys.validate_opaque(&secret);
        let second = keys.validate_opaque(&secret);
        assert!(!first.valid);
        assert!(!second.valid);
        assert_eq!(first.error, second.error);

        let unknown = keys.validate_opaque("not-a-real-secret");
        assert_eq!(first.error, unknown.error);
        assert_eq!(first.error.as_deref(), Some("invalid_credential"));

        assert!(!keys.disable("no-such-key"));
    }

    #[tokio::test]
    async fn model_forbidden_when_not_on_allow_list() {
        let (keys, audit) = store().await;
        let (secret, key) = keys.create_key("dave").await.unwrap();
        {
            let mut map = keys.keys.write();
            map.get_mut(&key.id).unwrap().allowed_models = vec!["gpt-4".to_string()];
        }
        let err = keys
            .validate(&secret, Some("claude-3-opus"), None, &audit)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ModelForbidden));
    }
}
