//! Provider Registry (C1): the loaded catalogue of providers.
//!
//! The registry owns the set of configured providers and publishes them as
//! an atomically-swapped snapshot: readers borrow an `Arc<RegistrySnapshot>`
//! for the duration of one operation, so an in-flight dispatch is never
//! disturbed by a concurrent `reload()`.
//!
//! Parsing the external CSV/YAML provider-config storage format, the admin
//! UI, and the persistent schemas behind it are out of scope here (they are
//! referenced only by interface); this module consumes already-parsed
//! [`ProviderRecord`]s from any [`ProviderSource`], with a small CSV reader
//! provided as a convenience for the documented interchange format.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sqlx::Row;

use crate::database::{DbError, DbPool};
use crate::error::AppError;

/// Coarse cost/quality bucket assigned to a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// The vendor's own official API.
    Official,
    /// A community-run mirror or wrapper.
    Community,
    /// An unofficial, unsupported, or local deployment.
    Unofficial,
}

impl Tier {
    /// Parses a tier from its lowercase textual form, as used in the
    /// catalogue format.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "official" => Some(Tier::Official),
            "community" => Some(Tier::Community),
            "unofficial" => Some(Tier::Unofficial),
            _ => None,
        }
    }

    /// Baseline cost score used by the selector's cost sub-score, before
    /// provider-name heuristics are applied.
    pub fn base_cost_score(self) -> f64 {
        match self {
            Tier::Official => 0.3,
            Tier::Community => 0.7,
            Tier::Unofficial => 1.0,
        }
    }
}

/// Where a provider's list of servable models comes from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ModelSource {
    /// An explicit, ordered list of model names.
    Inline(Vec<String>),
    /// A URL to fetch the model list from (cached, 5-minute TTL).
    RemoteUrl(String),
    /// A local script to invoke to obtain the model list.
    LocalScript(String),
}

/// An opaque reference to a provider's credential; the secret material
/// itself lives in the credential store, not in the registry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthRef(pub Option<String>);

/// An immutable-by-reload provider record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRecord {
    /// Unique provider name.
    pub name: String,
    /// Coarse cost/quality tier.
    pub tier: Tier,
    /// Endpoint URL or local-script reference.
    pub endpoint: String,
    /// Where to resolve this provider's model list from.
    pub models: ModelSource,
    /// Opaque credential reference.
    #[serde(default)]
    pub auth: AuthRef,
}

impl ProviderRecord {
    fn validate(&self) -> Result<(), AppError> {
        if self.name.trim().is_empty() {
            return Err(AppError::ConfigInvalid(
                "provider record has an empty name".into(),
            ));
        }
        if self.endpoint.trim().is_empty() {
            return Err(AppError::ConfigInvalid(format!(
                "provider '{}' has an empty endpoint",
                self.name
            )));
        }
        Ok(())
    }
}

/// Anything that can produce a set of provider records for a reload.
///
/// The CSV/YAML file formats, remote config services, and admin-UI-driven
/// sources all implement this by adapting their own storage into
/// `ProviderRecord`s; this crate ships only an in-memory and a CSV-string
/// implementation.
pub trait ProviderSource: Send + Sync {
    /// Produces the full set of provider records for a reload.
    fn load(&self) -> Result<Vec<ProviderRecord>, AppError>;
}

/// A source backed by an in-memory list, useful for tests and for
/// embedding callers that already have parsed records.
#[derive(Debug, Clone, Default)]
pub struct StaticSource(pub Vec<ProviderRecord>);

impl ProviderSource for StaticSource {
    fn load(&self) -> Result<Vec<ProviderRecord>, AppError> {
        Ok(self.0.clone())
    }
}

/// Parses the newline-delimited, CSV-compatible provider catalogue format
/// from §6: a mandatory header, columns `Name, Tier, Endpoint, APIKey,
/// Model(s), Other` (APIKey and Other optional; minimum 4 columns).
pub fn parse_csv_catalogue(input: &str) -> Result<Vec<ProviderRecord>, AppError> {
    let mut lines = input.lines();
    let header = lines
        .next()
        .ok_or_else(|| AppError::ConfigInvalid("empty provider catalogue".into()))?;
    if header.split(',').count() < 4 {
        return Err(AppError::ConfigInvalid(
            "provider catalogue header must have at least 4 columns".into(),
        ));
    }

    let mut records = Vec::new();
    for (lineno, line) in lines.enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let cols: Vec<&str> = line.split(',').map(str::trim).collect();
        if cols.len() < 4 {
            return Err(AppError::ConfigInvalid(format!(
                "provider catalogue row {} has fewer than 4 columns",
                lineno + 2
            )));
        }
        let name = cols[0].to_string();
        let tier = Tier::parse(cols[1]).ok_or_else(|| {
            AppError::ConfigInvalid(format!("unknown tier '{}' for provider '{}'", cols[1], name))
        })?;
        let endpoint = cols[2].to_string();
        let auth = AuthRef(cols.get(3).filter(|s| !s.is_empty()).map(|s| s.to_string()));
        let models_field = cols.get(4).copied().unwrap_or("");
        let models = parse_model_field(models_field);
        records.push(ProviderRecord {
            name,
            tier,
            endpoint,
            models,
            auth,
        });
    }
    Ok(records)
}

fn parse_model_field(field: &str) -> ModelSource {
    let trimmed = field.trim();
    if trimmed.is_empty() {
        ModelSource::Inline(Vec::new())
    } else if let Some(script) = trimmed.strip_prefix("./") {
        ModelSource::LocalScript(format!("./{script}"))
    } else if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        ModelSource::RemoteUrl(trimmed.to_string())
    } else {
        ModelSource::Inline(
            trimmed
                .split('|')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }
}

/// Immutable, fully-validated catalogue published by a successful reload.
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    providers: Vec<ProviderRecord>,
}

impl RegistrySnapshot {
    /// All providers in this snapshot.
    pub fn list(&self) -> &[ProviderRecord] {
        &self.providers
    }

    /// Looks up a single provider by name.
    pub fn get(&self, name: &str) -> Option<&ProviderRecord> {
        self.providers.iter().find(|p| p.name == name)
    }
}

struct RemoteModelCache {
    fetched_at: Instant,
    models: Vec<String>,
}

const REMOTE_MODEL_TTL: Duration = Duration::from_secs(5 * 60);

/// The Provider Registry: holds an atomically-swappable snapshot of the
/// provider catalogue plus the remote model-list cache.
#[derive(Clone)]
pub struct ProviderRegistry {
    snapshot: Arc<RwLock<Arc<RegistrySnapshot>>>,
    remote_cache: Arc<RwLock<std::collections::HashMap<String, RemoteModelCache>>>,
    http: reqwest::Client,
    store: Option<Arc<ProviderRegistryStore>>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.current().list().len())
            .finish()
    }
}

impl ProviderRegistry {
    /// Builds an empty registry; call `reload` to populate it.
    pub fn new() -> Self {
        Self {
            snapshot: Arc::new(RwLock::new(Arc::new(RegistrySnapshot::default()))),
            remote_cache: Arc::new(RwLock::new(std::collections::HashMap::new())),
            http: reqwest::Client::new(),
            store: None,
        }
    }

    /// Builds a registry that persists every successful `reload` to
    /// `store` and can rehydrate its last-known catalogue via
    /// `hydrate_from_store`.
    pub fn with_store(store: Arc<ProviderRegistryStore>) -> Self {
        let mut registry = Self::new();
        registry.store = Some(store);
        registry
    }

    /// Repopulates the snapshot from the last catalogue persisted to the
    /// attached store, if any. Returns `false` if this registry has no
    /// store attached or the store has never been written to.
    pub async fn hydrate_from_store(&self) -> Result<bool, AppError> {
        let Some(store) = &self.store else {
            return Ok(false);
        };
        let records = store.load().await?;
        if records.is_empty() {
            return Ok(false);
        }
        for record in &records {
            record.validate()?;
        }
        *self.snapshot.write() = Arc::new(RegistrySnapshot { providers: records });
        Ok(true)
    }

    /// Returns the currently-published snapshot.
    pub fn current(&self) -> Arc<RegistrySnapshot> {
        Arc::clone(&self.snapshot.read())
    }

    /// `list()`: all providers in the current snapshot.
    pub fn list(&self) -> Vec<ProviderRecord> {
        self.current().list().to_vec()
    }

    /// `get(name)`: a single provider by name from the current snapshot.
    pub fn get(&self, name: &str) -> Option<ProviderRecord> {
        self.current().get(name).cloned()
    }

    /// Rebuilds the catalogue from `source`, validates it in full, and
    /// atomically swaps it in. On validation failure the previous
    /// catalogue is retained and an error is returned. If a store is
    /// attached, the new catalogue is persisted after the swap so a
    /// restart can rehydrate it via `hydrate_from_store`; a persistence
    /// failure is logged but does not undo the in-memory swap.
    pub async fn reload(&self, source: &dyn ProviderSource) -> Result<(), AppError> {
        let records = source.load()?;

        let mut seen = std::collections::HashSet::new();
        for record in &records {
            record.validate()?;
            if !seen.insert(record.name.clone()) {
                return Err(AppError::ConfigInvalid(format!(
                    "duplicate provider name '{}'",
                    record.name
                )));
            }
        }

        let new_snapshot = Arc::new(RegistrySnapshot { providers: records });
        *self.snapshot.write() = Arc::clone(&new_snapshot);

        if let Some(store) = &self.store {
            if let Err(err) = store.save(new_snapshot.list()).await {
                tracing::warn!(error = %err, "failed to persist provider catalogue reload");
            }
        }

        Ok(())
    }

    /// `discover-models(name)`: resolves the effective model list for a
    /// provider, following its `ModelSource`. Remote fetches are cached per
    /// URL for 5 minutes; a fetch failure degrades to treating the raw URL
    /// as a single literal model name.
    pub async fn discover_models(&self, name: &str) -> Result<Vec<String>, AppError> {
        let Some(provider) = self.get(name) else {
            return Err(AppError::ConfigInvalid(format!("unknown provider '{name}'")));
        };

        match &provider.models {
            ModelSource::Inline(models) => Ok(models.clone()),
            ModelSource::LocalScript(script) => self.run_local_script(script).await,
            ModelSource::RemoteUrl(url) => self.fetch_remote_models(url).await,
        }
    }

    async fn fetch_remote_models(&self, url: &str) -> Result<Vec<String>, AppError> {
        if let Some(cached) = self.remote_cache.read().get(url) {
            if cached.fetched_at.elapsed() < REMOTE_MODEL_TTL {
                return Ok(cached.models.clone());
            }
        }

        match self.http.get(url).send().await {
            Ok(response) => match response.text().await {
                Ok(body) => {
                    let models = parse_model_list_response(&body);
                    self.remote_cache.write().insert(
                        url.to_string(),
                        RemoteModelCache {
                            fetched_at: Instant::now(),
                            models: models.clone(),
                        },
                    );
                    Ok(models)
                }
                Err(err) => {
                    tracing::warn!(url, error = %err, "failed to read remote model list body; falling back to literal URL");
                    Ok(vec![url.to_string()])
                }
            },
            Err(err) => {
                tracing::warn!(url, error = %err, "remote model list fetch failed; falling back to literal URL");
                Ok(vec![url.to_string()])
            }
        }
    }

    async fn run_local_script(&self, script: &str) -> Result<Vec<String>, AppError> {
        let output = tokio::process::Command::new(script)
            .output()
            .await
            .map_err(|err| {
                AppError::ConfigInvalid(format!("failed to run model-list script '{script}': {err}"))
            })?;
        let body = String::from_utf8_lossy(&output.stdout);
        Ok(parse_model_list_response(&body))
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Persists the provider catalogue to `provider_catalogue`, so a reload
/// survives a restart instead of depending solely on
/// `--catalogue-path`/`POST /v1/providers/reload` being re-supplied.
pub struct ProviderRegistryStore {
    pool: Arc<DbPool>,
}

impl std::fmt::Debug for ProviderRegistryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistryStore").finish()
    }
}

impl ProviderRegistryStore {
    /// Builds a store over `pool`.
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self { pool }
    }

    /// Replaces the persisted catalogue with exactly `providers`.
    pub async fn save(&self, providers: &[ProviderRecord]) -> Result<(), AppError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|err| AppError::DatabaseError(DbError::QueryFailed(err)))?;

        sqlx::query("DELETE FROM provider_catalogue")
            .execute(&mut *tx)
            .await
            .map_err(|err| AppError::DatabaseError(DbError::QueryFailed(err)))?;

        let now = Utc::now().to_rfc3339();
        for provider in providers {
            let models = serde_json::to_string(&provider.models)
                .map_err(|err| AppError::Internal(format!("failed to encode provider models: {err}")))?;
            sqlx::query(
                r"INSERT INTO provider_catalogue (name, tier, endpoint, models, auth_ref, updated_at)
                   VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&provider.name)
            .bind(format!("{:?}", provider.tier).to_lowercase())
            .bind(&provider.endpoint)
            .bind(models)
            .bind(&provider.auth.0)
            .bind(&now)
            .execute(&mut *tx)
            .await
            .map_err(|err| AppError::DatabaseError(DbError::QueryFailed(err)))?;
        }

        tx.commit()
            .await
            .map_err(|err| AppError::DatabaseError(DbError::QueryFailed(err)))?;
        Ok(())
    }

    /// Loads the last persisted catalogue, empty if nothing has been saved.
    pub async fn load(&self) -> Result<Vec<ProviderRecord>, AppError> {
        let rows = sqlx::query("SELECT name, tier, endpoint, models, auth_ref FROM provider_catalogue")
            .fetch_all(&*self.pool)
            .await
            .map_err(|err| AppError::DatabaseError(DbError::QueryFailed(err)))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.get(0);
            let tier_raw: String = row.get(1);
            let tier = Tier::parse(&tier_raw)
                .ok_or_else(|| AppError::Internal(format!("unknown persisted tier '{tier_raw}' for provider '{name}'")))?;
            let models_raw: String = row.get(3);
            let models = serde_json::from_str(&models_raw)
                .map_err(|err| AppError::Internal(format!("failed to decode provider models: {err}")))?;
            records.push(ProviderRecord {
                name,
                tier,
                endpoint: row.get(2),
                models,
                auth: AuthRef(row.get(4)),
            });
        }
        Ok(records)
    }
}

/// Parses a model-list response per the supported formats in §4.1: JSON
/// array of strings; JSON object with one of `{models, data, model_list,
/// available_models}`; newline- or comma-separated text; single-line text.
fn parse_model_list_response(body: &str) -> Vec<String> {
    let trimmed = body.trim();

    if let Ok(array) = serde_json::from_str::<Vec<String>>(trimmed) {
        return array;
    }

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Some(obj) = value.as_object() {
            for key in ["models", "data", "model_list", "available_models"] {
                if let Some(list) = obj.get(key).and_then(|v| v.as_array()) {
                    let names: Vec<String> = list
                        .iter()
                        .filter_map(|v| {
                            v.as_str()
                                .map(str::to_string)
                                .or_else(|| v.get("id").and_then(|i| i.as_str()).map(str::to_string))
                        })
                        .collect();
                    if !names.is_empty() {
                        return names;
                    }
                }
            }
        }
    }

    if trimmed.contains('\n') {
        return trimmed.lines().map(str::trim).filter(|l| !l.is_empty()).map(str::to_string).collect();
    }
    if trimmed.contains(',') {
        return trimmed.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect();
    }
    if trimmed.is_empty() {
        Vec::new()
    } else {
        vec![trimmed.to_string()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record(name: &str, tier: Tier) -> ProviderRecord {
        ProviderRecord {
            name: name.to_string(),
            tier,
            endpoint: format!("https://{name}.example.com"),
            models: ModelSource::Inline(vec!["base-model".into()]),
            auth: AuthRef(None),
        }
    }

    #[tokio::test]
    async fn reload_swaps_in_new_snapshot() {
        let registry = ProviderRegistry::new();
        let source = StaticSource(vec![sample_record("openai", Tier::Official)]);
        registry.reload(&source).await.unwrap();
        assert_eq!(registry.list().len(), 1);
        assert!(registry.get("openai").is_some());
    }

    #[tokio::test]
    async fn reload_rejects_empty_name() {
        let registry = ProviderRegistry::new();
        let mut bad = sample_record("x", Tier::Official);
        bad.name = String::new();
        let source = StaticSource(vec![bad]);
        assert!(registry.reload(&source).await.is_err());
        assert!(registry.list().is_empty());
    }

    #[tokio::test]
    async fn reload_failure_retains_previous_catalogue() {
        let registry = ProviderRegistry::new();
        registry
            .reload(&StaticSource(vec![sample_record("openai", Tier::Official)]))
            .await
            .unwrap();

        let mut bad = sample_record("broken", Tier::Official);
        bad.endpoint = String::new();
        assert!(registry.reload(&StaticSource(vec![bad])).await.is_err());

        assert_eq!(registry.list().len(), 1);
        assert_eq!(registry.list()[0].name, "openai");
    }

    #[tokio::test]
    async fn reload_rejects_duplicate_names() {
        let registry = ProviderRegistry::new();
        let source = StaticSource(vec![
            sample_record("dup", Tier::Official),
            sample_record("dup", Tier::Community),
        ]);
        assert!(registry.reload(&source).await.is_err());
    }

    #[tokio::test]
    async fn store_round_trips_catalogue_through_persistence() {
        let pool = Arc::new(crate::database::init_db("sqlite::memory:").await.unwrap());
        crate::database::ensure_schema(&pool).await.unwrap();
        let store = Arc::new(ProviderRegistryStore::new(pool));

        let registry = ProviderRegistry::with_store(Arc::clone(&store));
        registry
            .reload(&StaticSource(vec![sample_record("openai", Tier::Official)]))
            .await
            .unwrap();

        let rehydrated = ProviderRegistry::with_store(store);
        assert!(rehydrated.hydrate_from_store().await.unwrap());
        assert_eq!(rehydrated.list().len(), 1);
        assert_eq!(rehydrated.list()[0].name, "openai");
    }

    #[test]
    fn csv_catalogue_round_trips_provider_set() {
        let csv = "Name,Tier,Endpoint,APIKey,Model(s)\n\
                   OpenAI,official,https://api.openai.com,sk-abc,gpt-4o|gpt-4o-mini\n\
                   Pollinations,community,https://image.pollinations.ai,,stable-diffusion\n";
        let records = parse_csv_catalogue(csv).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name, "OpenAI");
        assert_eq!(records[0].tier, Tier::Official);
        match &records[0].models {
            ModelSource::Inline(models) => {
                assert_eq!(models, &vec!["gpt-4o".to_string(), "gpt-4o-mini".to_string()]);
            }
            _ => panic!("expected inline model list"),
        }
    }

    #[test]
    fn model_list_response_parses_json_object_variants() {
        let body = r#"{"models": ["a", "b"]}"#;
        assert_eq!(parse_model_list_response(body), vec!["a", "b"]);

        let body = r#"["x", "y", "z"]"#;
        assert_eq!(parse_model_list_response(body), vec!["x", "y", "z"]);

        let body = "one\ntwo\nthree";
        assert_eq!(parse_model_list_response(body), vec!["one", "two", "three"]);

        let body = "solo-model";
        assert_eq!(parse_model_list_response(body), vec!["solo-model"]);
    }
}
