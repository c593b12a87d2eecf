//! Caller API (§6): the router's transport-agnostic contract — submit,
//! query, and cancel a request; list, get, and refresh providers; key
//! CRUD and standalone key-validate. `routes.rs` is a thin Axum binding
//! over [`RouterApi`]; nothing here knows about HTTP.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audit::AuditStore;
use crate::error::AppError;
use crate::executor::{ExecutionReport, Executor, JobLedgerStore, RequestStatus};
use crate::gate::{APIKey, KeyDescriptor, KeyStore, KeyValidation};
use crate::models::{Constraints, Request};
use crate::registry::{ProviderRecord, ProviderRegistry, ProviderSource};

/// The router's logical operations, independent of whatever wire format
/// exposes them. Holds the in-flight cancellation tokens for submitted
/// requests; everything else is delegated to the component stores.
#[derive(Clone)]
pub struct RouterApi {
    executor: Arc<Executor>,
    registry: Arc<ProviderRegistry>,
    keys: Arc<KeyStore>,
    audit: Arc<AuditStore>,
    ledger: Arc<JobLedgerStore>,
    in_flight: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
}

impl std::fmt::Debug for RouterApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterApi").finish()
    }
}

impl RouterApi {
    /// Builds a `RouterApi` over the already-constructed component stores.
    pub fn new(
        executor: Arc<Executor>,
        registry: Arc<ProviderRegistry>,
        keys: Arc<KeyStore>,
        audit: Arc<AuditStore>,
        ledger: Arc<JobLedgerStore>,
    ) -> Self {
        Self {
            executor,
            registry,
            keys,
            audit,
            ledger,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Submit request (§6): validates `secret` as an admission gate
    /// (model/endpoint/rate/cost checks all apply, unlike `key_validate`),
    /// classifies and dispatches `prompt`, and records spend against the
    /// resolved key. Persists each terminal job to the job ledger so
    /// `query_request` survives a restart.
    pub async fn submit_request(
        &self,
        secret: &str,
        prompt: String,
        context: HashMap<String, String>,
        constraints: Constraints,
    ) -> Result<ExecutionReport, AppError> {
        let key = self.keys.validate(secret, None, Some("/v1/requests"), &self.audit).await?;

        let request = Request {
            id: Uuid::new_v4(),
            caller_key: key.id.clone(),
            prompt,
            context,
            constraints,
        };

        let caller = key.constraints();
        let plan = self.executor.build_plan(&request, &caller).await?;

        let token = CancellationToken::new();
        self.in_flight.lock().insert(request.id, token.clone());
        let report = self.executor.execute(plan, &request, caller, token).await;
        self.in_flight.lock().remove(&request.id);

        let report = report?;
        if report.total_cost > 0.0 {
            self.keys.record_cost(&key.id, report.total_cost);
        }
        for job in &report.jobs {
            if let Err(err) = self.ledger.record(request.id, job).await {
                tracing::warn!(request_id = %request.id, job_id = %job.id, error = %err, "failed to persist job to ledger");
            }
        }
        Ok(report)
    }

    /// Query request (§6): `{request-id} -> {state, progress, result?,
    /// error?}`. Checks the submitting executor's live/completed tables
    /// first; falls back to the persisted job ledger so a request survives
    /// a restart, at the cost of the full `ExecutionReport` (only
    /// per-job state round-trips through the ledger).
    pub async fn query_request(&self, request_id: Uuid) -> Result<Option<RequestStatus>, AppError> {
        if let Some(status) = self.executor.query(request_id) {
            return Ok(Some(status));
        }
        let jobs = self.ledger.jobs_for_request(request_id).await?;
        if jobs.is_empty() {
            return Ok(None);
        }
        Ok(Some(RequestStatus::from_jobs(request_id, &jobs)))
    }

    /// Cancel request (§6): signals cooperative cancellation for an
    /// in-flight request. Returns `false` if the request is unknown or
    /// already terminal.
    pub fn cancel_request(&self, request_id: Uuid) -> bool {
        match self.in_flight.lock().get(&request_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// List providers (§6): every provider in the current catalogue.
    pub fn list_providers(&self) -> Vec<ProviderRecord> {
        self.registry.list()
    }

    /// Get provider (§6): a single provider by name.
    pub fn get_provider(&self, name: &str) -> Option<ProviderRecord> {
        self.registry.get(name)
    }

    /// Refresh providers (§6): reloads the catalogue from `source`,
    /// atomically swapping it in.
    pub async fn refresh_providers(&self, source: &dyn ProviderSource) -> Result<(), AppError> {
        self.registry.reload(source).await
    }

    /// Key create (§6): mints a new key for `owner`, returning the
    /// plaintext secret exactly once.
    pub async fn create_key(&self, owner: &str) -> Result<(String, APIKey), AppError> {
        self.keys.create_key(owner).await
    }

    /// Key read (§6): a caller-safe view of one key, omitting its secret.
    pub fn get_key(&self, id: &str) -> Option<KeyDescriptor> {
        self.keys.get(id)
    }

    /// Key disable (§6): administratively revokes a key. Returns `false`
    /// if no key with that id exists.
    pub fn disable_key(&self, id: &str) -> bool {
        self.keys.disable(id)
    }

    /// Key validate (§6): a standalone, read-only, idempotent credential
    /// check. Unlike `submit_request`'s admission gate, this never
    /// mutates any counter and never distinguishes a disabled key from an
    /// unknown secret beyond the single `invalid_credential` category.
    pub fn key_validate(&self, secret: &str) -> KeyValidation {
        self.keys.validate_opaque(secret)
    }

    /// Key audit (§6): the most recent audit events recorded against `id`.
    pub async fn key_audit(&self, id: &str, limit: i64) -> Result<Vec<crate::audit::AuditEvent>, AppError> {
        Ok(self.audit.recent_for_key(id, limit).await?)
    }
}
