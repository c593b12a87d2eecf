//! Executor (C5): turns a `Request` into a `Plan`, then runs it with a
//! bounded worker pool, dependency gating, cooperative cancellation, and
//! fallback re-selection.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use sqlx::Row;
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::capability::CapabilityEngine;
use crate::classifier::{classify_task_type, score_complexity};
use crate::database::{DbError, DbPool};
use crate::error::AppError;
use crate::metrics::MetricsStore;
use crate::models::{DispatchOutcome, JobExecution, JobState, Plan, Request, Task};
use crate::providers::{EchoAdapter, ProviderAdapter};
use crate::registry::ProviderRegistry;
use crate::selector::{self, CallerConstraints, SelectorWeights};

const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_FALLBACKS: u8 = 2;
const RESCAN_PERIOD: Duration = Duration::from_secs(1);

/// Produces the provider adapter that should serve a given provider record.
/// The real HTTP/local-script dispatch backends are out of scope; this
/// crate ships [`EchoAdapterFactory`] for local smoke-testing.
pub trait AdapterFactory: Send + Sync {
    /// Returns the adapter that should serve `provider_name`.
    fn adapter_for(&self, provider_name: &str) -> Arc<dyn ProviderAdapter>;
}

/// The default factory: every provider is served by a deterministic echo.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoAdapterFactory;

impl AdapterFactory for EchoAdapterFactory {
    fn adapter_for(&self, _provider_name: &str) -> Arc<dyn ProviderAdapter> {
        Arc::new(EchoAdapter::default())
    }
}

/// The outcome of running one `Plan` to completion.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ExecutionReport {
    /// The request this plan was derived from.
    pub request_id: Uuid,
    /// Whether the plan as a whole succeeded.
    pub success: bool,
    /// Summed cost across all terminal tasks.
    pub total_cost: f64,
    /// Wall-clock duration of the whole execution.
    pub duration: Duration,
    /// The final state of every job in the plan.
    pub jobs: Vec<JobExecution>,
}

/// A point-in-time view of a request's overall progress, aggregated across
/// every job in its plan — what the query-request operation (see `api.rs`)
/// returns.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RequestStatus {
    /// The request this status describes.
    pub request_id: Uuid,
    /// Aggregate lifecycle state across every job in the plan.
    pub state: JobState,
    /// Mean fractional completion across every job in the plan.
    pub progress: f64,
    /// The full execution report, once every job has reached a terminal
    /// state.
    pub result: Option<ExecutionReport>,
    /// The first job-level error encountered, if the aggregate state is
    /// `Failed`.
    pub error: Option<String>,
}

impl RequestStatus {
    /// Builds a status from raw job rows, without a full `ExecutionReport`
    /// — the shape returned when reconstructing from the persisted job
    /// ledger after a restart.
    pub(crate) fn from_jobs(request_id: Uuid, jobs: &[JobExecution]) -> Self {
        let (state, progress, error) = aggregate_jobs(jobs);
        Self {
            request_id,
            state,
            progress,
            result: None,
            error,
        }
    }
}

fn aggregate_jobs(jobs: &[JobExecution]) -> (JobState, f64, Option<String>) {
    if jobs.is_empty() {
        return (JobState::Pending, 0.0, None);
    }
    let progress = jobs.iter().map(|j| j.progress).sum::<f64>() / jobs.len() as f64;

    if jobs.iter().any(|j| j.state == JobState::Running) {
        return (JobState::Running, progress, None);
    }
    if !jobs.iter().all(|j| j.state.is_terminal()) {
        return (JobState::Pending, progress, None);
    }
    if jobs.iter().any(|j| j.state == JobState::Failed) {
        let error = jobs.iter().find_map(|j| j.error.clone());
        return (JobState::Failed, progress, error);
    }
    if jobs.iter().any(|j| j.state == JobState::Cancelled) {
        return (JobState::Cancelled, progress, None);
    }
    (JobState::Done, progress, None)
}

/// Persists `JobExecution` rows to `job_ledger`, so query-request can
/// reconstruct a request's last known status after a restart, once the
/// executor that ran it is gone.
pub struct JobLedgerStore {
    pool: Arc<DbPool>,
}

impl std::fmt::Debug for JobLedgerStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobLedgerStore").finish()
    }
}

fn job_state_str(state: JobState) -> &'static str {
    match state {
        JobState::Pending => "pending",
        JobState::Running => "running",
        JobState::Done => "done",
        JobState::Failed => "failed",
        JobState::Cancelled => "cancelled",
    }
}

fn parse_job_state(raw: &str) -> JobState {
    match raw {
        "running" => JobState::Running,
        "done" => JobState::Done,
        "failed" => JobState::Failed,
        "cancelled" => JobState::Cancelled,
        _ => JobState::Pending,
    }
}

impl JobLedgerStore {
    /// Builds a store over `pool`.
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self { pool }
    }

    /// Upserts one job's current state against its owning request.
    pub async fn record(&self, request_id: Uuid, job: &JobExecution) -> Result<(), AppError> {
        let result = job
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|err| AppError::Internal(format!("failed to encode job result: {err}")))?;

        sqlx::query(
            r"INSERT INTO job_ledger
                (id, request_id, task_id, state, start, end, result, error, progress, fallback_count)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                   state = excluded.state, start = excluded.start, end = excluded.end,
                   result = excluded.result, error = excluded.error, progress = excluded.progress,
                   fallback_count = excluded.fallback_count",
        )
        .bind(job.id.to_string())
        .bind(request_id.to_string())
        .bind(job.task_id.to_string())
        .bind(job_state_str(job.state))
        .bind(job.start.map(|t| t.to_rfc3339()))
        .bind(job.end.map(|t| t.to_rfc3339()))
        .bind(result)
        .bind(&job.error)
        .bind(job.progress)
        .bind(i64::from(job.fallback_count))
        .execute(&*self.pool)
        .await
        .map_err(|err| AppError::DatabaseError(DbError::QueryFailed(err)))?;
        Ok(())
    }

    /// Every job ever recorded for `request_id`; used to reconstruct a
    /// request's status once the executor that ran it has moved on.
    pub async fn jobs_for_request(&self, request_id: Uuid) -> Result<Vec<JobExecution>, AppError> {
        let rows = sqlx::query(
            r"SELECT id, task_id, state, start, end, result, error, progress, fallback_count
               FROM job_ledger WHERE request_id = ?",
        )
        .bind(request_id.to_string())
        .fetch_all(&*self.pool)
        .await
        .map_err(|err| AppError::DatabaseError(DbError::QueryFailed(err)))?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.get(0);
            let task_id: String = row.get(1);
            let state: String = row.get(2);
            let start: Option<String> = row.get(3);
            let end: Option<String> = row.get(4);
            let result: Option<String> = row.get(5);

            jobs.push(JobExecution {
                id: Uuid::parse_str(&id)
                    .map_err(|err| AppError::Internal(format!("invalid job id in ledger: {err}")))?,
                task_id: Uuid::parse_str(&task_id)
                    .map_err(|err| AppError::Internal(format!("invalid task id in ledger: {err}")))?,
                state: parse_job_state(&state),
                start: start.and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok()).map(|dt| dt.with_timezone(&Utc)),
                end: end.and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok()).map(|dt| dt.with_timezone(&Utc)),
                result: result.and_then(|r| serde_json::from_str(&r).ok()),
                error: row.get(6),
                progress: row.get(7),
                fallback_count: row.get::<i64, _>(8) as u8,
            });
        }
        Ok(jobs)
    }
}

struct ExecutorInner {
    registry: Arc<ProviderRegistry>,
    capability_engine: Arc<CapabilityEngine>,
    metrics: Arc<MetricsStore>,
    adapters: Arc<dyn AdapterFactory>,
    max_workers: usize,
    default_weights: SelectorWeights,
    live: parking_lot::RwLock<HashMap<Uuid, Arc<Mutex<HashMap<Uuid, JobExecution>>>>>,
    completed: Mutex<HashMap<Uuid, ExecutionReport>>,
}

/// Runs `Plan`s derived from caller `Request`s.
#[derive(Clone)]
pub struct Executor {
    inner: Arc<ExecutorInner>,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor").field("max_workers", &self.inner.max_workers).finish()
    }
}

impl Executor {
    /// Builds an executor bounded to `max_workers` concurrent dispatches
    /// (default 5 per §4.5).
    pub fn new(
        registry: Arc<ProviderRegistry>,
        capability_engine: Arc<CapabilityEngine>,
        metrics: Arc<MetricsStore>,
        adapters: Arc<dyn AdapterFactory>,
        max_workers: usize,
    ) -> Self {
        Self::with_weights(registry, capability_engine, metrics, adapters, max_workers, SelectorWeights::default())
    }

    /// Like [`Executor::new`], overriding the default selector weights
    /// (e.g. with operator-configured values from `RoutingConfig`).
    #[allow(clippy::too_many_arguments)]
    pub fn with_weights(
        registry: Arc<ProviderRegistry>,
        capability_engine: Arc<CapabilityEngine>,
        metrics: Arc<MetricsStore>,
        adapters: Arc<dyn AdapterFactory>,
        max_workers: usize,
        default_weights: SelectorWeights,
    ) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                registry,
                capability_engine,
                metrics,
                adapters,
                max_workers: max_workers.max(1),
                default_weights,
                live: parking_lot::RwLock::new(HashMap::new()),
                completed: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Query request (§6): the live or last-completed status of
    /// `request_id`, if this executor has ever run it in this process.
    /// Returns `None` for a request this executor has never seen — the
    /// caller (`api.rs`) falls back to the persisted job ledger in that
    /// case.
    pub fn query(&self, request_id: Uuid) -> Option<RequestStatus> {
        if let Some(jobs) = self.inner.live.read().get(&request_id).cloned() {
            let jobs: Vec<JobExecution> = jobs.lock().values().cloned().collect();
            return Some(RequestStatus::from_jobs(request_id, &jobs));
        }
        self.inner.completed.lock().get(&request_id).cloned().map(|report| {
            let (state, progress, error) = aggregate_jobs(&report.jobs);
            RequestStatus {
                request_id,
                state,
                progress,
                result: Some(report),
                error,
            }
        })
    }

    /// Classifies `request` and selects a single provider for it, yielding
    /// a one-task `Plan`. Multi-task plans with explicit dependencies are
    /// constructed directly by the caller and passed to `execute`.
    pub async fn build_plan(&self, request: &Request, caller: &CallerConstraints) -> Result<Plan, AppError> {
        let task_type = classify_task_type(&request.prompt, request.constraints.task_type_hint);
        let complexity = score_complexity(&request.prompt, &request.context);

        let preference = request.constraints.provider_preference.as_ref();
        let result = selector::select(
            task_type,
            &complexity,
            &self.inner.registry,
            &self.inner.capability_engine,
            &self.inner.metrics,
            caller,
            preference,
            request.constraints.max_cost,
            self.inner.default_weights,
            &[],
        )
        .await?;

        let task = Task {
            id: Uuid::new_v4(),
            task_type,
            chosen_provider: Some(result.provider_name),
            upstream_payload: request.prompt.clone(),
            priority: Task::default_priority(task_type),
            dependencies: Vec::new(),
        };

        Ok(Plan {
            request_id: request.id,
            parallel: request.constraints.parallel,
            tasks: vec![task],
        })
    }

    /// Runs `plan` to completion against the worker pool.
    pub async fn execute(
        &self,
        plan: Plan,
        request: &Request,
        caller: CallerConstraints,
        cancellation: CancellationToken,
    ) -> Result<ExecutionReport, AppError> {
        plan.validate()?;
        let start = Instant::now();

        let jobs: Arc<Mutex<HashMap<Uuid, JobExecution>>> = Arc::new(Mutex::new(
            plan.tasks.iter().map(|t| (t.id, JobExecution::pending(t.id))).collect(),
        ));
        self.inner.live.write().insert(plan.request_id, Arc::clone(&jobs));
        let tasks_by_id: HashMap<Uuid, Task> = plan.tasks.iter().map(|t| (t.id, t.clone())).collect();
        let semaphore = Arc::new(Semaphore::new(self.inner.max_workers));
        let notify = Arc::new(Notify::new());
        let deadline = request.timeout().min(DEFAULT_TASK_TIMEOUT);
        let best_effort = request.constraints.best_effort;
        let mut started: HashSet<Uuid> = HashSet::new();

        loop {
            if !plan.parallel && !best_effort {
                let any_failed = jobs.lock().values().any(|j| j.state == JobState::Failed);
                if any_failed {
                    let mut guard = jobs.lock();
                    for job in guard.values_mut() {
                        if job.state == JobState::Pending {
                            job.state = JobState::Failed;
                            job.error = Some("skipped: earlier task in sequential plan failed".into());
                            job.end = Some(Utc::now());
                        }
                    }
                }
            }

            if cancellation.is_cancelled() {
                let mut guard = jobs.lock();
                for job in guard.values_mut() {
                    if job.state == JobState::Pending {
                        job.state = JobState::Cancelled;
                        job.end = Some(Utc::now());
                    }
                }
            }

            if jobs.lock().values().all(|j| j.state.is_terminal()) {
                break;
            }

            let eligible: Vec<Uuid> = plan
                .tasks
                .iter()
                .filter(|t| !started.contains(&t.id))
                .filter(|t| {
                    jobs.lock().get(&t.id).map(|j| j.state == JobState::Pending).unwrap_or(false)
                })
                .filter(|t| {
                    let guard = jobs.lock();
                    t.dependencies
                        .iter()
                        .all(|dep| guard.get(dep).is_some_and(|j| j.state == JobState::Done))
                })
                .map(|t| t.id)
                .collect();

            for task_id in eligible {
                let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
                    continue;
                };
                started.insert(task_id);
                let task = tasks_by_id.get(&task_id).expect("eligible task exists in plan").clone();
                let jobs = Arc::clone(&jobs);
                let notify = Arc::clone(&notify);
                let executor = self.clone();
                let cancellation = cancellation.clone();
                let caller = caller.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    executor.run_task(task, jobs, caller, cancellation, deadline).await;
                    notify.notify_waiters();
                });
            }

            tokio::select! {
                () = notify.notified() => {},
                () = tokio::time::sleep(RESCAN_PERIOD) => {},
            }
        }

        self.inner.live.write().remove(&plan.request_id);
        let jobs_final: Vec<JobExecution> = jobs.lock().values().cloned().collect();
        let total_cost: f64 = jobs_final.iter().filter_map(|j| j.result.as_ref()).map(|r| r.cost).sum();
        let success = jobs_final
            .iter()
            .filter(|j| j.state != JobState::Cancelled)
            .all(|j| j.state == JobState::Done);

        let report = ExecutionReport {
            request_id: plan.request_id,
            success,
            total_cost,
            duration: start.elapsed(),
            jobs: jobs_final,
        };
        self.inner.completed.lock().insert(plan.request_id, report.clone());
        Ok(report)
    }

    async fn run_task(
        &self,
        task: Task,
        jobs: Arc<Mutex<HashMap<Uuid, JobExecution>>>,
        caller: CallerConstraints,
        cancellation: CancellationToken,
        deadline: Duration,
    ) {
        {
            let mut guard = jobs.lock();
            if let Some(job) = guard.get_mut(&task.id) {
                job.state = JobState::Running;
                job.start = Some(Utc::now());
            }
        }

        let mut provider_name = task.chosen_provider.clone().unwrap_or_default();
        let mut excluded = Vec::new();
        let mut fallback_count: u8 = 0;

        loop {
            let adapter = self.inner.adapters.adapter_for(&provider_name);
            let attempt_start = Instant::now();
            let outcome = tokio::time::timeout(deadline, adapter.dispatch(&task.upstream_payload, deadline)).await;

            let was_cancelled = cancellation.is_cancelled();

            let dispatch_result: Result<DispatchOutcome, AppError> = match outcome {
                Ok(result) => result,
                Err(_) => Err(AppError::Timeout),
            };

            match dispatch_result {
                Ok(result) => {
                    self.inner
                        .metrics
                        .record(&provider_name, result.latency, result.success, result.quality_estimate);

                    let mut guard = jobs.lock();
                    if let Some(job) = guard.get_mut(&task.id) {
                        job.end = Some(Utc::now());
                        job.progress = 1.0;
                        job.fallback_count = fallback_count;
                        if was_cancelled {
                            job.state = JobState::Cancelled;
                        } else if result.success {
                            job.state = JobState::Done;
                            job.result = Some(result);
                        } else {
                            job.state = JobState::Failed;
                            job.error = Some("provider reported an unsuccessful dispatch".into());
                        }
                    }
                    return;
                }
                Err(err) => {
                    self.inner
                        .metrics
                        .record(&provider_name, attempt_start.elapsed(), false, 0.0);

                    if was_cancelled {
                        let mut guard = jobs.lock();
                        if let Some(job) = guard.get_mut(&task.id) {
                            job.state = JobState::Cancelled;
                            job.end = Some(Utc::now());
                            job.fallback_count = fallback_count;
                        }
                        return;
                    }

                    excluded.push(provider_name.clone());
                    if fallback_count >= MAX_FALLBACKS {
                        let mut guard = jobs.lock();
                        if let Some(job) = guard.get_mut(&task.id) {
                            job.state = JobState::Failed;
                            job.error = Some(err.to_string());
                            job.end = Some(Utc::now());
                            job.fallback_count = fallback_count;
                        }
                        return;
                    }

                    let reselected = selector::select(
                        task.task_type,
                        &crate::models::TaskComplexity::default(),
                        &self.inner.registry,
                        &self.inner.capability_engine,
                        &self.inner.metrics,
                        &caller,
                        None,
                        None,
                        self.inner.default_weights,
                        &excluded,
                    )
                    .await;

                    match reselected {
                        Ok(selection) => {
                            provider_name = selection.provider_name;
                            fallback_count += 1;
                        }
                        Err(_) => {
                            let mut guard = jobs.lock();
                            if let Some(job) = guard.get_mut(&task.id) {
                                job.state = JobState::Failed;
                                job.error = Some(err.to_string());
                                job.end = Some(Utc::now());
                                job.fallback_count = fallback_count;
                            }
                            return;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CapabilityEngine;
    use crate::metrics::MetricsStore;
    use crate::models::Constraints;
    use crate::providers::FailingAdapter;
    use crate::registry::{AuthRef, ModelSource, ProviderRecord, StaticSource, Tier};

    fn provider(name: &str) -> ProviderRecord {
        ProviderRecord {
            name: name.to_string(),
            tier: Tier::Official,
            endpoint: format!("https://{name}.example.com"),
            models: ModelSource::Inline(vec!["gpt-4".to_string()]),
            auth: AuthRef(None),
        }
    }

    fn sample_request(prompt: &str) -> Request {
        Request {
            id: Uuid::new_v4(),
            caller_key: "test-key".to_string(),
            prompt: prompt.to_string(),
            context: HashMap::new(),
            constraints: Constraints::default(),
        }
    }

    async fn build_executor(adapters: Arc<dyn AdapterFactory>) -> Executor {
        let registry = Arc::new(ProviderRegistry::new());
        registry.reload(&StaticSource(vec![provider("OpenAI")])).await.unwrap();
        Executor::new(
            registry,
            Arc::new(CapabilityEngine::new()),
            Arc::new(MetricsStore::new()),
            adapters,
            5,
        )
    }

    #[tokio::test]
    async fn single_task_plan_runs_to_done() {
        let executor = build_executor(Arc::new(EchoAdapterFactory)).await;
        let request = sample_request("Summarize this document");
        let caller = CallerConstraints::default();
        let plan = executor.build_plan(&request, &caller).await.unwrap();

        let report = executor
            .execute(plan, &request, caller, CancellationToken::new())
            .await
            .unwrap();

        assert!(report.success);
        assert_eq!(report.jobs.len(), 1);
        assert_eq!(report.jobs[0].state, JobState::Done);
    }

    struct AlwaysFailingFactory;
    impl AdapterFactory for AlwaysFailingFactory {
        fn adapter_for(&self, _provider_name: &str) -> Arc<dyn ProviderAdapter> {
            Arc::new(FailingAdapter {
                message: "synthetic failure".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn exhausted_fallbacks_mark_task_failed() {
        let executor = build_executor(Arc::new(AlwaysFailingFactory)).await;
        let request = sample_request("Summarize this document");
        let caller = CallerConstraints::default();
        let plan = executor.build_plan(&request, &caller).await.unwrap();

        let report = executor
            .execute(plan, &request, caller, CancellationToken::new())
            .await
            .unwrap();

        assert!(!report.success);
        assert_eq!(report.jobs[0].state, JobState::Failed);
    }

    #[tokio::test]
    async fn dependent_task_waits_for_its_dependency() {
        let executor = build_executor(Arc::new(EchoAdapterFactory)).await;
        let request = sample_request("irrelevant");

        let t1 = Task {
            id: Uuid::new_v4(),
            task_type: crate::models::TaskType::Text,
            chosen_provider: Some("OpenAI".to_string()),
            upstream_payload: "first".to_string(),
            priority: 1,
            dependencies: Vec::new(),
        };
        let t2 = Task {
            id: Uuid::new_v4(),
            task_type: crate::models::TaskType::Text,
            chosen_provider: Some("OpenAI".to_string()),
            upstream_payload: "second".to_string(),
            priority: 1,
            dependencies: vec![t1.id],
        };
        let plan = Plan {
            request_id: request.id,
            parallel: true,
            tasks: vec![t1.clone(), t2.clone()],
        };

        let report = executor
            .execute(plan, &request, CallerConstraints::default(), CancellationToken::new())
            .await
            .unwrap();

        assert!(report.success);
        let t2_job = report.jobs.iter().find(|j| j.task_id == t2.id).unwrap();
        assert_eq!(t2_job.state, JobState::Done);
        assert!(t2_job.start >= report.jobs.iter().find(|j| j.task_id == t1.id).unwrap().end);
    }

    #[tokio::test]
    async fn cancellation_marks_pending_tasks_cancelled_immediately() {
        let executor = build_executor(Arc::new(EchoAdapterFactory)).await;
        let request = sample_request("irrelevant");
        let token = CancellationToken::new();
        token.cancel();

        let t1 = Task {
            id: Uuid::new_v4(),
            task_type: crate::models::TaskType::Text,
            chosen_provider: Some("OpenAI".to_string()),
            upstream_payload: "first".to_string(),
            priority: 1,
            dependencies: Vec::new(),
        };
        let plan = Plan {
            request_id: request.id,
            parallel: true,
            tasks: vec![t1],
        };

        let report = executor
            .execute(plan, &request, CallerConstraints::default(), token)
            .await
            .unwrap();

        assert_eq!(report.jobs[0].state, JobState::Cancelled);
    }
}
