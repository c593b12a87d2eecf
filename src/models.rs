//! Core data structures shared across the routing pipeline: task typing,
//! complexity vectors, requests, plans, and job executions.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One of the six task categories the classifier can infer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Plain natural-language generation.
    Text,
    /// Image generation or analysis.
    Image,
    /// Source code generation, explanation, or debugging.
    Code,
    /// Speech-to-text or text-to-speech.
    Audio,
    /// Video generation or analysis.
    Video,
    /// Requests spanning more than one modality.
    Multimodal,
}

impl TaskType {
    /// Canonical lowercase identifier, used in logs and rationale text.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::Text => "text",
            TaskType::Image => "image",
            TaskType::Code => "code",
            TaskType::Audio => "audio",
            TaskType::Video => "video",
            TaskType::Multimodal => "multimodal",
        }
    }
}

/// A four-axis complexity vector characterising a prompt's demands.
///
/// Every axis lies in `[0, 3]`. `overall()` is their arithmetic mean,
/// divided by 3 to land in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TaskComplexity {
    /// Demand on multi-step reasoning.
    pub reasoning: f64,
    /// Demand on factual/domain knowledge.
    pub knowledge: f64,
    /// Demand on computational/algorithmic work.
    pub computation: f64,
    /// Demand on coordinating multiple sub-parts of the answer.
    pub coordination: f64,
}

impl Default for TaskComplexity {
    fn default() -> Self {
        Self {
            reasoning: 0.0,
            knowledge: 0.0,
            computation: 0.0,
            coordination: 0.0,
        }
    }
}

impl TaskComplexity {
    /// Clamps every axis into `[0, 3]`.
    pub fn clamp(&mut self) {
        self.reasoning = self.reasoning.clamp(0.0, 3.0);
        self.knowledge = self.knowledge.clamp(0.0, 3.0);
        self.computation = self.computation.clamp(0.0, 3.0);
        self.coordination = self.coordination.clamp(0.0, 3.0);
    }

    /// Arithmetic mean across the four axes, in `[0, 3]`.
    pub fn mean(&self) -> f64 {
        (self.reasoning + self.knowledge + self.computation + self.coordination) / 4.0
    }

    /// Overall complexity score in `[0, 1]`.
    pub fn overall(&self) -> f64 {
        self.mean() / 3.0
    }
}

/// A caller-supplied preference for, or exclusion of, specific providers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderPreference {
    /// Providers to prefer, in order, if compatible.
    #[serde(default)]
    pub include: Vec<String>,
    /// Providers that must never be selected for this request.
    #[serde(default)]
    pub exclude: Vec<String>,
}

/// Caller-supplied constraints narrowing how a request may be routed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Constraints {
    /// Upper bound on the tier-derived cost score of the chosen provider.
    #[serde(default)]
    pub max_cost: Option<f64>,
    /// Explicit task-type override, bypassing classification.
    #[serde(default)]
    pub task_type_hint: Option<TaskType>,
    /// Provider include/exclude preference.
    #[serde(default)]
    pub provider_preference: Option<ProviderPreference>,
    /// Caller-requested deadline; defaults to 60s if absent.
    #[serde(default, with = "duration_seconds_opt")]
    pub timeout: Option<Duration>,
    /// Whether independent tasks in the plan may run concurrently.
    #[serde(default)]
    pub parallel: bool,
    /// Whether the executor should allow fallback re-selection on failure.
    #[serde(default = "default_true")]
    pub allow_fallback: bool,
    /// Whether a partially-failed parallel plan should still report success
    /// for the tasks that did succeed, instead of failing the whole batch.
    #[serde(default)]
    pub best_effort: bool,
}

fn default_true() -> bool {
    true
}

mod duration_seconds_opt {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let secs: Option<u64> = Option::deserialize(d)?;
        Ok(secs.map(Duration::from_secs))
    }
}

/// Default per-request deadline applied when `constraints.timeout` is absent.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// An incoming request submitted by a caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Unique identifier, assigned on submission.
    pub id: Uuid,
    /// The credential presented by the caller.
    pub caller_key: String,
    /// The raw natural-language prompt.
    pub prompt: String,
    /// Free-form contextual hints (domain, prior turns, etc.).
    #[serde(default)]
    pub context: HashMap<String, String>,
    /// Optional routing constraints.
    #[serde(default)]
    pub constraints: Constraints,
}

impl Request {
    /// Effective deadline for this request.
    pub fn timeout(&self) -> Duration {
        self.constraints.timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT)
    }
}

/// A single unit of dispatch work derived from a `Request`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier within the owning plan.
    pub id: Uuid,
    /// The inferred or hinted task type.
    pub task_type: TaskType,
    /// The provider chosen by the selector for this task, if any.
    pub chosen_provider: Option<String>,
    /// The payload handed to the provider adapter.
    pub upstream_payload: String,
    /// Scheduling priority; lower values run first when the pool is full.
    pub priority: u8,
    /// Ids of tasks that must reach `done` before this one may start.
    pub dependencies: Vec<Uuid>,
}

impl Task {
    /// Default priority bucket for a task of the given type, per §4.5:
    /// `{text:1, analysis:2, image:3, else:5}`.
    pub fn default_priority(task_type: TaskType) -> u8 {
        match task_type {
            TaskType::Text => 1,
            TaskType::Multimodal => 2,
            TaskType::Image => 3,
            TaskType::Code | TaskType::Audio | TaskType::Video => 5,
        }
    }
}

/// An ordered, dependency-annotated sequence of `Task`s derived from one
/// `Request`. The dependency graph must be a DAG whose edges all resolve
/// inside this plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    /// The request this plan was derived from.
    pub request_id: Uuid,
    /// Whether independent tasks may run concurrently.
    pub parallel: bool,
    /// The tasks composing this plan.
    pub tasks: Vec<Task>,
}

impl Plan {
    /// Validates that every dependency id resolves to a task in this plan
    /// and that the dependency graph contains no cycles.
    pub fn validate(&self) -> Result<(), crate::error::AppError> {
        let ids: std::collections::HashSet<Uuid> = self.tasks.iter().map(|t| t.id).collect();
        for task in &self.tasks {
            for dep in &task.dependencies {
                if !ids.contains(dep) {
                    return Err(crate::error::AppError::Internal(format!(
                        "task {} depends on unknown task {}",
                        task.id, dep
                    )));
                }
            }
        }
        if has_cycle(&self.tasks) {
            return Err(crate::error::AppError::Internal(
                "plan dependency graph contains a cycle".into(),
            ));
        }
        Ok(())
    }
}

fn has_cycle(tasks: &[Task]) -> bool {
    use std::collections::HashMap as Map;
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }
    let by_id: Map<Uuid, &Task> = tasks.iter().map(|t| (t.id, t)).collect();
    let mut marks: Map<Uuid, Mark> = tasks.iter().map(|t| (t.id, Mark::Unvisited)).collect();

    fn visit(id: Uuid, by_id: &Map<Uuid, &Task>, marks: &mut Map<Uuid, Mark>) -> bool {
        match marks.get(&id) {
            Some(Mark::Done) => return false,
            Some(Mark::InProgress) => return true,
            _ => {}
        }
        marks.insert(id, Mark::InProgress);
        if let Some(task) = by_id.get(&id) {
            for dep in &task.dependencies {
                if visit(*dep, by_id, marks) {
                    return true;
                }
            }
        }
        marks.insert(id, Mark::Done);
        false
    }

    for id in by_id.keys() {
        if visit(*id, &by_id, &mut marks) {
            return true;
        }
    }
    false
}

/// Lifecycle state of a `JobExecution`. `Done`, `Failed`, and `Cancelled`
/// are terminal; the only allowed non-monotonic transition is
/// `Pending -> Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Queued but not yet dispatched.
    Pending,
    /// Dispatch is in flight.
    Running,
    /// Completed successfully.
    Done,
    /// Completed with a terminal failure.
    Failed,
    /// Cancelled before or during dispatch.
    Cancelled,
}

impl JobState {
    /// Whether this state is terminal (no further transitions are valid).
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Failed | JobState::Cancelled)
    }
}

/// The outcome of one upstream dispatch attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchOutcome {
    /// Whether the provider call succeeded.
    pub success: bool,
    /// The generated content, if successful.
    pub data: Option<String>,
    /// Cost incurred by this dispatch, in the router's cost unit.
    pub cost: f64,
    /// Observed latency.
    #[serde(with = "duration_millis")]
    pub latency: Duration,
    /// The provider's self-reported or estimated output quality, in `[0,1]`.
    pub quality_estimate: f64,
}

mod duration_millis {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u128(value.as_millis())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

/// A live, in-flight or terminal execution record for one `Task`.
///
/// `JobExecution`s are exclusively owned by the executor; the registry and
/// selector never mutate them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecution {
    /// Unique identifier for this execution attempt.
    pub id: Uuid,
    /// The task this execution is attempting.
    pub task_id: Uuid,
    /// Current lifecycle state.
    pub state: JobState,
    /// When this execution started.
    pub start: Option<DateTime<Utc>>,
    /// When this execution reached a terminal state.
    pub end: Option<DateTime<Utc>>,
    /// The outcome, once terminal and non-cancelled.
    pub result: Option<DispatchOutcome>,
    /// Error detail, if `state == Failed`.
    pub error: Option<String>,
    /// Fraction complete, in `[0, 1]`.
    pub progress: f64,
    /// How many fallback re-selections have been attempted for this task.
    pub fallback_count: u8,
}

impl JobExecution {
    /// Creates a fresh, pending execution record for a task.
    pub fn pending(task_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            state: JobState::Pending,
            start: None,
            end: None,
            result: None,
            error: None,
            progress: 0.0,
            fallback_count: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complexity_overall_is_mean_over_three() {
        let c = TaskComplexity {
            reasoning: 3.0,
            knowledge: 3.0,
            computation: 3.0,
            coordination: 3.0,
        };
        assert!((c.overall() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn complexity_clamps_axes() {
        let mut c = TaskComplexity {
            reasoning: 10.0,
            knowledge: -2.0,
            computation: 1.5,
            coordination: 3.0,
        };
        c.clamp();
        assert_eq!(c.reasoning, 3.0);
        assert_eq!(c.knowledge, 0.0);
        assert_eq!(c.computation, 1.5);
    }

    #[test]
    fn plan_validate_rejects_unknown_dependency() {
        let t1 = Uuid::new_v4();
        let plan = Plan {
            request_id: Uuid::new_v4(),
            parallel: true,
            tasks: vec![Task {
                id: t1,
                task_type: TaskType::Text,
                chosen_provider: None,
                upstream_payload: String::new(),
                priority: 1,
                dependencies: vec![Uuid::new_v4()],
            }],
        };
        assert!(plan.validate().is_err());
    }

    #[test]
    fn plan_validate_rejects_cycle() {
        let t1 = Uuid::new_v4();
        let t2 = Uuid::new_v4();
        let plan = Plan {
            request_id: Uuid::new_v4(),
            parallel: true,
            tasks: vec![
                Task {
                    id: t1,
                    task_type: TaskType::Text,
                    chosen_provider: None,
                    upstream_payload: String::new(),
                    priority: 1,
                    dependencies: vec![t2],
                },
                Task {
                    id: t2,
                    task_type: TaskType::Text,
                    chosen_provider: None,
                    upstream_payload: String::new(),
                    priority: 1,
                    dependencies: vec![t1],
                },
            ],
        };
        assert!(plan.validate().is_err());
    }

    #[test]
    fn job_state_terminal_classification() {
        assert!(JobState::Done.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
        assert!(!JobState::Pending.is_terminal());
        assert!(!JobState::Running.is_terminal());
    }
}
