//! Adaptive Selector (C4): compatible-provider filter, weighted scoring,
//! and tie-breaking.
//!
//! The selector never talks to the executor directly — it is handed a
//! registry snapshot, a capability engine, and a metrics store, and hands
//! back a single chosen provider plus a human-readable rationale. Keeping
//! executor and selector decoupled this way avoids turning the
//! executor-metrics-selector feedback loop into a cyclic ownership.

use std::collections::HashSet;

use crate::capability::{aggregate_provider_capability, compatible, CapabilityEngine, ProviderCapability};
use crate::error::AppError;
use crate::metrics::MetricsStore;
use crate::models::{ProviderPreference, TaskComplexity, TaskType};
use crate::registry::{ProviderRecord, ProviderRegistry, Tier};

/// The sub-score weights used in Step 3 of selection, renormalised to sum
/// to 1 before use.
#[derive(Debug, Clone, Copy)]
pub struct SelectorWeights {
    /// Weight on the capability-match sub-score.
    pub capability: f64,
    /// Weight on the quality sub-score.
    pub quality: f64,
    /// Weight on the live availability sub-score.
    pub availability: f64,
    /// Weight on the cost sub-score.
    pub cost: f64,
    /// Weight on the speed sub-score.
    pub speed: f64,
}

impl Default for SelectorWeights {
    fn default() -> Self {
        Self {
            capability: 0.4,
            quality: 0.3,
            availability: 0.2,
            cost: 0.05,
            speed: 0.05,
        }
    }
}

impl SelectorWeights {
    fn renormalized(self) -> Self {
        let sum = self.capability + self.quality + self.availability + self.cost + self.speed;
        if sum <= 0.0 {
            return Self::default();
        }
        Self {
            capability: self.capability / sum,
            quality: self.quality / sum,
            availability: self.availability / sum,
            cost: self.cost / sum,
            speed: self.speed / sum,
        }
    }
}

/// The subset of an `APIKey`'s access-control fields the selector needs to
/// enforce Step 2's hard constraints, decoupled from the key-gate's own
/// storage representation.
#[derive(Debug, Clone, Default)]
pub struct CallerConstraints {
    /// If non-empty, only these models may be selected.
    pub allowed_models: Vec<String>,
    /// These models may never be selected.
    pub blocked_models: Vec<String>,
    /// If non-empty, only these provider endpoints may be used.
    pub allowed_endpoints: Vec<String>,
}

impl CallerConstraints {
    fn allows(&self, provider: &ProviderRecord) -> bool {
        if !self.allowed_models.is_empty() && !self.allowed_models.iter().any(|m| m == &provider.name) {
            return false;
        }
        if self.blocked_models.iter().any(|m| m == &provider.name) {
            return false;
        }
        if !self.allowed_endpoints.is_empty()
            && !self.allowed_endpoints.iter().any(|e| e == &provider.endpoint)
        {
            return false;
        }
        true
    }
}

fn preference_allows(preference: Option<&ProviderPreference>, provider_name: &str) -> bool {
    match preference {
        Some(pref) => !pref.exclude.iter().any(|p| p == provider_name),
        None => true,
    }
}

fn cost_score(tier: Tier, provider_name: &str) -> f64 {
    let normalized = provider_name.to_lowercase();
    if normalized.contains("local") || normalized.contains("ollama") {
        return 1.0;
    }
    tier.base_cost_score()
}

fn capability_match_score(cap: &ProviderCapability, task_type: TaskType) -> f64 {
    match task_type {
        TaskType::Text => {
            if cap.text {
                1.0
            } else {
                0.0
            }
        }
        TaskType::Image => {
            if cap.image {
                1.0
            } else {
                0.0
            }
        }
        TaskType::Audio => {
            if cap.audio {
                1.0
            } else {
                0.0
            }
        }
        TaskType::Video => {
            if cap.video {
                1.0
            } else {
                0.0
            }
        }
        TaskType::Code => {
            if cap.code {
                1.0
            } else if cap.text && cap.reasoning >= 8 {
                0.8
            } else if cap.text && cap.reasoning >= 7 {
                0.6
            } else {
                0.0
            }
        }
        TaskType::Multimodal => {
            if cap.multimodal {
                1.0
            } else if cap.text && cap.image {
                0.9
            } else {
                0.0
            }
        }
    }
}

fn quality_score(cap: &ProviderCapability, task_type: TaskType) -> f64 {
    let reasoning = f64::from(cap.reasoning) / 10.0;
    let knowledge = f64::from(cap.knowledge) / 10.0;
    let computation = f64::from(cap.computation) / 10.0;
    match task_type {
        TaskType::Code => 0.5 * reasoning + 0.5 * computation,
        TaskType::Image | TaskType::Audio | TaskType::Video => computation,
        TaskType::Multimodal => (reasoning + knowledge + computation) / 3.0,
        TaskType::Text => 0.5 * reasoning + 0.5 * knowledge,
    }
}

fn natively_supports(cap: &ProviderCapability, task_type: TaskType) -> bool {
    match task_type {
        TaskType::Text => cap.text,
        TaskType::Image => cap.image,
        TaskType::Code => cap.code,
        TaskType::Audio => cap.audio,
        TaskType::Video => cap.video,
        TaskType::Multimodal => cap.multimodal,
    }
}

fn capability_boost(task_type: TaskType, native: bool) -> f64 {
    if !native {
        return 1.0;
    }
    match task_type {
        TaskType::Text | TaskType::Code => 1.1,
        TaskType::Audio | TaskType::Video => 1.2,
        TaskType::Image => 1.25,
        TaskType::Multimodal => 1.3,
    }
}

struct Candidate {
    provider: ProviderRecord,
    capability: ProviderCapability,
    total_score: f64,
    availability: f64,
    cost: f64,
    rationale: String,
}

/// The outcome of a successful selection.
#[derive(Debug, Clone)]
pub struct SelectionResult {
    /// The chosen provider's name.
    pub provider_name: String,
    /// The winning total score.
    pub score: f64,
    /// A human-readable explanation of the dominant sub-scores.
    pub rationale: String,
}

/// Runs the full four-step selection pipeline and returns the winning
/// provider, or an error if no candidate survives.
#[allow(clippy::too_many_arguments)]
pub async fn select(
    task_type: TaskType,
    _complexity: &TaskComplexity,
    registry: &ProviderRegistry,
    capability_engine: &CapabilityEngine,
    metrics: &MetricsStore,
    caller: &CallerConstraints,
    preference: Option<&ProviderPreference>,
    max_cost: Option<f64>,
    weights: SelectorWeights,
    excluded_providers: &[String],
) -> Result<SelectionResult, AppError> {
    let excluded: HashSet<&str> = excluded_providers.iter().map(String::as_str).collect();
    let providers = registry.list();

    // Step 1: candidate filter via `compatible`.
    let mut compatible_candidates = Vec::new();
    for provider in &providers {
        let model_names = registry.discover_models(&provider.name).await.unwrap_or_default();
        let mut model_caps = Vec::with_capacity(model_names.len());
        for model_name in &model_names {
            model_caps.push(capability_engine.resolve(model_name, &provider.name).await);
        }
        let capability = aggregate_provider_capability(&model_caps, &provider.name);
        if compatible(&capability, task_type) {
            compatible_candidates.push((provider.clone(), capability));
        }
    }
    if compatible_candidates.is_empty() {
        return Err(AppError::NoCompatibleProvider(task_type));
    }

    // Step 2: hard constraints.
    let weights = weights.renormalized();
    let mut scored = Vec::new();
    for (provider, capability) in compatible_candidates {
        if excluded.contains(provider.name.as_str()) {
            continue;
        }
        if !caller.allows(&provider) {
            continue;
        }
        if !preference_allows(preference, &provider.name) {
            continue;
        }
        let cost = cost_score(provider.tier, &provider.name);
        if let Some(max) = max_cost {
            if cost > max {
                continue;
            }
        }

        // Step 3: weighted score.
        let capability_match = capability_match_score(&capability, task_type);
        let quality = quality_score(&capability, task_type);
        let availability = metrics.availability(&provider.name);
        let speed = metrics.speed_score(&provider.name);

        let base_total = weights.capability * capability_match
            + weights.quality * quality
            + weights.availability * availability
            + weights.cost * (1.0 - cost)
            + weights.speed * speed;
        let boost = capability_boost(task_type, natively_supports(&capability, task_type));
        let total_score = base_total * boost;

        let rationale = format!(
            "capability={capability_match:.2} quality={quality:.2} availability={availability:.2} \
             cost={cost:.2} speed={speed:.2} boost={boost:.2}"
        );

        scored.push(Candidate {
            provider,
            capability,
            total_score,
            availability,
            cost,
            rationale,
        });
    }

    if scored.is_empty() {
        return Err(AppError::SelectionFailed);
    }

    // Step 4: tie-break.
    scored.sort_by(|a, b| {
        b.total_score
            .partial_cmp(&a.total_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.availability.partial_cmp(&a.availability).unwrap_or(std::cmp::Ordering::Equal))
            .then_with(|| b.cost.partial_cmp(&a.cost).unwrap_or(std::cmp::Ordering::Equal))
            .then_with(|| a.provider.name.cmp(&b.provider.name))
    });

    let winner = scored.into_iter().next().expect("checked non-empty above");
    let _ = winner.capability;
    Ok(SelectionResult {
        provider_name: winner.provider.name,
        score: winner.total_score,
        rationale: winner.rationale,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{AuthRef, ModelSource, StaticSource};

    fn provider(name: &str, tier: Tier, models: Vec<&str>) -> ProviderRecord {
        ProviderRecord {
            name: name.to_string(),
            tier,
            endpoint: format!("https://{name}.example.com"),
            models: ModelSource::Inline(models.into_iter().map(str::to_string).collect()),
            auth: AuthRef(None),
        }
    }

    async fn build_registry(providers: Vec<ProviderRecord>) -> ProviderRegistry {
        let registry = ProviderRegistry::new();
        registry.reload(&StaticSource(providers)).unwrap();
        registry
    }

    #[tokio::test]
    async fn scenario_image_request_picks_only_image_capable_provider() {
        let registry = build_registry(vec![
            provider("OpenAI", Tier::Official, vec!["gpt-4"]),
            provider("Pollinations", Tier::Community, vec!["stable-diffusion-xl"]),
            provider("Local", Tier::Unofficial, vec!["llama-3-70b"]),
        ])
        .await;
        let capability_engine = CapabilityEngine::new();
        let metrics = MetricsStore::new();

        let result = select(
            TaskType::Image,
            &TaskComplexity::default(),
            &registry,
            &capability_engine,
            &metrics,
            &CallerConstraints::default(),
            None,
            None,
            SelectorWeights::default(),
            &[],
        )
        .await
        .unwrap();

        assert_eq!(result.provider_name, "Pollinations");
    }

    #[tokio::test]
    async fn scenario_code_request_picks_higher_quality_text_provider() {
        let registry = build_registry(vec![
            provider("OpenAI", Tier::Official, vec!["gpt-4"]),
            provider("Pollinations", Tier::Community, vec!["stable-diffusion-xl"]),
        ])
        .await;
        let capability_engine = CapabilityEngine::new();
        let metrics = MetricsStore::new();

        let result = select(
            TaskType::Code,
            &TaskComplexity::default(),
            &registry,
            &capability_engine,
            &metrics,
            &CallerConstraints::default(),
            None,
            None,
            SelectorWeights::default(),
            &[],
        )
        .await
        .unwrap();

        assert_eq!(result.provider_name, "OpenAI");
    }

    #[tokio::test]
    async fn no_compatible_provider_errors() {
        let registry = build_registry(vec![provider("Pollinations", Tier::Community, vec!["stable-diffusion-xl"])]).await;
        let capability_engine = CapabilityEngine::new();
        let metrics = MetricsStore::new();

        let err = select(
            TaskType::Audio,
            &TaskComplexity::default(),
            &registry,
            &capability_engine,
            &metrics,
            &CallerConstraints::default(),
            None,
            None,
            SelectorWeights::default(),
            &[],
        )
        .await
        .unwrap_err();

        assert!(matches!(err, AppError::NoCompatibleProvider(TaskType::Audio)));
    }

    #[tokio::test]
    async fn max_cost_eliminates_expensive_candidates() {
        let registry = build_registry(vec![
            provider("OpenAI", Tier::Official, vec!["gpt-4"]),
            provider("Local", Tier::Unofficial, vec!["llama-3-70b"]),
        ])
        .await;
        let capability_engine = CapabilityEngine::new();
        let metrics = MetricsStore::new();

        let result = select(
            TaskType::Text,
            &TaskComplexity::default(),
            &registry,
            &capability_engine,
            &metrics,
            &CallerConstraints::default(),
            None,
            Some(0.5),
            SelectorWeights::default(),
            &[],
        )
        .await
        .unwrap();

        assert_eq!(result.provider_name, "OpenAI");
    }

    #[tokio::test]
    async fn excluded_providers_are_skipped_for_fallback() {
        let registry = build_registry(vec![
            provider("OpenAI", Tier::Official, vec!["gpt-4"]),
            provider("Local", Tier::Unofficial, vec!["llama-3-70b"]),
        ])
        .await;
        let capability_engine = CapabilityEngine::new();
        let metrics = MetricsStore::new();

        let result = select(
            TaskType::Text,
            &TaskComplexity::default(),
            &registry,
            &capability_engine,
            &metrics,
            &CallerConstraints::default(),
            None,
            None,
            SelectorWeights::default(),
            &["OpenAI".to_string()],
        )
        .await
        .unwrap();

        assert_eq!(result.provider_name, "Local");
    }
}
