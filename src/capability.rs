//! Capability Engine (C2): per-model capability resolution.
//!
//! Resolving what a model can do is a layered fallback chain: a short-lived
//! cache, a manually curated table of well-known models, an optional remote
//! lookup service, a substring pattern matcher over the model name, a
//! provider-name hint, and finally a conservative fallback. Each layer is
//! cheaper and less confident than the one before it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::{error::AppError, models::TaskType};

const CACHE_TTL_HOURS: i64 = 24;

/// Which resolver layer produced a [`ModelCapability`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CapabilitySource {
    /// The manually curated known-model table.
    Manual,
    /// A remote model-metadata lookup.
    RemoteLookup,
    /// The model-name substring pattern matcher.
    Pattern,
    /// A hint derived from the provider's own name.
    ProviderHint,
    /// The conservative text-only fallback.
    Fallback,
}

/// What a single model can do, and how confidently we know it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCapability {
    /// Can serve plain text tasks.
    pub text: bool,
    /// Can serve image-generation tasks.
    pub image: bool,
    /// Can serve code tasks.
    pub code: bool,
    /// Can serve audio tasks.
    pub audio: bool,
    /// Can serve video tasks.
    pub video: bool,
    /// Can serve multimodal tasks.
    pub multimodal: bool,
    /// Reasoning quality, 1-10.
    pub reasoning: u8,
    /// Knowledge quality, 1-10.
    pub knowledge: u8,
    /// Computation quality, 1-10.
    pub computation: u8,
    /// Confidence in this resolution, in [0,1].
    pub confidence: f64,
    /// Which resolver layer produced this capability.
    pub source: CapabilitySource,
    /// When this capability was resolved.
    pub last_updated: DateTime<Utc>,
}

impl ModelCapability {
    fn new(
        text: bool,
        image: bool,
        code: bool,
        audio: bool,
        video: bool,
        multimodal: bool,
        reasoning: u8,
        knowledge: u8,
        computation: u8,
        confidence: f64,
        source: CapabilitySource,
    ) -> Self {
        let mut cap = Self {
            text,
            image,
            code,
            audio,
            video,
            multimodal,
            reasoning: reasoning.clamp(1, 10),
            knowledge: knowledge.clamp(1, 10),
            computation: computation.clamp(1, 10),
            confidence: confidence.clamp(0.0, 1.0),
            source,
            last_updated: Utc::now(),
        };
        cap.enforce_invariants();
        cap
    }

    /// `code ⇒ text`, `multimodal ⇒ text ∨ image`: repair rather than reject,
    /// since every producer of a capability (table, pattern, hint) can in
    /// principle emit a partial description.
    fn enforce_invariants(&mut self) {
        if self.code {
            self.text = true;
        }
        if self.multimodal && !self.text && !self.image {
            self.text = true;
        }
    }

    fn is_stale(&self) -> bool {
        Utc::now() - self.last_updated > ChronoDuration::hours(CACHE_TTL_HOURS)
    }
}

/// A minimal model-metadata record as returned by a remote lookup service.
#[derive(Debug, Clone)]
pub struct RemoteModelInfo {
    /// The model's canonical identifier at the remote service.
    pub id: String,
    /// The remote service's task-pipeline classification, if any.
    pub pipeline_tag: Option<String>,
    /// Free-form tags the remote service attaches to the model.
    pub tags: Vec<String>,
}

/// A remote model-metadata service. The concrete backend is out of scope;
/// this crate ships only [`NoRemoteLookup`], which always misses, so the
/// chain falls through to the pattern matcher.
#[async_trait]
pub trait RemoteCapabilityLookup: Send + Sync {
    /// Looks up metadata for `model_name`, returning `None` on a clean miss.
    async fn lookup(&self, model_name: &str) -> Result<Option<RemoteModelInfo>, AppError>;
}

/// The default remote lookup: always misses.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRemoteLookup;

#[async_trait]
impl RemoteCapabilityLookup for NoRemoteLookup {
    async fn lookup(&self, _model_name: &str) -> Result<Option<RemoteModelInfo>, AppError> {
        Ok(None)
    }
}

struct KnownModelEntry {
    text: bool,
    image: bool,
    code: bool,
    audio: bool,
    video: bool,
    multimodal: bool,
    reasoning: u8,
    knowledge: u8,
    computation: u8,
}

/// The manually curated known-model table (confidence 1.0).
fn known_model_table(normalized_name: &str) -> Option<KnownModelEntry> {
    let entry = match normalized_name {
        "gpt-4" | "gpt-4-turbo" => KnownModelEntry {
            text: true, image: false, code: true, audio: false, video: false, multimodal: false,
            reasoning: 9, knowledge: 9, computation: 8,
        },
        "gpt-4o" => KnownModelEntry {
            text: true, image: true, code: true, audio: false, video: false, multimodal: true,
            reasoning: 9, knowledge: 9, computation: 8,
        },
        "gpt-4o-mini" => KnownModelEntry {
            text: true, image: true, code: true, audio: false, video: false, multimodal: true,
            reasoning: 7, knowledge: 7, computation: 6,
        },
        "gpt-3.5-turbo" => KnownModelEntry {
            text: true, image: false, code: true, audio: false, video: false, multimodal: false,
            reasoning: 6, knowledge: 6, computation: 5,
        },
        "claude-3-opus" => KnownModelEntry {
            text: true, image: true, code: true, audio: false, video: false, multimodal: true,
            reasoning: 10, knowledge: 9, computation: 8,
        },
        "claude-3-sonnet" => KnownModelEntry {
            text: true, image: true, code: true, audio: false, video: false, multimodal: true,
            reasoning: 8, knowledge: 8, computation: 7,
        },
        "claude-3-haiku" => KnownModelEntry {
            text: true, image: false, code: true, audio: false, video: false, multimodal: false,
            reasoning: 6, knowledge: 6, computation: 5,
        },
        "llama-3-70b" => KnownModelEntry {
            text: true, image: false, code: true, audio: false, video: false, multimodal: false,
            reasoning: 7, knowledge: 7, computation: 6,
        },
        "gemini-1.5-pro" => KnownModelEntry {
            text: true, image: true, code: true, audio: false, video: false, multimodal: true,
            reasoning: 8, knowledge: 9, computation: 7,
        },
        "dall-e-3" => KnownModelEntry {
            text: false, image: true, code: false, audio: false, video: false, multimodal: false,
            reasoning: 1, knowledge: 1, computation: 6,
        },
        "whisper-1" => KnownModelEntry {
            text: false, image: false, code: false, audio: true, video: false, multimodal: false,
            reasoning: 1, knowledge: 1, computation: 4,
        },
        "stable-diffusion-xl" => KnownModelEntry {
            text: false, image: true, code: false, audio: false, video: false, multimodal: false,
            reasoning: 1, knowledge: 1, computation: 7,
        },
        _ => return None,
    };
    Some(entry)
}

fn capability_from_pipeline_tag(tag: &str) -> Option<KnownModelEntry> {
    let base = KnownModelEntry {
        text: false, image: false, code: false, audio: false, video: false, multimodal: false,
        reasoning: 5, knowledge: 5, computation: 5,
    };
    let entry = match tag {
        "text-generation" => KnownModelEntry { text: true, ..base },
        "text-to-image" => KnownModelEntry { image: true, ..base },
        "image-to-text" => KnownModelEntry { image: true, multimodal: true, ..base },
        "automatic-speech-recognition" | "text-to-speech" => KnownModelEntry { audio: true, ..base },
        other if other.starts_with("video-") => KnownModelEntry { video: true, ..base },
        _ => return None,
    };
    Some(entry)
}

/// The model-name substring pattern matcher (confidence 0.6-0.7).
fn pattern_match(normalized_name: &str) -> Option<(KnownModelEntry, f64)> {
    let text_code_families = ["gpt", "claude", "llama", "mistral", "gemini", "qwen"];
    let coder_families = ["coder", "starcoder", "copilot"];
    let image_families = [
        "dall-e", "dalle", "stable-diffusion", "midjourney", "cogview", "imagen", "firefly",
    ];
    let audio_families = ["whisper", "speech", "voice"];

    if coder_families.iter().any(|f| normalized_name.contains(f)) {
        return Some((
            KnownModelEntry {
                text: true, image: false, code: true, audio: false, video: false, multimodal: false,
                reasoning: 6, knowledge: 6, computation: 9,
            },
            0.7,
        ));
    }
    if text_code_families.iter().any(|f| normalized_name.contains(f)) {
        return Some((
            KnownModelEntry {
                text: true, image: false, code: true, audio: false, video: false, multimodal: false,
                reasoning: 6, knowledge: 6, computation: 5,
            },
            0.6,
        ));
    }
    if image_families.iter().any(|f| normalized_name.contains(f)) {
        return Some((
            KnownModelEntry {
                text: false, image: true, code: false, audio: false, video: false, multimodal: false,
                reasoning: 1, knowledge: 1, computation: 6,
            },
            0.65,
        ));
    }
    if audio_families.iter().any(|f| normalized_name.contains(f)) {
        return Some((
            KnownModelEntry {
                text: false, image: false, code: false, audio: true, video: false, multimodal: false,
                reasoning: 1, knowledge: 1, computation: 4,
            },
            0.6,
        ));
    }
    if normalized_name.contains("vision") {
        return Some((
            KnownModelEntry {
                text: true, image: true, code: false, audio: false, video: false, multimodal: true,
                reasoning: 5, knowledge: 5, computation: 5,
            },
            0.65,
        ));
    }
    None
}

/// The provider-name hint layer (confidence 0.4).
fn provider_name_hint(provider_name: &str) -> Option<KnownModelEntry> {
    let normalized = provider_name.to_lowercase();
    if normalized.contains("openai") {
        return Some(KnownModelEntry {
            text: true, image: false, code: true, audio: false, video: false, multimodal: false,
            reasoning: 6, knowledge: 6, computation: 5,
        });
    }
    if normalized.contains("stability") {
        return Some(KnownModelEntry {
            text: false, image: true, code: false, audio: false, video: false, multimodal: false,
            reasoning: 1, knowledge: 1, computation: 6,
        });
    }
    None
}

fn fallback_entry() -> KnownModelEntry {
    KnownModelEntry {
        text: true, image: false, code: false, audio: false, video: false, multimodal: false,
        reasoning: 5, knowledge: 5, computation: 5,
    }
}

fn entry_to_capability(entry: KnownModelEntry, confidence: f64, source: CapabilitySource) -> ModelCapability {
    ModelCapability::new(
        entry.text, entry.image, entry.code, entry.audio, entry.video, entry.multimodal,
        entry.reasoning, entry.knowledge, entry.computation, confidence, source,
    )
}

/// Resolves [`ModelCapability`]s through the full layered chain, caching
/// results for 24 hours.
pub struct CapabilityEngine {
    cache: RwLock<HashMap<(String, String), ModelCapability>>,
    remote: Arc<dyn RemoteCapabilityLookup>,
}

impl std::fmt::Debug for CapabilityEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityEngine")
            .field("cached_entries", &self.cache.read().len())
            .finish()
    }
}

impl CapabilityEngine {
    /// Builds an engine with the default (always-miss) remote lookup.
    pub fn new() -> Self {
        Self::with_remote_lookup(Arc::new(NoRemoteLookup))
    }

    /// Builds an engine backed by a custom remote lookup service.
    pub fn with_remote_lookup(remote: Arc<dyn RemoteCapabilityLookup>) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            remote,
        }
    }

    /// Resolves the capability of `model_name` served by `provider_name`,
    /// walking the chain: cache → known table → remote lookup → pattern →
    /// provider hint → fallback. Every resolution is written back to the
    /// cache with a fresh timestamp.
    pub async fn resolve(&self, model_name: &str, provider_name: &str) -> ModelCapability {
        let key = (model_name.to_string(), provider_name.to_string());

        if let Some(cached) = self.cache.read().get(&key) {
            if !cached.is_stale() {
                return cached.clone();
            }
        }

        let normalized = model_name.trim().to_lowercase();

        let resolved = if let Some(entry) = known_model_table(&normalized) {
            entry_to_capability(entry, 1.0, CapabilitySource::Manual)
        } else if let Some(info) = self.remote.lookup(&normalized).await.ok().flatten() {
            match info.pipeline_tag.as_deref().and_then(capability_from_pipeline_tag) {
                Some(entry) => entry_to_capability(entry, 0.8, CapabilitySource::RemoteLookup),
                None => self.resolve_without_remote(&normalized, provider_name),
            }
        } else {
            self.resolve_without_remote(&normalized, provider_name)
        };

        self.cache.write().insert(key, resolved.clone());
        resolved
    }

    fn resolve_without_remote(&self, normalized_name: &str, provider_name: &str) -> ModelCapability {
        if let Some((entry, confidence)) = pattern_match(normalized_name) {
            return entry_to_capability(entry, confidence, CapabilitySource::Pattern);
        }
        if let Some(entry) = provider_name_hint(provider_name) {
            return entry_to_capability(entry, 0.4, CapabilitySource::ProviderHint);
        }
        entry_to_capability(fallback_entry(), 0.3, CapabilitySource::Fallback)
    }
}

impl Default for CapabilityEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// A provider's aggregated capability, derived from its model list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderCapability {
    /// Can serve plain text tasks.
    pub text: bool,
    /// Can serve image-generation tasks.
    pub image: bool,
    /// Can serve code tasks.
    pub code: bool,
    /// Can serve audio tasks.
    pub audio: bool,
    /// Can serve video tasks.
    pub video: bool,
    /// Can serve multimodal tasks.
    pub multimodal: bool,
    /// Reasoning quality, 1-10 (integer mean across models).
    pub reasoning: u8,
    /// Knowledge quality, 1-10 (integer mean across models).
    pub knowledge: u8,
    /// Computation quality, 1-10 (integer mean across models).
    pub computation: u8,
}

/// Aggregates a provider's per-model capabilities: booleans are OR'd,
/// quality scores are the integer mean. If `models` is empty, derives a
/// single capability from the provider-name hint alone.
pub fn aggregate_provider_capability(models: &[ModelCapability], provider_name: &str) -> ProviderCapability {
    if models.is_empty() {
        let hinted = provider_name_hint(provider_name).unwrap_or_else(fallback_entry);
        return ProviderCapability {
            text: hinted.text,
            image: hinted.image,
            code: hinted.code,
            audio: hinted.audio,
            video: hinted.video,
            multimodal: hinted.multimodal,
            reasoning: hinted.reasoning,
            knowledge: hinted.knowledge,
            computation: hinted.computation,
        };
    }

    let count = models.len() as u32;
    let sum_reasoning: u32 = models.iter().map(|m| u32::from(m.reasoning)).sum();
    let sum_knowledge: u32 = models.iter().map(|m| u32::from(m.knowledge)).sum();
    let sum_computation: u32 = models.iter().map(|m| u32::from(m.computation)).sum();

    ProviderCapability {
        text: models.iter().any(|m| m.text),
        image: models.iter().any(|m| m.image),
        code: models.iter().any(|m| m.code),
        audio: models.iter().any(|m| m.audio),
        video: models.iter().any(|m| m.video),
        multimodal: models.iter().any(|m| m.multimodal),
        reasoning: (sum_reasoning / count).clamp(1, 10) as u8,
        knowledge: (sum_knowledge / count).clamp(1, 10) as u8,
        computation: (sum_computation / count).clamp(1, 10) as u8,
    }
}

/// Whether a provider's aggregated capability suffices for `task_type`.
pub fn compatible(capabilities: &ProviderCapability, task_type: TaskType) -> bool {
    match task_type {
        TaskType::Text => capabilities.text,
        TaskType::Image => capabilities.image,
        TaskType::Code => capabilities.code || (capabilities.text && capabilities.reasoning >= 7),
        TaskType::Audio => capabilities.audio,
        TaskType::Video => capabilities.video,
        TaskType::Multimodal => {
            capabilities.multimodal || (capabilities.text && capabilities.image)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn known_table_hit_has_full_confidence() {
        let engine = CapabilityEngine::new();
        let cap = engine.resolve("gpt-4o", "openai").await;
        assert_eq!(cap.source, CapabilitySource::Manual);
        assert!((cap.confidence - 1.0).abs() < f64::EPSILON);
        assert!(cap.text && cap.code && cap.image && cap.multimodal);
    }

    #[tokio::test]
    async fn pattern_matcher_recognizes_coder_family() {
        let engine = CapabilityEngine::new();
        let cap = engine.resolve("deepseek-coder-33b", "some-provider").await;
        assert_eq!(cap.source, CapabilitySource::Pattern);
        assert!(cap.code);
        assert!((cap.confidence - 0.7).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn provider_hint_used_when_name_unrecognized() {
        let engine = CapabilityEngine::new();
        let cap = engine.resolve("mystery-model-9000", "OpenAI-Compatible-Gateway").await;
        assert_eq!(cap.source, CapabilitySource::ProviderHint);
        assert!(cap.code);
    }

    #[tokio::test]
    async fn unknown_model_and_provider_fall_back_to_text_only() {
        let engine = CapabilityEngine::new();
        let cap = engine.resolve("totally-unknown", "totally-unknown-provider").await;
        assert_eq!(cap.source, CapabilitySource::Fallback);
        assert!(cap.text);
        assert!(!cap.image && !cap.code);
        assert!((cap.confidence - 0.3).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn resolutions_are_cached() {
        let engine = CapabilityEngine::new();
        let first = engine.resolve("gpt-4o", "openai").await;
        let second = engine.resolve("gpt-4o", "openai").await;
        assert_eq!(first.last_updated, second.last_updated);
    }

    #[test]
    fn invariant_code_implies_text() {
        let cap = ModelCapability::new(
            false, false, true, false, false, false, 5, 5, 5, 1.0, CapabilitySource::Manual,
        );
        assert!(cap.text);
    }

    #[test]
    fn invariant_multimodal_implies_text_or_image() {
        let cap = ModelCapability::new(
            false, false, false, false, false, true, 5, 5, 5, 1.0, CapabilitySource::Manual,
        );
        assert!(cap.text || cap.image);
    }

    #[test]
    fn aggregate_ors_booleans_and_means_quality() {
        let models = vec![
            ModelCapability::new(true, false, true, false, false, false, 8, 6, 4, 1.0, CapabilitySource::Manual),
            ModelCapability::new(false, true, false, false, false, false, 2, 4, 6, 1.0, CapabilitySource::Manual),
        ];
        let agg = aggregate_provider_capability(&models, "anything");
        assert!(agg.text && agg.image && agg.code);
        assert_eq!(agg.reasoning, 5);
        assert_eq!(agg.knowledge, 5);
        assert_eq!(agg.computation, 5);
    }

    #[test]
    fn compatible_code_accepts_high_reasoning_text_model() {
        let caps = ProviderCapability {
            text: true,
            reasoning: 8,
            ..ProviderCapability::default()
        };
        assert!(compatible(&caps, TaskType::Code));
    }

    #[test]
    fn compatible_rejects_low_reasoning_text_only_for_code() {
        let caps = ProviderCapability {
            text: true,
            reasoning: 5,
            ..ProviderCapability::default()
        };
        assert!(!compatible(&caps, TaskType::Code));
    }

    #[test]
    fn compatible_multimodal_from_text_and_image() {
        let caps = ProviderCapability {
            text: true,
            image: true,
            ..ProviderCapability::default()
        };
        assert!(compatible(&caps, TaskType::Multimodal));
    }
}
