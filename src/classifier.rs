//! Task Classifier (C3): prompt → (task-type, complexity vector).
//!
//! Detection is purely lexical and deterministic: the same `(prompt,
//! context)` pair always yields the same classification, which the executor
//! and selector both rely on for reproducible routing decisions.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

use crate::models::{TaskComplexity, TaskType};

struct TypePattern {
    regex: Regex,
    task_type: TaskType,
}

fn detection_patterns() -> &'static [TypePattern] {
    static PATTERNS: OnceLock<Vec<TypePattern>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        // Order is the priority order: first match wins.
        vec![
            TypePattern {
                regex: Regex::new(r"(?i)generate\s+(an?\s+)?(image|picture|photo)|draw\s|dall-?e|create\s+(an?\s+)?(image|picture)").unwrap(),
                task_type: TaskType::Image,
            },
            TypePattern {
                regex: Regex::new(r"(?i)analyz\w*\s+(this\s+)?image|describe\s+(this\s+)?image|what'?s\s+in\s+this\s+image|\bvision\b").unwrap(),
                task_type: TaskType::Multimodal,
            },
            TypePattern {
                regex: Regex::new(r"(?i)\bcode\b|\bfunction\b|\bdebug\b|\bprogram(ming)?\b|\bpython\b|\bjavascript\b|\btypescript\b|\brust\b|\bjava\b|\bc\+\+\b|\balgorithm\b|\bscript\b").unwrap(),
                task_type: TaskType::Code,
            },
            TypePattern {
                regex: Regex::new(r"(?i)\baudio\b|\bspeech\b|\btranscribe\b|\bvoice\b|\bsound\b|\bpodcast\b").unwrap(),
                task_type: TaskType::Audio,
            },
            TypePattern {
                regex: Regex::new(r"(?i)\bvideo\b|\banimation\b|\bclip\b|\bfootage\b").unwrap(),
                task_type: TaskType::Video,
            },
            TypePattern {
                regex: Regex::new(r"(?i)\bmultimodal\b|\bvqa\b").unwrap(),
                task_type: TaskType::Multimodal,
            },
        ]
    })
}

/// Detects the task-type of `prompt` by lexical priority. An explicit
/// `hint` (from `constraints.task_type_hint`) always wins over detection.
pub fn classify_task_type(prompt: &str, hint: Option<TaskType>) -> TaskType {
    if let Some(hint) = hint {
        return hint;
    }
    for pattern in detection_patterns() {
        if pattern.regex.is_match(prompt) {
            return pattern.task_type;
        }
    }
    TaskType::Text
}

struct FamilyPattern {
    regex: Regex,
}

fn axis_patterns(axis: ComplexityAxis) -> &'static [FamilyPattern] {
    static REASONING: OnceLock<Vec<FamilyPattern>> = OnceLock::new();
    static KNOWLEDGE: OnceLock<Vec<FamilyPattern>> = OnceLock::new();
    static COMPUTATION: OnceLock<Vec<FamilyPattern>> = OnceLock::new();
    static COORDINATION: OnceLock<Vec<FamilyPattern>> = OnceLock::new();

    fn build(patterns: &[&str]) -> Vec<FamilyPattern> {
        patterns
            .iter()
            .map(|p| FamilyPattern {
                regex: Regex::new(p).unwrap(),
            })
            .collect()
    }

    match axis {
        ComplexityAxis::Reasoning => REASONING.get_or_init(|| {
            build(&[
                r"(?i)\bwhy\b",
                r"(?i)\bexplain\b",
                r"(?i)\banalyz\w*\b",
                r"(?i)\bcompare\b",
                r"(?i)\bevaluate\b",
                r"(?i)\bprove\b",
                r"(?i)\breason\w*\b",
                r"(?i)\btrade-?off\b",
                r"(?i)\bstrategy\b",
            ])
        }),
        ComplexityAxis::Knowledge => KNOWLEDGE.get_or_init(|| {
            build(&[
                r"(?i)\bhistory\b",
                r"(?i)\bscience\b",
                r"(?i)\bresearch\b",
                r"(?i)\bdefine\b",
                r"(?i)\bfact\w*\b",
                r"(?i)\btheory\b",
                r"(?i)\bconcept\b",
            ])
        }),
        ComplexityAxis::Computation => COMPUTATION.get_or_init(|| {
            build(&[
                r"(?i)\bcalculate\b",
                r"(?i)\bcompute\b",
                r"(?i)\balgorithm\b",
                r"(?i)\boptimi[sz]e\b",
                r"(?i)\bperformance\b",
                r"(?i)\bcomplexity\b",
                r"(?i)\bbig[\s-]?o\b",
            ])
        }),
        ComplexityAxis::Coordination => COORDINATION.get_or_init(|| {
            build(&[
                r"(?i)\bsteps?\b",
                r"(?i)\bplan\b",
                r"(?i)\bschedul\w*\b",
                r"(?i)\bcoordinat\w*\b",
                r"(?i)\bsequence\b",
                r"(?i)\bthen\b",
                r"(?i)\bmultiple\b",
            ])
        }),
    }
}

#[derive(Debug, Clone, Copy)]
enum ComplexityAxis {
    Reasoning,
    Knowledge,
    Computation,
    Coordination,
}

/// Contribution of `count` regex-family matches on one axis, at 0.1 per
/// match with diminishing returns once the raw contribution passes 0.5.
fn match_contribution(count: usize) -> f64 {
    let raw = count as f64 * 0.1;
    if raw > 0.5 {
        0.5 + (raw - 0.5) * 0.5
    } else {
        raw
    }
}

fn count_matches(axis: ComplexityAxis, lowered_prompt: &str) -> usize {
    axis_patterns(axis)
        .iter()
        .filter(|p| p.regex.is_match(lowered_prompt))
        .count()
}

const DOMAIN_HINT_KEYWORDS: [&str; 3] = ["ai", "technical", "engineering"];

/// Scores the four-axis complexity vector for `prompt` given its
/// `context-map`. Deterministic for identical inputs.
pub fn score_complexity(prompt: &str, context: &HashMap<String, String>) -> TaskComplexity {
    let lowered = prompt.to_lowercase();

    let mut complexity = TaskComplexity::default();
    complexity.reasoning += match_contribution(count_matches(ComplexityAxis::Reasoning, &lowered));
    complexity.knowledge += match_contribution(count_matches(ComplexityAxis::Knowledge, &lowered));
    complexity.computation += match_contribution(count_matches(ComplexityAxis::Computation, &lowered));
    complexity.coordination += match_contribution(count_matches(ComplexityAxis::Coordination, &lowered));

    let has_domain_hint = context
        .values()
        .any(|v| DOMAIN_HINT_KEYWORDS.contains(&v.to_lowercase().as_str()));
    if has_domain_hint {
        complexity.knowledge += 0.3;
        complexity.reasoning += 0.2;
    }

    let length_modifier = (prompt.chars().count() as f64 / 500.0).min(1.0) * 0.2;
    complexity.reasoning += length_modifier;
    complexity.knowledge += length_modifier;

    let question_count = prompt.matches('?').count();
    if question_count > 1 {
        complexity.coordination += question_count as f64 * 0.1;
    }

    complexity.clamp();
    complexity
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_image_generation_before_anything_else() {
        let task_type = classify_task_type("Generate an image of a sunset", None);
        assert_eq!(task_type, TaskType::Image);
    }

    #[test]
    fn detects_image_analysis_as_multimodal() {
        let task_type = classify_task_type("Please analyze this image and describe it", None);
        assert_eq!(task_type, TaskType::Multimodal);
    }

    #[test]
    fn detects_code_tasks() {
        let task_type = classify_task_type("Write a Python function to parse CSV", None);
        assert_eq!(task_type, TaskType::Code);
    }

    #[test]
    fn detects_audio_and_video() {
        assert_eq!(classify_task_type("Transcribe this audio clip", None), TaskType::Audio);
        assert_eq!(classify_task_type("Summarize this video footage", None), TaskType::Video);
    }

    #[test]
    fn falls_back_to_text() {
        assert_eq!(classify_task_type("What is the capital of France?", None), TaskType::Text);
    }

    #[test]
    fn explicit_hint_overrides_detection() {
        let task_type = classify_task_type("draw a cat", Some(TaskType::Text));
        assert_eq!(task_type, TaskType::Text);
    }

    #[test]
    fn classification_is_deterministic() {
        let prompt = "Explain why this algorithm is optimal, then compute its complexity.";
        let context = HashMap::new();
        let first = score_complexity(prompt, &context);
        let second = score_complexity(prompt, &context);
        assert_eq!(first.reasoning, second.reasoning);
        assert_eq!(first.knowledge, second.knowledge);
        assert_eq!(first.computation, second.computation);
        assert_eq!(first.coordination, second.coordination);
    }

    #[test]
    fn domain_hint_boosts_knowledge_and_reasoning() {
        let mut context = HashMap::new();
        let _ = context.insert("domain".to_string(), "engineering".to_string());
        let with_hint = score_complexity("hello", &context);
        let without_hint = score_complexity("hello", &HashMap::new());
        assert!(with_hint.knowledge > without_hint.knowledge);
        assert!(with_hint.reasoning > without_hint.reasoning);
    }

    #[test]
    fn length_modifier_clamps_at_500_chars() {
        let short = score_complexity(&"a".repeat(10), &HashMap::new());
        let at_cap = score_complexity(&"a".repeat(500), &HashMap::new());
        let over_cap = score_complexity(&"a".repeat(5000), &HashMap::new());
        assert!(at_cap.reasoning >= short.reasoning);
        assert!((at_cap.reasoning - over_cap.reasoning).abs() < 1e-9);
    }

    #[test]
    fn multiple_questions_add_coordination_bonus() {
        let single = score_complexity("What is this?", &HashMap::new());
        let many = score_complexity("What is this? And that? And also this?", &HashMap::new());
        assert!(many.coordination > single.coordination);
    }

    #[test]
    fn axes_clamp_to_three() {
        let prompt = "why explain analyze compare evaluate prove reason trade-off strategy "
            .repeat(20);
        let complexity = score_complexity(&prompt, &HashMap::new());
        assert!(complexity.reasoning <= 3.0);
    }
}
