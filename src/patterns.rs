//! Pattern aggregation: runs a pipeline of detectors over incoming events,
//! dedupes within a TTL window, boosts corroborated detections, and routes
//! qualifying patterns onward.
//!
//! Detectors are cheap regex/keyword passes; each emits a typed pattern with
//! a confidence in [0, 1]. Orthogonal detectors corroborating on the same
//! event raise each other's confidence by 15%.

use std::collections::{HashMap, VecDeque};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::Tuneables;
use crate::event::{Event, EventKind};
use crate::insight::normalize;
use crate::roast::text_similarity;

// ---------------------------------------------------------------------------
// Pattern model
// ---------------------------------------------------------------------------

/// Which detector produced a pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    Correction,
    Sentiment,
    Repetition,
    SemanticIntent,
    Reasoning,
}

impl std::fmt::Display for PatternKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PatternKind::Correction => "correction",
            PatternKind::Sentiment => "sentiment",
            PatternKind::Repetition => "repetition",
            PatternKind::SemanticIntent => "semantic_intent",
            PatternKind::Reasoning => "reasoning",
        };
        f.write_str(s)
    }
}

/// A detected pattern with its salient text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectedPattern {
    pub kind: PatternKind,
    /// The text worth learning from (usually the whole prompt).
    pub text: String,
    pub confidence: f64,
    pub session_id: String,
    pub source_event_id: String,
    pub ts_ms: u64,
}

/// A user prompt wrapped as a pending step request for the episode engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRequest {
    pub session_id: String,
    pub text: String,
    pub ts_ms: u64,
    pub trace_id: Option<String>,
}

/// What one aggregation pass produced.
#[derive(Debug, Default)]
pub struct AggregatorOutput {
    /// Patterns at or above the routing threshold.
    pub patterns: Vec<DetectedPattern>,
    /// User prompts to track as pending steps.
    pub step_requests: Vec<StepRequest>,
    /// True when the distillation interval elapsed during this pass.
    pub distill_due: bool,
}

// ---------------------------------------------------------------------------
// Aggregator
// ---------------------------------------------------------------------------

pub struct PatternAggregator {
    correction: Regex,
    frustration: Regex,
    satisfaction: Regex,
    intent: Regex,
    reasoning: Regex,
    /// Dedupe map: pattern identity -> last emission (ms).
    seen: HashMap<String, u64>,
    /// Recent prompts per session for the repetition detector.
    recent_prompts: VecDeque<(String, String, u64)>,
    processed_events: u64,
}

impl PatternAggregator {
    pub fn new() -> Self {
        Self {
            correction: Regex::new(
                r"(?i)\b(no,?\s+i\s+meant|actually,|that's\s+(not|wrong)|not\s+what\s+i|undo\s+that|revert\s+that)\b",
            )
            .unwrap(),
            frustration: Regex::new(
                r"(?i)\b(ugh|frustrating|annoying|why\s+(does|do|is|won't|doesn't)|still\s+(broken|failing)|again\?)\b",
            )
            .unwrap(),
            satisfaction: Regex::new(r"(?i)\b(perfect|exactly|works\s+now|great|love\s+it|that's\s+it)\b").unwrap(),
            intent: Regex::new(
                r"(?i)\b(i\s+prefer|instead\s+of|rather\s+than|switch\s+to|use\s+\S+\s+not\s+\S+|from\s+now\s+on)\b",
            )
            .unwrap(),
            reasoning: Regex::new(r"(?i)\b(because|the\s+reason\s+is|since|due\s+to)\b").unwrap(),
            seen: HashMap::new(),
            recent_prompts: VecDeque::new(),
            processed_events: 0,
        }
    }

    /// Run every detector over a batch of events.
    pub fn process(&mut self, events: &[Event], tuneables: &Tuneables) -> AggregatorOutput {
        let mut output = AggregatorOutput::default();
        let ttl_ms = tuneables.pattern_dedupe_ttl_secs * 1_000;

        for event in events {
            self.processed_events += 1;
            if self.processed_events % tuneables.distill_interval_events.max(1) == 0 {
                output.distill_due = true;
            }

            let text = event.surface_text();
            if text.is_empty() {
                continue;
            }

            if event.kind == EventKind::UserPrompt {
                output.step_requests.push(StepRequest {
                    session_id: event.session_id.clone(),
                    text: text.to_string(),
                    ts_ms: event.ts_ms,
                    trace_id: event.trace_id.clone(),
                });
            }

            let mut found = self.detect(event, text);

            // Corroboration: orthogonal detectors agreeing on one event
            // lift each other by 15%.
            if found.len() >= 2 {
                for pattern in &mut found {
                    pattern.confidence = (pattern.confidence * 1.15).min(1.0);
                }
            }

            for pattern in found {
                if pattern.confidence < tuneables.pattern_threshold {
                    continue;
                }
                let identity = format!("{}:{}", pattern.kind, normalize(&pattern.text));
                match self.seen.get(&identity) {
                    Some(last) if pattern.ts_ms.saturating_sub(*last) < ttl_ms => continue,
                    _ => {
                        self.seen.insert(identity, pattern.ts_ms);
                        output.patterns.push(pattern);
                    }
                }
            }
        }

        self.purge_expired(ttl_ms);
        output
    }

    /// Events processed since construction (drives the distillation interval).
    pub fn processed_events(&self) -> u64 {
        self.processed_events
    }

    fn detect(&mut self, event: &Event, text: &str) -> Vec<DetectedPattern> {
        let mut found = Vec::new();
        let mut push = |kind: PatternKind, confidence: f64| {
            found.push(DetectedPattern {
                kind,
                text: text.to_string(),
                confidence,
                session_id: event.session_id.clone(),
                source_event_id: event.id.clone(),
                ts_ms: event.ts_ms,
            });
        };

        if self.correction.is_match(text) {
            push(PatternKind::Correction, 0.8);
        }
        if self.frustration.is_match(text) {
            push(PatternKind::Sentiment, 0.6);
        } else if self.satisfaction.is_match(text) {
            push(PatternKind::Sentiment, 0.55);
        }
        if self.intent.is_match(text) {
            push(PatternKind::SemanticIntent, 0.6);
        }
        if self.reasoning.is_match(text) {
            push(PatternKind::Reasoning, 0.7);
        }

        // Repetition: similar prompt from the same session seen recently.
        if event.kind == EventKind::UserPrompt {
            let normalized = normalize(text);
            let repeated = self
                .recent_prompts
                .iter()
                .any(|(session, prior, _)| {
                    session == &event.session_id && text_similarity(prior, &normalized) > 0.6
                });
            if repeated {
                found.push(DetectedPattern {
                    kind: PatternKind::Repetition,
                    text: text.to_string(),
                    confidence: 0.65,
                    session_id: event.session_id.clone(),
                    source_event_id: event.id.clone(),
                    ts_ms: event.ts_ms,
                });
            }
            self.recent_prompts
                .push_back((event.session_id.clone(), normalized, event.ts_ms));
            while self.recent_prompts.len() > 64 {
                self.recent_prompts.pop_front();
            }
        }

        found
    }

    fn purge_expired(&mut self, ttl_ms: u64) {
        let now = crate::event::now_ms();
        self.seen.retain(|_, last| now.saturating_sub(*last) < ttl_ms.saturating_mul(2));
        self.recent_prompts
            .retain(|(_, _, ts)| now.saturating_sub(*ts) < ttl_ms);
    }
}

impl Default for PatternAggregator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aggregator() -> (PatternAggregator, Tuneables) {
        (PatternAggregator::new(), Tuneables::default())
    }

    #[test]
    fn correction_is_detected() {
        let (mut agg, tuneables) = aggregator();
        let events = vec![Event::user_prompt("s1", "no, I meant the staging config")];
        let out = agg.process(&events, &tuneables);
        assert!(out.patterns.iter().any(|p| p.kind == PatternKind::Correction));
    }

    #[test]
    fn reasoning_clause_is_detected() {
        let (mut agg, tuneables) = aggregator();
        let events = vec![Event::user_prompt(
            "s1",
            "use the connection pool because opening sockets per query is slow",
        )];
        let out = agg.process(&events, &tuneables);
        assert!(out.patterns.iter().any(|p| p.kind == PatternKind::Reasoning));
    }

    #[test]
    fn corroboration_boosts_confidence() {
        let (mut agg, tuneables) = aggregator();
        // Correction + frustration on the same event.
        let events = vec![Event::user_prompt(
            "s1",
            "ugh, no, I meant the other file, this is frustrating",
        )];
        let out = agg.process(&events, &tuneables);
        let correction = out
            .patterns
            .iter()
            .find(|p| p.kind == PatternKind::Correction)
            .unwrap();
        assert!(correction.confidence > 0.8);
    }

    #[test]
    fn identical_patterns_dedupe_within_ttl() {
        let (mut agg, tuneables) = aggregator();
        let events = vec![
            Event::user_prompt("s1", "actually, use tabs because the linter wants them"),
            Event::user_prompt("s1", "actually, use tabs because the linter wants them"),
        ];
        let out = agg.process(&events, &tuneables);
        let corrections: Vec<_> = out
            .patterns
            .iter()
            .filter(|p| p.kind == PatternKind::Correction)
            .collect();
        assert_eq!(corrections.len(), 1);
    }

    #[test]
    fn repetition_fires_on_similar_prompts() {
        let (mut agg, tuneables) = aggregator();
        let events = vec![
            Event::user_prompt("s1", "please fix the flaky login test"),
            Event::user_prompt("s1", "fix the flaky login test please"),
        ];
        let out = agg.process(&events, &tuneables);
        assert!(out.patterns.iter().any(|p| p.kind == PatternKind::Repetition));
    }

    #[test]
    fn user_prompts_become_step_requests() {
        let (mut agg, tuneables) = aggregator();
        let events = vec![
            Event::user_prompt("s1", "refactor the parser"),
            Event::session_marker("s1", true),
        ];
        let out = agg.process(&events, &tuneables);
        assert_eq!(out.step_requests.len(), 1);
        assert_eq!(out.step_requests[0].text, "refactor the parser");
    }

    #[test]
    fn distillation_due_every_interval() {
        let (mut agg, mut tuneables) = aggregator();
        tuneables.distill_interval_events = 3;
        let batch: Vec<Event> = (0..3)
            .map(|i| Event::user_prompt("s1", format!("distinct prompt number {i}")))
            .collect();
        let out = agg.process(&batch, &tuneables);
        assert!(out.distill_due);
        let out2 = agg.process(&[Event::user_prompt("s1", "one more")], &tuneables);
        assert!(!out2.distill_due);
    }

    #[test]
    fn below_threshold_patterns_are_dropped() {
        let (mut agg, mut tuneables) = aggregator();
        tuneables.pattern_threshold = 0.95;
        let events = vec![Event::user_prompt("s1", "i prefer smaller functions")];
        let out = agg.process(&events, &tuneables);
        assert!(out.patterns.is_empty());
    }
}
