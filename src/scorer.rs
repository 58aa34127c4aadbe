//! Importance scoring: tier classification of candidate text by signal
//! patterns, with configurable domain-weight multipliers.
//!
//! Scoring is a pure function of (text, tool, context) given a tuneables
//! snapshot; the only side effect is a per-pattern usage counter the
//! auto-tuner reads.

use dashmap::DashMap;
use regex::Regex;

use crate::config::Tuneables;

// ---------------------------------------------------------------------------
// Tiers
// ---------------------------------------------------------------------------

/// Importance tier, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Critical,
    High,
    Medium,
    Low,
}

impl Tier {
    /// Base score for the tier.
    pub fn base_score(self) -> f64 {
        match self {
            Tier::Critical => 0.95,
            Tier::High => 0.75,
            Tier::Medium => 0.55,
            Tier::Low => 0.3,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Tier::Critical => "critical",
            Tier::High => "high",
            Tier::Medium => "medium",
            Tier::Low => "low",
        };
        f.write_str(s)
    }
}

/// Outcome of scoring one candidate.
#[derive(Debug, Clone)]
pub struct ImportanceReport {
    pub tier: Tier,
    /// Final score in [0, 1] after domain weighting.
    pub score: f64,
    /// Names of every pattern that matched, winning pattern first.
    pub matched_signals: Vec<String>,
}

// ---------------------------------------------------------------------------
// Scorer
// ---------------------------------------------------------------------------

struct SignalPattern {
    tier: Tier,
    name: &'static str,
    regex: Regex,
}

/// Tier classifier with per-pattern usage counters.
pub struct ImportanceScorer {
    patterns: Vec<SignalPattern>,
    usage: DashMap<String, u64>,
}

impl ImportanceScorer {
    pub fn new() -> Self {
        let table: &[(Tier, &'static str, &'static str)] = &[
            // CRITICAL: explicit memory requests, corrections, absolutes,
            // reasoned decisions.
            (Tier::Critical, "remember_this", r"(?i)\bremember\s+this\b"),
            (Tier::Critical, "correction", r"(?i)\b(no,?\s+i\s+meant|actually,|that's\s+wrong|not\s+what\s+i\s+asked)\b"),
            (Tier::Critical, "absolute_rule", r"(?i)\b(never|always)\s+\w+"),
            (Tier::Critical, "reasoned_decision", r"(?i)\b(decided|chose|going\s+with)\b.{0,80}\bbecause\b"),
            // HIGH: preferences, principles, recognized patterns.
            (Tier::High, "preference", r"(?i)\bi\s+(prefer|like|want|'d\s+rather)\b"),
            (Tier::High, "principle", r"(?i)\b(as\s+a\s+rule|rule\s+of\s+thumb|the\s+principle\s+is|our\s+convention)\b"),
            (Tier::High, "pattern_recognition", r"(?i)\b(i\s+notice|keeps\s+happening|every\s+time|again\s+and\s+again)\b"),
            // MEDIUM: observations, conditional rules.
            (Tier::Medium, "observation", r"(?i)\b(it\s+seems|looks\s+like|appears\s+to)\b"),
            (Tier::Medium, "conditional_rule", r"(?i)\b(if|when)\b.{0,60}\b(then|use|prefer|avoid)\b"),
            // LOW: tool chains, raw metrics, acknowledgments.
            (Tier::Low, "tool_sequence", r"(?i)\b\w+\s+then\s+\w+\s+then\s+\w+\b"),
            (Tier::Low, "raw_metric", r"(?i)\b\d+(\.\d+)?\s*(ms|s|mb|kb|gb|%|percent)\b"),
            (Tier::Low, "acknowledgment", r"(?i)^\s*(ok(ay)?|thanks?|got\s+it|done|sure)\s*[.!]?\s*$"),
        ];

        let patterns = table
            .iter()
            .map(|(tier, name, pat)| SignalPattern {
                tier: *tier,
                name,
                regex: Regex::new(pat).expect("importance pattern must compile"),
            })
            .collect();

        Self {
            patterns,
            usage: DashMap::new(),
        }
    }

    /// Classify `text` in the given tool/context.
    ///
    /// Highest tier wins; within a tier the longest literal match wins, then
    /// the earliest position. The matched domain weight multiplies the tier
    /// score, clamped to 1.0. Returns `None` when no signal matches.
    pub fn score(
        &self,
        text: &str,
        _tool: Option<&str>,
        context: &str,
        tuneables: &Tuneables,
    ) -> Option<ImportanceReport> {
        // (tier, -match_len, position) — smaller tuple wins.
        let mut best: Option<(Tier, i64, usize, usize)> = None;
        let mut matched: Vec<(usize, &SignalPattern)> = Vec::new();

        for pattern in &self.patterns {
            if let Some(m) = pattern.regex.find(text) {
                matched.push((m.start(), pattern));
                let key = (
                    pattern.tier,
                    -(m.len() as i64),
                    m.start(),
                    matched.len() - 1,
                );
                if best.is_none_or(|b| (key.0, key.1, key.2) < (b.0, b.1, b.2)) {
                    best = Some(key);
                }
            }
        }

        let (tier, _, _, winner_idx) = best?;

        // Count usage for every matched pattern.
        for (_, pattern) in &matched {
            *self.usage.entry(pattern.name.to_string()).or_insert(0) += 1;
        }

        let mut signals: Vec<String> = Vec::with_capacity(matched.len());
        signals.push(matched[winner_idx].1.name.to_string());
        for (i, (_, pattern)) in matched.iter().enumerate() {
            if i != winner_idx {
                signals.push(pattern.name.to_string());
            }
        }

        let mut score = tier.base_score();
        if let Some(multiplier) = domain_multiplier(text, context, tuneables) {
            score = (score * multiplier).min(1.0);
        }

        Some(ImportanceReport {
            tier,
            score,
            matched_signals: signals,
        })
    }

    /// Snapshot of per-pattern usage counts (read by the auto-tuner).
    pub fn usage_counts(&self) -> Vec<(String, u64)> {
        let mut counts: Vec<(String, u64)> = self
            .usage
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        counts.sort();
        counts
    }
}

impl Default for ImportanceScorer {
    fn default() -> Self {
        Self::new()
    }
}

/// Largest multiplier among domain keywords found in the text, for domains
/// whose tag appears in the project context.
fn domain_multiplier(text: &str, context: &str, tuneables: &Tuneables) -> Option<f64> {
    let context_lower = context.to_lowercase();
    let text_lower = text.to_lowercase();
    let mut best: Option<f64> = None;
    for (domain, table) in &tuneables.domain_weights {
        if !context_lower.contains(domain.as_str()) {
            continue;
        }
        for (keyword, multiplier) in table {
            if text_lower.contains(keyword.as_str()) {
                best = Some(best.map_or(*multiplier, |b: f64| b.max(*multiplier)));
            }
        }
    }
    best
}
