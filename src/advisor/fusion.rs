//! Fusion ranking: combines trigger confidence, semantic similarity,
//! recency, and outcome history into a single score, then diversifies the
//! ranked list with marginal-relevance selection under per-source caps.

use crate::roast::text_similarity;

/// Per-candidate ranking signals.
#[derive(Debug, Clone, Copy)]
pub struct FusionSignals {
    /// 1.0 for an explicit trigger match, else 0.0.
    pub trigger_conf: f64,
    /// Similarity of the candidate to the query, in [0, 1].
    pub semantic_sim: f64,
    /// Freshness in [0, 1].
    pub recency: f64,
    /// Historical helpfulness of the source for this tool, in [0, 1].
    pub outcome: f64,
    /// Additive bonus from rule priority (critical +0.2, high +0.1).
    pub priority_bonus: f64,
    /// Additive per-source boost from the tuneables.
    pub source_boost: f64,
}

/// Fusion weights, snapshot from the tuneables.
#[derive(Debug, Clone, Copy)]
pub struct FusionWeights {
    pub outcome_weight: f64,
    pub recency_weight: f64,
}

/// Compute the fusion score.
///
/// Trigger candidates rank from a 0.9 base adjusted by outcome history;
/// semantic candidates scale their similarity by outcome and recency.
pub fn fusion_score(signals: &FusionSignals, weights: &FusionWeights) -> f64 {
    let base = if signals.trigger_conf >= 1.0 {
        0.9 + (signals.outcome - 0.5) * weights.outcome_weight
    } else {
        signals.semantic_sim
            * (1.0
                + (signals.outcome - 0.5) * weights.outcome_weight
                + signals.recency * weights.recency_weight)
    };
    base + signals.priority_bonus + signals.source_boost
}

/// An item eligible for marginal-relevance selection.
pub trait Rankable {
    fn score(&self) -> f64;
    fn text(&self) -> &str;
    fn source_tag(&self) -> &str;
}

/// Marginal-relevance selection with per-source caps.
///
/// Greedily picks the item maximizing
/// `lambda * score - (1 - lambda) * max_similarity_to_selected`,
/// skipping items whose source already hit its cap.
pub fn select_diverse<T: Rankable>(
    mut candidates: Vec<T>,
    limit: usize,
    lambda: f64,
    per_source_cap: usize,
) -> Vec<T> {
    let mut selected: Vec<T> = Vec::with_capacity(limit);
    let mut source_counts: std::collections::HashMap<String, usize> =
        std::collections::HashMap::new();

    while selected.len() < limit && !candidates.is_empty() {
        let mut best_idx: Option<usize> = None;
        let mut best_value = f64::NEG_INFINITY;
        for (idx, candidate) in candidates.iter().enumerate() {
            if source_counts
                .get(candidate.source_tag())
                .is_some_and(|count| *count >= per_source_cap)
            {
                continue;
            }
            let redundancy = selected
                .iter()
                .map(|s| text_similarity(s.text(), candidate.text()))
                .fold(0.0, f64::max);
            let value = lambda * candidate.score() - (1.0 - lambda) * redundancy;
            if value > best_value {
                best_value = value;
                best_idx = Some(idx);
            }
        }
        let Some(idx) = best_idx else { break };
        let chosen = candidates.swap_remove(idx);
        *source_counts.entry(chosen.source_tag().to_string()).or_insert(0) += 1;
        selected.push(chosen);
    }
    selected
}

#[cfg(test)]
mod tests {
    use super::*;

    const WEIGHTS: FusionWeights = FusionWeights {
        outcome_weight: 0.40,
        recency_weight: 0.15,
    };

    fn signals(trigger: f64, sim: f64, outcome: f64) -> FusionSignals {
        FusionSignals {
            trigger_conf: trigger,
            semantic_sim: sim,
            recency: 0.5,
            outcome,
            priority_bonus: 0.0,
            source_boost: 0.0,
        }
    }

    #[test]
    fn trigger_base_is_point_nine_at_neutral_outcome() {
        let score = fusion_score(&signals(1.0, 0.0, 0.5), &WEIGHTS);
        assert!((score - 0.9).abs() < 1e-9);
    }

    #[test]
    fn trigger_outcome_swings_by_outcome_weight() {
        let good = fusion_score(&signals(1.0, 0.0, 1.0), &WEIGHTS);
        let bad = fusion_score(&signals(1.0, 0.0, 0.0), &WEIGHTS);
        assert!((good - (0.9 + 0.2)).abs() < 1e-9);
        assert!((bad - (0.9 - 0.2)).abs() < 1e-9);
    }

    #[test]
    fn semantic_score_scales_similarity() {
        let neutral = fusion_score(&signals(0.0, 0.6, 0.5), &WEIGHTS);
        // sim * (1 + 0 + 0.5*0.15) = 0.6 * 1.075
        assert!((neutral - 0.6 * 1.075).abs() < 1e-9);
        let helped = fusion_score(&signals(0.0, 0.6, 1.0), &WEIGHTS);
        assert!(helped > neutral);
    }

    #[test]
    fn priority_bonus_is_additive() {
        let mut s = signals(1.0, 0.0, 0.5);
        s.priority_bonus = 0.2;
        assert!((fusion_score(&s, &WEIGHTS) - 1.1).abs() < 1e-9);
    }

    struct Item {
        score: f64,
        text: String,
        source: String,
    }

    impl Rankable for Item {
        fn score(&self) -> f64 {
            self.score
        }
        fn text(&self) -> &str {
            &self.text
        }
        fn source_tag(&self) -> &str {
            &self.source
        }
    }

    fn item(score: f64, text: &str, source: &str) -> Item {
        Item {
            score,
            text: text.into(),
            source: source.into(),
        }
    }

    #[test]
    fn selection_respects_limit_and_order() {
        let picked = select_diverse(
            vec![
                item(0.9, "validate database input before writes", "cognitive"),
                item(0.5, "prefer small commits", "cognitive"),
                item(0.8, "run tests before pushing", "distillation"),
            ],
            2,
            0.6,
            3,
        );
        assert_eq!(picked.len(), 2);
        assert!((picked[0].score - 0.9).abs() < 1e-9);
    }

    #[test]
    fn near_duplicates_are_penalized() {
        let picked = select_diverse(
            vec![
                item(0.9, "always validate input before database operations", "a"),
                item(0.89, "validate input before database operations always", "b"),
                item(0.6, "keep functions under forty lines", "c"),
            ],
            2,
            0.6,
            3,
        );
        // The near-duplicate of the top pick loses to the diverse item.
        assert_eq!(picked.len(), 2);
        assert!(picked[1].text.contains("forty lines"));
    }

    #[test]
    fn per_source_cap_holds() {
        let candidates: Vec<Item> = (0..6)
            .map(|i| item(0.9 - 0.01 * i as f64, &format!("completely distinct advice text number {i} about topic {i}"), "one"))
            .collect();
        let picked = select_diverse(candidates, 6, 0.6, 3);
        assert_eq!(picked.len(), 3);
    }
}
