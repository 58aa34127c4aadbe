//! Engine configuration: static construction options plus the persisted,
//! self-tunable parameter set.
//!
//! `Tuneables` is the single document the auto-tuner may rewrite; it lives in
//! `tuneables.json` and is replaced atomically. One snapshot is taken per
//! bridge cycle and threaded through every component, so no component reads
//! global mutable state mid-cycle.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::persist;

// ---------------------------------------------------------------------------
// Tuneables
// ---------------------------------------------------------------------------

/// Self-tunable parameters, persisted as `tuneables.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Tuneables {
    // Queue
    /// Bounded wait for the queue file lock (ms).
    pub queue_lock_wait_ms: u64,
    /// Soft capture budget (ms); beyond it the event goes to the overflow sidecar.
    pub queue_capture_budget_ms: u64,
    /// Active-log record count that triggers rotation.
    pub queue_rotate_threshold: u64,
    /// Tail-read chunk size (bytes).
    pub queue_tail_chunk_bytes: usize,

    // Insight store
    /// Insights older than this are pruned (days).
    pub insight_max_age_days: f64,
    /// Insights with lower effective reliability are pruned.
    pub insight_min_effective: f64,
    /// Effective reliability needed for promotion.
    pub promotion_threshold: f64,
    /// Validations needed for promotion.
    pub min_validations: u64,

    // Quality gate
    /// Total roast score at or above which a candidate is `quality`.
    pub quality_threshold: f64,
    /// Total roast score at or above which a candidate is `needs_work`.
    pub needs_work_threshold: f64,
    /// Text similarity at or above which a candidate is a duplicate.
    pub duplicate_similarity: f64,

    // Aggregator
    /// Identical patterns within this window are dropped (seconds).
    pub pattern_dedupe_ttl_secs: u64,
    /// Minimum pattern confidence routed onward.
    pub pattern_threshold: f64,
    /// Processed-event interval between distillation passes.
    pub distill_interval_events: u64,

    // Episodes
    pub episode_max_steps: u64,
    pub episode_max_time_seconds: u64,
    pub episode_max_retries_per_error: u64,
    pub episode_max_file_touches: u64,
    pub episode_no_evidence_limit: u64,
    /// Inactive episodes past this age are auto-consolidated (seconds).
    pub episode_stale_after_secs: u64,

    // Distillation
    pub distill_min_occurrences: u64,
    pub distill_min_confidence: f64,
    /// Minimum settling window between revalidations (seconds).
    pub distill_revalidate_window_secs: u64,

    // Advisor
    pub max_advice_items: u64,
    /// Candidate over-fetch multiplier before fusion.
    pub advisor_overfetch_factor: u64,
    /// Fusion-score gate.
    pub min_rank_score: f64,
    /// Cheap similarity gate (triggers bypass it).
    pub advisor_min_similarity: f64,
    /// Outcome-history weight in fusion.
    pub advisor_outcome_weight: f64,
    /// Recency weight in fusion.
    pub advisor_recency_weight: f64,
    /// Marginal-relevance trade-off.
    pub advisor_mmr_lambda: f64,
    /// Per-source result cap.
    pub advisor_source_cap: u64,
    /// Advice cache TTL (seconds).
    pub advisor_cache_ttl_secs: u64,
    /// Outcome correlation window (seconds).
    pub advisor_outcome_window_secs: u64,
    /// Additive per-source fusion boosts (tuner recommendation domain).
    pub advisor_source_boosts: BTreeMap<String, f64>,

    // Bridge cycle
    /// Cycle interval (seconds); clamped to at least 10.
    pub bridge_cycle_secs: u64,
    /// Events read per cycle.
    pub bridge_read_batch: u64,

    // Domain weights: project tag -> keyword -> multiplier.
    pub domain_weights: BTreeMap<String, BTreeMap<String, f64>>,
}

impl Default for Tuneables {
    fn default() -> Self {
        Self {
            queue_lock_wait_ms: 500,
            queue_capture_budget_ms: 10,
            queue_rotate_threshold: 10_000,
            queue_tail_chunk_bytes: 64 * 1024,

            insight_max_age_days: 365.0,
            insight_min_effective: 0.05,
            promotion_threshold: 0.7,
            min_validations: 3,

            quality_threshold: 4.0,
            needs_work_threshold: 2.0,
            duplicate_similarity: 0.82,

            pattern_dedupe_ttl_secs: 600,
            pattern_threshold: 0.55,
            distill_interval_events: 15,

            episode_max_steps: 25,
            episode_max_time_seconds: 3_600,
            episode_max_retries_per_error: 2,
            episode_max_file_touches: 3,
            episode_no_evidence_limit: 4,
            episode_stale_after_secs: 1_800,

            distill_min_occurrences: 2,
            distill_min_confidence: 0.6,
            distill_revalidate_window_secs: 3_600,

            max_advice_items: 6,
            advisor_overfetch_factor: 3,
            min_rank_score: 0.25,
            advisor_min_similarity: 0.12,
            advisor_outcome_weight: 0.40,
            advisor_recency_weight: 0.15,
            advisor_mmr_lambda: 0.6,
            advisor_source_cap: 3,
            advisor_cache_ttl_secs: 180,
            advisor_outcome_window_secs: 900,
            advisor_source_boosts: BTreeMap::new(),

            bridge_cycle_secs: 60,
            bridge_read_batch: 40,

            domain_weights: default_domain_weights(),
        }
    }
}

/// Built-in domain weight tables, activated by a matching project context tag.
fn default_domain_weights() -> BTreeMap<String, BTreeMap<String, f64>> {
    let mut domains = BTreeMap::new();
    for (domain, pairs) in [
        (
            "game_dev",
            &[("frame", 1.2), ("shader", 1.25), ("entity", 1.15), ("physics", 1.2)][..],
        ),
        (
            "fintech",
            &[("ledger", 1.3), ("transaction", 1.25), ("audit", 1.3), ("compliance", 1.35)][..],
        ),
        (
            "marketing",
            &[("campaign", 1.2), ("conversion", 1.25), ("funnel", 1.15)][..],
        ),
        (
            "product",
            &[("roadmap", 1.15), ("user", 1.1), ("metric", 1.1), ("launch", 1.2)][..],
        ),
    ] {
        let table: BTreeMap<String, f64> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect();
        domains.insert(domain.to_string(), table);
    }
    domains
}

impl Tuneables {
    /// Load from `tuneables.json`, falling back to defaults when absent.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match persist::read_json::<Tuneables>(path) {
            Ok(Some(t)) => Ok(t),
            Ok(None) => Ok(Self::default()),
            Err(e) => Err(ConfigError::Corrupt {
                path: path.display().to_string(),
                message: e.to_string(),
            }),
        }
    }

    /// Atomically persist to `tuneables.json`.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        persist::write_json_atomic(path, self).map_err(|e| ConfigError::Persist {
            path: path.display().to_string(),
            source: e,
        })
    }

    /// Effective bridge interval, honoring the 10 s floor.
    pub fn bridge_interval_secs(&self) -> u64 {
        self.bridge_cycle_secs.max(10)
    }

    /// Read a tuneable by its audit-log name. Only parameters in the tuner's
    /// recommendation domain are addressable here.
    pub fn get(&self, name: &str) -> Option<f64> {
        Some(match name {
            "min_rank_score" => self.min_rank_score,
            "max_advice_items" => self.max_advice_items as f64,
            "promotion_threshold" => self.promotion_threshold,
            "min_validations" => self.min_validations as f64,
            "distill_interval_events" => self.distill_interval_events as f64,
            "quality_threshold" => self.quality_threshold,
            "pattern_threshold" => self.pattern_threshold,
            "advisor_source_cap" => self.advisor_source_cap as f64,
            _ => {
                if let Some(source) = name.strip_prefix("source_boost.") {
                    return Some(*self.advisor_source_boosts.get(source).unwrap_or(&0.0));
                }
                return None;
            }
        })
    }

    /// Write a tuneable by its audit-log name. Integer-valued parameters are
    /// rounded; unknown names are rejected.
    pub fn set(&mut self, name: &str, value: f64) -> Result<(), ConfigError> {
        match name {
            "min_rank_score" => self.min_rank_score = value,
            "max_advice_items" => self.max_advice_items = value.round().max(1.0) as u64,
            "promotion_threshold" => self.promotion_threshold = value,
            "min_validations" => self.min_validations = value.round().max(1.0) as u64,
            "distill_interval_events" => {
                self.distill_interval_events = value.round().max(1.0) as u64
            }
            "quality_threshold" => self.quality_threshold = value,
            "pattern_threshold" => self.pattern_threshold = value,
            "advisor_source_cap" => self.advisor_source_cap = value.round().max(1.0) as u64,
            _ => {
                if let Some(source) = name.strip_prefix("source_boost.") {
                    self.advisor_source_boosts.insert(source.to_string(), value);
                    return Ok(());
                }
                return Err(ConfigError::Invalid {
                    message: format!("unknown tuneable: {name}"),
                });
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Flags
// ---------------------------------------------------------------------------

/// Environment-derived switches, resolved once at startup.
#[derive(Debug, Clone, Default)]
pub struct Flags {
    /// Block step admission when the event carries no trace id.
    pub strict_trace: bool,
    /// Disable embedding hints; similarity falls back to keyword overlap.
    pub no_embed: bool,
    /// Verbose diagnostics.
    pub debug: bool,
}

impl Flags {
    /// Read `SESHAT_STRICT_TRACE`, `SESHAT_NO_EMBED`, and `SESHAT_DEBUG`.
    pub fn from_env() -> Self {
        fn on(var: &str) -> bool {
            std::env::var(var).map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false)
        }
        Self {
            strict_trace: on("SESHAT_STRICT_TRACE"),
            no_embed: on("SESHAT_NO_EMBED"),
            debug: on("SESHAT_DEBUG"),
        }
    }
}

/// Per-cycle configuration snapshot handed to every component.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub tuneables: Tuneables,
    pub flags: Flags,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let t = Tuneables::default();
        assert_eq!(t.queue_lock_wait_ms, 500);
        assert_eq!(t.queue_rotate_threshold, 10_000);
        assert_eq!(t.max_advice_items, 6);
        assert!((t.advisor_outcome_weight - 0.40).abs() < f64::EPSILON);
        assert!((t.advisor_recency_weight - 0.15).abs() < f64::EPSILON);
        assert!((t.advisor_mmr_lambda - 0.6).abs() < f64::EPSILON);
        assert_eq!(t.advisor_cache_ttl_secs, 180);
        assert_eq!(t.distill_interval_events, 15);
        assert_eq!(t.episode_max_retries_per_error, 2);
        assert_eq!(t.episode_max_file_touches, 3);
        assert_eq!(t.episode_no_evidence_limit, 4);
        assert!((t.quality_threshold - 4.0).abs() < f64::EPSILON);
        assert!((t.pattern_threshold - 0.55).abs() < f64::EPSILON);
    }

    #[test]
    fn bridge_interval_floors_at_ten_seconds() {
        let mut t = Tuneables::default();
        t.bridge_cycle_secs = 3;
        assert_eq!(t.bridge_interval_secs(), 10);
        t.bridge_cycle_secs = 120;
        assert_eq!(t.bridge_interval_secs(), 120);
    }

    #[test]
    fn get_set_round_trip_by_name() {
        let mut t = Tuneables::default();
        t.set("min_rank_score", 0.3).unwrap();
        assert!((t.get("min_rank_score").unwrap() - 0.3).abs() < f64::EPSILON);
        t.set("max_advice_items", 4.2).unwrap();
        assert_eq!(t.max_advice_items, 4);
        t.set("source_boost.trigger", 0.1).unwrap();
        assert!((t.get("source_boost.trigger").unwrap() - 0.1).abs() < f64::EPSILON);
        assert!(t.set("no_such_knob", 1.0).is_err());
        assert!(t.get("no_such_knob").is_none());
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("tuneables.json");
        let mut t = Tuneables::default();
        t.min_rank_score = 0.33;
        t.save(&path).unwrap();
        let back = Tuneables::load(&path).unwrap();
        assert!((back.min_rank_score - 0.33).abs() < f64::EPSILON);
    }

    #[test]
    fn load_missing_file_gives_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let t = Tuneables::load(&dir.path().join("tuneables.json")).unwrap();
        assert_eq!(t.max_advice_items, 6);
    }

    #[test]
    fn domain_weights_carry_known_domains() {
        let t = Tuneables::default();
        assert!(t.domain_weights.contains_key("game_dev"));
        assert!(t.domain_weights.contains_key("fintech"));
        assert!(t.domain_weights["fintech"]["compliance"] > 1.0);
    }
}
