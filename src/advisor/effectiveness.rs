//! Per-source effectiveness counters for the advisor feedback loop.
//!
//! Counters are persisted as `advisor/effectiveness.json` (atomic replace)
//! and repaired from the advice log ground truth whenever the
//! `followed <= advice_given` invariant breaks.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::AdvisorError;
use crate::persist;

/// Raw counters for one source (optionally scoped to a tool).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Counters {
    pub advice_given: u64,
    pub followed: u64,
    pub helpful: u64,
    pub unhelpful: u64,
}

impl Counters {
    /// Historical helpfulness in [0, 1]; 0.5 with no signal.
    pub fn outcome_score(&self) -> f64 {
        let judged = self.helpful + self.unhelpful;
        if judged == 0 {
            return 0.5;
        }
        self.helpful as f64 / judged as f64
    }

    /// advice-follow rate; 0 with no advice given.
    pub fn action_rate(&self) -> f64 {
        if self.advice_given == 0 {
            return 0.0;
        }
        self.followed as f64 / self.advice_given as f64
    }
}

/// Counters for one source, with a per-tool breakdown.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceStats {
    pub total: Counters,
    #[serde(default)]
    pub per_tool: BTreeMap<String, Counters>,
}

/// The persisted effectiveness book.
pub struct EffectivenessBook {
    path: PathBuf,
    map: Mutex<BTreeMap<String, SourceStats>>,
}

impl EffectivenessBook {
    pub fn open(path: PathBuf) -> Self {
        let map = persist::read_json::<BTreeMap<String, SourceStats>>(&path)
            .ok()
            .flatten()
            .unwrap_or_default();
        Self {
            path,
            map: Mutex::new(map),
        }
    }

    pub fn record_given(&self, source: &str, tool: &str) {
        let mut map = self.map.lock().unwrap();
        let stats = map.entry(source.to_string()).or_default();
        stats.total.advice_given += 1;
        stats
            .per_tool
            .entry(tool.to_lowercase())
            .or_default()
            .advice_given += 1;
    }

    pub fn record_outcome(&self, source: &str, tool: &str, followed: bool, helpful: Option<bool>) {
        let mut map = self.map.lock().unwrap();
        let stats = map.entry(source.to_string()).or_default();
        for counters in [
            &mut stats.total,
            stats.per_tool.entry(tool.to_lowercase()).or_default(),
        ] {
            if followed {
                counters.followed += 1;
            }
            match helpful {
                Some(true) => counters.helpful += 1,
                Some(false) => counters.unhelpful += 1,
                None => {}
            }
        }
    }

    /// Outcome score for a source, preferring the per-tool slice when it has
    /// any judged samples.
    pub fn outcome_score(&self, source: &str, tool: &str) -> f64 {
        let map = self.map.lock().unwrap();
        let Some(stats) = map.get(source) else {
            return 0.5;
        };
        if let Some(tool_counters) = stats.per_tool.get(&tool.to_lowercase()) {
            if tool_counters.helpful + tool_counters.unhelpful > 0 {
                return tool_counters.outcome_score();
            }
        }
        stats.total.outcome_score()
    }

    /// Overall advice-follow rate across sources (the tuner's action rate).
    pub fn overall_action_rate(&self) -> f64 {
        let map = self.map.lock().unwrap();
        let (given, followed) = map
            .values()
            .fold((0u64, 0u64), |(g, f), s| (g + s.total.advice_given, f + s.total.followed));
        if given == 0 {
            return 0.0;
        }
        followed as f64 / given as f64
    }

    /// Snapshot of per-source totals, for `status` and the tuner.
    pub fn totals(&self) -> BTreeMap<String, Counters> {
        self.map
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.total))
            .collect()
    }

    /// Verify `followed <= advice_given` everywhere. On violation, clamp from
    /// the given-side ground truth (recomputed by the caller from the advice
    /// log) and return the offending sources.
    pub fn verify_and_repair(
        &self,
        given_by_source: &BTreeMap<String, u64>,
    ) -> Vec<AdvisorError> {
        let mut violations = Vec::new();
        let mut map = self.map.lock().unwrap();
        for (source, stats) in map.iter_mut() {
            if stats.total.followed > stats.total.advice_given {
                violations.push(AdvisorError::Integrity {
                    source_tag: source.clone(),
                    followed: stats.total.followed,
                    given: stats.total.advice_given,
                });
                let truth = given_by_source.get(source).copied().unwrap_or(0);
                stats.total.advice_given = stats.total.advice_given.max(truth);
                stats.total.followed = stats.total.followed.min(stats.total.advice_given);
                for counters in stats.per_tool.values_mut() {
                    counters.followed = counters.followed.min(counters.advice_given);
                }
            }
        }
        violations
    }

    /// Persist atomically.
    pub fn save(&self) -> Result<(), AdvisorError> {
        let map = self.map.lock().unwrap().clone();
        persist::write_json_atomic(&self.path, &map)
            .map_err(|e| AdvisorError::LogIo { source: e })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book(dir: &std::path::Path) -> EffectivenessBook {
        EffectivenessBook::open(dir.join("effectiveness.json"))
    }

    #[test]
    fn given_and_outcome_counters_accumulate() {
        let dir = tempfile::TempDir::new().unwrap();
        let b = book(dir.path());
        b.record_given("trigger", "Edit");
        b.record_given("trigger", "Edit");
        b.record_outcome("trigger", "Edit", true, Some(true));

        let totals = b.totals();
        assert_eq!(totals["trigger"].advice_given, 2);
        assert_eq!(totals["trigger"].followed, 1);
        assert_eq!(totals["trigger"].helpful, 1);
        assert!((b.overall_action_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn outcome_score_prefers_tool_slice() {
        let dir = tempfile::TempDir::new().unwrap();
        let b = book(dir.path());
        b.record_given("cognitive", "Edit");
        b.record_given("cognitive", "Bash");
        b.record_outcome("cognitive", "Edit", true, Some(true));
        b.record_outcome("cognitive", "Bash", true, Some(false));

        assert!(b.outcome_score("cognitive", "Edit") > 0.9);
        assert!(b.outcome_score("cognitive", "Bash") < 0.1);
        // Unknown source: neutral prior.
        assert!((b.outcome_score("nobody", "Edit") - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn integrity_violation_is_repaired() {
        let dir = tempfile::TempDir::new().unwrap();
        let b = book(dir.path());
        b.record_outcome("trigger", "Edit", true, Some(true));
        // followed=1, given=0: corrupted.
        let mut truth = BTreeMap::new();
        truth.insert("trigger".to_string(), 0u64);
        let violations = b.verify_and_repair(&truth);
        assert_eq!(violations.len(), 1);
        let totals = b.totals();
        assert!(totals["trigger"].followed <= totals["trigger"].advice_given);

        // Clean state reports nothing.
        assert!(b.verify_and_repair(&truth).is_empty());
    }

    #[test]
    fn book_survives_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        {
            let b = book(dir.path());
            b.record_given("distillation", "Bash");
            b.save().unwrap();
        }
        let b = book(dir.path());
        assert_eq!(b.totals()["distillation"].advice_given, 1);
    }
}
