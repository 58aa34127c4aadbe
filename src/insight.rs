//! Cognitive insight store: durable learnings keyed by normalized content,
//! with validation counters, category-specific decay, and atomic snapshots.
//!
//! The key is idempotent: upserting the same normalized text + category
//! validates the existing record instead of duplicating it. Effective
//! reliability is always recomputed from counters and age, never stored.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::InsightError;
use crate::event::now_secs;
use crate::persist;
use crate::scorer::Tier;

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// What kind of learning an insight is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightCategory {
    SelfAwareness,
    UserUnderstanding,
    Reasoning,
    Context,
    Wisdom,
    MetaLearning,
    Communication,
    Creativity,
}

impl InsightCategory {
    /// Decay half-life in days.
    pub fn half_life_days(self) -> f64 {
        match self {
            InsightCategory::Wisdom => 180.0,
            InsightCategory::MetaLearning => 120.0,
            InsightCategory::UserUnderstanding => 90.0,
            InsightCategory::Communication => 90.0,
            InsightCategory::SelfAwareness => 60.0,
            InsightCategory::Reasoning => 60.0,
            InsightCategory::Creativity => 60.0,
            InsightCategory::Context => 45.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InsightCategory::SelfAwareness => "self_awareness",
            InsightCategory::UserUnderstanding => "user_understanding",
            InsightCategory::Reasoning => "reasoning",
            InsightCategory::Context => "context",
            InsightCategory::Wisdom => "wisdom",
            InsightCategory::MetaLearning => "meta_learning",
            InsightCategory::Communication => "communication",
            InsightCategory::Creativity => "creativity",
        }
    }
}

/// A durable learning unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Insight {
    /// Stable key: category + hash of normalized text.
    pub key: String,
    pub category: InsightCategory,
    pub text: String,
    /// Where the insight came from (session, project tag, tool).
    pub context: String,
    /// Confidence at insertion, in [0, 1].
    pub base_confidence: f64,
    pub times_validated: u64,
    pub times_contradicted: u64,
    /// Seconds since epoch.
    pub created_at: u64,
    pub last_touched_at: u64,
    pub promoted: bool,
    /// Importance tier assigned at ingestion.
    pub tier: Tier,
    /// Optional explicit trigger tags for the advisor.
    #[serde(default)]
    pub trigger_tags: Vec<String>,
    /// Optional embedding, filled by an external adapter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl Insight {
    /// Counter-based reliability: `(base + v) / (1 + v + 2c)`.
    ///
    /// The base confidence acts as the prior observation; validations pull
    /// toward 1.0 and contradictions push down twice as hard.
    pub fn reliability(&self) -> f64 {
        let v = self.times_validated as f64;
        let c = self.times_contradicted as f64;
        ((self.base_confidence + v) / (1.0 + v + 2.0 * c)).clamp(0.0, 1.0)
    }

    /// Reliability decayed by age: `reliability · 2^(−age_days / half_life)`.
    pub fn effective_reliability(&self, now_secs: u64) -> f64 {
        let age_days = now_secs.saturating_sub(self.last_touched_at) as f64 / 86_400.0;
        self.reliability() * (-age_days / self.category.half_life_days()).exp2()
    }

    fn age_days(&self, now_secs: u64) -> f64 {
        now_secs.saturating_sub(self.last_touched_at) as f64 / 86_400.0
    }
}

/// Assign a category from the text's dominant signal.
///
/// Order matters: the earlier, more specific signals win over the generic
/// fallbacks further down.
pub fn categorize(text: &str) -> InsightCategory {
    let t = text.to_lowercase();
    if t.contains("i prefer") || t.contains("the user") || t.contains("they want") {
        InsightCategory::UserUnderstanding
    } else if t.contains("explain") || t.contains("tone") || t.contains("wording") || t.contains("phrasing") {
        InsightCategory::Communication
    } else if t.contains("i notice") || t.contains("i tend") || t.contains("my own") {
        InsightCategory::SelfAwareness
    } else if t.contains("learned") || t.contains("insight") || t.contains("lesson") {
        InsightCategory::MetaLearning
    } else if t.contains("brainstorm") || t.contains("creative") || t.contains("alternative idea") {
        InsightCategory::Creativity
    } else if t.contains("always") || t.contains("never") {
        InsightCategory::Wisdom
    } else if t.contains("because") || t.contains(" if ") || t.starts_with("if ") || t.contains("when ") {
        InsightCategory::Reasoning
    } else {
        InsightCategory::Context
    }
}

/// Candidate accepted by the quality gate, ready for upsert.
#[derive(Debug, Clone)]
pub struct InsightCandidate {
    pub category: InsightCategory,
    pub text: String,
    pub context: String,
    pub base_confidence: f64,
    pub tier: Tier,
    pub trigger_tags: Vec<String>,
}

/// What an upsert did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertStatus {
    Inserted,
    Validated,
}

// ---------------------------------------------------------------------------
// Key derivation
// ---------------------------------------------------------------------------

/// Normalize text for keying: lowercase, collapsed whitespace, trimmed
/// trailing punctuation.
pub fn normalize(text: &str) -> String {
    let lowered = text.to_lowercase();
    let collapsed: Vec<&str> = lowered.split_whitespace().collect();
    collapsed
        .join(" ")
        .trim_end_matches(['.', '!', '?'])
        .to_string()
}

/// FNV-1a over the normalized text; stable across processes.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Stable insight key for a (text, category) pair.
pub fn insight_key(text: &str, category: InsightCategory) -> String {
    format!("{}-{:016x}", category.as_str(), fnv1a(normalize(text).as_bytes()))
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Keyed insight map with atomic JSON persistence.
///
/// Interior locking is coarse; the advisor reads whole-map snapshots and
/// never holds the lock across a call.
pub struct InsightStore {
    path: PathBuf,
    map: RwLock<HashMap<String, Insight>>,
    dirty: AtomicBool,
}

impl InsightStore {
    /// Load the snapshot file, or start empty when absent.
    pub fn open(path: PathBuf) -> Result<Self, InsightError> {
        let map: HashMap<String, Insight> = match persist::read_json::<Vec<Insight>>(&path) {
            Ok(Some(list)) => list.into_iter().map(|i| (i.key.clone(), i)).collect(),
            Ok(None) => HashMap::new(),
            Err(e) => {
                return Err(InsightError::Corrupt {
                    message: e.to_string(),
                });
            }
        };
        Ok(Self {
            path,
            map: RwLock::new(map),
            dirty: AtomicBool::new(false),
        })
    }

    /// Idempotent upsert: a present key is validated and touched, an absent
    /// one inserted.
    pub fn add_or_validate(&self, candidate: InsightCandidate) -> (String, UpsertStatus) {
        let key = insight_key(&candidate.text, candidate.category);
        let now = now_secs();
        let mut map = self.map.write().unwrap();
        let status = match map.get_mut(&key) {
            Some(existing) => {
                existing.times_validated += 1;
                existing.last_touched_at = now;
                // A louder restatement can raise, never lower, the prior.
                if candidate.base_confidence > existing.base_confidence {
                    existing.base_confidence = candidate.base_confidence;
                }
                UpsertStatus::Validated
            }
            None => {
                map.insert(
                    key.clone(),
                    Insight {
                        key: key.clone(),
                        category: candidate.category,
                        text: candidate.text,
                        context: candidate.context,
                        base_confidence: candidate.base_confidence.clamp(0.0, 1.0),
                        times_validated: 0,
                        times_contradicted: 0,
                        created_at: now,
                        last_touched_at: now,
                        promoted: false,
                        tier: candidate.tier,
                        trigger_tags: candidate.trigger_tags,
                        embedding: None,
                    },
                );
                UpsertStatus::Inserted
            }
        };
        self.dirty.store(true, Ordering::Relaxed);
        (key, status)
    }

    /// Record a contradiction against an insight.
    pub fn contradict(&self, key: &str) -> Result<(), InsightError> {
        let mut map = self.map.write().unwrap();
        let insight = map.get_mut(key).ok_or_else(|| InsightError::NotFound {
            key: key.to_string(),
        })?;
        insight.times_contradicted += 1;
        insight.last_touched_at = now_secs();
        self.dirty.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Mark an insight promoted (advisor source 4).
    pub fn mark_promoted(&self, key: &str) -> Result<(), InsightError> {
        let mut map = self.map.write().unwrap();
        let insight = map.get_mut(key).ok_or_else(|| InsightError::NotFound {
            key: key.to_string(),
        })?;
        insight.promoted = true;
        self.dirty.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Insights eligible for promotion under the given thresholds.
    pub fn promotion_candidates(&self, min_validations: u64, min_effective: f64) -> Vec<Insight> {
        let now = now_secs();
        let map = self.map.read().unwrap();
        let mut list: Vec<Insight> = map
            .values()
            .filter(|i| {
                !i.promoted
                    && i.times_validated >= min_validations
                    && i.effective_reliability(now) >= min_effective
            })
            .cloned()
            .collect();
        list.sort_by(|a, b| {
            b.effective_reliability(now)
                .partial_cmp(&a.effective_reliability(now))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        list
    }

    /// Remove insights past the age limit or below the reliability floor.
    /// Returns the removed keys.
    pub fn prune(&self, now: u64, max_age_days: f64, min_effective: f64) -> Vec<String> {
        let mut map = self.map.write().unwrap();
        let doomed: Vec<String> = map
            .values()
            .filter(|i| i.age_days(now) > max_age_days || i.effective_reliability(now) < min_effective)
            .map(|i| i.key.clone())
            .collect();
        for key in &doomed {
            map.remove(key);
        }
        if !doomed.is_empty() {
            self.dirty.store(true, Ordering::Relaxed);
        }
        doomed
    }

    /// Candidates above the reliability floor, optionally keyword-filtered.
    /// Ranking is the advisor's job, not the store's.
    pub fn query(&self, query: &str, floor: f64, limit: usize) -> Vec<Insight> {
        let now = now_secs();
        let needle = normalize(query);
        let terms: Vec<&str> = needle.split(' ').filter(|t| t.len() > 2).collect();
        let map = self.map.read().unwrap();
        let mut hits: Vec<Insight> = map
            .values()
            .filter(|i| i.effective_reliability(now) >= floor)
            .filter(|i| {
                terms.is_empty() || {
                    let hay = normalize(&i.text);
                    terms.iter().any(|t| hay.contains(t))
                }
            })
            .cloned()
            .collect();
        hits.sort_by(|a, b| {
            b.effective_reliability(now)
                .partial_cmp(&a.effective_reliability(now))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(limit);
        hits
    }

    /// Consistent point-in-time copy for lock-free readers.
    pub fn snapshot(&self) -> Vec<Insight> {
        self.map.read().unwrap().values().cloned().collect()
    }

    pub fn get(&self, key: &str) -> Option<Insight> {
        self.map.read().unwrap().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.map.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().unwrap().is_empty()
    }

    /// Counts per category, for `status`.
    pub fn category_counts(&self) -> Vec<(&'static str, usize)> {
        let map = self.map.read().unwrap();
        let mut counts: HashMap<&'static str, usize> = HashMap::new();
        for insight in map.values() {
            *counts.entry(insight.category.as_str()).or_insert(0) += 1;
        }
        let mut list: Vec<(&'static str, usize)> = counts.into_iter().collect();
        list.sort();
        list
    }

    /// Persist the snapshot if anything changed since the last write.
    /// In-memory state stays authoritative when the write fails.
    pub fn persist_if_dirty(&self) -> Result<bool, InsightError> {
        if !self.dirty.load(Ordering::Relaxed) {
            return Ok(false);
        }
        let mut list = self.snapshot();
        list.sort_by(|a, b| a.key.cmp(&b.key));
        persist::write_json_atomic(&self.path, &list).map_err(|e| InsightError::Persist {
            path: self.path.display().to_string(),
            source: e,
        })?;
        self.dirty.store(false, Ordering::Relaxed);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(text: &str) -> InsightCandidate {
        InsightCandidate {
            category: InsightCategory::Wisdom,
            text: text.into(),
            context: "test".into(),
            base_confidence: 0.9,
            tier: Tier::Critical,
            trigger_tags: Vec::new(),
        }
    }

    fn store_in(dir: &std::path::Path) -> InsightStore {
        InsightStore::open(dir.join("cognitive_insights.json")).unwrap()
    }

    #[test]
    fn upsert_is_idempotent_on_key() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = store_in(dir.path());

        let (k1, s1) = store.add_or_validate(candidate("Always validate input"));
        assert_eq!(s1, UpsertStatus::Inserted);
        // Same normalized text: different case and trailing punctuation.
        let (k2, s2) = store.add_or_validate(candidate("always  validate INPUT."));
        assert_eq!(s2, UpsertStatus::Validated);
        assert_eq!(k1, k2);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&k1).unwrap().times_validated, 1);
    }

    #[test]
    fn n_upserts_yield_one_insight_with_n_minus_one_validations() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = store_in(dir.path());
        for _ in 0..5 {
            store.add_or_validate(candidate("prefer small commits"));
        }
        assert_eq!(store.len(), 1);
        let key = insight_key("prefer small commits", InsightCategory::Wisdom);
        assert_eq!(store.get(&key).unwrap().times_validated, 4);
    }

    #[test]
    fn reliability_decays_monotonically_with_age() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = store_in(dir.path());
        let (key, _) = store.add_or_validate(candidate("fresh wisdom"));
        let insight = store.get(&key).unwrap();
        let now = insight.last_touched_at;
        let mut previous = f64::INFINITY;
        for days in [0u64, 10, 50, 180, 400] {
            let eff = insight.effective_reliability(now + days * 86_400);
            assert!(eff <= previous, "decay must be monotone in age");
            previous = eff;
        }
        // At one half-life, effective reliability is half the undecayed value.
        let half = insight.effective_reliability(now + 180 * 86_400);
        assert!((half - insight.reliability() * 0.5).abs() < 1e-9);
    }

    #[test]
    fn contradictions_push_reliability_down() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = store_in(dir.path());
        let (key, _) = store.add_or_validate(candidate("disputed claim"));
        let before = store.get(&key).unwrap().reliability();
        store.contradict(&key).unwrap();
        let after = store.get(&key).unwrap().reliability();
        assert!(after < before);
    }

    #[test]
    fn prune_removes_stale_and_unreliable() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = store_in(dir.path());
        let (key, _) = store.add_or_validate(candidate("short lived"));
        let now = store.get(&key).unwrap().last_touched_at;
        // Not pruned while fresh.
        assert!(store.prune(now, 365.0, 0.05).is_empty());
        // Pruned after exceeding max age.
        let removed = store.prune(now + 400 * 86_400, 365.0, 0.05);
        assert_eq!(removed, vec![key]);
        assert!(store.is_empty());
    }

    #[test]
    fn query_filters_by_floor_and_terms() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = store_in(dir.path());
        store.add_or_validate(candidate("always validate database input"));
        store.add_or_validate(candidate("prefer feature branches"));

        let hits = store.query("database operations", 0.1, 10);
        assert_eq!(hits.len(), 1);
        assert!(hits[0].text.contains("database"));

        // Impossibly high floor filters everything.
        assert!(store.query("database", 1.1, 10).is_empty());
    }

    #[test]
    fn persist_and_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("cognitive_insights.json");
        {
            let store = InsightStore::open(path.clone()).unwrap();
            store.add_or_validate(candidate("durable wisdom"));
            assert!(store.persist_if_dirty().unwrap());
            // Second call is a no-op.
            assert!(!store.persist_if_dirty().unwrap());
        }
        let store = InsightStore::open(path).unwrap();
        assert_eq!(store.len(), 1);
        let key = insight_key("durable wisdom", InsightCategory::Wisdom);
        assert!(store.get(&key).is_some());
    }

    #[test]
    fn promotion_candidates_respect_thresholds() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = store_in(dir.path());
        for _ in 0..4 {
            store.add_or_validate(candidate("battle-tested rule"));
        }
        store.add_or_validate(candidate("once-seen remark"));

        let eligible = store.promotion_candidates(3, 0.7);
        assert_eq!(eligible.len(), 1);
        assert!(eligible[0].text.contains("battle-tested"));

        store.mark_promoted(&eligible[0].key).unwrap();
        assert!(store.promotion_candidates(3, 0.7).is_empty());
    }
}
