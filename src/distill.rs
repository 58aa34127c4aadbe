//! Distillation: converts completed steps into durable typed rules.
//!
//! Steps are clustered by intent signature and tool; each cluster that clears
//! its occurrence floor is classified into one of five rule types with an
//! initial confidence derived from the cluster's success ratio. Rules
//! revalidate against later outcomes under a settling window, with monotone
//! confidence moves in each direction.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::Tuneables;
use crate::eidos::{Step, StepEvaluation};
use crate::error::DistillError;
use crate::event::now_secs;
use crate::insight::normalize;
use crate::persist;

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// The five rule types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    Heuristic,
    SharpEdge,
    AntiPattern,
    Playbook,
    Policy,
}

impl RuleType {
    pub fn as_str(self) -> &'static str {
        match self {
            RuleType::Heuristic => "heuristic",
            RuleType::SharpEdge => "sharp_edge",
            RuleType::AntiPattern => "anti_pattern",
            RuleType::Playbook => "playbook",
            RuleType::Policy => "policy",
        }
    }
}

/// Where a rule applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleScope {
    Global,
    Project,
    Session,
}

/// A durable typed rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Distillation {
    /// Stable id derived from type + statement.
    pub id: String,
    pub rule_type: RuleType,
    pub statement: String,
    pub trigger_keywords: Vec<String>,
    pub confidence: f64,
    pub validation_count: u64,
    pub contradiction_count: u64,
    pub times_retrieved: u64,
    pub times_used: u64,
    pub times_helped: u64,
    pub source_step_ids: Vec<String>,
    pub scope: RuleScope,
    pub created_at: u64,
    /// Earliest time the next revalidation may move confidence.
    pub next_revalidate_at: u64,
}

/// Confidence ceiling after revalidations.
const CONFIDENCE_CAP: f64 = 0.98;
/// Confidence floor after contradictions.
const CONFIDENCE_FLOOR: f64 = 0.05;

impl Distillation {
    /// Apply a correlated helpful outcome. Confidence moves only after the
    /// settling window has elapsed; retrieval counters always move.
    pub fn record_helpful(&mut self, now: u64, window_secs: u64) {
        self.times_helped += 1;
        if now >= self.next_revalidate_at {
            self.confidence = (self.confidence + 0.05).min(CONFIDENCE_CAP);
            self.validation_count += 1;
            self.next_revalidate_at = now + window_secs;
        }
    }

    /// Apply a contradicting outcome.
    pub fn record_contradiction(&mut self, now: u64, window_secs: u64) {
        self.contradiction_count += 1;
        self.confidence = (self.confidence - 0.10).max(CONFIDENCE_FLOOR);
        self.next_revalidate_at = now + window_secs;
    }
}

/// Stable rule id: type + FNV of the normalized statement.
pub fn rule_id(rule_type: RuleType, statement: &str) -> String {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in normalize(statement).as_bytes() {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    format!("{}-{hash:016x}", rule_type.as_str())
}

// ---------------------------------------------------------------------------
// Clustering & classification
// ---------------------------------------------------------------------------

/// First tokens of the normalized intent; steps sharing it belong together.
fn intent_signature(intent: &str) -> String {
    normalize(intent)
        .split(' ')
        .filter(|t| t.len() > 2)
        .take(4)
        .collect::<Vec<_>>()
        .join(" ")
}

fn keywords(intent: &str, tool: &str) -> Vec<String> {
    let mut seen = std::collections::BTreeSet::new();
    seen.insert(tool.to_lowercase());
    for token in normalize(intent).split(' ') {
        if token.len() > 3 {
            seen.insert(token.to_string());
        }
    }
    seen.into_iter().take(6).collect()
}

struct Cluster<'a> {
    signature: String,
    tool: String,
    steps: Vec<&'a Step>,
}

impl Cluster<'_> {
    fn passes(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| {
                s.result
                    .as_ref()
                    .is_some_and(|r| r.evaluation == StepEvaluation::Pass)
            })
            .count()
    }

    fn fails(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| {
                s.result
                    .as_ref()
                    .is_some_and(|r| r.evaluation == StepEvaluation::Fail)
            })
            .count()
    }

    fn success_ratio(&self) -> f64 {
        if self.steps.is_empty() {
            return 0.0;
        }
        self.passes() as f64 / self.steps.len() as f64
    }

    fn step_ids(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.id.clone()).collect()
    }

    /// A lesson bullet containing an explicit always/never statement.
    fn policy_lesson(&self) -> Option<String> {
        self.steps.iter().find_map(|s| {
            s.result.as_ref().and_then(|r| {
                r.lesson.iter().find_map(|bullet| {
                    let lower = bullet.to_lowercase();
                    (lower.contains("always ") || lower.contains("never "))
                        .then(|| bullet.clone())
                })
            })
        })
    }

    /// A confidently predicted step that failed anyway.
    fn surprise_fail(&self) -> Option<&Step> {
        self.steps.iter().copied().find(|s| {
            s.plan.confidence_before >= 0.6
                && s.result
                    .as_ref()
                    .is_some_and(|r| r.evaluation == StepEvaluation::Fail)
        })
    }
}

/// Run one distillation pass over completed steps.
///
/// Deterministic: the same step set produces the same rule ids.
pub fn distill(steps: &[Step], tuneables: &Tuneables) -> Vec<Distillation> {
    let now = now_secs();
    let mut clusters: BTreeMap<(String, String), Cluster<'_>> = BTreeMap::new();
    for step in steps.iter().filter(|s| s.is_complete()) {
        let signature = intent_signature(&step.plan.intent);
        let key = (signature.clone(), step.plan.tool.clone());
        clusters
            .entry(key)
            .or_insert_with(|| Cluster {
                signature,
                tool: step.plan.tool.clone(),
                steps: Vec::new(),
            })
            .steps
            .push(step);
    }

    let mut rules = Vec::new();
    for cluster in clusters.values() {
        let occurrences = cluster.steps.len() as u64;

        // Policies come from explicit user-stated absolutes and need only a
        // single occurrence.
        if let Some(lesson) = cluster.policy_lesson() {
            let statement = lesson;
            rules.push(make_rule(
                RuleType::Policy,
                statement,
                cluster,
                0.9,
                RuleScope::Global,
                now,
                tuneables,
            ));
            continue;
        }

        if occurrences < tuneables.distill_min_occurrences {
            // Sharp edges still distill from one confident failure.
            if let Some(step) = cluster.surprise_fail() {
                let reason = step
                    .result
                    .as_ref()
                    .and_then(|r| r.error_signature.clone())
                    .unwrap_or_else(|| "it failed against a confident prediction".into());
                let statement = format!(
                    "Gotcha: {} while trying to {}: {}",
                    cluster.tool, cluster.signature, reason
                );
                let confidence = (0.85f64 * 0.8).min(1.0);
                rules.push(make_rule(
                    RuleType::SharpEdge,
                    statement,
                    cluster,
                    confidence,
                    RuleScope::Project,
                    now,
                    tuneables,
                ));
            }
            continue;
        }

        let ratio = cluster.success_ratio();
        if let Some(step) = cluster.surprise_fail() {
            let reason = step
                .result
                .as_ref()
                .and_then(|r| r.error_signature.clone())
                .unwrap_or_else(|| "it failed against a confident prediction".into());
            let statement = format!(
                "Gotcha: {} while trying to {}: {}",
                cluster.tool, cluster.signature, reason
            );
            rules.push(make_rule(
                RuleType::SharpEdge,
                statement,
                cluster,
                (ratio.max(0.5)) * 0.85,
                RuleScope::Project,
                now,
                tuneables,
            ));
        }

        if ratio >= tuneables.distill_min_confidence {
            let statement = format!(
                "When the goal is to {}, use {} (worked {} of {} times)",
                cluster.signature,
                cluster.tool,
                cluster.passes(),
                cluster.steps.len()
            );
            rules.push(make_rule(
                RuleType::Heuristic,
                statement,
                cluster,
                ratio,
                RuleScope::Project,
                now,
                tuneables,
            ));
        } else if ratio <= 0.3 && cluster.fails() >= 2 {
            let statement = format!(
                "Avoid {} for {}: failed {} of {} attempts",
                cluster.tool,
                cluster.signature,
                cluster.fails(),
                cluster.steps.len()
            );
            rules.push(make_rule(
                RuleType::AntiPattern,
                statement,
                cluster,
                (1.0 - ratio) * 0.9,
                RuleScope::Project,
                now,
                tuneables,
            ));
        }
    }

    // Playbooks: tool sequences that carried an episode to success, seen at
    // least twice across episodes.
    rules.extend(playbooks(steps, now, tuneables));

    rules
}

/// Tool sequences from successful episodes, distilled when the same sequence
/// produced success at least twice.
fn playbooks(steps: &[Step], now: u64, tuneables: &Tuneables) -> Vec<Distillation> {
    let mut by_episode: BTreeMap<&str, Vec<&Step>> = BTreeMap::new();
    for step in steps.iter().filter(|s| s.is_complete()) {
        by_episode.entry(step.episode_id.as_str()).or_default().push(step);
    }

    // Sequence -> (episodes seen, sample steps, passes).
    let mut sequences: BTreeMap<String, (u64, Vec<String>, String)> = BTreeMap::new();
    for episode_steps in by_episode.values() {
        let succeeded = episode_steps.iter().any(|s| {
            s.result
                .as_ref()
                .is_some_and(|r| r.evaluation == StepEvaluation::Pass)
        });
        if !succeeded || episode_steps.len() < 2 {
            continue;
        }
        let tools: Vec<&str> = episode_steps.iter().map(|s| s.plan.tool.as_str()).collect();
        let sequence = tools.join(" -> ");
        let intent = intent_signature(&episode_steps[0].plan.intent);
        let entry = sequences.entry(sequence).or_insert((0, Vec::new(), intent));
        entry.0 += 1;
        entry
            .1
            .extend(episode_steps.iter().map(|s| s.id.clone()));
    }

    sequences
        .into_iter()
        .filter(|(_, (count, _, _))| *count >= 2)
        .map(|(sequence, (_count, step_ids, intent))| {
            let statement = format!("For {intent}: run {sequence}");
            let success_ratio: f64 = 1.0; // only successful episodes were counted
            let confidence = (0.5 + success_ratio * 0.4).min(0.9);
            let id = rule_id(RuleType::Playbook, &statement);
            Distillation {
                id,
                rule_type: RuleType::Playbook,
                statement: statement.clone(),
                trigger_keywords: keywords(&intent, ""),
                confidence,
                validation_count: 0,
                contradiction_count: 0,
                times_retrieved: 0,
                times_used: 0,
                times_helped: 0,
                source_step_ids: step_ids,
                scope: RuleScope::Project,
                created_at: now,
                next_revalidate_at: now + tuneables.distill_revalidate_window_secs,
            }
        })
        .collect()
}

fn make_rule(
    rule_type: RuleType,
    statement: String,
    cluster: &Cluster<'_>,
    confidence: f64,
    scope: RuleScope,
    now: u64,
    tuneables: &Tuneables,
) -> Distillation {
    Distillation {
        id: rule_id(rule_type, &statement),
        rule_type,
        statement: statement.clone(),
        trigger_keywords: keywords(&cluster.signature, &cluster.tool),
        confidence: confidence.clamp(CONFIDENCE_FLOOR, CONFIDENCE_CAP),
        validation_count: 0,
        contradiction_count: 0,
        times_retrieved: 0,
        times_used: 0,
        times_helped: 0,
        source_step_ids: cluster.step_ids(),
        scope,
        created_at: now,
        next_revalidate_at: now + tuneables.distill_revalidate_window_secs,
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Directory-backed rule store, one JSON file per rule id.
pub struct DistillStore {
    dir: PathBuf,
}

impl DistillStore {
    pub fn open(dir: PathBuf) -> Result<Self, DistillError> {
        std::fs::create_dir_all(&dir).map_err(|e| DistillError::Persist {
            path: dir.display().to_string(),
            source: e,
        })?;
        Ok(Self { dir })
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Persist a rule; an existing rule with the same id keeps its counters
    /// and confidence (re-distillation does not reset learning).
    pub fn upsert(&self, rule: &Distillation) -> Result<bool, DistillError> {
        let path = self.path_for(&rule.id);
        if persist::read_json::<Distillation>(&path)
            .ok()
            .flatten()
            .is_some()
        {
            return Ok(false);
        }
        persist::write_json_atomic(&path, rule).map_err(|e| DistillError::Persist {
            path: path.display().to_string(),
            source: e,
        })?;
        Ok(true)
    }

    /// Overwrite a rule after a counter/confidence update.
    pub fn update(&self, rule: &Distillation) -> Result<(), DistillError> {
        let path = self.path_for(&rule.id);
        persist::write_json_atomic(&path, rule).map_err(|e| DistillError::Persist {
            path: path.display().to_string(),
            source: e,
        })
    }

    pub fn get(&self, id: &str) -> Result<Distillation, DistillError> {
        persist::read_json(&self.path_for(id))
            .ok()
            .flatten()
            .ok_or_else(|| DistillError::NotFound { id: id.to_string() })
    }

    /// All stored rules, sorted by id. Malformed files are skipped.
    pub fn load_all(&self) -> Vec<Distillation> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(_) => return Vec::new(),
        };
        let mut rules: Vec<Distillation> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .filter_map(|p| persist::read_json::<Distillation>(&p).ok().flatten())
            .collect();
        rules.sort_by(|a, b| a.id.cmp(&b.id));
        rules
    }

    pub fn count(&self) -> usize {
        self.load_all().len()
    }
}
