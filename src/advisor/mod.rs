//! Advisor: hybrid retrieval over every learning store, fusion ranking,
//! diversification, and the post-action feedback loop.
//!
//! Candidates come from cognitive insights, distillations, explicit trigger
//! rules, promoted insights, and an optional external memory adapter. The
//! advisor only ever reads snapshots; confidence and counter updates flow
//! back through the owning stores.

pub mod effectiveness;
pub mod fusion;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::config::Tuneables;
use crate::distill::Distillation;
use crate::error::AdvisorError;
use crate::event::{OutcomeStatus, now_ms};
use crate::insight::{Insight, normalize};
use crate::persist;
use crate::triggers::TriggerSet;

pub use effectiveness::EffectivenessBook;
pub use fusion::{FusionSignals, FusionWeights, fusion_score, select_diverse};

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// Where a piece of advice came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdviceSource {
    Cognitive,
    Distillation,
    InsightBank,
    Trigger,
    Promoted,
}

impl AdviceSource {
    pub fn as_str(self) -> &'static str {
        match self {
            AdviceSource::Cognitive => "cognitive",
            AdviceSource::Distillation => "distillation",
            AdviceSource::InsightBank => "insight-bank",
            AdviceSource::Trigger => "trigger",
            AdviceSource::Promoted => "promoted",
        }
    }
}

/// One ranked piece of advice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Advice {
    pub id: String,
    pub session_id: String,
    pub tool: String,
    pub input_hints: String,
    pub context_hash: String,
    pub source: AdviceSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insight_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distillation_id: Option<String>,
    pub text: String,
    pub reliability: f64,
    pub fusion_score: f64,
    /// Human-readable ranking explanation.
    pub why: String,
    /// Critical trigger rules may ask the host to interrupt.
    #[serde(default)]
    pub interrupt: bool,
    pub produced_at_ms: u64,
}

/// A pending tool call to advise on.
#[derive(Debug, Clone)]
pub struct AdviceRequest<'a> {
    pub session_id: &'a str,
    pub tool: &'a str,
    pub input_hints: &'a str,
    pub context: &'a str,
}

/// Advice correlated with an observed outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub advice_id: String,
    pub followed: bool,
    /// None when the outcome signal was ambiguous.
    pub helpful: Option<bool>,
    pub tool: String,
    pub session_id: String,
    pub ts_ms: u64,
}

/// What an outcome report resolved to. The caller applies the store updates.
#[derive(Debug, Default)]
pub struct CorrelationResult {
    pub records: Vec<OutcomeRecord>,
    /// (distillation id, helpful) pairs to fold into rule confidence.
    pub distillation_updates: Vec<(String, bool)>,
    /// (insight key, helpful) pairs to validate or contradict.
    pub insight_updates: Vec<(String, bool)>,
}

/// Lines of the rolling advice log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AdviceLogLine {
    Advice(Advice),
    Outcome(OutcomeRecord),
}

/// Parent/orchestrator tools an outcome may fall back to when the reported
/// tool has no direct advice entries.
const PARENT_TOOLS: &[&str] = &["task", "agent", "subagent", "orchestrator", "dispatch_agent"];

/// A query source the external memory adapter implements.
pub trait MemorySource {
    /// Query-only; must respect its own timeouts and never block the caller
    /// beyond them.
    fn query(&self, text: &str, limit: usize) -> Vec<ExternalMemory>;
}

/// A memory returned by the external adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalMemory {
    pub text: String,
    pub score: f64,
}

// ---------------------------------------------------------------------------
// Advisor
// ---------------------------------------------------------------------------

struct CachedAdvice {
    expires_at_ms: u64,
    items: Vec<Advice>,
}

/// The advisor service.
pub struct Advisor {
    advice_log: PathBuf,
    effectiveness: EffectivenessBook,
    cache: DashMap<u64, CachedAdvice>,
    advice_counter: AtomicU64,
}

impl Advisor {
    pub fn new(advice_log: PathBuf, effectiveness_path: PathBuf) -> Self {
        Self {
            advice_log,
            effectiveness: EffectivenessBook::open(effectiveness_path),
            cache: DashMap::new(),
            advice_counter: AtomicU64::new(1),
        }
    }

    pub fn effectiveness(&self) -> &EffectivenessBook {
        &self.effectiveness
    }

    /// Return at most `max_advice_items` ranked advice entries for a pending
    /// tool call.
    pub fn advise(
        &self,
        request: &AdviceRequest<'_>,
        insights: &[Insight],
        distillations: &[Distillation],
        triggers: &TriggerSet,
        external: Option<&dyn MemorySource>,
        tuneables: &Tuneables,
    ) -> Vec<Advice> {
        let query = build_query(request);
        let cache_key = fnv64(&format!(
            "{}|{}|{}|{}",
            request.tool, request.input_hints, request.context, query
        ));
        let now = now_ms();

        if let Some(cached) = self.cache.get(&cache_key) {
            if cached.expires_at_ms > now {
                return cached.items.clone();
            }
        }
        self.cache.remove(&cache_key);

        let limit = tuneables.max_advice_items as usize;
        let overfetch = limit * tuneables.advisor_overfetch_factor.max(1) as usize;
        let weights = FusionWeights {
            outcome_weight: tuneables.advisor_outcome_weight,
            recency_weight: tuneables.advisor_recency_weight,
        };
        let context_hash = format!("{:016x}", fnv64(request.context));
        let now_secs = now / 1_000;

        let mut candidates: Vec<RankedAdvice> = Vec::new();

        // 1. Explicit trigger rules (bypass the similarity gate).
        for rule in triggers.matching(&query) {
            let outcome = self.effectiveness.outcome_score("trigger", request.tool);
            let signals = FusionSignals {
                trigger_conf: 1.0,
                semantic_sim: 1.0,
                recency: 1.0,
                outcome,
                priority_bonus: rule.spec.priority.bonus(),
                source_boost: source_boost(tuneables, AdviceSource::Trigger),
            };
            let score = fusion_score(&signals, &weights);
            candidates.push(self.make_candidate(
                request,
                &context_hash,
                AdviceSource::Trigger,
                None,
                None,
                rule.spec.advice.clone(),
                1.0,
                score,
                format!("Trigger rule \"{}\" matched", rule.spec.rule_name),
                rule.spec.interrupt,
            ));
        }

        // 2. Cognitive and promoted insights.
        for insight in insights.iter().take(4_096) {
            let sim = query_similarity(&query, &insight.text);
            if sim < tuneables.advisor_min_similarity {
                continue;
            }
            let source = if insight.promoted {
                AdviceSource::Promoted
            } else {
                AdviceSource::Cognitive
            };
            let outcome = self.effectiveness.outcome_score(source.as_str(), request.tool);
            let age_days = now_secs.saturating_sub(insight.last_touched_at) as f64 / 86_400.0;
            let signals = FusionSignals {
                trigger_conf: 0.0,
                semantic_sim: sim,
                recency: 1.0 / (1.0 + age_days),
                outcome,
                priority_bonus: 0.0,
                source_boost: source_boost(tuneables, source),
            };
            let score = fusion_score(&signals, &weights);
            candidates.push(self.make_candidate(
                request,
                &context_hash,
                source,
                Some(insight.key.clone()),
                None,
                insight.text.clone(),
                insight.effective_reliability(now_secs),
                score,
                format!("Semantic match {sim:.2} on {} insight", insight.category.as_str()),
                false,
            ));
        }

        // 3. Distillations whose triggers overlap the query.
        let query_tokens: std::collections::HashSet<String> =
            normalize(&query).split(' ').map(str::to_string).collect();
        for rule in distillations.iter().take(4_096) {
            let overlap = rule
                .trigger_keywords
                .iter()
                .filter(|k| query_tokens.contains(*k))
                .count();
            let sim = if rule.trigger_keywords.is_empty() {
                0.0
            } else {
                (overlap as f64 / rule.trigger_keywords.len() as f64)
                    .max(query_similarity(&query, &rule.statement))
            };
            if sim < tuneables.advisor_min_similarity {
                continue;
            }
            let outcome = self
                .effectiveness
                .outcome_score("distillation", request.tool);
            let age_days = now_secs.saturating_sub(rule.created_at) as f64 / 86_400.0;
            let signals = FusionSignals {
                trigger_conf: 0.0,
                semantic_sim: sim * rule.confidence,
                recency: 1.0 / (1.0 + age_days),
                outcome,
                priority_bonus: 0.0,
                source_boost: source_boost(tuneables, AdviceSource::Distillation),
            };
            let score = fusion_score(&signals, &weights);
            candidates.push(self.make_candidate(
                request,
                &context_hash,
                AdviceSource::Distillation,
                None,
                Some(rule.id.clone()),
                rule.statement.clone(),
                rule.confidence,
                score,
                format!("Semantic match {sim:.2} on {} rule", rule.rule_type.as_str()),
                false,
            ));
        }

        // 4. External memory adapter (query-only).
        if let Some(adapter) = external {
            for memory in adapter.query(&query, limit) {
                let sim = memory.score.clamp(0.0, 1.0);
                if sim < tuneables.advisor_min_similarity {
                    continue;
                }
                let outcome = self
                    .effectiveness
                    .outcome_score("insight-bank", request.tool);
                let signals = FusionSignals {
                    trigger_conf: 0.0,
                    semantic_sim: sim,
                    recency: 0.5,
                    outcome,
                    priority_bonus: 0.0,
                    source_boost: source_boost(tuneables, AdviceSource::InsightBank),
                };
                let score = fusion_score(&signals, &weights);
                candidates.push(self.make_candidate(
                    request,
                    &context_hash,
                    AdviceSource::InsightBank,
                    None,
                    None,
                    memory.text,
                    sim,
                    score,
                    format!("Semantic match {sim:.2} from external memory"),
                    false,
                ));
            }
        }

        // Fusion-score gate, over-fetch bound, then diversification.
        candidates.retain(|c| c.advice.fusion_score >= tuneables.min_rank_score);
        candidates.sort_by(|a, b| {
            b.advice
                .fusion_score
                .partial_cmp(&a.advice.fusion_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates.truncate(overfetch);

        let selected = select_diverse(
            candidates,
            limit,
            tuneables.advisor_mmr_lambda,
            tuneables.advisor_source_cap as usize,
        );
        let items: Vec<Advice> = selected.into_iter().map(|c| c.advice).collect();

        self.log_advice(&items);
        self.cache.insert(
            cache_key,
            CachedAdvice {
                expires_at_ms: now + tuneables.advisor_cache_ttl_secs * 1_000,
                items: items.clone(),
            },
        );
        items
    }

    /// Correlate an observed outcome with recently logged advice.
    ///
    /// Matches by session + tool within the correlation window; when the tool
    /// has no direct entries, falls back to advice logged under a parent
    /// orchestrator tool in the same session (case-insensitive).
    pub fn report_outcome(
        &self,
        tool: &str,
        session: &str,
        outcome: OutcomeStatus,
        tuneables: &Tuneables,
    ) -> Result<CorrelationResult, AdvisorError> {
        let now = now_ms();
        let window_ms = tuneables.advisor_outcome_window_secs * 1_000;
        let lines = persist::tail_lines(&self.advice_log, 512, 64 * 1024)
            .map_err(|e| AdvisorError::LogIo { source: e })?;

        // Each advice entry correlates at most once; outcome lines in the
        // log mark the ones already resolved.
        let mut already_reported: std::collections::HashSet<String> =
            std::collections::HashSet::new();
        let mut advice_entries: Vec<Advice> = Vec::new();
        for line in &lines {
            match serde_json::from_str::<AdviceLogLine>(line) {
                Ok(AdviceLogLine::Outcome(o)) => {
                    already_reported.insert(o.advice_id);
                }
                Ok(AdviceLogLine::Advice(a)) => {
                    if a.session_id == session
                        && now.saturating_sub(a.produced_at_ms) <= window_ms
                    {
                        advice_entries.push(a);
                    }
                }
                Err(_) => {}
            }
        }
        advice_entries.retain(|a| !already_reported.contains(&a.id));

        let has_direct = advice_entries
            .iter()
            .any(|a| a.tool.eq_ignore_ascii_case(tool));
        let matched: Vec<Advice> = if has_direct {
            advice_entries
                .into_iter()
                .filter(|a| a.tool.eq_ignore_ascii_case(tool))
                .collect()
        } else {
            advice_entries
                .into_iter()
                .filter(|a| {
                    PARENT_TOOLS
                        .iter()
                        .any(|parent| a.tool.eq_ignore_ascii_case(parent))
                })
                .collect()
        };

        let helpful = match outcome {
            OutcomeStatus::Success => Some(true),
            OutcomeStatus::Failure => Some(false),
            OutcomeStatus::Partial | OutcomeStatus::Unknown => None,
        };

        let mut result = CorrelationResult::default();
        for advice in matched {
            let followed = true;
            self.effectiveness
                .record_outcome(advice.source.as_str(), tool, followed, helpful);
            let record = OutcomeRecord {
                advice_id: advice.id.clone(),
                followed,
                helpful,
                tool: tool.to_string(),
                session_id: session.to_string(),
                ts_ms: now,
            };
            if let Ok(line) = serde_json::to_string(&AdviceLogLine::Outcome(record.clone())) {
                let _ = persist::append_line(&self.advice_log, &line);
            }
            if let (Some(id), Some(h)) = (&advice.distillation_id, helpful) {
                result.distillation_updates.push((id.clone(), h));
            }
            if let (Some(key), Some(h)) = (&advice.insight_key, helpful) {
                result.insight_updates.push((key.clone(), h));
            }
            result.records.push(record);
        }
        Ok(result)
    }

    /// Recompute the given-side ground truth from the advice log and repair
    /// any `followed > given` corruption. Returns the violations found.
    pub fn verify_integrity(&self) -> Vec<AdvisorError> {
        let mut given: std::collections::BTreeMap<String, u64> = std::collections::BTreeMap::new();
        if let Ok(lines) = persist::tail_lines(&self.advice_log, 2_048, 64 * 1024) {
            for line in lines {
                if let Ok(AdviceLogLine::Advice(a)) = serde_json::from_str::<AdviceLogLine>(&line) {
                    *given.entry(a.source.as_str().to_string()).or_insert(0) += 1;
                }
            }
        }
        let violations = self.effectiveness.verify_and_repair(&given);
        for violation in &violations {
            tracing::warn!(error = %violation, "advisor counters repaired from advice log");
        }
        violations
    }

    /// Persist the effectiveness counters.
    pub fn persist(&self) -> Result<(), AdvisorError> {
        self.effectiveness.save()
    }

    /// Drop expired cache entries.
    pub fn sweep_cache(&self) {
        let now = now_ms();
        self.cache.retain(|_, cached| cached.expires_at_ms > now);
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn make_candidate(
        &self,
        request: &AdviceRequest<'_>,
        context_hash: &str,
        source: AdviceSource,
        insight_key: Option<String>,
        distillation_id: Option<String>,
        text: String,
        reliability: f64,
        score: f64,
        why: String,
        interrupt: bool,
    ) -> RankedAdvice {
        let n = self.advice_counter.fetch_add(1, Ordering::Relaxed);
        RankedAdvice {
            advice: Advice {
                id: format!("adv-{:x}-{n:x}", now_ms()),
                session_id: request.session_id.to_string(),
                tool: request.tool.to_string(),
                input_hints: request.input_hints.to_string(),
                context_hash: context_hash.to_string(),
                source,
                insight_key,
                distillation_id,
                text,
                reliability,
                fusion_score: score,
                why,
                interrupt,
                produced_at_ms: now_ms(),
            },
        }
    }

    fn log_advice(&self, items: &[Advice]) {
        for advice in items {
            self.effectiveness
                .record_given(advice.source.as_str(), &advice.tool);
            match serde_json::to_string(&AdviceLogLine::Advice(advice.clone())) {
                Ok(line) => {
                    if let Err(e) = persist::append_line(&self.advice_log, &line) {
                        tracing::warn!(error = %e, "advice log append failed");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "advice serialization failed"),
            }
        }
    }
}

/// Wrapper implementing the diversification trait.
struct RankedAdvice {
    advice: Advice,
}

impl fusion::Rankable for RankedAdvice {
    fn score(&self) -> f64 {
        self.advice.fusion_score
    }
    fn text(&self) -> &str {
        &self.advice.text
    }
    fn source_tag(&self) -> &str {
        self.advice.source.as_str()
    }
}

/// Query-to-document similarity: token overlap normalized by the smaller
/// side. More forgiving than the Jaccard used for duplicate detection, which
/// punishes short queries against long learnings.
fn query_similarity(query: &str, text: &str) -> f64 {
    let nq = normalize(query);
    let nt = normalize(text);
    let query_tokens: std::collections::HashSet<&str> =
        nq.split(' ').filter(|t| t.len() > 2).collect();
    let text_tokens: std::collections::HashSet<&str> =
        nt.split(' ').filter(|t| t.len() > 2).collect();
    if query_tokens.is_empty() || text_tokens.is_empty() {
        return 0.0;
    }
    let intersection = query_tokens.intersection(&text_tokens).count() as f64;
    intersection / query_tokens.len().min(text_tokens.len()) as f64
}

/// Intent extraction: tool name + context + normalized input hints.
fn build_query(request: &AdviceRequest<'_>) -> String {
    let mut query = String::new();
    query.push_str(request.tool);
    query.push(' ');
    query.push_str(request.context);
    query.push(' ');
    query.push_str(&normalize(request.input_hints));
    query
}

/// FNV-1a, used for cache keys and context hashes. Never includes raw
/// timestamps.
fn fnv64(text: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in text.as_bytes() {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

fn source_boost(tuneables: &Tuneables, source: AdviceSource) -> f64 {
    tuneables
        .advisor_source_boosts
        .get(source.as_str())
        .copied()
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insight::{InsightCandidate, InsightCategory, InsightStore};
    use crate::scorer::Tier;
    use crate::triggers::{TriggerPriority, TriggerRuleSpec, TriggerSet};

    fn advisor(dir: &std::path::Path) -> Advisor {
        Advisor::new(
            dir.join("advice_log.jsonl"),
            dir.join("effectiveness.json"),
        )
    }

    fn insights_with(texts: &[&str]) -> Vec<Insight> {
        let dir = tempfile::TempDir::new().unwrap();
        let store = InsightStore::open(dir.path().join("i.json")).unwrap();
        for text in texts {
            store.add_or_validate(InsightCandidate {
                category: InsightCategory::Wisdom,
                text: text.to_string(),
                context: "test".into(),
                base_confidence: 0.9,
                tier: Tier::Critical,
                trigger_tags: Vec::new(),
            });
        }
        store.snapshot()
    }

    fn request<'a>(tool: &'a str, context: &'a str) -> AdviceRequest<'a> {
        AdviceRequest {
            session_id: "s1",
            tool,
            input_hints: "",
            context,
        }
    }

    #[test]
    fn returns_at_most_max_items() {
        let dir = tempfile::TempDir::new().unwrap();
        let adv = advisor(dir.path());
        let texts: Vec<String> = (0..12)
            .map(|i| format!("database advice variant {i}: validate table {i} writes"))
            .collect();
        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        let insights = insights_with(&refs);
        let items = adv.advise(
            &request("Bash", "database operations"),
            &insights,
            &[],
            &TriggerSet::default(),
            None,
            &Tuneables::default(),
        );
        assert!(items.len() <= 6);
    }

    #[test]
    fn relevant_insight_is_surfaced_with_semantic_why() {
        let dir = tempfile::TempDir::new().unwrap();
        let adv = advisor(dir.path());
        let insights = insights_with(&["Always validate input before database operations"]);
        let items = adv.advise(
            &request("Bash", "run the database migration"),
            &insights,
            &[],
            &TriggerSet::default(),
            None,
            &Tuneables::default(),
        );
        assert!(!items.is_empty());
        assert!(items[0].text.contains("database"));
        assert!(items[0].why.starts_with("Semantic") || items[0].why.starts_with("Trigger"));
    }

    #[test]
    fn trigger_rules_rank_first_and_carry_interrupt() {
        let dir = tempfile::TempDir::new().unwrap();
        let adv = advisor(dir.path());
        let triggers = TriggerSet::from_specs(vec![TriggerRuleSpec {
            pattern: "(?i)drop".into(),
            rule_name: "no-drop".into(),
            priority: TriggerPriority::Critical,
            interrupt: true,
            advice: "Never drop tables in place".into(),
        }]);
        let insights = insights_with(&["prefer database transactions for multi row writes"]);
        let items = adv.advise(
            &request("Bash", "drop the old database table"),
            &insights,
            &[],
            &triggers,
            None,
            &Tuneables::default(),
        );
        assert_eq!(items[0].source, AdviceSource::Trigger);
        assert!(items[0].interrupt);
        assert!(items[0].why.starts_with("Trigger"));
        assert!(items[0].fusion_score >= 0.9);
    }

    #[test]
    fn per_source_cap_limits_single_source() {
        let dir = tempfile::TempDir::new().unwrap();
        let adv = advisor(dir.path());
        let texts: Vec<String> = (0..8)
            .map(|i| format!("database rule {i}: always check constraint {i} before insert"))
            .collect();
        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        let insights = insights_with(&refs);
        let items = adv.advise(
            &request("Bash", "database insert"),
            &insights,
            &[],
            &TriggerSet::default(),
            None,
            &Tuneables::default(),
        );
        let cognitive = items
            .iter()
            .filter(|a| a.source == AdviceSource::Cognitive)
            .count();
        assert!(cognitive <= 3);
    }

    #[test]
    fn cache_returns_identical_items_within_ttl() {
        let dir = tempfile::TempDir::new().unwrap();
        let adv = advisor(dir.path());
        let insights = insights_with(&["Always validate input before database operations"]);
        let first = adv.advise(
            &request("Bash", "database work"),
            &insights,
            &[],
            &TriggerSet::default(),
            None,
            &Tuneables::default(),
        );
        let second = adv.advise(
            &request("Bash", "database work"),
            &insights,
            &[],
            &TriggerSet::default(),
            None,
            &Tuneables::default(),
        );
        let first_ids: Vec<&String> = first.iter().map(|a| &a.id).collect();
        let second_ids: Vec<&String> = second.iter().map(|a| &a.id).collect();
        assert_eq!(first_ids, second_ids);
    }

    #[test]
    fn outcome_report_updates_counters_and_backing_stores() {
        let dir = tempfile::TempDir::new().unwrap();
        let adv = advisor(dir.path());
        let insights = insights_with(&["Always validate input before database operations"]);
        let tuneables = Tuneables::default();
        let items = adv.advise(
            &request("Edit", "database writes"),
            &insights,
            &[],
            &TriggerSet::default(),
            None,
            &tuneables,
        );
        assert!(!items.is_empty());

        let result = adv
            .report_outcome("Edit", "s1", OutcomeStatus::Success, &tuneables)
            .unwrap();
        assert!(!result.records.is_empty());
        assert!(result.records.iter().all(|r| r.followed));
        assert_eq!(result.insight_updates.len(), result.records.len());

        let totals = adv.effectiveness().totals();
        let cognitive = &totals["cognitive"];
        assert!(cognitive.followed >= 1);
        assert!(cognitive.helpful >= 1);
        assert!(cognitive.followed <= cognitive.advice_given);
    }

    #[test]
    fn outcome_falls_back_to_parent_orchestrator_tool() {
        let dir = tempfile::TempDir::new().unwrap();
        let adv = advisor(dir.path());
        let insights = insights_with(&["Always validate input before database operations"]);
        let tuneables = Tuneables::default();
        adv.advise(
            &request("Task", "database updates"),
            &insights,
            &[],
            &TriggerSet::default(),
            None,
            &tuneables,
        );
        // The observed tool differs, but Task is a parent orchestrator.
        let result = adv
            .report_outcome("Bash", "s1", OutcomeStatus::Success, &tuneables)
            .unwrap();
        assert!(!result.records.is_empty());
    }

    #[test]
    fn integrity_check_clean_book_is_silent() {
        let dir = tempfile::TempDir::new().unwrap();
        let adv = advisor(dir.path());
        assert!(adv.verify_integrity().is_empty());
    }

    #[test]
    fn no_match_returns_empty_not_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let adv = advisor(dir.path());
        let result = adv
            .report_outcome("Edit", "s1", OutcomeStatus::Success, &Tuneables::default())
            .unwrap();
        assert!(result.records.is_empty());
    }
}
