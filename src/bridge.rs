//! Bridge cycle: the periodic worker that drains the event queue and feeds
//! every learning store.
//!
//! Each cycle reads a batch of events past the logical head, classifies them
//! once, routes text through the detector and scorer/gate pipelines, closes
//! outcome feedback, runs distillation when due, advances episode upkeep,
//! rotates logs, and writes a heartbeat. The core stays synchronous; the
//! tokio daemon (feature `daemon`) only schedules.

use serde::{Deserialize, Serialize};

use crate::core::Core;
use crate::event::{EventKind, now_ms};
use crate::insight::{InsightCandidate, categorize};
use crate::persist;
use crate::roast::RoastVerdict;
use crate::scorer::Tier;

// ---------------------------------------------------------------------------
// Heartbeat
// ---------------------------------------------------------------------------

/// Counters produced by one bridge cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CycleMetrics {
    pub events_read: u64,
    pub patterns_detected: u64,
    pub insights_added: u64,
    pub insights_validated: u64,
    pub duplicates: u64,
    pub primitives: u64,
    pub distillations_created: u64,
    pub outcomes_processed: u64,
    pub stale_consolidated: u64,
    pub integrity_repairs: u64,
    pub errors: u64,
    pub duration_ms: u64,
}

/// `bridge_worker_heartbeat.json`: timestamp plus the last cycle's metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub ts_ms: u64,
    pub cycle_number: u64,
    pub metrics: CycleMetrics,
}

// ---------------------------------------------------------------------------
// Cycle
// ---------------------------------------------------------------------------

/// Run one bridge cycle against the core. Every sub-step recovers locally;
/// the heartbeat always gets written, carrying the error count.
pub fn run_cycle(core: &Core, cycle_number: u64) -> CycleMetrics {
    let started = now_ms();
    let mut metrics = CycleMetrics::default();

    // Fresh configuration snapshot and trigger rules for this cycle.
    core.reload_triggers();
    let config = core.config_snapshot();
    let tuneables = &config.tuneables;

    // 1. Read recent events past the logical head.
    let events = core.queue().read_from_head(tuneables.bridge_read_batch);
    metrics.events_read = events.len() as u64;

    // 2-3. Classify once, then route: detectors, then the direct
    // importance -> quality -> insight pipeline.
    let output = core
        .aggregator
        .lock()
        .unwrap()
        .process(&events, tuneables);
    metrics.patterns_detected = output.patterns.len() as u64;

    for request in &output.step_requests {
        core.episodes
            .lock()
            .unwrap()
            .note_request(&request.session_id, &request.text, tuneables);
    }

    // Detector-backed patterns.
    for pattern in &output.patterns {
        let text = strip_memory_marker(&pattern.text);
        ingest_candidate(
            core,
            &text,
            &format!("pattern:{}", pattern.kind),
            Some(pattern.confidence),
            tuneables,
            &mut metrics,
        );
    }

    // Direct path: prompts with an importance signal, even without any
    // detector pattern.
    for event in &events {
        if event.kind != EventKind::UserPrompt {
            continue;
        }
        let text = strip_memory_marker(event.surface_text());
        if text.is_empty() {
            continue;
        }
        ingest_candidate(core, &text, "prompt", None, tuneables, &mut metrics);
    }

    // 4. Outcome reports from completed tool events.
    for event in &events {
        if !matches!(event.kind, EventKind::PostTool | EventKind::PostToolFailure) {
            continue;
        }
        let Some(tool) = event.tool_name.as_deref() else {
            continue;
        };
        let Some(outcome) = event.outcome else {
            continue;
        };
        match core.report_outcome(tool, &event.session_id, outcome) {
            Ok(records) => metrics.outcomes_processed += records.len() as u64,
            Err(e) => {
                metrics.errors += 1;
                tracing::warn!(error = %e, "outcome correlation failed");
            }
        }
    }

    // Session markers close episodes.
    for event in &events {
        if event.kind == EventKind::SessionEnd {
            core.episodes.lock().unwrap().close_session(&event.session_id);
        }
    }

    // 5. Distillation pass when the interval elapsed.
    if output.distill_due {
        metrics.distillations_created = run_distillation(core, tuneables, &mut metrics);
    }

    // 6. Episode upkeep: stale consolidation.
    let consolidated = core
        .episodes
        .lock()
        .unwrap()
        .consolidate_stale(tuneables);
    metrics.stale_consolidated = consolidated.len() as u64;

    // 7. Queue maintenance.
    match core.queue().rotate_if_needed() {
        Ok(_) => {}
        Err(e) => {
            metrics.errors += 1;
            tracing::warn!(error = %e, "rotation failed, retrying next cycle");
        }
    }
    if let Err(e) = core.queue().compact_state() {
        metrics.errors += 1;
        tracing::warn!(error = %e, "queue state compaction failed");
    }

    // Integrity repair (advisor counters against advice-log ground truth).
    let repairs = core.advisor().verify_integrity();
    metrics.integrity_repairs = repairs.len() as u64;

    // Quality-gate self-analysis: recommendations are emitted for the tuner
    // and the operator, never applied here.
    for recommendation in core.gate().analyze(tuneables) {
        tracing::info!(
            tuneable = %recommendation.tuneable,
            proposed = recommendation.proposed,
            reason = %recommendation.reason,
            "quality gate recommendation"
        );
    }

    // External memory upkeep: health check plus offline queue drain.
    if let Some(bridge) = core.membridge() {
        if bridge.health_check() {
            let shipped = bridge.drain_outbox();
            if shipped > 0 {
                tracing::info!(shipped, "memory bridge outbox drained");
            }
        }
    }

    // Advisor cache hygiene.
    core.advisor().sweep_cache();

    // 9. Batch-persist changed state at cycle end. One retry in-cycle, then
    // the write escalates to the next cycle; memory stays authoritative.
    if core.insights().persist_if_dirty().is_err() {
        if let Err(e) = core.insights().persist_if_dirty() {
            metrics.errors += 1;
            tracing::warn!(error = %e, "insight persist failed twice, retrying next cycle");
        }
    }
    if let Err(e) = core.advisor().persist() {
        metrics.errors += 1;
        tracing::warn!(error = %e, "effectiveness persist failed");
    }

    metrics.duration_ms = now_ms().saturating_sub(started);

    // 8. Heartbeat, errors included.
    let heartbeat = Heartbeat {
        ts_ms: now_ms(),
        cycle_number,
        metrics: metrics.clone(),
    };
    if let Err(e) = persist::write_json_atomic(&core.paths().heartbeat_file(), &heartbeat) {
        tracing::warn!(error = %e, "heartbeat write failed");
    }

    tracing::debug!(
        cycle = cycle_number,
        events = metrics.events_read,
        patterns = metrics.patterns_detected,
        insights = metrics.insights_added,
        errors = metrics.errors,
        "bridge cycle complete"
    );
    metrics
}

/// Run text through importance scoring and the quality gate, upserting on a
/// quality verdict.
fn ingest_candidate(
    core: &Core,
    text: &str,
    source: &str,
    detector_confidence: Option<f64>,
    tuneables: &crate::config::Tuneables,
    metrics: &mut CycleMetrics,
) {
    let report = core.scorer().score(text, None, "", tuneables);
    // Unsignaled text still faces the gate (which is the actual filter),
    // just from the bottom tier.
    let (tier, confidence) = match (&report, detector_confidence) {
        (Some(r), Some(dc)) => (r.tier, r.score.max(dc)),
        (Some(r), None) => (r.tier, r.score),
        (None, Some(dc)) => (Tier::Low, dc),
        (None, None) => (Tier::Low, 0.3),
    };

    match core.gate().roast(text, source, core.insights(), tuneables) {
        RoastVerdict::Quality { text: final_text, .. } => {
            let candidate = InsightCandidate {
                category: categorize(&final_text),
                text: final_text,
                context: source.to_string(),
                base_confidence: confidence,
                tier,
                trigger_tags: Vec::new(),
            };
            let (_, status) = core.insights().add_or_validate(candidate);
            match status {
                crate::insight::UpsertStatus::Inserted => metrics.insights_added += 1,
                crate::insight::UpsertStatus::Validated => metrics.insights_validated += 1,
            }
        }
        RoastVerdict::Duplicate { .. } => metrics.duplicates += 1,
        RoastVerdict::Primitive { .. } => metrics.primitives += 1,
        RoastVerdict::NeedsWork { .. } => {}
    }
}

/// Distill completed steps into rules, re-gate them, and persist survivors.
fn run_distillation(
    core: &Core,
    tuneables: &crate::config::Tuneables,
    metrics: &mut CycleMetrics,
) -> u64 {
    let steps = core.episodes.lock().unwrap().store().completed_steps();
    if steps.is_empty() {
        return 0;
    }
    let rules = crate::distill::distill(&steps, tuneables);
    let mut created = 0;
    for rule in rules {
        // The same gates that triage insights triage rules.
        match core
            .gate()
            .roast(&rule.statement, "distillation", core.insights(), tuneables)
        {
            RoastVerdict::Primitive { .. } => continue,
            RoastVerdict::Duplicate { .. } => continue,
            _ => {}
        }
        match core.distillations().upsert(&rule) {
            Ok(true) => created += 1,
            Ok(false) => {}
            Err(e) => {
                metrics.errors += 1;
                tracing::warn!(error = %e, "distillation persist failed");
            }
        }
    }
    created
}

/// Strip an explicit memory marker prefix from a prompt.
fn strip_memory_marker(text: &str) -> String {
    let trimmed = text.trim();
    let lower = trimmed.to_lowercase();
    for marker in ["remember this:", "remember this,", "remember this"] {
        if lower.starts_with(marker) {
            return trimmed[marker.len()..].trim_start().to_string();
        }
    }
    trimmed.to_string()
}

// ---------------------------------------------------------------------------
// Daemon (feature `daemon`)
// ---------------------------------------------------------------------------

/// Long-running worker scheduling bridge cycles with tokio.
#[cfg(feature = "daemon")]
pub struct BridgeDaemon {
    core: std::sync::Arc<Core>,
    cycle_number: u64,
}

#[cfg(feature = "daemon")]
impl BridgeDaemon {
    pub fn new(core: std::sync::Arc<Core>) -> Self {
        Self {
            core,
            cycle_number: 0,
        }
    }

    /// Run cycles until ctrl-c. The cycle body stays synchronous; tokio only
    /// drives the interval and signal handling.
    pub async fn run(&mut self) {
        let interval_secs = self.core.tuneables().bridge_interval_secs();
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
        tracing::info!(interval_secs, "bridge worker started");

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.cycle_number += 1;
                    let core = std::sync::Arc::clone(&self.core);
                    let cycle = self.cycle_number;
                    let result = tokio::task::spawn_blocking(move || run_cycle(&core, cycle)).await;
                    if let Err(e) = result {
                        tracing::warn!(error = %e, "bridge cycle panicked");
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("bridge worker: shutdown signal received");
                    break;
                }
            }
        }

        // Final persist on the way out.
        let _ = self.core.insights().persist_if_dirty();
        let _ = self.core.advisor().persist();
        let _ = self.core.queue().compact_state();
        tracing::info!("bridge worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Flags;
    use crate::core::Core;
    use crate::event::Event;
    use crate::paths::SeshatPaths;

    fn core(dir: &std::path::Path) -> Core {
        Core::open(SeshatPaths::at(dir), Flags::default()).unwrap()
    }

    #[test]
    fn explicit_remember_becomes_quality_insight() {
        let dir = tempfile::TempDir::new().unwrap();
        let core = core(dir.path());
        core.capture(&Event::user_prompt(
            "s1",
            "Remember this: always validate input before database operations",
        ));

        let metrics = run_cycle(&core, 1);
        assert_eq!(metrics.events_read, 1);
        assert_eq!(metrics.insights_added, 1);

        let snapshot = core.insights().snapshot();
        assert_eq!(snapshot.len(), 1);
        let insight = &snapshot[0];
        assert_eq!(insight.category, crate::insight::InsightCategory::Wisdom);
        assert_eq!(insight.tier, Tier::Critical);
        assert!(insight.reliability() >= 0.7);
        assert!(!insight.text.to_lowercase().starts_with("remember"));
    }

    #[test]
    fn duplicate_prompts_validate_once() {
        let dir = tempfile::TempDir::new().unwrap();
        let core = core(dir.path());
        for _ in 0..3 {
            core.capture(&Event::user_prompt(
                "s1",
                "Remember this: always validate input before database operations",
            ));
        }
        let metrics = run_cycle(&core, 1);
        assert_eq!(metrics.events_read, 3);
        assert_eq!(core.insights().len(), 1);
        let insight = &core.insights().snapshot()[0];
        assert!(insight.times_validated >= 2);
        assert!(metrics.duplicates >= 2 || metrics.insights_validated >= 2);
        assert!(core.gate().counters().duplicate >= 2);
    }

    #[test]
    fn primitive_text_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let core = core(dir.path());
        core.capture(&Event::user_prompt("s1", "Read tasks succeed with Read"));
        let metrics = run_cycle(&core, 1);
        assert_eq!(metrics.insights_added, 0);
        assert!(core.insights().is_empty());
        assert!(metrics.primitives >= 1);
        assert!(core.gate().counters().primitive >= 1);
    }

    #[test]
    fn heartbeat_is_written_every_cycle() {
        let dir = tempfile::TempDir::new().unwrap();
        let core = core(dir.path());
        run_cycle(&core, 7);
        let heartbeat: Heartbeat =
            crate::persist::read_json(&core.paths().heartbeat_file())
                .unwrap()
                .unwrap();
        assert_eq!(heartbeat.cycle_number, 7);
        assert!(heartbeat.ts_ms > 0);
    }

    #[test]
    fn head_advances_across_cycles() {
        let dir = tempfile::TempDir::new().unwrap();
        let core = core(dir.path());
        core.capture(&Event::user_prompt("s1", "i prefer descriptive test names"));
        let first = run_cycle(&core, 1);
        assert_eq!(first.events_read, 1);
        let second = run_cycle(&core, 2);
        assert_eq!(second.events_read, 0);
    }

    #[test]
    fn strip_memory_marker_variants() {
        assert_eq!(
            strip_memory_marker("Remember this: do the thing"),
            "do the thing"
        );
        assert_eq!(strip_memory_marker("plain text"), "plain text");
    }
}
