//! The engine facade: one context object owning every subsystem.
//!
//! Constructed once at startup and threaded through the CLI, the ingestion
//! server, and the bridge worker. The synchronous entry points `capture`,
//! `advise`, `report_outcome`, `admit_step`, and `complete_step` are the
//! whole public surface; any asynchrony belongs to the callers.

use std::sync::Mutex;

use crate::advisor::{Advice, AdviceRequest, Advisor, MemorySource, OutcomeRecord};
use crate::config::{ConfigSnapshot, Flags, Tuneables};
use crate::distill::DistillStore;
use crate::eidos::{EidosStore, EpisodeEngine, StepAdmission, StepPlan, StepResult, WatcherFire};
use crate::error::{ConfigError, SeshatResult};
use crate::event::{Event, OutcomeStatus};
use crate::insight::InsightStore;
use crate::membridge::MemBridge;
use crate::patterns::PatternAggregator;
use crate::paths::SeshatPaths;
use crate::queue::{CaptureOutcome, EventQueue, QueueConfig};
use crate::roast::QualityGate;
use crate::scorer::ImportanceScorer;
use crate::triggers::TriggerSet;

/// The seshat core: owns all subsystems and provides the public interface.
pub struct Core {
    paths: SeshatPaths,
    flags: Flags,
    tuneables: Mutex<Tuneables>,
    queue: EventQueue,
    insights: InsightStore,
    gate: QualityGate,
    scorer: ImportanceScorer,
    pub(crate) aggregator: Mutex<PatternAggregator>,
    pub(crate) episodes: Mutex<EpisodeEngine>,
    distillations: DistillStore,
    advisor: Advisor,
    triggers: Mutex<TriggerSet>,
    membridge: Option<MemBridge>,
}

impl Core {
    /// Open (or initialize) the engine over the given data directory.
    pub fn open(paths: SeshatPaths, flags: Flags) -> SeshatResult<Self> {
        paths
            .ensure_dirs()
            .map_err(|e| ConfigError::Invalid {
                message: e.to_string(),
            })?;

        let tuneables = Tuneables::load(&paths.tuneables_file())?;
        let queue_config = QueueConfig {
            capture_budget_ms: tuneables.queue_capture_budget_ms,
            lock_wait_ms: tuneables.queue_lock_wait_ms,
            rotate_threshold: tuneables.queue_rotate_threshold,
            tail_chunk_bytes: tuneables.queue_tail_chunk_bytes,
        };
        let queue = EventQueue::open(&paths, queue_config)?;
        let insights = InsightStore::open(paths.insights_file())?;
        let episodes = EpisodeEngine::new(EidosStore::open(paths.eidos_dir())?);
        let distillations = DistillStore::open(paths.distillations_dir())?;
        let advisor = Advisor::new(paths.advice_log_file(), paths.effectiveness_file());
        let triggers = TriggerSet::load(&paths.trigger_rules_file())?;

        tracing::info!(
            data_dir = %paths.data_dir.display(),
            trigger_rules = triggers.len(),
            insights = insights.len(),
            "seshat core opened"
        );

        Ok(Self {
            paths,
            flags,
            tuneables: Mutex::new(tuneables),
            queue,
            insights,
            gate: QualityGate::new(),
            scorer: ImportanceScorer::new(),
            aggregator: Mutex::new(PatternAggregator::new()),
            episodes: Mutex::new(episodes),
            distillations,
            advisor,
            triggers: Mutex::new(triggers),
            membridge: None,
        })
    }

    /// Attach the optional external memory adapter.
    pub fn with_membridge(mut self, bridge: MemBridge) -> Self {
        self.membridge = Some(bridge);
        self
    }

    // -- accessors ----------------------------------------------------------

    pub fn paths(&self) -> &SeshatPaths {
        &self.paths
    }

    pub fn flags(&self) -> &Flags {
        &self.flags
    }

    pub fn queue(&self) -> &EventQueue {
        &self.queue
    }

    pub fn insights(&self) -> &InsightStore {
        &self.insights
    }

    pub fn gate(&self) -> &QualityGate {
        &self.gate
    }

    pub fn scorer(&self) -> &ImportanceScorer {
        &self.scorer
    }

    pub fn distillations(&self) -> &DistillStore {
        &self.distillations
    }

    pub fn advisor(&self) -> &Advisor {
        &self.advisor
    }

    pub fn membridge(&self) -> Option<&MemBridge> {
        self.membridge.as_ref()
    }

    /// Current phase of a session's active episode.
    pub fn active_phase(&self, session: &str) -> Option<crate::eidos::Phase> {
        self.episodes
            .lock()
            .unwrap()
            .active_episode(session)
            .map(|e| e.phase)
    }

    /// Episodes persisted so far.
    pub fn episode_count(&self) -> usize {
        self.episodes.lock().unwrap().store().episode_count()
    }

    /// Completed steps across terminal episodes (tuner and distillation
    /// input).
    pub fn completed_steps(&self) -> Vec<crate::eidos::Step> {
        self.episodes.lock().unwrap().store().completed_steps()
    }

    /// Clone of the current tuneables.
    pub fn tuneables(&self) -> Tuneables {
        self.tuneables.lock().unwrap().clone()
    }

    /// Replace the tuneables (after a tuner apply or revert).
    pub fn set_tuneables(&self, tuneables: Tuneables) {
        *self.tuneables.lock().unwrap() = tuneables;
    }

    /// Per-cycle configuration snapshot.
    pub fn config_snapshot(&self) -> ConfigSnapshot {
        ConfigSnapshot {
            tuneables: self.tuneables(),
            flags: self.flags.clone(),
        }
    }

    /// Reload trigger rules from disk (bridge cycle start).
    pub fn reload_triggers(&self) {
        match TriggerSet::load(&self.paths.trigger_rules_file()) {
            Ok(set) => *self.triggers.lock().unwrap() = set,
            Err(e) => tracing::warn!(error = %e, "trigger rules reload failed, keeping previous set"),
        }
    }

    // -- entry points -------------------------------------------------------

    /// Append an event to the queue (in-process ingestion).
    pub fn capture(&self, event: &Event) -> CaptureOutcome {
        self.queue.capture(event)
    }

    /// Validate then capture an event from an untrusted source (file or
    /// HTTP ingestion). Schema violations land in the invalid-events sidecar.
    pub fn ingest(&self, event: &Event) -> SeshatResult<CaptureOutcome> {
        if let Err(violation) = event.validate() {
            if let Ok(line) = serde_json::to_string(event) {
                let _ = crate::persist::append_line(&self.paths.invalid_events_file(), &line);
            }
            return Err(violation.into());
        }
        Ok(self.queue.capture(event))
    }

    /// Ranked advice for a pending tool call.
    pub fn advise(&self, request: &AdviceRequest<'_>) -> Vec<Advice> {
        let tuneables = self.tuneables();
        let insights = self.insights.snapshot();
        let distillations = self.distillations.load_all();
        let triggers = self.triggers.lock().unwrap();
        // SESHAT_NO_EMBED keeps retrieval keyword-only: the embedding-backed
        // external source is skipped entirely.
        let external: Option<&dyn MemorySource> = if self.flags.no_embed {
            None
        } else {
            self.membridge.as_ref().map(|b| b as &dyn MemorySource)
        };
        let items = self.advisor.advise(
            request,
            &insights,
            &distillations,
            &triggers,
            external,
            &tuneables,
        );
        drop(triggers);

        // Retrieval counters live on the rules themselves.
        for advice in &items {
            if let Some(id) = &advice.distillation_id {
                if let Ok(mut rule) = self.distillations.get(id) {
                    rule.times_retrieved += 1;
                    let _ = self.distillations.update(&rule);
                }
            }
        }
        items
    }

    /// Report an observed outcome and close the feedback loop.
    pub fn report_outcome(
        &self,
        tool: &str,
        session: &str,
        outcome: OutcomeStatus,
    ) -> SeshatResult<Vec<OutcomeRecord>> {
        let tuneables = self.tuneables();
        let result = self
            .advisor
            .report_outcome(tool, session, outcome, &tuneables)?;

        for (id, helpful) in &result.distillation_updates {
            if let Ok(mut rule) = self.distillations.get(id) {
                rule.times_used += 1;
                if *helpful {
                    rule.record_helpful(crate::event::now_secs(), tuneables.distill_revalidate_window_secs);
                } else {
                    rule.record_contradiction(
                        crate::event::now_secs(),
                        tuneables.distill_revalidate_window_secs,
                    );
                }
                let _ = self.distillations.update(&rule);
            }
        }
        for (key, helpful) in &result.insight_updates {
            if *helpful {
                if let Some(existing) = self.insights.get(key) {
                    self.insights.add_or_validate(crate::insight::InsightCandidate {
                        category: existing.category,
                        text: existing.text,
                        context: existing.context,
                        base_confidence: existing.base_confidence,
                        tier: existing.tier,
                        trigger_tags: existing.trigger_tags,
                    });
                }
            } else {
                let _ = self.insights.contradict(key);
            }
        }
        Ok(result.records)
    }

    /// Admit a step into the session's active episode.
    pub fn admit_step(&self, session: &str, plan: StepPlan) -> SeshatResult<StepAdmission> {
        let config = self.config_snapshot();
        Ok(self
            .episodes
            .lock()
            .unwrap()
            .admit_step(session, plan, &config)?)
    }

    /// Complete the in-flight step for a session.
    pub fn complete_step(
        &self,
        session: &str,
        step_id: &str,
        result: StepResult,
    ) -> SeshatResult<Vec<WatcherFire>> {
        Ok(self
            .episodes
            .lock()
            .unwrap()
            .complete_step(session, step_id, result)?)
    }
}
