//! Episode engine: step admission, phase control, budgets, and the escape
//! protocol.
//!
//! One active episode per session; steps within an episode are strictly
//! sequential. Admission runs the budget checks, the watcher set, and the
//! minimal-mode restriction before any action executes; completion updates
//! counters and may force phase transitions. Watcher-forced transitions are
//! arcs of the machine itself and bypass the caller-facing transition graph.

use std::collections::HashMap;

use crate::config::{ConfigSnapshot, Tuneables};
use crate::error::EidosError;
use crate::event::now_ms;

use super::store::{EidosStore, EpisodeRecord};
use super::watchers::{self, WatcherEffect, WatcherFire, WatcherKind};
use super::{Budget, Episode, EpisodeOutcome, Phase, Step, StepEvaluation, StepPlan, StepResult};

// ---------------------------------------------------------------------------
// Admission result
// ---------------------------------------------------------------------------

/// Outcome of a step admission request. Blocking is an explicit variant, not
/// an error: the caller receives the watcher and the required remediation.
#[derive(Debug, Clone, PartialEq)]
pub enum StepAdmission {
    Admitted {
        step_id: String,
        episode_id: String,
    },
    Blocked {
        watcher: WatcherKind,
        remediation: String,
        /// Phase the episode was forced into, when the watcher did so.
        forced_phase: Option<Phase>,
    },
}

struct ActiveEpisode {
    episode: Episode,
    steps: Vec<Step>,
    /// Step id currently awaiting completion; at most one per episode.
    in_flight: Option<String>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Maintains one active episode per session and persists records through the
/// eidos store.
pub struct EpisodeEngine {
    store: EidosStore,
    active: HashMap<String, ActiveEpisode>,
}

impl EpisodeEngine {
    pub fn new(store: EidosStore) -> Self {
        Self {
            store,
            active: HashMap::new(),
        }
    }

    pub fn store(&self) -> &EidosStore {
        &self.store
    }

    /// Ensure a session has an open episode, creating one with the given goal
    /// when absent. Returns the episode id.
    pub fn note_request(&mut self, session: &str, goal: &str, tuneables: &Tuneables) -> String {
        let entry = self.active.entry(session.to_string()).or_insert_with(|| {
            let episode = Episode::new(session, goal, Budget::from_tuneables(tuneables), now_ms());
            tracing::debug!(session, episode = %episode.id, "episode opened");
            ActiveEpisode {
                episode,
                steps: Vec::new(),
                in_flight: None,
            }
        });
        entry.episode.last_activity_ms = now_ms();
        entry.episode.id.clone()
    }

    /// The active episode for a session, if any.
    pub fn active_episode(&self, session: &str) -> Option<&Episode> {
        self.active.get(session).map(|a| &a.episode)
    }

    /// Admit one step. Checks run in order: sequencing, budgets, watchers,
    /// minimal mode, phase legality.
    pub fn admit_step(
        &mut self,
        session: &str,
        plan: StepPlan,
        config: &ConfigSnapshot,
    ) -> Result<StepAdmission, EidosError> {
        self.note_request(session, &plan.intent, &config.tuneables);
        let active = self
            .active
            .get_mut(session)
            .ok_or_else(|| EidosError::NoActiveEpisode {
                session: session.to_string(),
            })?;

        if active.in_flight.is_some() {
            return Err(EidosError::InvalidStep {
                message: "previous step is still in flight; complete it first".into(),
            });
        }

        // Budget: step count.
        if active.episode.step_count >= active.episode.budget.max_steps {
            let outcome = exhausted_outcome(&active.episode);
            Self::finalize(&self.store, active, outcome);
            self.active.remove(session);
            tracing::info!(session, "episode halted: step budget exhausted");
            return Err(EidosError::BudgetExhausted {
                which: "max_steps".into(),
            });
        }

        // Budget: wall time.
        let elapsed_secs = now_ms().saturating_sub(active.episode.started_ms) / 1_000;
        if elapsed_secs > active.episode.budget.max_time_seconds {
            let outcome = exhausted_outcome(&active.episode);
            Self::finalize(&self.store, active, outcome);
            self.active.remove(session);
            tracing::info!(session, "episode halted: time budget exhausted");
            return Err(EidosError::BudgetExhausted {
                which: "max_time_seconds".into(),
            });
        }

        // Watchers.
        if let Some(fire) =
            watchers::check_admission(&active.episode, &plan, config.flags.strict_trace)
        {
            return Ok(Self::apply_admission_fire(&self.store, active, &plan, fire));
        }

        // Escape protocol: minimal mode restricts admissible actions.
        if active.episode.minimal_mode && !watchers::minimal_mode_allows(&plan.tool) {
            let watcher = active
                .episode
                .watcher_fires
                .last()
                .copied()
                .unwrap_or(WatcherKind::NoNewEvidence);
            return Ok(StepAdmission::Blocked {
                watcher,
                remediation:
                    "minimal mode: only read/search/test actions are admissible; \
                     gather new evidence and revise the hypothesis to exit"
                        .into(),
                forced_phase: None,
            });
        }

        // Phase transition requested by the step.
        if !active.episode.phase.can_transition_to(plan.phase) {
            return Err(EidosError::IllegalTransition {
                from: active.episode.phase.to_string(),
                to: plan.phase.to_string(),
            });
        }
        active.episode.phase = plan.phase;

        // Admit.
        active.episode.step_count += 1;
        active.episode.distinct_intents.insert(plan.intent.clone());
        active.episode.last_activity_ms = now_ms();
        if active.episode.trace_id.is_none() {
            active.episode.trace_id = plan.trace_id.clone();
        }

        let step_id = format!("st-{:04}", active.episode.step_count);
        let episode_id = active.episode.id.clone();
        active.steps.push(Step {
            id: step_id.clone(),
            episode_id: episode_id.clone(),
            plan,
            result: None,
            started_ms: now_ms(),
            completed_ms: None,
        });
        active.in_flight = Some(step_id.clone());

        Ok(StepAdmission::Admitted {
            step_id,
            episode_id,
        })
    }

    /// Complete the in-flight step and advance all counters and watchers.
    pub fn complete_step(
        &mut self,
        session: &str,
        step_id: &str,
        result: StepResult,
    ) -> Result<Vec<WatcherFire>, EidosError> {
        let active = self
            .active
            .get_mut(session)
            .ok_or_else(|| EidosError::NoActiveEpisode {
                session: session.to_string(),
            })?;

        if active.in_flight.as_deref() != Some(step_id) {
            return Err(EidosError::InvalidStep {
                message: format!("step {step_id} is not the in-flight step for this session"),
            });
        }

        // Post-action contract.
        if result.modified_state && result.validation.is_none() {
            return Err(EidosError::InvalidStep {
                message: "a state-modifying step needs validation evidence or a \
                          deferred-validation record"
                    .into(),
            });
        }
        if result.lesson.is_empty() || result.lesson.len() > 3 {
            return Err(EidosError::InvalidStep {
                message: "lesson must be one to three bullets".into(),
            });
        }

        let step_idx = active
            .steps
            .iter()
            .rposition(|s| s.id == step_id)
            .ok_or_else(|| EidosError::InvalidStep {
                message: format!("unknown step id {step_id}"),
            })?;
        let plan_phase = active.steps[step_idx].plan.phase;
        let plan_artifact = active.steps[step_idx].plan.artifact.clone();
        let current_hypothesis = active.steps[step_idx].plan.hypothesis.clone();
        let prior_hypothesis = step_idx
            .checked_sub(1)
            .map(|i| active.steps[i].plan.hypothesis.clone());

        // Counters.
        let episode = &mut active.episode;
        if result.new_evidence {
            episode.no_evidence_streak = 0;
        } else {
            episode.no_evidence_streak += 1;
        }
        if result.evaluation == StepEvaluation::Pass {
            episode.pass_seen = true;
        }
        if let Some(signature) = &result.error_signature {
            *episode.error_counts.entry(signature.clone()).or_insert(0) += 1;
        }
        if result.modified_state {
            if let Some(artifact) = &plan_artifact {
                *episode.file_touch_counts.entry(artifact.clone()).or_insert(0) += 1;
            }
        }
        match plan_phase {
            Phase::Execute => episode.executes_since_validate += 1,
            Phase::Validate => episode.executes_since_validate = 0,
            _ => {}
        }
        episode.confidence_history.push(result.confidence_after);
        episode.last_activity_ms = now_ms();

        // Escape-protocol exit: new evidence plus a revised hypothesis.
        if episode.minimal_mode
            && result.new_evidence
            && prior_hypothesis.is_some_and(|prior| prior != current_hypothesis)
        {
            episode.minimal_mode = false;
            episode.watcher_fires.clear();
            tracing::info!(episode = %episode.id, "minimal mode exited");
        }

        active.steps[step_idx].result = Some(result);
        active.steps[step_idx].completed_ms = Some(now_ms());
        active.in_flight = None;

        // Completion watchers.
        let fires = watchers::check_completion(&active.episode);
        for fire in &fires {
            Self::apply_completion_fire(&mut active.episode, fire);
        }
        Self::note_fires(&mut active.episode, &fires);

        // Budget exhaustion after counting this step. The repeat-error
        // watcher diagnoses at the retry limit; erring past it halts.
        let retries_blown = active
            .episode
            .error_counts
            .values()
            .any(|count| *count > active.episode.budget.max_retries_per_error);
        if active.episode.step_count >= active.episode.budget.max_steps || retries_blown {
            let outcome = exhausted_outcome(&active.episode);
            Self::finalize(&self.store, active, outcome);
            self.active.remove(session);
            return Ok(fires);
        }

        // Terminal phases.
        match active.episode.phase {
            Phase::Halt => {
                let outcome = exhausted_outcome(&active.episode);
                Self::finalize(&self.store, active, outcome);
                self.active.remove(session);
            }
            Phase::Consolidate => {
                let outcome = if active.episode.pass_seen {
                    EpisodeOutcome::Success
                } else {
                    EpisodeOutcome::Partial
                };
                Self::finalize(&self.store, active, outcome);
                self.active.remove(session);
            }
            Phase::Escalate => {
                Self::finalize(&self.store, active, EpisodeOutcome::Escalated);
                self.active.remove(session);
            }
            _ => {
                // Persist the in-progress record for crash safety.
                let record = EpisodeRecord {
                    episode: active.episode.clone(),
                    steps: active.steps.clone(),
                };
                if let Err(e) = self.store.save(&record) {
                    tracing::warn!(error = %e, "episode checkpoint failed, retrying next cycle");
                }
            }
        }

        Ok(fires)
    }

    /// Close a session's episode explicitly (session_end).
    pub fn close_session(&mut self, session: &str) {
        if let Some(mut active) = self.active.remove(session) {
            let outcome = if active.episode.pass_seen {
                EpisodeOutcome::Success
            } else {
                EpisodeOutcome::Partial
            };
            Self::finalize(&self.store, &mut active, outcome);
        }
    }

    /// Auto-consolidate episodes idle beyond the staleness threshold.
    /// Returns the consolidated episode ids.
    pub fn consolidate_stale(&mut self, tuneables: &Tuneables) -> Vec<String> {
        let now = now_ms();
        let stale: Vec<String> = self
            .active
            .iter()
            .filter(|(_, a)| a.episode.idle_secs(now) > tuneables.episode_stale_after_secs)
            .map(|(session, _)| session.clone())
            .collect();
        let mut consolidated = Vec::new();
        for session in stale {
            if let Some(mut active) = self.active.remove(&session) {
                consolidated.push(active.episode.id.clone());
                tracing::info!(
                    session,
                    episode = %active.episode.id,
                    "stale episode auto-consolidated"
                );
                Self::finalize(&self.store, &mut active, EpisodeOutcome::Partial);
            }
        }
        consolidated
    }

    /// Sessions with an open episode.
    pub fn active_sessions(&self) -> Vec<String> {
        self.active.keys().cloned().collect()
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn apply_admission_fire(
        store: &EidosStore,
        active: &mut ActiveEpisode,
        plan: &StepPlan,
        fire: WatcherFire,
    ) -> StepAdmission {
        let mut forced_phase = None;
        let remediation = match &fire.effect {
            WatcherEffect::BlockAdmission { remediation } => {
                // Diff-thrash blocks also freeze the artifact and force a
                // diagnosis pass.
                if fire.kind == WatcherKind::DiffThrash {
                    if let Some(artifact) = &plan.artifact {
                        active.episode.frozen_artifacts.insert(artifact.clone());
                    }
                    active.episode.phase = Phase::Diagnose;
                    forced_phase = Some(Phase::Diagnose);
                }
                remediation.clone()
            }
            WatcherEffect::ForcePhase(phase) => {
                active.episode.phase = *phase;
                forced_phase = Some(*phase);
                format!("phase forced to {phase}; re-plan the step there")
            }
            WatcherEffect::FreezeArtifact(artifact) => {
                active.episode.frozen_artifacts.insert(artifact.clone());
                "artifact frozen; work on something else".into()
            }
        };
        Self::note_fires(&mut active.episode, std::slice::from_ref(&fire));
        let record = EpisodeRecord {
            episode: active.episode.clone(),
            steps: active.steps.clone(),
        };
        if let Err(e) = store.save(&record) {
            tracing::warn!(error = %e, "episode checkpoint failed after watcher fire");
        }
        StepAdmission::Blocked {
            watcher: fire.kind,
            remediation,
            forced_phase,
        }
    }

    fn apply_completion_fire(episode: &mut Episode, fire: &WatcherFire) {
        match &fire.effect {
            WatcherEffect::ForcePhase(phase) => {
                episode.phase = *phase;
                // Forcing the phase resets the counter that fired, so the
                // watcher does not retrigger every step.
                match fire.kind {
                    WatcherKind::ValidationGap => episode.executes_since_validate = 0,
                    WatcherKind::NoNewEvidence => episode.no_evidence_streak = 0,
                    WatcherKind::ConfidenceStagnation => episode.confidence_history.clear(),
                    _ => {}
                }
            }
            WatcherEffect::FreezeArtifact(artifact) => {
                episode.frozen_artifacts.insert(artifact.clone());
            }
            WatcherEffect::BlockAdmission { .. } => {}
        }
    }

    /// Record fires and engage the escape protocol on repeated firing:
    /// two distinct watchers, or the same watcher twice.
    fn note_fires(episode: &mut Episode, fires: &[WatcherFire]) {
        for fire in fires {
            episode.watcher_fires.push(fire.kind);
        }
        if episode.minimal_mode || episode.watcher_fires.is_empty() {
            return;
        }
        let total = episode.watcher_fires.len();
        let distinct: std::collections::HashSet<_> = episode.watcher_fires.iter().collect();
        let repeated = total > distinct.len();
        if distinct.len() >= 2 || repeated {
            episode.minimal_mode = true;
            tracing::info!(episode = %episode.id, "escape protocol engaged: minimal mode");
        }
    }

    fn finalize(store: &EidosStore, active: &mut ActiveEpisode, outcome: EpisodeOutcome) {
        active.episode.phase = Phase::Halt;
        active.episode.outcome = outcome;
        active.episode.ended_ms = Some(now_ms());
        let record = EpisodeRecord {
            episode: active.episode.clone(),
            steps: active.steps.clone(),
        };
        if let Err(e) = store.save(&record) {
            tracing::warn!(error = %e, "episode finalize persist failed");
        }
    }
}

/// Outcome when an episode halts on exhaustion or forced stop.
fn exhausted_outcome(episode: &Episode) -> EpisodeOutcome {
    if episode.pass_seen {
        EpisodeOutcome::Partial
    } else {
        EpisodeOutcome::Failure
    }
}
