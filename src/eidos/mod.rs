//! EIDOS: the structured episode/step model.
//!
//! Every action the assistant takes is wrapped as a step inside a bounded
//! episode. A step binds the action to a hypothesis, a prediction, an
//! evaluation, and a lesson; the episode carries budgets and a phase state
//! machine with real-time watchers.

pub mod engine;
pub mod store;
pub mod watchers;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

pub use engine::{EpisodeEngine, StepAdmission};
pub use store::EidosStore;
pub use watchers::{WatcherEffect, WatcherFire, WatcherKind};

// ---------------------------------------------------------------------------
// Phases
// ---------------------------------------------------------------------------

/// Episode phase. Transitions are restricted to the enumerated graph; staying
/// in the current phase is always legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Explore,
    Plan,
    Execute,
    Validate,
    Consolidate,
    Diagnose,
    Simplify,
    Escalate,
    Halt,
}

impl Phase {
    /// Legal successor phases (self-loops excluded; they are always allowed).
    pub fn successors(self) -> &'static [Phase] {
        use Phase::*;
        match self {
            Explore => &[Plan, Escalate, Halt],
            Plan => &[Execute, Escalate, Halt],
            Execute => &[Validate, Escalate, Halt],
            Validate => &[Execute, Consolidate, Diagnose, Escalate, Halt],
            Consolidate => &[Halt],
            Diagnose => &[Simplify, Execute, Plan, Escalate, Halt],
            Simplify => &[Execute, Escalate, Halt],
            Escalate => &[Halt],
            Halt => &[],
        }
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: Phase) -> bool {
        self == next || self.successors().contains(&next)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Explore => "explore",
            Phase::Plan => "plan",
            Phase::Execute => "execute",
            Phase::Validate => "validate",
            Phase::Consolidate => "consolidate",
            Phase::Diagnose => "diagnose",
            Phase::Simplify => "simplify",
            Phase::Escalate => "escalate",
            Phase::Halt => "halt",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// Evaluation of a completed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepEvaluation {
    Pass,
    Fail,
    Partial,
    Unknown,
}

/// The memory assertion every step must carry: either a cited insight or
/// distillation, or an explicit declaration that nothing relevant exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryAssertion {
    Cited { reference: String },
    Absent { reason: String },
}

/// Evidence that a state-modifying step was validated, or a deferred marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationEvidence {
    Observed { evidence: String },
    Deferred { max_wait_secs: u64 },
}

/// Pre-action contract for a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepPlan {
    /// Phase this step runs in; must be reachable from the episode's phase.
    pub phase: Phase,
    pub intent: String,
    /// Falsifiable claim about the world.
    pub hypothesis: String,
    /// Expected outcome of the action.
    pub prediction: String,
    pub confidence_before: f64,
    pub tool: String,
    /// When to abort this approach.
    pub stop_condition: String,
    /// Cited memory, or a declared absence. Steps without it are blocked.
    pub memory: Option<MemoryAssertion>,
    /// Artifact (file/path) this step intends to modify, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

/// Post-action contract for a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub result: String,
    pub evaluation: StepEvaluation,
    /// Required when the action modified state.
    pub validation: Option<ValidationEvidence>,
    pub confidence_after: f64,
    /// One to three bullets.
    pub lesson: Vec<String>,
    /// Normalized error signature on failure (drives the repeat-error watcher).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_signature: Option<String>,
    /// Whether the step produced evidence not seen before in this episode.
    pub new_evidence: bool,
    /// Whether the action modified external state.
    pub modified_state: bool,
}

/// A step: one admissible action with its pre/post envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub episode_id: String,
    pub plan: StepPlan,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<StepResult>,
    pub started_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_ms: Option<u64>,
}

impl Step {
    pub fn is_complete(&self) -> bool {
        self.result.is_some()
    }
}

// ---------------------------------------------------------------------------
// Episodes
// ---------------------------------------------------------------------------

/// Final outcome of an episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeOutcome {
    InProgress,
    Success,
    Failure,
    Partial,
    Escalated,
}

/// Hard limits for one episode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Budget {
    pub max_steps: u64,
    pub max_time_seconds: u64,
    pub max_retries_per_error: u64,
    pub max_file_touches: u64,
    pub no_evidence_limit: u64,
}

impl Budget {
    pub fn from_tuneables(t: &crate::config::Tuneables) -> Self {
        Self {
            max_steps: t.episode_max_steps,
            max_time_seconds: t.episode_max_time_seconds,
            max_retries_per_error: t.episode_max_retries_per_error,
            max_file_touches: t.episode_max_file_touches,
            no_evidence_limit: t.episode_no_evidence_limit,
        }
    }
}

/// A bounded run toward one goal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub id: String,
    pub session_id: String,
    pub goal: String,
    pub budget: Budget,
    pub phase: Phase,
    pub outcome: EpisodeOutcome,
    pub step_count: u64,
    /// Consecutive completed steps without new evidence.
    pub no_evidence_streak: u64,
    /// Artifact -> modification count.
    pub file_touch_counts: BTreeMap<String, u64>,
    /// Error signature -> occurrence count.
    pub error_counts: BTreeMap<String, u64>,
    /// Artifacts frozen by the diff-thrash watcher.
    pub frozen_artifacts: BTreeSet<String>,
    /// Trailing confidence_after values (stagnation watcher).
    pub confidence_history: Vec<f64>,
    /// Whether any step evaluated Pass.
    pub pass_seen: bool,
    /// Execute-phase steps completed since the last validate step.
    pub executes_since_validate: u64,
    /// Distinct intents admitted (scope-creep watcher input).
    pub distinct_intents: BTreeSet<String>,
    /// Watcher fires so far (escape-protocol input).
    pub watcher_fires: Vec<WatcherKind>,
    /// Minimal mode: only read/search/test actions admissible.
    pub minimal_mode: bool,
    pub started_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_ms: Option<u64>,
    pub last_activity_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

impl Episode {
    pub fn new(session_id: &str, goal: &str, budget: Budget, now_ms: u64) -> Self {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos();
        Self {
            id: format!("ep-{now_ms:x}-{nanos:x}"),
            session_id: session_id.to_string(),
            goal: goal.to_string(),
            budget,
            phase: Phase::Explore,
            outcome: EpisodeOutcome::InProgress,
            step_count: 0,
            no_evidence_streak: 0,
            file_touch_counts: BTreeMap::new(),
            error_counts: BTreeMap::new(),
            frozen_artifacts: BTreeSet::new(),
            confidence_history: Vec::new(),
            pass_seen: false,
            executes_since_validate: 0,
            distinct_intents: BTreeSet::new(),
            watcher_fires: Vec::new(),
            minimal_mode: false,
            started_ms: now_ms,
            ended_ms: None,
            last_activity_ms: now_ms,
            trace_id: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.outcome != EpisodeOutcome::InProgress
    }

    /// Age of the last activity, in seconds.
    pub fn idle_secs(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_activity_ms) / 1_000
    }
}
