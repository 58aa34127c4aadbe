//! Real-time invariant watchers over episodes.
//!
//! Each watcher fires at a threshold and either forces a phase transition,
//! freezes an artifact, or blocks step admission outright. Watchers run
//! before every admission and after every completion.

use serde::{Deserialize, Serialize};

use super::{Episode, Phase, StepPlan};

/// The eight watchers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatcherKind {
    RepeatError,
    NoNewEvidence,
    DiffThrash,
    ConfidenceStagnation,
    MemoryBypass,
    BudgetHalfNoProgress,
    ScopeCreep,
    ValidationGap,
}

impl std::fmt::Display for WatcherKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WatcherKind::RepeatError => "repeat-error",
            WatcherKind::NoNewEvidence => "no-new-evidence",
            WatcherKind::DiffThrash => "diff-thrash",
            WatcherKind::ConfidenceStagnation => "confidence-stagnation",
            WatcherKind::MemoryBypass => "memory-bypass",
            WatcherKind::BudgetHalfNoProgress => "budget-half-no-progress",
            WatcherKind::ScopeCreep => "scope-creep",
            WatcherKind::ValidationGap => "validation-gap",
        };
        f.write_str(s)
    }
}

/// What a fired watcher does.
#[derive(Debug, Clone, PartialEq)]
pub enum WatcherEffect {
    ForcePhase(Phase),
    FreezeArtifact(String),
    BlockAdmission { remediation: String },
}

/// One watcher firing.
#[derive(Debug, Clone, PartialEq)]
pub struct WatcherFire {
    pub kind: WatcherKind,
    pub effect: WatcherEffect,
}

/// Admission-time watchers. The first firing watcher wins; blocking watchers
/// are checked before phase-forcing ones.
pub fn check_admission(episode: &Episode, plan: &StepPlan, strict_trace: bool) -> Option<WatcherFire> {
    // Memory-bypass: every action needs a cited memory or a declared absence.
    if plan.memory.is_none() {
        return Some(WatcherFire {
            kind: WatcherKind::MemoryBypass,
            effect: WatcherEffect::BlockAdmission {
                remediation: "cite a memory or declare memory_absent with a reason".into(),
            },
        });
    }

    if strict_trace && plan.trace_id.is_none() {
        return Some(WatcherFire {
            kind: WatcherKind::MemoryBypass,
            effect: WatcherEffect::BlockAdmission {
                remediation: "attach a trace_id (strict-trace mode is on)".into(),
            },
        });
    }

    // Diff-thrash: the target artifact is frozen or would exceed its touch
    // budget.
    if let Some(artifact) = &plan.artifact {
        if episode.frozen_artifacts.contains(artifact) {
            return Some(WatcherFire {
                kind: WatcherKind::DiffThrash,
                effect: WatcherEffect::BlockAdmission {
                    remediation: "freeze artifact, change approach".into(),
                },
            });
        }
        let touches = episode.file_touch_counts.get(artifact).copied().unwrap_or(0);
        if touches >= episode.budget.max_file_touches {
            return Some(WatcherFire {
                kind: WatcherKind::DiffThrash,
                effect: WatcherEffect::BlockAdmission {
                    remediation: "freeze artifact, change approach".into(),
                },
            });
        }
    }

    // Repeat-error: retrying an approach whose error signature already hit
    // the retry budget. Once the episode is diagnosing, admission proceeds.
    if episode.phase != Phase::Diagnose
        && episode
            .error_counts
            .values()
            .any(|count| *count >= episode.budget.max_retries_per_error)
    {
        return Some(WatcherFire {
            kind: WatcherKind::RepeatError,
            effect: WatcherEffect::ForcePhase(Phase::Diagnose),
        });
    }

    None
}

/// Completion-time watchers, evaluated against the updated episode counters.
/// Returns every watcher that fired, strongest first.
pub fn check_completion(episode: &Episode) -> Vec<WatcherFire> {
    let mut fires = Vec::new();

    // Repeat-error: same signature twice or more.
    if episode.phase != Phase::Diagnose
        && episode.error_counts.values().any(|count| *count >= 2)
    {
        fires.push(WatcherFire {
            kind: WatcherKind::RepeatError,
            effect: WatcherEffect::ForcePhase(Phase::Diagnose),
        });
    }

    // No-new-evidence streak.
    if episode.no_evidence_streak >= episode.budget.no_evidence_limit {
        fires.push(WatcherFire {
            kind: WatcherKind::NoNewEvidence,
            effect: WatcherEffect::ForcePhase(Phase::Diagnose),
        });
    }

    // Diff-thrash: artifact over its touch budget gets frozen.
    for (artifact, touches) in &episode.file_touch_counts {
        if *touches > episode.budget.max_file_touches && !episode.frozen_artifacts.contains(artifact)
        {
            fires.push(WatcherFire {
                kind: WatcherKind::DiffThrash,
                effect: WatcherEffect::FreezeArtifact(artifact.clone()),
            });
        }
    }

    // Confidence stagnation: |Δconfidence| < 0.05 over the last 3 steps.
    if episode.confidence_history.len() >= 3 {
        let tail = &episode.confidence_history[episode.confidence_history.len() - 3..];
        let spread = tail.iter().cloned().fold(f64::NEG_INFINITY, f64::max)
            - tail.iter().cloned().fold(f64::INFINITY, f64::min);
        if spread.abs() < 0.05 && episode.phase != Phase::Plan {
            fires.push(WatcherFire {
                kind: WatcherKind::ConfidenceStagnation,
                effect: WatcherEffect::ForcePhase(Phase::Plan),
            });
        }
    }

    // Budget-half-no-progress: over half the step budget with no pass.
    if episode.phase != Phase::Simplify
        && episode.step_count * 2 > episode.budget.max_steps
        && !episode.pass_seen
    {
        fires.push(WatcherFire {
            kind: WatcherKind::BudgetHalfNoProgress,
            effect: WatcherEffect::ForcePhase(Phase::Simplify),
        });
    }

    // Scope-creep: intents keep multiplying without progress.
    if episode.distinct_intents.len() as u64 > 2 * passes_allowance(episode) + 4
        && episode.phase != Phase::Plan
    {
        fires.push(WatcherFire {
            kind: WatcherKind::ScopeCreep,
            effect: WatcherEffect::ForcePhase(Phase::Plan),
        });
    }

    // Validation-gap: two or more execute steps without a validate step.
    if episode.executes_since_validate >= 2 {
        fires.push(WatcherFire {
            kind: WatcherKind::ValidationGap,
            effect: WatcherEffect::ForcePhase(Phase::Validate),
        });
    }

    fires
}

fn passes_allowance(episode: &Episode) -> u64 {
    if episode.pass_seen { episode.step_count } else { 0 }
}

/// Tools admissible in minimal (escape) mode: read, search, and test actions.
pub fn minimal_mode_allows(tool: &str) -> bool {
    let t = tool.to_lowercase();
    ["read", "grep", "search", "glob", "find", "list", "ls", "test", "cat"]
        .iter()
        .any(|allowed| t.contains(allowed))
}
