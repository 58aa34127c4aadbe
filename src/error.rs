//! Rich diagnostic error types for the seshat engine.
//!
//! Each subsystem defines its own error type with miette `#[diagnostic]` derives,
//! providing error codes, help text, and source chains so users know exactly what
//! went wrong and how to fix it.

use miette::Diagnostic;
use thiserror::Error;

/// Top-level error type for the seshat engine.
///
/// Each variant wraps a subsystem-specific error, preserving the full diagnostic
/// chain (error codes, help text, source spans) through to the user.
#[derive(Debug, Error, Diagnostic)]
pub enum SeshatError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Insight(#[from] InsightError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Eidos(#[from] EidosError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Distill(#[from] DistillError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Advisor(#[from] AdvisorError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Tuner(#[from] TunerError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Bridge(#[from] BridgeError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),
}

// ---------------------------------------------------------------------------
// Queue errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum QueueError {
    #[error("queue lock not acquired within {waited_ms} ms")]
    #[diagnostic(
        code(seshat::queue::contention),
        help(
            "Another process holds the event-log lock. The event was written to \
             the overflow sidecar instead of being lost. If this happens often, \
             check for a wedged writer holding queue/events.jsonl open."
        )
    )]
    Contention { waited_ms: u64 },

    #[error("event rejected: {reason}")]
    #[diagnostic(
        code(seshat::queue::schema),
        help(
            "The inbound record is missing required fields or carries out-of-range \
             values. It was recorded to invalid_events.jsonl for inspection."
        )
    )]
    SchemaViolation { reason: String },

    #[error("I/O error on {path}: {source}")]
    #[diagnostic(
        code(seshat::queue::io),
        help(
            "A filesystem operation on the event log failed. Check that the data \
             directory exists, has correct permissions, and the disk is not full."
        )
    )]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("rotation failed: {message}")]
    #[diagnostic(
        code(seshat::queue::rotate),
        help(
            "The active log could not be renamed to its archive name. Readers keep \
             working against the old file; rotation retries on the next cycle."
        )
    )]
    RotateFailed { message: String },
}

// ---------------------------------------------------------------------------
// Insight store errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum InsightError {
    #[error("persistence failed for {path}: {source}")]
    #[diagnostic(
        code(seshat::insight::persist),
        help(
            "The atomic write (temp-then-rename) of the insight snapshot failed. \
             In-memory state stays authoritative; the write is retried next cycle."
        )
    )]
    Persist {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("insight snapshot corrupt: {message}")]
    #[diagnostic(
        code(seshat::insight::corrupt),
        help(
            "cognitive_insights.json could not be parsed. Move the file aside and \
             restart; the engine rebuilds from the event log over time."
        )
    )]
    Corrupt { message: String },

    #[error("unknown insight key: {key}")]
    #[diagnostic(
        code(seshat::insight::not_found),
        help("The referenced insight does not exist. It may have been pruned.")
    )]
    NotFound { key: String },
}

// ---------------------------------------------------------------------------
// Episode engine errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum EidosError {
    #[error("illegal phase transition: {from} -> {to}")]
    #[diagnostic(
        code(seshat::eidos::illegal_transition),
        help(
            "Episodes only move along the enumerated phase graph \
             (explore/plan/execute/validate/consolidate/diagnose/simplify/\
             escalate/halt). Complete or abandon the current phase first."
        )
    )]
    IllegalTransition { from: String, to: String },

    #[error("step admission blocked by {watcher}: {remediation}")]
    #[diagnostic(
        code(seshat::eidos::watcher_block),
        help("Satisfy the stated remediation, then submit the step again.")
    )]
    WatcherBlock {
        watcher: String,
        remediation: String,
    },

    #[error("episode budget exhausted: {which}")]
    #[diagnostic(
        code(seshat::eidos::budget),
        help(
            "The episode hit a hard budget (steps, time, or per-error retries) and \
             was halted. Start a new episode with a narrower goal."
        )
    )]
    BudgetExhausted { which: String },

    #[error("no active episode for session {session}")]
    #[diagnostic(
        code(seshat::eidos::no_episode),
        help("Open an episode for this session before admitting steps.")
    )]
    NoActiveEpisode { session: String },

    #[error("step record invalid: {message}")]
    #[diagnostic(
        code(seshat::eidos::invalid_step),
        help(
            "Every step needs an intent, a falsifiable hypothesis, a prediction, \
             a stop condition, and either a cited memory or a memory-absent \
             declaration."
        )
    )]
    InvalidStep { message: String },

    #[error("persistence failed for {path}: {source}")]
    #[diagnostic(
        code(seshat::eidos::persist),
        help("Episode and step records are written atomically; the write retries next cycle.")
    )]
    Persist {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// Distillation errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum DistillError {
    #[error("persistence failed for {path}: {source}")]
    #[diagnostic(
        code(seshat::distill::persist),
        help("Rules are written one JSON file per id under distillations/; the write retries next cycle.")
    )]
    Persist {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unknown distillation id: {id}")]
    #[diagnostic(
        code(seshat::distill::not_found),
        help("The referenced rule does not exist on disk. It may have been removed.")
    )]
    NotFound { id: String },
}

// ---------------------------------------------------------------------------
// Advisor errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum AdvisorError {
    #[error("advice log I/O error: {source}")]
    #[diagnostic(
        code(seshat::advisor::log_io),
        help(
            "Appending to advisor/advice_log.jsonl failed. Advice is still returned \
             to the caller; only the feedback loop is degraded until the disk recovers."
        )
    )]
    LogIo {
        #[source]
        source: std::io::Error,
    },

    #[error("effectiveness counters corrupt: followed {followed} > given {given} for source {source_tag}")]
    #[diagnostic(
        code(seshat::advisor::integrity),
        help(
            "Counters are recomputed from the advice log ground truth. A \
             data-integrity event is emitted; in aggressive tuner mode the repair \
             is applied automatically."
        )
    )]
    Integrity {
        source_tag: String,
        followed: u64,
        given: u64,
    },
}

// ---------------------------------------------------------------------------
// Auto-tuner errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum TunerError {
    #[error("refusing change of {tuneable}: {percent:.0}% exceeds the 30% bound")]
    #[diagnostic(
        code(seshat::tuner::change_bound),
        help("Any single tuning step may move a value by at most 30%. Apply smaller deltas across windows.")
    )]
    ChangeTooLarge { tuneable: String, percent: f64 },

    #[error("no snapshot available to revert to")]
    #[diagnostic(
        code(seshat::tuner::no_snapshot),
        help("Reverts need a prior snapshot in tuneable_history/. Snapshots are kept for the last 5 applies.")
    )]
    NoSnapshot,

    #[error("snapshot I/O error at {path}: {source}")]
    #[diagnostic(
        code(seshat::tuner::snapshot_io),
        help("Snapshot-before-apply is mandatory; the change was not applied.")
    )]
    SnapshotIo {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// Bridge cycle errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum BridgeError {
    #[error("heartbeat write failed: {source}")]
    #[diagnostic(
        code(seshat::bridge::heartbeat),
        help("External monitors read bridge_worker_heartbeat.json; the next cycle rewrites it.")
    )]
    Heartbeat {
        #[source]
        source: std::io::Error,
    },

    #[error("external memory bridge unavailable: {message}")]
    #[diagnostic(
        code(seshat::bridge::membridge),
        help(
            "The adapter is health-checked with exponential backoff and never blocks \
             the cycle. Outbound records queue offline until it recovers."
        )
    )]
    MemBridgeDown { message: String },
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("invalid configuration: {message}")]
    #[diagnostic(
        code(seshat::config::invalid),
        help("Check the tuneables file and CLI flags. {message}")
    )]
    Invalid { message: String },

    #[error("tuneables file corrupt at {path}: {message}")]
    #[diagnostic(
        code(seshat::config::corrupt),
        help(
            "tuneables.json could not be parsed. Restore a snapshot from \
             tuneable_history/ or delete the file to regain defaults."
        )
    )]
    Corrupt { path: String, message: String },

    #[error("trigger rules file error at {path}: {message}")]
    #[diagnostic(
        code(seshat::config::trigger_rules),
        help("Trigger rules are TOML with [[rule]] entries carrying pattern, rule_name, and priority.")
    )]
    TriggerRules { path: String, message: String },

    #[error("persistence failed for {path}: {source}")]
    #[diagnostic(
        code(seshat::config::persist),
        help("Configuration files are replaced atomically; the previous file is untouched on failure.")
    )]
    Persist {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Convenience alias for functions returning seshat results.
pub type SeshatResult<T> = std::result::Result<T, SeshatError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_error_converts_to_seshat_error() {
        let err = QueueError::Contention { waited_ms: 500 };
        let top: SeshatError = err.into();
        assert!(matches!(top, SeshatError::Queue(QueueError::Contention { .. })));
    }

    #[test]
    fn eidos_error_converts_to_seshat_error() {
        let err = EidosError::IllegalTransition {
            from: "consolidate".into(),
            to: "execute".into(),
        };
        let top: SeshatError = err.into();
        assert!(matches!(top, SeshatError::Eidos(EidosError::IllegalTransition { .. })));
    }

    #[test]
    fn error_display_messages_are_descriptive() {
        let err = AdvisorError::Integrity {
            source_tag: "trigger".into(),
            followed: 7,
            given: 4,
        };
        let msg = format!("{err}");
        assert!(msg.contains("7"));
        assert!(msg.contains("4"));
        assert!(msg.contains("trigger"));
    }

    #[test]
    fn watcher_block_names_remediation() {
        let err = EidosError::WatcherBlock {
            watcher: "diff-thrash".into(),
            remediation: "freeze artifact, change approach".into(),
        };
        assert!(format!("{err}").contains("freeze artifact"));
    }
}
