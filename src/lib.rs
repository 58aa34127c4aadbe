//! # seshat
//!
//! A self-evolving learning engine that runs alongside an AI coding
//! assistant. It observes the assistant's tool-use event stream, extracts
//! durable cognitive insights, distills recurring patterns into typed rules,
//! retrieves the most relevant subset before each tool call as advice, and
//! tracks whether that advice helped, continuously re-weighting itself.
//!
//! ## Architecture
//!
//! - **Event queue** (`queue`): append-only rotating JSONL log with locked
//!   captures and lock-free tail reads
//! - **Ingest pipeline** (`scorer`, `roast`, `insight`): importance tiers,
//!   five-dimension quality gating, decay-weighted insight store
//! - **Episodes** (`eidos`): step envelopes, budgets, watchers, and the
//!   phase state machine
//! - **Distillation** (`distill`): typed rules with revalidating confidence
//! - **Advisor** (`advisor`): hybrid retrieval with fusion ranking and an
//!   outcome feedback loop
//! - **Bridge cycle** (`bridge`): the periodic worker stitching it together
//! - **Auto-tuner** (`tuner`): guarded, reversible parameter adjustment
//!
//! ## Library usage
//!
//! ```no_run
//! use seshat::config::Flags;
//! use seshat::core::Core;
//! use seshat::event::Event;
//! use seshat::paths::SeshatPaths;
//!
//! let core = Core::open(SeshatPaths::resolve().unwrap(), Flags::from_env()).unwrap();
//! core.capture(&Event::user_prompt("session-1", "Remember this: always run the tests"));
//! seshat::bridge::run_cycle(&core, 1);
//! ```

pub mod advisor;
pub mod bridge;
pub mod config;
pub mod core;
pub mod distill;
pub mod eidos;
pub mod error;
pub mod event;
pub mod insight;
pub mod membridge;
pub mod paths;
pub mod patterns;
pub mod persist;
pub mod queue;
pub mod roast;
pub mod scorer;
pub mod triggers;
pub mod tuner;
