//! End-to-end scenarios for the seshat engine.
//!
//! These drive the public surface the way a host assistant would: capture
//! events, run bridge cycles, ask for advice, report outcomes, and watch the
//! learning loop close.

use seshat::advisor::{AdviceRequest, AdviceSource};
use seshat::bridge;
use seshat::config::Flags;
use seshat::core::Core;
use seshat::distill::{Distillation, RuleScope, RuleType};
use seshat::eidos::{
    MemoryAssertion, Phase, StepAdmission, StepEvaluation, StepPlan, StepResult,
    ValidationEvidence, WatcherKind,
};
use seshat::event::{Event, OutcomeStatus};
use seshat::paths::SeshatPaths;

fn open_core(dir: &std::path::Path) -> Core {
    Core::open(SeshatPaths::at(dir), Flags::default()).unwrap()
}

#[test]
fn explicit_remember_flows_from_prompt_to_advice() {
    let dir = tempfile::TempDir::new().unwrap();
    let core = open_core(dir.path());

    core.capture(&Event::user_prompt(
        "s1",
        "Remember this: always validate input before database operations",
    ));
    bridge::run_cycle(&core, 1);

    // One quality insight in wisdom, critical tier, reliable.
    let snapshot = core.insights().snapshot();
    assert_eq!(snapshot.len(), 1);
    let insight = &snapshot[0];
    assert_eq!(insight.category, seshat::insight::InsightCategory::Wisdom);
    assert_eq!(insight.tier, seshat::scorer::Tier::Critical);
    assert!(insight.reliability() >= 0.7);

    // The advisor surfaces it for a Bash call in a database context.
    let advice = core.advise(&AdviceRequest {
        session_id: "s1",
        tool: "Bash",
        input_hints: "",
        context: "database operations",
    });
    assert!(!advice.is_empty());
    assert!(advice[0].text.contains("validate input"));
    assert!(advice[0].why.starts_with("Trigger") || advice[0].why.starts_with("Semantic"));
}

#[test]
fn duplicate_prompts_are_suppressed() {
    let dir = tempfile::TempDir::new().unwrap();
    let core = open_core(dir.path());

    for _ in 0..3 {
        core.capture(&Event::user_prompt(
            "s1",
            "Remember this: always validate input before database operations",
        ));
    }
    bridge::run_cycle(&core, 1);

    assert_eq!(core.insights().len(), 1);
    let insight = &core.insights().snapshot()[0];
    assert!(insight.times_validated >= 2);
    assert!(core.gate().counters().duplicate >= 2);
}

#[test]
fn primitive_text_never_reaches_the_store() {
    let dir = tempfile::TempDir::new().unwrap();
    let core = open_core(dir.path());

    core.capture(&Event::user_prompt("s1", "Read tasks succeed with Read"));
    let before = core.gate().counters().primitive;
    bridge::run_cycle(&core, 1);

    assert!(core.insights().is_empty());
    assert!(core.gate().counters().primitive > before);
}

#[test]
fn diff_thrash_watcher_blocks_fourth_touch() {
    let dir = tempfile::TempDir::new().unwrap();
    let core = open_core(dir.path());

    let plan = |phase: Phase| StepPlan {
        phase,
        intent: "fix the parser".into(),
        hypothesis: "the tokenizer drops spans".into(),
        prediction: "tests pass".into(),
        confidence_before: 0.5,
        tool: "Edit".into(),
        stop_condition: "two failures".into(),
        memory: Some(MemoryAssertion::Absent {
            reason: "no prior parser learnings".into(),
        }),
        artifact: Some("src/parser.rs".into()),
        trace_id: None,
    };
    let result = |confidence: f64| StepResult {
        result: "edited".into(),
        evaluation: StepEvaluation::Pass,
        validation: Some(ValidationEvidence::Observed {
            evidence: "cargo test output".into(),
        }),
        confidence_after: confidence,
        lesson: vec!["span tracking is brittle".into()],
        error_signature: None,
        new_evidence: true,
        modified_state: true,
    };

    // explore -> plan, then three execute-family steps on the same artifact.
    let mut read_plan = plan(Phase::Explore);
    read_plan.tool = "Read".into();
    read_plan.artifact = None;
    let StepAdmission::Admitted { step_id, .. } = core.admit_step("s1", read_plan).unwrap() else {
        panic!()
    };
    let mut r = result(0.3);
    r.modified_state = false;
    core.complete_step("s1", &step_id, r).unwrap();

    let mut plan_step = plan(Phase::Plan);
    plan_step.tool = "Read".into();
    plan_step.artifact = None;
    let StepAdmission::Admitted { step_id, .. } = core.admit_step("s1", plan_step).unwrap() else {
        panic!()
    };
    let mut r = result(0.45);
    r.modified_state = false;
    core.complete_step("s1", &step_id, r).unwrap();

    // Three execute-family steps modifying the same artifact; the
    // validation-gap watcher may interleave a forced validate phase.
    for i in 0..3 {
        let current = core.active_phase("s1").unwrap();
        let target = if current.can_transition_to(Phase::Execute) {
            Phase::Execute
        } else {
            current
        };
        let StepAdmission::Admitted { step_id, .. } = core.admit_step("s1", plan(target)).unwrap()
        else {
            panic!("unexpected block at touch {i}")
        };
        core.complete_step("s1", &step_id, result(0.5 + 0.15 * i as f64))
            .unwrap();
    }

    // Fourth modification of the same artifact is refused.
    let current = core.active_phase("s1").unwrap();
    let target = if current.can_transition_to(Phase::Execute) {
        Phase::Execute
    } else {
        current
    };
    match core.admit_step("s1", plan(target)).unwrap() {
        StepAdmission::Blocked {
            watcher,
            remediation,
            forced_phase,
        } => {
            assert_eq!(watcher, WatcherKind::DiffThrash);
            assert_eq!(remediation, "freeze artifact, change approach");
            assert_eq!(forced_phase, Some(Phase::Diagnose));
        }
        other => panic!("expected diff-thrash block, got {other:?}"),
    }
    assert_eq!(core.active_phase("s1"), Some(Phase::Diagnose));
}

#[test]
fn advice_outcome_closure_updates_counters_and_rules() {
    let dir = tempfile::TempDir::new().unwrap();
    let core = open_core(dir.path());

    // Seed a distillation whose settling window is already open.
    let rule = Distillation {
        id: "heuristic-test0001".into(),
        rule_type: RuleType::Heuristic,
        statement: "When editing config files, validate the schema first".into(),
        trigger_keywords: vec!["edit".into(), "config".into(), "schema".into()],
        confidence: 0.6,
        validation_count: 0,
        contradiction_count: 0,
        times_retrieved: 0,
        times_used: 0,
        times_helped: 0,
        source_step_ids: vec![],
        scope: RuleScope::Project,
        created_at: 1,
        next_revalidate_at: 0,
    };
    core.distillations().upsert(&rule).unwrap();

    let advice = core.advise(&AdviceRequest {
        session_id: "s1",
        tool: "Edit",
        input_hints: "config.toml",
        context: "edit the config schema",
    });
    assert!(!advice.is_empty());
    let top = &advice[0];
    assert_eq!(top.source, AdviceSource::Distillation);

    // Retrieval counter moved when the advice surfaced.
    assert_eq!(core.distillations().get(&rule.id).unwrap().times_retrieved, 1);

    let records = core
        .report_outcome("Edit", "s1", OutcomeStatus::Success)
        .unwrap();
    assert!(!records.is_empty());
    assert!(records.iter().all(|r| r.followed && r.helpful == Some(true)));

    // Effectiveness for the source moved 1/1.
    let totals = core.advisor().effectiveness().totals();
    let counters = &totals["distillation"];
    assert!(counters.followed >= 1);
    assert!(counters.helpful >= 1);
    assert!(counters.followed <= counters.advice_given);

    // The backing rule gained +0.05 confidence.
    let updated = core.distillations().get(&rule.id).unwrap();
    assert!((updated.confidence - 0.65).abs() < 1e-9);
    assert_eq!(updated.times_used, 1);
    assert_eq!(updated.times_helped, 1);
}

#[test]
fn advisor_respects_item_and_source_caps() {
    let dir = tempfile::TempDir::new().unwrap();
    let core = open_core(dir.path());

    for i in 0..20 {
        core.capture(&Event::user_prompt(
            "s1",
            format!("Remember this: always check database constraint {i} before inserting rows"),
        ));
    }
    bridge::run_cycle(&core, 1);

    let tuneables = core.tuneables();
    let advice = core.advise(&AdviceRequest {
        session_id: "s1",
        tool: "Bash",
        input_hints: "",
        context: "database inserting",
    });
    assert!(advice.len() <= tuneables.max_advice_items as usize);
    let mut per_source = std::collections::HashMap::new();
    for item in &advice {
        *per_source.entry(item.source).or_insert(0usize) += 1;
    }
    for count in per_source.values() {
        assert!(*count <= tuneables.advisor_source_cap as usize);
    }
}

#[test]
fn followed_never_exceeds_given_after_many_reports() {
    let dir = tempfile::TempDir::new().unwrap();
    let core = open_core(dir.path());

    core.capture(&Event::user_prompt(
        "s1",
        "Remember this: always run migrations inside a database transaction",
    ));
    bridge::run_cycle(&core, 1);

    for _ in 0..3 {
        core.advise(&AdviceRequest {
            session_id: "s1",
            tool: "Bash",
            input_hints: "",
            context: "database migrations",
        });
        core.report_outcome("Bash", "s1", OutcomeStatus::Success).unwrap();
    }

    for counters in core.advisor().effectiveness().totals().values() {
        assert!(counters.followed <= counters.advice_given);
    }
    assert!(core.advisor().verify_integrity().is_empty());
}

#[test]
fn session_end_consolidates_episode_for_distillation() {
    let dir = tempfile::TempDir::new().unwrap();
    let core = open_core(dir.path());

    let plan = StepPlan {
        phase: Phase::Explore,
        intent: "survey the repository layout".into(),
        hypothesis: "the crate is a workspace".into(),
        prediction: "find several members".into(),
        confidence_before: 0.5,
        tool: "Read".into(),
        stop_condition: "one pass".into(),
        memory: Some(MemoryAssertion::Absent {
            reason: "fresh repository".into(),
        }),
        artifact: None,
        trace_id: None,
    };
    let StepAdmission::Admitted { step_id, .. } = core.admit_step("s1", plan).unwrap() else {
        panic!()
    };
    core.complete_step(
        "s1",
        &step_id,
        StepResult {
            result: "workspace with three members".into(),
            evaluation: StepEvaluation::Pass,
            validation: None,
            confidence_after: 0.8,
            lesson: vec!["layout is a cargo workspace".into()],
            error_signature: None,
            new_evidence: true,
            modified_state: false,
        },
    )
    .unwrap();

    core.capture(&Event::session_marker("s1", false));
    bridge::run_cycle(&core, 1);

    assert_eq!(core.episode_count(), 1);
    let steps = core.completed_steps();
    assert_eq!(steps.len(), 1);
    assert!(steps[0].is_complete());
}
