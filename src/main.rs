//! seshat CLI: self-evolving learning engine for AI coding assistants.

use std::io::BufRead;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use seshat::bridge;
use seshat::config::Flags;
use seshat::core::Core;
use seshat::error::SeshatError;
use seshat::event::Event;
use seshat::paths::SeshatPaths;
use seshat::persist;
use seshat::queue::CaptureOutcome;
use seshat::tuner::{self, AutoTuner, TunerMode};

/// Exit codes: 0 ok, 1 generic error, 2 misuse, 3 data-integrity violation.
const EXIT_OK: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_MISUSE: i32 = 2;
const EXIT_INTEGRITY: i32 = 3;

#[derive(Parser)]
#[command(name = "seshat", version, about = "Self-evolving learning engine")]
struct Cli {
    /// Data directory (overrides SESHAT_DATA_DIR and the ~/.seshat default).
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show engine state: queue, insights, episodes, advisor effectiveness.
    Status,

    /// Replay JSONL events through ingestion. Target: a file path, or "-"
    /// for stdin. (HTTP ingestion is the seshatd binary.)
    Ingest {
        target: String,

        /// Run one bridge cycle after ingesting.
        #[arg(long, default_value_t = true)]
        cycle: bool,
    },

    /// Promote insights that cleared the validation and reliability bars.
    Promote,

    /// Run one auto-tuner pass.
    Tune {
        /// suggest, conservative, moderate, or aggressive.
        #[arg(long, default_value = "suggest")]
        mode: String,
    },

    /// Prune aged-out insights and rotate the event log if due.
    Prune,
}

fn main() {
    init_tracing();
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("seshat: {e}");
            classify(&e)
        }
    };
    std::process::exit(code);
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let default_level = if std::env::var("SESHAT_DEBUG").map(|v| v == "1").unwrap_or(false) {
        "debug"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Exit code for an error kind.
fn classify(error: &SeshatError) -> i32 {
    match error {
        SeshatError::Advisor(seshat::error::AdvisorError::Integrity { .. }) => EXIT_INTEGRITY,
        SeshatError::Queue(seshat::error::QueueError::SchemaViolation { .. }) => EXIT_MISUSE,
        SeshatError::Config(_) => EXIT_MISUSE,
        _ => EXIT_ERROR,
    }
}

fn open_core(data_dir: Option<PathBuf>) -> Result<Core, SeshatError> {
    let paths = match data_dir {
        Some(dir) => SeshatPaths::at(dir),
        None => SeshatPaths::resolve().map_err(|e| {
            SeshatError::Config(seshat::error::ConfigError::Invalid {
                message: e.to_string(),
            })
        })?,
    };
    Core::open(paths, Flags::from_env())
}

fn run(cli: Cli) -> Result<i32, SeshatError> {
    match cli.command {
        Commands::Status => status(open_core(cli.data_dir)?),
        Commands::Ingest { target, cycle } => ingest(open_core(cli.data_dir)?, &target, cycle),
        Commands::Promote => promote(open_core(cli.data_dir)?),
        Commands::Tune { mode } => tune(open_core(cli.data_dir)?, &mode),
        Commands::Prune => prune(open_core(cli.data_dir)?),
    }
}

fn status(core: Core) -> Result<i32, SeshatError> {
    let state = core.queue().state();
    println!("queue");
    println!("  head:        {}", state.head);
    println!("  active:      {}", state.active_records);
    println!("  rotations:   {}", state.rotations);
    println!("  dropped:     {}", state.dropped);
    println!("  invalid:     {}", state.invalid);

    println!("insights ({} total)", core.insights().len());
    for (category, count) in core.insights().category_counts() {
        println!("  {category:<20} {count}");
    }

    println!("episodes:      {}", core.episode_count());
    println!("distillations: {}", core.distillations().count());

    println!("advisor effectiveness");
    for (source, counters) in core.advisor().effectiveness().totals() {
        println!(
            "  {source:<14} given {:>5}  followed {:>5}  helpful {:>5}",
            counters.advice_given, counters.followed, counters.helpful
        );
    }

    match persist::read_json::<bridge::Heartbeat>(&core.paths().heartbeat_file()) {
        Ok(Some(heartbeat)) => {
            let age_secs = seshat::event::now_ms().saturating_sub(heartbeat.ts_ms) / 1_000;
            println!(
                "heartbeat:     cycle {} ({age_secs}s ago, {} errors)",
                heartbeat.cycle_number, heartbeat.metrics.errors
            );
        }
        _ => println!("heartbeat:     none"),
    }

    // Counter corruption is worth a distinct exit code.
    let violations = core.advisor().verify_integrity();
    if !violations.is_empty() {
        for violation in &violations {
            eprintln!("seshat: {violation}");
        }
        return Ok(EXIT_INTEGRITY);
    }
    Ok(EXIT_OK)
}

fn ingest(core: Core, target: &str, cycle: bool) -> Result<i32, SeshatError> {
    if target.parse::<u16>().is_ok() {
        eprintln!(
            "seshat: port ingestion is served by the seshatd binary (build with --features server)"
        );
        return Ok(EXIT_MISUSE);
    }

    let reader: Box<dyn BufRead> = if target == "-" {
        Box::new(std::io::stdin().lock())
    } else {
        let file = std::fs::File::open(target).map_err(|e| {
            SeshatError::Queue(seshat::error::QueueError::Io {
                path: target.to_string(),
                source: e,
            })
        })?;
        Box::new(std::io::BufReader::new(file))
    };

    let mut accepted = 0u64;
    let mut dropped = 0u64;
    let mut rejected = 0u64;
    for line in reader.lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }
        let event: Event = match serde_json::from_str(&line) {
            Ok(e) => e,
            Err(_) => {
                let _ = persist::append_line(&core.paths().invalid_events_file(), &line);
                rejected += 1;
                continue;
            }
        };
        match core.ingest(&event) {
            Ok(CaptureOutcome::Accepted) => accepted += 1,
            Ok(CaptureOutcome::Dropped) => dropped += 1,
            Err(_) => rejected += 1,
        }
    }

    if cycle {
        bridge::run_cycle(&core, 0);
    }
    println!("ingested {accepted} events ({dropped} dropped, {rejected} rejected)");
    Ok(EXIT_OK)
}

fn promote(core: Core) -> Result<i32, SeshatError> {
    let tuneables = core.tuneables();
    let candidates = core
        .insights()
        .promotion_candidates(tuneables.min_validations, tuneables.promotion_threshold);
    if candidates.is_empty() {
        println!("no insights eligible for promotion");
        return Ok(EXIT_OK);
    }
    for insight in &candidates {
        core.insights().mark_promoted(&insight.key)?;
        println!(
            "promoted [{}] {} (validated {}x)",
            insight.category.as_str(),
            insight.text,
            insight.times_validated
        );
    }
    core.insights().persist_if_dirty()?;
    println!("{} insight(s) promoted", candidates.len());
    Ok(EXIT_OK)
}

fn tune(core: Core, mode: &str) -> Result<i32, SeshatError> {
    let mode: TunerMode = mode.parse().map_err(|message| {
        SeshatError::Config(seshat::error::ConfigError::Invalid { message })
    })?;

    let mut tuneables = core.tuneables();
    let metrics = tuner::measure(
        &core.advisor().effectiveness().totals(),
        &core.insights().snapshot(),
        core.distillations().count(),
        &core.completed_steps(),
    );
    let report = AutoTuner::new(mode).run_cycle(&metrics, &mut tuneables, core.paths())?;
    core.set_tuneables(tuneables);

    if let Some(snapshot) = &report.reverted_snapshot {
        println!("reverted to snapshot {snapshot} after metric degradation");
        return Ok(EXIT_OK);
    }
    if report.suggested.is_empty() {
        println!("system healthy; nothing to change");
        return Ok(EXIT_OK);
    }
    for change in &report.suggested {
        let applied = report
            .applied
            .iter()
            .any(|a| a.tuneable == change.tuneable);
        let marker = if applied { "applied" } else { "suggest" };
        println!(
            "{marker}: {} {:.3} -> {:.3}  ({})",
            change.tuneable, change.before, change.after, change.reason
        );
    }
    Ok(EXIT_OK)
}

fn prune(core: Core) -> Result<i32, SeshatError> {
    let tuneables = core.tuneables();
    let removed = core.insights().prune(
        seshat::event::now_secs(),
        tuneables.insight_max_age_days,
        tuneables.insight_min_effective,
    );
    core.insights().persist_if_dirty()?;
    let rotated = core.queue().rotate_if_needed()?;
    println!(
        "pruned {} insight(s); event log {}",
        removed.len(),
        if rotated { "rotated" } else { "not due for rotation" }
    );
    Ok(EXIT_OK)
}
