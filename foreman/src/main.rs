//! Story-driven job orchestration CLI.
//!
//! Manages a board of stories (`.foreman/board.json`) and drives one job
//! per story through generate-and-test passes, human gates, and a
//! rebase-merge. All state persists under `.foreman/`, so every command is
//! safe to re-run after a crash or restart.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use foreman::controller::{Collaborators, Engine, TickOutcome};
use foreman::core::invariants::validate_invariants;
use foreman::core::job::JobState;
use foreman::core::permission::Fingerprint;
use foreman::core::types::PermissionDecision;
use foreman::exit_codes;
use foreman::io::board::FileBoard;
use foreman::io::clock::SystemClock;
use foreman::io::config::{ForemanConfig, load_config};
use foreman::io::generator::CommandGenerator;
use foreman::io::init::{ForemanPaths, InitOptions, init_foreman};
use foreman::io::memory::TailCompressor;
use foreman::io::outbox::{Outbox, OutboxNotifier, OutboxReviewHost};
use foreman::io::store::Store;
use foreman::io::test_runner::CommandTestRunner;
use foreman::logging;
use foreman::question_gate::ResolveOutcome;

#[derive(Parser)]
#[command(
    name = "foreman",
    version,
    about = "Story-driven job orchestration for an automated coding agent"
)]
struct Cli {
    /// Target repository root.
    #[arg(long, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.foreman/` scaffolding (config, board, state, memory).
    Init {
        /// Overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },
    /// Claim the next ready story and drive its job until it suspends.
    Tick,
    /// Re-drive a suspended job (re-checks gate deadlines).
    Resume { job_id: u64 },
    /// Deliver a human answer to a pending question.
    Answer { question_id: u64, text: String },
    /// Approve a pending permission fingerprint.
    Approve { fingerprint: String },
    /// Deny a pending permission fingerprint.
    Deny { fingerprint: String },
    /// Re-approve a conflicted merge for another attempt.
    ApproveReview { job_id: u64 },
    /// Expire pending questions past their deadline.
    Sweep,
    /// Request cancellation of a job.
    Cancel { job_id: u64 },
    /// Print the job table.
    Status,
    /// Check store invariants and report violations.
    Validate,
}

fn main() -> ExitCode {
    logging::init();
    let cli = Cli::parse();
    match run(&cli) {
        Ok(code) => ExitCode::from(code as u8),
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(exit_codes::INVALID as u8)
        }
    }
}

fn run(cli: &Cli) -> Result<i32> {
    let paths = ForemanPaths::new(&cli.root);

    if let Command::Init { force } = &cli.command {
        init_foreman(&paths.root, &InitOptions { force: *force })?;
        println!("initialized {}", paths.foreman_dir.display());
        return Ok(exit_codes::OK);
    }

    let config = load_config(&paths.config_path)?;
    let outbox = Outbox::new(&paths.outbox_path);
    let board = FileBoard::new(&paths.board_path);
    let generator = CommandGenerator::new(config.generator.command.clone());
    let tests = CommandTestRunner::new(config.test.command.clone());
    let review = OutboxReviewHost::new(outbox.clone());
    let notifier = OutboxNotifier::new(outbox);
    let compressor = TailCompressor;
    let clock = SystemClock;

    let engine = Engine {
        paths: &paths,
        config: &config,
        store: Store::new(&paths.state_path),
        collab: Collaborators {
            board: &board,
            generator: &generator,
            tests: &tests,
            review: &review,
            notifier: &notifier,
            compressor: &compressor,
            clock: &clock,
        },
    };

    match &cli.command {
        Command::Init { .. } => unreachable!("handled above"),

        Command::Tick => match engine.tick()? {
            TickOutcome::Nothing => {
                println!("no claimable story");
                Ok(exit_codes::NOTHING_TO_DO)
            }
            TickOutcome::Drove { job_id, state } => {
                println!("job {job_id}: {}", state.as_str());
                Ok(state_exit_code(state))
            }
        },

        Command::Resume { job_id } => {
            let state = engine.resume(*job_id)?;
            println!("job {job_id}: {}", state.as_str());
            Ok(state_exit_code(state))
        }

        Command::Answer { question_id, text } => {
            let report = engine.answer(*question_id, text)?;
            match report.outcome {
                ResolveOutcome::Answered => println!(
                    "question {question_id} answered; job {}: {}",
                    report.job_id,
                    report.job_state.as_str()
                ),
                ResolveOutcome::AlreadyAnswered => {
                    println!("question {question_id} was already answered")
                }
                ResolveOutcome::Expired => println!(
                    "question {question_id} expired; answer discarded; job {}: {}",
                    report.job_id,
                    report.job_state.as_str()
                ),
            }
            Ok(state_exit_code(report.job_state))
        }

        Command::Approve { fingerprint } => {
            resolve_permission(&engine, fingerprint, PermissionDecision::Approved)
        }
        Command::Deny { fingerprint } => {
            resolve_permission(&engine, fingerprint, PermissionDecision::Denied)
        }

        Command::ApproveReview { job_id } => {
            let state = engine.approve_review(*job_id)?;
            println!("job {job_id}: {}", state.as_str());
            Ok(state_exit_code(state))
        }

        Command::Sweep => {
            let blocked = engine.sweep()?;
            if blocked.is_empty() {
                println!("no expired questions");
            }
            for (job_id, question_id) in &blocked {
                println!("question {question_id} expired; job {job_id} blocked");
            }
            Ok(exit_codes::OK)
        }

        Command::Cancel { job_id } => {
            let state = engine.cancel(*job_id)?;
            println!("job {job_id}: {}", state.as_str());
            Ok(exit_codes::OK)
        }

        Command::Status => {
            let ledger = engine.store.load_or_default()?;
            if ledger.jobs.is_empty() {
                println!("no jobs");
            }
            for job in &ledger.jobs {
                let mut line = format!(
                    "job {} story #{} [{}] passes {}/{} branch {}",
                    job.id,
                    job.story_id,
                    job.state.as_str(),
                    job.passes_used,
                    config.max_passes,
                    job.branch
                );
                if let Some(pr) = job.pr_number {
                    line.push_str(&format!(" pr #{pr}"));
                }
                if let Some(cause) = &job.block_cause {
                    line.push_str(&format!(" ({cause})"));
                }
                println!("{line}");
            }
            Ok(exit_codes::OK)
        }

        Command::Validate => {
            let ledger = engine.store.load_or_default()?;
            let errors = validate_invariants(&ledger, config.max_passes);
            if errors.is_empty() {
                println!("ok");
                return Ok(exit_codes::OK);
            }
            for error in &errors {
                eprintln!("invariant violation: {error}");
            }
            Ok(exit_codes::INVALID)
        }
    }
}

fn resolve_permission(
    engine: &Engine<'_>,
    fingerprint: &str,
    decision: PermissionDecision,
) -> Result<i32> {
    let fingerprint = Fingerprint::from_hex(fingerprint);
    let resumed = engine
        .resolve_permission(&fingerprint, decision)
        .with_context(|| format!("resolve permission {fingerprint}"))?;
    if resumed.is_empty() {
        println!("permission recorded; no job was waiting on it");
        return Ok(exit_codes::OK);
    }
    let mut code = exit_codes::OK;
    for (job_id, state) in &resumed {
        println!("job {job_id}: {}", state.as_str());
        code = code.max(state_exit_code(*state));
    }
    Ok(code)
}

fn state_exit_code(state: JobState) -> i32 {
    if state == JobState::Blocked {
        exit_codes::BLOCKED
    } else {
        exit_codes::OK
    }
}
