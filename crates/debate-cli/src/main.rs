//! Debate - multi-agent debate coordination CLI
//!
//! The `debate` command starts tasks, drives their analysis rounds to a
//! scored decision and records the human steps that follow.
//!
//! ## Commands
//!
//! - `run`: create a task and debate it until a human has to act
//! - `status` / `list` / `history`: inspect tasks and their rounds
//! - `events`: print a task's persisted event log
//! - `approve`, `implemented`, `verified`: record human decisions
//! - `cancel` / `resume`: stop a task or pick up an interrupted one
//! - `triage` / `score`: run the classifier or the scorer standalone

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::{info, Level};

use debate_core::telemetry::init_tracing;
use debate_core::{
    AgentExecutor, AgentFailure, AgentRequest, ApprovalDecision, CommandExecutor,
    ConsensusEngine, ConsensusOutcome, DebateEngine, EngineConfig, Participant, TaskRequest,
    TaskStatusView, TriageClassifier, TriageVerdict,
};
use debate_state::{
    ConsensusRecord, EventRecord, MemoryJobQueue, SurrealDebateStore, ANALYSIS_STREAM,
};

#[derive(Parser)]
#[command(name = "debate")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Multi-agent debate coordination engine", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Command output format
    #[arg(long, global = true, value_enum, default_value_t = Format::Text)]
    format: Format,

    /// Engine configuration file (TOML)
    #[arg(long, global = true, env = "DEBATE_CONFIG")]
    config: Option<PathBuf>,

    /// Keep all state in memory for this invocation only
    #[arg(long, global = true)]
    ephemeral: bool,

    /// Program invoked once per agent run
    #[arg(long, global = true, env = "DEBATE_AGENT_CMD")]
    agent_cmd: Option<PathBuf>,

    /// Extra argument for the agent program (repeatable)
    #[arg(long = "agent-arg", global = true)]
    agent_args: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a task and debate it until approval or escalation
    Run {
        /// Task title
        title: String,

        /// Longer description handed to the agents
        #[arg(short, long, default_value = "")]
        description: String,

        /// Number of files the change is expected to touch
        #[arg(long)]
        change_estimate: Option<u32>,

        /// Run the explorer role before the first round
        #[arg(long)]
        explore: bool,

        /// Stop after triage and scoping
        #[arg(long)]
        no_debate: bool,
    },

    /// Show one task
    Status {
        /// Task slug
        slug: String,
    },

    /// List all tasks
    List,

    /// Show the consensus result of every round of a task
    History {
        /// Task slug
        slug: String,
    },

    /// Show the event log of a task, oldest first
    Events {
        /// Task slug
        slug: String,
    },

    /// Decide on a plan awaiting approval
    Approve {
        /// Task slug
        slug: String,

        /// Send the plan back for another round
        #[arg(long, conflicts_with = "reject")]
        revise: bool,

        /// Reject the plan and cancel the task
        #[arg(long)]
        reject: bool,
    },

    /// Report the result of implementing an approved plan
    Implemented {
        /// Task slug
        slug: String,

        /// The implementation failed
        #[arg(long)]
        failed: bool,

        /// Free-form notes stored on the task
        #[arg(short, long)]
        notes: Option<String>,
    },

    /// Report the result of verifying an implementation
    Verified {
        /// Task slug
        slug: String,

        /// Verification failed; the task goes back to implementing
        #[arg(long)]
        failed: bool,
    },

    /// Cancel a task and its running agents
    Cancel {
        /// Task slug
        slug: String,
    },

    /// Resume an interrupted or revised debate
    Resume {
        /// Task slug
        slug: String,
    },

    /// Classify a request without creating a task
    Triage {
        /// Request text
        request: String,

        /// Number of files the change is expected to touch
        #[arg(long)]
        change_estimate: Option<u32>,
    },

    /// Score a JSON array of participants with the configured weights
    Score {
        /// Path to the participants file
        participants: PathBuf,
    },
}

/// Stand-in executor when no agent program is configured; every run fails
/// permanently so debates escalate instead of hanging.
struct NoAgentExecutor;

#[async_trait]
impl AgentExecutor for NoAgentExecutor {
    async fn execute(&self, request: &AgentRequest) -> Result<String, AgentFailure> {
        Err(AgentFailure::Permanent(format!(
            "no agent program configured for role {} (set --agent-cmd or DEBATE_AGENT_CMD)",
            request.role
        )))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    let config = EngineConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    let format = cli.format;

    match &cli.command {
        Commands::Triage {
            request,
            change_estimate,
        } => return cmd_triage(request, *change_estimate, format),
        Commands::Score { participants } => return cmd_score(&config, participants, format),
        _ => {}
    }

    let mut engine = open_engine(&cli, config).await?;
    let result = match cli.command {
        Commands::Run {
            title,
            description,
            change_estimate,
            explore,
            no_debate,
        } => {
            engine.start_workers();
            let request = TaskRequest {
                title,
                description,
                change_estimate,
                explore,
            };
            cmd_run(&engine, request, no_debate, format).await
        }
        Commands::Status { slug } => cmd_status(&engine, &slug, format).await,
        Commands::List => cmd_list(&engine, format).await,
        Commands::History { slug } => cmd_history(&engine, &slug, format).await,
        Commands::Events { slug } => cmd_events(&engine, &slug, format).await,
        Commands::Approve {
            slug,
            revise,
            reject,
        } => {
            let decision = if reject {
                ApprovalDecision::Reject
            } else if revise {
                ApprovalDecision::Revise
            } else {
                ApprovalDecision::Approve
            };
            cmd_approve(&engine, &slug, decision, format).await
        }
        Commands::Implemented {
            slug,
            failed,
            notes,
        } => cmd_implemented(&engine, &slug, !failed, notes, format).await,
        Commands::Verified { slug, failed } => cmd_verified(&engine, &slug, !failed, format).await,
        Commands::Cancel { slug } => cmd_cancel(&engine, &slug, format).await,
        Commands::Resume { slug } => {
            engine.start_workers();
            cmd_resume(&engine, &slug, format).await
        }
        Commands::Triage { .. } | Commands::Score { .. } => Ok(()),
    };

    engine.shutdown().await;
    result
}

/// Build the engine over the configured store.
///
/// The job stream is process-local: work still queued when the process
/// exits is re-enqueued by `resume` under the same idempotency keys.
async fn open_engine(cli: &Cli, config: EngineConfig) -> Result<DebateEngine> {
    let executor: Arc<dyn AgentExecutor> = match &cli.agent_cmd {
        Some(program) => Arc::new(CommandExecutor::new(program).with_args(cli.agent_args.clone())),
        None => Arc::new(NoAgentExecutor),
    };

    if cli.ephemeral {
        info!("using ephemeral in-memory state");
        return DebateEngine::ephemeral(executor, config).context("Failed to build engine");
    }

    let store = SurrealDebateStore::from_env()
        .await
        .context("Failed to connect to debate database")?;
    let queue = MemoryJobQueue::new().with_max_depth(ANALYSIS_STREAM, config.queue.max_depth);
    DebateEngine::new(Arc::new(store), Arc::new(queue), executor, config)
        .context("Failed to build engine")
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn render_view(view: &TaskStatusView) -> String {
    let score = view
        .last_consensus_score
        .map(|s| format!("{s:.1}"))
        .unwrap_or_else(|| "-".to_string());
    let complexity = view
        .complexity
        .map(|c| c.to_string())
        .unwrap_or_else(|| "-".to_string());
    let mut line = format!(
        "{:<40} {:<18} round {}/{}  score {:>5}  {}",
        view.task_slug, view.status, view.current_round, view.max_rounds, score, complexity
    );
    if view.pending_escalation {
        let reason = view
            .escalation_reason
            .map(|r| r.to_string())
            .unwrap_or_else(|| "unspecified".to_string());
        line.push_str(&format!("  ESCALATED ({reason})"));
    }
    line
}

fn print_view(view: &TaskStatusView, format: Format) -> Result<()> {
    match format {
        Format::Json => print_json(view),
        Format::Text => {
            println!("{}", render_view(view));
            Ok(())
        }
    }
}

fn render_consensus(record: &ConsensusRecord) -> String {
    let mut out = format!(
        "Round {}: score {:.1} -> {}",
        record.round_number, record.score, record.decision.as_str()
    );
    if let Some(reason) = record.escalation_reason {
        out.push_str(&format!(" ({reason})"));
    }
    if record.fast_track {
        out.push_str(" [fast track]");
    }
    out.push('\n');
    for factor in &record.breakdown {
        out.push_str(&format!(
            "  {:<10} raw {:>6.1}  x {:.2} = {:>5.1}\n",
            factor.factor.as_str(),
            factor.raw,
            factor.weight,
            factor.weighted
        ));
    }
    for d in &record.disagreements {
        out.push_str(&format!("  disagree on {}: {}\n", d.factor.as_str(), d.items.join(", ")));
    }
    for item in &record.agreed_items {
        out.push_str(&format!("  - {item}\n"));
    }
    out
}

fn render_event(event: &EventRecord) -> String {
    let mut out = format!(
        "{} {:<18}",
        event.created_at.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
        event.kind.as_str()
    );
    if let Some(round) = event.round_number {
        out.push_str(&format!(" r{round}"));
    }
    out.push(' ');
    out.push_str(&event.message);
    if let Some(ms) = event.duration_ms {
        out.push_str(&format!(" ({ms} ms)"));
    }
    out
}

async fn cmd_run(
    engine: &DebateEngine,
    request: TaskRequest,
    no_debate: bool,
    format: Format,
) -> Result<()> {
    let coordinator = engine.coordinator();
    let task = coordinator.start(request).await.context("Failed to start task")?;
    info!(slug = %task.slug, "task created");
    if no_debate {
        return print_view(&TaskStatusView::from(&task), format);
    }
    let view = coordinator
        .run_debate(&task.slug)
        .await
        .with_context(|| format!("Debate for {} did not finish", task.slug))?;
    print_view(&view, format)
}

async fn cmd_status(engine: &DebateEngine, slug: &str, format: Format) -> Result<()> {
    let view = engine.coordinator().status(slug).await?;
    print_view(&view, format)
}

async fn cmd_list(engine: &DebateEngine, format: Format) -> Result<()> {
    let views = engine.coordinator().list().await?;
    match format {
        Format::Json => print_json(&views),
        Format::Text => {
            if views.is_empty() {
                println!("No tasks.");
            }
            for view in &views {
                println!("{}", render_view(view));
            }
            Ok(())
        }
    }
}

async fn cmd_history(engine: &DebateEngine, slug: &str, format: Format) -> Result<()> {
    let history = engine.coordinator().consensus_history(slug).await?;
    match format {
        Format::Json => print_json(&history),
        Format::Text => {
            if history.is_empty() {
                println!("No scored rounds for {slug}.");
            }
            for record in &history {
                print!("{}", render_consensus(record));
            }
            Ok(())
        }
    }
}

async fn cmd_events(engine: &DebateEngine, slug: &str, format: Format) -> Result<()> {
    let events = engine.coordinator().events(slug).await?;
    match format {
        Format::Json => print_json(&events),
        Format::Text => {
            for event in &events {
                println!("{}", render_event(event));
            }
            Ok(())
        }
    }
}

async fn cmd_approve(
    engine: &DebateEngine,
    slug: &str,
    decision: ApprovalDecision,
    format: Format,
) -> Result<()> {
    let view = engine.coordinator().record_approval(slug, decision).await?;
    if decision == ApprovalDecision::Revise && format == Format::Text {
        println!("Plan sent back; continue with `debate resume {slug}`.");
    }
    print_view(&view, format)
}

async fn cmd_implemented(
    engine: &DebateEngine,
    slug: &str,
    success: bool,
    notes: Option<String>,
    format: Format,
) -> Result<()> {
    let view = engine
        .coordinator()
        .record_implementation_result(slug, success, notes)
        .await?;
    print_view(&view, format)
}

async fn cmd_verified(engine: &DebateEngine, slug: &str, passed: bool, format: Format) -> Result<()> {
    let view = engine.coordinator().record_verification(slug, passed).await?;
    print_view(&view, format)
}

async fn cmd_cancel(engine: &DebateEngine, slug: &str, format: Format) -> Result<()> {
    let view = engine.coordinator().cancel(slug).await?;
    print_view(&view, format)
}

async fn cmd_resume(engine: &DebateEngine, slug: &str, format: Format) -> Result<()> {
    let view = engine
        .coordinator()
        .resume(slug)
        .await
        .with_context(|| format!("Failed to resume {slug}"))?;
    print_view(&view, format)
}

fn render_triage(verdict: &TriageVerdict) -> String {
    format!(
        "complexity: {}\nscore: {:.2}\nconfidence: {:.2}\naction: {}\nreasons: {}{}",
        verdict.complexity,
        verdict.score,
        verdict.confidence,
        verdict.recommended_action(),
        if verdict.reasons.is_empty() {
            "-".to_string()
        } else {
            verdict.reasons.join(", ")
        },
        if verdict.requires_confirmation {
            "\nlow confidence: confirm before routing"
        } else {
            ""
        }
    )
}

fn cmd_triage(request: &str, change_estimate: Option<u32>, format: Format) -> Result<()> {
    let classifier = TriageClassifier::new()?;
    let verdict = classifier.classify(request, change_estimate);
    match format {
        Format::Json => print_json(&verdict),
        Format::Text => {
            println!("{}", render_triage(&verdict));
            Ok(())
        }
    }
}

fn load_participants(path: &Path) -> Result<Vec<Participant>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let participants: Vec<Participant> = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not a JSON array of participants", path.display()))?;
    if participants.is_empty() {
        bail!("{} contains no participants", path.display());
    }
    Ok(participants)
}

fn score_file(config: &EngineConfig, path: &Path) -> Result<ConsensusOutcome> {
    let participants = load_participants(path)?;
    Ok(ConsensusEngine::new(&config.consensus).score(&participants))
}

fn cmd_score(config: &EngineConfig, path: &Path, format: Format) -> Result<()> {
    let outcome = score_file(config, path)?;
    match format {
        Format::Json => print_json(&outcome),
        Format::Text => {
            println!(
                "score {:.1} (threshold {:.1}){}",
                outcome.score,
                config.consensus.threshold,
                if outcome.comparable {
                    ""
                } else {
                    " - not comparable"
                }
            );
            for factor in &outcome.breakdown {
                println!(
                    "  {:<10} raw {:>6.1}  x {:.2} = {:>5.1}",
                    factor.factor.as_str(),
                    factor.raw,
                    factor.weight,
                    factor.weighted
                );
            }
            Ok(())
        }
    }
}
