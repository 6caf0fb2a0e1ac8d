use anyhow::{Result, anyhow};
use clap::{Args, Parser, Subcommand};
use pilot_core::{AppConfig, ApprovalManager, EventCallback, Session};
use pilot_engine::{QueryStatus, ReactEngine};
use pilot_llm::HttpLlmClient;
use pilot_observe::Observer;
use pilot_playbook::{StrategyCategory, StrategyOutcome};
use pilot_policy::{PolicyEngine, StaticApprovalManager, TerminalApprovalManager};
use pilot_store::SessionStore;
use pilot_tools::ToolRegistry;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "pilot")]
#[command(about = "Pilot coding agent", long_about = None)]
struct Cli {
    /// Enable verbose logging to stderr.
    #[arg(short = 'v', long = "verbose", global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one query against the current workspace.
    Run(RunArgs),
    /// List stored sessions, most recent first.
    Sessions,
    /// Inspect or maintain the learned playbook.
    Playbook {
        #[command(subcommand)]
        command: PlaybookCmd,
    },
    /// Show or initialize configuration.
    Config {
        #[command(subcommand)]
        command: ConfigCmd,
    },
}

#[derive(Args)]
struct RunArgs {
    prompt: String,

    /// Continue the most recent session instead of starting fresh.
    #[arg(long = "continue", short = 'c')]
    continue_session: bool,

    /// Resume a specific session by id.
    #[arg(long = "resume", short = 'r')]
    resume: Option<String>,

    /// Approve every tool call without prompting.
    #[arg(long = "auto-approve")]
    auto_approve: bool,

    /// Override the configured model for this invocation.
    #[arg(long)]
    model: Option<String>,

    /// Override the iteration cap for this invocation.
    #[arg(long = "max-iterations")]
    max_iterations: Option<u32>,
}

#[derive(Subcommand)]
enum PlaybookCmd {
    /// Print every learned strategy with its counters.
    Show,
    /// Remove strategies whose effectiveness fell below the threshold.
    Prune,
    /// Tag a strategy as helpful, harmful, or neutral.
    Tag(TagArgs),
    /// Add a strategy by hand.
    Add(AddArgs),
}

#[derive(Args)]
struct TagArgs {
    id: String,
    /// One of: helpful, harmful, neutral.
    outcome: String,
}

#[derive(Args)]
struct AddArgs {
    /// One of: file_operations, code_navigation, testing, shell_commands,
    /// error_handling, general.
    category: String,
    content: String,
}

#[derive(Subcommand)]
enum ConfigCmd {
    /// Print the effective configuration as TOML.
    Show,
    /// Write the default configuration file if none exists.
    Init,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let cwd = std::env::current_dir()?;
    match cli.command {
        Commands::Run(args) => run_query(&cwd, &args, cli.verbose),
        Commands::Sessions => run_sessions(&cwd),
        Commands::Playbook { command } => run_playbook(&cwd, command),
        Commands::Config { command } => run_config(&cwd, command),
    }
}

fn run_query(cwd: &Path, args: &RunArgs, verbose: bool) -> Result<()> {
    let mut config = AppConfig::load(cwd)?;
    if let Some(model) = &args.model {
        config.llm.model = model.clone();
    }
    if let Some(limit) = args.max_iterations {
        config.engine.safety_limit = limit;
    }

    let observer = Arc::new(Observer::new(cwd, verbose)?);
    let llm = HttpLlmClient::new(config.llm.clone())?;
    let registry = ToolRegistry::with_local_tools(cwd, PolicyEngine::new(config.policy.clone()));
    let approvals: Arc<dyn ApprovalManager> = if args.auto_approve {
        Arc::new(StaticApprovalManager::approving())
    } else {
        Arc::new(TerminalApprovalManager)
    };

    let events: EventCallback = {
        let observer = Arc::clone(&observer);
        Arc::new(move |envelope| observer.record_event(envelope))
    };
    let engine = ReactEngine::new(config, Arc::new(llm), Arc::new(registry), approvals)
        .with_event_callback(events);

    // Ctrl-C requests an interrupt; the engine stops at the next checkpoint.
    #[cfg(unix)]
    signal_hook::flag::register(
        signal_hook::consts::SIGINT,
        engine.cancellation_token().flag(),
    )?;

    let store = SessionStore::new(cwd)?;
    let mut session = if let Some(id) = &args.resume {
        store.load(Uuid::parse_str(id)?)?
    } else if args.continue_session {
        store
            .load_latest()?
            .unwrap_or_else(|| Session::new(cwd))
    } else {
        Session::new(cwd)
    };

    observer.verbose_log(&format!("session {}", session.id));
    let outcome = engine.process_query(&mut session, &args.prompt)?;
    store.save(&session)?;

    println!("{}", outcome.response);
    match outcome.status {
        QueryStatus::Done => {}
        QueryStatus::Interrupted => observer.warn_log("interrupted"),
        QueryStatus::SafetyLimitHit => {
            observer.warn_log(&format!("stopped at the {}-iteration limit", outcome.iterations));
        }
    }
    observer.verbose_log(&format!(
        "{} iterations, {} tool calls, {} tokens",
        outcome.iterations,
        outcome.tool_calls.len(),
        outcome.usage.total()
    ));
    Ok(())
}

fn run_sessions(cwd: &Path) -> Result<()> {
    let store = SessionStore::new(cwd)?;
    let sessions = store.list()?;
    if sessions.is_empty() {
        println!("no stored sessions");
        return Ok(());
    }
    for session in sessions {
        println!(
            "{}  {}  {} messages, {} strategies",
            session.id,
            session.updated_at.format("%Y-%m-%d %H:%M:%S"),
            session.messages.len(),
            session.playbook.len()
        );
    }
    Ok(())
}

fn run_playbook(cwd: &Path, command: PlaybookCmd) -> Result<()> {
    let config = AppConfig::load(cwd)?;
    let store = SessionStore::new(cwd)?;
    let Some(mut session) = store.load_latest()? else {
        println!("no stored sessions");
        return Ok(());
    };
    match command {
        PlaybookCmd::Show => {
            if session.playbook.is_empty() {
                println!("playbook is empty");
            } else {
                print!(
                    "{}",
                    session.playbook.as_context(
                        "",
                        usize::MAX,
                        false,
                        &config.selector.weights()
                    )
                );
            }
        }
        PlaybookCmd::Prune => {
            let removed = session
                .playbook
                .prune(config.playbook.prune_threshold, config.playbook.min_samples);
            store.save(&session)?;
            println!("pruned {} strategies", removed.len());
            for id in removed {
                println!("  {id}");
            }
        }
        PlaybookCmd::Add(args) => {
            let category = parse_category(&args.category)?;
            let id = session
                .playbook
                .add_strategy(category, args.content.as_str())
                .id
                .clone();
            store.save(&session)?;
            println!("added {id}");
        }
        PlaybookCmd::Tag(args) => {
            let outcome = match args.outcome.as_str() {
                "helpful" => StrategyOutcome::Helpful,
                "harmful" => StrategyOutcome::Harmful,
                "neutral" => StrategyOutcome::Neutral,
                other => return Err(anyhow!("unknown outcome: {other}")),
            };
            session.playbook.tag_strategy(&args.id, outcome)?;
            store.save(&session)?;
            println!("tagged {}", args.id);
        }
    }
    Ok(())
}

fn parse_category(value: &str) -> Result<StrategyCategory> {
    Ok(match value {
        "file_operations" => StrategyCategory::FileOperations,
        "code_navigation" => StrategyCategory::CodeNavigation,
        "testing" => StrategyCategory::Testing,
        "shell_commands" => StrategyCategory::ShellCommands,
        "error_handling" => StrategyCategory::ErrorHandling,
        "general" => StrategyCategory::General,
        other => return Err(anyhow!("unknown category: {other}")),
    })
}

fn run_config(cwd: &Path, command: ConfigCmd) -> Result<()> {
    match command {
        ConfigCmd::Show => {
            let config = AppConfig::load(cwd)?;
            print!("{}", toml::to_string_pretty(&config)?);
        }
        ConfigCmd::Init => {
            let path = AppConfig::config_path(cwd);
            if path.exists() {
                println!("{} already exists", path.display());
            } else {
                AppConfig::default().save(cwd)?;
                println!("wrote {}", path.display());
            }
        }
    }
    Ok(())
}
