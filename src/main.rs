use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rfpflow_core::config::AppConfig;
use rfpflow_core::event::EventBus;
use rfpflow_core::traits::InsightsRepository;
use rfpflow_core::types::{DocumentId, ProjectId};

use rfpflow_engine::{GraphDefinition, RunLogger, RunOutcome, RunRequest, StageSet, WorkflowManager};
use rfpflow_store::SqliteStore;

#[derive(Parser)]
#[command(name = "rfpflow", version, about = "RFP analysis workflow engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "rfpflow.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a document's extracted text
    Ingest {
        #[arg(long)]
        project: i64,
        #[arg(long)]
        document: i64,
        /// Plain-text file holding the extracted text
        #[arg(long)]
        file: PathBuf,
    },
    /// Run the analysis workflow for a document
    Run {
        #[arg(long)]
        project: i64,
        #[arg(long)]
        document: i64,
        /// Disable a task (questions, challenges, cases, proposal or a stage name)
        #[arg(long = "skip")]
        skip: Vec<String>,
        /// Print the full outcome as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show stored insights for a project
    Insights {
        #[arg(long)]
        project: i64,
    },
    /// Show the workflow graph
    Graph,
    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("rfpflow=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let config = if cli.config.exists() {
        info!(path = %cli.config.display(), "Loading config");
        AppConfig::load(&cli.config)?
    } else {
        warn!(path = %cli.config.display(), "Config file not found, using defaults");
        AppConfig::default()
    };

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Graph => {
            let graph = GraphDefinition::presales()?;
            for stage in graph.topological_order() {
                let deps: Vec<&str> = graph.dependencies(*stage).iter().map(|d| d.as_str()).collect();
                let skippable = graph.stage(*stage).is_some_and(|s| s.skippable);
                println!(
                    "{:<22} after [{}]{}",
                    stage.as_str(),
                    deps.join(", "),
                    if skippable { " (skippable)" } else { "" }
                );
            }
        }
        Commands::Ingest {
            project,
            document,
            file,
        } => {
            let text = std::fs::read_to_string(&file)?;
            let store = SqliteStore::open(&config.database_path())?;
            let filename = file.file_name().and_then(|n| n.to_str());
            store.put_document(ProjectId(project), DocumentId(document), filename, &text)?;
            let documents = store.project_documents(ProjectId(project))?;
            println!(
                "Stored document {} for project {} ({} chars, {} documents in project)",
                document,
                project,
                text.chars().count(),
                documents.len()
            );
        }
        Commands::Insights { project } => {
            let store = SqliteStore::open(&config.database_path())?;
            match store.load_insights(ProjectId(project)).await? {
                Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
                None => println!("No insights stored for project {}", project),
            }
        }
        Commands::Run {
            project,
            document,
            skip,
            json,
        } => {
            let store = Arc::new(SqliteStore::open(&config.database_path())?);
            let event_bus = Arc::new(EventBus::default());

            // Spawn RunLogger if logging is enabled
            let cancel = CancellationToken::new();
            let mut logger_handle = None;
            if let Some(log_config) = config.log.as_ref().filter(|l| l.enabled) {
                let logger = RunLogger::new(config.log_dir(), log_config.level);
                let rx = event_bus.subscribe();
                let log_cancel = cancel.clone();
                logger_handle = Some(tokio::spawn(async move {
                    logger.run(rx, log_cancel).await;
                }));
                info!("RunLogger started (level {})", log_config.level);
            }

            let manager = WorkflowManager::from_config(
                &config,
                StageSet::from_config(&config),
                store.clone(),
                store,
                event_bus,
            )?;

            let selection: HashMap<String, bool> =
                skip.into_iter().map(|task| (task, false)).collect();
            let request = RunRequest::new(ProjectId(project), DocumentId(document))
                .with_selection(selection);

            let result = manager.run_workflow(request).await;

            cancel.cancel();
            if let Some(handle) = logger_handle {
                handle.await.ok();
            }

            let outcome = result?;
            if json {
                print_json(&outcome)?;
            } else {
                print_outcome(&outcome);
            }
        }
    }

    Ok(())
}

fn print_json(outcome: &RunOutcome) -> anyhow::Result<()> {
    let value = serde_json::json!({
        "run_id": outcome.run_id,
        "success": outcome.success,
        "summary": outcome.summary,
        "persistence_error": outcome.persistence_error,
        "state": outcome.state.as_ref(),
    });
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn print_outcome(outcome: &RunOutcome) {
    let summary = &outcome.summary;
    println!("Run {}", outcome.run_id);
    if let Some(text) = &summary.rfp_summary {
        println!("  Summary: {}", text);
    }
    println!("  Challenges:         {}", summary.challenges_count);
    println!("  Value propositions: {}", summary.value_propositions_count);
    println!("  Matched cases:      {}", summary.case_studies_count);
    println!(
        "  Proposal draft:     {}",
        if summary.proposal_created { "yes" } else { "no" }
    );

    for entry in &outcome.state.execution_log {
        println!(
            "  [{}] {} ({}ms){}",
            entry.status,
            entry.stage.label(),
            entry.elapsed_ms,
            entry
                .detail
                .as_deref()
                .map(|d| format!(": {}", d))
                .unwrap_or_default()
        );
    }
    for error in &outcome.state.errors {
        println!("  error: {}", error);
    }
    for warning in &outcome.state.warnings {
        println!("  warning: {}", warning);
    }
    if let Some(e) = &outcome.persistence_error {
        println!("  WARNING: results were not saved: {}", e);
    }
}
