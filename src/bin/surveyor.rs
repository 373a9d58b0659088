//! Surveyor CLI — discovery flows over imported infrastructure exports.
//!
//! Usage:
//!   surveyor flow start --client acme --engagement wave-1 --input rows.json
//!   surveyor flow run <flow-id>
//!   surveyor suggest --client acme --engagement wave-1 --field DR_TIER --sample 1 --sample 2

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use surveyor::provider::MockProvider;
use surveyor::{FlowConfig, FlowId, PhaseReport, SurveyorApi, TenantId};

#[derive(Parser)]
#[command(
    name = "surveyor",
    version,
    about = "Resumable discovery flows with tenant-scoped pattern learning"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage discovery flows
    Flow {
        #[command(subcommand)]
        action: FlowAction,
        /// Directory holding the surveyor databases
        #[arg(long, global = true)]
        db: Option<PathBuf>,
    },
    /// Ask for mapping suggestions for a field
    Suggest {
        /// Client name (tenant)
        #[arg(long)]
        client: String,
        /// Engagement name (tenant)
        #[arg(long)]
        engagement: String,
        /// Field name / signature to map
        #[arg(long)]
        field: String,
        /// Sample values, repeatable
        #[arg(long = "sample")]
        samples: Vec<String>,
        /// Directory holding the surveyor databases
        #[arg(long)]
        db: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum FlowAction {
    /// Start a flow over a JSON array of imported rows
    Start {
        /// Client name (tenant)
        #[arg(long)]
        client: String,
        /// Engagement name (tenant)
        #[arg(long)]
        engagement: String,
        /// Path to a JSON file with an array of row objects
        #[arg(long)]
        input: PathBuf,
    },
    /// Show a flow's phase statuses
    Status {
        /// Flow id
        id: String,
    },
    /// Run the next eligible phase
    Advance {
        /// Flow id
        id: String,
    },
    /// Run phases until the flow is terminal
    Run {
        /// Flow id
        id: String,
    },
    /// Reset failed phases and continue
    Resume {
        /// Flow id
        id: String,
    },
    /// Request cancellation (honored between phases)
    Cancel {
        /// Flow id
        id: String,
    },
    /// Full reset: clear outputs, all phases back to pending
    Reset {
        /// Flow id
        id: String,
    },
    /// Delete a flow and all its records
    Delete {
        /// Flow id
        id: String,
    },
    /// List all flows
    List,
}

/// Default data directory (~/.local/share/surveyor)
fn default_db_dir() -> PathBuf {
    let data_dir = dirs::data_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_default().join(".local/share"));
    let dir = data_dir.join("surveyor");
    std::fs::create_dir_all(&dir).ok();
    dir
}

fn open_api(db: Option<PathBuf>) -> Result<SurveyorApi, String> {
    let dir = db.unwrap_or_else(default_db_dir);
    SurveyorApi::open(dir, Arc::new(MockProvider::unavailable()))
        .map_err(|e| format!("Failed to open databases: {}", e))
}

fn parse_flow_id(s: &str) -> FlowId {
    match FlowId::parse(s) {
        Some(id) => id,
        None => {
            eprintln!("Error: '{}' is not a valid flow id", s);
            std::process::exit(1);
        }
    }
}

fn print_report(report: &PhaseReport) {
    match report {
        PhaseReport::Completed {
            phase,
            confidence,
            commit,
        } => println!(
            "Completed {} (confidence {:.2}, {} derived records)",
            phase, confidence, commit.derived_count
        ),
        PhaseReport::Failed { phase, reason } => {
            println!("Phase {} failed: {}", phase, reason)
        }
        PhaseReport::AllComplete => println!("All phases completed."),
        PhaseReport::Blocked { failed } => {
            let names: Vec<_> = failed.iter().map(|p| p.to_string()).collect();
            println!("Blocked; failed phases: {}", names.join(", "))
        }
        PhaseReport::Cancelled => println!("Flow is cancelled."),
    }
}

fn cmd_flow_start(api: &SurveyorApi, client: &str, engagement: &str, input: &PathBuf) -> i32 {
    let text = match std::fs::read_to_string(input) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("Error: cannot read '{}': {}", input.display(), e);
            return 1;
        }
    };
    let rows: Vec<serde_json::Value> = match serde_json::from_str(&text) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Error: input is not a JSON array of objects: {}", e);
            return 1;
        }
    };
    let tenant = TenantId::new(client, engagement);
    match api.start_flow(tenant, rows, FlowConfig::default()) {
        Ok(id) => {
            println!("Started flow {}", id);
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

fn cmd_flow_status(api: &SurveyorApi, id: &FlowId) -> i32 {
    match api.get_flow_status(id) {
        Ok(status) => {
            println!("Flow {} ({})", status.id, status.tenant);
            for (phase, state) in &status.phase_statuses {
                let error = status
                    .phase_errors
                    .get(phase)
                    .map(|e| format!("  ({})", e))
                    .unwrap_or_default();
                println!("  {:<20} {:?}{}", phase.to_string(), state, error);
            }
            if status.cancelled {
                println!("  cancelled");
            }
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

async fn cmd_flow_advance(api: &SurveyorApi, id: &FlowId) -> i32 {
    match api.advance_flow(id).await {
        Ok(report) => {
            print_report(&report);
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

async fn cmd_flow_run(api: &SurveyorApi, id: &FlowId) -> i32 {
    match api.run_flow(id).await {
        Ok(report) => {
            print_report(&report);
            if matches!(report, PhaseReport::AllComplete) {
                0
            } else {
                1
            }
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

async fn cmd_flow_resume(api: &SurveyorApi, id: &FlowId) -> i32 {
    match api.resume_flow(id).await {
        Ok(report) => {
            print_report(&report);
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

async fn cmd_flow_cancel(api: &SurveyorApi, id: &FlowId) -> i32 {
    match api.cancel_flow(id).await {
        Ok(()) => {
            println!("Cancellation requested for {}", id);
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

async fn cmd_flow_reset(api: &SurveyorApi, id: &FlowId) -> i32 {
    match api.reset_flow(id).await {
        Ok(()) => {
            println!("Flow {} reset", id);
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

async fn cmd_flow_delete(api: &SurveyorApi, id: &FlowId) -> i32 {
    match api.delete_flow(id).await {
        Ok(true) => {
            println!("Flow {} deleted", id);
            0
        }
        Ok(false) => {
            eprintln!("Error: no flow {}", id);
            1
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

fn cmd_flow_list(api: &SurveyorApi) -> i32 {
    match api.list_flows() {
        Ok(ids) => {
            if ids.is_empty() {
                println!("No flows.");
                return 0;
            }
            for id in ids {
                match api.get_flow_status(&id) {
                    Ok(s) => {
                        let state = if s.complete {
                            "complete".to_string()
                        } else if s.cancelled {
                            "cancelled".to_string()
                        } else {
                            s.current_phase
                                .map(|p| p.to_string())
                                .unwrap_or_else(|| "blocked".to_string())
                        };
                        println!("{}  {:<24}  {}", s.id, s.tenant, state);
                    }
                    Err(e) => eprintln!("Error loading {}: {}", id, e),
                }
            }
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

fn cmd_suggest(api: &SurveyorApi, client: &str, engagement: &str, field: &str, samples: &[String]) -> i32 {
    let tenant = TenantId::new(client, engagement);
    match api.suggest_mapping(&tenant, field, samples) {
        Ok(suggestions) => {
            if suggestions.is_empty() {
                println!("No suggestions for '{}'.", field);
                return 0;
            }
            println!("{:<28}  {:>10}  {:<10}", "TARGET", "CONFIDENCE", "DECISION");
            for s in suggestions {
                println!(
                    "{:<28}  {:>10.2}  {:<10}",
                    s.target,
                    s.confidence,
                    format!("{:?}", s.decision).to_lowercase()
                );
            }
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Flow { action, db } => {
            let api = match open_api(db) {
                Ok(api) => api,
                Err(e) => {
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                }
            };
            match action {
                FlowAction::Start {
                    client,
                    engagement,
                    input,
                } => cmd_flow_start(&api, &client, &engagement, &input),
                FlowAction::List => cmd_flow_list(&api),
                FlowAction::Status { id } => cmd_flow_status(&api, &parse_flow_id(&id)),
                FlowAction::Advance { id } => cmd_flow_advance(&api, &parse_flow_id(&id)).await,
                FlowAction::Run { id } => cmd_flow_run(&api, &parse_flow_id(&id)).await,
                FlowAction::Resume { id } => cmd_flow_resume(&api, &parse_flow_id(&id)).await,
                FlowAction::Cancel { id } => cmd_flow_cancel(&api, &parse_flow_id(&id)).await,
                FlowAction::Reset { id } => cmd_flow_reset(&api, &parse_flow_id(&id)).await,
                FlowAction::Delete { id } => cmd_flow_delete(&api, &parse_flow_id(&id)).await,
            }
        }
        Commands::Suggest {
            client,
            engagement,
            field,
            samples,
            db,
        } => {
            let api = match open_api(db) {
                Ok(api) => api,
                Err(e) => {
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                }
            };
            cmd_suggest(&api, &client, &engagement, &field, &samples)
        }
    };
    std::process::exit(code);
}
