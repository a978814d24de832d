//! stratusctl: reporting client for the stratus control plane.
//!
//! `reconciliations` talks to the reconciler's listing endpoint directly;
//! `operations` reads the member operations of an orchestration from the
//! stratus server.

mod output;

use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;
use std::time::Duration;
use stratus_adapters::HttpReconcilerClient;
use stratus_ports::{ReconcilerClient, ReconciliationQuery, ReconciliationRecord};

#[derive(Parser)]
#[command(
    name = "stratusctl",
    about = "Reporting client for the stratus control plane",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List reconciliation records from the reconciler
    Reconciliations {
        /// Reconciler base URL (defaults to $STRATUS_RECONCILER_URL)
        #[arg(long)]
        reconciler_url: Option<String>,
        /// Filter by runtime id (repeatable)
        #[arg(long = "runtime-id")]
        runtime_ids: Vec<String>,
        /// Filter by reconciliation state (repeatable)
        #[arg(long = "state", value_enum)]
        states: Vec<StateFilter>,
        /// Filter by shoot cluster name (repeatable)
        #[arg(long = "shoot")]
        shoots: Vec<String>,
        #[arg(short = 'o', long = "output", value_enum, default_value = "table")]
        output: OutputFormat,
        /// Per-call timeout in milliseconds
        #[arg(long, default_value_t = 30_000)]
        timeout_ms: u64,
    },
    /// List the member operations of an orchestration
    Operations {
        /// Stratus server base URL (defaults to $STRATUS_SERVER_URL)
        #[arg(long)]
        server_url: Option<String>,
        /// Orchestration id
        orchestration_id: String,
        #[arg(short = 'o', long = "output", value_enum, default_value = "table")]
        output: OutputFormat,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

/// The reconciler's own state vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StateFilter {
    Ok,
    Err,
    Suspended,
    All,
}

impl StateFilter {
    fn as_str(self) -> &'static str {
        match self {
            StateFilter::Ok => "ok",
            StateFilter::Err => "err",
            StateFilter::Suspended => "suspended",
            StateFilter::All => "all",
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    match Cli::parse().command {
        Command::Reconciliations {
            reconciler_url,
            runtime_ids,
            states,
            shoots,
            output,
            timeout_ms,
        } => {
            let url = resolve_url(reconciler_url, "STRATUS_RECONCILER_URL", "reconciler")?;
            let client = HttpReconcilerClient::new(url, Duration::from_millis(timeout_ms));
            let query = ReconciliationQuery {
                runtime_ids,
                states: states.iter().map(|s| s.as_str().to_string()).collect(),
                shoots,
            };
            let records = client.list_reconciliations(&query).await?;
            match output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&records)?),
                OutputFormat::Table => print!("{}", reconciliation_table(&records)),
            }
        }
        Command::Operations {
            server_url,
            orchestration_id,
            output,
        } => {
            let url = resolve_url(server_url, "STRATUS_SERVER_URL", "server")?;
            let response = reqwest::get(format!("{url}/orchestrations/{orchestration_id}/operations"))
                .await?
                .error_for_status()?;
            let operations: Vec<Value> = response.json().await?;
            match output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&operations)?),
                OutputFormat::Table => print!("{}", operation_table(&operations)),
            }
        }
    }
    Ok(())
}

fn resolve_url(
    flag: Option<String>,
    env_key: &str,
    what: &str,
) -> Result<String, Box<dyn std::error::Error>> {
    flag.or_else(|| std::env::var(env_key).ok())
        .filter(|url| !url.is_empty())
        .ok_or_else(|| format!("no {what} URL given (flag or ${env_key})").into())
}

fn reconciliation_table(records: &[ReconciliationRecord]) -> String {
    let rows: Vec<Vec<String>> = records
        .iter()
        .map(|record| {
            vec![
                record.reconciliation_id.clone(),
                record.runtime_id.clone(),
                record.shoot.clone().unwrap_or_default(),
                record.status.clone(),
                record.created_at.to_rfc3339(),
            ]
        })
        .collect();
    output::render_table(
        &["RECONCILIATION", "RUNTIME", "SHOOT", "STATUS", "CREATED"],
        &rows,
    )
}

fn operation_table(operations: &[Value]) -> String {
    let rows: Vec<Vec<String>> = operations
        .iter()
        .map(|operation| {
            vec![
                text(operation, "operation_id"),
                text(operation, "instance_id"),
                text(operation, "kind"),
                text(operation, "status"),
                text(operation, "current_step"),
            ]
        })
        .collect();
    output::render_table(&["OPERATION", "INSTANCE", "KIND", "STATUS", "STEP"], &rows)
}

fn text(value: &Value, key: &str) -> String {
    value[key].as_str().unwrap_or_default().to_string()
}
