use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::Config;
use crate::db;
use crate::hooker::WaitSpec;
use crate::loader::FsLoader;
use crate::payload::Payload;
use crate::scheduler::{LaunchOptions, Launched, MessageRequest, Scheduler};
use crate::storage::{PgStorage, Storage};

#[derive(Parser)]
#[command(name = "cadence")]
#[command(about = "Cadence - a message-driven workflow engine", long_about = None)]
pub struct Cli {
    /// Path to config file (overrides default search)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Database URL (overrides config file and env vars)
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a scheduler until ctrl-c
    Run {
        /// Bound on simultaneously live executors
        #[arg(long)]
        max_executors: Option<usize>,

        /// Heartbeat period in milliseconds
        #[arg(long)]
        heart_rate_ms: Option<u64>,
    },

    /// Launch a flow, by dotted flow path or JSON tree source
    Launch {
        flow: String,

        #[arg(short = 'd', long)]
        domain: Option<String>,

        #[arg(short = 'u', long)]
        unit: Option<String>,

        /// Initial payload (JSON object)
        #[arg(long, default_value = "{}")]
        payload: String,

        /// Initial variables (JSON object)
        #[arg(long, default_value = "{}")]
        vars: String,

        /// Block until the execution matches, e.g. "terminated"
        #[arg(long)]
        wait: Option<String>,
    },

    /// Cancel an execution, or one of its nodes
    Cancel {
        exid: String,

        #[arg(long, default_value = "0")]
        nid: String,
    },

    /// Send a signal to an execution
    Signal {
        exid: String,

        /// Signal name
        name: String,

        /// Signal payload (JSON string)
        #[arg(default_value = "{}")]
        payload: String,
    },

    /// Show the state of an execution
    Status { exid: String },

    /// Apply pending database migrations
    Migrate,

    /// Print the effective configuration
    Config,
}

/// Run the CLI by parsing process arguments
pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();
    run_cli_with_args(cli).await
}

/// Run the CLI with provided arguments
pub async fn run_cli_from_args(args: Vec<String>) -> Result<()> {
    let cli = Cli::parse_from(args);
    run_cli_with_args(cli).await
}

async fn run_cli_with_args(cli: Cli) -> Result<()> {
    let (max_executors, heart_rate_ms) = match &cli.command {
        Commands::Run {
            max_executors,
            heart_rate_ms,
        } => (*max_executors, *heart_rate_ms),
        _ => (None, None),
    };

    // Load and validate configuration before any command output
    let config = Config::builder()
        .config_path(cli.config.clone())
        .database_url(cli.database_url.clone())
        .max_executors(max_executors)
        .heart_rate_ms(heart_rate_ms)
        .build()?;

    match cli.command {
        Commands::Config => {
            print!("{}", config.to_toml()?);
        }

        Commands::Migrate => {
            let pool = db::connect(&config.database).await?;
            db::migrate(&pool).await?;
            println!("Migrations applied (version {:?})", db::migration_version());
        }

        Commands::Run { .. } => {
            let scheduler = build_scheduler(&config).await?;
            scheduler.start().await?;

            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for ctrl-c")?;

            scheduler.shutdown().await;
        }

        Commands::Launch {
            flow,
            domain,
            unit,
            payload,
            vars,
            wait,
        } => {
            let mut opts = LaunchOptions::new()
                .payload(parse_payload(&payload)?)
                .vars(parse_object(&vars, "vars")?);
            opts.domain = domain;
            opts.unit = unit;
            if let Some(wait) = wait.as_deref() {
                opts.wait = Some(parse_wait(wait)?);
            }

            let scheduler = build_scheduler(&config).await?;
            if opts.wait.is_some() {
                scheduler.start().await?;
            }
            let launched = scheduler.launch(&flow, opts).await?;
            report(&launched)?;
            scheduler.shutdown().await;
        }

        Commands::Cancel { exid, nid } => {
            let scheduler = build_scheduler(&config).await?;
            let launched = scheduler.cancel(MessageRequest::new(exid).nid(nid)).await?;
            report(&launched)?;
            scheduler.shutdown().await;
        }

        Commands::Signal {
            exid,
            name,
            payload,
        } => {
            let scheduler = build_scheduler(&config).await?;
            let req = MessageRequest::new(exid).payload(parse_payload(&payload)?);
            let launched = scheduler.signal(&name, req).await?;
            report(&launched)?;
            scheduler.shutdown().await;
        }

        Commands::Status { exid } => {
            let pool = db::connect(&config.database).await?;
            let storage = PgStorage::new(pool);

            match storage.load_execution(&exid).await? {
                Some(execution) => {
                    println!("Execution: {}", execution.exid);
                    println!("Status: {:?}", execution.status);
                    println!("Nodes: {}", execution.nodes.len());
                    println!(
                        "Messages: {} (runs: {}, outbound: {})",
                        execution.counters.msgs, execution.counters.runs, execution.counters.omsgs
                    );
                    println!("Created: {}", execution.created_at);
                    println!("Updated: {}", execution.updated_at);

                    if let Some(error) = execution.error {
                        println!("\nError:");
                        println!("  {}: {}", error.kind, error.message);
                    }
                }
                None => {
                    eprintln!("Execution {} not found", exid);
                    std::process::exit(1);
                }
            }

            storage.shutdown().await;
        }
    }

    Ok(())
}

async fn build_scheduler(config: &Config) -> Result<Scheduler> {
    let pool = db::connect(&config.database).await?;

    Scheduler::builder()
        .config(config.scheduler.clone())
        .storage(Arc::new(PgStorage::new(pool)))
        .loader(Arc::new(FsLoader::new(&config.loader.flows_dir)))
        .build()
}

fn report(launched: &Launched) -> Result<()> {
    match launched {
        Launched::Queued(exid) => println!("{}", exid),
        Launched::Done(message) | Launched::Prepared(message) => {
            println!("{}", serde_json::to_string_pretty(message).context("Failed to render message")?);
        }
    }
    Ok(())
}

fn parse_object(s: &str, what: &str) -> Result<serde_json::Map<String, serde_json::Value>> {
    serde_json::from_str(s).with_context(|| format!("Invalid {} JSON, expected an object", what))
}

fn parse_payload(s: &str) -> Result<Payload> {
    Ok(Payload::from_map(parse_object(s, "payload")?))
}

fn parse_wait(s: &str) -> Result<WaitSpec> {
    WaitSpec::parse(s).with_context(|| format!("Invalid wait spec {:?}", s))
}
