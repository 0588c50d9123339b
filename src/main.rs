use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use flotilla::shutdown::install_shutdown_handler;
use flotilla::{Cluster, ClusterConfig, ExecutorService, FlotillaError, JobOutcome, ShellTask};

#[derive(Parser, Debug)]
#[command(name = "flotilla")]
#[command(version)]
#[command(about = "Run shell commands across a pool of worker nodes")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run commands on the cluster and print their results
    Run(RunArgs),
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Worker node as "host" or "host:threads". Repeatable.
    /// Defaults to one local node sized to this machine.
    #[arg(long = "node", short = 'n')]
    nodes: Vec<String>,

    /// Slots each command takes
    #[arg(long, default_value = "1", conflicts_with = "fraction")]
    threads: u32,

    /// Share of a node each command takes, e.g. 0.5
    #[arg(long)]
    fraction: Option<f32>,

    /// Stop at the first command that succeeds and cancel the rest
    #[arg(long)]
    any: bool,

    /// Give up on unfinished commands after this many milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Scheduler cycle interval in milliseconds
    #[arg(long, default_value = "100")]
    poll_interval_ms: u64,

    /// Time to wait for the first node to come up, in milliseconds
    #[arg(long, default_value = "30000")]
    ready_timeout_ms: u64,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,

    /// Commands to run, each passed to `sh -c`
    #[arg(required = true)]
    commands: Vec<String>,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct JobRow {
    job_id: u64,
    command: String,
    outcome: JobOutcome,
}

#[derive(Serialize)]
struct AnyOutput {
    result: serde_json::Value,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn parse_node(spec: &str) -> Option<(String, Option<u32>)> {
    let spec = spec.trim();
    match spec.rsplit_once(':') {
        Some((host, threads)) if !host.is_empty() => {
            let threads: u32 = threads.parse().ok()?;
            Some((host.to_string(), Some(threads)))
        }
        Some(_) => None,
        None if !spec.is_empty() => Some((spec.to_string(), None)),
        None => None,
    }
}

fn outcome_summary(outcome: &JobOutcome) -> String {
    match outcome {
        JobOutcome::Completed(value) => value
            .get("stdout")
            .and_then(|s| s.as_str())
            .map(|s| s.trim_end().to_string())
            .unwrap_or_else(|| value.to_string()),
        JobOutcome::Failed(message) => message.clone(),
        JobOutcome::Cancelled => String::new(),
    }
}

fn build_cluster(args: &RunArgs) -> Result<Cluster, Box<dyn std::error::Error>> {
    let config = ClusterConfig {
        poll_interval_ms: args.poll_interval_ms,
        ..ClusterConfig::default()
    };
    let cluster = Cluster::local(config);
    cluster.init();

    if args.nodes.is_empty() {
        cluster.add_host(cluster.local_host_name().to_string(), None);
    }
    for spec in &args.nodes {
        let Some((host, threads)) = parse_node(spec) else {
            return Err(format!("Invalid node {:?}, expected host or host:threads", spec).into());
        };
        if cluster.add_host(host, threads).is_none() {
            tracing::warn!(node = %spec, "Node was not added");
        }
    }

    cluster.start();
    Ok(cluster)
}

fn service_for(cluster: &Cluster, args: &RunArgs) -> ExecutorService {
    match args.fraction {
        Some(fraction) => cluster.fractional_executor(fraction),
        None => cluster.executor(args.threads),
    }
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn handle_run(args: RunArgs) -> Result<i32, Box<dyn std::error::Error>> {
    let cluster = build_cluster(&args)?;
    if !cluster
        .wait_until_ready(Duration::from_millis(args.ready_timeout_ms))
        .await
    {
        cluster.shutdown_now();
        return Err("No node became ready".into());
    }

    let service = service_for(&cluster, &args);
    let interrupt = install_shutdown_handler();
    let timeout = args.timeout_ms.map(Duration::from_millis);
    let tasks: Vec<ShellTask> = args.commands.iter().map(ShellTask::new).collect();

    tracing::info!(
        jobs = tasks.len(),
        slots = %service.slots(),
        nodes = cluster.active_node_count(),
        "Submitting commands"
    );

    let code = if args.any {
        match service.submit_any_interruptible(tasks, timeout, &interrupt).await {
            Ok(result) => {
                match args.output {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(&AnyOutput { result })?)
                    }
                    OutputFormat::Table => println!("{}", outcome_summary(&JobOutcome::Completed(result))),
                }
                0
            }
            Err(FlotillaError::Interrupted) => interrupted(&cluster),
            Err(e) => {
                eprintln!("Error: {}", e);
                1
            }
        }
    } else {
        match service.submit_all_interruptible(tasks, timeout, &interrupt).await {
            Ok(promises) => {
                let rows: Vec<JobRow> = promises
                    .iter()
                    .zip(&args.commands)
                    .map(|(p, command)| JobRow {
                        job_id: p.id(),
                        command: command.clone(),
                        outcome: p.outcome().unwrap_or(JobOutcome::Cancelled),
                    })
                    .collect();
                print_rows(&rows, &args.output)?;
                if rows.iter().all(|r| matches!(r.outcome, JobOutcome::Completed(_))) {
                    0
                } else {
                    1
                }
            }
            Err(FlotillaError::Interrupted) => interrupted(&cluster),
            Err(e) => {
                eprintln!("Error: {}", e);
                1
            }
        }
    };

    if !cluster.is_terminated() {
        cluster.shutdown();
        if !cluster.await_termination(Duration::from_secs(10)).await {
            tracing::warn!("Cluster did not stop in time, forcing");
            cluster.shutdown_now();
        }
    }
    Ok(code)
}

fn interrupted(cluster: &Cluster) -> i32 {
    let abandoned = cluster.shutdown_now();
    eprintln!("Interrupted, cancelled {} job(s)", abandoned.len());
    130
}

fn print_rows(rows: &[JobRow], output: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(rows)?),
        OutputFormat::Table => {
            println!("{:<6} {:<10} {:<24} OUTPUT", "JOB", "OUTCOME", "COMMAND");
            println!("{}", "-".repeat(72));
            for row in rows {
                let command = if row.command.chars().count() > 24 {
                    format!("{}...", row.command.chars().take(21).collect::<String>())
                } else {
                    row.command.clone()
                };
                let summary = outcome_summary(&row.outcome);
                let mut lines = summary.lines();
                println!(
                    "{:<6} {:<10} {:<24} {}",
                    row.job_id,
                    row.outcome.to_string(),
                    command,
                    lines.next().unwrap_or("")
                );
                for line in lines {
                    println!("{:<42} {}", "", line);
                }
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let code = match args.command {
        Commands::Run(run_args) => handle_run(run_args).await?,
    };
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
