//! query-transfer CLI - chunked, parallel query export with fallback file transfer.

use clap::{Parser, Subcommand};
use query_transfer::{
    methods, Config, FailurePolicy, JobRequest, Orchestrator, OutputFormat, Phase, TransferError,
};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "query-transfer")]
#[command(about = "Chunked, parallel query export with fallback file transfer")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    /// Print progress updates as JSON lines to stderr
    #[arg(long)]
    progress: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Where the base query comes from.
#[derive(clap::Args)]
struct QueryArgs {
    /// Base query to export
    #[arg(long, conflicts_with_all = ["query_file", "table"])]
    query: Option<String>,

    /// Read the base query from a file
    #[arg(long, conflicts_with = "table")]
    query_file: Option<PathBuf>,

    /// Export a whole table (SELECT * FROM <table>)
    #[arg(long)]
    table: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Export a query and transfer the chunk files
    Run {
        #[command(flatten)]
        query: QueryArgs,

        /// Override target location
        #[arg(long)]
        target: Option<String>,

        /// Override target table name (fills {table} in method templates)
        #[arg(long)]
        target_table: Option<String>,

        /// Override rows per chunk
        #[arg(long)]
        chunk_size: Option<u64>,

        /// Override number of parallel chunk workers
        #[arg(long)]
        max_workers: Option<usize>,

        /// Chunk file format: csv, csv_gz, jsonl or parquet
        #[arg(long)]
        format: Option<OutputFormat>,

        /// Attempt every chunk even after failures
        #[arg(long)]
        best_effort: bool,
    },

    /// Dry run: count rows and show the chunk plan without writing files
    Plan {
        #[command(flatten)]
        query: QueryArgs,

        /// Override rows per chunk
        #[arg(long)]
        chunk_size: Option<u64>,
    },

    /// Test the source connection
    HealthCheck,

    /// Print the effective configuration with secrets masked
    ShowConfig,

    /// Validate the configuration file without connecting
    ValidateConfig,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<u8, TransferError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format);

    let mut config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    match cli.command {
        Commands::ValidateConfig => {
            println!("Configuration {} is valid", cli.config.display());
        }

        Commands::ShowConfig => {
            let masked = config.with_auto_tuning().masked();
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&masked)?);
            } else {
                println!("{}", serde_yaml::to_string(&masked)?);
            }
        }

        Commands::HealthCheck => {
            let orchestrator = Orchestrator::from_config(&config)?;
            let start = std::time::Instant::now();
            orchestrator.health_check().await?;
            let latency_ms = start.elapsed().as_millis() as u64;

            if cli.output_json {
                let report = serde_json::json!({
                    "source": config.source.host,
                    "healthy": true,
                    "latency_ms": latency_ms,
                });
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Health Check Results:");
                println!(
                    "  Source ({}:{}/{}): OK ({}ms)",
                    config.source.host, config.source.port, config.source.database, latency_ms
                );
            }
        }

        Commands::Plan { query, chunk_size } => {
            let base_query = resolve_query(&query)?;
            if let Some(size) = chunk_size {
                config.transfer.chunk_size = Some(size);
            }
            config.validate()?;
            let config = config.with_auto_tuning();

            let orchestrator = Orchestrator::from_config(&config)?;
            let summary = orchestrator
                .plan_only(&base_query, config.transfer.get_chunk_size())
                .await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!("Chunk plan:");
                println!("  Rows: {}", summary.total_rows);
                println!("  Chunk size: {}", summary.chunk_size);
                println!("  Chunks: {}", summary.num_chunks);
                for warning in &summary.warnings {
                    println!("  Warning: {}", warning);
                }
            }
        }

        Commands::Run {
            query,
            target,
            target_table,
            chunk_size,
            max_workers,
            format,
            best_effort,
        } => {
            let base_query = resolve_query(&query)?;

            // Apply overrides
            if let Some(location) = target {
                config.target.location = location;
            }
            if let Some(table) = target_table {
                config.target.table = Some(table);
            }
            if let Some(size) = chunk_size {
                config.transfer.chunk_size = Some(size);
            }
            if let Some(workers) = max_workers {
                config.transfer.max_workers = Some(workers);
            }
            if let Some(format) = format {
                config.transfer.output_format = format;
            }
            if best_effort {
                config.transfer.failure_policy = FailurePolicy::BestEffort;
            }
            config.validate()?;
            let config = config.with_auto_tuning();

            let cancel_token = setup_signal_handler();
            let orchestrator = Orchestrator::from_config(&config)?.with_cancel(cancel_token);
            let request = JobRequest::new(
                base_query,
                config.target.clone(),
                methods::from_config(&config.methods)?,
                orchestrator.settings(),
            );

            let result = if cli.progress {
                let mut observer = |phase: Phase, percent: f64, message: &str| {
                    let line = serde_json::json!({
                        "phase": phase.label(),
                        "percent": percent,
                        "message": message,
                    });
                    eprintln!("{}", line);
                };
                orchestrator
                    .submit_with_progress(request, &mut observer)
                    .await
            } else {
                orchestrator.submit(request).await
            };

            if cli.output_json {
                println!("{}", result.to_json()?);
            } else {
                println!("\n{}", result.summary());
                for chunk in result.failed_chunks() {
                    println!(
                        "  Chunk {} {:?}: {}",
                        chunk.id,
                        chunk.status,
                        chunk.error.as_deref().unwrap_or("not started")
                    );
                }
                for outcome in result.failed_transfers() {
                    println!(
                        "  File {}: {}",
                        outcome.file_path.display(),
                        outcome.last_error().unwrap_or("no method succeeded")
                    );
                }
            }

            return Ok(result.exit_code);
        }
    }

    Ok(0)
}

/// Pick the base query from exactly one of --query, --query-file, --table.
fn resolve_query(args: &QueryArgs) -> Result<String, TransferError> {
    let query = match (&args.query, &args.query_file, &args.table) {
        (Some(query), None, None) => query.clone(),
        (None, Some(path), None) => std::fs::read_to_string(path).map_err(|e| {
            TransferError::Config(format!("cannot read query file {}: {}", path.display(), e))
        })?,
        (None, None, Some(table)) => format!("SELECT * FROM {}", table),
        (None, None, None) => {
            return Err(TransferError::Config(
                "one of --query, --query-file or --table is required".into(),
            ))
        }
        _ => {
            return Err(TransferError::Config(
                "--query, --query-file and --table are mutually exclusive".into(),
            ))
        }
    };

    if query.trim().is_empty() {
        return Err(TransferError::Config("query is empty".into()));
    }
    Ok(query)
}

fn setup_logging(verbosity: &str, format: &str) {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // Logs go to stderr so --output-json stays parseable.
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Cancel the returned token on SIGINT or SIGTERM.
/// In-flight chunks finish; no new chunks start.
#[cfg(unix)]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();

    for (kind, name) in [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
    ] {
        let token = cancel_token.clone();
        match signal(kind) {
            Ok(mut stream) => {
                tokio::spawn(async move {
                    stream.recv().await;
                    eprintln!("\nReceived {}. Finishing in-flight chunks...", name);
                    token.cancel();
                });
            }
            Err(e) => eprintln!("Failed to install {} handler: {}", name, e),
        }
    }

    cancel_token
}

/// Cancel the returned token on Ctrl-C.
#[cfg(not(unix))]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Finishing in-flight chunks...");
            token.cancel();
        }
    });

    cancel_token
}
