//! InvoiceFlow - multi-agent document intake
//!
//! Runs as an HTTP service (`serve`) or as a batch CLI (`process`) over
//! the same pipeline: classify, extract, record, route.
//!
//! Exit codes:
//!   0 - Success
//!   1 - Runtime error (config, I/O, memory store, etc.)

mod agent;
mod analysis;
mod cli;
mod config;
mod error;
mod memory;
mod models;
mod pipeline;
mod report;
mod router;
mod scanner;
mod server;

use anyhow::{Context, Result};
use chrono::Utc;
use cli::{Args, Command, OutputFormat, ProcessArgs};
use config::{Config, CONFIG_FILE_NAME};
use futures::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use memory::MemoryStore;
use pipeline::{Pipeline, ProcessResponse};
use report::{BatchReport, FailedDocument, ReportMetadata};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse_args();

    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Handle init-config early (no logging needed)
    if let Command::InitConfig { force } = args.command {
        return handle_init_config(force);
    }

    init_logging(&args);

    info!("InvoiceFlow v{}", env!("CARGO_PKG_VERSION"));
    debug!("Arguments: {:?}", args);

    if let Err(e) = run(args).await {
        error!("Command failed: {:#}", e);
        eprintln!("\n❌ Error: {:#}", e);
        std::process::exit(1);
    }
    Ok(())
}

/// Handle init-config: generate a default .invoiceflow.toml.
fn handle_init_config(force: bool) -> Result<()> {
    let path = Path::new(CONFIG_FILE_NAME);

    if path.exists() && !force {
        eprintln!(
            "⚠️  {} already exists. Remove it, edit it manually, or pass --force.",
            CONFIG_FILE_NAME
        );
        std::process::exit(1);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content)
        .with_context(|| format!("Failed to write {}", CONFIG_FILE_NAME))?;

    println!("✅ Created {} with default settings.", CONFIG_FILE_NAME);
    println!("   Edit it to customize the model, endpoints, memory and scanner.");
    Ok(())
}

/// Initialize logging. `RUST_LOG` wins over the verbosity flags.
fn init_logging(args: &Args) {
    let level = args.log_level();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    let result = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .try_init();

    if let Err(e) = result {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

async fn run(args: Args) -> Result<()> {
    let mut config = load_config(&args)?;
    config.merge_with_args(&args);

    match args.command {
        Command::Serve(_) => server::serve(config).await,
        Command::Process(ref process) => run_batch(process, &config).await,
        Command::Recent { limit } => {
            let store = open_store(&config)?;
            print_recent(&store, limit)
        }
        Command::History { ref process_id } => {
            let store = open_store(&config)?;
            let history = store.get_process_history(process_id)?;
            if history.traces.is_empty() {
                anyhow::bail!("No process found with id {}", process_id);
            }
            println!("{}", serde_json::to_string_pretty(&history)?);
            Ok(())
        }
        Command::Search { ref query, limit } => {
            let store = open_store(&config)?;
            print_search(&store, query, limit)
        }
        Command::Stats => {
            let store = open_store(&config)?;
            println!("{}", serde_json::to_string_pretty(&store.get_stats()?)?);
            Ok(())
        }
        // handled before logging starts
        Command::InitConfig { .. } => Ok(()),
    }
}

/// Load configuration from file or use defaults.
fn load_config(args: &Args) -> Result<Config> {
    if let Some(ref config_path) = args.config {
        info!("Loading config from: {}", config_path.display());
        return Config::load(config_path);
    }

    match Config::load_default() {
        Ok(Some(config)) => {
            info!("Loaded default config from {}", CONFIG_FILE_NAME);
            Ok(config)
        }
        Ok(None) => {
            debug!("No config file found, using defaults");
            Ok(Config::default())
        }
        Err(e) => {
            warn!("Failed to load config: {:#}", e);
            Ok(Config::default())
        }
    }
}

fn open_store(config: &Config) -> Result<MemoryStore> {
    MemoryStore::open(&config.memory.db_path)
        .with_context(|| format!("Failed to open memory store: {}", config.memory.db_path))
}

/// Process every scanned document and write the report.
async fn run_batch(args: &ProcessArgs, config: &Config) -> Result<()> {
    let start_time = Instant::now();

    let scan_config = scanner::ScanConfig::from(&config.scanner);
    let files = scanner::DocumentScanner::new(scan_config).scan(&args.paths)?;

    if args.dry_run {
        return handle_dry_run(&files);
    }

    if files.is_empty() {
        println!("   No matching documents found.");
        return Ok(());
    }

    println!("📥 Processing {} documents...", files.len());
    println!(
        "   Intent model: {}",
        if config.model.is_active() {
            config.model.name.as_str()
        } else {
            "keyword scoring only"
        }
    );
    println!(
        "   Actions: {}",
        if config.router.simulate {
            "simulated"
        } else {
            "live"
        }
    );

    let pipeline = Pipeline::from_config(config)?;

    let pb = ProgressBar::new(files.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );

    let concurrency = config.general.concurrency.max(1);
    let mut outcomes: Vec<(usize, Result<ProcessResponse, FailedDocument>)> =
        stream::iter(files.iter().enumerate())
            .map(|(index, file)| {
                let pipeline = &pipeline;
                let pb = &pb;
                async move {
                    let outcome = match file.load() {
                        Ok(input) => Ok(pipeline.process(input).await),
                        Err(e) => {
                            warn!("{:#}", e);
                            Err(FailedDocument {
                                path: file.path.display().to_string(),
                                error: format!("{:#}", e),
                            })
                        }
                    };
                    pb.set_message(file.path.display().to_string());
                    pb.inc(1);
                    (index, outcome)
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;
    pb.finish_and_clear();

    outcomes.sort_by_key(|(index, _)| *index);
    let mut documents = Vec::new();
    let mut failures = Vec::new();
    for (_, outcome) in outcomes {
        match outcome {
            Ok(response) => documents.push(response),
            Err(failure) => failures.push(failure),
        }
    }

    let metadata = ReportMetadata {
        generated_at: Utc::now(),
        inputs: args.paths.iter().map(|p| p.display().to_string()).collect(),
        documents_processed: documents.len(),
        documents_failed: failures.len(),
        duration_seconds: start_time.elapsed().as_secs_f64(),
        model: config
            .model
            .is_active()
            .then(|| config.model.name.clone()),
        live_actions: !config.router.simulate,
    };
    let report = BatchReport::new(metadata, documents, failures);

    let output_path = args
        .output
        .clone()
        .unwrap_or_else(|| PathBuf::from(&config.general.output));
    let content = match args.format {
        OutputFormat::Json => report::generate_json_report(&report)?,
        OutputFormat::Markdown => report::generate_markdown_report(&report),
    };
    report::write_report(&content, &output_path)?;

    let summary = &report.summary;
    println!("\n📊 Batch Summary:");
    println!("   Documents: {}", summary.total);
    for (format, count) in &summary.by_format {
        println!("   - {}: {}", format, count);
    }
    println!(
        "   Invalid: {} | Anomalies: {} | Errors: {}",
        summary.invalid, summary.anomalies, summary.errors
    );
    println!(
        "   Actions: {} succeeded, {} failed, {} escalations",
        summary.actions_succeeded, summary.actions_failed, summary.escalations
    );
    if !report.failures.is_empty() {
        println!("   Unreadable files: {}", report.failures.len());
    }
    println!("   Duration: {:.1}s", report.metadata.duration_seconds);
    println!("\n✅ Report saved to: {}", output_path.display());

    Ok(())
}

/// Handle --dry-run: print what would be processed, exit.
fn handle_dry_run(files: &[scanner::ScannedFile]) -> Result<()> {
    println!("\n🔍 Dry run: scanning inputs (nothing is processed)...\n");

    if files.is_empty() {
        println!("   No matching documents found.");
    } else {
        println!("   Found {} documents that would be processed:\n", files.len());
        for file in files {
            println!("     📄 {} ({} bytes)", file.path.display(), file.size);
        }
    }

    println!("\n✅ Dry run complete.");
    Ok(())
}

fn print_recent(store: &MemoryStore, limit: usize) -> Result<()> {
    let processes = store.get_recent_processes(limit)?;
    if processes.is_empty() {
        println!("No processes recorded yet.");
        return Ok(());
    }

    println!("{:<38} {:<8} {:<34} STAGES", "PROCESS", "FORMAT", "STARTED");
    for process in processes {
        let stages: Vec<String> = process
            .stages
            .iter()
            .map(|(stage, count)| format!("{}x{}", stage, count))
            .collect();
        println!(
            "{:<38} {:<8} {:<34} {}",
            process.process_id,
            process.format.as_deref().unwrap_or("-"),
            process.start_time,
            stages.join(" ")
        );
    }
    Ok(())
}

fn print_search(store: &MemoryStore, query: &str, limit: usize) -> Result<()> {
    let hits = store.search_by_content(query, limit)?;
    if hits.is_empty() {
        println!("No matches for \"{}\".", query);
        return Ok(());
    }

    for hit in hits {
        let detail = hit
            .summary
            .as_deref()
            .or(hit.result.as_deref())
            .unwrap_or("");
        println!(
            "[{}] {} {} {}",
            hit.record_type,
            hit.timestamp,
            hit.id,
            models::excerpt(detail, 100)
        );
    }
    Ok(())
}
