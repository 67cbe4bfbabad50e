//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation and default values.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// InvoiceFlow - multi-agent document intake
///
/// Classifies invoices, e-mails, JSON webhooks and scanned images,
/// extracts their fields, flags anomalies and routes follow-up actions.
///
/// Examples:
///   invoiceflow serve --port 8000
///   invoiceflow process ./inbox --output report.md
///   invoiceflow process invoice.pdf complaint.eml --format json
///   invoiceflow recent --limit 5
///   invoiceflow init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Path to configuration file
    ///
    /// If not specified, looks for .invoiceflow.toml in the current directory
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// API key for the LLM intent hint
    #[arg(long, env = "GROQ_API_KEY", hide_env_values = true, global = true)]
    pub groq_api_key: Option<String>,

    /// LLM model used for intent hints
    #[arg(short, long, env = "INVOICEFLOW_MODEL", global = true)]
    pub model: Option<String>,

    /// Classify with keyword scoring only
    #[arg(long, global = true)]
    pub no_llm: bool,

    /// Ollama endpoint used for image OCR
    #[arg(long, env = "OLLAMA_URL", global = true)]
    pub ollama_url: Option<String>,

    /// SQLite memory database
    #[arg(long, value_name = "FILE", env = "INVOICEFLOW_DB", global = true)]
    pub db: Option<PathBuf>,

    /// Append a JSON line per processed document to this file
    #[arg(long, value_name = "FILE", global = true)]
    pub trace_log: Option<PathBuf>,

    /// Deliver actions over HTTP instead of simulating them
    #[arg(long, global = true)]
    pub live_actions: bool,

    /// Enable verbose logging output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output)
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the HTTP service and dashboard
    Serve(ServeArgs),

    /// Process files or directories and write a report
    Process(ProcessArgs),

    /// List the most recent processes in the memory store
    Recent {
        #[arg(short = 'n', long, default_value = "10")]
        limit: usize,
    },

    /// Show everything recorded for one process
    History {
        /// Process id
        process_id: String,
    },

    /// Search stored classifications, extractions and actions
    Search {
        /// Substring to look for
        query: String,

        #[arg(short = 'n', long, default_value = "10")]
        limit: usize,
    },

    /// Show memory store statistics
    Stats,

    /// Generate a default .invoiceflow.toml configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(clap::Args, Debug, Clone)]
pub struct ServeArgs {
    /// Address to bind
    #[arg(long, env = "INVOICEFLOW_HOST")]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long, env = "INVOICEFLOW_PORT")]
    pub port: Option<u16>,
}

#[derive(clap::Args, Debug, Clone)]
pub struct ProcessArgs {
    /// Files or directories to process
    #[arg(required = true, value_name = "PATH")]
    pub paths: Vec<PathBuf>,

    /// Output file path for the report
    ///
    /// Defaults to the configured report path
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Output format (markdown, json)
    #[arg(long, default_value = "markdown", value_name = "FORMAT")]
    pub format: OutputFormat,

    /// Number of documents processed concurrently
    #[arg(long, value_name = "NUM")]
    pub concurrency: Option<usize>,

    /// Maximum number of documents to process
    #[arg(long, value_name = "COUNT")]
    pub max_files: Option<usize>,

    /// File extensions to include (comma-separated)
    ///
    /// Example: --extensions pdf,eml,json
    #[arg(long, value_name = "EXTS", value_delimiter = ',')]
    pub extensions: Option<Vec<String>>,

    /// Directory names to skip (comma-separated)
    #[arg(long, value_name = "NAMES", value_delimiter = ',')]
    pub exclude: Option<Vec<String>>,

    /// List the documents that would be processed and exit
    #[arg(long)]
    pub dry_run: bool,
}

/// Output format for the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Markdown format (default)
    #[default]
    Markdown,
    /// JSON format
    Json,
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        if let Some(ref url) = self.ollama_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err("Ollama URL must start with 'http://' or 'https://'".to_string());
            }
        }

        match &self.command {
            Command::Serve(serve) => {
                if serve.port == Some(0) {
                    return Err("Port must be between 1 and 65535".to_string());
                }
            }
            Command::Process(process) => {
                if process.concurrency == Some(0) {
                    return Err("Concurrency must be at least 1".to_string());
                }
                if process.max_files == Some(0) {
                    return Err("Max files must be at least 1".to_string());
                }
                for path in &process.paths {
                    if !path.exists() {
                        return Err(format!("Input path does not exist: {}", path.display()));
                    }
                }
            }
            Command::Recent { limit } | Command::Search { limit, .. } => {
                if *limit == 0 {
                    return Err("Limit must be at least 1".to_string());
                }
            }
            Command::History { .. } | Command::Stats | Command::InitConfig { .. } => {}
        }

        Ok(())
    }

    /// Returns the log level based on verbosity settings.
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_args(command: Command) -> Args {
        Args {
            command,
            config: None,
            groq_api_key: None,
            model: None,
            no_llm: false,
            ollama_url: None,
            db: None,
            trace_log: None,
            live_actions: false,
            verbose: false,
            quiet: false,
        }
    }

    fn process_args(paths: Vec<PathBuf>) -> ProcessArgs {
        ProcessArgs {
            paths,
            output: None,
            format: OutputFormat::Markdown,
            concurrency: None,
            max_files: None,
            extensions: None,
            exclude: None,
            dry_run: false,
        }
    }

    #[test]
    fn test_validation_conflicting_options() {
        let mut args = make_args(Command::Stats);
        args.verbose = true;
        args.quiet = true;
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_validation_invalid_ollama_url() {
        let mut args = make_args(Command::Stats);
        args.ollama_url = Some("localhost:11434".to_string());
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_validation_process_inputs() {
        let dir = tempfile::TempDir::new().unwrap();
        let args = make_args(Command::Process(process_args(vec![dir.path().to_path_buf()])));
        assert!(args.validate().is_ok());

        let missing = make_args(Command::Process(process_args(vec![dir.path().join("x")])));
        assert!(missing.validate().is_err());

        let mut zero = process_args(vec![dir.path().to_path_buf()]);
        zero.concurrency = Some(0);
        assert!(make_args(Command::Process(zero)).validate().is_err());
    }

    #[test]
    fn test_validation_zero_limit() {
        let args = make_args(Command::Search {
            query: "invoice".to_string(),
            limit: 0,
        });
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_parse_subcommand_with_global_flags() {
        let args = Args::try_parse_from([
            "invoiceflow",
            "process",
            "inbox",
            "--format",
            "json",
            "--extensions",
            "pdf,eml",
            "--no-llm",
        ])
        .unwrap();
        assert!(args.no_llm);
        match args.command {
            Command::Process(process) => {
                assert_eq!(process.format, OutputFormat::Json);
                assert_eq!(
                    process.extensions,
                    Some(vec!["pdf".to_string(), "eml".to_string()])
                );
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_log_level() {
        let mut args = make_args(Command::Stats);
        assert_eq!(args.log_level(), tracing::Level::INFO);

        args.verbose = true;
        assert_eq!(args.log_level(), tracing::Level::DEBUG);

        args.verbose = false;
        args.quiet = true;
        assert_eq!(args.log_level(), tracing::Level::ERROR);
    }
}
