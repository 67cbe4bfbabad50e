//! Configuration file handling.
//!
//! This module handles loading and merging configuration from
//! `.invoiceflow.toml` files.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::router::EndpointConfig;

/// Default configuration file name, looked up in the current directory.
pub const CONFIG_FILE_NAME: &str = ".invoiceflow.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// LLM intent hint settings.
    #[serde(default)]
    pub model: ModelConfig,

    /// Vision-model OCR settings.
    #[serde(default)]
    pub ocr: OcrConfig,

    /// Persistence and session settings.
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Action delivery settings.
    #[serde(default)]
    pub router: RouterConfig,

    /// Input scanner settings.
    #[serde(default)]
    pub scanner: ScannerConfig,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Default report path for batch runs.
    #[serde(default = "default_output")]
    pub output: String,

    /// Enable verbose logging by default.
    #[serde(default)]
    pub verbose: bool,

    /// Number of documents processed concurrently in batch runs.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            output: default_output(),
            verbose: false,
            concurrency: default_concurrency(),
        }
    }
}

fn default_output() -> String {
    "invoiceflow_report.md".to_string()
}

fn default_concurrency() -> usize {
    4
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Maximum accepted request body in bytes.
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,

    /// Directory for the `/log/` endpoint's daily files.
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_upload_bytes: default_max_upload_bytes(),
            log_dir: default_log_dir(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_max_upload_bytes() -> usize {
    10 * 1024 * 1024 // 10MiB
}

fn default_log_dir() -> String {
    "logs".to_string()
}

/// LLM settings for the classifier's intent hint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Consult the LLM at all. It is also skipped when no API key is set.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// OpenAI-compatible API base URL.
    #[serde(default = "default_model_base_url")]
    pub base_url: String,

    #[serde(default = "default_model")]
    pub name: String,

    /// API key. Usually supplied through `GROQ_API_KEY` instead of the file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default)]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Request timeout in seconds.
    #[serde(default = "default_model_timeout")]
    pub timeout_seconds: u64,

    /// Characters of document text sent with the prompt.
    #[serde(default = "default_max_prompt_chars")]
    pub max_prompt_chars: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: default_model_base_url(),
            name: default_model(),
            api_key: None,
            temperature: 0.0,
            max_tokens: default_max_tokens(),
            timeout_seconds: default_model_timeout(),
            max_prompt_chars: default_max_prompt_chars(),
        }
    }
}

impl ModelConfig {
    /// Whether the LLM hint should be requested.
    pub fn is_active(&self) -> bool {
        self.enabled
            && self
                .api_key
                .as_deref()
                .map(|k| !k.trim().is_empty())
                .unwrap_or(false)
    }
}

fn default_model_base_url() -> String {
    "https://api.groq.com/openai/v1".to_string()
}

fn default_model() -> String {
    "llama3-8b-8192".to_string()
}

fn default_max_tokens() -> u32 {
    1000
}

fn default_model_timeout() -> u64 {
    30
}

fn default_max_prompt_chars() -> usize {
    2000
}

/// OCR through an Ollama vision model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_ollama_url")]
    pub ollama_url: String,

    #[serde(default = "default_ocr_model")]
    pub model: String,

    #[serde(default = "default_ocr_prompt")]
    pub prompt: String,

    #[serde(default = "default_ocr_timeout")]
    pub timeout_seconds: u64,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ollama_url: default_ollama_url(),
            model: default_ocr_model(),
            prompt: default_ocr_prompt(),
            timeout_seconds: default_ocr_timeout(),
        }
    }
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_ocr_model() -> String {
    "llama3.2-vision".to_string()
}

fn default_ocr_prompt() -> String {
    "Transcribe all text visible in this image exactly as written. \
     Preserve line breaks and table layout. Output only the text."
        .to_string()
}

fn default_ocr_timeout() -> u64 {
    120
}

/// Memory store and session manager settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// SQLite database file.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Optional JSON-lines trace log, one line per processed document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_log: Option<String>,

    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Default session lifetime in seconds.
    #[serde(default = "default_session_ttl")]
    pub session_ttl_seconds: u64,

    /// Interval of the background expiry sweep in seconds.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_seconds: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            trace_log: None,
            max_sessions: default_max_sessions(),
            session_ttl_seconds: default_session_ttl(),
            cleanup_interval_seconds: default_cleanup_interval(),
        }
    }
}

fn default_db_path() -> String {
    "./memory.db".to_string()
}

fn default_max_sessions() -> usize {
    1000
}

fn default_session_ttl() -> u64 {
    3600
}

fn default_cleanup_interval() -> u64 {
    300
}

/// Action delivery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Use the simulated transport instead of real HTTP calls.
    #[serde(default = "default_true")]
    pub simulate: bool,

    /// Sleep a random fraction of the endpoint timeout when simulating.
    #[serde(default = "default_true")]
    pub simulated_latency: bool,

    /// Per-endpoint delivery settings keyed by endpoint template.
    #[serde(default = "EndpointConfig::defaults")]
    pub endpoints: BTreeMap<String, EndpointConfig>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            simulate: true,
            simulated_latency: true,
            endpoints: EndpointConfig::defaults(),
        }
    }
}

/// Input scanner settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    /// Maximum documents per batch run.
    #[serde(default = "default_max_files")]
    pub max_files: usize,

    /// File extensions to include.
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,

    /// Path components to exclude.
    #[serde(default = "default_excludes")]
    pub excludes: Vec<String>,

    /// Maximum file size in bytes.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            max_files: default_max_files(),
            extensions: default_extensions(),
            excludes: default_excludes(),
            max_file_size: default_max_file_size(),
        }
    }
}

fn default_max_files() -> usize {
    500
}

fn default_extensions() -> Vec<String> {
    vec![
        "pdf", "eml", "txt", "json", "png", "jpg", "jpeg", "bmp", "tiff",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_excludes() -> Vec<String> {
    vec![".git", "target", "node_modules", "logs", "__pycache__"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_max_file_size() -> u64 {
    10 * 1024 * 1024
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        Ok(config)
    }

    /// Check values that deserialize fine but cannot be used.
    pub fn validate(&self) -> Result<()> {
        use crate::memory::sessions::{MAX_TTL_SECONDS, MIN_TTL_SECONDS};

        let ttl = self.memory.session_ttl_seconds;
        if !(MIN_TTL_SECONDS..=MAX_TTL_SECONDS).contains(&ttl) {
            anyhow::bail!(
                "memory.session_ttl_seconds must be between {} and {}, got {}",
                MIN_TTL_SECONDS,
                MAX_TTL_SECONDS,
                ttl
            );
        }
        for (endpoint, settings) in &self.router.endpoints {
            let timeout = settings.timeout_seconds;
            if !timeout.is_finite() || timeout < 0.0 {
                anyhow::bail!(
                    "router timeout for {} must be a finite number of seconds, got {}",
                    endpoint,
                    timeout
                );
            }
        }
        Ok(())
    }

    /// Try to load configuration from the default location.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        let default_path = Path::new(CONFIG_FILE_NAME);

        if default_path.exists() {
            Ok(Some(Self::load(default_path)?))
        } else {
            Ok(None)
        }
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// CLI arguments take precedence over config file settings, but only
    /// when they were actually provided.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if let Some(ref key) = args.groq_api_key {
            self.model.api_key = Some(key.clone());
        }
        if let Some(ref model) = args.model {
            self.model.name = model.clone();
        }
        if args.no_llm {
            self.model.enabled = false;
        }
        if let Some(ref url) = args.ollama_url {
            self.ocr.ollama_url = url.clone();
        }
        if let Some(ref db) = args.db {
            self.memory.db_path = db.display().to_string();
        }
        if let Some(ref trace) = args.trace_log {
            self.memory.trace_log = Some(trace.display().to_string());
        }
        if args.live_actions {
            self.router.simulate = false;
        }
        if args.verbose {
            self.general.verbose = true;
        }

        match &args.command {
            crate::cli::Command::Serve(serve) => {
                if let Some(ref host) = serve.host {
                    self.server.host = host.clone();
                }
                if let Some(port) = serve.port {
                    self.server.port = port;
                }
            }
            crate::cli::Command::Process(process) => {
                if let Some(concurrency) = process.concurrency {
                    self.general.concurrency = concurrency;
                }
                if let Some(max_files) = process.max_files {
                    self.scanner.max_files = max_files;
                }
                if let Some(ref extensions) = process.extensions {
                    self.scanner.extensions = extensions.clone();
                }
                if let Some(ref excludes) = process.exclude {
                    self.scanner.excludes = excludes.clone();
                }
            }
            _ => {}
        }
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}
