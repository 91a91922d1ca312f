//! Configuration loading and types for PartKeeper.
//!
//! Configuration is read from an optional YAML file and deserialized
//! into the [`Config`] struct, then overlaid with `PARTKEEPER_*`
//! environment variables and validated.  Each subsection governs a
//! different part of the system: networking, the remote object store,
//! session persistence, part staging, and upload policy.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Remote object store settings.
    #[serde(default)]
    pub s3: S3Config,

    /// Session store settings.
    #[serde(default)]
    pub sessions: SessionsConfig,

    /// Temporary staging of part bodies.
    #[serde(default)]
    pub staging: StagingConfig,

    /// Upload policy.
    #[serde(default)]
    pub upload: UploadConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Observability settings.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind host address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Graceful shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,

    /// Maximum part body size in bytes (default 5 GiB).
    #[serde(default = "default_max_part_size")]
    pub max_part_size: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_timeout: default_shutdown_timeout(),
            max_part_size: default_max_part_size(),
        }
    }
}

/// Remote object store configuration.
///
/// There are no production defaults for the endpoint or credentials;
/// with `backend: s3` they must come from the file or the environment.
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// Backend type: `s3` or `memory`.
    #[serde(default = "default_s3_backend")]
    pub backend: String,

    /// S3-compatible endpoint URL.
    #[serde(default)]
    pub endpoint_url: Option<String>,

    /// Access key (also accepts `access_key_id`).
    #[serde(alias = "access_key_id", default)]
    pub access_key: Option<String>,

    /// Secret key (also accepts `secret_access_key`).
    #[serde(alias = "secret_access_key", default)]
    pub secret_key: Option<String>,

    /// Bucket every upload targets.
    #[serde(default)]
    pub bucket: String,

    /// Region to sign requests for.
    #[serde(default = "default_region")]
    pub region: String,

    /// Use path-style addressing.
    #[serde(default = "default_true")]
    pub use_path_style: bool,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            backend: default_s3_backend(),
            endpoint_url: None,
            access_key: None,
            secret_key: None,
            bucket: String::new(),
            region: default_region(),
            use_path_style: true,
        }
    }
}

/// Session store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionsConfig {
    /// Connection URI: `memory://` or `sqlite://<path>`.
    #[serde(default = "default_sessions_uri")]
    pub uri: String,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            uri: default_sessions_uri(),
        }
    }
}

/// Part staging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StagingConfig {
    /// Directory for staged part files.  Defaults to the system temp dir.
    #[serde(default)]
    pub dir: Option<PathBuf>,

    /// Bytes buffered before each write to the staged file.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            dir: None,
            chunk_size: default_chunk_size(),
        }
    }
}

/// Upload policy.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Reject out-of-range part numbers and undersized non-final parts
    /// before contacting the remote store.
    #[serde(default)]
    pub strict: bool,

    /// Timeout in seconds applied to each session-store and gateway call.
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout: u64,

    /// Abort the remote upload when the local session cannot be created.
    #[serde(default = "default_true")]
    pub compensate_orphans: bool,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            strict: false,
            operation_timeout: default_operation_timeout(),
            compensate_orphans: true,
        }
    }
}

impl UploadConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics collection and the `/metrics` endpoint.
    #[serde(default = "default_true")]
    pub metrics: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { metrics: true }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_max_part_size() -> u64 {
    crate::gateway::backend::MAX_PART_SIZE
}

fn default_s3_backend() -> String {
    "s3".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_sessions_uri() -> String {
    "sqlite://./data/sessions.db".to_string()
}

fn default_chunk_size() -> usize {
    1024 * 1024
}

fn default_operation_timeout() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    Ok(config)
}

/// Load the file if one is given, apply environment overrides, validate.
pub fn resolve_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let mut config = match path {
        Some(path) => load_config(path)?,
        None => Config::default(),
    };
    config.apply_overrides(|name| std::env::var(name).ok())?;
    config.validate()?;
    Ok(config)
}

fn parse_bool(name: &str, value: &str) -> anyhow::Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("{name}: expected a boolean, got '{other}'"),
    }
}

impl Config {
    /// Overlay `PARTKEEPER_*` variables looked up through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("PARTKEEPER_S3_ENDPOINT") {
            self.s3.endpoint_url = Some(v);
        }
        if let Some(v) = lookup("PARTKEEPER_S3_ACCESS_KEY") {
            self.s3.access_key = Some(v);
        }
        if let Some(v) = lookup("PARTKEEPER_S3_SECRET_KEY") {
            self.s3.secret_key = Some(v);
        }
        if let Some(v) = lookup("PARTKEEPER_S3_BUCKET") {
            self.s3.bucket = v;
        }
        if let Some(v) = lookup("PARTKEEPER_S3_REGION") {
            self.s3.region = v;
        }
        if let Some(v) = lookup("PARTKEEPER_SESSIONS_URI") {
            self.sessions.uri = v;
        }
        if let Some(v) = lookup("PARTKEEPER_STAGING_CHUNK_SIZE") {
            self.staging.chunk_size = v.trim().parse().map_err(|e| {
                anyhow::anyhow!("PARTKEEPER_STAGING_CHUNK_SIZE: invalid value '{v}': {e}")
            })?;
        }
        if let Some(v) = lookup("PARTKEEPER_STRICT") {
            self.upload.strict = parse_bool("PARTKEEPER_STRICT", &v)?;
        }
        Ok(())
    }

    /// Reject configurations the server cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.s3.bucket.trim().is_empty() {
            anyhow::bail!("s3.bucket must be set (or PARTKEEPER_S3_BUCKET)");
        }
        match self.s3.backend.as_str() {
            "memory" => {}
            "s3" => {
                let missing: Vec<&str> = [
                    ("s3.endpoint_url", self.s3.endpoint_url.is_none()),
                    ("s3.access_key", self.s3.access_key.is_none()),
                    ("s3.secret_key", self.s3.secret_key.is_none()),
                ]
                .into_iter()
                .filter_map(|(name, absent)| absent.then_some(name))
                .collect();
                if !missing.is_empty() {
                    anyhow::bail!("s3 backend requires {}", missing.join(", "));
                }
            }
            other => anyhow::bail!("unknown s3.backend '{other}' (expected s3 or memory)"),
        }
        if self.staging.chunk_size == 0 {
            anyhow::bail!("staging.chunk_size must be greater than zero");
        }
        if self.upload.operation_timeout == 0 {
            anyhow::bail!("upload.operation_timeout must be greater than zero");
        }
        if self.server.max_part_size == 0 {
            anyhow::bail!("server.max_part_size must be greater than zero");
        }
        Ok(())
    }
}
