use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

/// Upper bound for TOKEN_REFRESH_THRESHOLD, in seconds
pub const MAX_REFRESH_THRESHOLD: u64 = 86_400;

/// Upper bound for HTTP_REQUEST_TIMEOUT, in seconds
pub const MAX_REQUEST_TIMEOUT: u64 = 3_600;

/// clipsync - background sync core for the web clipper
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Base URL of the clipper API (e.g. https://api.example.com/v1)
    #[arg(short = 'u', long, env = "API_BASE_URL", default_value = "http://localhost:3000/api")]
    pub api_base_url: String,

    /// Path to the local storage SQLite database
    #[arg(short = 'd', long, env = "CLIPSYNC_DB_FILE")]
    pub db_file: Option<String>,

    /// Bridge host address for UI surfaces
    #[arg(short = 'H', long, env = "BRIDGE_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Bridge port
    #[arg(short, long, env = "BRIDGE_PORT", default_value = "8765")]
    pub port: u16,

    /// Shared key UI surfaces must present to the bridge
    #[arg(short = 'k', long, env = "BRIDGE_API_KEY")]
    pub bridge_key: Option<String>,

    /// IANA timezone sent as X-User-Timezone
    #[arg(long, env = "USER_TIMEZONE")]
    pub timezone: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "10")]
    pub http_timeout: u64,

    /// Max attempts for a request rejected with 401
    #[arg(long, env = "HTTP_MAX_RETRIES", default_value = "3")]
    pub http_retries: u32,

    /// Background sync interval in seconds
    #[arg(long, env = "SYNC_INTERVAL", default_value = "60")]
    pub sync_interval: u64,
}

#[derive(Clone, Debug)]
pub struct Config {
    // API
    pub api_base_url: String,
    pub user_timezone: String,

    // Local storage
    pub storage_db_file: PathBuf,

    // Bridge settings
    pub bridge_host: String,
    pub bridge_port: u16,
    pub bridge_api_key: Option<String>,

    // Token lifecycle
    pub token_refresh_threshold: u64,
    pub max_refresh_failures: u32,

    // HTTP client
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,
    pub http_max_retries: u32,

    // Background sync
    pub sync_interval: u64,

    pub log_level: String,
}

impl Config {
    /// Load configuration from all sources with priority: CLI > ENV > defaults
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let args = CliArgs::parse();

        let storage_db_file = match args.db_file {
            Some(path) => expand_tilde(&path),
            None => default_db_path().context(
                "Could not determine a data directory (use -d or set CLIPSYNC_DB_FILE)",
            )?,
        };

        let config = Config {
            api_base_url: args.api_base_url.trim_end_matches('/').to_string(),
            user_timezone: resolve_timezone(args.timezone),

            storage_db_file,

            bridge_host: args.host,
            bridge_port: args.port,
            bridge_api_key: args.bridge_key.filter(|k| !k.is_empty()),

            token_refresh_threshold: env_or("TOKEN_REFRESH_THRESHOLD", 300),
            max_refresh_failures: env_or("MAX_REFRESH_FAILURES", 3),

            http_connect_timeout: env_or("HTTP_CONNECT_TIMEOUT", 5),
            http_request_timeout: args.http_timeout,
            http_max_retries: args.http_retries,

            sync_interval: args.sync_interval,

            log_level: args.log_level,
        };

        Ok(config)
    }

    /// Defaults pointed at `api_base_url`, with in-memory friendly paths
    pub fn for_api(api_base_url: impl Into<String>) -> Self {
        Config {
            api_base_url: api_base_url.into().trim_end_matches('/').to_string(),
            user_timezone: "UTC".to_string(),
            storage_db_file: PathBuf::from("clipsync.sqlite3"),
            bridge_host: "127.0.0.1".to_string(),
            bridge_port: 8765,
            bridge_api_key: None,
            token_refresh_threshold: 300,
            max_refresh_failures: 3,
            http_connect_timeout: 5,
            http_request_timeout: 10,
            http_max_retries: 3,
            sync_interval: 60,
            log_level: "info".to_string(),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !self.api_base_url.starts_with("http://") && !self.api_base_url.starts_with("https://")
        {
            anyhow::bail!(
                "API_BASE_URL must be an http(s) URL: {}",
                self.api_base_url
            );
        }

        self.user_timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|e| anyhow::anyhow!("USER_TIMEZONE is not an IANA timezone: {}", e))?;

        if self.http_request_timeout == 0 || self.http_request_timeout > MAX_REQUEST_TIMEOUT {
            anyhow::bail!(
                "HTTP_REQUEST_TIMEOUT must be between 1 and {} seconds",
                MAX_REQUEST_TIMEOUT
            );
        }

        if self.token_refresh_threshold > MAX_REFRESH_THRESHOLD {
            anyhow::bail!(
                "TOKEN_REFRESH_THRESHOLD must be at most {} seconds",
                MAX_REFRESH_THRESHOLD
            );
        }

        if self.sync_interval == 0 {
            anyhow::bail!("SYNC_INTERVAL must be at least 1 second");
        }

        Ok(())
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Explicit setting, then a parseable TZ, then UTC
fn resolve_timezone(explicit: Option<String>) -> String {
    if let Some(tz) = explicit.filter(|s| !s.is_empty()) {
        return tz;
    }

    std::env::var("TZ")
        .ok()
        .filter(|tz| tz.parse::<chrono_tz::Tz>().is_ok())
        .unwrap_or_else(|| "UTC".to_string())
}

fn default_db_path() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("clipsync").join("storage.sqlite3"))
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
