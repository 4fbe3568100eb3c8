use std::env;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Distinguishes runtime behavior for different stages of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnvironment {
    Development,
    Test,
    Production,
}

impl AppEnvironment {
    fn from_str(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Self::Production,
            "test" | "ci" => Self::Test,
            _ => Self::Development,
        }
    }
}

/// Top-level configuration for the application.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: AppEnvironment,
    pub server: ServerConfig,
    pub telemetry: TelemetryConfig,
    pub upstream: UpstreamConfig,
    pub sync: SyncConfig,
    pub storage: StorageConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let environment = AppEnvironment::from_str(
            &env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
        );

        let host = env::var("APP_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("APP_PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidPort)?;

        let log_level = env::var("APP_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let upstream = UpstreamConfig {
            planit_base_url: env_string("PLANIT_BASE_URL", "https://www.planit.org.uk"),
            crm_base_url: env_string("CRM_BASE_URL", "https://services.leadconnectorhq.com"),
            crm_api_version: env_string("CRM_API_VERSION", "2021-07-28"),
            http_timeout: Duration::from_secs(env_number("SYNC_HTTP_TIMEOUT_SECS", 30)?),
        };

        let sync = SyncConfig {
            page_delay: Duration::from_millis(env_number("SYNC_PAGE_DELAY_MS", 500)?),
            delivery_delay: Duration::from_millis(env_number("SYNC_DELIVERY_DELAY_MS", 500)?),
            rate_limit_wait: Duration::from_millis(env_number("SYNC_RATE_LIMIT_WAIT_MS", 5000)?),
            max_records: env_number("SYNC_MAX_RECORDS", 5000)?,
            default_lookback_days: env_number("SYNC_DEFAULT_LOOKBACK_DAYS", 7)?,
        };

        let storage = StorageConfig {
            state_path: PathBuf::from(env_string("SYNC_STATE_PATH", "lead-sync.db")),
        };

        Ok(Self {
            environment,
            server: ServerConfig { host, port },
            telemetry: TelemetryConfig { log_level },
            upstream,
            sync,
            storage,
        })
    }
}

fn env_string(name: &'static str, default: &str) -> String {
    env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_number<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidNumber { name, value: raw }),
        _ => Ok(default),
    }
}

/// Settings controlling the HTTP server binding.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        if self.host.eq_ignore_ascii_case("localhost") {
            return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), self.port));
        }

        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|source| ConfigError::InvalidHost { source })?;

        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Tracing controls.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub log_level: String,
}

/// Endpoints and client settings for the planning source and the CRM.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub planit_base_url: String,
    pub crm_base_url: String,
    pub crm_api_version: String,
    pub http_timeout: Duration,
}

/// Pacing and limits applied by the sync pipeline.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub page_delay: Duration,
    pub delivery_delay: Duration,
    pub rate_limit_wait: Duration,
    pub max_records: usize,
    pub default_lookback_days: i64,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub state_path: PathBuf,
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
    InvalidHost { source: std::net::AddrParseError },
    InvalidNumber { name: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "APP_PORT must be a valid u16"),
            ConfigError::InvalidHost { .. } => {
                write!(f, "APP_HOST must parse to an IPv4 or IPv6 address")
            }
            ConfigError::InvalidNumber { name, value } => {
                write!(f, "{name} must be a non-negative number (got '{value}')")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::InvalidPort | ConfigError::InvalidNumber { .. } => None,
            ConfigError::InvalidHost { source } => Some(source),
        }
    }
}
