//! ==============================================================================
//! config.rs - Runtime Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `host.toml`.
//!     loads configuration from file or falls back to defaults, then applies
//!     environment overrides (DATABASE_URL, PORT, APP_ENV).
//!
//! structure:
//!     - ServerConfig: Bind address, port and environment name.
//!     - DatabaseConfig: redb file path; optional, its absence means degraded mode.
//!     - SimulationConfig: Generator toggle, period and the known device list.
//!     - ClientConfig: API url and poll periods for the `watch` command.
//!     - LoggingConfig: Default tracing filter.
//!
//! ==============================================================================

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct HostConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// "development" or "production", echoed by `GET /`
    pub environment: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct DatabaseConfig {
    /// redb database file; unset means run without persistence
    pub path: Option<PathBuf>,
    /// refuse to start when the database cannot be opened
    pub required: bool,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SimulationConfig {
    pub enabled: bool,
    pub interval_seconds: u64,
    /// seed list of known devices the generator feeds
    pub devices: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ClientConfig {
    /// base url of the readings api, e.g. http://localhost:5000/api/data
    pub api_url: String,
    pub latest_interval_seconds: u64,
    pub status_interval_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 5000,
            environment: "development".to_string(),
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 10,
            devices: vec![
                "device001".to_string(),
                "device002".to_string(),
                "device003".to_string(),
            ],
        }
    }
}

impl SimulationConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds.max(1))
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:5000/api/data".to_string(),
            latest_interval_seconds: 10,
            status_interval_seconds: 30,
        }
    }
}

impl ClientConfig {
    pub fn latest_interval(&self) -> Duration {
        Duration::from_secs(self.latest_interval_seconds.max(1))
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_seconds.max(1))
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl HostConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| anyhow::anyhow!("Failed to read config file: {}", e))?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        toml::from_str(content).map_err(|e| anyhow::anyhow!("Failed to parse config: {}", e))
    }

    /// Load with default fallback
    ///
    /// runs before tracing is initialised (the log level lives in here),
    /// so it reports on stdout.
    pub fn load_or_default() -> Self {
        let paths = [
            PathBuf::from("config").join("host.toml"),
            PathBuf::from("..").join("config").join("host.toml"),
        ];

        for path in &paths {
            if path.exists() {
                match Self::load(path) {
                    Ok(config) => {
                        println!("[CONFIG] Loaded from {}", path.display());
                        return config;
                    }
                    Err(e) => {
                        println!("[CONFIG] Warning: Failed to load {}: {}", path.display(), e);
                    }
                }
            }
        }

        println!("[CONFIG] Warning: No config file found - using defaults");
        Self::default()
    }

    /// Apply DATABASE_URL / PORT / APP_ENV from the process environment
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(url) = lookup("DATABASE_URL").filter(|v| !v.is_empty()) {
            self.database.path = Some(PathBuf::from(url));
        }
        if let Some(port) = lookup("PORT") {
            match port.parse() {
                Ok(port) => self.server.port = port,
                Err(_) => println!("[CONFIG] Warning: ignoring invalid PORT {:?}", port),
            }
        }
        if let Some(env) = lookup("APP_ENV").filter(|v| !v.is_empty()) {
            self.server.environment = env;
        }
        self
    }

    /// Print configuration summary
    pub fn print_summary(&self) {
        let database = self
            .database
            .path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - degraded mode)".to_string());
        println!("┌─────────────────────────────────────────┐");
        println!("│           HOST CONFIGURATION            │");
        println!("├─────────────────────────────────────────┤");
        println!("│ Environment: {}", self.server.environment);
        println!("│ Listen: {}:{}", self.server.bind, self.server.port);
        println!("│ Database: {}", database);
        println!("│ Simulation: {} ({}s)", self.simulation.enabled, self.simulation.interval_seconds);
        println!("│ Devices: {}", self.simulation.devices.join(", "));
        println!("│ Log Level: {}", self.logging.level);
        println!("└─────────────────────────────────────────┘");
    }
}
