//! Configuration for fabtrack, read from `.fabtrack/fabtrack.toml`.
//!
//! Settings are layered: file, then environment, then CLI flags.
//!
//! ```toml
//! [server]
//! port = 3141
//! dev_mode = false
//!
//! [database]
//! path = ".fabtrack/fabtrack.db"
//!
//! [logging]
//! filter = "info"
//! json = false
//!
//! [tracker]
//! old_active_job_minutes = 4786
//! session_ttl_minutes = 480
//! reset_token_minutes = 15
//!
//! [bootstrap]
//! admin_username = "admin"
//! admin_email = "admin@example.com"
//! admin_password = "Fabtrack1"
//! demo_data = false
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CONFIG_DIR: &str = ".fabtrack";
pub const CONFIG_FILE: &str = "fabtrack.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Permissive CORS and bind on all interfaces
    #[serde(default)]
    pub dev_mode: bool,
}

fn default_port() -> u16 {
    3141
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            dev_mode: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSection {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from(CONFIG_DIR).join("fabtrack.db")
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Fallback filter when `RUST_LOG` is unset
    #[serde(default = "default_filter")]
    pub filter: String,
    #[serde(default)]
    pub json: bool,
}

fn default_filter() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerSection {
    /// Threshold used while the `oldActiveJob` global config entry is unset
    #[serde(default = "default_old_active_job_minutes")]
    pub old_active_job_minutes: i64,
    #[serde(default = "default_session_ttl_minutes")]
    pub session_ttl_minutes: i64,
    #[serde(default = "default_reset_token_minutes")]
    pub reset_token_minutes: i64,
}

fn default_old_active_job_minutes() -> i64 {
    4786
}

fn default_session_ttl_minutes() -> i64 {
    480
}

fn default_reset_token_minutes() -> i64 {
    15
}

impl Default for TrackerSection {
    fn default() -> Self {
        Self {
            old_active_job_minutes: default_old_active_job_minutes(),
            session_ttl_minutes: default_session_ttl_minutes(),
            reset_token_minutes: default_reset_token_minutes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapSection {
    #[serde(default = "default_admin_username")]
    pub admin_username: String,
    #[serde(default = "default_admin_email")]
    pub admin_email: String,
    #[serde(default = "default_admin_password")]
    pub admin_password: String,
    #[serde(default)]
    pub demo_data: bool,
}

fn default_admin_username() -> String {
    "admin".to_string()
}

fn default_admin_email() -> String {
    "admin@example.com".to_string()
}

fn default_admin_password() -> String {
    "Fabtrack1".to_string()
}

impl Default for BootstrapSection {
    fn default() -> Self {
        Self {
            admin_username: default_admin_username(),
            admin_email: default_admin_email(),
            admin_password: default_admin_password(),
            demo_data: false,
        }
    }
}

/// The complete fabtrack.toml configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FabtrackToml {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub tracker: TrackerSection,
    #[serde(default)]
    pub bootstrap: BootstrapSection,
}

impl FabtrackToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse fabtrack.toml")
    }

    /// Load `fabtrack.toml` from `config_dir`, or defaults when it is missing.
    pub fn load_or_default(config_dir: &Path) -> Result<Self> {
        let config_path = config_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize fabtrack.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.server.port == 0 {
            warnings.push("server.port is 0; the OS will pick a random port".to_string());
        }
        if self.tracker.old_active_job_minutes <= 0 {
            warnings.push(format!(
                "tracker.old_active_job_minutes must be positive, got {}",
                self.tracker.old_active_job_minutes
            ));
        }
        if self.tracker.session_ttl_minutes <= 0 {
            warnings.push(format!(
                "tracker.session_ttl_minutes must be positive, got {}",
                self.tracker.session_ttl_minutes
            ));
        }
        if self.tracker.reset_token_minutes <= 0 {
            warnings.push(format!(
                "tracker.reset_token_minutes must be positive, got {}",
                self.tracker.reset_token_minutes
            ));
        }
        if self.bootstrap.admin_username.trim().is_empty() {
            warnings.push("bootstrap.admin_username is empty".to_string());
        }
        if tracing_subscriber::EnvFilter::try_new(&self.logging.filter).is_err() {
            warnings.push(format!("Invalid logging.filter '{}'", self.logging.filter));
        }
        warnings
    }
}

/// Parse a boolean environment value. Accepts `1/0`, `true/false`, `yes/no`, `on/off`.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_bool(name: &str) -> Option<bool> {
    std::env::var(name).ok().and_then(|v| parse_bool(&v))
}

/// Resolved configuration for one project directory.
///
/// Merges `fabtrack.toml`, `FABTRACK_*` environment variables and CLI flags.
#[derive(Debug, Clone)]
pub struct FabtrackConfig {
    pub project_dir: PathBuf,
    pub config_dir: PathBuf,
    pub toml: FabtrackToml,
}

impl FabtrackConfig {
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let config_dir = project_dir.join(CONFIG_DIR);
        let toml = FabtrackToml::load_or_default(&config_dir)?;
        Ok(Self {
            project_dir,
            config_dir,
            toml,
        })
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE)
    }

    /// Port (env `FABTRACK_PORT` → file → default).
    pub fn port(&self) -> u16 {
        std::env::var("FABTRACK_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(self.toml.server.port)
    }

    /// Database path, resolved against the project directory.
    pub fn db_path(&self) -> PathBuf {
        let path = std::env::var("FABTRACK_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| self.toml.database.path.clone());
        if path.is_absolute() {
            path
        } else {
            self.project_dir.join(path)
        }
    }

    pub fn demo_data(&self) -> bool {
        env_bool("FABTRACK_DEMO").unwrap_or(self.toml.bootstrap.demo_data)
    }

    pub fn log_json(&self) -> bool {
        env_bool("FABTRACK_LOG_JSON").unwrap_or(self.toml.logging.json)
    }

    pub fn admin_password(&self) -> String {
        std::env::var("FABTRACK_ADMIN_PASSWORD")
            .unwrap_or_else(|_| self.toml.bootstrap.admin_password.clone())
    }
}
