//! Configuration for the conductor engine and its HTTP surface.
//!
//! Settings are read from `conductor.toml` and layered:
//! file → environment (`CONDUCTOR_BIND`, `CONDUCTOR_LOG`) → CLI flags.
//!
//! # Configuration File Format
//!
//! ```toml
//! [engine]
//! default_phase = 50
//! strict_params = false
//!
//! [timeouts]
//! default_ms = 30000
//! rolling_window_ms = 30000
//!
//! [server]
//! bind = "127.0.0.1:3000"
//!
//! [logging]
//! level = "info"
//! format = "pretty"
//!
//! [[actions]]
//! module = "users"
//! name = "load"
//! topic = "http/get/users/:id"
//! phase = 10
//! timeout_ms = 500
//!
//! [actions.data]
//! source = "manifest"
//! ```

use crate::manifest::ManifestAction;
use anyhow::{Context, Result};
use conductor_common::{ActionId, DEFAULT_PHASE};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Name of the configuration file looked up in the working directory.
pub const CONFIG_FILE: &str = "conductor.toml";

/// Environment variable overriding `[server] bind`.
pub const BIND_ENV: &str = "CONDUCTOR_BIND";

/// Environment variable overriding `[logging] level`.
pub const LOG_ENV: &str = "CONDUCTOR_LOG";

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable output (default)
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("Invalid log format '{}'. Valid values: pretty, json", s),
        }
    }
}

/// Engine behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSection {
    /// Phase given to manifest actions that do not declare one
    #[serde(default = "default_phase")]
    pub default_phase: i32,
    /// Reject topics whose matching patterns disagree on a parameter value
    #[serde(default)]
    pub strict_params: bool,
}

fn default_phase() -> i32 {
    DEFAULT_PHASE
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            default_phase: default_phase(),
            strict_params: false,
        }
    }
}

/// Deadlines for request-bound contexts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsSection {
    /// Deadline when no matched action declares a timeout
    #[serde(default = "default_timeout_ms")]
    pub default_ms: u64,
    /// Deadline applied by `bump()`
    #[serde(default = "default_rolling_window_ms")]
    pub rolling_window_ms: u64,
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_rolling_window_ms() -> u64 {
    30_000
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            default_ms: default_timeout_ms(),
            rolling_window_ms: default_rolling_window_ms(),
        }
    }
}

impl TimeoutsSection {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_ms)
    }

    pub fn rolling_window(&self) -> Duration {
        Duration::from_millis(self.rolling_window_ms)
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1:3000".to_string()
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

/// Log output settings. `RUST_LOG` takes precedence over `level`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormat::default(),
        }
    }
}

/// The complete conductor.toml configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConductorConfig {
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub timeouts: TimeoutsSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub logging: LoggingSection,
    /// Declarative actions registered at startup
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<ManifestAction>,
}

impl ConductorConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse conductor.toml")
    }

    /// Load `conductor.toml` from `dir`, or defaults if there is none.
    pub fn load_or_default(dir: &Path) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = self.to_toml()?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize conductor.toml")
    }

    /// Apply environment overrides on top of the file settings.
    pub fn with_env(mut self) -> Self {
        if let Ok(bind) = std::env::var(BIND_ENV)
            && !bind.is_empty()
        {
            self.server.bind = bind;
        }
        if let Ok(level) = std::env::var(LOG_ENV)
            && !level.is_empty()
        {
            self.logging.level = level;
        }
        self
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.timeouts.default_ms == 0 {
            warnings.push("timeouts.default_ms is 0: every request will time out immediately".to_string());
        }
        if self.timeouts.rolling_window_ms == 0 {
            warnings.push("timeouts.rolling_window_ms is 0: bump() will expire immediately".to_string());
        }
        if self.server.bind.parse::<SocketAddr>().is_err() {
            warnings.push(format!(
                "Invalid server.bind '{}': expected host:port (e.g., '127.0.0.1:3000')",
                self.server.bind
            ));
        }

        let mut seen = HashSet::new();
        let declared: HashSet<ActionId> = self
            .actions
            .iter()
            .map(|a| ActionId::new(a.module.as_str(), a.name.as_str()))
            .collect();

        for action in &self.actions {
            let id = ActionId::new(action.module.as_str(), action.name.as_str());
            if let Err(e) = id.validate() {
                warnings.push(format!("Invalid action '{}': {}", id, e));
                continue;
            }
            if !seen.insert(id.clone()) {
                warnings.push(format!("Action '{}' is declared more than once", id));
            }
            if action.timeout_ms == Some(0) {
                warnings.push(format!("Action '{}' has timeout_ms = 0", id));
            }
            for dep in &action.depends_on {
                match dep.parse::<ActionId>() {
                    Ok(dep_id) if !declared.contains(&dep_id) => warnings.push(format!(
                        "Action '{}' depends on '{}', which is not declared in this file",
                        id, dep
                    )),
                    Ok(_) => {}
                    Err(e) => warnings.push(format!(
                        "Action '{}' has an invalid dependency '{}': {}",
                        id, dep, e
                    )),
                }
            }
        }

        warnings
    }
}
