//! CLI command implementations.
//!
//! | Module   | Commands handled  |
//! |----------|-------------------|
//! | `serve`  | `Serve`           |
//! | `plan`   | `Plan`, `Routes`  |
//! | `config` | `Config`          |

pub mod config;
pub mod plan;
pub mod serve;

pub use config::cmd_config;
pub use plan::{cmd_plan, cmd_routes};
pub use serve::cmd_serve;

use anyhow::Result;
use conductor::config::ConductorConfig;
use conductor::engine::{Engine, EngineSettings};
use conductor::{manifest, telemetry};
use std::path::{Path, PathBuf};

use super::Cli;

/// Where the configuration for this invocation lives.
pub fn config_path(project_dir: &Path, explicit: Option<&Path>) -> PathBuf {
    match explicit {
        Some(path) => path.to_path_buf(),
        None => project_dir.join(conductor::config::CONFIG_FILE),
    }
}

/// Load configuration (file → env → CLI) and initialize logging.
pub fn load_config(cli: &Cli, project_dir: &Path) -> Result<ConductorConfig> {
    let mut config = match cli.config.as_deref() {
        Some(path) => ConductorConfig::load(path)?,
        None => ConductorConfig::load_or_default(project_dir)?,
    }
    .with_env();

    if cli.verbose {
        config.logging.level = "debug".to_string();
    }
    telemetry::init(&config.logging);

    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }
    Ok(config)
}

/// An engine with every manifest action registered.
pub fn build_engine(config: &ConductorConfig) -> Engine {
    let engine = Engine::new(EngineSettings::from_config(config));
    manifest::register_all(&engine, &config.actions, config.engine.default_phase);
    engine
}
