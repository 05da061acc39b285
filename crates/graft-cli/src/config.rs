//! Configuration file management for graft.
//!
//! Provides a TOML-based config file at `~/.config/graft/config.toml` and
//! a resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use graft_db::pool::DbConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    #[serde(default)]
    pub planner: Option<PlannerSection>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PlannerSection {
    /// Base URL of the planner oracle service.
    pub url: String,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the graft config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/graft` or `~/.config/graft`.
/// We intentionally ignore the platform-specific `dirs::config_dir()`
/// (which returns `~/Library/Application Support` on macOS).
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("graft");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("graft")
}

/// Return the path to the graft config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct GraftConfig {
    pub db_config: DbConfig,
    /// Base URL of the planner oracle, when one is configured.
    pub planner_url: Option<String>,
}

impl GraftConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config
    /// file > default.
    ///
    /// - DB URL: `cli_db_url` > `GRAFT_DATABASE_URL` > `config.database.url`
    ///   > `DbConfig::DEFAULT_URL`
    /// - Planner URL: `cli_planner_url` > `GRAFT_PLANNER_URL` >
    ///   `config.planner.url` > none (commands that need the oracle treat
    ///   its absence as a configuration error)
    pub fn resolve(cli_db_url: Option<&str>, cli_planner_url: Option<&str>) -> Result<Self> {
        let file_config = load_config().ok();

        let db_url = if let Some(url) = cli_db_url {
            url.to_string()
        } else if let Ok(url) = std::env::var("GRAFT_DATABASE_URL") {
            url
        } else if let Some(ref cfg) = file_config {
            cfg.database.url.clone()
        } else {
            DbConfig::DEFAULT_URL.to_string()
        };

        let planner_url = if let Some(url) = cli_planner_url {
            Some(url.to_string())
        } else if let Ok(url) = std::env::var("GRAFT_PLANNER_URL") {
            Some(url)
        } else {
            file_config
                .as_ref()
                .and_then(|cfg| cfg.planner.as_ref())
                .map(|planner| planner.url.clone())
        };

        Ok(Self {
            db_config: DbConfig::new(db_url),
            planner_url,
        })
    }

    /// The planner URL, or a configuration error naming every way to set
    /// one.
    pub fn require_planner_url(&self) -> Result<&str> {
        self.planner_url.as_deref().ok_or_else(|| {
            anyhow::anyhow!(
                "planner oracle URL not configured; set GRAFT_PLANNER_URL, pass --planner-url, \
                 or add [planner] url to the config file"
            )
        })
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
