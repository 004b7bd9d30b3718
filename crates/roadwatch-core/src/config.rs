//! ============================================================================
//! Engine Configuration
//! ============================================================================
//! Defaults, overridable from the environment (and a `.env` file):
//!
//!   ROADWATCH_DB_PATH         database file (default ~/.roadwatch/roadwatch.redb)
//!   ROADWATCH_LOGGING         capture records on successful lookups (default true)
//!   ROADWATCH_CLOUD_SYNC      mirror captured records right away (default false)
//!   ROADWATCH_CACHE_CAPACITY  cached road segments kept (default 500)
//!   ROADWATCH_RECORD_PREFIX   root folder of record paths (default Gemini_API_Data)
//! ============================================================================

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::warn;

use crate::cache::DEFAULT_CAPACITY;
use crate::gate::GateConfig;
use crate::records::DEFAULT_RECORD_PREFIX;

const DB_DIR: &str = ".roadwatch";
const DB_FILE: &str = "roadwatch.redb";

/// Default database location under the home directory
pub fn default_db_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DB_DIR)
        .join(DB_FILE)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub db_path: PathBuf,
    pub logging_enabled: bool,
    pub cloud_sync_enabled: bool,
    pub cache_capacity: usize,
    pub record_prefix: String,
    #[serde(default)]
    pub gate: GateConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            logging_enabled: true,
            cloud_sync_enabled: false,
            cache_capacity: DEFAULT_CAPACITY,
            record_prefix: DEFAULT_RECORD_PREFIX.to_string(),
            gate: GateConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `.env` and process environment variables
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                warn!("Could not load .env file: {}", e);
            }
        }
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = lookup("ROADWATCH_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }
        if let Some(raw) = lookup("ROADWATCH_LOGGING") {
            config.logging_enabled = parse_flag("ROADWATCH_LOGGING", &raw)?;
        }
        if let Some(raw) = lookup("ROADWATCH_CLOUD_SYNC") {
            config.cloud_sync_enabled = parse_flag("ROADWATCH_CLOUD_SYNC", &raw)?;
        }
        if let Some(raw) = lookup("ROADWATCH_CACHE_CAPACITY") {
            config.cache_capacity = raw
                .trim()
                .parse()
                .with_context(|| format!("ROADWATCH_CACHE_CAPACITY is not a number: {}", raw))?;
            if config.cache_capacity == 0 {
                anyhow::bail!("ROADWATCH_CACHE_CAPACITY must be at least 1");
            }
        }
        if let Some(prefix) = lookup("ROADWATCH_RECORD_PREFIX") {
            let prefix = prefix.trim_matches('/').to_string();
            if prefix.is_empty() {
                anyhow::bail!("ROADWATCH_RECORD_PREFIX must not be empty");
            }
            config.record_prefix = prefix;
        }

        Ok(config)
    }
}

fn parse_flag(name: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => anyhow::bail!("{} must be true or false, got '{}'", name, raw),
    }
}
