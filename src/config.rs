//! Bridge-Konfiguration
//!
//! Wird aus `config.json` im Config-Verzeichnis der Plattform geladen und
//! danach von Umgebungsvariablen überschrieben. Jedes Feld hat einen
//! Default, eine leere Datei ist also gültig.

use crate::call::MediaType;
use crate::codec::ArenaPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid value for {name}: {value}")]
    InvalidEnv { name: &'static str, value: String },
}

// ============================================================================
// CONSTANTS
// ============================================================================

pub const ENV_GREETING: &str = "CALL_BRIDGE_GREETING";
pub const ENV_LOG: &str = "CALL_BRIDGE_LOG";
pub const ENV_ARENA_LIMIT: &str = "CALL_BRIDGE_ARENA_LIMIT";

const CONFIG_FILE: &str = "config.json";

// ============================================================================
// CONFIG
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Identität, die der Engine bei `init` übergeben wird
    pub greeting: String,
    pub audio_input_device: u16,
    pub audio_output_device: u16,
    /// Media-Typ für eingehende Offers
    pub offer_media_type: MediaType,
    /// Alter eingehender Offers in Sekunden
    pub offer_age_secs: u64,
    pub bandwidth_mode: i32,
    /// 0 = keine Audio-Level-Reports
    pub audio_levels_interval_ms: i32,
    pub arena_limit_bytes: Option<usize>,
    pub arena_policy: ArenaPolicy,
    pub log_filter: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            greeting: "call-bridge".to_string(),
            audio_input_device: 0,
            audio_output_device: 0,
            offer_media_type: MediaType::Audio,
            offer_age_secs: 0,
            bandwidth_mode: 0,
            audio_levels_interval_ms: 0,
            arena_limit_bytes: None,
            arena_policy: ArenaPolicy::Release,
            log_filter: "call_bridge=info".to_string(),
        }
    }
}

impl BridgeConfig {
    /// Lädt die Config-Datei (falls vorhanden) und wendet Env-Overrides an
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match Self::config_path() {
            Some(path) if path.exists() => {
                tracing::info!("Loading config from {:?}", path);
                Self::from_file(&path)?
            }
            _ => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let json = fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Pfad zu `config.json` im Config-Verzeichnis der Plattform
    pub fn config_path() -> Option<PathBuf> {
        let proj_dirs = directories::ProjectDirs::from("org", "call-bridge", "call-bridge")?;
        Some(proj_dirs.config_dir().join(CONFIG_FILE))
    }

    /// Überschreibt Felder aus der Umgebung
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(greeting) = lookup(ENV_GREETING) {
            self.greeting = greeting;
        }
        if let Some(filter) = lookup(ENV_LOG) {
            self.log_filter = filter;
        }
        if let Some(limit) = lookup(ENV_ARENA_LIMIT) {
            let parsed = limit.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                name: ENV_ARENA_LIMIT,
                value: limit.clone(),
            })?;
            self.arena_limit_bytes = Some(parsed);
        }
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
