use anyhow::Context;
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Engine and checker tunables.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub check: CheckConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Clusters claimed per grouped allocation. `None` means one 64 KiB
    /// worth of clusters.
    #[serde(default)]
    pub group_size: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckConfig {
    /// Deepest directory level the checker descends into.
    #[serde(default = "default_max_nesting")]
    pub max_nesting: u32,
    /// Largest in-memory mark map, in bytes.
    #[serde(default = "default_memory_budget")]
    pub memory_budget: usize,
    #[serde(default)]
    pub verbosity: Verbosity,
}

fn default_max_nesting() -> u32 {
    32
}

fn default_memory_budget() -> usize {
    16 * 1024 * 1024
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            max_nesting: default_max_nesting(),
            memory_budget: default_memory_budget(),
            verbosity: Verbosity::default(),
        }
    }
}

/// How much the checker reports beyond its findings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    Quiet,
    #[default]
    Normal,
    Verbose,
}

impl Config {
    /// Get the user-specific config directory
    pub fn user_config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("rusty-fat"))
    }

    pub fn user_config_path() -> Option<PathBuf> {
        Self::user_config_dir().map(|dir| dir.join("config.json"))
    }

    /// Load configuration from config.json, falling back to defaults.
    pub fn load() -> Self {
        if let Some(user_config) = Self::user_config_path() {
            if let Ok(config) = Self::load_from_path(&user_config) {
                debug!("config loaded from {}", user_config.display());
                return config;
            }
        }

        if let Ok(config) = Self::load_from_path(Path::new("config.json")) {
            debug!("config loaded from ./config.json");
            return config;
        }

        Self::default()
    }

    pub fn load_from_path(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("invalid config {}", path.display()))?;
        Ok(config)
    }
}
