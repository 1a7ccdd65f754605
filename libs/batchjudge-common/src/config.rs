// Settings for the judge client, batching, polling and orchestration
use crate::types::{Credential, PlatformCeilings};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "config/batchjudge.json";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid value for {name}: {value}")]
    InvalidEnv { name: &'static str, value: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JudgeSettings {
    pub base_url: String,
    /// Judge0 language id of the harness language (54 = C++ GCC 9.2.0)
    pub language_id: u32,
    pub auth_header: String,
    /// Sent alongside the key when the judge sits behind a gateway (RapidAPI)
    pub host_header: Option<(String, String)>,
    pub request_timeout_ms: u64,
}

impl Default for JudgeSettings {
    fn default() -> Self {
        Self {
            base_url: "https://judge0-ce.p.rapidapi.com".to_string(),
            language_id: 54,
            auth_header: "X-RapidAPI-Key".to_string(),
            host_header: Some((
                "X-RapidAPI-Host".to_string(),
                "judge0-ce.p.rapidapi.com".to_string(),
            )),
            request_timeout_ms: 15_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingSettings {
    /// Fraction of the CPU ceiling a batch may plan to use
    pub safety_margin: f64,
    pub per_case_time_budget_ms: u64,
    pub memory_limit_kb: u64,
}

impl Default for BatchingSettings {
    fn default() -> Self {
        Self {
            safety_margin: 0.8,
            per_case_time_budget_ms: 1_000,
            memory_limit_kb: 256_000,
        }
    }
}

impl BatchingSettings {
    pub fn per_case_time_budget(&self) -> Duration {
        Duration::from_millis(self.per_case_time_budget_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingSettings {
    pub interval_ms: u64,
    /// Added to a batch's estimated budget to bound the whole poll loop
    pub overhead_margin_ms: u64,
    pub max_poll_errors: u32,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            interval_ms: 2_000,
            overhead_margin_ms: 10_000,
            max_poll_errors: 3,
        }
    }
}

impl PollingSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn overhead_margin(&self) -> Duration {
        Duration::from_millis(self.overhead_margin_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestrationSettings {
    /// Retry budget shared by every batch of one call; defaults to the pool size
    pub max_retries: Option<usize>,
    /// Defaults to the number of currently active credentials
    pub max_parallel_batches: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub judge: JudgeSettings,
    pub batching: BatchingSettings,
    pub polling: PollingSettings,
    /// Explicit ceilings skip the one-time `/config_info` discovery
    pub ceilings: Option<PlatformCeilings>,
    pub orchestration: OrchestrationSettings,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Missing file falls back to defaults; a malformed file is still an error
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn apply_env_overrides(mut self) -> Result<Self, ConfigError> {
        if let Ok(url) = std::env::var("BATCHJUDGE_BASE_URL") {
            self.judge.base_url = url;
        }
        if let Ok(value) = std::env::var("BATCHJUDGE_LANGUAGE_ID") {
            self.judge.language_id = value.parse().map_err(|_| ConfigError::InvalidEnv {
                name: "BATCHJUDGE_LANGUAGE_ID",
                value: value.clone(),
            })?;
        }
        if let Ok(value) = std::env::var("BATCHJUDGE_POLL_INTERVAL_MS") {
            self.polling.interval_ms = value.parse().map_err(|_| ConfigError::InvalidEnv {
                name: "BATCHJUDGE_POLL_INTERVAL_MS",
                value: value.clone(),
            })?;
        }
        Ok(self)
    }
}

/// Load the credential list a pool is seeded from
pub fn load_credentials(path: &Path) -> Result<Vec<Credential>, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}

/// Persist the key file: usage counts, statuses and reset times carry over
/// to the next run. Written to a sibling file first, then renamed over the
/// original.
pub fn save_credentials(path: &Path, credentials: &[Credential]) -> Result<(), ConfigError> {
    let write_err = |source| ConfigError::Write {
        path: path.display().to_string(),
        source,
    };
    let content = serde_json::to_string_pretty(credentials).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })?;

    let staging = path.with_extension("json.tmp");
    fs::write(&staging, content + "\n").map_err(write_err)?;
    fs::rename(&staging, path).map_err(write_err)
}
