use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::{env, fs, path::PathBuf, time::Duration};
use thiserror::Error;
use tracing::{info, warn};

pub const MAX_STEPS_KEY: &str = "WAFLOW_MAX_STEPS";
pub const DEFAULT_DELAY_KEY: &str = "WAFLOW_DEFAULT_DELAY_MS";
pub const WEBHOOK_TIMEOUT_KEY: &str = "WAFLOW_WEBHOOK_TIMEOUT_SECS";
pub const HANDOFF_MESSAGE_KEY: &str = "WAFLOW_HANDOFF_MESSAGE";
pub const ROOT_KEY: &str = "WAFLOW_ROOT";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid value `{value}` for {key}: {reason}")]
    Invalid { key: String, value: String, reason: String },

    #[error("could not persist {key}: {reason}")]
    Persist { key: String, reason: String },
}

/// Key/value configuration source.
#[async_trait]
#[typetag::serde]
pub trait ConfigManagerType: Send + Sync {
    async fn keys(&self) -> Vec<String>;
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: &str) -> Result<(), ConfigError>;
    async fn del(&self, key: &str);
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn debug_box(&self) -> String;
}

#[derive(Serialize, Deserialize)]
pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl Clone for ConfigManager {
    fn clone(&self) -> Self {
        ConfigManager(self.0.clone_box())
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

impl ConfigManager {
    pub async fn get(&self, key: &str) -> Option<String> {
        self.0.get(key).await
    }

    /// Non-empty, trimmed value of `key`.
    async fn value(&self, key: &str) -> Option<String> {
        self.get(key)
            .await
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    async fn parse_u64(&self, key: &str) -> Result<Option<u64>, ConfigError> {
        match self.value(key).await {
            None => Ok(None),
            Some(raw) => raw.parse::<u64>().map(Some).map_err(|e| ConfigError::Invalid {
                key: key.to_string(),
                value: raw,
                reason: e.to_string(),
            }),
        }
    }
}

/// Reads the process environment after loading a `.env` file. Writes go
/// to both the environment and the file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvConfigManager {
    env_file: PathBuf,
}

impl EnvConfigManager {
    pub fn new(env_file: PathBuf) -> Box<Self> {
        if env_file.exists() {
            dotenvy::from_path(&env_file).ok();
            info!("Loaded .env from {}", env_file.display());
        } else {
            warn!("no .env at {}, using process environment only", env_file.display())
        }
        Box::new(Self { env_file })
    }

    fn rewrite_file(&self, key: &str, value: Option<&str>) -> std::io::Result<()> {
        let content = fs::read_to_string(&self.env_file).unwrap_or_default();
        let mut found = false;
        let mut lines: Vec<String> = Vec::new();

        for line in content.lines() {
            match line.split_once('=') {
                Some((k, _)) if k.trim() == key => {
                    found = true;
                    if let Some(v) = value {
                        lines.push(format!("{key}={v}"));
                    }
                }
                _ => lines.push(line.to_string()),
            }
        }
        if let (false, Some(v)) = (found, value) {
            lines.push(format!("{key}={v}"));
        }
        fs::write(&self.env_file, lines.join("\n"))
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn keys(&self) -> Vec<String> {
        env::vars().map(|(k, _)| k).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), ConfigError> {
        unsafe {
            env::set_var(key, value);
        };
        self.rewrite_file(key, Some(value)).map_err(|e| ConfigError::Persist {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    async fn del(&self, key: &str) {
        unsafe {
            env::remove_var(key);
        };
        if self.env_file.exists() {
            if let Err(e) = self.rewrite_file(key, None) {
                warn!("could not remove {} from {}: {}", key, self.env_file.display(), e);
            }
        }
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("EnvConfigManager({})", self.env_file.display())
    }
}

/// In-memory configuration, mostly for tests and the simulator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MapConfigManager {
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::new(Self::default())
    }

    pub fn with(pairs: &[(&str, &str)]) -> Box<Self> {
        let mgr = Self::default();
        for (k, v) in pairs {
            mgr.map.insert(k.to_string(), v.to_string());
        }
        Box::new(mgr)
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn keys(&self) -> Vec<String> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), ConfigError> {
        self.map.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn del(&self, key: &str) {
        self.map.remove(key);
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

/// Typed engine knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    /// Nodes a single walk may execute before the run is failed.
    pub max_steps_per_walk: usize,
    /// Used by delay nodes without a `delay`.
    pub default_delay: Duration,
    pub webhook_timeout: Option<Duration>,
    pub handoff_message: String,
    pub root: PathBuf,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_steps_per_walk: 1000,
            default_delay: Duration::from_millis(1000),
            webhook_timeout: None,
            handoff_message: "You are being transferred to one of our agents. Please wait.".to_string(),
            root: PathBuf::from("./waflow"),
        }
    }
}

impl EngineSettings {
    pub async fn from_config(config: &ConfigManager) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let max_steps_per_walk = match config.parse_u64(MAX_STEPS_KEY).await? {
            Some(0) => {
                return Err(ConfigError::Invalid {
                    key: MAX_STEPS_KEY.to_string(),
                    value: "0".to_string(),
                    reason: "must be at least 1".to_string(),
                });
            }
            Some(n) => n as usize,
            None => defaults.max_steps_per_walk,
        };

        Ok(Self {
            max_steps_per_walk,
            default_delay: config
                .parse_u64(DEFAULT_DELAY_KEY)
                .await?
                .map(Duration::from_millis)
                .unwrap_or(defaults.default_delay),
            webhook_timeout: config.parse_u64(WEBHOOK_TIMEOUT_KEY).await?.map(Duration::from_secs),
            handoff_message: config
                .value(HANDOFF_MESSAGE_KEY)
                .await
                .unwrap_or(defaults.handoff_message),
            root: config.value(ROOT_KEY).await.map(PathBuf::from).unwrap_or(defaults.root),
        })
    }
}
