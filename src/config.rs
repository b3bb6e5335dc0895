use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_API_URL: &str = "https://api.music.yandex.net";
const DEFAULT_DEVICE_NAME: &str = "tuneline";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{name} has an invalid value: {value}")]
    Invalid { name: &'static str, value: String },
    #[error("State file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("State file is malformed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("No config directory on this platform")]
    NoConfigDir,
}

/// Application configuration
/// In debug builds a .env file is loaded first; variables always come from
/// the environment.
#[derive(Clone, Debug)]
pub struct Config {
    pub token: Option<String>,
    pub api_url: String,
    /// Remote session endpoint; sync is off without one
    pub remote_url: Option<String>,
    pub device_id: String,
    pub device_name: String,
    /// Volume used when nothing has been persisted yet
    pub volume: f64,
    pub volume_step: f64,
    /// Jump made by the rewind keys
    pub rewind: Duration,
    /// Output buffering latency
    pub buffer: Duration,
    /// Longest a single network read may stall
    pub read_timeout: Duration,
    /// Bytes downloaded ahead before the background fetch rests
    pub prefetch_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            token: None,
            api_url: DEFAULT_API_URL.to_string(),
            remote_url: None,
            device_id: uuid::Uuid::new_v4().to_string(),
            device_name: DEFAULT_DEVICE_NAME.to_string(),
            volume: 0.5,
            volume_step: 0.05,
            rewind: Duration::from_secs(5),
            buffer: Duration::from_millis(300),
            read_timeout: Duration::from_secs(30),
            prefetch_bytes: crate::playback::streaming::DEFAULT_PREFETCH_WATERMARK,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        #[cfg(debug_assertions)]
        {
            if dotenvy::dotenv().is_ok() {
                println!("Config: Dev mode activated - loaded .env file");
            }
        }

        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable lookup; unset variables keep their defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Config::default();
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let config = Self {
            token: var("TUNELINE_TOKEN"),
            api_url: var("TUNELINE_API_URL").unwrap_or(defaults.api_url),
            remote_url: var("TUNELINE_REMOTE_URL"),
            device_id: var("TUNELINE_DEVICE_ID").unwrap_or(defaults.device_id),
            device_name: var("TUNELINE_DEVICE_NAME").unwrap_or(defaults.device_name),
            volume: parse(&var, "TUNELINE_VOLUME")?
                .unwrap_or(defaults.volume)
                .clamp(0.0, 1.0),
            volume_step: parse(&var, "TUNELINE_VOLUME_STEP")?.unwrap_or(defaults.volume_step),
            rewind: parse(&var, "TUNELINE_REWIND_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.rewind),
            buffer: parse(&var, "TUNELINE_BUFFER_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.buffer),
            read_timeout: parse(&var, "TUNELINE_READ_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.read_timeout),
            prefetch_bytes: parse(&var, "TUNELINE_PREFETCH_BYTES")?
                .unwrap_or(defaults.prefetch_bytes),
        };

        if config.token.is_none() {
            println!("Config: TUNELINE_TOKEN not set, catalog requests will be anonymous");
        }
        if config.remote_url.is_none() {
            println!("Config: TUNELINE_REMOTE_URL not set, remote sync disabled");
        }

        Ok(config)
    }
}

fn parse<T: FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError> {
    match var(name) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { name, value }),
        None => Ok(None),
    }
}

/// Where the last used volume survives between runs
pub trait VolumeStore: Send + Sync {
    fn load(&self) -> Result<Option<f64>, ConfigError>;
    fn save(&self, volume: f64) -> Result<(), ConfigError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedState {
    volume: Option<f64>,
}

/// Volume kept in a small JSON file
#[derive(Debug, Clone)]
pub struct JsonVolumeStore {
    path: PathBuf,
}

impl JsonVolumeStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// `<config dir>/tuneline/state.json`
    pub fn in_config_dir() -> Result<Self, ConfigError> {
        let dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        Ok(Self::new(dir.join("tuneline").join("state.json")))
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn read_state(&self) -> Result<PersistedState, ConfigError> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PersistedState::default()),
            Err(e) => Err(e.into()),
        }
    }
}

impl VolumeStore for JsonVolumeStore {
    fn load(&self) -> Result<Option<f64>, ConfigError> {
        Ok(self.read_state()?.volume.map(|v| v.clamp(0.0, 1.0)))
    }

    fn save(&self, volume: f64) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let state = PersistedState {
            volume: Some(volume),
        };
        std::fs::write(&self.path, serde_json::to_vec_pretty(&state)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults_when_nothing_is_set() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.api_url, DEFAULT_API_URL);
        assert!(config.remote_url.is_none());
        assert!(!config.device_id.is_empty());
        assert_eq!(config.rewind, Duration::from_secs(5));
    }

    #[test]
    fn test_values_are_read_and_clamped() {
        let config = Config::from_lookup(lookup(&[
            ("TUNELINE_TOKEN", "abc"),
            ("TUNELINE_REMOTE_URL", "wss://example.invalid/sync"),
            ("TUNELINE_DEVICE_ID", "dev-1"),
            ("TUNELINE_VOLUME", "1.5"),
            ("TUNELINE_READ_TIMEOUT_SECS", "7"),
            ("TUNELINE_PREFETCH_BYTES", "1024"),
        ]))
        .unwrap();

        assert_eq!(config.token.as_deref(), Some("abc"));
        assert_eq!(config.device_id, "dev-1");
        assert_eq!(config.volume, 1.0);
        assert_eq!(config.read_timeout, Duration::from_secs(7));
        assert_eq!(config.prefetch_bytes, 1024);
    }

    #[test]
    fn test_invalid_number_is_reported() {
        let err = Config::from_lookup(lookup(&[("TUNELINE_BUFFER_MS", "soon")])).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                name: "TUNELINE_BUFFER_MS",
                ..
            }
        ));
    }

    #[test]
    fn test_volume_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonVolumeStore::new(dir.path().join("nested").join("state.json"));
        assert_eq!(store.load().unwrap(), None);

        store.save(0.35).unwrap();
        assert_eq!(store.load().unwrap(), Some(0.35));
    }
}
