use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use std::path::{Path, PathBuf};
use std::time::Duration;

/// In-flight images untouched for this long are failed by the janitor
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_JANITOR_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_PROGRESS_TTL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_MAX_POLLS: u32 = 45;
pub const DEFAULT_MONITOR_TIMEOUT: Duration = Duration::from_secs(12 * 60);
pub const DEFAULT_NETWORK_RETRIES: u32 = 5;
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(2);
pub const DEFAULT_MAX_SUBMISSIONS: usize = 8;
pub const DEFAULT_HINT_RADIUS_DEG: f64 = 5.0;

const ENV_API_KEY: &str = "ASTROMETRY_API_KEY";
const ENV_LOCAL_URL: &str = "LOCAL_ASTROMETRY_URL";
const ENV_LOCAL_API_KEY: &str = "LOCAL_ASTROMETRY_API_KEY";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// nova.astrometry.net
    #[default]
    Nova,
    /// A self-hosted astrometry.net server
    Local,
    /// ASTAP command line solver on this machine
    Astap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: PathBuf,
    pub log_level: String,
    /// Daily rolling log files are written here when set
    pub log_dir: Option<PathBuf>,

    pub provider: ProviderKind,
    pub astrometry_api_key: Option<String>,
    pub local_astrometry_url: Option<String>,
    pub local_astrometry_api_key: Option<String>,
    /// Custom `astap_cli` location
    pub astap_cli: Option<PathBuf>,

    pub max_concurrent_submissions: usize,
    #[serde(with = "seconds")]
    pub poll_interval: Duration,
    pub max_polls: u32,
    #[serde(with = "seconds")]
    pub monitor_timeout: Duration,
    pub network_retries: u32,
    #[serde(with = "seconds")]
    pub retry_backoff: Duration,

    #[serde(with = "seconds")]
    pub janitor_interval: Duration,
    #[serde(with = "seconds")]
    pub stale_after: Duration,
    #[serde(with = "seconds")]
    pub progress_ttl: Duration,

    /// Catalog search radius for images without a field radius, degrees
    pub search_radius: f64,
    /// Position hint radius for images without a field radius, degrees
    pub hint_radius: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: PathBuf::from("astrocat.db"),
            log_level: "info".to_string(),
            log_dir: None,
            provider: ProviderKind::default(),
            astrometry_api_key: None,
            local_astrometry_url: None,
            local_astrometry_api_key: None,
            astap_cli: None,
            max_concurrent_submissions: DEFAULT_MAX_SUBMISSIONS,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_polls: DEFAULT_MAX_POLLS,
            monitor_timeout: DEFAULT_MONITOR_TIMEOUT,
            network_retries: DEFAULT_NETWORK_RETRIES,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            janitor_interval: DEFAULT_JANITOR_INTERVAL,
            stale_after: DEFAULT_STALE_AFTER,
            progress_ttl: DEFAULT_PROGRESS_TTL,
            search_radius: crate::matcher::DEFAULT_SEARCH_RADIUS_DEG,
            hint_radius: DEFAULT_HINT_RADIUS_DEG,
        }
    }
}

impl Config {
    /// Read the YAML file if given, then apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let yaml = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_yaml(&yaml)?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yml::from_str(yaml)?)
    }

    /// Secrets come from the environment when set
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        let non_empty = |key| var(key).filter(|v: &String| !v.trim().is_empty());
        if let Some(key) = non_empty(ENV_API_KEY) {
            self.astrometry_api_key = Some(key);
        }
        if let Some(url) = non_empty(ENV_LOCAL_URL) {
            self.local_astrometry_url = Some(url);
        }
        if let Some(key) = non_empty(ENV_LOCAL_API_KEY) {
            self.local_astrometry_api_key = Some(key);
        }
    }

    /// Check the selected provider has what it needs. An incomplete local
    /// setup falls back to nova when a nova key is available.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.max_concurrent_submissions == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_submissions must be at least 1".into(),
            ));
        }
        if self.max_polls == 0 {
            return Err(ConfigError::Invalid("max_polls must be at least 1".into()));
        }
        if !(self.search_radius > 0.0 && self.hint_radius > 0.0) {
            return Err(ConfigError::Invalid("search radii must be positive".into()));
        }
        // Monitors refresh their images once per poll
        if self.stale_after <= self.poll_interval {
            return Err(ConfigError::Invalid(
                "stale_after must be longer than poll_interval".into(),
            ));
        }

        if self.provider == ProviderKind::Local
            && (is_blank(&self.local_astrometry_url) || is_blank(&self.local_astrometry_api_key))
        {
            warn!("Local astrometry config missing, falling back to nova");
            self.provider = ProviderKind::Nova;
        }
        if self.provider == ProviderKind::Nova && is_blank(&self.astrometry_api_key) {
            return Err(ConfigError::MissingApiKey(ENV_API_KEY));
        }
        Ok(())
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}

/// Durations as (fractional) seconds
mod seconds {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Yaml(#[from] serde_yml::Error),
    #[error("{0} not set")]
    MissingApiKey(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
