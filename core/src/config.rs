use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ImageError, Result};
use crate::platform::PlatformSpec;

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root directory of the local image store
    pub store_root: PathBuf,

    /// Log level
    pub log_level: LogLevel,

    /// Platform choice applied when a pull does not request one
    pub platform: PlatformSpec,

    /// Retry behaviour for registry copies
    pub retry: RetryConfig,

    /// Short-name resolution
    pub registries: RegistriesConfig,

    /// Event channel
    pub events: EventsConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store_root: imgflow_home().join("storage"),
            log_level: LogLevel::Info,
            platform: PlatformSpec::default(),
            retry: RetryConfig::default(),
            registries: RegistriesConfig::default(),
            events: EventsConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Default config file location (`~/.imgflow/config.yaml`).
    pub fn default_path() -> PathBuf {
        imgflow_home().join("config.yaml")
    }

    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            ImageError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config: EngineConfig = serde_yaml::from_str(&data)
            .map_err(|e| ImageError::Config(format!("failed to parse {}: {}", path.display(), e)))?;
        config.retry.delay()?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retries after a failed copy
    pub max_retries: u32,

    /// Delay between retries (e.g. "500ms", "2s", "1m"). Empty means no delay.
    pub retry_delay: String,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: String::new(),
        }
    }
}

impl RetryConfig {
    /// Parsed retry delay, `None` when unset.
    pub fn delay(&self) -> Result<Option<Duration>> {
        if self.retry_delay.trim().is_empty() {
            return Ok(None);
        }
        parse_duration(&self.retry_delay)
            .map(Some)
            .map_err(|e| ImageError::Config(format!("failed to parse retry_delay: {}", e)))
    }
}

/// Short-name resolution configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistriesConfig {
    /// Registries tried in order for names without a registry
    pub unqualified_search_registries: Vec<String>,

    /// Short name → fully-qualified repository
    pub aliases: BTreeMap<String, String>,

    /// File recording aliases of successfully pulled short names
    pub alias_cache: Option<PathBuf>,
}

/// Event channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Broadcast channel capacity; 0 disables events
    pub capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self { capacity: 64 }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(format!("unknown log level: '{}' (supported: debug, info, warn, error)", s)),
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Debug => write!(f, "debug"),
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// `~/.imgflow`, or `./.imgflow` when no home directory is known.
pub fn imgflow_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".imgflow")
}

/// Parse a human-readable duration string (e.g., "500ms", "2s", "1m", "1h").
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim().to_lowercase();
    let (num, unit_ms) = if let Some(n) = s.strip_suffix("ms") {
        (n, 1u64)
    } else if let Some(n) = s.strip_suffix('s') {
        (n, 1000u64)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, 60 * 1000u64)
    } else if let Some(n) = s.strip_suffix('h') {
        (n, 60 * 60 * 1000u64)
    } else {
        return Err(format!("missing unit in duration: {s}"));
    };
    let n: u64 = num.trim().parse().map_err(|_| format!("invalid number: {num}"))?;
    Ok(Duration::from_millis(n * unit_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration(" 1h ").unwrap(), Duration::from_secs(3600));
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("xs").is_err());
    }

    #[test]
    fn test_retry_delay_unset() {
        let retry = RetryConfig::default();
        assert_eq!(retry.max_retries, 3);
        assert!(retry.delay().unwrap().is_none());
    }

    #[test]
    fn test_load_partial_yaml() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.yaml");
        std::fs::write(
            &path,
            r#"
log_level: debug
retry:
  max_retries: 5
  retry_delay: 250ms
registries:
  unqualified_search_registries: [quay.io, docker.io]
  aliases:
    fedora: registry.fedoraproject.org/fedora
"#,
        )
        .unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.delay().unwrap(), Some(Duration::from_millis(250)));
        assert_eq!(
            config.registries.unqualified_search_registries,
            vec!["quay.io".to_string(), "docker.io".to_string()]
        );
        assert_eq!(
            config.registries.aliases.get("fedora").map(String::as_str),
            Some("registry.fedoraproject.org/fedora")
        );
        assert_eq!(config.events.capacity, 64);
        assert!(config.platform.is_empty());
    }

    #[test]
    fn test_load_rejects_bad_delay() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.yaml");
        std::fs::write(&path, "retry:\n  retry_delay: soon\n").unwrap();
        assert!(matches!(EngineConfig::load(&path), Err(ImageError::Config(_))));
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let tmp = TempDir::new().unwrap();
        let config = EngineConfig::load_or_default(&tmp.path().join("nope.yaml")).unwrap();
        assert_eq!(config.log_level, LogLevel::Info);
    }

    #[test]
    fn test_log_level_from_str() {
        assert_eq!("WARN".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!("loud".parse::<LogLevel>().is_err());
        assert_eq!(tracing::Level::from(LogLevel::Debug), tracing::Level::DEBUG);
    }
}
