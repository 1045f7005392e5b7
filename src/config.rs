//! Configuration loading and discovery
//!
//! Lookup order:
//! 1. Current directory: `./taskgroup.toml` or `./.taskgroup/config.toml`
//! 2. User config: `~/.taskgroup/config.toml`
//! 3. Built-in defaults

use crate::env;
use crate::env::threads::PUMP_THREAD_PREFIX;
use serde::{Deserialize, Serialize};
use std::env as std_env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Errors raised while loading or validating configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to access config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Scheduling settings of a task group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupConfig {
    /// Concurrency limit; `0` means unbounded
    pub max_running_tasks: i64,
    /// Prefix of the pump thread name
    pub pump_thread_name: String,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            max_running_tasks: 4,
            pump_thread_name: PUMP_THREAD_PREFIX.to_string(),
        }
    }
}

impl GroupConfig {
    /// Check the settings and return the concurrency limit
    pub fn validate(&self) -> Result<usize, ConfigError> {
        if self.pump_thread_name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "pump_thread_name must not be empty".to_string(),
            ));
        }
        usize::try_from(self.max_running_tasks).map_err(|_| {
            ConfigError::Invalid(format!(
                "max_running_tasks must not be negative: {}",
                self.max_running_tasks
            ))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing-subscriber` filter directive, overridden by `RUST_LOG`
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: env::DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

/// Parameters of the simulated transfers run by the demo binary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub tasks: usize,
    pub steps: u32,
    pub step_ms: u64,
    /// Probability in `0.0..=1.0` that a transfer fails midway
    pub failure_rate: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            tasks: 8,
            steps: 10,
            step_ms: 50,
            failure_rate: 0.0,
        }
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.failure_rate) {
            return Err(ConfigError::Invalid(format!(
                "failure_rate must lie in 0.0..=1.0: {}",
                self.failure_rate
            )));
        }
        if self.steps == 0 {
            return Err(ConfigError::Invalid("steps must be positive".to_string()));
        }
        Ok(())
    }
}

/// Complete application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub group: GroupConfig,
    pub logging: LoggingConfig,
    pub simulation: SimulationConfig,
}

impl AppConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load from TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Save to TOML file
    pub fn to_toml_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = self.to_toml_string()?;
        fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.group.validate()?;
        self.simulation.validate()
    }
}

/// Configuration discovery
pub struct ConfigDiscovery;

impl ConfigDiscovery {
    /// Load the first configuration file found, or the defaults
    pub fn discover_config() -> Result<AppConfig, ConfigError> {
        if let Some(config_path) = Self::find_config_file() {
            info!("Loading configuration from: {:?}", config_path);
            return AppConfig::from_toml_file(config_path);
        }

        info!("No configuration file found, using defaults");
        Ok(AppConfig::default())
    }

    pub fn find_config_file() -> Option<PathBuf> {
        Self::find_in(&Self::config_candidates())
    }

    fn find_in(candidates: &[PathBuf]) -> Option<PathBuf> {
        for candidate in candidates {
            debug!("Checking for config file: {:?}", candidate);
            if candidate.is_file() {
                return Some(candidate.clone());
            }
        }
        None
    }

    /// Configuration file candidates in priority order
    pub fn config_candidates() -> Vec<PathBuf> {
        let current_dir = std_env::current_dir().ok();
        Self::candidates_for(current_dir.as_deref(), Self::home_dir().as_deref())
    }

    fn candidates_for(current_dir: Option<&Path>, home_dir: Option<&Path>) -> Vec<PathBuf> {
        let mut candidates = Vec::new();
        if let Some(dir) = current_dir {
            candidates.push(dir.join(env::LOCAL_CONFIG_FILE_NAME));
            candidates.push(env::local_config_file_path(dir));
        }
        if let Some(home) = home_dir {
            candidates.push(env::user_config_file_path(home));
        }
        candidates
    }

    fn home_dir() -> Option<PathBuf> {
        std_env::var("HOME")
            .ok()
            .or_else(|| std_env::var("USERPROFILE").ok())
            .map(PathBuf::from)
    }

    /// Show configuration discovery information
    pub fn show_discovery_info() {
        println!("Configuration Discovery Hierarchy:");
        println!();

        for (i, candidate) in Self::config_candidates().iter().enumerate() {
            let status = if candidate.is_file() {
                "EXISTS"
            } else if candidate.exists() {
                "NOT A FILE"
            } else {
                "NOT FOUND"
            };
            println!("  {}. {:?} - {}", i + 1, candidate, status);
        }

        println!();
        match Self::find_config_file() {
            Some(found) => println!("Active configuration: {:?}", found),
            None => println!("Active configuration: Built-in defaults"),
        }
    }

    /// Write the default configuration to `~/.taskgroup/config.toml` unless
    /// a file already exists there
    pub fn create_default_user_config() -> Result<PathBuf, ConfigError> {
        let home_dir = Self::home_dir()
            .ok_or_else(|| ConfigError::Invalid("Could not determine home directory".into()))?;
        Self::create_default_config_in(&home_dir)
    }

    fn create_default_config_in(home_dir: &Path) -> Result<PathBuf, ConfigError> {
        let config_dir = env::user_config_dir_path(home_dir);
        let config_path = env::user_config_file_path(home_dir);

        fs::create_dir_all(&config_dir).map_err(|source| ConfigError::Io {
            path: config_dir.clone(),
            source,
        })?;
        if config_path.exists() {
            warn!("Configuration file already exists: {:?}", config_path);
        } else {
            AppConfig::default().to_toml_file(&config_path)?;
            info!("Created default configuration file: {:?}", config_path);
        }
        Ok(config_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config = AppConfig::from_toml_str(
            r#"
            [group]
            max_running_tasks = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.group.max_running_tasks, 2);
        assert_eq!(config.group.pump_thread_name, PUMP_THREAD_PREFIX);
        assert_eq!(config.logging, LoggingConfig::default());
        assert_eq!(config.simulation, SimulationConfig::default());
    }

    #[test]
    fn test_group_validation() {
        let mut group = GroupConfig::default();
        assert_eq!(group.validate().unwrap(), 4);

        group.max_running_tasks = 0;
        assert_eq!(group.validate().unwrap(), 0);

        group.max_running_tasks = -1;
        assert!(matches!(group.validate(), Err(ConfigError::Invalid(_))));

        group.max_running_tasks = 1;
        group.pump_thread_name = "  ".to_string();
        assert!(group.validate().is_err());
    }

    #[test]
    fn test_simulation_validation() {
        let mut simulation = SimulationConfig::default();
        assert!(simulation.validate().is_ok());
        simulation.failure_rate = 1.5;
        assert!(simulation.validate().is_err());
    }

    #[test]
    fn test_candidates_order() {
        let cwd = TempDir::new().unwrap();
        let home = TempDir::new().unwrap();
        let candidates = ConfigDiscovery::candidates_for(Some(cwd.path()), Some(home.path()));

        assert_eq!(
            candidates,
            vec![
                cwd.path().join("taskgroup.toml"),
                cwd.path().join(".taskgroup").join("config.toml"),
                home.path().join(".taskgroup").join("config.toml"),
            ]
        );
    }

    #[test]
    fn test_first_existing_candidate_wins() {
        let cwd = TempDir::new().unwrap();
        let home = TempDir::new().unwrap();
        let candidates = ConfigDiscovery::candidates_for(Some(cwd.path()), Some(home.path()));
        assert_eq!(ConfigDiscovery::find_in(&candidates), None);

        let user = env::user_config_file_path(home.path());
        fs::create_dir_all(user.parent().unwrap()).unwrap();
        AppConfig::default().to_toml_file(&user).unwrap();
        assert_eq!(ConfigDiscovery::find_in(&candidates), Some(user));

        let local = cwd.path().join(env::LOCAL_CONFIG_FILE_NAME);
        AppConfig::default().to_toml_file(&local).unwrap();
        assert_eq!(ConfigDiscovery::find_in(&candidates), Some(local));
    }

    #[test]
    fn test_missing_file_reports_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("absent.toml");
        match AppConfig::from_toml_file(&path) {
            Err(ConfigError::Io { path: reported, .. }) => assert_eq!(reported, path),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_default_user_config_is_created_once() {
        let home = TempDir::new().unwrap();
        let path = ConfigDiscovery::create_default_config_in(home.path()).unwrap();
        assert_eq!(path, env::user_config_file_path(home.path()));
        assert_eq!(AppConfig::from_toml_file(&path).unwrap(), AppConfig::default());

        // An existing file is left alone
        fs::write(&path, "[group]\nmax_running_tasks = 9\n").unwrap();
        ConfigDiscovery::create_default_config_in(home.path()).unwrap();
        assert_eq!(AppConfig::from_toml_file(&path).unwrap().group.max_running_tasks, 9);
    }
}
