//! Configuration discovery and loading
//!
//! This module handles the configuration discovery hierarchy:
//! 1. Explicit path (`--config`)
//! 2. Current directory: ./node-agent.toml or ./.node-agent/config.toml
//! 3. User config: ~/.node-agent/config.toml
//! 4. System config: /etc/node-agent/config.toml
//! 5. Built-in defaults

use crate::agent::{AgentConfig, ConfigError};
use crate::env;
use std::env as std_env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Configuration discovery system
pub struct ConfigDiscovery;

impl ConfigDiscovery {
    /// Load the explicit file when given, otherwise walk the discovery
    /// hierarchy.
    pub fn load(config_override: Option<&Path>) -> Result<AgentConfig, ConfigError> {
        match config_override {
            Some(path) => {
                info!("Loading configuration override from: {:?}", path);
                AgentConfig::from_toml_file(path)
            }
            None => Self::discover_config(),
        }
    }

    /// Discover and load configuration using the hierarchy
    pub fn discover_config() -> Result<AgentConfig, ConfigError> {
        if let Some(config_path) = Self::find_config_file() {
            info!("Loading configuration from: {:?}", config_path);
            return AgentConfig::from_toml_file(config_path);
        }

        info!("No configuration file found, using defaults");
        Ok(AgentConfig::default())
    }

    /// Find configuration file using discovery hierarchy
    pub fn find_config_file() -> Option<PathBuf> {
        Self::find_in(&Self::get_config_candidates())
    }

    fn find_in(candidates: &[PathBuf]) -> Option<PathBuf> {
        for candidate in candidates {
            debug!("Checking for config file: {:?}", candidate);
            if candidate.is_file() {
                debug!("Found config file: {:?}", candidate);
                return Some(candidate.clone());
            }
        }

        debug!("No config file found in discovery hierarchy");
        None
    }

    /// Configuration file candidates in priority order
    fn get_config_candidates() -> Vec<PathBuf> {
        let mut candidates = Vec::new();

        if let Ok(current_dir) = std_env::current_dir() {
            candidates.push(current_dir.join(env::LOCAL_CONFIG_FILE_NAME));
            candidates.push(env::local_config_file_path(&current_dir));
        }

        if let Some(home_dir) = Self::get_home_dir() {
            candidates.push(env::user_config_file_path(&home_dir));
        }

        #[cfg(unix)]
        candidates.push(PathBuf::from(env::SYSTEM_CONFIG_FILE));

        candidates
    }

    fn get_home_dir() -> Option<PathBuf> {
        std_env::var("HOME")
            .ok()
            .or_else(|| std_env::var("USERPROFILE").ok())
            .map(PathBuf::from)
    }

    /// Create a default config file in the user's home directory
    pub fn create_default_user_config() -> Result<PathBuf, ConfigError> {
        let home_dir = Self::get_home_dir().ok_or(ConfigError::NoHomeDir)?;

        let config_dir = env::agent_dir_path(&home_dir);
        let config_path = env::user_config_file_path(&home_dir);

        if !config_dir.exists() {
            fs::create_dir_all(&config_dir).map_err(|source| ConfigError::Write {
                path: config_dir.clone(),
                source,
            })?;
            info!("Created configuration directory: {:?}", config_dir);
        }

        if !config_path.exists() {
            AgentConfig::default().to_toml_file(&config_path)?;
            info!("Created default configuration file: {:?}", config_path);
        } else {
            warn!("Configuration file already exists: {:?}", config_path);
        }

        Ok(config_path)
    }

    /// Show configuration discovery information for debugging
    pub fn show_discovery_info() {
        println!("Configuration Discovery Hierarchy:");
        println!();

        let candidates = Self::get_config_candidates();
        for (i, candidate) in candidates.iter().enumerate() {
            let status = if candidate.exists() {
                if candidate.is_file() {
                    "EXISTS"
                } else {
                    "NOT A FILE"
                }
            } else {
                "NOT FOUND"
            };

            println!("  {}. {:?} - {}", i + 1, candidate, status);
        }

        println!();
        match Self::find_in(&candidates) {
            Some(found) => println!("Active configuration: {:?}", found),
            None => println!("Active configuration: Built-in defaults"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_config_file_operations() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("node-agent.toml");

        let mut original = AgentConfig::default();
        original.engine.cleanup_wait_secs = 42;
        original.to_toml_file(&config_path).unwrap();
        assert!(config_path.exists());

        let loaded = ConfigDiscovery::load(Some(config_path.as_path())).unwrap();
        assert_eq!(loaded, original);
    }

    #[test]
    #[serial]
    fn test_config_candidates_order() {
        let candidates = ConfigDiscovery::get_config_candidates();
        assert!(!candidates.is_empty());
        assert_eq!(
            candidates[0].file_name().unwrap(),
            env::LOCAL_CONFIG_FILE_NAME
        );
        #[cfg(unix)]
        assert_eq!(
            candidates.last().unwrap(),
            &PathBuf::from(env::SYSTEM_CONFIG_FILE)
        );
    }

    #[test]
    fn test_find_in_picks_first_existing_file() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("missing.toml");
        let directory = temp_dir.path().join("dir.toml");
        fs::create_dir(&directory).unwrap();
        let second = temp_dir.path().join("second.toml");
        let third = temp_dir.path().join("third.toml");
        fs::write(&second, "").unwrap();
        fs::write(&third, "").unwrap();

        let found = ConfigDiscovery::find_in(&[missing, directory, second.clone(), third]);
        assert_eq!(found, Some(second));
    }

    #[test]
    #[serial]
    fn test_create_default_user_config() {
        let temp_home = TempDir::new().unwrap();
        let previous = std_env::var_os("HOME");
        // SAFETY: serialized with every other test touching the environment
        unsafe { std_env::set_var("HOME", temp_home.path()) };

        let path = ConfigDiscovery::create_default_user_config().unwrap();
        assert_eq!(path, env::user_config_file_path(temp_home.path()));
        let loaded = AgentConfig::from_toml_file(&path).unwrap();
        assert_eq!(loaded, AgentConfig::default());

        // A second call leaves the existing file alone
        assert_eq!(ConfigDiscovery::create_default_user_config().unwrap(), path);

        match previous {
            // SAFETY: as above
            Some(home) => unsafe { std_env::set_var("HOME", home) },
            None => unsafe { std_env::remove_var("HOME") },
        }
    }
}
