//! Environment constants and path utilities for the node agent.
//!
//! This module centralizes the hardcoded paths, file names and runtime labels
//! used throughout the agent, making them easier to maintain and modify.

use std::path::{Path, PathBuf};

/// Agent directory name (hidden directory like .git, .vscode)
pub const AGENT_DIR_NAME: &str = ".node-agent";

/// Configuration file name inside the agent directory
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Configuration file name looked up in the working directory
pub const LOCAL_CONFIG_FILE_NAME: &str = "node-agent.toml";

/// System-wide configuration file (Unix-like systems)
pub const SYSTEM_CONFIG_FILE: &str = "/etc/node-agent/config.toml";

/// Default directory for persisted agent state
pub const DEFAULT_STATE_DIR: &str = "/var/lib/node-agent";

/// Checkpoint related names
pub mod checkpoint {
    /// Checkpoint file name within the state directory
    pub const FILE_NAME: &str = "engine-state.json";

    /// Suffix of the temporary file used for atomic writes
    pub const TEMP_SUFFIX: &str = ".tmp";

    /// Current checkpoint format version
    pub const FORMAT_VERSION: u32 = 1;
}

/// Labels and naming used for objects created in the container runtime
pub mod runtime {
    /// Prefix for container and volume names created by the agent
    pub const NAME_PREFIX: &str = "node-agent";

    /// Label carrying the owning task ARN
    pub const LABEL_TASK_ARN: &str = "node-agent.task-arn";

    /// Label carrying the container name from the task definition
    pub const LABEL_CONTAINER_NAME: &str = "node-agent.container-name";

    /// Label marking objects managed by the agent
    pub const LABEL_MANAGED: &str = "node-agent.managed";
}

/// Build the agent directory path from a base directory
pub fn agent_dir_path(base: &Path) -> PathBuf {
    base.join(AGENT_DIR_NAME)
}

/// Build the local config file path (`<dir>/.node-agent/config.toml`)
pub fn local_config_file_path(dir: &Path) -> PathBuf {
    agent_dir_path(dir).join(CONFIG_FILE_NAME)
}

/// Build the user config file path (`~/.node-agent/config.toml`)
pub fn user_config_file_path(home_dir: &Path) -> PathBuf {
    agent_dir_path(home_dir).join(CONFIG_FILE_NAME)
}

/// Build the checkpoint file path inside a state directory
pub fn checkpoint_file_path(state_dir: &Path) -> PathBuf {
    state_dir.join(checkpoint::FILE_NAME)
}

/// Build the temporary checkpoint path used during atomic writes
pub fn checkpoint_temp_file_path(state_dir: &Path) -> PathBuf {
    state_dir.join(format!(
        "{}{}",
        checkpoint::FILE_NAME,
        checkpoint::TEMP_SUFFIX
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_paths() {
        let base = Path::new("/home/agent");
        assert_eq!(
            local_config_file_path(base),
            PathBuf::from("/home/agent/.node-agent/config.toml")
        );
        assert_eq!(
            user_config_file_path(base),
            PathBuf::from("/home/agent/.node-agent/config.toml")
        );
    }

    #[test]
    fn test_checkpoint_paths() {
        let dir = Path::new("/var/lib/node-agent");
        assert_eq!(
            checkpoint_file_path(dir),
            PathBuf::from("/var/lib/node-agent/engine-state.json")
        );
        assert_eq!(
            checkpoint_temp_file_path(dir),
            PathBuf::from("/var/lib/node-agent/engine-state.json.tmp")
        );
    }
}
