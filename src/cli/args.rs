//! Command line argument parsing
//!
//! Subcommands:
//! - `run`: Connect to the container runtime and serve the control plane
//! - `show-config`: Print the discovered configuration
//! - `checkpoint`: Summarize the saved checkpoint
//! - `validate`: Check a task payload file without touching the runtime

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, PartialEq)]
pub enum ExecutionMode {
    Run(RunConfig),
    ShowConfig { config_override: Option<PathBuf> },
    Checkpoint(CheckpointQuery),
    Validate(PathBuf),
}

#[derive(Debug, PartialEq)]
pub struct RunConfig {
    pub config_override: Option<PathBuf>,
    /// Task payload submitted once the agent is up
    pub tasks_file: Option<PathBuf>,
    pub checkpoint_dir: Option<PathBuf>,
}

#[derive(Debug, PartialEq)]
pub struct CheckpointQuery {
    pub config_override: Option<PathBuf>,
    pub checkpoint_dir: Option<PathBuf>,
}

#[derive(Debug, Parser)]
#[command(name = "node-agent")]
#[command(author = "Node Agent Team")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(
    about = "Node-local agent that runs orchestrator tasks as containers and reports their status"
)]
#[command(long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Args {
    /// Log filter (overrides RUST_LOG), e.g. `debug` or `node_agent=trace`
    #[arg(long = "log-level", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the agent, reading control-plane messages on stdin
    Run {
        /// Configuration file path
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,
        /// JSON task payload to submit at startup
        #[arg(short = 't', long = "tasks", value_name = "FILE")]
        tasks: Option<PathBuf>,
        /// Checkpoint directory override
        #[arg(long = "checkpoint-dir", value_name = "DIR")]
        checkpoint_dir: Option<PathBuf>,
    },
    /// Show configuration discovery information and the active configuration
    ShowConfig {
        /// Configuration file path
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,
    },
    /// Summarize the saved checkpoint
    Checkpoint {
        /// Configuration file path
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,
        /// Checkpoint directory override
        #[arg(long = "checkpoint-dir", value_name = "DIR")]
        checkpoint_dir: Option<PathBuf>,
    },
    /// Validate a task payload file
    Validate {
        /// Path to a JSON task payload
        file: PathBuf,
    },
}

impl Args {
    pub fn parse() -> Self {
        Parser::parse()
    }

    pub fn mode(&self) -> Result<ExecutionMode, String> {
        match &self.command {
            Some(Commands::Run {
                config,
                tasks,
                checkpoint_dir,
            }) => Ok(ExecutionMode::Run(RunConfig {
                config_override: config.clone(),
                tasks_file: tasks.clone(),
                checkpoint_dir: checkpoint_dir.clone(),
            })),
            Some(Commands::ShowConfig { config }) => Ok(ExecutionMode::ShowConfig {
                config_override: config.clone(),
            }),
            Some(Commands::Checkpoint {
                config,
                checkpoint_dir,
            }) => Ok(ExecutionMode::Checkpoint(CheckpointQuery {
                config_override: config.clone(),
                checkpoint_dir: checkpoint_dir.clone(),
            })),
            Some(Commands::Validate { file }) => Ok(ExecutionMode::Validate(file.clone())),
            None => Err(
                "No command specified. Use 'node-agent --help' to see available commands."
                    .to_string(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_run_command() {
        let args = parse(&[
            "node-agent",
            "run",
            "--config",
            "agent.toml",
            "--tasks",
            "payload.json",
            "--checkpoint-dir",
            "/tmp/state",
        ]);

        assert_eq!(
            args.mode().unwrap(),
            ExecutionMode::Run(RunConfig {
                config_override: Some(PathBuf::from("agent.toml")),
                tasks_file: Some(PathBuf::from("payload.json")),
                checkpoint_dir: Some(PathBuf::from("/tmp/state")),
            })
        );
    }

    #[test]
    fn test_run_command_defaults() {
        let args = parse(&["node-agent", "run"]);
        assert_eq!(
            args.mode().unwrap(),
            ExecutionMode::Run(RunConfig {
                config_override: None,
                tasks_file: None,
                checkpoint_dir: None,
            })
        );
        assert_eq!(args.log_level, None);
    }

    #[test]
    fn test_global_log_level() {
        let args = parse(&["node-agent", "validate", "tasks.json", "--log-level", "debug"]);
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert_eq!(
            args.mode().unwrap(),
            ExecutionMode::Validate(PathBuf::from("tasks.json"))
        );
    }

    #[test]
    fn test_checkpoint_and_show_config() {
        let args = parse(&["node-agent", "checkpoint", "--checkpoint-dir", "state"]);
        assert_eq!(
            args.mode().unwrap(),
            ExecutionMode::Checkpoint(CheckpointQuery {
                config_override: None,
                checkpoint_dir: Some(PathBuf::from("state")),
            })
        );

        let args = parse(&["node-agent", "show-config"]);
        assert_eq!(
            args.mode().unwrap(),
            ExecutionMode::ShowConfig {
                config_override: None
            }
        );
    }

    #[test]
    fn test_validate_requires_file() {
        assert!(Args::try_parse_from(["node-agent", "validate"]).is_err());
    }

    #[test]
    fn test_no_command() {
        let args = Args {
            log_level: None,
            command: None,
        };
        assert!(args.mode().is_err());
    }
}
