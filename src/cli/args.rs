//! Command line argument parsing
//!
//! Subcommands:
//! - `run`: Run a group of simulated transfers and print a summary
//! - `show-config`: Show configuration discovery information, optionally
//!   writing the default user configuration first

use crate::config::AppConfig;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug)]
pub enum ExecutionMode {
    Run(RunConfig),
    ShowConfig {
        config_override: Option<PathBuf>,
        init: bool,
    },
}

/// Options of the `run` subcommand; unset values come from configuration
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunConfig {
    pub config_override: Option<PathBuf>,
    pub tasks: Option<usize>,
    pub max_running: Option<i64>,
    pub steps: Option<u32>,
    pub step_ms: Option<u64>,
    pub failure_rate: Option<f64>,
    pub cancel_after_ms: Option<u64>,
    pub json: bool,
}

impl RunConfig {
    /// Overlay the command line values on top of `config`
    pub fn apply(&self, config: &mut AppConfig) {
        if let Some(tasks) = self.tasks {
            config.simulation.tasks = tasks;
        }
        if let Some(max_running) = self.max_running {
            config.group.max_running_tasks = max_running;
        }
        if let Some(steps) = self.steps {
            config.simulation.steps = steps;
        }
        if let Some(step_ms) = self.step_ms {
            config.simulation.step_ms = step_ms;
        }
        if let Some(failure_rate) = self.failure_rate {
            config.simulation.failure_rate = failure_rate;
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "taskgroup")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run bounded-concurrency task groups over simulated transfers")]
#[command(long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run a task group of simulated transfers
    Run {
        /// Configuration file path
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,
        /// Number of transfers
        #[arg(short = 't', long = "tasks")]
        tasks: Option<usize>,
        /// Maximum transfers running at once (0 = unbounded)
        #[arg(short = 'm', long = "max-running", allow_negative_numbers = true)]
        max_running: Option<i64>,
        /// Progress steps per transfer
        #[arg(long = "steps")]
        steps: Option<u32>,
        /// Milliseconds per progress step
        #[arg(long = "step-ms")]
        step_ms: Option<u64>,
        /// Probability that a transfer fails midway
        #[arg(long = "failure-rate")]
        failure_rate: Option<f64>,
        /// Cancel the group if it is still running after this many milliseconds
        #[arg(long = "cancel-after-ms", value_name = "MS")]
        cancel_after_ms: Option<u64>,
        /// Print the summary as JSON
        #[arg(long = "json")]
        json: bool,
    },
    /// Show configuration discovery information
    ShowConfig {
        /// Configuration file path
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,
        /// Create ~/.taskgroup/config.toml with the defaults if it is missing
        #[arg(long = "init")]
        init: bool,
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
                max_running,
                steps,
                step_ms,
                failure_rate,
                cancel_after_ms,
                json,
            }) => Ok(ExecutionMode::Run(RunConfig {
                config_override: config.clone(),
                tasks: *tasks,
                max_running: *max_running,
                steps: *steps,
                step_ms: *step_ms,
                failure_rate: *failure_rate,
                cancel_after_ms: *cancel_after_ms,
                json: *json,
            })),
            Some(Commands::ShowConfig { config, init }) => Ok(ExecutionMode::ShowConfig {
                config_override: config.clone(),
                init: *init,
            }),
            None => Err(
                "No command specified. Use 'taskgroup --help' to see available commands."
                    .to_string(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_command_overrides() {
        let args = Args::try_parse_from([
            "taskgroup",
            "run",
            "--tasks",
            "12",
            "-m",
            "3",
            "--failure-rate",
            "0.25",
            "--json",
        ])
        .unwrap();

        let ExecutionMode::Run(run) = args.mode().unwrap() else {
            panic!("Expected Run mode");
        };
        assert!(run.json);
        assert_eq!(run.cancel_after_ms, None);

        let mut config = AppConfig::default();
        run.apply(&mut config);
        assert_eq!(config.simulation.tasks, 12);
        assert_eq!(config.group.max_running_tasks, 3);
        assert_eq!(config.simulation.failure_rate, 0.25);
        assert_eq!(config.simulation.steps, 10);
    }

    #[test]
    fn test_negative_limit_reaches_validation() {
        let args = Args::try_parse_from(["taskgroup", "run", "--max-running", "-1"]).unwrap();
        let ExecutionMode::Run(run) = args.mode().unwrap() else {
            panic!("Expected Run mode");
        };

        let mut config = AppConfig::default();
        run.apply(&mut config);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_show_config_command() {
        let args = Args::try_parse_from(["taskgroup", "show-config", "-c", "custom.toml"]).unwrap();
        assert!(matches!(
            args.mode().unwrap(),
            ExecutionMode::ShowConfig { config_override: Some(path), init: false }
                if path == PathBuf::from("custom.toml")
        ));

        let args = Args::try_parse_from(["taskgroup", "show-config", "--init"]).unwrap();
        assert!(matches!(
            args.mode().unwrap(),
            ExecutionMode::ShowConfig { config_override: None, init: true }
        ));
    }

    #[test]
    fn test_missing_command() {
        let args = Args { command: None };
        assert!(args.mode().is_err());
    }
}
