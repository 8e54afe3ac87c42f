//! CLI command definitions for the `sagaflow` binary.
//!
//! Uses clap derive macros for argument parsing. Commands operate on
//! workflow instances persisted in the data directory's SQLite database.

pub mod instance;
pub mod run;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use sagaflow_types::workflow::{ExecutionMode, WorkflowStatus};

/// Run and inspect DAG workflows.
#[derive(Parser)]
#[command(name = "sagaflow", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Detailed logs (-v for info, -vv for debug, -vvv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Data directory (defaults to $SAGAFLOW_DATA_DIR, then ~/.sagaflow).
    #[arg(long, global = true, env = "SAGAFLOW_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the profile-analysis demo workflow.
    Run {
        /// Profile handle to analyse.
        #[arg(long, default_value = "ada-lovelace")]
        handle: String,

        /// Banner image URL; the banner branch is skipped without one.
        #[arg(long)]
        banner_url: Option<String>,

        /// Make this step fail permanently to trigger compensation.
        #[arg(long, value_name = "STEP")]
        fail_at: Option<String>,

        /// Pause the run once this step completes.
        #[arg(long, value_name = "STEP")]
        pause_after: Option<String>,

        /// Scheduling mode.
        #[arg(long, default_value = "parallel")]
        mode: ExecutionMode,

        /// Global timeout in seconds.
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,
    },

    /// Print the execution waves of a registered workflow.
    Plan {
        /// Workflow name.
        #[arg(long, default_value = crate::demo::WORKFLOW_NAME)]
        workflow: String,
    },

    /// Show one workflow instance with its step records.
    Status {
        /// Instance ID.
        id: String,
    },

    /// List workflow instances, newest first.
    #[command(alias = "ls")]
    List {
        /// Filter by workflow name.
        #[arg(long)]
        workflow: Option<String>,

        /// Filter by status.
        #[arg(long)]
        status: Option<WorkflowStatus>,

        /// Maximum number of instances to display.
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Count workflow instances.
    Count {
        /// Only count instances in this status.
        #[arg(long)]
        status: Option<WorkflowStatus>,
    },

    /// Check whether an instance is stuck or needs intervention.
    Health {
        /// Instance ID.
        id: String,

        /// Longest acceptable time in a non-terminal status.
        #[arg(long, default_value = "300")]
        max_secs: i64,
    },

    /// Cancel a pending or paused instance.
    Cancel {
        /// Instance ID.
        id: String,
    },

    /// Resume a paused instance.
    Resume {
        /// Instance ID.
        id: String,
    },

    /// Delete an instance record.
    #[command(alias = "rm")]
    Delete {
        /// Instance ID.
        id: String,

        /// Delete even if the instance is still active.
        #[arg(long)]
        force: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        <Cli as clap::CommandFactory>::command().debug_assert();
    }

    #[test]
    fn parses_run_options() {
        let cli = Cli::try_parse_from([
            "sagaflow",
            "run",
            "--mode",
            "sequential",
            "--fail-at",
            "notify-owner",
            "--timeout",
            "30",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                mode,
                fail_at,
                timeout,
                ..
            } => {
                assert_eq!(mode, ExecutionMode::Sequential);
                assert_eq!(fail_at.as_deref(), Some("notify-owner"));
                assert_eq!(timeout, Some(30));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn parses_status_filter() {
        let cli = Cli::try_parse_from(["sagaflow", "--json", "list", "--status", "paused"]).unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::List { status, limit, .. } => {
                assert_eq!(status, Some(WorkflowStatus::Paused));
                assert_eq!(limit, 20);
            }
            _ => panic!("expected list"),
        }
    }
}
