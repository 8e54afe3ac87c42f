//! Sagaflow CLI entry point.
//!
//! Binary name: `sagaflow`
//!
//! Parses CLI arguments, loads configuration, initializes tracing and the
//! SQLite-backed executor, then dispatches to the command handler.

mod cli;
mod demo;
mod state;

use clap::Parser;

use cli::{Cli, Commands};
use sagaflow_infra::config::{load_engine_config, resolve_data_dir};
use sagaflow_observe::tracing_setup::{
    TracingOptions, filter_for_verbosity, init_tracing, shutdown_tracing,
};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let data_dir = resolve_data_dir(cli.data_dir.as_deref());
    let config = load_engine_config(&data_dir).await;

    init_tracing(&TracingOptions {
        default_filter: filter_for_verbosity(cli.verbose).to_string(),
        json: config.logging.json,
        otel: config.logging.otel,
    })
    .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;

    let state = AppState::init(data_dir, config).await?;
    let result = dispatch(cli.command, &state, cli.json).await;

    shutdown_tracing();
    result
}

async fn dispatch(command: Commands, state: &AppState, json: bool) -> anyhow::Result<()> {
    match command {
        Commands::Run {
            handle,
            banner_url,
            fail_at,
            pause_after,
            mode,
            timeout,
        } => {
            let args = cli::run::RunArgs {
                handle,
                banner_url,
                fail_at,
                pause_after,
                mode,
                timeout,
            };
            cli::run::handle_run(args, state, json).await
        }

        Commands::Plan { workflow } => cli::run::handle_plan(&workflow, state, json),

        Commands::Resume { id } => cli::run::handle_resume(&id, state, json).await,

        Commands::Status { id } => cli::instance::show_instance(state, &id, json).await,

        Commands::List {
            workflow,
            status,
            limit,
        } => cli::instance::list_instances(state, workflow.as_deref(), status, limit, json).await,

        Commands::Count { status } => cli::instance::count_instances(state, status, json).await,

        Commands::Health { id, max_secs } => {
            cli::instance::check_health(state, &id, max_secs, json).await
        }

        Commands::Cancel { id } => cli::instance::cancel_instance(state, &id, json).await,

        Commands::Delete { id, force } => {
            cli::instance::delete_instance(state, &id, force, json).await
        }
    }
}
