use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use treasury_mesh::cli::{self, Cli, Commands};
use treasury_mesh::config::AppConfig;
use treasury_mesh::coordinator::{builtin_templates, WorkflowStatus};

mod main_runtime;

use main_runtime::{init_logging, init_logging_simple};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config))?;

    match &cli.command {
        Commands::Templates => {
            init_logging_simple();
            print!("{}", cli::render_templates(&builtin_templates()));
        }
        Commands::Config => {
            init_logging_simple();
            print!("{}", config.to_toml()?);
        }
        Commands::Run {
            template,
            payload,
            silent_agents,
        } => {
            init_logging(&config.logging);
            info!(template = %template, "Starting workflow run");

            let instance = cli::run_workflow(&config, template, payload, silent_agents).await?;
            println!("{}", serde_json::to_string_pretty(&instance)?);

            match instance.status {
                WorkflowStatus::Completed | WorkflowStatus::PartiallyCompleted => {
                    info!(run_id = %instance.run_id, status = %instance.status, "Workflow finished");
                }
                status => {
                    error!(run_id = %instance.run_id, status = %status, failure = ?instance.failure, "Workflow did not complete");
                    std::process::exit(2);
                }
            }
        }
    }

    Ok(())
}
