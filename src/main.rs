// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};
use tove_gateway::Gateway;
use tove_model::GeminiClient;
use tove_tools::{DirStore, ToolRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = tove_config::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::ShowConfig => {
            println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
            Ok(())
        }
        Commands::Serve => {
            let api_key = config
                .model
                .resolve_api_key()
                .context("no API key: set GEMINI_API_KEY or model.api_key in the config")?;
            let client = Arc::new(GeminiClient::new(
                api_key,
                config.model.base_url.clone(),
                Duration::from_secs(config.model.request_timeout_secs),
            ));

            // Tools are pluggable capabilities; deployments register theirs
            // here before the gateway starts.
            let registry = Arc::new(ToolRegistry::new());
            let context = Arc::new(DirStore::new(config.workspace.dir.clone()));

            let gateway = Arc::new(Gateway::new(config, client, registry, context));
            tove_gateway::serve(gateway).await
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env("TOVE_LOG").unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
