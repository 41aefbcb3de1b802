// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "tove", about = "LLM agent server over the Gemini API", version)]
pub struct Cli {
    /// Explicit config file (merged on top of the discovered layers).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log to stderr at debug level (overrides TOVE_LOG).
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the WebSocket gateway (the default).
    Serve,
    /// Print the resolved configuration and exit.
    ShowConfig,
}
