// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

mod commands;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "trellis", version, about = "Secure peer-to-peer overlay network agent")]
struct Cli {
	#[command(subcommand)]
	command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
	/// Run the trellis agent on this node
	Agent(commands::agent::AgentArgs),
}

#[tokio::main]
async fn main() {
	tracing_subscriber::fmt()
		.with_env_filter(
			EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
		)
		.init();

	let cli = Cli::parse();

	let result = match cli.command {
		Commands::Agent(args) => commands::agent::run(args).await,
	};

	if let Err(err) = result {
		eprintln!("{err:#}");
		std::process::exit(1);
	}
}
