// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use anyhow::{anyhow, bail};
use clap::Args;
use console::style;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::info;
use trellis_agent::{
	validate_cidr_list, validate_node_name, Agent, AgentOptions, WgDriver,
};
use trellis_registry::{RegistryConfig, Selector};

#[derive(Debug, Clone, Args)]
pub struct AgentArgs {
	/// Name of this peer (default: host name)
	#[arg(long)]
	pub name: Option<String>,

	/// Endpoint address published to peers, host[:port]; an omitted port is
	/// filled in with the driver-assigned listen port (default: host name)
	#[arg(long)]
	pub endpoint_addr: Option<String>,

	/// Port to bind the wireguard service; 0 = random available port
	#[arg(long, default_value_t = 0)]
	pub port: u16,

	/// Send keepalive packets every x seconds; 0 disables
	#[arg(long, default_value_t = 0)]
	pub keepalive_seconds: u32,

	/// Interface name; a + suffix auto-selects the next free id (wg+ for
	/// wg0, wg1, ...)
	#[arg(long, default_value = "wg0")]
	pub interface: String,

	/// Wireguard driver to use (auto, existing, kernel, boringtun,
	/// wireguard-go)
	#[arg(long, default_value = "auto")]
	pub driver: String,

	/// If --interface already exists and is a compatible wireguard device,
	/// reuse it
	#[arg(long)]
	pub reuse_existing_interface: bool,

	/// Path to the boringtun userspace driver
	#[arg(long)]
	pub boringtun_path: Option<String>,

	/// Extra arguments to pass to boringtun (shell-style quoting)
	#[arg(long)]
	pub boringtun_extra_args: Option<String>,

	/// Path to the wireguard-go userspace driver
	#[arg(long)]
	pub wireguard_go_path: Option<String>,

	/// Extra arguments to pass to wireguard-go (shell-style quoting)
	#[arg(long)]
	pub wireguard_go_extra_args: Option<String>,

	/// CIDR to assign to the local wireguard interface (repeatable)
	#[arg(long = "ips")]
	pub ips: Vec<String>,

	/// CIDR route this node offers to its peers (repeatable)
	#[arg(long = "offer-routes")]
	pub offer_routes: Vec<String>,

	/// Claim tunnel addresses from this pool
	#[arg(long)]
	pub ip_pool: Option<String>,

	/// How many addresses to claim from --ip-pool
	#[arg(long, default_value_t = 1)]
	pub ip_pool_count: usize,

	/// Persist and reuse the device private key at this path instead of
	/// generating a fresh key each start
	#[arg(long)]
	pub private_key_file: Option<PathBuf>,

	/// Label query selecting the peers to track
	#[arg(long)]
	pub peer_selector: Option<String>,

	/// key=value labels applied to the local peer record (comma separated)
	#[arg(long)]
	pub labels: Option<String>,

	/// Registry namespace, default from the registry config
	#[arg(long)]
	pub registry_namespace: Option<String>,

	/// Path to the registry config file for the local cluster
	#[arg(long)]
	pub kubeconfig: Option<PathBuf>,

	/// Path to the registry config file for the peer registry (defaults to
	/// --kubeconfig)
	#[arg(long)]
	pub registry_kubeconfig: Option<PathBuf>,
}

pub async fn run(args: AgentArgs) -> anyhow::Result<()> {
	let options = build_options(args).await?;

	let shutdown_rx = install_signal_handler()?;

	println!(
		"{} trellis agent starting ({})",
		style("●").green().bold(),
		options.name
	);

	let agent = Agent::new(options)?;
	agent.run(shutdown_rx).await?;

	println!("{} trellis agent stopped", style("●").dim());
	Ok(())
}

async fn build_options(args: AgentArgs) -> anyhow::Result<AgentOptions> {
	let host = local_host_name();

	let name = match args.name {
		Some(name) => name,
		None => host
			.clone()
			.ok_or_else(|| anyhow!("--name: required, could not determine host name"))?,
	};
	if let Err(reason) = validate_node_name(&name) {
		bail!("--name: {reason}");
	}

	let endpoint_addr = match args.endpoint_addr {
		Some(endpoint) => endpoint,
		None => host.ok_or_else(|| {
			anyhow!("--endpoint-addr: required, could not determine host name")
		})?,
	};
	if let Err(reason) = trellis_agent::split_endpoint(&endpoint_addr) {
		bail!("--endpoint-addr: {reason}");
	}

	if let Err(reason) = validate_cidr_list(&args.ips) {
		bail!("--ips: {reason}");
	}
	if let Err(reason) = validate_cidr_list(&args.offer_routes) {
		bail!("--offer-routes: {reason}");
	}

	let registry_path = args
		.registry_kubeconfig
		.clone()
		.or_else(|| args.kubeconfig.clone())
		.or_else(default_registry_config_path)
		.ok_or_else(|| anyhow!("--registry-kubeconfig: required"))?;
	let registry = RegistryConfig::load(&registry_path)
		.await
		.map_err(|err| anyhow!("--registry-kubeconfig: {err}"))?;

	let mut options = AgentOptions::new(&name, &endpoint_addr, registry);
	options.keepalive_seconds = args.keepalive_seconds;
	options.ips = args.ips;
	options.offer_routes = args.offer_routes;
	options.ip_pool = args.ip_pool;
	options.ip_pool_count = args.ip_pool_count;
	options.private_key_file = args.private_key_file;
	options.registry_namespace = args.registry_namespace;

	if let Some(selector) = &args.peer_selector {
		options.peer_selector = Selector::parse(selector)
			.map_err(|err| anyhow!("--peer-selector: {err}"))?;
	}
	if let Some(labels) = &args.labels {
		options.labels = parse_labels(labels).map_err(|reason| anyhow!("--labels: {reason}"))?;
	}

	options.interface.name = args.interface;
	options.interface.driver = args
		.driver
		.parse::<WgDriver>()
		.map_err(|err| anyhow!("--driver: {err}"))?;
	options.interface.reuse_existing = args.reuse_existing_interface;
	options.interface.port = (args.port != 0).then_some(args.port);
	options.interface.boringtun_path = args.boringtun_path;
	options.interface.boringtun_extra_args = args.boringtun_extra_args;
	options.interface.wireguard_go_path = args.wireguard_go_path;
	options.interface.wireguard_go_extra_args = args.wireguard_go_extra_args;

	Ok(options)
}

fn local_host_name() -> Option<String> {
	hostname::get()
		.ok()
		.map(|name| name.to_string_lossy().to_lowercase())
}

fn default_registry_config_path() -> Option<PathBuf> {
	dirs::home_dir().map(|home| home.join(".trellis").join("registry.json"))
}

fn parse_labels(input: &str) -> Result<BTreeMap<String, String>, String> {
	let mut labels = BTreeMap::new();
	for pair in input.split(',') {
		let pair = pair.trim();
		if pair.is_empty() {
			continue;
		}
		let (key, value) = pair
			.split_once('=')
			.ok_or_else(|| format!("{pair:?} is not key=value"))?;
		if key.trim().is_empty() {
			return Err(format!("{pair:?} has an empty key"));
		}
		labels.insert(key.trim().to_string(), value.trim().to_string());
	}
	Ok(labels)
}

/// Installs SIGINT/SIGTERM handlers: the first signal requests a clean
/// shutdown, the second exits immediately for the impatient.
fn install_signal_handler() -> anyhow::Result<watch::Receiver<bool>> {
	let (shutdown_tx, shutdown_rx) = watch::channel(false);

	let mut sigint = signal(SignalKind::interrupt())
		.map_err(|err| anyhow!("installing SIGINT handler: {err}"))?;
	let mut sigterm = signal(SignalKind::terminate())
		.map_err(|err| anyhow!("installing SIGTERM handler: {err}"))?;

	tokio::spawn(async move {
		tokio::select! {
			_ = sigint.recv() => {}
			_ = sigterm.recv() => {}
		}
		info!("interrupt received, shutting down");
		let _ = shutdown_tx.send(true);

		tokio::select! {
			_ = sigint.recv() => {}
			_ = sigterm.recv() => {}
		}
		eprintln!("second interrupt, exiting immediately");
		std::process::exit(1);
	});

	Ok(shutdown_rx)
}

#[cfg(test)]
mod tests {
	use super::*;
	use clap::Parser;

	#[derive(Parser)]
	struct TestCli {
		#[command(flatten)]
		args: AgentArgs,
	}

	#[test]
	fn agent_args_parse() {
		let cli = TestCli::parse_from([
			"test",
			"--name",
			"node-a",
			"--endpoint-addr",
			"node-a.example.com:51820",
			"--interface",
			"wg+",
			"--driver",
			"boringtun",
			"--reuse-existing-interface",
			"--ips",
			"10.10.0.1/24",
			"--ips",
			"fd00::1/64",
			"--offer-routes",
			"192.168.50.0/24",
			"--peer-selector",
			"zone=us-east",
			"--labels",
			"zone=us-east,tier=edge",
			"--ip-pool",
			"mesh-pool",
		]);
		let args = cli.args;
		assert_eq!(args.name.as_deref(), Some("node-a"));
		assert_eq!(args.interface, "wg+");
		assert_eq!(args.driver, "boringtun");
		assert!(args.reuse_existing_interface);
		assert_eq!(args.ips.len(), 2);
		assert_eq!(args.offer_routes.len(), 1);
		assert_eq!(args.ip_pool.as_deref(), Some("mesh-pool"));
		assert_eq!(args.ip_pool_count, 1);
		assert_eq!(args.port, 0);
	}

	#[test]
	fn labels_parse() {
		let labels = parse_labels("zone=us-east, tier=edge").unwrap();
		assert_eq!(labels.get("zone").unwrap(), "us-east");
		assert_eq!(labels.get("tier").unwrap(), "edge");

		assert!(parse_labels("no-equals").is_err());
		assert!(parse_labels("=v").is_err());
	}
}
