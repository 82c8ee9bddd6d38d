// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::driver::{ensure_interface, WgInterface};
use crate::error::{AgentError, Result};
use crate::ipam;
use crate::options::{join_endpoint, split_endpoint, AgentOptions};
use crate::reconciler::PeerReconciler;
use ipnet::IpNet;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tracing::{info, instrument, warn};
use trellis_link::LinkHandle;
use trellis_registry::{Peer, PeerSpec, RegistryClient, WatchEvent, WatchStream};
use trellis_wg::{WgKeyPair, WgPresharedKey};
use wireguard_control::{DeviceUpdate, Key};

/// One node's agent: owns the tunnel interface and the self peer record,
/// and runs the reconciler until shutdown.
pub struct Agent {
	options: AgentOptions,
	registry: RegistryClient,
	link: LinkHandle,
}

impl Agent {
	/// Must be called from within a tokio runtime; the link handle spawns
	/// its netlink connection task immediately.
	pub fn new(options: AgentOptions) -> Result<Self> {
		let registry = RegistryClient::new(&options.registry);
		let link = LinkHandle::new()?;
		Ok(Self {
			options,
			registry,
			link,
		})
	}

	/// Runs the agent until `shutdown` flips to true. Exits cleanly on
	/// shutdown; any error before that is fatal.
	#[instrument(skip_all, fields(name = %self.options.name))]
	pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
		let namespace = self.options.namespace().to_string();

		let keypair = match &self.options.private_key_file {
			Some(path) => {
				info!(path = %path.display(), "loading device key");
				trellis_wg::get_or_create_key(path).await.map_err(|err| {
					AgentError::config("--private-key-file", err.to_string())
				})?
			}
			None => {
				info!("generating wireguard keys");
				WgKeyPair::generate()
			}
		};
		let psk = WgPresharedKey::generate();

		let local = build_local_peer(&self.options, &namespace, &keypair, &psk);
		let mut local = self.register_local_peer(local).await?;

		if let Some(pool) = &self.options.ip_pool {
			let owner = local.owner_reference();
			info!(%pool, count = self.options.ip_pool_count, "claiming tunnel addresses");
			let claimed = ipam::claim_ips(
				&self.registry,
				&namespace,
				pool,
				&owner,
				self.options.ip_pool_count,
			)
			.await?;
			local.spec.ips.extend(claimed.iter().map(|net| net.to_string()));
		}

		let mut iface = ensure_interface(&self.options.interface, &self.link).await?;
		info!(
			interface = %iface.name(),
			backend = ?iface.backend(),
			"wireguard interface ready"
		);

		let result = self
			.serve(&mut iface, local, &namespace, &keypair, &mut shutdown)
			.await;

		if let Err(err) = iface.close().await {
			warn!(error = %err, "error closing interface");
		}
		result
	}

	async fn serve(
		&self,
		iface: &mut WgInterface,
		mut local: Peer,
		namespace: &str,
		keypair: &WgKeyPair,
		shutdown: &mut watch::Receiver<bool>,
	) -> Result<()> {
		let private_key = Key::from_base64(&keypair.private_key().to_base64())
			.map_err(|_| AgentError::InvalidKey)?;
		iface.apply(DeviceUpdate::new().set_private_key(private_key))?;

		for ip in &local.spec.ips {
			let net: IpNet = ip.parse().map_err(|_| {
				AgentError::config("--ips", format!("invalid cidr {ip:?}"))
			})?;
			iface.ensure_ip(net).await?;
		}
		iface.ensure_up().await?;
		let addresses = iface.ips().await?;
		info!(?addresses, "interface up");

		// A configured endpoint with an explicit port is trusted (the user
		// likely has DNAT in front of us); otherwise publish the port the
		// driver actually bound.
		let (host, port) = split_endpoint(&local.spec.endpoint)
			.map_err(|reason| AgentError::config("--endpoint-addr", reason))?;
		if port.is_none() {
			if let Some(listen) = iface.listen_port()? {
				local.spec.endpoint = join_endpoint(&host, listen);
			}
		}
		local = self.registry.update(&local).await?;
		info!(endpoint = %local.spec.endpoint, "local peer published");

		let keepalive_cap =
			(self.options.keepalive_seconds > 0).then_some(self.options.keepalive_seconds);
		let reconciler = Arc::new(PeerReconciler::new(
			iface.target(),
			&local.metadata.self_link,
			keepalive_cap,
		));

		let stream = self
			.registry
			.watch::<Peer>(namespace, &self.options.peer_selector)
			.await?;
		let (synced_tx, synced_rx) = oneshot::channel();
		let informer = tokio::spawn(informer_loop(stream, Arc::clone(&reconciler), synced_tx));

		let synced = tokio::select! {
			result = synced_rx => result.is_ok(),
			_ = wait_for_shutdown(shutdown) => {
				info!("shutdown before initial sync");
				informer.abort();
				let _ = informer.await;
				return Ok(());
			}
		};
		if !synced {
			informer.abort();
			let _ = informer.await;
			return Err(AgentError::WatchEnded);
		}

		info!("cache fully synced; applying initial config to interface");
		reconciler.apply_initial_config()?;
		info!("agent running");

		wait_for_shutdown(shutdown).await;
		info!("shutdown signal received");

		informer.abort();
		let _ = informer.await;
		Ok(())
	}

	/// Creates the self record, or adopts an existing record of the same
	/// name after verifying its endpoint, rewriting it with fresh keys.
	async fn register_local_peer(&self, local: Peer) -> Result<Peer> {
		info!("registering local peer");
		match self.registry.create(&local).await {
			Ok(created) => return Ok(created),
			Err(err) if err.is_already_exists() => {}
			Err(err) => return Err(err.into()),
		}

		// A record with our name exists. If its endpoint is ours this is a
		// restart and we take it over; otherwise another node owns the name.
		info!("a local peer with our name was already registered, trying to update");
		let existing: Peer = self
			.registry
			.get(&local.metadata.namespace, &local.metadata.name)
			.await?;
		if endpoints_conflict(&local.spec.endpoint, &existing.spec.endpoint) {
			return Err(AgentError::PeerNameConflict {
				name: local.metadata.name.clone(),
				existing: existing.spec.endpoint.clone(),
				ours: local.spec.endpoint.clone(),
			});
		}

		let mut updated = existing;
		updated.metadata.labels = local.metadata.labels.clone();
		updated.spec = local.spec.clone();
		Ok(self.registry.update(&updated).await?)
	}
}

impl std::fmt::Debug for Agent {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Agent")
			.field("name", &self.options.name)
			.field("namespace", &self.options.namespace())
			.finish()
	}
}

fn build_local_peer(
	options: &AgentOptions,
	namespace: &str,
	keypair: &WgKeyPair,
	psk: &WgPresharedKey,
) -> Peer {
	let mut peer = Peer::new(namespace, &options.name);
	peer.metadata.labels = options.labels.clone();
	peer.spec = PeerSpec {
		endpoint: options.endpoint_addr.clone(),
		public_key: keypair.public_key().to_base64(),
		preshared_key: psk.to_base64(),
		ips: options.ips.clone(),
		routes: options.offer_routes.clone(),
		keepalive: options.keepalive_seconds,
	};
	peer
}

/// Our stored endpoint gains the driver-assigned port once we are up, so a
/// restart with a portless configured endpoint compares hosts only.
fn endpoints_conflict(ours: &str, theirs: &str) -> bool {
	if ours == theirs {
		return false;
	}
	match (split_endpoint(ours), split_endpoint(theirs)) {
		(Ok((our_host, None)), Ok((their_host, _))) => our_host != their_host,
		_ => true,
	}
}

async fn informer_loop(
	mut stream: WatchStream<Peer>,
	reconciler: Arc<PeerReconciler>,
	synced_tx: oneshot::Sender<()>,
) {
	let mut synced_tx = Some(synced_tx);
	while let Some(event) = stream.next().await {
		match event {
			Ok(WatchEvent::Added { object }) => reconciler.on_added(&object),
			Ok(WatchEvent::Updated { object }) => reconciler.on_updated(&object),
			Ok(WatchEvent::Deleted { object }) => reconciler.on_deleted(&object),
			Ok(WatchEvent::Synced) => {
				if let Some(tx) = synced_tx.take() {
					let _ = tx.send(());
				}
			}
			Err(err) => warn!(error = %err, "peer watch error"),
		}
	}
	info!("peer watch ended");
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
	while !*shutdown.borrow() {
		if shutdown.changed().await.is_err() {
			break;
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::BTreeMap;
	use trellis_registry::RegistryConfig;

	fn options() -> AgentOptions {
		let registry = RegistryConfig::new("https://registry.example.com".parse().unwrap());
		let mut options = AgentOptions::new("node-a", "node-a.example.com", registry);
		options.labels = BTreeMap::from([("zone".to_string(), "us-east".to_string())]);
		options.ips = vec!["10.10.0.1/24".to_string()];
		options.offer_routes = vec!["192.168.50.0/24".to_string()];
		options.keepalive_seconds = 25;
		options
	}

	#[test]
	fn local_peer_carries_options_and_fresh_keys() {
		let options = options();
		let keypair = WgKeyPair::generate();
		let psk = WgPresharedKey::generate();
		let peer = build_local_peer(&options, "mesh", &keypair, &psk);

		assert_eq!(peer.metadata.namespace, "mesh");
		assert_eq!(peer.metadata.name, "node-a");
		assert_eq!(peer.metadata.labels.get("zone").unwrap(), "us-east");
		assert_eq!(peer.spec.endpoint, "node-a.example.com");
		assert_eq!(peer.spec.public_key, keypair.public_key().to_base64());
		assert_eq!(peer.spec.preshared_key, psk.to_base64());
		assert_eq!(peer.spec.ips, options.ips);
		assert_eq!(peer.spec.routes, options.offer_routes);
		assert_eq!(peer.spec.keepalive, 25);
	}

	#[test]
	fn endpoint_conflicts() {
		// Exact match never conflicts.
		assert!(!endpoints_conflict("a.example.com:51820", "a.example.com:51820"));
		// Portless configured endpoint tolerates a stored driver port.
		assert!(!endpoints_conflict("a.example.com", "a.example.com:51820"));
		assert!(!endpoints_conflict("a.example.com:", "a.example.com:51820"));
		// Different hosts always conflict.
		assert!(endpoints_conflict("a.example.com", "b.example.com:51820"));
		// Explicit differing ports conflict.
		assert!(endpoints_conflict("a.example.com:51820", "a.example.com:51821"));
	}
}
