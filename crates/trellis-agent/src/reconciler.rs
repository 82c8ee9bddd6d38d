// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Keeps the WireGuard device's peer list converged on the registry state.
//! Watch callbacks and device mutations are serialized under one mutex; the
//! watch stream is single-threaded, so holding the lock across a
//! device-configure call costs nothing.

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{error, info, warn};
use trellis_registry::Peer;
use wireguard_control::{DeviceUpdate, Key, PeerConfigBuilder};

use crate::driver::{ConfigureDevice, DeviceTarget, DriverError};

#[derive(Error, Debug)]
pub enum TranslateError {
	#[error("failed to parse public key of peer {peer:?}")]
	InvalidPublicKey { peer: String },

	#[error("failed to parse preshared key of peer {peer:?}")]
	InvalidPresharedKey { peer: String },

	#[error("failed to resolve endpoint {endpoint:?}")]
	EndpointUnresolvable { endpoint: String },

	#[error("invalid cidr {value:?} on peer {peer:?}")]
	InvalidCidr { peer: String, value: String },
}

#[derive(Error, Debug)]
pub enum ReconcileError {
	#[error(transparent)]
	Translate(#[from] TranslateError),

	#[error(transparent)]
	Driver(#[from] DriverError),

	#[error("reconciler lock poisoned")]
	Poisoned,
}

pub type Result<T> = std::result::Result<T, ReconcileError>;

struct ReconcilerState {
	/// Keyed by the registry-assigned self-link of each record.
	peers: HashMap<String, Peer>,
	initial_applied: bool,
}

/// Tracks remote peers and mirrors them onto the device. Until
/// [`PeerReconciler::apply_initial_config`] runs, events only update the
/// in-memory map; afterwards every event becomes one single-peer
/// device-configure call.
pub struct PeerReconciler {
	state: Mutex<ReconcilerState>,
	device: Box<dyn ConfigureDevice>,
	local_self_link: String,
	/// Upper bound, in seconds, applied to peer-advertised keepalives.
	keepalive_cap: Option<u32>,
}

impl PeerReconciler {
	pub fn new(device: DeviceTarget, local_self_link: &str, keepalive_cap: Option<u32>) -> Self {
		Self::with_device(Box::new(device), local_self_link, keepalive_cap)
	}

	fn with_device(
		device: Box<dyn ConfigureDevice>,
		local_self_link: &str,
		keepalive_cap: Option<u32>,
	) -> Self {
		Self {
			state: Mutex::new(ReconcilerState {
				peers: HashMap::new(),
				initial_applied: false,
			}),
			device,
			local_self_link: local_self_link.to_string(),
			keepalive_cap,
		}
	}

	fn is_local(&self, peer: &Peer) -> bool {
		peer.metadata.self_link == self.local_self_link
	}

	pub fn on_added(&self, peer: &Peer) {
		if self.is_local(peer) {
			return;
		}
		info!(
			namespace = %peer.metadata.namespace,
			name = %peer.metadata.name,
			"peer added"
		);
		if let Err(err) = self.apply_update(peer) {
			error!(name = %peer.metadata.name, error = %err, "failed to add peer");
		}
	}

	pub fn on_updated(&self, peer: &Peer) {
		if self.is_local(peer) {
			return;
		}
		info!(
			namespace = %peer.metadata.namespace,
			name = %peer.metadata.name,
			"peer updated"
		);
		if let Err(err) = self.apply_update(peer) {
			error!(name = %peer.metadata.name, error = %err, "failed to apply peer update");
		}
	}

	pub fn on_deleted(&self, peer: &Peer) {
		if self.is_local(peer) {
			return;
		}
		info!(
			namespace = %peer.metadata.namespace,
			name = %peer.metadata.name,
			"peer deleted"
		);
		if let Err(err) = self.delete_peer(peer) {
			error!(name = %peer.metadata.name, error = %err, "failed to remove peer");
		}
	}

	fn apply_update(&self, peer: &Peer) -> Result<()> {
		let mut state = self.state.lock().map_err(|_| ReconcileError::Poisoned)?;

		let key = peer.metadata.self_link.clone();
		if let Some(current) = state.peers.get(&key) {
			if current.spec == peer.spec {
				// Identical spec; nothing to do.
				return Ok(());
			}
		}
		// The map is updated even if translation below fails, so a later
		// registry touch of a fixed record reapplies cleanly.
		state.peers.insert(key, peer.clone());

		if !state.initial_applied {
			return Ok(());
		}

		let config = translate_peer(peer, self.keepalive_cap)?;
		self.device.configure(DeviceUpdate::new().add_peer(config))?;
		Ok(())
	}

	fn delete_peer(&self, peer: &Peer) -> Result<()> {
		let mut state = self.state.lock().map_err(|_| ReconcileError::Poisoned)?;

		let Some(current) = state.peers.remove(&peer.metadata.self_link) else {
			// Never heard of it, goodbye.
			return Ok(());
		};

		if !state.initial_applied {
			return Ok(());
		}

		let public_key = Key::from_base64(&current.spec.public_key).map_err(|_| {
			TranslateError::InvalidPublicKey {
				peer: current.metadata.name.clone(),
			}
		})?;
		self
			.device
			.configure(DeviceUpdate::new().remove_peer_by_key(&public_key))?;
		Ok(())
	}

	/// One bulk device-configure replacing the whole peer set with the map
	/// contents. A peer that fails to translate is skipped with a warning;
	/// a single bad record must not block the rest of the mesh.
	pub fn apply_initial_config(&self) -> Result<()> {
		let mut state = self.state.lock().map_err(|_| ReconcileError::Poisoned)?;
		state.initial_applied = true;

		let mut update = DeviceUpdate::new().replace_peers();
		for peer in state.peers.values() {
			match translate_peer(peer, self.keepalive_cap) {
				Ok(config) => update = update.add_peer(config),
				Err(err) => {
					warn!(
						namespace = %peer.metadata.namespace,
						name = %peer.metadata.name,
						error = %err,
						"failed to build peer config, skipping"
					);
				}
			}
		}
		self.device.configure(update)?;
		Ok(())
	}

	#[cfg(test)]
	fn tracked_self_links(&self) -> Vec<String> {
		let state = self.state.lock().expect("reconciler lock");
		state.peers.keys().cloned().collect()
	}
}

impl std::fmt::Debug for PeerReconciler {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("PeerReconciler")
			.field("local_self_link", &self.local_self_link)
			.finish()
	}
}

/// Translates a registry record into a driver peer config: public key,
/// resolved endpoint, allowed IPs from the record's addresses and offered
/// routes, optional preshared key, and the capped keepalive.
fn translate_peer(
	peer: &Peer,
	keepalive_cap: Option<u32>,
) -> std::result::Result<PeerConfigBuilder, TranslateError> {
	let name = &peer.metadata.name;

	let public_key =
		Key::from_base64(&peer.spec.public_key).map_err(|_| TranslateError::InvalidPublicKey {
			peer: name.clone(),
		})?;
	let mut config = PeerConfigBuilder::new(&public_key);

	let endpoint: SocketAddr = peer
		.spec
		.endpoint
		.to_socket_addrs()
		.ok()
		.and_then(|mut addrs| addrs.next())
		.ok_or_else(|| TranslateError::EndpointUnresolvable {
			endpoint: peer.spec.endpoint.clone(),
		})?;
	config = config.set_endpoint(endpoint);

	if !peer.spec.preshared_key.is_empty() {
		let psk = Key::from_base64(&peer.spec.preshared_key).map_err(|_| {
			TranslateError::InvalidPresharedKey {
				peer: name.clone(),
			}
		})?;
		config = config.set_preshared_key(psk);
	}

	// The peer's tunnel addresses become host routes; its offered routes
	// are taken at their own width.
	for ip in &peer.spec.ips {
		let net: ipnet::IpNet = ip.parse().map_err(|_| TranslateError::InvalidCidr {
			peer: name.clone(),
			value: ip.clone(),
		})?;
		let host_len = if net.addr().is_ipv4() { 32 } else { 128 };
		config = config.add_allowed_ip(net.addr(), host_len);
	}
	for route in &peer.spec.routes {
		let net: ipnet::IpNet = route.parse().map_err(|_| TranslateError::InvalidCidr {
			peer: name.clone(),
			value: route.clone(),
		})?;
		config = config.add_allowed_ip(net.network(), net.prefix_len());
	}

	if peer.spec.keepalive > 0 {
		let mut keepalive = peer.spec.keepalive;
		if let Some(cap) = keepalive_cap {
			if cap > 0 && cap < keepalive {
				keepalive = cap;
			}
		}
		let keepalive = u16::try_from(keepalive).unwrap_or(u16::MAX);
		config = config.set_persistent_keepalive_interval(keepalive);
	}

	Ok(config)
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::sync::Arc;

	/// Stands in for the device and counts configure calls, the way the
	/// real agent's device would receive them.
	struct FakeDevice {
		configures: Arc<AtomicUsize>,
	}

	impl ConfigureDevice for FakeDevice {
		fn configure(&self, _update: DeviceUpdate) -> crate::driver::Result<()> {
			self.configures.fetch_add(1, Ordering::SeqCst);
			Ok(())
		}
	}

	fn peer(name: &str, self_link: &str) -> Peer {
		let mut peer = Peer::new("mesh", name);
		peer.metadata.self_link = self_link.to_string();
		peer.spec.public_key = Key::generate_private().get_public().to_base64();
		peer.spec.endpoint = "127.0.0.1:51820".to_string();
		peer
	}

	fn reconciler() -> (PeerReconciler, Arc<AtomicUsize>) {
		let configures = Arc::new(AtomicUsize::new(0));
		let device = FakeDevice {
			configures: Arc::clone(&configures),
		};
		let rec = PeerReconciler::with_device(Box::new(device), "/peers/self", None);
		(rec, configures)
	}

	#[test]
	fn events_before_initial_config_only_touch_the_map() {
		let (rec, configures) = reconciler();
		let a = peer("node-a", "/peers/node-a");
		let b = peer("node-b", "/peers/node-b");

		rec.on_added(&a);
		rec.on_updated(&b);
		let mut links = rec.tracked_self_links();
		links.sort();
		assert_eq!(links, vec!["/peers/node-a", "/peers/node-b"]);

		rec.on_deleted(&a);
		assert_eq!(rec.tracked_self_links(), vec!["/peers/node-b"]);
		assert_eq!(configures.load(Ordering::SeqCst), 0);
	}

	#[test]
	fn initial_config_is_one_bulk_configure() {
		let (rec, configures) = reconciler();
		rec.on_added(&peer("node-a", "/peers/node-a"));
		rec.on_added(&peer("node-b", "/peers/node-b"));

		rec.apply_initial_config().unwrap();
		assert_eq!(configures.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn each_post_sync_event_is_one_delta() {
		let (rec, configures) = reconciler();
		rec.apply_initial_config().unwrap();
		assert_eq!(configures.load(Ordering::SeqCst), 1);

		let mut a = peer("node-a", "/peers/node-a");
		rec.on_added(&a);
		assert_eq!(configures.load(Ordering::SeqCst), 2);

		a.spec.keepalive = 25;
		rec.on_updated(&a);
		assert_eq!(configures.load(Ordering::SeqCst), 3);

		// Identical spec is a no-op under the lock.
		rec.on_updated(&a);
		assert_eq!(configures.load(Ordering::SeqCst), 3);

		rec.on_deleted(&a);
		assert_eq!(configures.load(Ordering::SeqCst), 4);
		assert!(rec.tracked_self_links().is_empty());
	}

	#[test]
	fn bad_peer_does_not_block_initial_config() {
		let (rec, configures) = reconciler();
		let mut bad = peer("node-bad", "/peers/node-bad");
		bad.spec.public_key = "garbage".to_string();
		rec.on_added(&bad);
		rec.on_added(&peer("node-a", "/peers/node-a"));

		rec.apply_initial_config().unwrap();
		assert_eq!(configures.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn local_record_is_filtered_out() {
		let (rec, configures) = reconciler();
		let me = peer("node-self", "/peers/self");
		rec.on_added(&me);
		rec.on_updated(&me);
		assert!(rec.tracked_self_links().is_empty());
		assert_eq!(configures.load(Ordering::SeqCst), 0);
	}

	#[test]
	fn deleting_an_unknown_peer_is_a_noop() {
		let (rec, configures) = reconciler();
		rec.apply_initial_config().unwrap();
		let ghost = peer("ghost", "/peers/ghost");
		rec.on_deleted(&ghost);
		assert!(rec.tracked_self_links().is_empty());
		assert_eq!(configures.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn identical_update_is_deduplicated() {
		let (rec, _) = reconciler();
		let a = peer("node-a", "/peers/node-a");
		rec.on_added(&a);
		rec.on_updated(&a);
		assert_eq!(rec.tracked_self_links(), vec!["/peers/node-a"]);
	}

	#[test]
	fn translate_rejects_bad_public_key() {
		let mut bad = peer("node-a", "/peers/node-a");
		bad.spec.public_key = "definitely-not-a-key".to_string();
		let err = translate_peer(&bad, None).unwrap_err();
		assert!(matches!(err, TranslateError::InvalidPublicKey { .. }));
	}

	#[test]
	fn translate_reports_unresolvable_endpoint_with_input() {
		let mut bad = peer("node-a", "/peers/node-a");
		bad.spec.endpoint = "no port at all".to_string();
		let err = translate_peer(&bad, None).unwrap_err();
		assert!(err.to_string().contains("no port at all"));
	}

	#[test]
	fn translate_rejects_bad_cidr() {
		let mut bad = peer("node-a", "/peers/node-a");
		bad.spec.routes = vec!["10.0.0.0/99".to_string()];
		let err = translate_peer(&bad, None).unwrap_err();
		assert!(matches!(err, TranslateError::InvalidCidr { .. }));
	}

	#[test]
	fn translate_accepts_full_record() {
		let mut full = peer("node-a", "/peers/node-a");
		full.spec.preshared_key = Key::generate_preshared().to_base64();
		full.spec.ips = vec!["10.10.0.2/24".to_string()];
		full.spec.routes = vec!["192.168.50.0/24".to_string()];
		full.spec.keepalive = 25;
		translate_peer(&full, None).unwrap();
	}

	#[test]
	fn keepalive_values_translate() {
		let mut p = peer("node-a", "/peers/node-a");
		p.spec.keepalive = u32::from(u16::MAX) + 10;
		translate_peer(&p, None).unwrap();
		translate_peer(&p, Some(15)).unwrap();

		p.spec.keepalive = 0;
		translate_peer(&p, Some(15)).unwrap();
	}
}
