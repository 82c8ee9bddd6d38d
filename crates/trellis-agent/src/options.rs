// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::driver::InterfaceOptions;
use std::collections::BTreeMap;
use std::path::PathBuf;
use trellis_registry::{RegistryConfig, Selector};

/// Everything the agent needs to run. The CLI populates this from flags;
/// defaults match a bare `trellis agent` invocation on a typical host.
#[derive(Debug, Clone)]
pub struct AgentOptions {
	/// Peer name; unique within the registry namespace.
	pub name: String,
	/// `host[:port]` other peers dial. An omitted port is substituted with
	/// the driver-assigned listen port after the interface is up.
	pub endpoint_addr: String,
	/// Keep-alive interval advertised on the self record and used as the
	/// local cap on peer-advertised values. 0 disables.
	pub keepalive_seconds: u32,
	pub labels: BTreeMap<String, String>,
	pub peer_selector: Selector,
	/// CIDRs assigned to the tunnel interface.
	pub ips: Vec<String>,
	/// CIDRs this node offers to route for its peers.
	pub offer_routes: Vec<String>,
	/// Pool to claim additional addresses from, if any.
	pub ip_pool: Option<String>,
	pub ip_pool_count: usize,
	/// Persist the device private key here and reuse it across restarts;
	/// `None` generates a fresh key every start.
	pub private_key_file: Option<PathBuf>,
	pub registry: RegistryConfig,
	/// Overrides the namespace from the registry config.
	pub registry_namespace: Option<String>,
	pub interface: InterfaceOptions,
}

impl AgentOptions {
	pub fn new(name: &str, endpoint_addr: &str, registry: RegistryConfig) -> Self {
		Self {
			name: name.to_string(),
			endpoint_addr: endpoint_addr.to_string(),
			keepalive_seconds: 0,
			labels: BTreeMap::new(),
			peer_selector: Selector::everything(),
			ips: Vec::new(),
			offer_routes: Vec::new(),
			ip_pool: None,
			ip_pool_count: 1,
			private_key_file: None,
			registry,
			registry_namespace: None,
			interface: InterfaceOptions::default(),
		}
	}

	pub fn namespace(&self) -> &str {
		self
			.registry_namespace
			.as_deref()
			.unwrap_or(&self.registry.namespace)
	}
}

/// Peer names are DNS-1123 subdomains: dot-separated labels of lowercase
/// alphanumerics and dashes, at most 253 characters in total.
pub fn validate_node_name(name: &str) -> Result<(), String> {
	if name.is_empty() {
		return Err("name is empty".to_string());
	}
	if name.len() > 253 {
		return Err(format!("name may be at most 253 characters; got {}", name.len()));
	}
	for label in name.split('.') {
		if label.is_empty() {
			return Err(format!("name {name:?} contains an empty label"));
		}
		if !label
			.chars()
			.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
		{
			return Err(format!(
				"name {name:?} must consist of lowercase alphanumeric characters, '-' and '.'"
			));
		}
		if label.starts_with('-') || label.ends_with('-') {
			return Err(format!(
				"name {name:?} labels must start and end with an alphanumeric character"
			));
		}
	}
	Ok(())
}

/// Splits an endpoint into host and optional port. Accepts `host`,
/// `host:port`, `host:` (driver-assigned port), `[v6]:port`, `[v6]` and a
/// bare IPv6 literal. Port `0` reads as "driver-assigned".
pub fn split_endpoint(endpoint: &str) -> Result<(String, Option<u16>), String> {
	if endpoint.is_empty() {
		return Err("endpoint is empty".to_string());
	}
	if let Some(rest) = endpoint.strip_prefix('[') {
		let (host, after) = rest
			.split_once(']')
			.ok_or_else(|| format!("endpoint {endpoint:?} has an unmatched '['"))?;
		if host.is_empty() {
			return Err(format!("endpoint {endpoint:?} has an empty host"));
		}
		return match after.strip_prefix(':') {
			None if after.is_empty() => Ok((host.to_string(), None)),
			Some("") => Ok((host.to_string(), None)),
			Some(port) => Ok((host.to_string(), parse_port(endpoint, port)?)),
			None => Err(format!("endpoint {endpoint:?} has trailing characters after ']'")),
		};
	}
	match endpoint.rsplit_once(':') {
		// More than one ':' without brackets is a bare IPv6 literal.
		Some((host, _)) if host.contains(':') => Ok((endpoint.to_string(), None)),
		Some((host, port)) if host.is_empty() => {
			Err(format!("endpoint {endpoint:?} has an empty host (port {port:?})"))
		}
		Some((host, "")) => Ok((host.to_string(), None)),
		Some((host, port)) => Ok((host.to_string(), parse_port(endpoint, port)?)),
		None => Ok((endpoint.to_string(), None)),
	}
}

fn parse_port(endpoint: &str, port: &str) -> Result<Option<u16>, String> {
	let port: u16 = port
		.parse()
		.map_err(|_| format!("endpoint {endpoint:?} has an invalid port {port:?}"))?;
	Ok((port != 0).then_some(port))
}

/// Joins host and port back into dialable form, bracketing IPv6 literals.
pub fn join_endpoint(host: &str, port: u16) -> String {
	if host.contains(':') {
		format!("[{host}]:{port}")
	} else {
		format!("{host}:{port}")
	}
}

/// Checks that every entry parses as a CIDR (an address with an explicit
/// prefix length).
pub fn validate_cidr_list(values: &[String]) -> Result<(), String> {
	for value in values {
		if !value.contains('/') {
			return Err(format!("{value:?} is missing a prefix length"));
		}
		value
			.parse::<ipnet::IpNet>()
			.map_err(|err| format!("invalid cidr {value:?}: {err}"))?;
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn node_names() {
		assert!(validate_node_name("node-a").is_ok());
		assert!(validate_node_name("node-a.example.com").is_ok());
		assert!(validate_node_name("").is_err());
		assert!(validate_node_name("Node").is_err());
		assert!(validate_node_name("node_a").is_err());
		assert!(validate_node_name("-node").is_err());
		assert!(validate_node_name("node.").is_err());
		assert!(validate_node_name(&"a".repeat(254)).is_err());
	}

	#[test]
	fn endpoint_splitting() {
		assert_eq!(
			split_endpoint("host.example.com:51820").unwrap(),
			("host.example.com".to_string(), Some(51820))
		);
		assert_eq!(
			split_endpoint("host.example.com:").unwrap(),
			("host.example.com".to_string(), None)
		);
		assert_eq!(
			split_endpoint("host.example.com").unwrap(),
			("host.example.com".to_string(), None)
		);
		assert_eq!(
			split_endpoint("host.example.com:0").unwrap(),
			("host.example.com".to_string(), None)
		);
		assert_eq!(
			split_endpoint("[fe80::1]:51820").unwrap(),
			("fe80::1".to_string(), Some(51820))
		);
		assert_eq!(
			split_endpoint("[fe80::1]").unwrap(),
			("fe80::1".to_string(), None)
		);
		assert_eq!(
			split_endpoint("fe80::1").unwrap(),
			("fe80::1".to_string(), None)
		);
		assert!(split_endpoint("").is_err());
		assert!(split_endpoint(":51820").is_err());
		assert!(split_endpoint("host:port").is_err());
		assert!(split_endpoint("[fe80::1").is_err());
	}

	#[test]
	fn endpoint_joining() {
		assert_eq!(join_endpoint("host.example.com", 51820), "host.example.com:51820");
		assert_eq!(join_endpoint("fe80::1", 51820), "[fe80::1]:51820");
	}

	#[test]
	fn cidr_lists() {
		assert!(validate_cidr_list(&["10.0.0.1/24".to_string()]).is_ok());
		assert!(validate_cidr_list(&["fd00::1/64".to_string()]).is_ok());
		assert!(validate_cidr_list(&["10.0.0.1".to_string()]).is_err());
		assert!(validate_cidr_list(&["10.0.0.1/33".to_string()]).is_err());
	}

	#[test]
	fn namespace_override() {
		let registry = RegistryConfig::new("https://registry.example.com".parse().unwrap());
		let mut options = AgentOptions::new("node-a", "node-a.example.com", registry);
		assert_eq!(options.namespace(), "default");
		options.registry_namespace = Some("mesh".to_string());
		assert_eq!(options.namespace(), "mesh");
	}
}
