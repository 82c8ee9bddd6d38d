// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Group/version every object in this registry carries.
pub const API_VERSION: &str = "trellis.dev/v1alpha1";

/// Common metadata block shared by every registry object. `uid`,
/// `self_link` and `resource_version` are assigned by the registry and
/// empty on objects built locally.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectMeta {
	pub namespace: String,
	pub name: String,
	#[serde(skip_serializing_if = "String::is_empty")]
	pub uid: String,
	#[serde(skip_serializing_if = "BTreeMap::is_empty")]
	pub labels: BTreeMap<String, String>,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub owner_references: Vec<OwnerReference>,
	#[serde(skip_serializing_if = "String::is_empty")]
	pub self_link: String,
	#[serde(skip_serializing_if = "String::is_empty")]
	pub resource_version: String,
}

/// Reference to the object that owns another object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OwnerReference {
	pub api_version: String,
	pub kind: String,
	pub name: String,
	#[serde(skip_serializing_if = "String::is_empty")]
	pub uid: String,
}

impl OwnerReference {
	/// Ownership identity is the (apiVersion, kind, name) triple; the uid is
	/// informational.
	pub fn same_owner(&self, other: &OwnerReference) -> bool {
		self.name == other.name
			&& self.api_version == other.api_version
			&& self.kind == other.kind
	}
}

/// An object kind the registry can store. `PLURAL` is the collection
/// segment in resource paths.
pub trait RegistryObject:
	Serialize + DeserializeOwned + Clone + Send + Sync + 'static
{
	const KIND: &'static str;
	const PLURAL: &'static str;

	fn metadata(&self) -> &ObjectMeta;
	fn metadata_mut(&mut self) -> &mut ObjectMeta;
}

/// Wire shape of a `list` response.
#[derive(Debug, Clone, Deserialize)]
#[serde(bound(deserialize = "T: DeserializeOwned"))]
pub struct ObjectList<T> {
	#[serde(default)]
	pub items: Vec<T>,
}

macro_rules! registry_object {
	($object:ident, $spec:ident, $kind:literal, $plural:literal) => {
		#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
		#[serde(rename_all = "camelCase", default)]
		pub struct $object {
			#[serde(skip_serializing_if = "String::is_empty")]
			pub api_version: String,
			#[serde(skip_serializing_if = "String::is_empty")]
			pub kind: String,
			pub metadata: ObjectMeta,
			pub spec: $spec,
		}

		impl $object {
			pub fn new(namespace: &str, name: &str) -> Self {
				Self {
					api_version: API_VERSION.to_string(),
					kind: $kind.to_string(),
					metadata: ObjectMeta {
						namespace: namespace.to_string(),
						name: name.to_string(),
						..ObjectMeta::default()
					},
					spec: $spec::default(),
				}
			}

			/// A reference other objects use to mark this object as their
			/// owner.
			pub fn owner_reference(&self) -> OwnerReference {
				OwnerReference {
					api_version: API_VERSION.to_string(),
					kind: $kind.to_string(),
					name: self.metadata.name.clone(),
					uid: self.metadata.uid.clone(),
				}
			}
		}

		impl RegistryObject for $object {
			const KIND: &'static str = $kind;
			const PLURAL: &'static str = $plural;

			fn metadata(&self) -> &ObjectMeta {
				&self.metadata
			}

			fn metadata_mut(&mut self) -> &mut ObjectMeta {
				&mut self.metadata
			}
		}
	};
}

registry_object!(Peer, PeerSpec, "Peer", "peers");
registry_object!(IpPool, IpPoolSpec, "IpPool", "ippools");
registry_object!(IpClaim, IpClaimSpec, "IpClaim", "ipclaims");

/// Everything another node needs to establish connectivity with a peer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PeerSpec {
	/// `host:port` other peers dial; host may be a DNS name or a literal
	/// address.
	pub endpoint: String,
	/// base64 of the 32-byte Curve25519 public key.
	pub public_key: String,
	/// base64 of the 32-byte pre-shared key.
	pub preshared_key: String,
	/// CIDRs assigned to the peer's tunnel interface.
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub ips: Vec<String>,
	/// CIDRs this peer accepts traffic for.
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub routes: Vec<String>,
	/// Keep-alive interval in seconds; 0 disables keep-alives. For each
	/// pair of peers the lower of the two values wins.
	#[serde(skip_serializing_if = "is_zero")]
	pub keepalive: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IpPoolSpec {
	/// Ranges available for allocation. Overlapping ranges are allowed; an
	/// address is claimed at most once per pool regardless of how many
	/// ranges contain it.
	pub ip_ranges: Vec<IpRangeSpec>,
	/// Individual addresses that must never be assigned.
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub reserved: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IpRangeSpec {
	pub cidr: String,
	/// First assignable address; defaults to the start of the subnet
	/// (skipping the IPv4 network address for subnets larger than /31).
	#[serde(skip_serializing_if = "String::is_empty")]
	pub start: String,
	/// Last assignable address; defaults to the end of the subnet (skipping
	/// the IPv4 broadcast address for subnets larger than /31).
	#[serde(skip_serializing_if = "String::is_empty")]
	pub end: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IpClaimSpec {
	pub ip: String,
}

fn is_zero(n: &u32) -> bool {
	*n == 0
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn peer_serde_round_trip() {
		let mut peer = Peer::new("mesh", "node-a");
		peer.spec = PeerSpec {
			endpoint: "node-a.example.com:51820".to_string(),
			public_key: "pk".to_string(),
			preshared_key: "psk".to_string(),
			ips: vec!["10.10.0.1/24".to_string()],
			routes: vec!["192.168.50.0/24".to_string()],
			keepalive: 25,
		};
		let json = serde_json::to_string(&peer).unwrap();
		let back: Peer = serde_json::from_str(&json).unwrap();
		assert_eq!(back, peer);
	}

	#[test]
	fn peer_spec_uses_camel_case_keys() {
		let mut peer = Peer::new("mesh", "node-a");
		peer.spec.public_key = "pk".to_string();
		peer.spec.preshared_key = "psk".to_string();
		let json = serde_json::to_value(&peer).unwrap();
		assert_eq!(json["apiVersion"], API_VERSION);
		assert_eq!(json["spec"]["publicKey"], "pk");
		assert_eq!(json["spec"]["presharedKey"], "psk");
		assert!(json["spec"].get("keepalive").is_none(), "zero is omitted");
	}

	#[test]
	fn pool_deserializes_with_optional_bounds() {
		let json = r#"{
			"metadata": {"namespace": "mesh", "name": "pool"},
			"spec": {
				"ipRanges": [
					{"cidr": "10.0.0.0/24"},
					{"cidr": "10.1.2.64/28", "start": "10.1.2.66", "end": "10.1.2.75"}
				],
				"reserved": ["10.0.0.7"]
			}
		}"#;
		let pool: IpPool = serde_json::from_str(json).unwrap();
		assert_eq!(pool.spec.ip_ranges.len(), 2);
		assert_eq!(pool.spec.ip_ranges[0].start, "");
		assert_eq!(pool.spec.ip_ranges[1].end, "10.1.2.75");
		assert_eq!(pool.spec.reserved, vec!["10.0.0.7".to_string()]);
	}

	#[test]
	fn owner_reference_identity_ignores_uid() {
		let mut peer = Peer::new("mesh", "node-a");
		peer.metadata.uid = "uid-1".to_string();
		let a = peer.owner_reference();
		peer.metadata.uid = "uid-2".to_string();
		let b = peer.owner_reference();
		assert!(a.same_owner(&b));

		let other = Peer::new("mesh", "node-b").owner_reference();
		assert!(!a.same_owner(&other));
	}
}
