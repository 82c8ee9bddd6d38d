// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Address allocation against a shared `IpPool`. Correctness across agents
//! rests on the registry: claim names are deterministic, so two agents
//! racing for one address collide on create instead of both winning, and
//! releases are precondition-guarded so a reclaimed name is never deleted
//! by a stale owner.

use ipnet::IpNet;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::net::IpAddr;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use trellis_ipnet::{
	canonical, canonical_ip, compare, increment_with_wrap, random_in, range_end, range_start,
	AddrError,
};
use trellis_registry::{
	IpClaim, IpPool, OwnerReference, RegistryClient, RegistryError, Selector,
};

#[derive(Error, Debug)]
pub enum IpamError {
	#[error("no available IP addresses")]
	NoAvailableAddresses,

	#[error("parsing {field} {value:?}")]
	ParseAddr {
		field: &'static str,
		value: String,
	},

	#[error("{field} {value:?} was not contained by cidr {cidr:?}")]
	OutOfRange {
		field: &'static str,
		value: String,
		cidr: String,
	},

	#[error("invalid claim {name:?}: ip {ip:?}")]
	InvalidClaim { name: String, ip: String },

	#[error("creating claim {name:?}: {source}")]
	Claim {
		name: String,
		source: RegistryError,
	},

	#[error("cidr arithmetic: {0}")]
	Addr(#[from] AddrError),

	#[error(transparent)]
	Registry(#[from] RegistryError),
}

pub type Result<T> = std::result::Result<T, IpamError>;

/// Deterministic claim name for `(pool, ip)`: the address is lowercased and
/// every character that is not a lowercase hex digit becomes `-`.
pub fn claim_name(pool: &str, ip: &str) -> String {
	let mangled: String = ip
		.to_lowercase()
		.chars()
		.map(|c| match c {
			'0'..='9' | 'a'..='f' => c,
			_ => '-',
		})
		.collect();
	format!("{pool}-{mangled}")
}

#[derive(Debug)]
struct IpRange {
	cidr: IpNet,
	start: IpAddr,
	end: IpAddr,
}

#[derive(Debug)]
struct LoadedPool {
	/// `namespace:name`, used in messages only.
	name: String,
	in_use: HashSet<String>,
	ranges: Vec<IpRange>,
}

impl LoadedPool {
	/// Builds the in-memory pool from the registry records. Ranges come
	/// back in a freshly shuffled order so concurrent agents do not
	/// serialize on the same range. Also returns the claims already owned
	/// by `owner`.
	fn load(
		namespace: &str,
		pool: &IpPool,
		claims: &[IpClaim],
		owner: &OwnerReference,
	) -> Result<(Self, Vec<IpClaim>)> {
		let mut loaded = Self {
			name: format!("{namespace}:{}", pool.metadata.name),
			in_use: HashSet::new(),
			ranges: Vec::new(),
		};

		let mut order: Vec<usize> = (0..pool.spec.ip_ranges.len()).collect();
		order.shuffle(&mut StdRng::from_entropy());
		for index in order {
			let spec = &pool.spec.ip_ranges[index];
			loaded.ranges.push(parse_range(spec)?);
		}

		for reserved in &pool.spec.reserved {
			// User provided; parse and re-serialize in canonical form.
			let ip: IpAddr = reserved.parse().map_err(|_| IpamError::ParseAddr {
				field: "reserved ip",
				value: reserved.clone(),
			})?;
			loaded.in_use.insert(canonical_ip(ip).to_string());
		}

		let mut ours = Vec::new();
		for claim in claims {
			let ip: IpAddr = claim.spec.ip.parse().map_err(|_| IpamError::InvalidClaim {
				name: claim.metadata.name.clone(),
				ip: claim.spec.ip.clone(),
			})?;
			if claim
				.metadata
				.owner_references
				.iter()
				.any(|reference| reference.same_owner(owner))
			{
				ours.push(claim.clone());
			}
			loaded.in_use.insert(canonical_ip(ip).to_string());
		}

		Ok((loaded, ours))
	}

	fn mark_in_use(&mut self, ip: IpAddr) {
		self.in_use.insert(canonical_ip(ip).to_string());
	}

	/// Finds a free address: pick a random starting point in each range and
	/// walk forward (wrapping within the subnet) until an address is inside
	/// `[start, end]` and unused, or the walk returns to its origin.
	fn find_address(&self) -> Result<IpNet> {
		for range in &self.ranges {
			let first_try = random_in(&range.cidr)?;
			let mut current = first_try;
			loop {
				let ip = current.addr();
				let before_start = compare(&ip, &range.start) == Ordering::Less;
				let after_end = compare(&ip, &range.end) == Ordering::Greater;
				if !before_start && !after_end && !self.in_use.contains(&ip.to_string()) {
					return Ok(current);
				}
				current = increment_with_wrap(&current)?;
				if current.addr() == first_try.addr() {
					break; // range exhausted, try the next one
				}
			}
		}
		debug!(pool = %self.name, "all ranges exhausted");
		Err(IpamError::NoAvailableAddresses)
	}

	/// The range containing `ip`, used to rebuild the CIDR of a reused
	/// claim.
	fn range_containing(&self, ip: IpAddr) -> Option<&IpRange> {
		self.ranges.iter().find(|range| range.cidr.contains(&ip))
	}
}

fn parse_range(spec: &trellis_registry::IpRangeSpec) -> Result<IpRange> {
	let parsed: IpNet = spec.cidr.parse().map_err(|_| IpamError::ParseAddr {
		field: "ipv4.cidr",
		value: spec.cidr.clone(),
	})?;
	let cidr = canonical(parsed)?;

	let start = if spec.start.is_empty() {
		range_start(&cidr)?
	} else {
		let start: IpAddr = spec.start.parse().map_err(|_| IpamError::ParseAddr {
			field: "ipv4.start",
			value: spec.start.clone(),
		})?;
		let start = canonical_ip(start);
		if !cidr.contains(&start) {
			return Err(IpamError::OutOfRange {
				field: "ipv4.start",
				value: spec.start.clone(),
				cidr: cidr.to_string(),
			});
		}
		start
	};

	let end = if spec.end.is_empty() {
		range_end(&cidr)?
	} else {
		let end: IpAddr = spec.end.parse().map_err(|_| IpamError::ParseAddr {
			field: "ipv4.end",
			value: spec.end.clone(),
		})?;
		let end = canonical_ip(end);
		if !cidr.contains(&end) {
			return Err(IpamError::OutOfRange {
				field: "ipv4.end",
				value: spec.end.clone(),
				cidr: cidr.to_string(),
			});
		}
		end
	};

	Ok(IpRange { cidr, start, end })
}

/// Claims `count` addresses from the named pool on behalf of `owner`.
/// Existing claims owned by the caller are reused first; surplus claims are
/// released with a precondition-guarded delete. Every returned CIDR has a
/// persisted claim whose owner references match `owner`.
#[instrument(skip(client, owner), fields(owner = %owner.name))]
pub async fn claim_ips(
	client: &RegistryClient,
	namespace: &str,
	pool_name: &str,
	owner: &OwnerReference,
	mut count: usize,
) -> Result<Vec<IpNet>> {
	let pool_record: IpPool = client.get(namespace, pool_name).await?;
	let claims: Vec<IpClaim> = client.list(namespace, &Selector::everything()).await?;
	let (mut pool, our_claims) = LoadedPool::load(namespace, &pool_record, &claims, owner)?;

	let mut out = Vec::new();

	for claim in our_claims {
		let reused = count > 0 && reuse_claim(&pool, &claim, &mut out)?;
		if reused {
			count -= 1;
			continue;
		}
		// Surplus (or unusable): release it. The delete is guarded by the
		// claim's uid so a reissued claim of the same name survives.
		debug!(claim = %claim.metadata.name, "releasing surplus claim");
		match client
			.delete::<IpClaim>(namespace, &claim.metadata.name, Some(&claim.metadata.uid))
			.await
		{
			Ok(()) => {}
			Err(err) if err.is_not_found() => {}
			Err(err) => return Err(err.into()),
		}
	}

	while count > 0 {
		let addr = pool.find_address()?;
		let ip = addr.addr();
		let name = claim_name(pool_name, &ip.to_string());

		let mut claim = IpClaim::new(namespace, &name);
		claim.metadata.owner_references = vec![owner.clone()];
		claim.spec.ip = ip.to_string();

		match client.create(&claim).await {
			Ok(_) => {
				info!(claim = %name, address = %addr, "claimed address");
				pool.mark_in_use(ip);
				out.push(addr);
				count -= 1;
			}
			Err(err) if err.is_already_exists() || err.is_conflict() => {
				// Another agent beat us to this address; skip it locally
				// and pick again.
				warn!(claim = %name, "lost claim race, retrying");
				pool.mark_in_use(ip);
			}
			Err(source) => return Err(IpamError::Claim { name, source }),
		}
	}

	Ok(out)
}

/// Appends the claim's address to `out` if it still falls inside the pool.
/// Returns false when the pool no longer covers it, so the caller releases
/// it instead.
fn reuse_claim(pool: &LoadedPool, claim: &IpClaim, out: &mut Vec<IpNet>) -> Result<bool> {
	let ip: IpAddr = claim.spec.ip.parse().map_err(|_| IpamError::InvalidClaim {
		name: claim.metadata.name.clone(),
		ip: claim.spec.ip.clone(),
	})?;
	let ip = canonical_ip(ip);
	let Some(range) = pool.range_containing(ip) else {
		warn!(claim = %claim.metadata.name, %ip, "claim no longer covered by any pool range");
		return Ok(false);
	};
	match IpNet::new(ip, range.cidr.prefix_len()) {
		Ok(net) => {
			out.push(net);
			Ok(true)
		}
		Err(_) => Ok(false),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use trellis_registry::{IpPoolSpec, IpRangeSpec, Peer};

	fn range(cidr: &str, start: &str, end: &str) -> IpRange {
		IpRange {
			cidr: canonical(cidr.parse().unwrap()).unwrap(),
			start: start.parse().unwrap(),
			end: end.parse().unwrap(),
		}
	}

	fn pool_with(ranges: Vec<IpRange>, in_use: &[&str]) -> LoadedPool {
		LoadedPool {
			name: "ns:pool".to_string(),
			in_use: in_use.iter().map(|s| s.to_string()).collect(),
			ranges,
		}
	}

	fn owner() -> OwnerReference {
		let mut peer = Peer::new("ns", "node-a");
		peer.metadata.uid = "uid-a".to_string();
		peer.owner_reference()
	}

	#[test]
	fn find_address_single_range() {
		let pool = pool_with(
			vec![range("10.0.0.0/30", "10.0.0.1", "10.0.0.2")],
			&["10.0.0.2"],
		);
		let got = pool.find_address().unwrap();
		assert_eq!(got.addr(), "10.0.0.1".parse::<IpAddr>().unwrap());
		assert_eq!(got.prefix_len(), 30);
	}

	#[test]
	fn find_address_slash_thirty_one() {
		let pool = pool_with(
			vec![range("10.0.0.0/31", "10.0.0.0", "10.0.0.1")],
			&["10.0.0.1"],
		);
		let got = pool.find_address().unwrap();
		assert_eq!(got.addr(), "10.0.0.0".parse::<IpAddr>().unwrap());
		assert_eq!(got.prefix_len(), 31);
	}

	#[test]
	fn find_address_spills_into_second_range() {
		let pool = pool_with(
			vec![
				range("10.0.0.0/31", "10.0.0.0", "10.0.0.1"),
				range("10.0.1.0/31", "10.0.1.0", "10.0.1.1"),
			],
			&["10.0.0.0", "10.0.0.1", "10.0.1.1"],
		);
		let got = pool.find_address().unwrap();
		assert_eq!(got.addr(), "10.0.1.0".parse::<IpAddr>().unwrap());
	}

	#[test]
	fn find_address_exhausted() {
		let pool = pool_with(
			vec![
				range("10.0.0.0/31", "10.0.0.0", "10.0.0.1"),
				range("10.0.1.0/31", "10.0.1.0", "10.0.1.1"),
			],
			&["10.0.0.0", "10.0.0.1", "10.0.1.0", "10.0.1.1"],
		);
		assert!(matches!(
			pool.find_address(),
			Err(IpamError::NoAvailableAddresses)
		));
	}

	#[test]
	fn find_address_honors_start_and_end() {
		// Only .66 through .75 are assignable out of a /28.
		let pool = pool_with(vec![range("10.1.2.64/28", "10.1.2.66", "10.1.2.75")], &[]);
		for _ in 0..32 {
			let got = pool.find_address().unwrap();
			let ip = got.addr();
			assert_ne!(compare(&ip, &"10.1.2.66".parse().unwrap()), Ordering::Less);
			assert_ne!(
				compare(&ip, &"10.1.2.75".parse().unwrap()),
				Ordering::Greater
			);
		}
	}

	fn pool_record(ranges: Vec<IpRangeSpec>, reserved: Vec<&str>) -> IpPool {
		let mut pool = IpPool::new("ns", "pool");
		pool.spec = IpPoolSpec {
			ip_ranges: ranges,
			reserved: reserved.into_iter().map(String::from).collect(),
		};
		pool
	}

	fn claim_record(pool: &str, ip: &str, owner: Option<&OwnerReference>) -> IpClaim {
		let mut claim = IpClaim::new("ns", &claim_name(pool, ip));
		claim.metadata.uid = format!("uid-{ip}");
		claim.spec.ip = ip.to_string();
		if let Some(owner) = owner {
			claim.metadata.owner_references = vec![owner.clone()];
		}
		claim
	}

	#[test]
	fn load_seeds_in_use_from_reserved_and_claims() {
		let record = pool_record(
			vec![IpRangeSpec {
				cidr: "192.168.1.0/24".to_string(),
				..IpRangeSpec::default()
			}],
			vec!["192.168.1.1"],
		);
		let claims = vec![claim_record("pool", "192.168.1.2", None)];
		let (pool, ours) = LoadedPool::load("ns", &record, &claims, &owner()).unwrap();

		assert_eq!(pool.name, "ns:pool");
		assert!(pool.in_use.contains("192.168.1.1"));
		assert!(pool.in_use.contains("192.168.1.2"));
		assert_eq!(pool.in_use.len(), 2);
		assert!(ours.is_empty());

		assert_eq!(pool.ranges.len(), 1);
		assert_eq!(pool.ranges[0].start, "192.168.1.1".parse::<IpAddr>().unwrap());
		assert_eq!(pool.ranges[0].end, "192.168.1.254".parse::<IpAddr>().unwrap());
	}

	#[test]
	fn load_recognizes_our_claims() {
		let me = owner();
		let record = pool_record(
			vec![IpRangeSpec {
				cidr: "192.168.1.0/24".to_string(),
				..IpRangeSpec::default()
			}],
			vec![],
		);
		let claims = vec![
			claim_record("pool", "192.168.1.2", Some(&me)),
			claim_record("pool", "192.168.1.3", None),
		];
		let (_, ours) = LoadedPool::load("ns", &record, &claims, &me).unwrap();
		assert_eq!(ours.len(), 1);
		assert_eq!(ours[0].spec.ip, "192.168.1.2");
	}

	#[test]
	fn load_parses_explicit_bounds() {
		let record = pool_record(
			vec![
				IpRangeSpec {
					cidr: "192.168.1.0/24".to_string(),
					..IpRangeSpec::default()
				},
				IpRangeSpec {
					cidr: "10.1.2.64/28".to_string(),
					start: "10.1.2.66".to_string(),
					end: "10.1.2.75".to_string(),
				},
			],
			vec![],
		);
		let (pool, _) = LoadedPool::load("ns", &record, &[], &owner()).unwrap();
		assert_eq!(pool.ranges.len(), 2);
		// Order is shuffled; look the small range up by cidr.
		let small = pool
			.ranges
			.iter()
			.find(|r| r.cidr.to_string() == "10.1.2.64/28")
			.unwrap();
		assert_eq!(small.start, "10.1.2.66".parse::<IpAddr>().unwrap());
		assert_eq!(small.end, "10.1.2.75".parse::<IpAddr>().unwrap());
	}

	#[test]
	fn load_rejects_start_outside_cidr() {
		let record = pool_record(
			vec![IpRangeSpec {
				cidr: "192.168.1.0/24".to_string(),
				start: "192.168.5.1".to_string(),
				..IpRangeSpec::default()
			}],
			vec![],
		);
		let err = LoadedPool::load("ns", &record, &[], &owner()).unwrap_err();
		assert_eq!(
			err.to_string(),
			r#"ipv4.start "192.168.5.1" was not contained by cidr "192.168.1.0/24""#
		);
	}

	#[test]
	fn load_rejects_end_outside_cidr() {
		let record = pool_record(
			vec![IpRangeSpec {
				cidr: "192.168.1.0/24".to_string(),
				end: "192.168.5.1".to_string(),
				..IpRangeSpec::default()
			}],
			vec![],
		);
		let err = LoadedPool::load("ns", &record, &[], &owner()).unwrap_err();
		assert!(err.to_string().contains("ipv4.end"));
		assert!(err.to_string().contains("192.168.1.0/24"));
	}

	#[test]
	fn claim_names_are_deterministic() {
		assert_eq!(claim_name("pool", "10.0.0.1"), claim_name("pool", "10.0.0.1"));
		assert_eq!(claim_name("pool", "10.0.0.1"), "pool-10-0-0-1");
		assert_eq!(claim_name("pool", "FE80::1"), "pool-fe80--1");
	}

	#[test]
	fn reuse_claim_rebuilds_cidr_from_range() {
		let pool = pool_with(vec![range("10.0.0.0/30", "10.0.0.1", "10.0.0.2")], &[]);
		let claim = claim_record("pool", "10.0.0.1", None);
		let mut out = Vec::new();
		assert!(reuse_claim(&pool, &claim, &mut out).unwrap());
		assert_eq!(out, vec!["10.0.0.1/30".parse::<IpNet>().unwrap()]);
	}

	#[test]
	fn reuse_claim_rejects_uncovered_address() {
		let pool = pool_with(vec![range("10.0.0.0/30", "10.0.0.1", "10.0.0.2")], &[]);
		let claim = claim_record("pool", "172.16.0.1", None);
		let mut out = Vec::new();
		assert!(!reuse_claim(&pool, &claim, &mut out).unwrap());
		assert!(out.is_empty());
	}
}
