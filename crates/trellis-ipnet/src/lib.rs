// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Address arithmetic shared by the IPAM allocator and the interface layer.
//!
//! All operations work on canonical networks: 4-byte addresses for anything
//! that is IPv4 (including IPv4 networks spelled in IPv4-mapped IPv6 form)
//! and 16-byte addresses otherwise. A network value keeps its host bits, so
//! `10.0.0.5/24` and `10.0.0.0/24` are distinct values over the same subnet.

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use rand::rngs::OsRng;
use rand::RngCore;
use std::cmp::Ordering;
use std::net::IpAddr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AddrError {
	#[error("cidr {0} includes both IPv4 and IPv6 space")]
	MixedAddressFamily(IpNet),

	#[error("invalid prefix length: {0}")]
	PrefixLen(#[from] ipnet::PrefixLenError),
}

pub type Result<T> = std::result::Result<T, AddrError>;

/// Rewrites `net` into canonical form. IPv4 networks pass through; an
/// IPv4-mapped IPv6 network (`::ffff:0:0/96` space) must have a prefix of at
/// least 96 and is stripped to its 4-byte equivalent with the prefix reduced
/// by 96. Anything else stays 16-byte IPv6.
pub fn canonical(net: IpNet) -> Result<IpNet> {
	match net {
		IpNet::V4(_) => Ok(net),
		IpNet::V6(v6) => match v6.addr().to_ipv4_mapped() {
			Some(v4) => {
				if v6.prefix_len() < 96 {
					return Err(AddrError::MixedAddressFamily(net));
				}
				Ok(Ipv4Net::new(v4, v6.prefix_len() - 96)?.into())
			}
			None => Ok(net),
		},
	}
}

/// Rewrites a bare address into canonical form, collapsing IPv4-mapped IPv6.
pub fn canonical_ip(ip: IpAddr) -> IpAddr {
	ip.to_canonical()
}

/// First assignable address of the network. IPv4 subnets larger than /30
/// implicitly reserve the network address, so the range starts one past it.
pub fn range_start(net: &IpNet) -> Result<IpAddr> {
	match canonical(*net)? {
		IpNet::V4(v4) => {
			let network = u32::from(v4.network());
			if v4.prefix_len() <= 30 {
				Ok(IpAddr::V4((network + 1).into()))
			} else {
				Ok(IpAddr::V4(network.into()))
			}
		}
		IpNet::V6(v6) => Ok(IpAddr::V6(v6.network())),
	}
}

/// Last assignable address of the network. IPv4 subnets larger than /30
/// implicitly reserve the broadcast address, so the range ends one short of
/// it. IPv6 has no broadcast reservation.
pub fn range_end(net: &IpNet) -> Result<IpAddr> {
	match canonical(*net)? {
		IpNet::V4(v4) => {
			let broadcast = u32::from(v4.broadcast());
			if v4.prefix_len() <= 30 {
				Ok(IpAddr::V4((broadcast - 1).into()))
			} else {
				Ok(IpAddr::V4(broadcast.into()))
			}
		}
		IpNet::V6(v6) => Ok(IpAddr::V6(v6.broadcast())),
	}
}

/// Picks a uniformly random address inside the network, keeping the mask.
/// Entropy comes from the operating system.
pub fn random_in(net: &IpNet) -> Result<IpNet> {
	match canonical(*net)? {
		IpNet::V4(v4) => {
			let mask = u32::from(v4.netmask());
			let host = OsRng.next_u32() & !mask;
			let addr = u32::from(v4.network()) | host;
			Ok(Ipv4Net::new(addr.into(), v4.prefix_len())?.into())
		}
		IpNet::V6(v6) => {
			let mut bytes = [0u8; 16];
			OsRng.fill_bytes(&mut bytes);
			let mask = u128::from(v6.netmask());
			let host = u128::from_be_bytes(bytes) & !mask;
			let addr = u128::from(v6.network()) | host;
			Ok(Ipv6Net::new(addr.into(), v6.prefix_len())?.into())
		}
	}
}

/// Bumps the address by one, wrapping within the network: when the host bits
/// roll over, the result is the network's zero address again. The network
/// portion is always preserved.
pub fn increment_with_wrap(net: &IpNet) -> Result<IpNet> {
	match canonical(*net)? {
		IpNet::V4(v4) => {
			let mask = u32::from(v4.netmask());
			let host = u32::from(v4.addr()).wrapping_add(1) & !mask;
			let addr = u32::from(v4.network()) | host;
			Ok(Ipv4Net::new(addr.into(), v4.prefix_len())?.into())
		}
		IpNet::V6(v6) => {
			let mask = u128::from(v6.netmask());
			let host = u128::from(v6.addr()).wrapping_add(1) & !mask;
			let addr = u128::from(v6.network()) | host;
			Ok(Ipv6Net::new(addr.into(), v6.prefix_len())?.into())
		}
	}
}

/// Total-order comparison of two addresses. Mixed families are widened
/// through the IPv4-mapped IPv6 form, so `192.168.1.1` and
/// `::ffff:192.168.1.1` compare equal.
pub fn compare(a: &IpAddr, b: &IpAddr) -> Ordering {
	widen(a).cmp(&widen(b))
}

fn widen(ip: &IpAddr) -> u128 {
	match ip {
		IpAddr::V4(v4) => u128::from(v4.to_ipv6_mapped()),
		IpAddr::V6(v6) => u128::from(*v6),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::net::{Ipv4Addr, Ipv6Addr};

	fn net(s: &str) -> IpNet {
		s.parse().unwrap()
	}

	fn ip(s: &str) -> IpAddr {
		s.parse().unwrap()
	}

	#[test]
	fn canonical_ipv4_passes_through() {
		let out = canonical(net("192.168.1.0/28")).unwrap();
		assert_eq!(out, net("192.168.1.0/28"));
		assert!(matches!(out, IpNet::V4(_)));
	}

	#[test]
	fn canonical_ipv6_passes_through() {
		let out = canonical(net("fe80::/10")).unwrap();
		assert!(matches!(out, IpNet::V6(_)));
		assert_eq!(out.prefix_len(), 10);
	}

	#[test]
	fn canonical_strips_ipv4_mapped() {
		// ::ffff:c0a8:100/124 is 192.168.1.0/28 in IPv6 clothing.
		let out = canonical(net("::ffff:c0a8:100/124")).unwrap();
		match out {
			IpNet::V4(v4) => {
				assert_eq!(v4.addr(), Ipv4Addr::new(192, 168, 1, 0));
				assert_eq!(v4.prefix_len(), 28);
				assert_eq!(v4.max_prefix_len(), 32);
			}
			IpNet::V6(_) => panic!("expected an IPv4 network"),
		}
	}

	#[test]
	fn canonical_rejects_mixed_family() {
		let err = canonical(net("::ffff:0:0/95")).unwrap_err();
		assert!(matches!(err, AddrError::MixedAddressFamily(_)));
	}

	#[test]
	fn range_defaults_slash_25() {
		let n = net("192.168.1.0/25");
		assert_eq!(range_start(&n).unwrap(), ip("192.168.1.1"));
		assert_eq!(range_end(&n).unwrap(), ip("192.168.1.126"));
	}

	#[test]
	fn range_defaults_slash_31() {
		let n = net("10.0.0.0/31");
		assert_eq!(range_start(&n).unwrap(), ip("10.0.0.0"));
		assert_eq!(range_end(&n).unwrap(), ip("10.0.0.1"));
	}

	#[test]
	fn range_defaults_ipv6_no_reservation() {
		let n = net("fe80::/10");
		assert_eq!(range_start(&n).unwrap(), ip("fe80::"));
		assert_eq!(
			range_end(&n).unwrap(),
			ip("febf:ffff:ffff:ffff:ffff:ffff:ffff:ffff")
		);
	}

	#[test]
	fn range_defaults_ipv4_mapped() {
		// ::ffff:c0a8:100/121 is 192.168.1.0/25.
		let n = net("::ffff:c0a8:100/121");
		assert_eq!(range_start(&n).unwrap(), ip("192.168.1.1"));
		assert_eq!(range_end(&n).unwrap(), ip("192.168.1.126"));
	}

	#[test]
	fn range_bounds_are_inside_the_network() {
		for s in ["10.1.2.64/28", "192.0.2.0/24", "fd00::/64", "10.0.0.0/31"] {
			let n = net(s);
			let start = range_start(&n).unwrap();
			let end = range_end(&n).unwrap();
			assert!(canonical(n).unwrap().contains(&start), "{s} start");
			assert!(canonical(n).unwrap().contains(&end), "{s} end");
			assert_ne!(compare(&start, &end), Ordering::Greater, "{s} order");
		}
	}

	#[test]
	fn random_in_stays_inside_and_keeps_mask() {
		for s in ["192.168.1.0/24", "192.168.1.0/28", "fe80::/64"] {
			let n = canonical(net(s)).unwrap();
			for _ in 0..32 {
				let out = random_in(&n).unwrap();
				assert_eq!(out.prefix_len(), n.prefix_len(), "{s} mask");
				assert!(n.contains(&out.addr()), "{s} contains {out}");
			}
		}
	}

	#[test]
	fn increment_simple() {
		let out = increment_with_wrap(&net("192.168.1.1/24")).unwrap();
		assert_eq!(out, net("192.168.1.2/24"));
	}

	#[test]
	fn increment_rollover() {
		let out = increment_with_wrap(&net("192.168.1.255/24")).unwrap();
		assert_eq!(out.addr(), ip("192.168.1.0"));
		assert_eq!(out.prefix_len(), 24);
	}

	#[test]
	fn increment_grand_rollover() {
		let out = increment_with_wrap(&net("255.255.255.255/24")).unwrap();
		assert_eq!(out.addr(), ip("255.255.255.0"));
		assert_eq!(out.prefix_len(), 24);
	}

	#[test]
	fn increment_ipv6() {
		let out = increment_with_wrap(&net("fd00::ffff/64")).unwrap();
		assert_eq!(out.addr(), ip("fd00::1:0"));
	}

	#[test]
	fn increment_visits_every_address_once() {
		// A /30 has four addresses; starting anywhere we must return to the
		// start after exactly four steps and never sooner.
		let start = net("10.0.0.2/30");
		let mut current = start;
		let mut seen = vec![current.addr()];
		for step in 1..=4u32 {
			current = increment_with_wrap(&current).unwrap();
			if current.addr() == start.addr() {
				assert_eq!(step, 4, "wrapped early");
				break;
			}
			assert!(!seen.contains(&current.addr()), "revisited {current}");
			seen.push(current.addr());
		}
		assert_eq!(current.addr(), start.addr());
	}

	#[test]
	fn compare_same_family() {
		assert_eq!(compare(&ip("10.0.0.1"), &ip("10.0.0.2")), Ordering::Less);
		assert_eq!(compare(&ip("10.0.1.0"), &ip("10.0.0.255")), Ordering::Greater);
		assert_eq!(compare(&ip("fe80::1"), &ip("fe80::1")), Ordering::Equal);
	}

	#[test]
	fn compare_widens_mixed_families() {
		let v4 = ip("192.168.1.1");
		let mapped = IpAddr::V6(Ipv4Addr::new(192, 168, 1, 1).to_ipv6_mapped());
		assert_eq!(compare(&v4, &mapped), Ordering::Equal);
		assert_eq!(compare(&v4, &ip("fe80::1")), Ordering::Less);
	}

	#[test]
	fn canonical_ip_collapses_mapped() {
		let mapped = IpAddr::V6(Ipv6Addr::from(0xffff_c0a8_0101u128));
		assert_eq!(canonical_ip(mapped), ip("192.168.1.1"));
		assert_eq!(canonical_ip(ip("fe80::1")), ip("fe80::1"));
	}
}
