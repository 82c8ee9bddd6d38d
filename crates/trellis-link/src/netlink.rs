// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::{LinkError, Result};
use futures::stream::{BoxStream, TryStreamExt};
use futures::StreamExt;
use ipnet::IpNet;
use netlink_packet_core::NetlinkPayload;
use netlink_packet_route::address::nlas::Nla as AddressNla;
use netlink_packet_route::link::nlas::{Info, InfoKind, Nla as LinkNla};
use netlink_packet_route::{AddressMessage, LinkMessage, RtnlMessage};
use rtnetlink::constants::RTMGRP_LINK;
use netlink_sys::{AsyncSocket, SocketAddr};
use rtnetlink::Handle;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::{debug, trace};

/// Maps a netlink error to the errno it carries, if any.
fn errno(err: &rtnetlink::Error) -> Option<i32> {
	match err {
		// The kernel reports errors as negative errno values.
		rtnetlink::Error::NetlinkError(msg) => msg.code.map(|code| -code.get()),
		_ => None,
	}
}

/// Thin handle over an rtnetlink connection. Cloneable; the underlying
/// connection task lives until every handle is dropped.
#[derive(Clone)]
pub struct LinkHandle {
	handle: Handle,
}

impl LinkHandle {
	pub fn new() -> Result<Self> {
		let (connection, handle, _) = rtnetlink::new_connection()?;
		tokio::spawn(connection);
		Ok(Self { handle })
	}

	async fn index(&self, name: &str) -> Result<u32> {
		let mut links = self
			.handle
			.link()
			.get()
			.match_name(name.to_string())
			.execute();
		match links.try_next().await {
			Ok(Some(msg)) => Ok(msg.header.index),
			Ok(None) => Err(LinkError::NotFound(name.to_string())),
			Err(err) if errno(&err) == Some(libc::ENODEV) => {
				Err(LinkError::NotFound(name.to_string()))
			}
			Err(err) => Err(err.into()),
		}
	}

	/// Creates a link of type `wireguard`. Fails `Unsupported` when the
	/// kernel has no WireGuard module and `AlreadyExists` when the name is
	/// taken.
	pub async fn add_wireguard(&self, name: &str) -> Result<()> {
		debug!(%name, "adding wireguard link");
		let mut request = self.handle.link().add();
		let message = request.message_mut();
		message.nlas.push(LinkNla::IfName(name.to_string()));
		message
			.nlas
			.push(LinkNla::Info(vec![Info::Kind(InfoKind::Wireguard)]));
		request.execute().await.map_err(|err| match errno(&err) {
			Some(libc::EOPNOTSUPP) => LinkError::Unsupported,
			Some(libc::EEXIST) => LinkError::AlreadyExists(name.to_string()),
			_ => err.into(),
		})
	}

	/// Deletes the named link. The caller decides whether `NotFound` counts
	/// as a failure.
	pub async fn del(&self, name: &str) -> Result<()> {
		let index = self.index(name).await?;
		self
			.handle
			.link()
			.del(index)
			.execute()
			.await
			.map_err(|err| match errno(&err) {
				Some(libc::ENODEV) => LinkError::NotFound(name.to_string()),
				_ => err.into(),
			})
	}

	/// Raises the named link into the UP state. Idempotent.
	pub async fn set_up(&self, name: &str) -> Result<()> {
		let index = self.index(name).await?;
		self.handle.link().set(index).up().execute().await?;
		Ok(())
	}

	/// Adds an address to the named link; an address that is already present
	/// is not an error.
	pub async fn add_address(&self, name: &str, addr: IpNet) -> Result<()> {
		let index = self.index(name).await?;
		match self
			.handle
			.address()
			.add(index, addr.addr(), addr.prefix_len())
			.execute()
			.await
		{
			Ok(()) => Ok(()),
			Err(err) if errno(&err) == Some(libc::EEXIST) => {
				trace!(%name, %addr, "address already present");
				Ok(())
			}
			Err(err) => Err(err.into()),
		}
	}

	/// Lists the addresses currently assigned to the named link.
	pub async fn addresses(&self, name: &str) -> Result<Vec<IpNet>> {
		let index = self.index(name).await?;
		let mut out = Vec::new();
		let mut addrs = self
			.handle
			.address()
			.get()
			.set_link_index_filter(index)
			.execute();
		while let Some(msg) = addrs.try_next().await? {
			if let Some(addr) = address_from_message(&msg) {
				out.push(addr);
			}
		}
		Ok(out)
	}

	/// Lists the names of every link on the host.
	pub async fn list_names(&self) -> Result<Vec<String>> {
		let mut out = Vec::new();
		let mut links = self.handle.link().get().execute();
		while let Some(msg) = links.try_next().await? {
			if let Some(name) = link_name(&msg) {
				out.push(name);
			}
		}
		Ok(out)
	}

	/// True when a link with this exact name exists.
	pub async fn exists(&self, name: &str) -> Result<bool> {
		match self.index(name).await {
			Ok(_) => Ok(true),
			Err(LinkError::NotFound(_)) => Ok(false),
			Err(err) => Err(err),
		}
	}
}

fn link_name(msg: &LinkMessage) -> Option<String> {
	msg.nlas.iter().find_map(|nla| match nla {
		LinkNla::IfName(name) => Some(name.clone()),
		_ => None,
	})
}

fn address_from_message(msg: &AddressMessage) -> Option<IpNet> {
	let prefix = msg.header.prefix_len;
	msg.nlas.iter().find_map(|nla| match nla {
		AddressNla::Address(bytes) => match bytes.len() {
			4 => {
				let octets: [u8; 4] = bytes.as_slice().try_into().ok()?;
				IpNet::new(IpAddr::V4(Ipv4Addr::from(octets)), prefix).ok()
			}
			16 => {
				let octets: [u8; 16] = bytes.as_slice().try_into().ok()?;
				IpNet::new(IpAddr::V6(Ipv6Addr::from(octets)), prefix).ok()
			}
			_ => None,
		},
		_ => None,
	})
}

/// Opens a dedicated netlink subscription for link lifecycle events and
/// yields the name carried by every new-link notification. The caller pairs
/// this with a one-shot listing to cover links that already exist.
pub fn link_events() -> Result<BoxStream<'static, String>> {
	let (mut connection, _handle, messages) = rtnetlink::new_connection()?;
	let groups = SocketAddr::new(0, RTMGRP_LINK);
	connection
		.socket_mut()
		.socket_mut()
		.bind(&groups)
		.map_err(LinkError::Io)?;
	tokio::spawn(connection);

	Ok(messages
		.filter_map(|(message, _)| async move {
			match message.payload {
				NetlinkPayload::InnerMessage(RtnlMessage::NewLink(link)) => link_name(&link),
				_ => None,
			}
		})
		.boxed())
}
