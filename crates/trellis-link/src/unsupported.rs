// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Stub link layer for platforms without rtnetlink. Every operation fails
//! with [`LinkError::Unimplemented`]; name handling still works so the
//! higher layers can validate configuration anywhere.

use crate::error::{LinkError, Result};
use futures::stream::BoxStream;
use ipnet::IpNet;

#[derive(Clone)]
pub struct LinkHandle;

impl LinkHandle {
	pub fn new() -> Result<Self> {
		Err(LinkError::Unimplemented)
	}

	pub async fn add_wireguard(&self, _name: &str) -> Result<()> {
		Err(LinkError::Unimplemented)
	}

	pub async fn del(&self, _name: &str) -> Result<()> {
		Err(LinkError::Unimplemented)
	}

	pub async fn set_up(&self, _name: &str) -> Result<()> {
		Err(LinkError::Unimplemented)
	}

	pub async fn add_address(&self, _name: &str, _addr: IpNet) -> Result<()> {
		Err(LinkError::Unimplemented)
	}

	pub async fn addresses(&self, _name: &str) -> Result<Vec<IpNet>> {
		Err(LinkError::Unimplemented)
	}

	pub async fn list_names(&self) -> Result<Vec<String>> {
		Err(LinkError::Unimplemented)
	}

	pub async fn exists(&self, _name: &str) -> Result<bool> {
		Err(LinkError::Unimplemented)
	}
}

pub fn link_events() -> Result<BoxStream<'static, String>> {
	Err(LinkError::Unimplemented)
}
