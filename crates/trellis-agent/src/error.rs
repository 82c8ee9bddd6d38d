// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
	#[error("registry: {0}")]
	Registry(#[from] trellis_registry::RegistryError),

	#[error("driver: {0}")]
	Driver(#[from] crate::driver::DriverError),

	#[error("link: {0}")]
	Link(#[from] trellis_link::LinkError),

	#[error("ipam: {0}")]
	Ipam(#[from] crate::ipam::IpamError),

	#[error("reconciler: {0}")]
	Reconcile(#[from] crate::reconciler::ReconcileError),

	#[error(
		"existing peer {name:?} had endpoint {existing:?}, we have {ours:?}; \
		 two or more peers may be sharing the same name"
	)]
	PeerNameConflict {
		name: String,
		existing: String,
		ours: String,
	},

	#[error("invalid {field}: {reason}")]
	Config { field: String, reason: String },

	#[error("invalid key material")]
	InvalidKey,

	#[error("peer watch ended before the initial sync completed")]
	WatchEnded,
}

impl AgentError {
	pub fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
		Self::Config {
			field: field.into(),
			reason: reason.into(),
		}
	}
}

pub type Result<T> = std::result::Result<T, AgentError>;
