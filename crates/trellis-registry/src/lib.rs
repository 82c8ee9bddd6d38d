// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Client for the declarative peer registry: namespaced `Peer`, `IpPool` and
//! `IpClaim` objects with optimistic concurrency, label-selector filtering
//! and a watch stream that replays the existing set before going live.

mod client;
mod config;
mod error;
mod objects;
mod selector;
mod watch;

pub use client::RegistryClient;
pub use config::RegistryConfig;
pub use error::{RegistryError, Result};
pub use objects::{
	IpClaim, IpClaimSpec, IpPool, IpPoolSpec, IpRangeSpec, ObjectMeta, OwnerReference, Peer,
	PeerSpec, RegistryObject, API_VERSION,
};
pub use selector::Selector;
pub use watch::{WatchEvent, WatchStream};
