// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The per-node overlay agent: brings up a WireGuard interface through one
//! of several drivers, registers this node in the peer registry, claims
//! tunnel addresses from a shared pool, and keeps the device's peer list
//! reconciled against the registry watch.

mod agent;
mod driver;
mod error;
mod ipam;
mod options;
mod reconciler;

pub use agent::Agent;
pub use driver::{
	ensure_interface, ConfigureDevice, DeviceTarget, DriverError, InterfaceOptions, WgDriver,
	WgInterface, INTERFACE_CREATION_TIMEOUT, USERSPACE_SHUTDOWN_TIMEOUT,
};
pub use error::{AgentError, Result};
pub use ipam::{claim_ips, claim_name, IpamError};
pub use options::{
	join_endpoint, split_endpoint, validate_cidr_list, validate_node_name, AgentOptions,
};
pub use reconciler::{PeerReconciler, ReconcileError, TranslateError};
