// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Driver factory for the WireGuard tunnel device. A device can live in the
//! kernel module or be serviced by a spawned userspace daemon (boringtun or
//! wireguard-go); either way the caller gets back one [`WgInterface`]
//! handle that owns the link and, for userspace drivers, the child process.

use futures::{Stream, StreamExt};
use ipnet::IpNet;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{debug, info, instrument, warn};
use trellis_link::{
	link_events, next_interface_name, validate_interface_name, wildcard_base, LinkError,
	LinkHandle,
};
use wireguard_control::{Backend, Device, DeviceUpdate, InterfaceName};

const DEFAULT_BORINGTUN_PATH: &str = "boringtun";
const DEFAULT_WIREGUARD_GO_PATH: &str = "wireguard-go";

/// How long a driver gets to make the link appear.
pub const INTERFACE_CREATION_TIMEOUT: Duration = Duration::from_secs(10);
/// Grace period between SIGTERM and SIGKILL for a userspace driver.
pub const USERSPACE_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum DriverError {
	#[error("finding {driver} binary {path:?}: driver not found")]
	NotFound { driver: &'static str, path: String },

	#[error("the {0} driver is not supported on this host")]
	Unsupported(&'static str),

	#[error("userspace driver exited 0 before the interface appeared")]
	UserspaceExitedClean,

	#[error("userspace driver exited: {0}")]
	UserspaceExited(String),

	#[error("timeout waiting for interface {0:?} to be created")]
	CreationTimeout(String),

	#[error("existing interface {name:?} listens on port {got}, requested {want}")]
	PortMismatch { name: String, want: u16, got: u16 },

	#[error("no wireguard drivers succeeded")]
	NoDrivers,

	#[error("unknown wireguard driver {0:?}")]
	UnknownDriver(String),

	#[error("interface name {0:?} is invalid")]
	InvalidName(String),

	#[error("parsing {driver} extra args: {source}")]
	ExtraArgs {
		driver: &'static str,
		source: shell_words::ParseError,
	},

	#[error("spawning {driver}: {source}")]
	Spawn {
		driver: &'static str,
		source: std::io::Error,
	},

	#[error("configuring device {name:?}: {source}")]
	Device {
		name: String,
		source: std::io::Error,
	},

	#[error(transparent)]
	Link(#[from] LinkError),
}

pub type Result<T> = std::result::Result<T, DriverError>;

/// How the tunnel device should be realized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WgDriver {
	/// Try kernel, then boringtun, then wireguard-go, skipping drivers that
	/// are absent on this host.
	#[default]
	Auto,
	/// Only adopt an interface that already exists.
	Existing,
	Kernel,
	BoringTun,
	WireGuardGo,
}

impl WgDriver {
	pub fn variants() -> &'static [&'static str] {
		&["auto", "existing", "kernel", "boringtun", "wireguard-go"]
	}
}

impl FromStr for WgDriver {
	type Err = DriverError;

	fn from_str(s: &str) -> Result<Self> {
		match s {
			"auto" => Ok(Self::Auto),
			"existing" => Ok(Self::Existing),
			"kernel" => Ok(Self::Kernel),
			"boringtun" => Ok(Self::BoringTun),
			"wireguard-go" => Ok(Self::WireGuardGo),
			other => Err(DriverError::UnknownDriver(other.to_string())),
		}
	}
}

impl std::fmt::Display for WgDriver {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(match self {
			Self::Auto => "auto",
			Self::Existing => "existing",
			Self::Kernel => "kernel",
			Self::BoringTun => "boringtun",
			Self::WireGuardGo => "wireguard-go",
		})
	}
}

/// Options for [`ensure_interface`]. The name may be literal (`wg0`) or a
/// wildcard template (`wg+`) that counts up until a free name is found.
#[derive(Debug, Clone)]
pub struct InterfaceOptions {
	pub name: String,
	pub driver: WgDriver,
	pub reuse_existing: bool,
	/// Requested listen port; `None` lets the driver pick.
	pub port: Option<u16>,
	pub boringtun_path: Option<String>,
	pub boringtun_extra_args: Option<String>,
	pub wireguard_go_path: Option<String>,
	pub wireguard_go_extra_args: Option<String>,
	pub creation_timeout: Duration,
	pub shutdown_timeout: Duration,
}

impl Default for InterfaceOptions {
	fn default() -> Self {
		Self {
			name: "wg0".to_string(),
			driver: WgDriver::Auto,
			reuse_existing: false,
			port: None,
			boringtun_path: None,
			boringtun_extra_args: None,
			wireguard_go_path: None,
			wireguard_go_extra_args: None,
			creation_timeout: INTERFACE_CREATION_TIMEOUT,
			shutdown_timeout: USERSPACE_SHUTDOWN_TIMEOUT,
		}
	}
}

/// Where device-configure commands for one interface are sent. Detached
/// from the [`WgInterface`] so the reconciler can configure peers while the
/// orchestrator keeps the handle.
#[derive(Clone)]
pub struct DeviceTarget {
	name: String,
	iface: InterfaceName,
	backend: Backend,
}

impl std::fmt::Debug for DeviceTarget {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("DeviceTarget").field("name", &self.name).finish()
	}
}

impl DeviceTarget {
	pub fn new(name: &str, iface: InterfaceName, backend: Backend) -> Self {
		Self {
			name: name.to_string(),
			iface,
			backend,
		}
	}

	pub fn apply(&self, update: DeviceUpdate) -> Result<()> {
		update
			.apply(&self.iface, self.backend)
			.map_err(|source| DriverError::Device {
				name: self.name.clone(),
				source,
			})
	}

	pub fn device(&self) -> Result<Device> {
		Device::get(&self.iface, self.backend).map_err(|source| DriverError::Device {
			name: self.name.clone(),
			source,
		})
	}
}

/// Sink for device-configure commands. The live implementation is
/// [`DeviceTarget`]; tests substitute a recording fake.
pub trait ConfigureDevice: Send + Sync {
	fn configure(&self, update: DeviceUpdate) -> Result<()>;
}

impl ConfigureDevice for DeviceTarget {
	fn configure(&self, update: DeviceUpdate) -> Result<()> {
		self.apply(update)
	}
}

struct UserspaceDriver {
	child: Child,
	driver: &'static str,
}

/// Handle to a live tunnel device. Owns the link and, for userspace
/// drivers, the child process; both are released by [`WgInterface::close`],
/// which is idempotent.
pub struct WgInterface {
	name: String,
	iface: InterfaceName,
	backend: Backend,
	link: LinkHandle,
	userspace: Option<UserspaceDriver>,
	shutdown_timeout: Duration,
	closed: AtomicBool,
}

impl WgInterface {
	fn new(
		name: &str,
		backend: Backend,
		link: LinkHandle,
		userspace: Option<UserspaceDriver>,
		shutdown_timeout: Duration,
	) -> Result<Self> {
		let iface = InterfaceName::from_str(name)
			.map_err(|_| DriverError::InvalidName(name.to_string()))?;
		Ok(Self {
			name: name.to_string(),
			iface,
			backend,
			link,
			userspace,
			shutdown_timeout,
			closed: AtomicBool::new(false),
		})
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn backend(&self) -> Backend {
		self.backend
	}

	pub fn target(&self) -> DeviceTarget {
		DeviceTarget::new(&self.name, self.iface, self.backend)
	}

	/// Sets the link to the UP state if it is not already up.
	pub async fn ensure_up(&self) -> Result<()> {
		Ok(self.link.set_up(&self.name).await?)
	}

	/// Adds an address to the interface; already-present addresses are fine.
	pub async fn ensure_ip(&self, addr: IpNet) -> Result<()> {
		Ok(self.link.add_address(&self.name, addr).await?)
	}

	/// Addresses currently assigned to the interface.
	pub async fn ips(&self) -> Result<Vec<IpNet>> {
		Ok(self.link.addresses(&self.name).await?)
	}

	/// Applies a device-configure command to the WireGuard device.
	pub fn apply(&self, update: DeviceUpdate) -> Result<()> {
		self.target().apply(update)
	}

	/// The port the WireGuard driver is listening on, if bound.
	pub fn listen_port(&self) -> Result<Option<u16>> {
		Ok(self.target().device()?.listen_port)
	}

	/// Tears the device down: deletes the link, then stops any userspace
	/// driver, escalating from SIGTERM to SIGKILL after the shutdown
	/// timeout. Safe to call more than once; errors are collected and the
	/// last one is returned.
	pub async fn close(&mut self) -> Result<()> {
		if self.closed.swap(true, Ordering::SeqCst) {
			return Ok(());
		}

		let mut errs: Vec<DriverError> = Vec::new();

		match self.link.del(&self.name).await {
			Ok(()) | Err(LinkError::NotFound(_)) => {}
			Err(err) => errs.push(err.into()),
		}

		if let Some(mut userspace) = self.userspace.take() {
			if let Err(err) = Self::stop_userspace(&mut userspace, self.shutdown_timeout).await {
				errs.push(err);
			}
		}

		for err in errs.iter().take(errs.len().saturating_sub(1)) {
			warn!(error = %err, interface = %self.name, "error during interface close");
		}
		match errs.pop() {
			Some(err) => Err(err),
			None => Ok(()),
		}
	}

	async fn stop_userspace(userspace: &mut UserspaceDriver, timeout: Duration) -> Result<()> {
		let Some(pid) = userspace.child.id() else {
			// Already reaped.
			return Ok(());
		};

		debug!(pid, driver = userspace.driver, "signalling userspace driver");
		kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(|err| {
			DriverError::Spawn {
				driver: userspace.driver,
				source: std::io::Error::from(err),
			}
		})?;

		match tokio::time::timeout(timeout, userspace.child.wait()).await {
			Ok(Ok(status)) => {
				debug!(%status, driver = userspace.driver, "userspace driver exited");
				Ok(())
			}
			Ok(Err(err)) => Err(DriverError::Spawn {
				driver: userspace.driver,
				source: err,
			}),
			Err(_) => {
				warn!(driver = userspace.driver, "userspace driver did not exit, killing");
				// Exit status after SIGKILL is discarded.
				let _ = userspace.child.kill().await;
				Ok(())
			}
		}
	}
}

impl std::fmt::Debug for WgInterface {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("WgInterface")
			.field("name", &self.name)
			.field("backend", &self.backend)
			.field("userspace", &self.userspace.is_some())
			.finish()
	}
}

/// Creates or adopts a WireGuard interface per the options and returns its
/// handle. Candidate names are generated from the template; on a name
/// collision reported by a driver the next candidate is tried.
#[instrument(skip(options, link), fields(name = %options.name, driver = %options.driver))]
pub async fn ensure_interface(
	options: &InterfaceOptions,
	link: &LinkHandle,
) -> Result<WgInterface> {
	validate_interface_name(&options.name)?;

	let existing = existing_names(link, &options.name).await?;
	let mut last = String::new();

	loop {
		let name = next_interface_name(&options.name, &last)?;
		last = name.clone();

		if existing.contains(&name) {
			if options.reuse_existing || options.driver == WgDriver::Existing {
				let iface = adopt_existing(options, link, &name)?;
				info!(interface = %name, "reusing existing wireguard interface");
				return Ok(iface);
			}
			continue;
		}

		if options.driver == WgDriver::Existing {
			return Err(DriverError::Link(LinkError::NotFound(name)));
		}

		if matches!(options.driver, WgDriver::Kernel | WgDriver::Auto) {
			match create_kernel(options, link, &name).await {
				Ok(iface) => return finish(iface, options).await,
				Err(DriverError::Link(LinkError::AlreadyExists(_))) => continue,
				Err(DriverError::Link(LinkError::Unsupported)) => {
					if options.driver == WgDriver::Kernel {
						return Err(DriverError::Unsupported("kernel"));
					}
					debug!("kernel driver unsupported, trying userspace");
				}
				Err(err) => return Err(err),
			}
		}

		if matches!(options.driver, WgDriver::BoringTun | WgDriver::Auto) {
			match create_userspace(Userspace::BoringTun, options, link, &name).await {
				Ok(iface) => return finish(iface, options).await,
				Err(DriverError::NotFound { driver, path }) => {
					if options.driver == WgDriver::BoringTun {
						return Err(DriverError::NotFound { driver, path });
					}
					debug!(driver, "userspace driver not found, trying next");
				}
				Err(err) => return Err(err),
			}
		}

		if matches!(options.driver, WgDriver::WireGuardGo | WgDriver::Auto) {
			match create_userspace(Userspace::WireGuardGo, options, link, &name).await {
				Ok(iface) => return finish(iface, options).await,
				Err(DriverError::NotFound { driver, path }) => {
					if options.driver == WgDriver::WireGuardGo {
						return Err(DriverError::NotFound { driver, path });
					}
					debug!(driver, "userspace driver not found");
				}
				Err(err) => return Err(err),
			}
		}

		return Err(DriverError::NoDrivers);
	}
}

/// Names of links sharing the template's fixed prefix.
async fn existing_names(link: &LinkHandle, desired: &str) -> Result<HashSet<String>> {
	let base = wildcard_base(desired);
	Ok(link
		.list_names()
		.await?
		.into_iter()
		.filter(|name| name.starts_with(base))
		.collect())
}

fn adopt_existing(options: &InterfaceOptions, link: &LinkHandle, name: &str) -> Result<WgInterface> {
	let iface =
		InterfaceName::from_str(name).map_err(|_| DriverError::InvalidName(name.to_string()))?;

	// Confirm the driver sees it as a WireGuard device, probing the kernel
	// first and falling back to a userspace socket.
	let (device, backend) = match Device::get(&iface, Backend::Kernel) {
		Ok(device) => (device, Backend::Kernel),
		Err(_) => {
			let device =
				Device::get(&iface, Backend::Userspace).map_err(|source| DriverError::Device {
					name: name.to_string(),
					source,
				})?;
			(device, Backend::Userspace)
		}
	};

	if let Some(want) = options.port {
		match device.listen_port {
			Some(got) if got != want => {
				return Err(DriverError::PortMismatch {
					name: name.to_string(),
					want,
					got,
				});
			}
			_ => {}
		}
	}

	WgInterface::new(name, backend, link.clone(), None, options.shutdown_timeout)
}

async fn create_kernel(
	options: &InterfaceOptions,
	link: &LinkHandle,
	name: &str,
) -> Result<WgInterface> {
	link.add_wireguard(name).await?;
	info!(interface = %name, "created kernel wireguard interface");
	WgInterface::new(
		name,
		Backend::Kernel,
		link.clone(),
		None,
		options.shutdown_timeout,
	)
}

#[derive(Debug, Clone, Copy)]
enum Userspace {
	BoringTun,
	WireGuardGo,
}

impl Userspace {
	fn name(self) -> &'static str {
		match self {
			Self::BoringTun => "boringtun",
			Self::WireGuardGo => "wireguard-go",
		}
	}

	fn binary<'a>(self, options: &'a InterfaceOptions) -> &'a str {
		match self {
			Self::BoringTun => options
				.boringtun_path
				.as_deref()
				.unwrap_or(DEFAULT_BORINGTUN_PATH),
			Self::WireGuardGo => options
				.wireguard_go_path
				.as_deref()
				.unwrap_or(DEFAULT_WIREGUARD_GO_PATH),
		}
	}

	fn extra_args<'a>(self, options: &'a InterfaceOptions) -> Option<&'a str> {
		match self {
			Self::BoringTun => options.boringtun_extra_args.as_deref(),
			Self::WireGuardGo => options.wireguard_go_extra_args.as_deref(),
		}
	}
}

async fn create_userspace(
	kind: Userspace,
	options: &InterfaceOptions,
	link: &LinkHandle,
	name: &str,
) -> Result<WgInterface> {
	let driver = kind.name();
	let path = kind.binary(options);
	let qualified = which::which(path).map_err(|_| DriverError::NotFound {
		driver,
		path: path.to_string(),
	})?;

	let mut args = vec!["--foreground".to_string()];
	if let Some(extra) = kind.extra_args(options) {
		args.extend(
			shell_words::split(extra).map_err(|source| DriverError::ExtraArgs { driver, source })?,
		);
	}
	args.push(name.to_string());

	// Subscribe before spawning so the new link's event cannot be missed.
	let mut events = link_events()?;

	info!(interface = %name, driver, binary = %qualified.display(), "starting userspace driver");
	let mut child = Command::new(&qualified)
		.args(&args)
		.spawn()
		.map_err(|source| DriverError::Spawn { driver, source })?;

	match wait_for_link(link, &mut events, &mut child, name, options.creation_timeout).await {
		Ok(()) => WgInterface::new(
			name,
			Backend::Userspace,
			link.clone(),
			Some(UserspaceDriver { child, driver }),
			options.shutdown_timeout,
		),
		Err(err) => {
			// The driver never produced a usable device; reap it.
			let _ = child.kill().await;
			Err(err)
		}
	}
}

/// Waits until a link named `name` appears, the child exits, or the timeout
/// elapses, whichever happens first.
async fn wait_for_link(
	link: &LinkHandle,
	events: &mut (impl Stream<Item = String> + Unpin),
	child: &mut Child,
	name: &str,
	timeout: Duration,
) -> Result<()> {
	// The subscription only carries changes; cover links that already exist.
	if link.exists(name).await? {
		return Ok(());
	}

	let deadline = tokio::time::sleep(timeout);
	tokio::pin!(deadline);

	loop {
		tokio::select! {
			_ = &mut deadline => {
				return Err(DriverError::CreationTimeout(name.to_string()));
			}
			status = child.wait() => {
				return Err(match status {
					Ok(status) if status.success() => DriverError::UserspaceExitedClean,
					Ok(status) => DriverError::UserspaceExited(status.to_string()),
					Err(source) => DriverError::Spawn { driver: "userspace", source },
				});
			}
			event = events.next() => match event {
				Some(appeared) if appeared == name => return Ok(()),
				Some(appeared) => {
					debug!(interface = %appeared, desired = %name, "ignoring update about irrelevant interface");
				}
				None => return Err(DriverError::CreationTimeout(name.to_string())),
			}
		}
	}
}

/// Applies the requested listen port to a freshly created device. A failure
/// here unwinds the device so nothing half-configured is left behind.
async fn finish(mut iface: WgInterface, options: &InterfaceOptions) -> Result<WgInterface> {
	if let Some(port) = options.port {
		if let Err(err) = iface.apply(DeviceUpdate::new().set_listen_port(port)) {
			warn!(error = %err, interface = %iface.name(), "failed to set listen port, unwinding");
			if let Err(close_err) = iface.close().await {
				warn!(error = %close_err, "error unwinding interface");
			}
			return Err(err);
		}
	}
	Ok(iface)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn driver_round_trips_from_str() {
		for s in WgDriver::variants() {
			let driver: WgDriver = s.parse().unwrap();
			assert_eq!(&driver.to_string(), s);
		}
	}

	#[test]
	fn driver_rejects_unknown() {
		let err = "openvpn".parse::<WgDriver>().unwrap_err();
		assert!(matches!(err, DriverError::UnknownDriver(name) if name == "openvpn"));
	}

	#[test]
	fn default_options_use_spec_timeouts() {
		let options = InterfaceOptions::default();
		assert_eq!(options.creation_timeout, Duration::from_secs(10));
		assert_eq!(options.shutdown_timeout, Duration::from_secs(10));
		assert_eq!(options.name, "wg0");
		assert_eq!(options.driver, WgDriver::Auto);
	}
}
