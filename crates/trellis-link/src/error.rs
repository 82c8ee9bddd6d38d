// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LinkError {
	#[error("interface {0:?} not found")]
	NotFound(String),

	#[error("unimplemented on this platform")]
	Unimplemented,

	#[error("wireguard links are not supported by this kernel")]
	Unsupported,

	#[error("link {0:?} already exists")]
	AlreadyExists(String),

	#[error("interface name is empty")]
	EmptyName,

	#[error("interface name may be at most {max} characters; got {len}")]
	NameTooLong { max: usize, len: usize },

	#[error("interface name {0:?} is invalid: contains / character")]
	NameHasSlash(String),

	#[error("interface name {0:?} is invalid: contains whitespace")]
	NameHasWhitespace(String),

	#[error("interface {0:?} exists")]
	StaticNameTaken(String),

	#[error("generating interface name: no numeric suffix in {0:?}")]
	BadNameSuffix(String),

	#[cfg(target_os = "linux")]
	#[error("netlink: {0}")]
	Netlink(#[from] rtnetlink::Error),

	#[error("netlink socket: {0}")]
	Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LinkError>;
