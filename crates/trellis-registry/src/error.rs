// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
	#[error("{kind} {namespace}/{name} not found")]
	NotFound {
		kind: &'static str,
		namespace: String,
		name: String,
	},

	#[error("{kind} {namespace}/{name} already exists")]
	AlreadyExists {
		kind: &'static str,
		namespace: String,
		name: String,
	},

	#[error("conflict writing {kind} {namespace}/{name}")]
	Conflict {
		kind: &'static str,
		namespace: String,
		name: String,
	},

	#[error("registry returned status {status}: {message}")]
	Status { status: u16, message: String },

	#[error("HTTP error: {0}")]
	Http(#[from] reqwest::Error),

	#[error("URL parse error: {0}")]
	Url(#[from] url::ParseError),

	#[error("parse error: {0}")]
	Parse(#[from] serde_json::Error),

	#[error("invalid selector {selector:?}: {reason}")]
	Selector { selector: String, reason: String },

	#[error("registry config {path:?}: {reason}")]
	Config { path: String, reason: String },

	#[error("watch stream error: {0}")]
	Watch(String),
}

impl RegistryError {
	pub fn is_not_found(&self) -> bool {
		matches!(self, Self::NotFound { .. })
	}

	pub fn is_already_exists(&self) -> bool {
		matches!(self, Self::AlreadyExists { .. })
	}

	pub fn is_conflict(&self) -> bool {
		matches!(self, Self::Conflict { .. })
	}
}

pub type Result<T> = std::result::Result<T, RegistryError>;
