// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::{RegistryError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::instrument;
use url::Url;

/// Connection settings for one registry, loaded from a small JSON file:
/// `{"server": "https://...", "namespace": "mesh", "token": "..."}`. Only
/// `server` is required.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryConfig {
	pub server: Url,
	#[serde(default = "default_namespace")]
	pub namespace: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub token: Option<String>,
}

fn default_namespace() -> String {
	"default".to_string()
}

impl RegistryConfig {
	pub fn new(server: Url) -> Self {
		Self {
			server,
			namespace: default_namespace(),
			token: None,
		}
	}

	#[instrument(skip_all, fields(path = %path.as_ref().display()))]
	pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
		let path = path.as_ref();
		let content =
			tokio::fs::read_to_string(path)
				.await
				.map_err(|err| RegistryError::Config {
					path: path.display().to_string(),
					reason: err.to_string(),
				})?;
		serde_json::from_str(&content).map_err(|err| RegistryError::Config {
			path: path.display().to_string(),
			reason: err.to_string(),
		})
	}
}
