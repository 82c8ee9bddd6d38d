// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::keys::{WgKeyPair, WgPrivateKey};
use std::path::Path;
use thiserror::Error;
use tokio::fs;
use tracing::instrument;

#[derive(Error, Debug)]
pub enum KeyFileError {
	#[error("failed to read key file: {0}")]
	Read(#[from] std::io::Error),

	#[error("invalid key format: {0}")]
	InvalidFormat(#[from] crate::keys::KeyError),
}

pub type Result<T> = std::result::Result<T, KeyFileError>;

/// Loads a private key stored as one line of base64.
#[instrument(skip_all, fields(path = %path.as_ref().display()))]
pub async fn load_key_from_file(path: impl AsRef<Path>) -> Result<WgKeyPair> {
	let content = fs::read_to_string(path.as_ref()).await?;
	let private = WgPrivateKey::from_base64(content.trim())?;
	Ok(WgKeyPair::from_private_key(private))
}

/// Writes the private key as base64, mode 0600 on unix.
#[instrument(skip(key), fields(path = %path.as_ref().display()))]
pub async fn save_key_to_file(key: &WgKeyPair, path: impl AsRef<Path>) -> Result<()> {
	let path = path.as_ref();

	if let Some(parent) = path.parent() {
		fs::create_dir_all(parent).await?;
	}

	let content = format!("{}\n", key.private_key().to_base64());

	#[cfg(unix)]
	{
		use tokio::fs::OpenOptions;
		use tokio::io::AsyncWriteExt;

		let mut file = OpenOptions::new()
			.write(true)
			.create(true)
			.truncate(true)
			.mode(0o600)
			.open(path)
			.await?;
		file.write_all(content.as_bytes()).await?;
	}

	#[cfg(not(unix))]
	{
		fs::write(path, content).await?;
	}

	Ok(())
}

/// Loads the key at `path`, generating and persisting a fresh one if the
/// file does not exist yet.
#[instrument(skip_all, fields(path = %path.as_ref().display()))]
pub async fn get_or_create_key(path: impl AsRef<Path>) -> Result<WgKeyPair> {
	let path = path.as_ref();

	if path.exists() {
		return load_key_from_file(path).await;
	}

	let keypair = WgKeyPair::generate();
	save_key_to_file(&keypair, path).await?;
	Ok(keypair)
}
