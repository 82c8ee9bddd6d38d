// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

#[derive(Error, Debug)]
pub enum KeyError {
	#[error("invalid key length: expected 32 bytes, got {0}")]
	InvalidLength(usize),

	#[error("invalid base64 encoding: {0}")]
	InvalidBase64(#[from] base64::DecodeError),

	#[error("invalid hex encoding: {0}")]
	InvalidHex(#[from] hex::FromHexError),
}

pub type Result<T> = std::result::Result<T, KeyError>;

fn decode_base64(s: &str) -> Result<[u8; 32]> {
	let bytes = STANDARD.decode(s)?;
	if bytes.len() != 32 {
		return Err(KeyError::InvalidLength(bytes.len()));
	}
	let mut arr = [0u8; 32];
	arr.copy_from_slice(&bytes);
	Ok(arr)
}

#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct WgPrivateKey {
	bytes: [u8; 32],
}

impl WgPrivateKey {
	pub fn generate() -> Self {
		let secret = StaticSecret::random_from_rng(OsRng);
		Self {
			bytes: secret.to_bytes(),
		}
	}

	pub fn from_bytes(bytes: [u8; 32]) -> Self {
		Self { bytes }
	}

	pub fn from_base64(s: &str) -> Result<Self> {
		Ok(Self {
			bytes: decode_base64(s)?,
		})
	}

	pub fn to_base64(&self) -> String {
		STANDARD.encode(self.bytes)
	}

	pub fn public_key(&self) -> WgPublicKey {
		let secret = StaticSecret::from(self.bytes);
		let public = PublicKey::from(&secret);
		WgPublicKey {
			bytes: *public.as_bytes(),
		}
	}

	pub fn expose_bytes(&self) -> &[u8; 32] {
		&self.bytes
	}
}

impl fmt::Debug for WgPrivateKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("WgPrivateKey")
			.field("bytes", &"[REDACTED]")
			.finish()
	}
}

impl fmt::Display for WgPrivateKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("[REDACTED]")
	}
}

impl Serialize for WgPrivateKey {
	fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_str("[REDACTED]")
	}
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct WgPublicKey {
	bytes: [u8; 32],
}

impl WgPublicKey {
	pub fn from_bytes(bytes: [u8; 32]) -> Self {
		Self { bytes }
	}

	pub fn from_base64(s: &str) -> Result<Self> {
		Ok(Self {
			bytes: decode_base64(s)?,
		})
	}

	pub fn from_hex(s: &str) -> Result<Self> {
		let bytes = hex::decode(s)?;
		if bytes.len() != 32 {
			return Err(KeyError::InvalidLength(bytes.len()));
		}
		let mut arr = [0u8; 32];
		arr.copy_from_slice(&bytes);
		Ok(Self { bytes: arr })
	}

	pub fn to_base64(&self) -> String {
		STANDARD.encode(self.bytes)
	}

	pub fn to_hex(&self) -> String {
		hex::encode(self.bytes)
	}

	pub fn as_bytes(&self) -> &[u8; 32] {
		&self.bytes
	}
}

impl fmt::Debug for WgPublicKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_tuple("WgPublicKey").field(&self.to_base64()).finish()
	}
}

impl fmt::Display for WgPublicKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.to_base64())
	}
}

impl Serialize for WgPublicKey {
	fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_str(&self.to_base64())
	}
}

impl<'de> Deserialize<'de> for WgPublicKey {
	fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
	where
		D: Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Self::from_base64(&s).map_err(serde::de::Error::custom)
	}
}

/// Symmetric pre-shared key mixed into the handshake. Spelled as base64 in
/// transit like the public key, but treated as a secret locally.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct WgPresharedKey {
	bytes: [u8; 32],
}

impl WgPresharedKey {
	pub fn generate() -> Self {
		let mut bytes = [0u8; 32];
		OsRng.fill_bytes(&mut bytes);
		Self { bytes }
	}

	pub fn from_bytes(bytes: [u8; 32]) -> Self {
		Self { bytes }
	}

	pub fn from_base64(s: &str) -> Result<Self> {
		Ok(Self {
			bytes: decode_base64(s)?,
		})
	}

	pub fn to_base64(&self) -> String {
		STANDARD.encode(self.bytes)
	}

	pub fn expose_bytes(&self) -> &[u8; 32] {
		&self.bytes
	}
}

impl fmt::Debug for WgPresharedKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("WgPresharedKey")
			.field("bytes", &"[REDACTED]")
			.finish()
	}
}

#[derive(Clone)]
pub struct WgKeyPair {
	private: WgPrivateKey,
	public: WgPublicKey,
}

impl WgKeyPair {
	pub fn generate() -> Self {
		Self::from_private_key(WgPrivateKey::generate())
	}

	pub fn from_private_key(private: WgPrivateKey) -> Self {
		let public = private.public_key();
		Self { private, public }
	}

	pub fn private_key(&self) -> &WgPrivateKey {
		&self.private
	}

	pub fn public_key(&self) -> &WgPublicKey {
		&self.public
	}
}

impl fmt::Debug for WgKeyPair {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("WgKeyPair")
			.field("public", &self.public.to_base64())
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn generate_round_trips_base64() {
		let pair = WgKeyPair::generate();
		let b64 = pair.public_key().to_base64();
		assert_eq!(b64.len(), 44, "32 bytes of padded base64");
		let parsed = WgPublicKey::from_base64(&b64).unwrap();
		assert_eq!(&parsed, pair.public_key());
	}

	#[test]
	fn private_key_derives_stable_public_key() {
		let private = WgPrivateKey::generate();
		assert_eq!(private.public_key(), private.public_key());

		let restored = WgPrivateKey::from_base64(&private.to_base64()).unwrap();
		assert_eq!(restored.public_key(), private.public_key());
	}

	#[test]
	fn from_base64_rejects_wrong_length() {
		let short = STANDARD.encode([0u8; 16]);
		match WgPublicKey::from_base64(&short) {
			Err(KeyError::InvalidLength(16)) => {}
			other => panic!("expected InvalidLength, got {other:?}"),
		}
	}

	#[test]
	fn from_base64_rejects_garbage() {
		assert!(matches!(
			WgPublicKey::from_base64("not base64!!!"),
			Err(KeyError::InvalidBase64(_))
		));
	}

	#[test]
	fn preshared_keys_are_distinct() {
		let a = WgPresharedKey::generate();
		let b = WgPresharedKey::generate();
		assert_ne!(a.expose_bytes(), b.expose_bytes());
	}

	#[test]
	fn private_key_never_leaks_through_formatting() {
		let private = WgPrivateKey::generate();
		let b64 = private.to_base64();
		assert!(!format!("{private:?}").contains(&b64));
		assert!(!format!("{private}").contains(&b64));
		assert_eq!(
			serde_json::to_string(&private).unwrap(),
			"\"[REDACTED]\""
		);
	}

	#[test]
	fn public_key_hex_round_trips() {
		let public = *WgKeyPair::generate().public_key();
		let parsed = WgPublicKey::from_hex(&public.to_hex()).unwrap();
		assert_eq!(parsed, public);
	}

	#[test]
	fn public_key_serde_uses_base64() {
		let public = *WgKeyPair::generate().public_key();
		let json = serde_json::to_string(&public).unwrap();
		let back: WgPublicKey = serde_json::from_str(&json).unwrap();
		assert_eq!(back, public);
	}
}
