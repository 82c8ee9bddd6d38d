// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! WireGuard key material: Curve25519 private/public keys and pre-shared
//! keys, carried as 32 raw bytes and spelled as padded base64 in transit,
//! plus on-disk persistence for a node's device key.

mod keys;
mod keys_file;

pub use keys::{KeyError, WgKeyPair, WgPresharedKey, WgPrivateKey, WgPublicKey};
pub use keys_file::{
	get_or_create_key, load_key_from_file, save_key_to_file, KeyFileError,
};
