// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Encryption of static channel backups.
//!
//! Packed backups are of the form `ciphertext || tag (16 bytes) || random_bytes (32 bytes)`. The
//! ChaCha20Poly1305 nonce is not stored but derived from the trailing random bytes and the key,
//! so the same key never sees the same nonce as long as the random bytes are fresh.

use bitcoin::hashes::sha256::Hash as Sha256;
use bitcoin::hashes::{Hash, HashEngine, Hmac, HmacEngine};

use chacha20poly1305::aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce, Tag};

use std::io;

use crate::msgs::DecodeError;
use crate::sign::ScbKey;
use crate::util::errors::BackupError;

const TAG_LEN: usize = 16;
const RANDOM_BYTES_LEN: usize = 32;

/// The shortest possible packed backup, an empty plaintext plus the tag and random bytes.
pub const MIN_CIPHERTEXT_LEN: usize = TAG_LEN + RANDOM_BYTES_LEN;

/// Nonce for encryption and decryption: Hmac(Sha256(key) + random_bytes).
fn derive_nonce(key: &ScbKey, random_bytes: &[u8]) -> [u8; 12] {
	let key_hash = Sha256::hash(&key.inner);

	let mut hmac = HmacEngine::<Sha256>::new(key_hash.as_byte_array());
	hmac.input(random_bytes);
	let mut nonce = [0u8; 12];
	// First 4 bytes of the nonce should be 0.
	nonce[4..].copy_from_slice(&Hmac::from_engine(hmac).to_byte_array()[0..8]);

	nonce
}

/// Encrypts `plaintext` under `key`, appending the tag and `random_bytes`.
pub fn encrypt(
	key: &ScbKey, random_bytes: &[u8; 32], plaintext: Vec<u8>,
) -> Result<Vec<u8>, BackupError> {
	let mut data = plaintext;
	let nonce = derive_nonce(key, random_bytes);

	let cipher = ChaCha20Poly1305::new(Key::from_slice(&key.inner));
	let tag = cipher
		.encrypt_in_place_detached(Nonce::from_slice(&nonce), b"", &mut data)
		.map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "plaintext too large to encrypt"))?;

	data.reserve_exact(TAG_LEN + RANDOM_BYTES_LEN);
	data.extend_from_slice(&tag);
	data.extend_from_slice(random_bytes);
	Ok(data)
}

/// Decrypts a blob previously produced by [`encrypt`] under the same `key`.
///
/// Returns [`BackupError::DecryptionFailed`] if the blob was not encrypted with `key` or has been
/// modified.
pub fn decrypt(key: &ScbKey, ciphertext: &[u8]) -> Result<Vec<u8>, BackupError> {
	if ciphertext.len() < MIN_CIPHERTEXT_LEN {
		return Err(DecodeError::ShortRead.into());
	}

	let (data, random_bytes) = ciphertext.split_at(ciphertext.len() - RANDOM_BYTES_LEN);
	let (encrypted_data, tag) = data.split_at(data.len() - TAG_LEN);

	let nonce = derive_nonce(key, random_bytes);

	let cipher = ChaCha20Poly1305::new(Key::from_slice(&key.inner));
	let mut plaintext = encrypted_data.to_vec();
	cipher
		.decrypt_in_place_detached(
			Nonce::from_slice(&nonce),
			b"",
			&mut plaintext,
			Tag::from_slice(tag),
		)
		.map_err(|_| BackupError::DecryptionFailed)?;

	Ok(plaintext)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn encrypt_then_decrypt() {
		let key = ScbKey::new([3; 32]);
		let cipher = encrypt(&key, &[9; 32], vec![1, 2, 3]).unwrap();
		assert_eq!(cipher.len(), 3 + MIN_CIPHERTEXT_LEN);
		assert_eq!(&cipher[cipher.len() - 32..], &[9; 32]);
		assert_eq!(decrypt(&key, &cipher).unwrap(), vec![1, 2, 3]);
	}

	#[test]
	fn empty_plaintext() {
		let key = ScbKey::new([3; 32]);
		let cipher = encrypt(&key, &[9; 32], Vec::new()).unwrap();
		assert_eq!(cipher.len(), MIN_CIPHERTEXT_LEN);
		assert!(decrypt(&key, &cipher).unwrap().is_empty());
	}

	#[test]
	fn wrong_key_fails() {
		let cipher = encrypt(&ScbKey::new([3; 32]), &[9; 32], vec![1, 2, 3]).unwrap();
		match decrypt(&ScbKey::new([4; 32]), &cipher) {
			Err(BackupError::DecryptionFailed) => {},
			_ => panic!(),
		}
	}

	#[test]
	fn tampered_ciphertext_fails() {
		let key = ScbKey::new([3; 32]);
		let mut cipher = encrypt(&key, &[9; 32], vec![1, 2, 3]).unwrap();
		cipher[0] ^= 1;
		match decrypt(&key, &cipher) {
			Err(BackupError::DecryptionFailed) => {},
			_ => panic!(),
		}
		// Flipping a random byte changes the nonce.
		let mut cipher = encrypt(&key, &[9; 32], vec![1, 2, 3]).unwrap();
		let last = cipher.len() - 1;
		cipher[last] ^= 1;
		assert!(decrypt(&key, &cipher).is_err());
	}

	#[test]
	fn short_input_rejected() {
		let key = ScbKey::new([3; 32]);
		match decrypt(&key, &[0u8; MIN_CIPHERTEXT_LEN - 1]) {
			Err(BackupError::Decode(DecodeError::ShortRead)) => {},
			_ => panic!(),
		}
	}

	#[test]
	fn fresh_random_bytes_change_ciphertext() {
		let key = ScbKey::new([3; 32]);
		let a = encrypt(&key, &[1; 32], vec![5; 10]).unwrap();
		let b = encrypt(&key, &[2; 32], vec![5; 10]).unwrap();
		assert_ne!(a[..10], b[..10]);
	}
}
