// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Provides keys to the backup machinery.
//!
//! The provided output descriptors follow a custom LDK-style derivation: the backup key is
//! derived from the node seed so that a restored node can decrypt its backups with nothing but
//! the seed.

use bitcoin::hashes::sha256::Hash as Sha256;
use bitcoin::hashes::{Hash, HashEngine, Hmac, HmacEngine};

use core::sync::atomic::{AtomicUsize, Ordering};

/// The symmetric key used to encrypt static channel backups, both the one we keep on disk and the
/// blobs we hand to our peers.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ScbKey {
	/// Represents the key used to encrypt and decrypt backups.
	pub inner: [u8; 32],
}

impl ScbKey {
	/// Wraps raw key bytes.
	pub fn new(inner: [u8; 32]) -> Self {
		ScbKey { inner }
	}
}

impl core::fmt::Debug for ScbKey {
	fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
		f.write_str("ScbKey(..)")
	}
}

/// A trait that describes a source of entropy.
pub trait EntropySource {
	/// Gets a unique, cryptographically-secure, random 32-byte value. This method must return a
	/// different value each time it is called.
	fn get_secure_random_bytes(&self) -> [u8; 32];
}

/// A trait that can return the key material the backup machinery needs.
pub trait KeysInterface: EntropySource {
	/// Returns the key static channel backups are encrypted with.
	///
	/// This must be deterministic for a given node seed, otherwise backups written before a
	/// restart cannot be decrypted after it.
	fn get_scb_key(&self) -> ScbKey;
}

/// Simple [`KeysInterface`] implementation that takes a 32-byte seed and derives keys from it.
pub struct KeysManager {
	scb_key: ScbKey,
	rand_bytes_unique_start: [u8; 32],
	rand_bytes_index: AtomicUsize,
}

impl KeysManager {
	/// Constructs a [`KeysManager`] from a 32-byte seed.
	///
	/// `starting_time` isn't strictly required to actually be a time, but it must absolutely,
	/// without a doubt, be unique to this instance. ie if you start multiple times with the same
	/// seed, `starting_time` must be unique to each run. Thus, the easiest way to achieve this is
	/// to simply use the current time (with very high precision).
	///
	/// The seed MUST be backed up safely prior to use so that the backup key can be re-created.
	pub fn new(seed: &[u8; 32], starting_time_secs: u64, starting_time_nanos: u32) -> Self {
		let mut hmac = HmacEngine::<Sha256>::new(seed);
		hmac.input(b"static channel backup");
		let scb_key = ScbKey { inner: Hmac::from_engine(hmac).to_byte_array() };

		let mut unique_start = Sha256::engine();
		unique_start.input(&starting_time_secs.to_be_bytes());
		unique_start.input(&starting_time_nanos.to_be_bytes());
		unique_start.input(seed);
		let rand_bytes_unique_start = Sha256::from_engine(unique_start).to_byte_array();

		KeysManager { scb_key, rand_bytes_unique_start, rand_bytes_index: AtomicUsize::new(0) }
	}
}

impl EntropySource for KeysManager {
	fn get_secure_random_bytes(&self) -> [u8; 32] {
		let index = self.rand_bytes_index.fetch_add(1, Ordering::AcqRel) as u64;
		let mut sha = Sha256::engine();
		sha.input(&self.rand_bytes_unique_start);
		sha.input(&index.to_be_bytes());
		Sha256::from_engine(sha).to_byte_array()
	}
}

impl KeysInterface for KeysManager {
	fn get_scb_key(&self) -> ScbKey {
		self.scb_key
	}
}
