// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Containers mapping a peer identifier to that peer's backup.
//!
//! Both forms share one encoding: a big-endian `u32` entry count followed by, for each entry in
//! ascending key order, a `u16` length-prefixed UTF-8 key and a `u16` length-prefixed value. In the
//! partial form the value is an opaque blob we hold for the peer. In the full form it is a
//! [`PackedMulti`] we can decrypt ourselves.

use std::collections::HashMap;
use std::io::Read;

use crate::chanbackup::multi::{Multi, PackedMulti};
use crate::msgs::DecodeError;
use crate::sign::{EntropySource, ScbKey};
use crate::util::errors::BackupError;
use crate::util::ser::{self, Readable};

// Each entry is at least two empty length prefixes.
const MIN_ENTRY_LEN: usize = 4;

/// A decrypted backup per peer identifier.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PeerBackupMulti(pub HashMap<String, Multi>);

impl PeerBackupMulti {
	/// Packs each [`Multi`] independently under `key`, keeping the peer identifiers in the clear.
	pub fn partially_pack<ES: EntropySource + ?Sized>(
		&self, key: &ScbKey, entropy_source: &ES,
	) -> Result<HashMap<String, Vec<u8>>, BackupError> {
		let mut data = HashMap::with_capacity(self.0.len());
		for (peer, multi) in self.0.iter() {
			let packed = multi.pack(key, &entropy_source.get_secure_random_bytes())?;
			data.insert(peer.clone(), packed.0);
		}
		Ok(data)
	}

	/// Packs every entry under `key` and encodes the resulting map.
	pub fn pack<ES: EntropySource + ?Sized>(
		&self, key: &ScbKey, entropy_source: &ES,
	) -> Result<Vec<u8>, BackupError> {
		pack_partial_peer_backup_multi(&self.partially_pack(key, entropy_source)?)
	}

	/// Decodes a map written by [`Self::pack`] and decrypts every entry with `key`.
	pub fn unpack(bytes: &[u8], key: &ScbKey) -> Result<Self, BackupError> {
		let data = unpack_partial_peer_backup_multi(bytes)?;
		let mut multis = HashMap::with_capacity(data.len());
		for (peer, packed) in data {
			let multi = PackedMulti(packed).unpack(key)?;
			multis.insert(peer, multi);
		}
		Ok(PeerBackupMulti(multis))
	}
}

/// Encodes a map of peer identifier to opaque blob.
///
/// Entries are written in ascending key order so equal maps always encode identically. Fails if a
/// key or value is longer than `u16::MAX` bytes.
pub fn pack_partial_peer_backup_multi(
	data: &HashMap<String, Vec<u8>>,
) -> Result<Vec<u8>, BackupError> {
	let count: u32 = data.len().try_into().map_err(|_| {
		std::io::Error::new(std::io::ErrorKind::InvalidInput, "too many peer backups")
	})?;
	let mut keys: Vec<&String> = data.keys().collect();
	keys.sort();

	let mut buf = Vec::new();
	buf.extend_from_slice(&count.to_be_bytes());
	for peer in keys {
		ser::write_u16_prefixed(&mut buf, peer.as_bytes())?;
		ser::write_u16_prefixed(&mut buf, &data[peer])?;
	}
	Ok(buf)
}

/// Decodes a map written by [`pack_partial_peer_backup_multi`] without looking at the values.
///
/// Rejects counts that the input could not possibly hold, truncated entries, non-UTF-8 or
/// duplicate keys, and trailing bytes.
pub fn unpack_partial_peer_backup_multi(
	bytes: &[u8],
) -> Result<HashMap<String, Vec<u8>>, DecodeError> {
	let mut reader = bytes;
	let count: u32 = Readable::read(&mut reader)?;
	if count as usize > reader.len() / MIN_ENTRY_LEN {
		return Err(DecodeError::BadLengthDescriptor);
	}

	let mut data = HashMap::with_capacity(count as usize);
	for _ in 0..count {
		let key = read_key(&mut reader)?;
		let value = ser::read_u16_prefixed(&mut reader)?;
		if data.insert(key, value).is_some() {
			return Err(DecodeError::InvalidValue);
		}
	}
	if !reader.is_empty() {
		return Err(DecodeError::BadLengthDescriptor);
	}
	Ok(data)
}

fn read_key<R: Read>(reader: &mut R) -> Result<String, DecodeError> {
	let key = ser::read_u16_prefixed(reader)?;
	String::from_utf8(key).map_err(|_| DecodeError::InvalidValue)
}
