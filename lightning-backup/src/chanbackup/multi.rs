// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The backup of all of our open channels, and its encrypted form.

use std::cmp;
use std::collections::HashSet;
use std::io::{self, Read};

use crate::chanbackup::single::StaticChannelBackup;
use crate::crypto;
use crate::msgs::DecodeError;
use crate::sign::ScbKey;
use crate::util::errors::BackupError;
use crate::util::ser::{Readable, Writeable, Writer};

/// The only [`Multi`] format version we know how to read and write.
pub const MULTI_BACKUP_VERSION: u8 = 0;

// The smallest possible encoding of a `StaticChannelBackup`: version, length, and a body without
// any addresses.
const MIN_SINGLE_ENCODED_LEN: usize = 1 + 2 + 1 + 36 + 8 + 33 + 8 + 32 + 2 + 2 + 2;

// Bound on how many records we preallocate for before we've seen them.
const MAX_PREALLOCATED_SINGLES: usize = 1024;

/// The set of [`StaticChannelBackup`]s for all of our open channels.
///
/// Two `Multi`s are equal if they hold the same records, independent of their order.
#[derive(Clone, Debug)]
pub struct Multi {
	/// The format version.
	pub version: u8,
	/// One record per channel, keyed by funding outpoint.
	pub static_backups: Vec<StaticChannelBackup>,
}

impl Multi {
	/// Builds a `Multi` of the current version from `static_backups`.
	pub fn new(static_backups: Vec<StaticChannelBackup>) -> Self {
		Multi { version: MULTI_BACKUP_VERSION, static_backups }
	}

	fn sorted_backups(&self) -> Vec<&StaticChannelBackup> {
		let mut backups: Vec<&StaticChannelBackup> = self.static_backups.iter().collect();
		backups.sort_by_key(|backup| backup.funding_outpoint);
		backups
	}

	/// Serializes and encrypts this `Multi` under `key`.
	///
	/// Records are written sorted by funding outpoint, so the result only depends on the set of
	/// records and `random_bytes`. Fails if two records share a funding outpoint.
	pub fn pack(&self, key: &ScbKey, random_bytes: &[u8; 32]) -> Result<PackedMulti, BackupError> {
		let mut plaintext = Vec::new();
		self.write(&mut plaintext)?;
		Ok(PackedMulti(crypto::encrypt(key, random_bytes, plaintext)?))
	}
}

impl PartialEq for Multi {
	fn eq(&self, other: &Multi) -> bool {
		self.version == other.version && self.sorted_backups() == other.sorted_backups()
	}
}

impl Eq for Multi {}

impl Writeable for Multi {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		let count: u32 = self.static_backups.len().try_into().map_err(|_| {
			io::Error::new(io::ErrorKind::InvalidInput, "too many channels in backup")
		})?;
		let backups = self.sorted_backups();
		if backups.windows(2).any(|pair| pair[0].funding_outpoint == pair[1].funding_outpoint) {
			return Err(io::Error::new(
				io::ErrorKind::InvalidInput,
				"duplicate funding outpoint in backup",
			));
		}
		self.version.write(w)?;
		count.write(w)?;
		for backup in backups {
			backup.write(w)?;
		}
		Ok(())
	}
}

impl Readable for Multi {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		let version: u8 = Readable::read(r)?;
		if version != MULTI_BACKUP_VERSION {
			return Err(DecodeError::UnknownVersion);
		}
		let count: u32 = Readable::read(r)?;
		let mut static_backups: Vec<StaticChannelBackup> =
			Vec::with_capacity(cmp::min(count as usize, MAX_PREALLOCATED_SINGLES));
		let mut seen = HashSet::with_capacity(static_backups.capacity());
		for _ in 0..count {
			let backup: StaticChannelBackup = Readable::read(r)?;
			if !seen.insert(backup.funding_outpoint) {
				return Err(DecodeError::InvalidValue);
			}
			static_backups.push(backup);
		}
		Ok(Multi { version, static_backups })
	}
}

/// An encrypted, serialized [`Multi`]. This is the only form in which our own channel backup is
/// ever written to disk or handed to a peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PackedMulti(pub Vec<u8>);

impl PackedMulti {
	/// Decrypts and deserializes the backup.
	///
	/// Fails with [`BackupError::DecryptionFailed`] if it was packed under a different key or has
	/// been modified, and with [`BackupError::Decode`] if the plaintext is malformed.
	pub fn unpack(&self, key: &ScbKey) -> Result<Multi, BackupError> {
		let plaintext = crypto::decrypt(key, &self.0)?;
		if plaintext.len() >= 5 {
			let count = u32::from_be_bytes([plaintext[1], plaintext[2], plaintext[3], plaintext[4]]);
			let max_count = (plaintext.len() - 5) / MIN_SINGLE_ENCODED_LEN;
			if count as usize > max_count {
				return Err(DecodeError::BadLengthDescriptor.into());
			}
		}
		let mut reader = &plaintext[..];
		let multi: Multi = Readable::read(&mut reader)?;
		if !reader.is_empty() {
			return Err(DecodeError::BadLengthDescriptor.into());
		}
		Ok(multi)
	}
}

impl AsRef<[u8]> for PackedMulti {
	fn as_ref(&self) -> &[u8] {
		&self.0
	}
}
