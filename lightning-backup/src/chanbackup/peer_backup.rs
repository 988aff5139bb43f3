// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Backups our peers asked us to hold on to.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::RwLock;

use crate::chanbackup::backup_file::Swapper;
use crate::chanbackup::multi::PackedMulti;
use crate::chanbackup::peer_multi::unpack_partial_peer_backup_multi;
use crate::msgs::MAX_PEER_STORAGE_BYTES;
use crate::sign::KeysInterface;
use crate::util::errors::BackupError;
use crate::util::logger::Logger;

/// Holds the most recent backup blob each peer has sent us.
///
/// Blobs are opaque to us and kept per peer identifier. Every change rewrites the whole set
/// through the [`Swapper`]'s peer backup file, so the file is always a complete snapshot.
pub struct PeerBackup<S: Deref, K: Deref, L: Deref>
where
	S::Target: Swapper,
	K::Target: KeysInterface,
	L::Target: Logger,
{
	backups: RwLock<HashMap<String, Vec<u8>>>,
	swapper: S,
	keys: K,
	logger: L,
}

impl<S: Deref, K: Deref, L: Deref> PeerBackup<S, K, L>
where
	S::Target: Swapper,
	K::Target: KeysInterface,
	L::Target: Logger,
{
	/// Loads the peer backups currently on disk.
	///
	/// A missing peer backup file yields an empty store. A file that cannot be decoded is an
	/// error.
	pub fn new(swapper: S, keys: K, logger: L) -> Result<Self, BackupError> {
		let backups = match swapper.extract_peer_backup_multi() {
			Ok(bytes) => unpack_partial_peer_backup_multi(&bytes)?,
			Err(e) if e.is_not_found() => HashMap::new(),
			Err(e) => return Err(e),
		};
		log_info!(logger, "Loaded backups for {} peers", backups.len());
		Ok(PeerBackup { backups: RwLock::new(backups), swapper, keys, logger })
	}

	/// Decodes both blobs as our own packed backups and checks they hold the same channels.
	pub fn verify_backup(&self, candidate: &[u8], reference: &[u8]) -> Result<bool, BackupError> {
		let key = self.keys.get_scb_key();
		let candidate = PackedMulti(candidate.to_vec()).unpack(&key)?;
		let reference = PackedMulti(reference.to_vec()).unpack(&key)?;
		Ok(candidate == reference)
	}

	/// Stores `data` for `peer_id`, replacing anything held for it before, and returns the
	/// stored bytes.
	///
	/// If the peer backup file cannot be rewritten the previous entry is restored.
	pub fn store_peer_backup(&self, data: Vec<u8>, peer_id: &str) -> Result<Vec<u8>, BackupError> {
		if data.len() > MAX_PEER_STORAGE_BYTES {
			return Err(BackupError::PeerStorageBytesExceeded { size: data.len() });
		}

		let mut backups = self.backups.write().unwrap();
		let previous = backups.insert(peer_id.to_owned(), data.clone());
		if let Err(e) = self.swapper.update_and_swap_peer_backup(&backups) {
			match previous {
				Some(previous) => backups.insert(peer_id.to_owned(), previous),
				None => backups.remove(peer_id),
			};
			log_error!(self.logger, "Unable to persist backup for peer {}: {}", peer_id, e);
			return Err(e);
		}

		log_debug!(self.logger, "Stored {} byte backup for peer {}", data.len(), peer_id);
		Ok(data)
	}

	/// Returns the backup held for `peer_id`, if any.
	pub fn retrieve_backup_for_peer(&self, peer_id: &str) -> Option<Vec<u8>> {
		self.backups.read().unwrap().get(peer_id).cloned()
	}

	/// Drops the backups held for `peer_ids`.
	///
	/// If the peer backup file cannot be rewritten the dropped entries are restored.
	pub fn prune_peer_storage(&self, peer_ids: &[String]) -> Result<(), BackupError> {
		let mut backups = self.backups.write().unwrap();
		let mut pruned = Vec::new();
		for peer_id in peer_ids {
			if let Some(data) = backups.remove(peer_id) {
				pruned.push((peer_id.clone(), data));
			}
		}

		if let Err(e) = self.swapper.update_and_swap_peer_backup(&backups) {
			backups.extend(pruned);
			log_error!(self.logger, "Unable to persist pruned peer backups: {}", e);
			return Err(e);
		}

		log_debug!(self.logger, "Pruned backups for {} peers", pruned.len());
		Ok(())
	}
}
