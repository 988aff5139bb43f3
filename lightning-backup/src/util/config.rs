// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Various user-configurable backup locations and limits.

use std::path::{Path, PathBuf};

use crate::util::persist::{PEER_STORAGE_PRIMARY_NAMESPACE, PEER_STORAGE_SECONDARY_NAMESPACE};

/// The file name our own channel backup is written to by default.
pub const DEFAULT_BACKUP_FILE_NAME: &str = "channel.backup";

/// The file name the backups our peers hand to us are written to by default.
pub const DEFAULT_PEER_BACKUP_FILE_NAME: &str = "peer_storage.backup";

/// The number of blocks after which the data of a peer we no longer have channels with is
/// deleted, roughly two weeks.
pub const DEFAULT_MAX_WIPE_WINDOW: u32 = 2016;

/// Where the [`MultiFile`] keeps its backups.
///
/// [`MultiFile`]: crate::chanbackup::backup_file::MultiFile
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelBackupConfig {
	/// The path of the file holding the encrypted backup of our own channels.
	///
	/// Default value: `channel.backup` in the working directory.
	pub local_backup_file: Option<PathBuf>,
	/// The path of the file holding the backups peers returned to us, if we keep one.
	///
	/// Default value: `None`.
	pub peer_backup_file: Option<PathBuf>,
}

impl ChannelBackupConfig {
	/// Places both backups under `dir` using their default file names.
	pub fn with_backup_dir<P: AsRef<Path>>(dir: P) -> Self {
		let dir = dir.as_ref();
		ChannelBackupConfig {
			local_backup_file: Some(dir.join(DEFAULT_BACKUP_FILE_NAME)),
			peer_backup_file: Some(dir.join(DEFAULT_PEER_BACKUP_FILE_NAME)),
		}
	}
}

impl Default for ChannelBackupConfig {
	fn default() -> Self {
		ChannelBackupConfig {
			local_backup_file: Some(PathBuf::from(DEFAULT_BACKUP_FILE_NAME)),
			peer_backup_file: None,
		}
	}
}

/// How [`KVPeerStorage`] stores the data peers ask us to keep.
///
/// [`KVPeerStorage`]: crate::peer_storage::KVPeerStorage
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerStorageConfig {
	/// The primary namespace blobs are stored under.
	///
	/// Default value: [`PEER_STORAGE_PRIMARY_NAMESPACE`].
	pub primary_namespace: String,
	/// The secondary namespace blobs are stored under.
	///
	/// Default value: [`PEER_STORAGE_SECONDARY_NAMESPACE`].
	pub secondary_namespace: String,
	/// How many blocks after being marked for deletion a peer's data is kept around.
	///
	/// Default value: [`DEFAULT_MAX_WIPE_WINDOW`].
	pub max_wipe_window: u32,
}

impl Default for PeerStorageConfig {
	fn default() -> Self {
		PeerStorageConfig {
			primary_namespace: PEER_STORAGE_PRIMARY_NAMESPACE.to_string(),
			secondary_namespace: PEER_STORAGE_SECONDARY_NAMESPACE.to_string(),
			max_wipe_window: DEFAULT_MAX_WIPE_WINDOW,
		}
	}
}
