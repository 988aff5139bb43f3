// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Atomic on-disk persistence of backups.
//!
//! A backup file is never written in place. New content goes to a temporary file next to it which
//! is synced, closed and then renamed over the old file, so after a crash the backup file holds
//! either the previous or the new content in full.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::chanbackup::multi::{Multi, PackedMulti};
use crate::chanbackup::peer_multi::pack_partial_peer_backup_multi;
use crate::sign::ScbKey;
use crate::util::config::ChannelBackupConfig;
use crate::util::errors::BackupError;
use crate::util::logger::Logger;

/// The name of the temporary file new backups are staged in before being renamed into place.
pub const TEMP_BACKUP_FILE_NAME: &str = "temp-dont-use.backup";

/// The categories of backup a [`MultiFile`] keeps.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum BackupKey {
	/// The backup of our own channels.
	Local,
	/// The backups our peers hold for us and hand back.
	Peer,
}

/// A backup file on disk along with the path new content is staged at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackupFile {
	file_path: Option<PathBuf>,
	temp_file_path: Option<PathBuf>,
}

impl BackupFile {
	/// Describes a backup living at `file_path`, staging updates in [`TEMP_BACKUP_FILE_NAME`] in
	/// the same directory so the final rename never crosses filesystems.
	pub fn new(file_path: Option<PathBuf>) -> Self {
		let temp_file_path = file_path.as_ref().map(|path| parent_dir(path).join(TEMP_BACKUP_FILE_NAME));
		BackupFile { file_path, temp_file_path }
	}

	/// The path of the backup file itself.
	pub fn file_path(&self) -> Option<&Path> {
		self.file_path.as_deref()
	}

	/// The path new content is staged at.
	pub fn temp_file_path(&self) -> Option<&Path> {
		self.temp_file_path.as_deref()
	}
}

fn parent_dir(path: &Path) -> PathBuf {
	match path.parent() {
		Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
		_ => PathBuf::from("."),
	}
}

// Removes the staged file when dropped unless it has been renamed into place.
struct TempBackupFile<'a> {
	path: &'a Path,
	committed: bool,
}

impl<'a> TempBackupFile<'a> {
	fn new(path: &'a Path) -> Self {
		TempBackupFile { path, committed: false }
	}

	fn commit(mut self) {
		self.committed = true;
	}
}

impl<'a> Drop for TempBackupFile<'a> {
	fn drop(&mut self) {
		if !self.committed {
			let _ = fs::remove_file(self.path);
		}
	}
}

/// The storage a [`SubSwapper`] and [`PeerBackup`] commit backups to.
///
/// [`SubSwapper`]: crate::chanbackup::sub_swapper::SubSwapper
/// [`PeerBackup`]: crate::chanbackup::peer_backup::PeerBackup
pub trait Swapper {
	/// Atomically replaces our local backup with `new_backup`.
	fn update_and_swap_local_backup(&self, new_backup: &PackedMulti) -> Result<(), BackupError>;

	/// Reads and decrypts our local backup.
	///
	/// Returns [`BackupError::BackupNotFound`] if no backup has been written yet.
	fn extract_local_backup_multi(&self, key: &ScbKey) -> Result<Multi, BackupError>;

	/// Atomically replaces the stored peer backups with `backups`.
	fn update_and_swap_peer_backup(
		&self, backups: &HashMap<String, Vec<u8>>,
	) -> Result<(), BackupError>;

	/// Returns the raw encoding of the stored peer backups, leaving decoding to the caller as the
	/// entries may not be ours to decrypt.
	///
	/// Returns [`BackupError::BackupNotFound`] if nothing has been written yet.
	fn extract_peer_backup_multi(&self) -> Result<Vec<u8>, BackupError>;
}

/// A [`Swapper`] keeping each [`BackupKey`] category in its own file.
pub struct MultiFile<L: Deref>
where
	L::Target: Logger,
{
	backups: HashMap<BackupKey, BackupFile>,
	// Categories in the same directory share a temp file.
	swap_lock: Mutex<()>,
	logger: L,
}

impl<L: Deref> MultiFile<L>
where
	L::Target: Logger,
{
	/// Creates a `MultiFile` managing the given backup files.
	pub fn new(backups: HashMap<BackupKey, BackupFile>, logger: L) -> Self {
		MultiFile { backups, swap_lock: Mutex::new(()), logger }
	}

	/// Creates a `MultiFile` for the paths in `config`.
	pub fn from_config(config: &ChannelBackupConfig, logger: L) -> Self {
		let mut backups = HashMap::new();
		backups.insert(BackupKey::Local, BackupFile::new(config.local_backup_file.clone()));
		if let Some(peer_backup_file) = &config.peer_backup_file {
			backups.insert(BackupKey::Peer, BackupFile::new(Some(peer_backup_file.clone())));
		}
		Self::new(backups, logger)
	}

	/// Atomically replaces the content of the `key` backup file with `new_backup`.
	///
	/// Any temp file left behind by an earlier interrupted swap is removed first. The staged file
	/// is removed again on every failure path. Once the rename went through the swap is reported
	/// as successful, even if syncing the directory afterwards fails.
	pub fn update_and_swap(&self, key: BackupKey, new_backup: &[u8]) -> Result<(), BackupError> {
		let backup = self.backups.get(&key).ok_or(BackupError::NoBackupFileExists)?;
		let file_path = backup.file_path().ok_or(BackupError::NoBackupFileExists)?;
		let temp_file_path = backup.temp_file_path().ok_or(BackupError::NoTempBackupFile)?;

		let _swap_guard = self.swap_lock.lock().unwrap();

		log_info!(self.logger, "Updating backup file at {}", file_path.display());

		if temp_file_path.exists() {
			log_info!(
				self.logger,
				"Found old temp backup @ {}, removing before swap",
				temp_file_path.display()
			);
			fs::remove_file(temp_file_path)?;
		}

		let parent_directory = parent_dir(file_path);
		fs::create_dir_all(&parent_directory)?;

		let temp_file = TempBackupFile::new(temp_file_path);
		{
			let mut f = fs::File::create(temp_file_path)?;
			f.write_all(new_backup)?;
			f.sync_all()?;
		}

		log_info!(self.logger, "Swapping old backup file for new at {}", file_path.display());
		fs::rename(temp_file_path, file_path)?;
		temp_file.commit();

		self.sync_dir(&parent_directory);
		Ok(())
	}

	fn sync_dir(&self, dir: &Path) {
		#[cfg(not(target_os = "windows"))]
		{
			let res = fs::OpenOptions::new().read(true).open(dir).and_then(|f| f.sync_all());
			if let Err(e) = res {
				log_warn!(self.logger, "Unable to sync backup directory {}: {}", dir.display(), e);
			}
		}
		#[cfg(target_os = "windows")]
		let _ = dir;
	}

	fn read_backup(&self, key: BackupKey) -> Result<Vec<u8>, BackupError> {
		let backup = self.backups.get(&key).ok_or(BackupError::NoBackupFileExists)?;
		let file_path = backup.file_path().ok_or(BackupError::NoBackupFileExists)?;
		fs::read(file_path).map_err(|e| {
			if e.kind() == std::io::ErrorKind::NotFound {
				BackupError::BackupNotFound
			} else {
				BackupError::Io(e)
			}
		})
	}
}

impl<L: Deref> Swapper for MultiFile<L>
where
	L::Target: Logger,
{
	fn update_and_swap_local_backup(&self, new_backup: &PackedMulti) -> Result<(), BackupError> {
		self.update_and_swap(BackupKey::Local, &new_backup.0)
	}

	fn extract_local_backup_multi(&self, key: &ScbKey) -> Result<Multi, BackupError> {
		let packed = PackedMulti(self.read_backup(BackupKey::Local)?);
		packed.unpack(key)
	}

	fn update_and_swap_peer_backup(
		&self, backups: &HashMap<String, Vec<u8>>,
	) -> Result<(), BackupError> {
		let encoded = pack_partial_peer_backup_multi(backups)?;
		self.update_and_swap(BackupKey::Peer, &encoded)
	}

	fn extract_peer_backup_multi(&self) -> Result<Vec<u8>, BackupError> {
		self.read_backup(BackupKey::Peer)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::chanbackup::peer_multi::unpack_partial_peer_backup_multi;
	use crate::util::test_utils::{self, TestLogger};
	use std::sync::Arc;

	fn multi_file_in<'a>(dir: &Path, logger: &'a TestLogger) -> MultiFile<&'a TestLogger> {
		MultiFile::from_config(&ChannelBackupConfig::with_backup_dir(dir), logger)
	}

	#[test]
	fn update_and_swap_replaces_content() {
		let dir = test_utils::random_storage_path();
		let logger = TestLogger::new();
		let multi_file = multi_file_in(&dir, &logger);

		multi_file.update_and_swap(BackupKey::Local, &[1, 2, 3]).unwrap();
		assert_eq!(fs::read(dir.join("channel.backup")).unwrap(), vec![1, 2, 3]);
		multi_file.update_and_swap(BackupKey::Local, &[4, 5]).unwrap();
		assert_eq!(fs::read(dir.join("channel.backup")).unwrap(), vec![4, 5]);
		assert!(!dir.join(TEMP_BACKUP_FILE_NAME).exists());
		logger.assert_log_contains(
			"lightning_backup::chanbackup::backup_file",
			"Swapping old backup file for new",
			2,
		);

		fs::remove_dir_all(dir).unwrap();
	}

	#[cfg(not(target_os = "windows"))]
	#[test]
	fn directory_sync_failure_is_only_logged() {
		let dir = test_utils::random_storage_path();
		let logger = TestLogger::new();
		let multi_file = multi_file_in(&dir, &logger);

		multi_file.sync_dir(&dir.join("missing"));
		logger.assert_log_contains(
			"lightning_backup::chanbackup::backup_file",
			"Unable to sync backup directory",
			1,
		);

		multi_file.update_and_swap(BackupKey::Local, &[1]).unwrap();
		logger.assert_log_contains(
			"lightning_backup::chanbackup::backup_file",
			"Unable to sync backup directory",
			1,
		);
	}

	#[test]
	fn stale_temp_file_is_removed() {
		let dir = test_utils::random_storage_path();
		let logger = TestLogger::new();
		let multi_file = multi_file_in(&dir, &logger);

		fs::create_dir_all(&dir).unwrap();
		fs::write(dir.join(TEMP_BACKUP_FILE_NAME), b"half written").unwrap();
		fs::write(dir.join("channel.backup"), b"previous").unwrap();

		multi_file.update_and_swap(BackupKey::Local, b"next").unwrap();
		assert_eq!(fs::read(dir.join("channel.backup")).unwrap(), b"next");
		assert!(!dir.join(TEMP_BACKUP_FILE_NAME).exists());
		logger.assert_log_contains(
			"lightning_backup::chanbackup::backup_file",
			"Found old temp backup",
			1,
		);

		fs::remove_dir_all(dir).unwrap();
	}

	#[test]
	fn failed_rename_leaves_old_content_and_no_temp() {
		let dir = test_utils::random_storage_path();
		let logger = TestLogger::new();
		let multi_file = multi_file_in(&dir, &logger);

		// A non-empty directory where the backup should be makes the rename fail.
		fs::create_dir_all(dir.join("channel.backup").join("occupied")).unwrap();
		assert!(multi_file.update_and_swap(BackupKey::Local, b"new").is_err());
		assert!(!dir.join(TEMP_BACKUP_FILE_NAME).exists());
		assert!(dir.join("channel.backup").is_dir());

		fs::remove_dir_all(dir).unwrap();
	}

	#[test]
	fn missing_paths_are_configuration_errors() {
		let logger = TestLogger::new();
		let multi_file = MultiFile::new(HashMap::new(), &logger);
		match multi_file.update_and_swap(BackupKey::Peer, b"x") {
			Err(BackupError::NoBackupFileExists) => {},
			_ => panic!(),
		}

		let mut backups = HashMap::new();
		backups.insert(BackupKey::Local, BackupFile::new(None));
		let multi_file = MultiFile::new(backups, &logger);
		match multi_file.update_and_swap(BackupKey::Local, b"x") {
			Err(BackupError::NoBackupFileExists) => {},
			_ => panic!(),
		}

		let mut backups = HashMap::new();
		let no_temp = BackupFile { file_path: Some(PathBuf::from("channel.backup")), temp_file_path: None };
		backups.insert(BackupKey::Local, no_temp);
		let multi_file = MultiFile::new(backups, &logger);
		match multi_file.update_and_swap(BackupKey::Local, b"x") {
			Err(BackupError::NoTempBackupFile) => {},
			_ => panic!(),
		}
	}

	#[test]
	fn temp_file_is_colocated() {
		let backup = BackupFile::new(Some(PathBuf::from("/data/node/channel.backup")));
		assert_eq!(backup.temp_file_path(), Some(Path::new("/data/node/temp-dont-use.backup")));
		let backup = BackupFile::new(Some(PathBuf::from("channel.backup")));
		assert_eq!(backup.temp_file_path(), Some(Path::new("./temp-dont-use.backup")));
	}

	#[test]
	fn extract_local_backup() {
		let dir = test_utils::random_storage_path();
		let logger = TestLogger::new();
		let multi_file = multi_file_in(&dir, &logger);
		let key = ScbKey::new([8; 32]);

		let err = multi_file.extract_local_backup_multi(&key).unwrap_err();
		assert!(err.is_not_found());

		let multi = Multi::new(vec![test_utils::single(1), test_utils::single(2)]);
		multi_file.update_and_swap_local_backup(&multi.pack(&key, &[3; 32]).unwrap()).unwrap();
		assert_eq!(multi_file.extract_local_backup_multi(&key).unwrap(), multi);

		match multi_file.extract_local_backup_multi(&ScbKey::new([9; 32])) {
			Err(BackupError::DecryptionFailed) => {},
			_ => panic!(),
		}

		// A truncated file is corruption, not a missing backup.
		fs::write(dir.join("channel.backup"), [0u8; 10]).unwrap();
		let err = multi_file.extract_local_backup_multi(&key).unwrap_err();
		assert!(!err.is_not_found());

		fs::remove_dir_all(dir).unwrap();
	}

	#[test]
	fn peer_backup_swap_and_extract() {
		let dir = test_utils::random_storage_path();
		let logger = TestLogger::new();
		let multi_file = multi_file_in(&dir, &logger);

		assert!(multi_file.extract_peer_backup_multi().unwrap_err().is_not_found());

		let mut backups = HashMap::new();
		backups.insert("alice".to_owned(), vec![1, 2, 3]);
		backups.insert("bob".to_owned(), vec![]);
		multi_file.update_and_swap_peer_backup(&backups).unwrap();

		let raw = multi_file.extract_peer_backup_multi().unwrap();
		assert_eq!(unpack_partial_peer_backup_multi(&raw).unwrap(), backups);
		assert!(!dir.join("channel.backup").exists());

		fs::remove_dir_all(dir).unwrap();
	}

	#[test]
	fn concurrent_swaps_of_both_categories() {
		let dir = test_utils::random_storage_path();
		let logger = Arc::new(TestLogger::new());
		let multi_file = Arc::new(MultiFile::from_config(
			&ChannelBackupConfig::with_backup_dir(&dir),
			Arc::clone(&logger),
		));

		let mut handles = Vec::new();
		for i in 0..4u8 {
			let multi_file = Arc::clone(&multi_file);
			handles.push(std::thread::spawn(move || {
				for j in 0..10u8 {
					if i % 2 == 0 {
						multi_file.update_and_swap(BackupKey::Local, &[i, j]).unwrap();
					} else {
						let mut backups = HashMap::new();
						backups.insert(format!("peer{}", i), vec![j]);
						multi_file.update_and_swap_peer_backup(&backups).unwrap();
					}
				}
			}));
		}
		for handle in handles {
			handle.join().unwrap();
		}

		let local = fs::read(dir.join("channel.backup")).unwrap();
		assert_eq!(local.len(), 2);
		assert_eq!(local[1], 9);
		let peer = unpack_partial_peer_backup_multi(&multi_file.extract_peer_backup_multi().unwrap())
			.unwrap();
		assert_eq!(peer.len(), 1);
		assert!(!dir.join(TEMP_BACKUP_FILE_NAME).exists());

		fs::remove_dir_all(dir).unwrap();
	}
}
