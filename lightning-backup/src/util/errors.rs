// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Error types live here.

use crate::msgs::DecodeError;

use core::fmt;
use std::io;

/// An error returned by the backup machinery.
#[derive(Debug)]
pub enum BackupError {
	/// A [`BackupFile`] was constructed without a file path.
	///
	/// [`BackupFile`]: crate::chanbackup::backup_file::BackupFile
	NoBackupFileExists,
	/// A [`BackupFile`] was asked to swap without a temporary file path.
	///
	/// [`BackupFile`]: crate::chanbackup::backup_file::BackupFile
	NoTempBackupFile,
	/// The requested backup file does not exist on disk.
	BackupNotFound,
	/// Stored or received bytes could not be decoded.
	Decode(DecodeError),
	/// A packed backup failed authentication, usually because it was encrypted under a different
	/// key or has been tampered with.
	DecryptionFailed,
	/// A blob exceeded the peer storage size limit.
	PeerStorageBytesExceeded {
		/// The size of the rejected blob.
		size: usize,
	},
	/// Subscribing to an upstream event source failed.
	SubscriptionFailed {
		/// A human-readable error message
		err: String,
	},
	/// Error from the underlying filesystem or key-value store.
	Io(io::Error),
}

impl BackupError {
	/// Whether this error indicates that the backup being accessed simply does not exist yet.
	pub fn is_not_found(&self) -> bool {
		match self {
			BackupError::BackupNotFound => true,
			BackupError::Io(e) => e.kind() == io::ErrorKind::NotFound,
			_ => false,
		}
	}
}

impl fmt::Display for BackupError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			BackupError::NoBackupFileExists => f.write_str("no backup file path was specified"),
			BackupError::NoTempBackupFile => f.write_str("no temporary backup file path was specified"),
			BackupError::BackupNotFound => f.write_str("backup file not found"),
			BackupError::Decode(e) => write!(f, "failed to decode backup: {}", e),
			BackupError::DecryptionFailed => f.write_str("failed to decrypt backup"),
			BackupError::PeerStorageBytesExceeded { size } => write!(
				f,
				"peer storage blob of {} bytes exceeds the {} byte limit",
				size,
				crate::msgs::MAX_PEER_STORAGE_BYTES
			),
			BackupError::SubscriptionFailed { err } => write!(f, "subscription failed: {}", err),
			BackupError::Io(e) => write!(f, "I/O error: {}", e),
		}
	}
}

impl std::error::Error for BackupError {
	fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
		match self {
			BackupError::Io(e) => Some(e),
			_ => None,
		}
	}
}

impl From<io::Error> for BackupError {
	fn from(e: io::Error) -> Self {
		BackupError::Io(e)
	}
}

impl From<DecodeError> for BackupError {
	fn from(e: DecodeError) -> Self {
		BackupError::Decode(e)
	}
}
