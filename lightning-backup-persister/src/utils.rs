// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

use lightning_backup::util::persist::{KVSTORE_NAMESPACE_KEY_ALPHABET, KVSTORE_NAMESPACE_KEY_MAX_LEN};
use lightning_backup::util::string::PrintableString;

use std::io;

pub(crate) fn is_valid_kvstore_str(key: &str) -> bool {
	key.len() <= KVSTORE_NAMESPACE_KEY_MAX_LEN
		&& key.chars().all(|c| KVSTORE_NAMESPACE_KEY_ALPHABET.contains(c))
}

/// Checks `primary_namespace`, `secondary_namespace` and, for operations on a single entry, `key`
/// against the [`KVStore`] naming rules.
///
/// Invalid names are a bug in the caller, so this also fails a debug assertion.
///
/// [`KVStore`]: lightning_backup::util::persist::KVStore
pub(crate) fn check_namespace_key_validity(
	primary_namespace: &str, secondary_namespace: &str, key: Option<&str>, operation: &str,
) -> Result<(), io::Error> {
	let problem = if key.map_or(false, |key| key.is_empty()) {
		Some("key may not be empty")
	} else if primary_namespace.is_empty() && !secondary_namespace.is_empty() {
		Some("primary namespace may not be empty if a non-empty secondary namespace is given")
	} else if !is_valid_kvstore_str(primary_namespace)
		|| !is_valid_kvstore_str(secondary_namespace)
		|| !key.map_or(true, is_valid_kvstore_str)
	{
		Some("namespaces and key must be valid")
	} else {
		None
	};

	match problem {
		Some(problem) => {
			let msg = format!(
				"Failed to {} {}/{}/{}: {}.",
				operation,
				PrintableString(primary_namespace),
				PrintableString(secondary_namespace),
				PrintableString(key.unwrap_or("")),
				problem
			);
			debug_assert!(false, "{}", msg);
			Err(io::Error::new(io::ErrorKind::Other, msg))
		},
		None => Ok(()),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn valid_strings() {
		assert!(is_valid_kvstore_str(""));
		assert!(is_valid_kvstore_str("peer_storage"));
		assert!(is_valid_kvstore_str(&"a".repeat(KVSTORE_NAMESPACE_KEY_MAX_LEN)));
		assert!(!is_valid_kvstore_str(&"a".repeat(KVSTORE_NAMESPACE_KEY_MAX_LEN + 1)));
		assert!(!is_valid_kvstore_str("peer/storage"));
		assert!(!is_valid_kvstore_str("peer storage"));
	}

	#[test]
	fn valid_combinations_pass() {
		assert!(check_namespace_key_validity("peer_storage", "", Some("key"), "read").is_ok());
		assert!(check_namespace_key_validity("", "", Some("key"), "read").is_ok());
		assert!(check_namespace_key_validity("peer_storage", "", None, "list").is_ok());
	}

	#[test]
	#[should_panic]
	fn empty_key_is_rejected() {
		let _ = check_namespace_key_validity("peer_storage", "", Some(""), "write");
	}

	#[test]
	#[should_panic]
	fn secondary_without_primary_is_rejected() {
		let _ = check_namespace_key_validity("", "sub", None, "list");
	}
}
