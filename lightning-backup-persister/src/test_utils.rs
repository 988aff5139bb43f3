// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

use lightning_backup::util::persist::{KVStore, KVSTORE_NAMESPACE_KEY_MAX_LEN};

use std::panic::RefUnwindSafe;

pub(crate) fn do_read_write_remove_list_persist<K: KVStore + RefUnwindSafe>(kv_store: &K) {
	let data = [42u8; 32];

	let primary_namespace = "peer_storage";
	let secondary_namespace = "custodial";
	let key = "testkey";

	kv_store.write(primary_namespace, secondary_namespace, key, &data).unwrap();

	// Empty namespaces are fine, a secondary namespace without a primary or an empty key is not.
	kv_store.write("", "", key, &data).unwrap();
	let res = std::panic::catch_unwind(|| kv_store.write("", secondary_namespace, key, &data));
	assert!(res.is_err());
	let res = std::panic::catch_unwind(|| {
		kv_store.write(primary_namespace, secondary_namespace, "", &data)
	});
	assert!(res.is_err());

	let listed_keys = kv_store.list(primary_namespace, secondary_namespace).unwrap();
	assert_eq!(listed_keys, vec![key.to_string()]);

	let read_data = kv_store.read(primary_namespace, secondary_namespace, key).unwrap();
	assert_eq!(data, &*read_data);

	kv_store.write(primary_namespace, secondary_namespace, key, &[7; 3]).unwrap();
	assert_eq!(kv_store.read(primary_namespace, secondary_namespace, key).unwrap(), vec![7; 3]);

	kv_store.remove(primary_namespace, secondary_namespace, key, false).unwrap();
	assert!(kv_store.list(primary_namespace, secondary_namespace).unwrap().is_empty());
	let err = kv_store.read(primary_namespace, secondary_namespace, key).unwrap_err();
	assert_eq!(err.kind(), std::io::ErrorKind::NotFound);

	// Removing what is not there succeeds.
	kv_store.remove(primary_namespace, secondary_namespace, key, false).unwrap();

	let max_chars: String = std::iter::repeat('A').take(KVSTORE_NAMESPACE_KEY_MAX_LEN).collect();
	kv_store.write(&max_chars, &max_chars, &max_chars, &data).unwrap();

	let listed_keys = kv_store.list(&max_chars, &max_chars).unwrap();
	assert_eq!(listed_keys, vec![max_chars.clone()]);

	let read_data = kv_store.read(&max_chars, &max_chars, &max_chars).unwrap();
	assert_eq!(data, &*read_data);

	kv_store.remove(&max_chars, &max_chars, &max_chars, false).unwrap();
	assert!(kv_store.list(&max_chars, &max_chars).unwrap().is_empty());
}
