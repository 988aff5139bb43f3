// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Objects related to [`SqliteStore`] live here.
use crate::utils::check_namespace_key_validity;

use lightning_backup::util::persist::KVStore;
use lightning_backup::util::string::PrintableString;

use rusqlite::{named_params, CachedStatement, Connection};

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// The default database file name.
pub const DEFAULT_SQLITE_DB_FILE_NAME: &str = "backup_data.sqlite";

/// The default table in which we store all data.
pub const DEFAULT_KV_TABLE_NAME: &str = "backup_data";

// The current SQLite `user_version`, bumped whenever the table layout changes.
const SCHEMA_USER_VERSION: u16 = 1;

fn other_err(msg: String) -> io::Error {
	io::Error::new(io::ErrorKind::Other, msg)
}

/// A [`KVStore`] implementation that writes to and reads from an [SQLite] database.
///
/// All namespaces share one table keyed by `(primary_namespace, secondary_namespace, key)`.
///
/// [SQLite]: https://sqlite.org
pub struct SqliteStore {
	connection: Arc<Mutex<Connection>>,
	data_dir: PathBuf,
	kv_table_name: String,
}

impl SqliteStore {
	/// Opens the database in `data_dir`, creating the directory, database file and table as
	/// needed.
	///
	/// `db_file_name` and `kv_table_name` default to [`DEFAULT_SQLITE_DB_FILE_NAME`] and
	/// [`DEFAULT_KV_TABLE_NAME`]. Databases written by a newer schema version are refused.
	pub fn new(
		data_dir: PathBuf, db_file_name: Option<String>, kv_table_name: Option<String>,
	) -> io::Result<Self> {
		let db_file_name = db_file_name.unwrap_or(DEFAULT_SQLITE_DB_FILE_NAME.to_string());
		let kv_table_name = kv_table_name.unwrap_or(DEFAULT_KV_TABLE_NAME.to_string());

		fs::create_dir_all(&data_dir).map_err(|e| {
			other_err(format!(
				"Failed to create database destination directory {}: {}",
				data_dir.display(),
				e
			))
		})?;
		let db_file_path = data_dir.join(db_file_name);

		let connection = Connection::open(&db_file_path).map_err(|e| {
			other_err(format!(
				"Failed to open/create database file {}: {}",
				db_file_path.display(),
				e
			))
		})?;

		let version: u16 = connection
			.query_row("SELECT user_version FROM pragma_user_version", [], |row| row.get(0))
			.map_err(|e| other_err(format!("Failed to read PRAGMA user_version: {}", e)))?;
		if version == 0 {
			connection
				.pragma(
					Some(rusqlite::DatabaseName::Main),
					"user_version",
					SCHEMA_USER_VERSION,
					|_| Ok(()),
				)
				.map_err(|e| other_err(format!("Failed to set PRAGMA user_version: {}", e)))?;
		} else if version > SCHEMA_USER_VERSION {
			return Err(other_err(format!(
				"Failed to open database: incompatible schema version {}. Expected: {}",
				version, SCHEMA_USER_VERSION
			)));
		}

		let sql = format!(
			"CREATE TABLE IF NOT EXISTS {} (
			primary_namespace TEXT NOT NULL,
			secondary_namespace TEXT DEFAULT \"\" NOT NULL,
			key TEXT NOT NULL CHECK (key <> ''),
			value BLOB, PRIMARY KEY ( primary_namespace, secondary_namespace, key )
			);",
			kv_table_name
		);
		connection.execute(&sql, []).map_err(|e| {
			other_err(format!("Failed to create table {}: {}", kv_table_name, e))
		})?;

		let connection = Arc::new(Mutex::new(connection));
		Ok(Self { connection, data_dir, kv_table_name })
	}

	/// Returns the data directory.
	pub fn get_data_dir(&self) -> PathBuf {
		self.data_dir.clone()
	}
}

fn prepare<'conn>(conn: &'conn Connection, sql: &str) -> io::Result<CachedStatement<'conn>> {
	conn.prepare_cached(sql)
		.map_err(|e| other_err(format!("Failed to prepare statement: {}", e)))
}

impl KVStore for SqliteStore {
	fn read(
		&self, primary_namespace: &str, secondary_namespace: &str, key: &str,
	) -> io::Result<Vec<u8>> {
		check_namespace_key_validity(primary_namespace, secondary_namespace, Some(key), "read")?;

		let locked_conn = self.connection.lock().unwrap();
		let sql = format!(
			"SELECT value FROM {} WHERE primary_namespace=:primary_namespace AND secondary_namespace=:secondary_namespace AND key=:key;",
			self.kv_table_name
		);
		let mut stmt = prepare(&locked_conn, &sql)?;

		let res = stmt
			.query_row(
				named_params! {
					":primary_namespace": primary_namespace,
					":secondary_namespace": secondary_namespace,
					":key": key,
				},
				|row| row.get(0),
			)
			.map_err(|e| {
				let path = format!(
					"{}/{}/{}",
					PrintableString(primary_namespace),
					PrintableString(secondary_namespace),
					PrintableString(key)
				);
				match e {
					rusqlite::Error::QueryReturnedNoRows => io::Error::new(
						io::ErrorKind::NotFound,
						format!("Failed to read as key could not be found: {}", path),
					),
					e => other_err(format!("Failed to read from key {}: {}", path, e)),
				}
			})?;
		Ok(res)
	}

	fn write(
		&self, primary_namespace: &str, secondary_namespace: &str, key: &str, buf: &[u8],
	) -> io::Result<()> {
		check_namespace_key_validity(primary_namespace, secondary_namespace, Some(key), "write")?;

		let locked_conn = self.connection.lock().unwrap();
		let sql = format!(
			"INSERT OR REPLACE INTO {} (primary_namespace, secondary_namespace, key, value) VALUES (:primary_namespace, :secondary_namespace, :key, :value);",
			self.kv_table_name
		);
		let mut stmt = prepare(&locked_conn, &sql)?;

		stmt.execute(named_params! {
			":primary_namespace": primary_namespace,
			":secondary_namespace": secondary_namespace,
			":key": key,
			":value": buf,
		})
		.map(|_| ())
		.map_err(|e| {
			other_err(format!(
				"Failed to write to key {}/{}/{}: {}",
				PrintableString(primary_namespace),
				PrintableString(secondary_namespace),
				PrintableString(key),
				e
			))
		})
	}

	fn remove(
		&self, primary_namespace: &str, secondary_namespace: &str, key: &str, _lazy: bool,
	) -> io::Result<()> {
		check_namespace_key_validity(primary_namespace, secondary_namespace, Some(key), "remove")?;

		let locked_conn = self.connection.lock().unwrap();
		let sql = format!(
			"DELETE FROM {} WHERE primary_namespace=:primary_namespace AND secondary_namespace=:secondary_namespace AND key=:key;",
			self.kv_table_name
		);
		let mut stmt = prepare(&locked_conn, &sql)?;

		stmt.execute(named_params! {
			":primary_namespace": primary_namespace,
			":secondary_namespace": secondary_namespace,
			":key": key,
		})
		.map(|_| ())
		.map_err(|e| {
			other_err(format!(
				"Failed to delete key {}/{}/{}: {}",
				PrintableString(primary_namespace),
				PrintableString(secondary_namespace),
				PrintableString(key),
				e
			))
		})
	}

	fn list(&self, primary_namespace: &str, secondary_namespace: &str) -> io::Result<Vec<String>> {
		check_namespace_key_validity(primary_namespace, secondary_namespace, None, "list")?;

		let locked_conn = self.connection.lock().unwrap();
		let sql = format!(
			"SELECT key FROM {} WHERE primary_namespace=:primary_namespace AND secondary_namespace=:secondary_namespace",
			self.kv_table_name
		);
		let mut stmt = prepare(&locked_conn, &sql)?;

		let rows_iter = stmt
			.query_map(
				named_params! {
					":primary_namespace": primary_namespace,
					":secondary_namespace": secondary_namespace,
				},
				|row| row.get(0),
			)
			.map_err(|e| other_err(format!("Failed to retrieve queried rows: {}", e)))?;

		let mut keys = Vec::new();
		for key in rows_iter {
			keys.push(key.map_err(|e| other_err(format!("Failed to retrieve queried rows: {}", e)))?);
		}
		Ok(keys)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::test_utils::do_read_write_remove_list_persist;

	use lightning_backup::peer_storage::KVPeerStorage;
	use lightning_backup::util::config::PeerStorageConfig;
	use lightning_backup::util::test_utils::{
		self, random_storage_path, wait_until, TestChainSource, TestLogger,
	};

	use tokio::runtime::Handle;

	impl Drop for SqliteStore {
		fn drop(&mut self) {
			match fs::remove_dir_all(&self.data_dir) {
				Err(e) => println!("Failed to remove test store directory: {}", e),
				_ => {},
			}
		}
	}

	#[test]
	fn read_write_remove_list_persist() {
		let mut temp_path = random_storage_path();
		temp_path.push("read_write_remove_list_persist");
		let store = SqliteStore::new(
			temp_path,
			Some("test_db".to_string()),
			Some("test_table".to_string()),
		)
		.unwrap();
		do_read_write_remove_list_persist(&store);
	}

	#[test]
	fn data_survives_reopening() {
		let temp_path = random_storage_path();
		{
			let store = SqliteStore::new(temp_path.clone(), None, None).unwrap();
			store.write("peer_storage", "", "alice", &[1, 2, 3]).unwrap();
			// Skip the directory cleanup so the second open finds the database.
			std::mem::forget(store);
		}
		let store = SqliteStore::new(temp_path, None, None).unwrap();
		assert_eq!(store.read("peer_storage", "", "alice").unwrap(), vec![1, 2, 3]);
	}

	#[test]
	fn newer_schema_is_refused() {
		let temp_path = random_storage_path();
		fs::create_dir_all(&temp_path).unwrap();
		let conn = Connection::open(temp_path.join(DEFAULT_SQLITE_DB_FILE_NAME)).unwrap();
		conn.pragma(Some(rusqlite::DatabaseName::Main), "user_version", SCHEMA_USER_VERSION + 1, |_| {
			Ok(())
		})
		.unwrap();
		drop(conn);

		let err = SqliteStore::new(temp_path.clone(), None, None).err().unwrap();
		assert!(err.to_string().contains("incompatible schema version"));
		fs::remove_dir_all(temp_path).unwrap();
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn peer_storage_over_sqlite() {
		let store = Arc::new(SqliteStore::new(random_storage_path(), None, None).unwrap());
		let chain = Arc::new(TestChainSource::new(100));
		let storage = Arc::new(KVPeerStorage::new(
			Arc::clone(&store),
			Arc::clone(&chain),
			PeerStorageConfig::default(),
			Arc::new(TestLogger::new()),
		));
		storage.start(&*chain, &Handle::current()).unwrap();

		let (alice, bob) = (test_utils::pubkey(1), test_utils::pubkey(2));
		storage.store_peer_data(&[1; 64], &alice).unwrap();
		storage.store_peer_data(&[2; 64], &bob).unwrap();
		assert_eq!(storage.list_stored_peers().unwrap().len(), 2);
		assert_eq!(storage.mark_for_delete(&alice).unwrap(), 2116);

		for height in 101..2116 {
			chain.connect_block(height);
		}
		assert_eq!(storage.retrieve_peer_data(&alice).unwrap(), Some(vec![1; 64]));

		chain.connect_block(2116);
		wait_until(|| storage.retrieve_peer_data(&alice).unwrap().is_none()).await;
		assert_eq!(storage.retrieve_peer_data(&bob).unwrap(), Some(vec![2; 64]));
		assert_eq!(store.list("peer_storage", "").unwrap(), vec![bob.to_string()]);

		storage.stop().await;
	}
}
