// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Custodial storage for the blobs peers send us in [`PeerStorage`] messages.
//!
//! Data is kept in a [`KVStore`] keyed by the peer's node id. Once a peer is marked for deletion
//! its data is kept for a further [`PeerStorageConfig::max_wipe_window`] blocks, so retention is
//! measured by chain progress rather than wall-clock time.
//!
//! [`PeerStorage`]: crate::msgs::PeerStorage

use bitcoin::secp256k1::PublicKey;

use std::collections::BTreeMap;
use std::mem;
use std::ops::Deref;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::chain::{BestBlockView, BlockEpochNotifier, BlockEpochSubscription};
use crate::msgs::MAX_PEER_STORAGE_BYTES;
use crate::util::config::PeerStorageConfig;
use crate::util::errors::BackupError;
use crate::util::logger::{Logger, WithContext};
use crate::util::persist::KVStore;

fn peer_key(peer: &PublicKey) -> String {
	peer.to_string()
}

#[derive(Default)]
struct Lifecycle {
	started: bool,
	stopped: bool,
	handles: Vec<JoinHandle<()>>,
}

/// Stores data on behalf of our peers and deletes it a fixed number of blocks after the peer is
/// marked for deletion.
///
/// Deletions only happen while the garbage collector runs, see [`Self::start`].
pub struct KVPeerStorage<KV: Deref, B: Deref, L: Deref>
where
	KV::Target: KVStore,
	B::Target: BestBlockView,
	L::Target: Logger,
{
	kv_store: KV,
	best_block: B,
	logger: L,
	config: PeerStorageConfig,
	// Peers to delete, keyed by the height at which they become due.
	awaiting_delete: Mutex<BTreeMap<u32, Vec<PublicKey>>>,
	// Held for all of `start` and for the state change in `stop`.
	lifecycle: Mutex<Lifecycle>,
	stop_sender: watch::Sender<()>,
	stop_receiver: watch::Receiver<()>,
}

impl<KV: Deref, B: Deref, L: Deref> KVPeerStorage<KV, B, L>
where
	KV::Target: KVStore,
	B::Target: BestBlockView,
	L::Target: Logger,
{
	/// Creates a store on top of `kv_store`.
	///
	/// Block notifications are only registered for once the garbage collector is started.
	pub fn new(kv_store: KV, best_block: B, config: PeerStorageConfig, logger: L) -> Self {
		let (stop_sender, stop_receiver) = watch::channel(());
		KVPeerStorage {
			kv_store,
			best_block,
			logger,
			config,
			awaiting_delete: Mutex::new(BTreeMap::new()),
			lifecycle: Mutex::new(Lifecycle::default()),
			stop_sender,
			stop_receiver,
		}
	}

	/// Stores `data` for `peer`, replacing anything stored for it before.
	///
	/// A pending deletion of `peer`'s data is cancelled.
	pub fn store_peer_data(&self, data: &[u8], peer: &PublicKey) -> Result<(), BackupError> {
		if data.len() > MAX_PEER_STORAGE_BYTES {
			return Err(BackupError::PeerStorageBytesExceeded { size: data.len() });
		}

		let mut awaiting_delete = self.awaiting_delete.lock().unwrap();
		self.kv_store.write(
			&self.config.primary_namespace,
			&self.config.secondary_namespace,
			&peer_key(peer),
			data,
		)?;
		if unschedule(&mut awaiting_delete, peer) {
			let logger = WithContext::from(&self.logger, Some(*peer));
			log_debug!(logger, "Cancelled pending deletion of peer storage");
		}
		Ok(())
	}

	/// Returns the data stored for `peer`, or `None` if there is none.
	pub fn retrieve_peer_data(&self, peer: &PublicKey) -> Result<Option<Vec<u8>>, BackupError> {
		match self.kv_store.read(
			&self.config.primary_namespace,
			&self.config.secondary_namespace,
			&peer_key(peer),
		) {
			Ok(data) => Ok(Some(data)),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
			Err(e) => Err(e.into()),
		}
	}

	/// Schedules `peer`'s data for deletion once the chain is `max_wipe_window` blocks past the
	/// current best height, returning the height the deletion is due at.
	///
	/// Marking an already marked peer moves its deletion to the new height.
	pub fn mark_for_delete(&self, peer: &PublicKey) -> Result<u32, BackupError> {
		let mut awaiting_delete = self.awaiting_delete.lock().unwrap();
		let best_height = self.best_block.best_height()?;
		let delete_height = best_height.saturating_add(self.config.max_wipe_window);

		unschedule(&mut awaiting_delete, peer);
		awaiting_delete.entry(delete_height).or_default().push(*peer);
		let logger = WithContext::from(&self.logger, Some(*peer));
		log_debug!(logger, "Peer storage marked for deletion at height {}", delete_height);
		Ok(delete_height)
	}

	/// Lists the peers we currently hold data for.
	pub fn list_stored_peers(&self) -> Result<Vec<PublicKey>, BackupError> {
		let keys = self
			.kv_store
			.list(&self.config.primary_namespace, &self.config.secondary_namespace)?;
		let mut peers = Vec::with_capacity(keys.len());
		for key in keys {
			match PublicKey::from_str(&key) {
				Ok(peer) => peers.push(peer),
				Err(_) => {
					log_warn!(self.logger, "Skipping peer storage entry with invalid key {}", key);
				},
			}
		}
		Ok(peers)
	}

	/// Registers for block notifications with `block_notifier` and starts the garbage collector
	/// on `runtime`. Further calls do nothing.
	///
	/// If registering fails the error is returned and `start` may be retried. An error hit by the
	/// collector stops collection and is logged. A concurrent [`Self::stop`] waits for `start` to
	/// finish.
	pub fn start<BN: BlockEpochNotifier + ?Sized>(
		self: &Arc<Self>, block_notifier: &BN, runtime: &Handle,
	) -> Result<(), BackupError>
	where
		Self: Send + Sync + 'static,
	{
		let mut lifecycle = self.lifecycle.lock().unwrap();
		if lifecycle.stopped || lifecycle.started {
			return Ok(());
		}

		let block_epochs = block_notifier.register_block_epoch_ntfn()?;

		let (result_sender, result_receiver) = oneshot::channel();

		let collector = {
			let this = Arc::clone(self);
			let stop_receiver = self.stop_receiver.clone();
			runtime.spawn(async move {
				let res = this.garbage_collector(block_epochs, stop_receiver).await;
				let _ = result_sender.send(res);
			})
		};

		let supervisor = {
			let this = Arc::clone(self);
			let mut stop_receiver = self.stop_receiver.clone();
			runtime.spawn(async move {
				tokio::select! {
					res = result_receiver => {
						if let Ok(Err(e)) = res {
							log_error!(
								this.logger,
								"KVPeerStorage experienced error during operation: {}",
								e
							);
						}
					},
					_ = stop_receiver.changed() => {},
				}
			})
		};

		lifecycle.handles.extend([collector, supervisor]);
		lifecycle.started = true;
		log_info!(self.logger, "Peer storage garbage collector started");
		Ok(())
	}

	/// Stops the garbage collector, returning once its tasks have exited.
	pub async fn stop(&self) {
		let handles = {
			let mut lifecycle = self.lifecycle.lock().unwrap();
			if lifecycle.stopped {
				return;
			}
			lifecycle.stopped = true;
			let _ = self.stop_sender.send(());
			mem::take(&mut lifecycle.handles)
		};

		for handle in handles {
			if let Err(e) = handle.await {
				log_error!(self.logger, "Peer storage task failed: {}", e);
			}
		}
		log_debug!(self.logger, "Peer storage garbage collector stopped");
	}

	/// Deletes the data of every peer whose deletion is due at or below `height`.
	///
	/// On failure the peers not yet deleted stay scheduled.
	pub(crate) fn collect_garbage(&self, height: u32) -> Result<(), BackupError> {
		let mut awaiting_delete = self.awaiting_delete.lock().unwrap();
		let due = match height.checked_add(1) {
			Some(next_height) => {
				let not_due = awaiting_delete.split_off(&next_height);
				mem::replace(&mut *awaiting_delete, not_due)
			},
			None => mem::take(&mut *awaiting_delete),
		};

		let mut due = due.into_iter();
		while let Some((delete_height, peers)) = due.next() {
			for (idx, peer) in peers.iter().enumerate() {
				let res = self.kv_store.remove(
					&self.config.primary_namespace,
					&self.config.secondary_namespace,
					&peer_key(peer),
					false,
				);
				if let Err(e) = res {
					awaiting_delete.insert(delete_height, peers[idx..].to_vec());
					awaiting_delete.extend(due);
					return Err(e.into());
				}
				let logger = WithContext::from(&self.logger, Some(*peer));
				log_debug!(logger, "Deleted peer storage at height {}", height);
			}
		}
		Ok(())
	}

	async fn garbage_collector(
		&self, mut block_epochs: BlockEpochSubscription, mut stop_receiver: watch::Receiver<()>,
	) -> Result<(), BackupError> {
		let res = loop {
			tokio::select! {
				epoch = block_epochs.epochs.recv() => {
					match epoch {
						Some(epoch) => {
							if let Err(e) = self.collect_garbage(epoch.height) {
								break Err(e);
							}
						},
						None => {
							log_warn!(self.logger, "Block epoch stream closed, garbage collector exiting");
							break Ok(());
						},
					}
				},
				_ = stop_receiver.changed() => break Ok(()),
			}
		};
		block_epochs.cancel();
		res
	}
}

// Returns whether `peer` was scheduled.
fn unschedule(awaiting_delete: &mut BTreeMap<u32, Vec<PublicKey>>, peer: &PublicKey) -> bool {
	let mut found = false;
	awaiting_delete.retain(|_, peers| {
		let len = peers.len();
		peers.retain(|scheduled| scheduled != peer);
		found |= peers.len() != len;
		!peers.is_empty()
	});
	found
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::util::test_utils::{self, wait_until, TestChainSource, TestLogger, TestStore};
	use std::time::Duration;

	type TestPeerStorage = KVPeerStorage<Arc<TestStore>, Arc<TestChainSource>, Arc<TestLogger>>;

	fn peer_storage(
		store: &Arc<TestStore>, chain: &Arc<TestChainSource>, logger: &Arc<TestLogger>,
	) -> Arc<TestPeerStorage> {
		Arc::new(KVPeerStorage::new(
			Arc::clone(store),
			Arc::clone(chain),
			PeerStorageConfig::default(),
			Arc::clone(logger),
		))
	}

	#[test]
	fn store_retrieve_and_list() {
		let store = Arc::new(TestStore::new());
		let chain = Arc::new(TestChainSource::new(100));
		let storage = peer_storage(&store, &chain, &Arc::new(TestLogger::new()));
		let (alice, bob) = (test_utils::pubkey(1), test_utils::pubkey(2));

		assert_eq!(storage.retrieve_peer_data(&alice).unwrap(), None);
		storage.store_peer_data(&[1, 2, 3], &alice).unwrap();
		storage.store_peer_data(&[4], &bob).unwrap();
		storage.store_peer_data(&[5, 6], &alice).unwrap();
		assert_eq!(storage.retrieve_peer_data(&alice).unwrap(), Some(vec![5, 6]));

		let mut peers = storage.list_stored_peers().unwrap();
		peers.sort();
		let mut expected = vec![alice, bob];
		expected.sort();
		assert_eq!(peers, expected);

		let written = store.read("peer_storage", "", &alice.to_string()).unwrap();
		assert_eq!(written, vec![5, 6]);
	}

	#[test]
	fn oversized_data_is_rejected() {
		let store = Arc::new(TestStore::new());
		let chain = Arc::new(TestChainSource::new(100));
		let storage = peer_storage(&store, &chain, &Arc::new(TestLogger::new()));
		let peer = test_utils::pubkey(1);
		assert!(matches!(
			storage.store_peer_data(&vec![0; MAX_PEER_STORAGE_BYTES + 1], &peer),
			Err(BackupError::PeerStorageBytesExceeded { .. })
		));
		assert_eq!(storage.retrieve_peer_data(&peer).unwrap(), None);
	}

	#[test]
	fn data_survives_until_wipe_window_elapses() {
		let store = Arc::new(TestStore::new());
		let chain = Arc::new(TestChainSource::new(100));
		let storage = peer_storage(&store, &chain, &Arc::new(TestLogger::new()));
		let (alice, bob) = (test_utils::pubkey(1), test_utils::pubkey(2));
		storage.store_peer_data(&[1], &alice).unwrap();
		storage.store_peer_data(&[2], &bob).unwrap();

		assert_eq!(storage.mark_for_delete(&alice).unwrap(), 2116);
		for height in 100..2116 {
			storage.collect_garbage(height).unwrap();
			assert_eq!(storage.retrieve_peer_data(&alice).unwrap(), Some(vec![1]));
		}
		storage.collect_garbage(2116).unwrap();
		assert_eq!(storage.retrieve_peer_data(&alice).unwrap(), None);
		assert_eq!(storage.retrieve_peer_data(&bob).unwrap(), Some(vec![2]));
	}

	#[test]
	fn missed_heights_are_caught_up() {
		let store = Arc::new(TestStore::new());
		let chain = Arc::new(TestChainSource::new(100));
		let storage = peer_storage(&store, &chain, &Arc::new(TestLogger::new()));
		let (alice, bob) = (test_utils::pubkey(1), test_utils::pubkey(2));
		storage.store_peer_data(&[1], &alice).unwrap();
		storage.store_peer_data(&[2], &bob).unwrap();

		storage.mark_for_delete(&alice).unwrap();
		chain.set_best_height(101);
		storage.mark_for_delete(&bob).unwrap();

		storage.collect_garbage(3000).unwrap();
		assert_eq!(storage.retrieve_peer_data(&alice).unwrap(), None);
		assert_eq!(storage.retrieve_peer_data(&bob).unwrap(), None);
	}

	#[test]
	fn peers_due_at_the_same_height_are_all_deleted() {
		let store = Arc::new(TestStore::new());
		let chain = Arc::new(TestChainSource::new(500));
		let storage = peer_storage(&store, &chain, &Arc::new(TestLogger::new()));
		let peers: Vec<_> = (1..=3).map(test_utils::pubkey).collect();
		for peer in peers.iter() {
			storage.store_peer_data(&[7], peer).unwrap();
			assert_eq!(storage.mark_for_delete(peer).unwrap(), 2516);
		}

		storage.collect_garbage(2516).unwrap();
		assert!(storage.list_stored_peers().unwrap().is_empty());
	}

	#[test]
	fn storing_again_cancels_deletion() {
		let store = Arc::new(TestStore::new());
		let chain = Arc::new(TestChainSource::new(100));
		let storage = peer_storage(&store, &chain, &Arc::new(TestLogger::new()));
		let peer = test_utils::pubkey(1);
		storage.store_peer_data(&[1], &peer).unwrap();
		storage.mark_for_delete(&peer).unwrap();

		storage.store_peer_data(&[2], &peer).unwrap();
		storage.collect_garbage(5000).unwrap();
		assert_eq!(storage.retrieve_peer_data(&peer).unwrap(), Some(vec![2]));
	}

	#[test]
	fn marking_again_reschedules() {
		let store = Arc::new(TestStore::new());
		let chain = Arc::new(TestChainSource::new(100));
		let storage = peer_storage(&store, &chain, &Arc::new(TestLogger::new()));
		let peer = test_utils::pubkey(1);
		storage.store_peer_data(&[1], &peer).unwrap();
		storage.mark_for_delete(&peer).unwrap();
		chain.set_best_height(200);
		assert_eq!(storage.mark_for_delete(&peer).unwrap(), 2216);

		storage.collect_garbage(2116).unwrap();
		assert_eq!(storage.retrieve_peer_data(&peer).unwrap(), Some(vec![1]));
		storage.collect_garbage(2216).unwrap();
		assert_eq!(storage.retrieve_peer_data(&peer).unwrap(), None);
	}

	#[test]
	fn failed_deletion_is_retried() {
		let store = Arc::new(TestStore::new());
		let chain = Arc::new(TestChainSource::new(0));
		let storage = peer_storage(&store, &chain, &Arc::new(TestLogger::new()));
		let peer = test_utils::pubkey(1);
		storage.store_peer_data(&[1], &peer).unwrap();
		storage.mark_for_delete(&peer).unwrap();

		store.fail_removals(true);
		assert!(storage.collect_garbage(2016).is_err());
		assert_eq!(storage.retrieve_peer_data(&peer).unwrap(), Some(vec![1]));

		store.fail_removals(false);
		storage.collect_garbage(2017).unwrap();
		assert_eq!(storage.retrieve_peer_data(&peer).unwrap(), None);
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn collector_deletes_on_block_epochs() {
		let store = Arc::new(TestStore::new());
		let chain = Arc::new(TestChainSource::new(10));
		let logger = Arc::new(TestLogger::new());
		let storage = peer_storage(&store, &chain, &logger);
		storage.start(&*chain, &Handle::current()).unwrap();
		storage.start(&*chain, &Handle::current()).unwrap();
		assert_eq!(chain.registrations(), 1);

		let (alice, bob) = (test_utils::pubkey(1), test_utils::pubkey(2));
		storage.store_peer_data(&[1], &alice).unwrap();
		storage.store_peer_data(&[2], &bob).unwrap();
		storage.mark_for_delete(&alice).unwrap();

		for height in 11..=2026 {
			chain.connect_block(height);
		}
		wait_until(|| storage.retrieve_peer_data(&alice).unwrap().is_none()).await;
		assert_eq!(storage.retrieve_peer_data(&bob).unwrap(), Some(vec![2]));

		storage.stop().await;
		storage.stop().await;
		assert_eq!(chain.cancels(), 1);
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn collector_errors_are_logged() {
		let store = Arc::new(TestStore::new());
		let chain = Arc::new(TestChainSource::new(0));
		let logger = Arc::new(TestLogger::new());
		let storage = peer_storage(&store, &chain, &logger);
		storage.start(&*chain, &Handle::current()).unwrap();

		let peer = test_utils::pubkey(1);
		storage.store_peer_data(&[1], &peer).unwrap();
		storage.mark_for_delete(&peer).unwrap();
		store.fail_removals(true);
		chain.connect_block(2016);

		wait_until(|| chain.cancels() == 1).await;
		wait_until(|| {
			logger.count_contains("lightning_backup::peer_storage", "experienced error") == 1
		})
		.await;
		storage.stop().await;
		assert_eq!(storage.retrieve_peer_data(&peer).unwrap(), Some(vec![1]));
	}

	#[test]
	fn peer_log_lines_carry_the_peer() {
		let store = Arc::new(TestStore::new());
		let chain = Arc::new(TestChainSource::new(100));
		let logger = Arc::new(TestLogger::new());
		let storage = peer_storage(&store, &chain, &logger);
		let (alice, bob) = (test_utils::pubkey(1), test_utils::pubkey(2));

		storage.store_peer_data(&[1], &alice).unwrap();
		storage.mark_for_delete(&alice).unwrap();
		storage.store_peer_data(&[2], &alice).unwrap();
		assert_eq!(logger.count_with_peer(&alice), 2);

		storage.mark_for_delete(&alice).unwrap();
		storage.collect_garbage(2116).unwrap();
		assert_eq!(logger.count_with_peer(&alice), 4);
		assert_eq!(logger.count_with_peer(&bob), 0);
	}

	#[tokio::test]
	async fn blocks_are_not_subscribed_to_until_started() {
		let store = Arc::new(TestStore::new());
		let chain = Arc::new(TestChainSource::new(0));
		let storage = peer_storage(&store, &chain, &Arc::new(TestLogger::new()));
		chain.connect_block(1);
		assert_eq!(chain.registrations(), 0);

		storage.stop().await;
		assert_eq!(chain.cancels(), 0);

		// Stopped stores don't start.
		storage.start(&*chain, &Handle::current()).unwrap();
		assert_eq!(chain.registrations(), 0);
	}

	#[tokio::test]
	async fn failed_registration_can_be_retried() {
		let store = Arc::new(TestStore::new());
		let chain = Arc::new(TestChainSource::new(0));
		let storage = peer_storage(&store, &chain, &Arc::new(TestLogger::new()));

		chain.fail_registrations(true);
		assert!(matches!(
			storage.start(&*chain, &Handle::current()),
			Err(BackupError::SubscriptionFailed { .. })
		));
		chain.fail_registrations(false);
		storage.start(&*chain, &Handle::current()).unwrap();
		assert_eq!(chain.registrations(), 1);

		storage.stop().await;
		assert_eq!(chain.cancels(), 1);
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn stop_waits_for_a_concurrent_start() {
		let store = Arc::new(TestStore::new());
		let chain = Arc::new(TestChainSource::new(0));
		chain.set_registration_delay(Duration::from_millis(300));
		let storage = peer_storage(&store, &chain, &Arc::new(TestLogger::new()));

		let starter = {
			let (storage, chain) = (Arc::clone(&storage), Arc::clone(&chain));
			let runtime = Handle::current();
			std::thread::spawn(move || storage.start(&*chain, &runtime))
		};
		tokio::time::sleep(Duration::from_millis(100)).await;
		storage.stop().await;

		// The collector `start` spawned has been joined and has released its subscription.
		assert!(starter.join().unwrap().is_ok());
		assert_eq!(chain.registrations(), 1);
		assert_eq!(chain.cancels(), 1);
	}
}
