// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::{BlockHash, OutPoint, Txid};

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;

use crate::chain::{BestBlockView, BlockEpoch, BlockEpochNotifier, BlockEpochSubscription};
use crate::chanbackup::backup_file::Swapper;
use crate::chanbackup::multi::{Multi, PackedMulti};
use crate::chanbackup::peer_multi::pack_partial_peer_backup_multi;
use crate::chanbackup::single::{OpenChannel, StaticChannelBackup};
use crate::chanbackup::sub_swapper::{
	ChannelEvent, ChannelNotifier, ChannelSubscription, PeerBackupPusher,
};
use crate::msgs::SocketAddress;
use crate::sign::{EntropySource, KeysInterface, KeysManager, ScbKey};
use crate::util::errors::BackupError;
use crate::util::logger::{Level, Logger, Record};
use crate::util::persist::KVStore;

pub fn pubkey(n: u8) -> PublicKey {
	let mut secret = [1; 32];
	secret[31] = n;
	let secp_ctx = Secp256k1::signing_only();
	PublicKey::from_secret_key(&secp_ctx, &SecretKey::from_slice(&secret).unwrap())
}

pub fn outpoint(n: u8) -> OutPoint {
	OutPoint { txid: Txid::from_byte_array([n; 32]), vout: n as u32 }
}

pub fn open_channel(n: u8) -> OpenChannel {
	OpenChannel {
		funding_outpoint: outpoint(n),
		short_channel_id: ((n as u64) << 40) | 1,
		counterparty_node_id: pubkey(n),
		is_outbound: n % 2 == 0,
		channel_value_satoshis: 100_000 * (n as u64 + 1),
		channel_keys_id: [n; 32],
		to_self_delay: 144,
		counterparty_to_self_delay: 720,
		anchors: false,
		static_remote_key: false,
	}
}

pub fn single(n: u8) -> StaticChannelBackup {
	let addresses = vec![SocketAddress::TcpIpV4 { addr: [127, 0, 0, 1], port: 9735 + n as u16 }];
	StaticChannelBackup::new(&open_channel(n), addresses)
}

pub fn random_storage_path() -> PathBuf {
	static COUNTER: AtomicUsize = AtomicUsize::new(0);
	let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().subsec_nanos();
	let mut path = std::env::temp_dir();
	path.push(format!(
		"lightning-backup-{}-{}-{}",
		std::process::id(),
		COUNTER.fetch_add(1, Ordering::SeqCst),
		nanos
	));
	path
}

/// Polls `condition` until it holds, panicking after a few seconds.
pub async fn wait_until<F: FnMut() -> bool>(mut condition: F) {
	for _ in 0..500 {
		if condition() {
			return;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	panic!("condition not met in time");
}

pub struct TestLogger {
	level: Level,
	pub(crate) id: String,
	pub lines: Mutex<HashMap<(String, String), usize>>,
	peer_counts: Mutex<HashMap<PublicKey, usize>>,
}

impl TestLogger {
	pub fn new() -> TestLogger {
		Self::with_id("".to_owned())
	}
	pub fn with_id(id: String) -> TestLogger {
		TestLogger {
			level: Level::Trace,
			id,
			lines: Mutex::new(HashMap::new()),
			peer_counts: Mutex::new(HashMap::new()),
		}
	}
	pub fn enable(&mut self, level: Level) {
		self.level = level;
	}

	/// Counts logged lines which belong to `module` and contain `line`.
	pub fn count_contains(&self, module: &str, line: &str) -> usize {
		let log_entries = self.lines.lock().unwrap();
		log_entries
			.iter()
			.filter(|&(&(ref m, ref l), _c)| m == module && l.contains(line))
			.map(|(_, c)| c)
			.sum()
	}

	/// Search for the number of occurrence of the logged lines which
	/// 1. belongs to the specified module and
	/// 2. contains `line` in it.
	/// And asserts if the number of occurrences is the same with the given `count`
	pub fn assert_log_contains(&self, module: &str, line: &str, count: usize) {
		assert_eq!(self.count_contains(module, line), count);
	}

	pub fn count_with_peer(&self, peer: &PublicKey) -> usize {
		self.peer_counts.lock().unwrap().get(peer).copied().unwrap_or(0)
	}
}

impl Logger for TestLogger {
	fn log(&self, record: Record) {
		*self
			.lines
			.lock()
			.unwrap()
			.entry((record.module_path.to_string(), format!("{}", record.args)))
			.or_insert(0) += 1;
		if let Some(peer) = record.peer_id {
			*self.peer_counts.lock().unwrap().entry(peer).or_insert(0) += 1;
		}
		if record.level >= self.level {
			println!(
				"{:<5} {} [{} : {}, {}] {}",
				record.level.to_string(),
				self.id,
				record.module_path,
				record.file,
				record.line,
				record.args
			);
		}
	}
}

pub struct TestKeysInterface {
	pub backing: KeysManager,
	pub override_random_bytes: Mutex<Option<[u8; 32]>>,
}

impl TestKeysInterface {
	pub fn new(seed: [u8; 32]) -> Self {
		TestKeysInterface {
			backing: KeysManager::new(&seed, 42, 42),
			override_random_bytes: Mutex::new(None),
		}
	}
}

impl EntropySource for TestKeysInterface {
	fn get_secure_random_bytes(&self) -> [u8; 32] {
		let override_random_bytes = self.override_random_bytes.lock().unwrap();
		if let Some(bytes) = &*override_random_bytes {
			return *bytes;
		}
		self.backing.get_secure_random_bytes()
	}
}

impl KeysInterface for TestKeysInterface {
	fn get_scb_key(&self) -> ScbKey {
		self.backing.get_scb_key()
	}
}

/// An in-memory [`KVStore`].
pub struct TestStore {
	persisted_bytes: RwLock<HashMap<String, HashMap<String, Vec<u8>>>>,
	fail_removals: AtomicBool,
}

impl TestStore {
	pub fn new() -> Self {
		TestStore { persisted_bytes: RwLock::new(HashMap::new()), fail_removals: AtomicBool::new(false) }
	}

	pub fn fail_removals(&self, fail: bool) {
		self.fail_removals.store(fail, Ordering::Release);
	}
}

fn prefixed_namespace(primary_namespace: &str, secondary_namespace: &str) -> String {
	if secondary_namespace.is_empty() {
		primary_namespace.to_string()
	} else {
		format!("{}/{}", primary_namespace, secondary_namespace)
	}
}

impl KVStore for TestStore {
	fn read(
		&self, primary_namespace: &str, secondary_namespace: &str, key: &str,
	) -> Result<Vec<u8>, io::Error> {
		let persisted_bytes = self.persisted_bytes.read().unwrap();
		let prefixed = prefixed_namespace(primary_namespace, secondary_namespace);
		match persisted_bytes.get(&prefixed).and_then(|entries| entries.get(key)) {
			Some(bytes) => Ok(bytes.clone()),
			None => Err(io::Error::new(io::ErrorKind::NotFound, format!("Key not found: {}", key))),
		}
	}

	fn write(
		&self, primary_namespace: &str, secondary_namespace: &str, key: &str, buf: &[u8],
	) -> Result<(), io::Error> {
		let mut persisted_bytes = self.persisted_bytes.write().unwrap();
		let prefixed = prefixed_namespace(primary_namespace, secondary_namespace);
		persisted_bytes.entry(prefixed).or_default().insert(key.to_string(), buf.to_vec());
		Ok(())
	}

	fn remove(
		&self, primary_namespace: &str, secondary_namespace: &str, key: &str, _lazy: bool,
	) -> Result<(), io::Error> {
		if self.fail_removals.load(Ordering::Acquire) {
			return Err(io::Error::new(io::ErrorKind::Other, "test removal failure"));
		}
		let mut persisted_bytes = self.persisted_bytes.write().unwrap();
		let prefixed = prefixed_namespace(primary_namespace, secondary_namespace);
		if let Some(entries) = persisted_bytes.get_mut(&prefixed) {
			entries.remove(key);
		}
		Ok(())
	}

	fn list(
		&self, primary_namespace: &str, secondary_namespace: &str,
	) -> Result<Vec<String>, io::Error> {
		let persisted_bytes = self.persisted_bytes.read().unwrap();
		let prefixed = prefixed_namespace(primary_namespace, secondary_namespace);
		Ok(persisted_bytes.get(&prefixed).map(|e| e.keys().cloned().collect()).unwrap_or_default())
	}
}

/// An in-memory [`Swapper`] whose swaps can be made to fail.
pub struct TestSwapper {
	local: Mutex<Option<Vec<u8>>>,
	peer: Mutex<Option<Vec<u8>>>,
	fail_swaps: AtomicBool,
	swap_delay: Mutex<Duration>,
	local_swaps: AtomicUsize,
	peer_swaps: AtomicUsize,
}

impl TestSwapper {
	pub fn new() -> Self {
		TestSwapper {
			local: Mutex::new(None),
			peer: Mutex::new(None),
			fail_swaps: AtomicBool::new(false),
			swap_delay: Mutex::new(Duration::ZERO),
			local_swaps: AtomicUsize::new(0),
			peer_swaps: AtomicUsize::new(0),
		}
	}

	pub fn fail_swaps(&self, fail: bool) {
		self.fail_swaps.store(fail, Ordering::Release);
	}

	/// Makes every local swap block for `delay` before committing.
	pub fn set_swap_delay(&self, delay: Duration) {
		*self.swap_delay.lock().unwrap() = delay;
	}

	pub fn local_swaps(&self) -> usize {
		self.local_swaps.load(Ordering::Acquire)
	}

	pub fn peer_swaps(&self) -> usize {
		self.peer_swaps.load(Ordering::Acquire)
	}

	pub fn local_multi(&self, key: &ScbKey) -> Option<Multi> {
		let local = self.local.lock().unwrap().clone()?;
		PackedMulti(local).unpack(key).ok()
	}

	pub fn peer_bytes(&self) -> Option<Vec<u8>> {
		self.peer.lock().unwrap().clone()
	}

	pub fn set_peer_bytes(&self, bytes: Vec<u8>) {
		*self.peer.lock().unwrap() = Some(bytes);
	}

	fn check_swap(&self) -> Result<(), BackupError> {
		if self.fail_swaps.load(Ordering::Acquire) {
			return Err(BackupError::Io(io::Error::new(io::ErrorKind::Other, "test swap failure")));
		}
		Ok(())
	}
}

impl Swapper for TestSwapper {
	fn update_and_swap_local_backup(&self, new_backup: &PackedMulti) -> Result<(), BackupError> {
		self.check_swap()?;
		let delay = *self.swap_delay.lock().unwrap();
		std::thread::sleep(delay);
		*self.local.lock().unwrap() = Some(new_backup.0.clone());
		self.local_swaps.fetch_add(1, Ordering::AcqRel);
		Ok(())
	}

	fn extract_local_backup_multi(&self, key: &ScbKey) -> Result<Multi, BackupError> {
		match self.local.lock().unwrap().clone() {
			Some(local) => PackedMulti(local).unpack(key),
			None => Err(BackupError::BackupNotFound),
		}
	}

	fn update_and_swap_peer_backup(
		&self, backups: &HashMap<String, Vec<u8>>,
	) -> Result<(), BackupError> {
		self.check_swap()?;
		*self.peer.lock().unwrap() = Some(pack_partial_peer_backup_multi(backups)?);
		self.peer_swaps.fetch_add(1, Ordering::AcqRel);
		Ok(())
	}

	fn extract_peer_backup_multi(&self) -> Result<Vec<u8>, BackupError> {
		self.peer.lock().unwrap().clone().ok_or(BackupError::BackupNotFound)
	}
}

pub struct TestChannelNotifier {
	senders: Mutex<Vec<mpsc::UnboundedSender<ChannelEvent>>>,
	known_chans: Mutex<Vec<HashSet<OutPoint>>>,
	cancels: Arc<AtomicUsize>,
	fail_subscriptions: AtomicBool,
}

impl TestChannelNotifier {
	pub fn new() -> Self {
		TestChannelNotifier {
			senders: Mutex::new(Vec::new()),
			known_chans: Mutex::new(Vec::new()),
			cancels: Arc::new(AtomicUsize::new(0)),
			fail_subscriptions: AtomicBool::new(false),
		}
	}

	pub fn fail_subscriptions(&self, fail: bool) {
		self.fail_subscriptions.store(fail, Ordering::Release);
	}

	/// The known channel sets passed to each subscription.
	pub fn known_chans(&self) -> Vec<HashSet<OutPoint>> {
		self.known_chans.lock().unwrap().clone()
	}

	pub fn cancels(&self) -> usize {
		self.cancels.load(Ordering::Acquire)
	}

	pub fn send(&self, event: ChannelEvent) {
		for sender in self.senders.lock().unwrap().iter() {
			let _ = sender.send(event.clone());
		}
	}

	/// Drops our end of every subscription.
	pub fn close_streams(&self) {
		self.senders.lock().unwrap().clear();
	}
}

impl ChannelNotifier for TestChannelNotifier {
	fn subscribe_chans(
		&self, known_chans: HashSet<OutPoint>,
	) -> Result<ChannelSubscription, BackupError> {
		if self.fail_subscriptions.load(Ordering::Acquire) {
			return Err(BackupError::SubscriptionFailed { err: "test subscription failure".to_owned() });
		}
		let (sender, receiver) = mpsc::unbounded_channel();
		self.senders.lock().unwrap().push(sender);
		self.known_chans.lock().unwrap().push(known_chans);
		let cancels = Arc::clone(&self.cancels);
		Ok(ChannelSubscription::new(
			receiver,
			Box::new(move || {
				cancels.fetch_add(1, Ordering::AcqRel);
			}),
		))
	}
}

pub struct TestPeerBackupPusher {
	pushed: Mutex<Vec<(PackedMulti, Multi)>>,
	attempts: AtomicUsize,
	fail_pushes: AtomicBool,
}

impl TestPeerBackupPusher {
	pub fn new() -> Self {
		TestPeerBackupPusher {
			pushed: Mutex::new(Vec::new()),
			attempts: AtomicUsize::new(0),
			fail_pushes: AtomicBool::new(false),
		}
	}

	pub fn fail_pushes(&self, fail: bool) {
		self.fail_pushes.store(fail, Ordering::Release);
	}

	pub fn attempts(&self) -> usize {
		self.attempts.load(Ordering::Acquire)
	}

	pub fn pushed(&self) -> Vec<(PackedMulti, Multi)> {
		self.pushed.lock().unwrap().clone()
	}
}

impl PeerBackupPusher for TestPeerBackupPusher {
	fn push_peer_backup(&self, packed: &PackedMulti, multi: &Multi) -> Result<(), BackupError> {
		let res = if self.fail_pushes.load(Ordering::Acquire) {
			Err(BackupError::Io(io::Error::new(io::ErrorKind::Other, "test push failure")))
		} else {
			self.pushed.lock().unwrap().push((packed.clone(), multi.clone()));
			Ok(())
		};
		self.attempts.fetch_add(1, Ordering::AcqRel);
		res
	}
}

/// A chain tip and block notifier driven by the test.
pub struct TestChainSource {
	best_height: Mutex<u32>,
	senders: Mutex<Vec<mpsc::UnboundedSender<BlockEpoch>>>,
	cancels: Arc<AtomicUsize>,
	fail_registrations: AtomicBool,
	registration_delay: Mutex<Duration>,
}

impl TestChainSource {
	pub fn new(best_height: u32) -> Self {
		TestChainSource {
			best_height: Mutex::new(best_height),
			senders: Mutex::new(Vec::new()),
			cancels: Arc::new(AtomicUsize::new(0)),
			fail_registrations: AtomicBool::new(false),
			registration_delay: Mutex::new(Duration::ZERO),
		}
	}

	pub fn fail_registrations(&self, fail: bool) {
		self.fail_registrations.store(fail, Ordering::Release);
	}

	/// Makes every registration block for `delay` first.
	pub fn set_registration_delay(&self, delay: Duration) {
		*self.registration_delay.lock().unwrap() = delay;
	}

	pub fn registrations(&self) -> usize {
		self.senders.lock().unwrap().len()
	}

	pub fn set_best_height(&self, height: u32) {
		*self.best_height.lock().unwrap() = height;
	}

	pub fn connect_block(&self, height: u32) {
		self.set_best_height(height);
		let mut hash = [0; 32];
		hash[..4].copy_from_slice(&height.to_be_bytes());
		let epoch = BlockEpoch { height, block_hash: BlockHash::from_byte_array(hash) };
		for sender in self.senders.lock().unwrap().iter() {
			let _ = sender.send(epoch);
		}
	}

	pub fn cancels(&self) -> usize {
		self.cancels.load(Ordering::Acquire)
	}
}

impl BestBlockView for TestChainSource {
	fn best_height(&self) -> Result<u32, io::Error> {
		Ok(*self.best_height.lock().unwrap())
	}
}

impl BlockEpochNotifier for TestChainSource {
	fn register_block_epoch_ntfn(&self) -> Result<BlockEpochSubscription, BackupError> {
		let delay = *self.registration_delay.lock().unwrap();
		std::thread::sleep(delay);
		if self.fail_registrations.load(Ordering::Acquire) {
			return Err(BackupError::SubscriptionFailed { err: "test registration failure".to_owned() });
		}
		let (sender, receiver) = mpsc::unbounded_channel();
		self.senders.lock().unwrap().push(sender);
		let cancels = Arc::clone(&self.cancels);
		Ok(BlockEpochSubscription::new(
			receiver,
			Box::new(move || {
				cancels.fetch_add(1, Ordering::AcqRel);
			}),
		))
	}
}
