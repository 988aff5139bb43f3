// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Keeps the on-disk backup of our own channels in sync with the set of open channels.
//!
//! A [`SubSwapper`] subscribes to channel open and close events, folds them into its view of our
//! channels, merges that view with what is on disk, and atomically swaps in the re-packed result.
//! Every new backup is also handed to a [`PeerBackupPusher`] so it can be sent to our peers.

use bitcoin::OutPoint;

use std::collections::{HashMap, HashSet};
use std::ops::Deref;
use std::sync::{Arc, Mutex};

use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::chanbackup::backup_file::Swapper;
use crate::chanbackup::multi::{Multi, PackedMulti};
use crate::chanbackup::single::{OpenChannel, StaticChannelBackup};
use crate::msgs::SocketAddress;
use crate::sign::{EntropySource, KeysInterface};
use crate::util::errors::BackupError;
use crate::util::logger::Logger;

/// An open channel along with the addresses its counterparty can be reached at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelWithAddrs {
	/// The channel.
	pub channel: OpenChannel,
	/// The counterparty's addresses.
	pub addresses: Vec<SocketAddress>,
}

/// The channels opened and closed since the previous event.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChannelEvent {
	/// Funding outpoints of channels that have been closed.
	pub closed_chans: Vec<OutPoint>,
	/// Channels that have been opened.
	pub new_chans: Vec<ChannelWithAddrs>,
}

/// A live subscription to [`ChannelEvent`]s.
pub struct ChannelSubscription {
	/// Receives an event every time the set of open channels changes.
	pub chan_updates: mpsc::UnboundedReceiver<ChannelEvent>,
	cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl ChannelSubscription {
	/// Bundles a receiver with the closure that tears down the notifier's side of it.
	pub fn new(
		chan_updates: mpsc::UnboundedReceiver<ChannelEvent>, cancel: Box<dyn FnOnce() + Send>,
	) -> Self {
		ChannelSubscription { chan_updates, cancel: Some(cancel) }
	}

	/// Releases the subscription. Calling this more than once has no further effect.
	pub fn cancel(&mut self) {
		if let Some(cancel) = self.cancel.take() {
			cancel();
		}
		self.chan_updates.close();
	}
}

/// The source of [`ChannelEvent`]s.
pub trait ChannelNotifier {
	/// Subscribes to changes relative to `known_chans`.
	///
	/// Any channel opened since `known_chans` was snapshotted, or any channel in it closed since,
	/// must be reported on the returned subscription so no change slips in between.
	fn subscribe_chans(
		&self, known_chans: HashSet<OutPoint>,
	) -> Result<ChannelSubscription, BackupError>;
}

/// Sends a freshly packed backup of our channels to our peers.
pub trait PeerBackupPusher {
	/// Called with every backup committed to disk.
	fn push_peer_backup(&self, packed: &PackedMulti, multi: &Multi) -> Result<(), BackupError>;
}

impl<F> PeerBackupPusher for F
where
	F: Fn(&PackedMulti, &Multi) -> Result<(), BackupError>,
{
	fn push_peer_backup(&self, packed: &PackedMulti, multi: &Multi) -> Result<(), BackupError> {
		self(packed, multi)
	}
}

#[derive(Default)]
struct Lifecycle {
	started: bool,
	stopped: bool,
	handle: Option<JoinHandle<()>>,
}

/// Swaps the on-disk backup of our channels every time the set of open channels changes.
///
/// Call [`Self::start`] once the node is ready and [`Self::stop`] on shutdown. Both may be called
/// more than once.
pub struct SubSwapper<S: Deref, K: Deref, P: Deref, L: Deref>
where
	S::Target: Swapper,
	K::Target: KeysInterface,
	P::Target: PeerBackupPusher,
	L::Target: Logger,
{
	local_backup_state: Mutex<HashMap<OutPoint, StaticChannelBackup>>,
	chan_events: Mutex<Option<ChannelSubscription>>,
	swapper: S,
	keys: K,
	peer_backup_pusher: P,
	logger: L,
	// Held for all of `start` and for the state change in `stop`.
	lifecycle: Mutex<Lifecycle>,
	stop_sender: watch::Sender<()>,
	stop_receiver: watch::Receiver<()>,
}

impl<S: Deref, K: Deref, P: Deref, L: Deref> SubSwapper<S, K, P, L>
where
	S::Target: Swapper,
	K::Target: KeysInterface,
	P::Target: PeerBackupPusher,
	L::Target: Logger,
{
	/// Creates a `SubSwapper` starting from the backups of the channels open right now.
	///
	/// The subscription to channel events is registered here, using `starting_chans` as the
	/// synchronization point.
	pub fn new<CN: ChannelNotifier + ?Sized>(
		starting_chans: Vec<StaticChannelBackup>, chan_notifier: &CN, keys: K, swapper: S,
		peer_backup_pusher: P, logger: L,
	) -> Result<Self, BackupError> {
		let known_chans: HashSet<OutPoint> =
			starting_chans.iter().map(|backup| backup.funding_outpoint).collect();
		let chan_events = chan_notifier.subscribe_chans(known_chans)?;

		let local_backup_state =
			starting_chans.into_iter().map(|backup| (backup.funding_outpoint, backup)).collect();

		let (stop_sender, stop_receiver) = watch::channel(());
		Ok(SubSwapper {
			local_backup_state: Mutex::new(local_backup_state),
			chan_events: Mutex::new(Some(chan_events)),
			swapper,
			keys,
			peer_backup_pusher,
			logger,
			lifecycle: Mutex::new(Lifecycle::default()),
			stop_sender,
			stop_receiver,
		})
	}

	/// Reconciles the on-disk backup with our current channels and starts processing channel
	/// events on `runtime`.
	///
	/// If the initial swap fails the error is returned and `start` may be retried. Once started,
	/// further calls do nothing. A concurrent [`Self::stop`] waits for `start` to finish.
	pub fn start(self: &Arc<Self>, runtime: &Handle) -> Result<(), BackupError>
	where
		Self: Send + Sync + 'static,
	{
		let mut lifecycle = self.lifecycle.lock().unwrap();
		if lifecycle.stopped {
			log_debug!(self.logger, "SubSwapper already stopped, not starting");
			return Ok(());
		}
		if lifecycle.started {
			return Ok(());
		}

		log_info!(self.logger, "SubSwapper starting");

		// Nodes may have advertised new addresses while we were offline.
		let initial_swap = self
			.combine_scb_with_on_disk_backup(&[])
			.and_then(|(packed, _)| self.swapper.update_and_swap_local_backup(&packed));
		if let Err(e) = initial_swap {
			log_error!(self.logger, "Unable to update multi backup on start: {}", e);
			return Err(e);
		}

		let subscription = match self.chan_events.lock().unwrap().take() {
			Some(subscription) => subscription,
			None => {
				return Err(BackupError::SubscriptionFailed {
					err: "channel subscription already released".to_owned(),
				})
			},
		};

		let this = Arc::clone(self);
		let stop_receiver = self.stop_receiver.clone();
		lifecycle.handle = Some(runtime.spawn(async move {
			this.backup_updater(subscription, stop_receiver).await;
		}));
		lifecycle.started = true;
		Ok(())
	}

	/// Stops processing channel events, returning once the event loop has exited and the channel
	/// subscription has been cancelled.
	pub async fn stop(&self) {
		let handle = {
			let mut lifecycle = self.lifecycle.lock().unwrap();
			if lifecycle.stopped {
				return;
			}
			lifecycle.stopped = true;
			log_info!(self.logger, "SubSwapper shutting down...");

			let _ = self.stop_sender.send(());
			let handle = lifecycle.handle.take();
			if handle.is_none() {
				if let Some(mut subscription) = self.chan_events.lock().unwrap().take() {
					subscription.cancel();
				}
			}
			handle
		};

		if let Some(handle) = handle {
			if let Err(e) = handle.await {
				log_error!(self.logger, "SubSwapper event loop failed: {}", e);
			}
		}

		log_debug!(self.logger, "SubSwapper shutdown complete");
	}

	/// Merges our current channels with the backup on disk and packs the result.
	///
	/// Records on disk only serve as the base: a channel we know of in memory always replaces
	/// its on-disk record. Channels in `closed_chans` are dropped from the result. A missing
	/// backup file is treated as empty, any other read failure is returned.
	pub(crate) fn combine_scb_with_on_disk_backup(
		&self, closed_chans: &[OutPoint],
	) -> Result<(PackedMulti, Multi), BackupError> {
		let key = self.keys.get_scb_key();

		let disk_multi = match self.swapper.extract_local_backup_multi(&key) {
			Ok(multi) => Some(multi),
			Err(e) if e.is_not_found() => None,
			Err(e) => return Err(e),
		};

		let mut combined_backup: HashMap<OutPoint, StaticChannelBackup> = HashMap::new();
		if let Some(disk_multi) = disk_multi {
			for disk_channel in disk_multi.static_backups {
				combined_backup.insert(disk_channel.funding_outpoint, disk_channel);
			}
		}
		{
			let local_backup_state = self.local_backup_state.lock().unwrap();
			for (chan_point, mem_channel) in local_backup_state.iter() {
				if combined_backup.contains_key(chan_point) {
					log_warn!(
						self.logger,
						"Replacing disk backup for ChannelPoint({}) w/ newer version",
						chan_point
					);
				}
				combined_backup.insert(*chan_point, mem_channel.clone());
			}
		}

		for closed_chan in closed_chans {
			combined_backup.remove(closed_chan);
		}

		let multi = Multi::new(combined_backup.into_values().collect());
		let packed = multi.pack(&key, &self.keys.get_secure_random_bytes())?;
		Ok((packed, multi))
	}

	async fn backup_updater(
		&self, mut subscription: ChannelSubscription, mut stop_receiver: watch::Receiver<()>,
	) {
		log_debug!(self.logger, "SubSwapper's backup updater is active");

		loop {
			tokio::select! {
				event = subscription.chan_updates.recv() => {
					match event {
						Some(event) => self.handle_channel_event(event),
						None => {
							log_warn!(self.logger, "Channel event stream closed, backup updater exiting");
							break;
						},
					}
				},
				_ = stop_receiver.changed() => break,
			}
		}

		subscription.cancel();
	}

	fn handle_channel_event(&self, event: ChannelEvent) {
		let (old_state_size, new_state_size) = {
			let mut local_backup_state = self.local_backup_state.lock().unwrap();
			let old_state_size = local_backup_state.len();

			for new_chan in event.new_chans {
				log_debug!(
					self.logger,
					"Adding channel {} to backup state",
					new_chan.channel.funding_outpoint
				);
				let backup = StaticChannelBackup::new(&new_chan.channel, new_chan.addresses);
				local_backup_state.insert(backup.funding_outpoint, backup);
			}

			for closed_chan in event.closed_chans.iter() {
				log_debug!(self.logger, "Removing channel {} from backup state", closed_chan);
				local_backup_state.remove(closed_chan);
			}

			(old_state_size, local_backup_state.len())
		};

		log_info!(
			self.logger,
			"Updating on-disk multi SCB backup: num_old_chans={}, num_new_chans={}",
			old_state_size,
			new_state_size
		);

		match self.combine_scb_with_on_disk_backup(&event.closed_chans) {
			Ok((packed, multi)) => {
				if let Err(e) = self.swapper.update_and_swap_local_backup(&packed) {
					log_error!(self.logger, "Unable to update local multi backup: {}", e);
				}
				if let Err(e) = self.peer_backup_pusher.push_peer_backup(&packed, &multi) {
					let chan_points: Vec<OutPoint> =
						multi.static_backups.iter().map(|backup| backup.funding_outpoint).collect();
					log_error!(
						self.logger,
						"Unable to back up {} with peers: {}",
						log_outpoints!(chan_points),
						e
					);
				}
			},
			Err(e) => {
				log_error!(self.logger, "Unable to create new multi using closed chans: {}", e);
			},
		}
	}
}
