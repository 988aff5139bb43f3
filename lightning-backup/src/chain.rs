// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The interface to the chain source, used as a clock for expiring data peers left with us.

use bitcoin::BlockHash;

use std::io;

use tokio::sync::mpsc;

use crate::util::errors::BackupError;

/// A newly connected block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockEpoch {
	/// The height of the block.
	pub height: u32,
	/// The hash of the block.
	pub block_hash: BlockHash,
}

/// A live subscription to new blocks.
pub struct BlockEpochSubscription {
	/// Receives every block connected after the subscription was registered, in order.
	pub epochs: mpsc::UnboundedReceiver<BlockEpoch>,
	cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl BlockEpochSubscription {
	/// Bundles a receiver with the closure that tears down the notifier's side of it.
	pub fn new(
		epochs: mpsc::UnboundedReceiver<BlockEpoch>, cancel: Box<dyn FnOnce() + Send>,
	) -> Self {
		BlockEpochSubscription { epochs, cancel: Some(cancel) }
	}

	/// Releases the subscription. Calling this more than once has no further effect.
	pub fn cancel(&mut self) {
		if let Some(cancel) = self.cancel.take() {
			cancel();
		}
		self.epochs.close();
	}
}

/// A source of block notifications.
pub trait BlockEpochNotifier {
	/// Registers for notifications of every block connected from now on.
	fn register_block_epoch_ntfn(&self) -> Result<BlockEpochSubscription, BackupError>;
}

/// A view of the current chain tip.
pub trait BestBlockView {
	/// Returns the height of the current best block.
	fn best_height(&self) -> Result<u32, io::Error>;
}
